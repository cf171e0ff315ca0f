//! Merge / Rewrite Workers
//!
//! Compaction back-ends: rewrite two unmounted heap files (or one, for a pure
//! reclaim pass) into a single fresh file through a [`HeapWriter`]. Records
//! stream out in key order; records with the same key in both inputs are
//! combined by a caller-supplied merge function (the posting-list merge of the
//! index layer above).
//!
//! A failed merge removes its partial output; the input files are only
//! deleted after the new file is complete.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::error::Result;
use crate::heap::{HeapModifier, HeapWriter};
use crate::order::ByteOrder;

/// Combines the payloads of one key found in two files: `(key, older, newer)`
pub type MergeFn = dyn Fn(&[u8], &[u8], &[u8]) -> Result<Vec<u8>> + Send + Sync;

/// Merge two heap files into `new_file`.
///
/// Returns the produced file, or `None` when both inputs were empty. The
/// inputs are deleted on success. Degenerate cases avoid the rewrite: an
/// empty input is deleted and the other file is renamed into place.
pub fn merge_worker(
    f1: &Path,
    f2: &Path,
    key_length: usize,
    ordering: Arc<dyn ByteOrder>,
    merge: &MergeFn,
    new_file: &Path,
    write_buffer: usize,
) -> Result<Option<PathBuf>> {
    let mut h1 = HeapModifier::new(f1, key_length, ordering.clone())?;
    let mut h2 = HeapModifier::new(f2, key_length, ordering.clone())?;

    if h1.is_empty() && h2.is_empty() {
        h1.close(false)?;
        h2.close(false)?;
        HeapWriter::delete_with_companions(f1);
        HeapWriter::delete_with_companions(f2);
        return Ok(None);
    }
    if h1.is_empty() {
        h1.close(false)?;
        h2.close(false)?;
        HeapWriter::delete_with_companions(f1);
        return Ok(Some(rename_or_keep(f2, new_file)));
    }
    if h2.is_empty() {
        h1.close(false)?;
        h2.close(false)?;
        HeapWriter::delete_with_companions(f2);
        return Ok(Some(rename_or_keep(f1, new_file)));
    }

    let tmp = partial_path(new_file);
    let writer = HeapWriter::new(&tmp, new_file, key_length, ordering.clone(), write_buffer)?;
    match merge_into(&mut h1, &mut h2, &ordering, merge, writer) {
        Ok(written) => {
            info!(
                f1 = %f1.display(),
                f2 = %f2.display(),
                out = %new_file.display(),
                written,
                "merged heap files"
            );
        }
        Err(e) => {
            error!(
                f1 = %f1.display(),
                f2 = %f2.display(),
                error = %e,
                "merge failed, removing partial output"
            );
            let _ = fs::remove_file(&tmp);
            let _ = fs::remove_file(new_file);
            h1.close(false)?;
            h2.close(false)?;
            return Err(e);
        }
    }
    h1.close(false)?;
    h2.close(false)?;
    HeapWriter::delete_with_companions(f1);
    HeapWriter::delete_with_companions(f2);
    Ok(Some(new_file.to_path_buf()))
}

/// Rewrite a single heap file into `new_file`, discarding all gap space.
///
/// Returns `None` (and deletes the input) when the input holds no records.
pub fn rewrite_worker(
    f: &Path,
    key_length: usize,
    ordering: Arc<dyn ByteOrder>,
    new_file: &Path,
    write_buffer: usize,
) -> Result<Option<PathBuf>> {
    let mut h = HeapModifier::new(f, key_length, ordering.clone())?;
    if h.is_empty() {
        h.close(false)?;
        HeapWriter::delete_with_companions(f);
        return Ok(None);
    }

    let tmp = partial_path(new_file);
    let mut writer = HeapWriter::new(&tmp, new_file, key_length, ordering, write_buffer)?;
    let result = (|| -> Result<u64> {
        let mut written = 0u64;
        for key in h.key_iterator(true, false)? {
            if let Some(payload) = h.get(&key)? {
                writer.add(&key, &payload)?;
                written += 1;
            }
        }
        Ok(written)
    })();
    match result {
        Ok(written) => {
            writer.close(true)?;
            info!(f = %f.display(), out = %new_file.display(), written, "rewrote heap file");
        }
        Err(e) => {
            error!(f = %f.display(), error = %e, "rewrite failed, removing partial output");
            writer.abort();
            let _ = fs::remove_file(new_file);
            h.close(false)?;
            return Err(e);
        }
    }
    h.close(false)?;
    HeapWriter::delete_with_companions(f);
    Ok(Some(new_file.to_path_buf()))
}

/// Two-pointer key-ordered merge of both inputs into the writer
fn merge_into(
    h1: &mut HeapModifier,
    h2: &mut HeapModifier,
    ordering: &Arc<dyn ByteOrder>,
    merge: &MergeFn,
    mut writer: HeapWriter,
) -> Result<u64> {
    let mut it1 = h1.key_iterator(true, false)?;
    let mut it2 = h2.key_iterator(true, false)?;
    let mut k1 = it1.next();
    let mut k2 = it2.next();
    let mut written = 0u64;

    loop {
        match (&k1, &k2) {
            (Some(a), Some(b)) => match ordering.compare(a, b) {
                std::cmp::Ordering::Less => {
                    if let Some(p) = h1.get(a)? {
                        writer.add(a, &p)?;
                        written += 1;
                    }
                    k1 = it1.next();
                }
                std::cmp::Ordering::Greater => {
                    if let Some(p) = h2.get(b)? {
                        writer.add(b, &p)?;
                        written += 1;
                    }
                    k2 = it2.next();
                }
                std::cmp::Ordering::Equal => {
                    // same key in both inputs: combine the containers
                    match (h1.get(a)?, h2.get(b)?) {
                        (Some(p1), Some(p2)) => {
                            let combined = merge(a, &p1, &p2)?;
                            writer.add(a, &combined)?;
                            written += 1;
                        }
                        (Some(p), None) | (None, Some(p)) => {
                            writer.add(a, &p)?;
                            written += 1;
                        }
                        (None, None) => {
                            warn!(
                                key = %String::from_utf8_lossy(a),
                                "indexed key with no readable payload skipped in merge"
                            );
                        }
                    }
                    k1 = it1.next();
                    k2 = it2.next();
                }
            },
            (Some(a), None) => {
                if let Some(p) = h1.get(a)? {
                    writer.add(a, &p)?;
                    written += 1;
                }
                k1 = it1.next();
            }
            (None, Some(b)) => {
                if let Some(p) = h2.get(b)? {
                    writer.add(b, &p)?;
                    written += 1;
                }
                k2 = it2.next();
            }
            (None, None) => break,
        }
    }
    writer.close(true)?;
    Ok(written)
}

fn partial_path(new_file: &Path) -> PathBuf {
    let name = new_file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    new_file.with_file_name(format!("{}.prt", name))
}

fn rename_or_keep(from: &Path, to: &Path) -> PathBuf {
    match fs::rename(from, to) {
        Ok(()) => to.to_path_buf(),
        Err(e) => {
            warn!(from = %from.display(), to = %to.display(), error = %e, "rename failed, keeping original");
            from.to_path_buf()
        }
    }
}
