//! Data-file fingerprints
//!
//! A dump pair (`.idx`/`.gap`) is only trusted if its embedded fingerprint
//! still matches the data file it was written for. The fingerprint hashes the
//! file's head and tail bytes together with its size and mtime; it is cheap to
//! compute and changes whenever the file content plausibly changed.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::warn;

use crate::error::Result;

/// Bytes hashed from each end of the file
const SAMPLE: u64 = 16 * 1024;

/// Fingerprint length in the companion file names
pub const FINGERPRINT_LEN: usize = 12;

/// Compute the 12-character fingerprint of a data file
pub fn file_fingerprint(path: &Path) -> Result<String> {
    let meta = fs::metadata(path)?;
    let len = meta.len();
    let mtime_ms = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    let mut file = File::open(path)?;
    let mut head = vec![0u8; len.min(SAMPLE) as usize];
    file.read_exact(&mut head)?;
    let mut tail = vec![0u8; len.min(SAMPLE) as usize];
    if len > SAMPLE {
        file.seek(SeekFrom::Start(len - SAMPLE))?;
    } else {
        file.seek(SeekFrom::Start(0))?;
    }
    file.read_exact(&mut tail)?;

    let meta_bytes = [len.to_be_bytes(), mtime_ms.to_be_bytes()].concat();
    let mut h1 = crc32fast::Hasher::new();
    h1.update(&head);
    h1.update(&meta_bytes);
    let mut h2 = crc32fast::Hasher::new();
    h2.update(&tail);
    h2.update(&meta_bytes);

    let hex = format!("{:08x}{:08x}", h1.finalize(), h2.finalize());
    Ok(hex[..FINGERPRINT_LEN].to_string())
}

/// Companion index dump path: `<datafile>.<fingerprint>.idx`
pub fn index_dump_path(data_file: &Path, fingerprint: &str) -> PathBuf {
    companion(data_file, fingerprint, "idx")
}

/// Companion gap dump path: `<datafile>.<fingerprint>.gap`
pub fn gap_dump_path(data_file: &Path, fingerprint: &str) -> PathBuf {
    companion(data_file, fingerprint, "gap")
}

fn companion(data_file: &Path, fingerprint: &str, ext: &str) -> PathBuf {
    let name = data_file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    data_file.with_file_name(format!("{}.{}.{}", name, fingerprint, ext))
}

/// Delete every dump file belonging to `data_file` except the two given names.
///
/// A stale dump is harmless but wastes disk and may shadow a newer one (the
/// fingerprint hashes only part of the data, so a stale name can collide).
pub fn delete_stale_dumps(data_file: &Path, keep_idx: Option<&Path>, keep_gap: Option<&Path>) {
    let Some(dir) = data_file.parent() else {
        return;
    };
    let Some(base) = data_file.file_name().map(|n| n.to_string_lossy().into_owned()) else {
        return;
    };
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(&base) || name == base {
            continue;
        }
        if Some(path.as_path()) == keep_idx || Some(path.as_path()) == keep_gap {
            continue;
        }
        if name.ends_with(".idx")
            || name.ends_with(".gap")
            || name.ends_with(".idx.gz")
            || name.ends_with(".gap.gz")
        {
            if let Err(e) = fs::remove_file(&path) {
                warn!(file = %path.display(), error = %e, "cannot delete stale dump");
            }
        }
    }
}
