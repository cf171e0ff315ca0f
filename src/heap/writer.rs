//! Heap Writer
//!
//! Write-only, strictly sequential construction of a fresh heap file plus its
//! companion index. Records must arrive in ascending key order with no
//! duplicates; this writer is the output side of merges and rewrites, never
//! part of online traffic.
//!
//! The data is written to a temp file and atomically renamed into place on
//! close, so a crashed compaction never leaves a half-written file that looks
//! valid.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{HeapError, Result};
use crate::index::HandleIndex;
use crate::order::ByteOrder;

use super::fingerprint;
use super::gap::GapSet;
use super::RECORD_HEADER_LEN;

/// Sequential builder for a brand-new heap file
pub struct HeapWriter {
    temp_file: PathBuf,
    final_file: PathBuf,
    key_length: usize,
    ordering: Arc<dyn ByteOrder>,
    out: Option<BufWriter<File>>,
    index: HandleIndex,
    seek: u64,
    prev_key: Option<Vec<u8>>,
}

impl HeapWriter {
    /// Start writing to `temp_file`; `close` renames it to `final_file`.
    /// `write_buffer` sizes the output buffering.
    pub fn new(
        temp_file: &Path,
        final_file: &Path,
        key_length: usize,
        ordering: Arc<dyn ByteOrder>,
        write_buffer: usize,
    ) -> Result<Self> {
        if let Some(parent) = final_file.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(temp_file)?;
        Ok(Self {
            temp_file: temp_file.to_path_buf(),
            final_file: final_file.to_path_buf(),
            key_length,
            ordering: ordering.clone(),
            out: Some(BufWriter::with_capacity(write_buffer.max(4096), file)),
            index: HandleIndex::new(key_length, ordering),
            seek: 0,
            prev_key: None,
        })
    }

    /// Append one record. Keys must be strictly ascending under the writer's
    /// ordering; a repeated or out-of-order key is a protocol violation.
    pub fn add(&mut self, key: &[u8], payload: &[u8]) -> Result<()> {
        let key = crate::order::normalize_key(key, self.key_length);
        if !self.ordering.wellformed(&key) {
            return Err(HeapError::PolicyViolation(format!(
                "malformed key fed to writer: {:?}",
                String::from_utf8_lossy(&key)
            )));
        }
        if let Some(prev) = &self.prev_key {
            if self.ordering.compare(&key, prev) != std::cmp::Ordering::Greater {
                return Err(HeapError::PolicyViolation(format!(
                    "writer keys must be strictly ascending: {:?} after {:?}",
                    String::from_utf8_lossy(&key),
                    String::from_utf8_lossy(prev)
                )));
            }
        }

        let out = self.out.as_mut().ok_or(HeapError::Closed)?;
        let reclen = (self.key_length + payload.len()) as u32;
        out.write_all(&reclen.to_be_bytes())?;
        out.write_all(&key)?;
        out.write_all(payload)?;
        self.index.put(&key, self.seek)?;
        self.seek += RECORD_HEADER_LEN + reclen as u64;
        self.prev_key = Some(key);
        Ok(())
    }

    /// Records written so far
    pub fn size(&self) -> usize {
        self.index.size()
    }

    /// Finish the file: flush, sync, rename into place, and (optionally)
    /// write the index dump plus a trivially empty gap dump.
    pub fn close(mut self, write_idx: bool) -> Result<PathBuf> {
        let mut out = self.out.take().ok_or(HeapError::Closed)?;
        out.flush()?;
        out.get_ref().sync_all()?;
        drop(out);
        fs::rename(&self.temp_file, &self.final_file)?;
        info!(
            file = %self.final_file.display(),
            entries = self.index.size(),
            bytes = self.seek,
            "sequential heap build complete"
        );

        if write_idx && self.index.size() > 3 {
            match fingerprint::file_fingerprint(&self.final_file) {
                Ok(fp) => {
                    let idx_path = fingerprint::index_dump_path(&self.final_file, &fp);
                    let gap_path = fingerprint::gap_dump_path(&self.final_file, &fp);
                    self.index.dump(&idx_path)?;
                    // a freshly built file has no gaps
                    GapSet::new().dump(&gap_path)?;
                }
                Err(e) => {
                    warn!(file = %self.final_file.display(), error = %e, "cannot fingerprint fresh file, dump skipped");
                }
            }
        }
        Ok(self.final_file)
    }

    /// Abandon the build and remove the temp file
    pub fn abort(mut self) {
        self.out.take();
        if let Err(e) = fs::remove_file(&self.temp_file) {
            warn!(file = %self.temp_file.display(), error = %e, "cannot remove aborted temp file");
        }
    }

    /// Delete a heap file together with its companion artifacts
    /// (dumps, temp and partial files).
    pub fn delete_with_companions(path: &Path) {
        fingerprint::delete_stale_dumps(path, None, None);
        if let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) {
            for ext in ["tmp", "prt"] {
                let _ = fs::remove_file(path.with_file_name(format!("{}.{}", name, ext)));
            }
        }
        if path.exists() {
            if let Err(e) = fs::remove_file(path) {
                warn!(file = %path.display(), error = %e, "cannot delete heap file");
            }
        }
    }
}
