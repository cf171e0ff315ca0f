//! Heap Files
//!
//! A heap file is a sequence of length-prefixed records in a random access
//! file, addressed through an in-memory [`HandleIndex`](crate::index::HandleIndex).
//!
//! ## File Format
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │ Record (repeated until EOF)                               │
//! │   RecLen: u32 BE (= key length + payload length,          │
//! │                   excludes these 4 bytes)                 │
//! │   Key:    [u8; keylength]  (first byte 0x00 = free record)│
//! │   Payload:[u8; RecLen - keylength]  (zeroed when free)    │
//! └───────────────────────────────────────────────────────────┘
//! ```
//! Every record occupies `4 + RecLen` bytes. Deleted records become gaps that
//! are reused by later inserts, split when oversized, and coalesced with their
//! neighbors. Companion dump files (`<file>.<fingerprint>.idx` / `.gap`) cache
//! the index across restarts and are consumed (deleted) on open.
//!
//! The layering is composition, innermost first:
//! - [`HeapReader`] — open/scan/verify, random-access reads
//! - [`HeapModifier`] — delete, reduce, in-place reclamation
//! - [`Heap`] — buffered inserts with gap reuse
//! - [`HeapWriter`] — sequential construction of fresh files (compaction output)

mod buffered;
pub(crate) mod fingerprint;
mod gap;
mod modifier;
mod reader;
mod writer;

pub use buffered::Heap;
pub use gap::GapSet;
pub use modifier::HeapModifier;
pub use reader::{HeapEntries, HeapReader};
pub use writer::HeapWriter;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::Result;

// =============================================================================
// Record Codec (shared by reader, modifier, heap, writer)
// =============================================================================

/// Bytes of the record length prefix
pub(crate) const RECORD_HEADER_LEN: u64 = 4;

/// Read the u32 big-endian record length stored at `seek`
pub(crate) fn read_reclen_at(file: &mut File, seek: u64) -> Result<u32> {
    let mut buf = [0u8; 4];
    file.seek(SeekFrom::Start(seek))?;
    file.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

/// Write a u32 big-endian record length at `seek`
pub(crate) fn write_reclen_at(file: &mut File, seek: u64, reclen: u32) -> Result<()> {
    file.seek(SeekFrom::Start(seek))?;
    file.write_all(&reclen.to_be_bytes())?;
    Ok(())
}

/// Zero-fill `len` bytes starting at `seek`
pub(crate) fn zero_fill_at(file: &mut File, seek: u64, len: usize) -> Result<()> {
    file.seek(SeekFrom::Start(seek))?;
    // chunked so a huge freed record does not allocate its full size
    const CHUNK: usize = 64 * 1024;
    let zeros = [0u8; CHUNK];
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(CHUNK);
        file.write_all(&zeros[..n])?;
        remaining -= n;
    }
    Ok(())
}
