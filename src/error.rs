//! Error types for blobheap
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using HeapError
pub type Result<T> = std::result::Result<T, HeapError>;

/// Unified error type for blobheap operations
#[derive(Debug, Error)]
pub enum HeapError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Corruption
    // -------------------------------------------------------------------------
    /// A damaged heap file: zero record length mid-file, a negative payload
    /// length, or a stored key that does not match the index. Self-healing
    /// (truncate / reindex / drop entry) happens before this surfaces.
    #[error("heap corruption detected: {0}")]
    Corruption(String),

    // -------------------------------------------------------------------------
    // Capacity / Resources
    // -------------------------------------------------------------------------
    /// The handle index refused another entry. Distinct from I/O failure so
    /// that buffer flush and gap-fill can catch it and fall back.
    #[error("handle index capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Not enough free memory to allocate a payload buffer or grow the write
    /// buffer. Callers degrade (refuse the read, flush early) instead of
    /// crashing.
    #[error("not enough memory: needed {needed} bytes ({context})")]
    SpaceExceeded { needed: u64, context: &'static str },

    // -------------------------------------------------------------------------
    // Caller Protocol
    // -------------------------------------------------------------------------
    /// A caller programming error: reduce growing a payload, a sequential
    /// writer fed a duplicate key, insert on a read-only heap. Fatal for the
    /// operation, not recoverable.
    #[error("operation violates the heap protocol: {0}")]
    PolicyViolation(String),

    /// Operation on a heap that was already closed.
    #[error("heap is closed")]
    Closed,
}
