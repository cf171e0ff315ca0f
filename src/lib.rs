//! # blobheap
//!
//! A log-structured key/BLOB storage engine:
//! - Append-only record files with in-place gap reuse
//! - In-memory key→offset index with durable snapshotting
//! - Buffered writes flushed as single contiguous appends
//! - Time-partitioned file arrays with rollover and compaction
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       ArrayStack                            │
//! │     (directory of <prefix>.<timestamp>.blob files)          │
//! │   inserts → newest file     lookups → fan-out to all        │
//! └────────────┬───────────────────────────────┬────────────────┘
//!              │ newest                        │ older
//! ┌────────────▼────────────┐     ┌────────────▼────────────┐
//! │          Heap           │     │      HeapModifier       │
//! │  (write buffer + gaps)  │     │   (read/delete only)    │
//! └────────────┬────────────┘     └────────────┬────────────┘
//!              │                               │
//! ┌────────────▼───────────────────────────────▼────────────┐
//! │                       HeapReader                        │
//! │    HandleIndex (key → offset)  ·  GapSet (free space)   │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Compactions run two unmounted files through [`heap::HeapWriter`] into one
//! fresh file (`stack::merge`), which is mounted back into the array.

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod blob;
pub mod heap;
pub mod index;
pub mod memory;
pub mod order;
pub mod stack;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use blob::Blob;
pub use config::StackConfig;
pub use error::{HeapError, Result};
pub use heap::{GapSet, Heap, HeapEntries, HeapModifier, HeapReader, HeapWriter};
pub use index::{HandleIndex, IndexBuilder, KeyIterator};
pub use order::{ByteOrder, NaturalOrder};
pub use stack::{ArrayStack, MergeFn, MergedKeys};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of blobheap
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
