//! Asynchronous bulk index construction
//!
//! When an existing heap file is opened without a usable dump, the whole file
//! is scanned front to back. The scan thread streams `(key, offset)` pairs into
//! a bounded channel; a builder thread drains it into the index. `finish` is
//! the join barrier that hands the completed index back.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, Sender};
use tracing::debug;

use crate::error::{HeapError, Result};
use crate::index::HandleIndex;
use crate::order::ByteOrder;

/// Channel depth between the scanning and the building thread
const PIPELINE_DEPTH: usize = 1024;

/// Builds a [`HandleIndex`] on a separate thread while the caller scans a file
pub struct IndexBuilder {
    tx: Option<Sender<(Vec<u8>, u64)>>,
    handle: Option<JoinHandle<Result<HandleIndex>>>,
}

impl IndexBuilder {
    /// Spawn the builder thread. `name` only labels the thread and log output.
    pub fn new(name: &str, key_length: usize, ordering: Arc<dyn ByteOrder>) -> Self {
        let (tx, rx) = bounded::<(Vec<u8>, u64)>(PIPELINE_DEPTH);
        let thread_name = format!("{}.initializer", name);
        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let mut index = HandleIndex::new(key_length, ordering);
                for (key, seek) in rx.iter() {
                    index.put(&key, seek)?;
                }
                debug!(entries = index.size(), "bulk index construction done");
                Ok(index)
            })
            .expect("spawning index builder thread");
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    /// Stream one `(key, offset)` pair to the builder.
    /// Blocks when the pipeline is full.
    pub fn consume(&self, key: Vec<u8>, seek: u64) -> Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send((key, seek))
                .map_err(|_| HeapError::Corruption("index builder thread died".into())),
            None => Err(HeapError::Closed),
        }
    }

    /// Close the pipeline and wait for the index to be finalized
    pub fn finish(mut self) -> Result<HandleIndex> {
        self.tx.take();
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| HeapError::Corruption("index builder thread panicked".into()))?,
            None => Err(HeapError::Closed),
        }
    }
}
