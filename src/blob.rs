//! BLOB Contract
//!
//! The minimal key/BLOB interface that higher encoding layers (property maps,
//! tables) build upon. [`Heap`](crate::heap::Heap) implements the full
//! contract; [`HeapModifier`](crate::heap::HeapModifier) implements it as a
//! read/delete-only store (insert is a protocol violation);
//! [`ArrayStack`](crate::stack::ArrayStack) implements it across a directory
//! of heap files.

use std::sync::Arc;

use crate::error::{HeapError, Result};
use crate::heap::{Heap, HeapModifier};
use crate::order::ByteOrder;
use crate::stack::ArrayStack;

/// Key/BLOB store over fixed-length keys
pub trait Blob: Send {
    /// Human-readable name (usually the file or directory name)
    fn name(&self) -> String;

    /// Fixed key length of this store
    fn key_length(&self) -> usize;

    /// The key order of this store
    fn ordering(&self) -> Arc<dyn ByteOrder>;

    /// Read the payload stored under `key`
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Store `payload` under `key`, replacing any previous record
    fn insert(&mut self, key: &[u8], payload: &[u8]) -> Result<()>;

    /// Remove the record for `key`; absent keys are a no-op
    fn delete(&mut self, key: &[u8]) -> Result<()>;

    /// Whether `key` is present (no I/O)
    fn contains_key(&self, key: &[u8]) -> bool;

    /// Declared payload length for `key` without reading it
    fn length(&mut self, key: &[u8]) -> Result<Option<u64>>;

    /// Number of live records
    fn size(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// All keys in order. The returned iterator owns a snapshot.
    fn keys(&mut self, up: bool) -> Result<Box<dyn Iterator<Item = Vec<u8>> + Send>>;

    /// Bytes held by this store (file bytes plus buffered bytes)
    fn total_bytes(&self) -> Result<u64>;

    /// Approximate resident memory of the in-RAM structures
    fn mem(&self) -> u64;

    /// Remove every record
    fn clear(&mut self) -> Result<()>;

    /// Close the store; `write_idx` controls whether index dumps are written
    fn close(&mut self, write_idx: bool) -> Result<()>;
}

impl Blob for Heap {
    fn name(&self) -> String {
        Heap::name(self)
    }

    fn key_length(&self) -> usize {
        Heap::key_length(self)
    }

    fn ordering(&self) -> Arc<dyn ByteOrder> {
        Heap::ordering(self)
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Heap::get(self, key)
    }

    fn insert(&mut self, key: &[u8], payload: &[u8]) -> Result<()> {
        Heap::insert(self, key, payload)
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        Heap::delete(self, key)
    }

    fn contains_key(&self, key: &[u8]) -> bool {
        Heap::contains_key(self, key)
    }

    fn length(&mut self, key: &[u8]) -> Result<Option<u64>> {
        Heap::length(self, key)
    }

    fn size(&self) -> usize {
        Heap::size(self)
    }

    fn keys(&mut self, up: bool) -> Result<Box<dyn Iterator<Item = Vec<u8>> + Send>> {
        Ok(Box::new(Heap::key_iterator(self, up, false)?))
    }

    fn total_bytes(&self) -> Result<u64> {
        Heap::total_bytes(self)
    }

    fn mem(&self) -> u64 {
        Heap::mem(self)
    }

    fn clear(&mut self) -> Result<()> {
        Heap::clear(self)
    }

    fn close(&mut self, write_idx: bool) -> Result<()> {
        Heap::close(self, write_idx)
    }
}

impl Blob for HeapModifier {
    fn name(&self) -> String {
        HeapModifier::name(self)
    }

    fn key_length(&self) -> usize {
        HeapModifier::key_length(self)
    }

    fn ordering(&self) -> Arc<dyn ByteOrder> {
        HeapModifier::ordering(self)
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        HeapModifier::get(self, key)
    }

    fn insert(&mut self, _key: &[u8], _payload: &[u8]) -> Result<()> {
        Err(HeapError::PolicyViolation(format!(
            "{} is open read/delete-only",
            HeapModifier::name(self)
        )))
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        HeapModifier::delete(self, key)
    }

    fn contains_key(&self, key: &[u8]) -> bool {
        HeapModifier::contains_key(self, key)
    }

    fn length(&mut self, key: &[u8]) -> Result<Option<u64>> {
        HeapModifier::length(self, key)
    }

    fn size(&self) -> usize {
        HeapModifier::size(self)
    }

    fn keys(&mut self, up: bool) -> Result<Box<dyn Iterator<Item = Vec<u8>> + Send>> {
        Ok(Box::new(HeapModifier::key_iterator(self, up, false)?))
    }

    fn total_bytes(&self) -> Result<u64> {
        HeapModifier::file_len(self)
    }

    fn mem(&self) -> u64 {
        HeapModifier::mem(self)
    }

    fn clear(&mut self) -> Result<()> {
        HeapModifier::clear(self)
    }

    fn close(&mut self, write_idx: bool) -> Result<()> {
        HeapModifier::close(self, write_idx)
    }
}

impl Blob for ArrayStack {
    fn name(&self) -> String {
        ArrayStack::name(self)
    }

    fn key_length(&self) -> usize {
        ArrayStack::key_length(self)
    }

    fn ordering(&self) -> Arc<dyn ByteOrder> {
        ArrayStack::ordering(self)
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        ArrayStack::get(self, key)
    }

    fn insert(&mut self, key: &[u8], payload: &[u8]) -> Result<()> {
        ArrayStack::insert(self, key, payload)
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        ArrayStack::delete(self, key)
    }

    fn contains_key(&self, key: &[u8]) -> bool {
        ArrayStack::contains_key(self, key).unwrap_or(false)
    }

    fn length(&mut self, key: &[u8]) -> Result<Option<u64>> {
        ArrayStack::length(self, key)
    }

    fn size(&self) -> usize {
        ArrayStack::size(self)
    }

    fn keys(&mut self, up: bool) -> Result<Box<dyn Iterator<Item = Vec<u8>> + Send>> {
        Ok(Box::new(ArrayStack::merged_keys(self, up)?))
    }

    fn total_bytes(&self) -> Result<u64> {
        Ok(ArrayStack::total_bytes(self))
    }

    fn mem(&self) -> u64 {
        ArrayStack::mem(self)
    }

    fn clear(&mut self) -> Result<()> {
        ArrayStack::clear(self)
    }

    fn close(&mut self, write_idx: bool) -> Result<()> {
        ArrayStack::close(self, write_idx)
    }
}
