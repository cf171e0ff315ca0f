//! Buffered Heap
//!
//! The write-capable heap: inserts first try to reuse a gap, otherwise they
//! collect in an ordered in-memory buffer that is flushed as one contiguous
//! append. The buffer is the freshest data, so every read checks it before
//! falling through to the file.

use std::collections::BTreeMap;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tracing::{debug, info};

use crate::error::{HeapError, Result};
use crate::index::KeyIterator;
use crate::memory;
use crate::order::{ByteOrder, OrderedKey};

use super::modifier::HeapModifier;
use super::{read_reclen_at, RECORD_HEADER_LEN};

/// Gap-fill scan bounds: stop after this many candidates...
const GAP_SCAN_MAX: usize = 100;
/// ...or once this many new-biggest gaps have been seen
const GAP_BIGGEST_MAX: usize = 10;

/// Buffered read/write access to a heap file
pub struct Heap {
    modifier: HeapModifier,
    /// Recent inserts, ordered by the heap's key order; `None` once closed
    buffer: Option<BTreeMap<OrderedKey, Vec<u8>>>,
    /// Payload bytes held in the buffer
    buffer_bytes: usize,
    /// Flush threshold for `buffer_bytes`
    buffer_max: usize,
}

impl Heap {
    /// Open a heap file for reading and writing.
    /// `buffer_max` caps the in-memory write buffer in payload bytes.
    pub fn new(
        heap_file: &Path,
        key_length: usize,
        ordering: Arc<dyn ByteOrder>,
        buffer_max: usize,
    ) -> Result<Self> {
        let modifier = HeapModifier::new(heap_file, key_length, ordering)?;
        info!(file = %modifier.name(), "initializing heap");
        Ok(Self {
            modifier,
            buffer: Some(BTreeMap::new()),
            buffer_bytes: 0,
            buffer_max,
        })
    }

    // =========================================================================
    // Insert
    // =========================================================================

    /// Store `payload` under `key`, replacing any previous record.
    ///
    /// The record lands in an exactly-fitting gap, in a split oversized gap,
    /// in the write buffer, or (when larger than the whole buffer) directly
    /// at the end of the file. Empty payloads are not stored.
    pub fn insert(&mut self, key: &[u8], payload: &[u8]) -> Result<()> {
        let key = self.modifier.reader.normalize(key);
        if payload.is_empty() {
            return Ok(());
        }

        // insert is a destructive overwrite, never additive
        self.delete_normalized(&key)?;

        if self.put_to_gap(&key, payload)? {
            return Ok(());
        }

        let buffer_full = self.buffer_bytes + payload.len() > self.buffer_max;
        if buffer_full || memory::short_status() {
            self.modifier.shrink_with_gaps_at_end()?;
            self.flush_buffer()?;
            if payload.len() > self.buffer_max {
                // too big for the buffer in any state: append directly
                return self.append(&key, payload);
            }
        }

        let k = OrderedKey::new(self.modifier.ordering(), key);
        self.buffer_bytes += payload.len();
        self.buffer_mut()?.insert(k, payload.to_vec());
        Ok(())
    }

    /// Try to place the record into a free slot.
    ///
    /// An exact-size gap wins immediately; otherwise the largest gap seen
    /// within the scan bounds is split, keeping a smaller gap for the
    /// remainder. Returns false when no gap fits or the index refuses the
    /// entry (capacity), leaving the file untouched.
    fn put_to_gap(&mut self, key: &[u8], payload: &[u8]) -> Result<bool> {
        let key_length = self.modifier.key_length();
        let reclen = key_length + payload.len();

        if self.modifier.reader.gaps()?.is_empty() {
            return Ok(false);
        }

        // bounded scan: exact match preferred, else remember the biggest
        let mut best: Option<(u64, usize)> = None;
        let mut exact: Option<u64> = None;
        {
            let gaps = self.modifier.reader.gaps()?;
            let mut candidates = 0;
            let mut biggest_seen = 0;
            for (off, size) in gaps.iter() {
                if size as usize == reclen {
                    exact = Some(off);
                    break;
                }
                candidates += 1;
                if best.map(|(_, s)| (size as usize) > s).unwrap_or(true) {
                    best = Some((off, size as usize));
                    biggest_seen += 1;
                    if candidates > GAP_SCAN_MAX || biggest_seen > GAP_BIGGEST_MAX {
                        break;
                    }
                }
            }
        }

        if let Some(off) = exact {
            // index first: if it refuses, nothing was written yet
            match self.modifier.reader.index_mut()?.put(key, off) {
                Ok(()) => {}
                Err(HeapError::CapacityExceeded(_)) => return Ok(false),
                Err(e) => return Err(e),
            }
            debug_assert_eq!(
                read_reclen_at(self.modifier.reader.file()?, off)? as usize,
                reclen
            );
            let file = self.modifier.reader.file()?;
            file.seek(SeekFrom::Start(off + RECORD_HEADER_LEN))?;
            file.write_all(key)?;
            file.write_all(payload)?;
            self.modifier.reader.gaps_mut()?.remove(off);
            debug!(off, reclen, "filled exact gap");
            return Ok(true);
        }

        if let Some((off, size)) = best {
            // splitting needs room for the remainder's own header; a perfect
            // +4 fit would leave a zero-size gap record, which is legal but
            // pointless, so require strictly more
            if size > reclen + 4 {
                match self.modifier.reader.index_mut()?.put(key, off) {
                    Ok(()) => {}
                    Err(HeapError::CapacityExceeded(_)) => return Ok(false),
                    Err(e) => return Err(e),
                }
                let remainder = (size - reclen - 4) as u32;
                {
                    let file = self.modifier.reader.file()?;
                    file.seek(SeekFrom::Start(off))?;
                    file.write_all(&(reclen as u32).to_be_bytes())?;
                    file.write_all(key)?;
                    file.write_all(payload)?;
                    // header of the new, smaller gap right behind
                    file.write_all(&remainder.to_be_bytes())?;
                }
                let gaps = self.modifier.reader.gaps_mut()?;
                gaps.remove(off);
                gaps.put(off + RECORD_HEADER_LEN + reclen as u64, remainder);
                debug!(off, reclen, remainder, "split gap");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Append a record at the end of the file, bypassing the buffer
    fn append(&mut self, key: &[u8], payload: &[u8]) -> Result<()> {
        let key_length = self.modifier.key_length();
        let pos = self.modifier.file_len()?;
        self.modifier.reader.index_mut()?.put(key, pos)?;
        let reclen = (key_length + payload.len()) as u32;
        let file = self.modifier.reader.file()?;
        file.seek(SeekFrom::Start(pos))?;
        file.write_all(&reclen.to_be_bytes())?;
        file.write_all(key)?;
        file.write_all(payload)?;
        Ok(())
    }

    /// Write every buffered record contiguously at the end of the file with a
    /// single write call.
    ///
    /// Entries the index refuses (capacity exceeded) stay in the buffer for
    /// the next flush instead of being lost.
    pub fn flush_buffer(&mut self) -> Result<()> {
        let Some(buffer) = self.buffer.take() else {
            return Ok(());
        };
        if buffer.is_empty() {
            self.buffer = Some(buffer);
            return Ok(());
        }

        let key_length = self.modifier.key_length();
        let pos = self.modifier.file_len()?;
        let mut pos_file = pos;
        let mut packed = BytesMut::with_capacity(
            self.buffer_bytes + (4 + key_length) * buffer.len(),
        );
        let mut kept = BTreeMap::new();
        let mut kept_bytes = 0;

        for (key, payload) in buffer {
            match self
                .modifier
                .reader
                .index_mut()?
                .put(key.bytes(), pos_file)
            {
                Ok(()) => {}
                Err(HeapError::CapacityExceeded(_)) => {
                    kept_bytes += payload.len();
                    kept.insert(key, payload);
                    continue;
                }
                Err(e) => return Err(e),
            }
            packed.put_u32((key_length + payload.len()) as u32);
            packed.put_slice(key.bytes());
            packed.put_slice(&payload);
            pos_file += (RECORD_HEADER_LEN as usize + key_length + payload.len()) as u64;
        }

        if !packed.is_empty() {
            let file = self.modifier.reader.file()?;
            file.seek(SeekFrom::Start(pos))?;
            file.write_all(&packed)?;
        }
        debug!(
            flushed = pos_file - pos,
            kept = kept.len(),
            "flushed write buffer"
        );
        self.buffer_bytes = kept_bytes;
        self.buffer = Some(kept);
        Ok(())
    }

    // =========================================================================
    // Reads (buffer first)
    // =========================================================================

    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let key = self.modifier.reader.normalize(key);
        if let Some(buffer) = &self.buffer {
            let k = OrderedKey::new(self.modifier.ordering(), key.clone());
            if let Some(payload) = buffer.get(&k) {
                return Ok(Some(payload.clone()));
            }
        }
        self.modifier.reader.get_normalized(&key)
    }

    pub fn length(&mut self, key: &[u8]) -> Result<Option<u64>> {
        let key = self.modifier.reader.normalize(key);
        if let Some(buffer) = &self.buffer {
            let k = OrderedKey::new(self.modifier.ordering(), key.clone());
            if let Some(payload) = buffer.get(&k) {
                return Ok(Some(payload.len() as u64));
            }
        }
        self.modifier.length(&key)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        let key = self.modifier.reader.normalize(key);
        if let Some(buffer) = &self.buffer {
            let k = OrderedKey::new(self.modifier.ordering(), key.clone());
            if buffer.contains_key(&k) {
                return true;
            }
        }
        self.modifier.contains_key(&key)
    }

    /// Live records, buffered ones included
    pub fn size(&self) -> usize {
        self.modifier.size() + self.buffer.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// File bytes plus buffered payload bytes
    pub fn total_bytes(&self) -> Result<u64> {
        Ok(self.modifier.file_len()? + self.buffer_bytes as u64)
    }

    // =========================================================================
    // Delete / Reduce
    // =========================================================================

    /// Remove the record for `key`, wherever it lives
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        let key = self.modifier.reader.normalize(key);
        self.delete_normalized(&key)
    }

    fn delete_normalized(&mut self, key: &[u8]) -> Result<()> {
        let k = OrderedKey::new(self.modifier.ordering(), key.to_vec());
        if let Some(buffer) = &mut self.buffer {
            if let Some(payload) = buffer.remove(&k) {
                self.buffer_bytes -= payload.len();
                return Ok(());
            }
        }
        self.modifier.delete_normalized(key)
    }

    /// Shrink-only rewrite; buffered records are transformed in place
    pub fn reduce<F>(&mut self, key: &[u8], reducer: F) -> Result<usize>
    where
        F: FnOnce(&[u8]) -> Vec<u8>,
    {
        let key = self.modifier.reader.normalize(key);
        let k = OrderedKey::new(self.modifier.ordering(), key.clone());
        if let Some(buffer) = &mut self.buffer {
            if let Some(payload) = buffer.get_mut(&k) {
                let reduced = reducer(payload);
                if reduced.len() > payload.len() {
                    return Err(HeapError::PolicyViolation(format!(
                        "reduce grew payload from {} to {} bytes",
                        payload.len(),
                        reduced.len()
                    )));
                }
                let freed = payload.len() - reduced.len();
                self.buffer_bytes -= freed;
                *payload = reduced;
                return Ok(freed);
            }
        }
        self.modifier.reduce(&key, reducer)
    }

    // =========================================================================
    // Iteration / Lifecycle
    // =========================================================================

    /// Ordered key iteration; flushes the buffer so the index is complete
    pub fn key_iterator(&mut self, up: bool, rotating: bool) -> Result<KeyIterator> {
        self.flush_buffer()?;
        self.modifier.key_iterator(up, rotating)
    }

    /// Ordered key iteration from `first_key`; flushes the buffer first
    pub fn keys_from(&mut self, up: bool, first_key: Option<&[u8]>) -> Result<KeyIterator> {
        self.flush_buffer()?;
        self.modifier.keys_from(up, first_key)
    }

    /// Truncate everything, buffer included
    pub fn clear(&mut self) -> Result<()> {
        info!(file = %self.modifier.name(), "clearing heap");
        if let Some(buffer) = &mut self.buffer {
            buffer.clear();
        }
        self.buffer_bytes = 0;
        self.modifier.clear()
    }

    /// Flush, reclaim trailing gaps, then close the underlying file
    pub fn close(&mut self, write_idx: bool) -> Result<()> {
        info!(file = %self.modifier.name(), "closing heap");
        if self.buffer.is_some() && !self.modifier.is_closed() {
            self.flush_buffer()?;
            self.modifier.shrink_with_gaps_at_end()?;
        }
        self.buffer = None;
        self.modifier.close(write_idx)
    }

    pub fn is_closed(&self) -> bool {
        self.modifier.is_closed()
    }

    pub fn buffer_max(&self) -> usize {
        self.buffer_max
    }

    // delegated read surface

    pub fn name(&self) -> String {
        self.modifier.name()
    }

    pub fn location(&self) -> &Path {
        self.modifier.location()
    }

    pub fn key_length(&self) -> usize {
        self.modifier.key_length()
    }

    pub fn ordering(&self) -> Arc<dyn ByteOrder> {
        self.modifier.ordering()
    }

    pub fn mem(&self) -> u64 {
        self.modifier.mem() + self.buffer_bytes as u64
    }

    pub fn file_len(&self) -> Result<u64> {
        self.modifier.file_len()
    }

    fn buffer_mut(&mut self) -> Result<&mut BTreeMap<OrderedKey, Vec<u8>>> {
        self.buffer.as_mut().ok_or(HeapError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::NaturalOrder;
    use tempfile::TempDir;

    fn heap(dir: &TempDir, buffer_max: usize) -> Heap {
        let path = dir.path().join("test.blob");
        Heap::new(&path, 12, Arc::new(NaturalOrder), buffer_max).unwrap()
    }

    #[test]
    fn insert_get_round_trip_through_buffer() {
        let dir = TempDir::new().unwrap();
        let mut h = heap(&dir, 1024);
        h.insert(b"aaaaaaaaaaaa", b"hello").unwrap();
        assert_eq!(h.get(b"aaaaaaaaaaaa").unwrap().unwrap(), b"hello");
        assert!(h.contains_key(b"aaaaaaaaaaaa"));
        assert_eq!(h.length(b"aaaaaaaaaaaa").unwrap(), Some(5));
        // still buffered, nothing on disk yet
        assert_eq!(h.file_len().unwrap(), 0);
    }

    #[test]
    fn insert_get_round_trip_after_flush() {
        let dir = TempDir::new().unwrap();
        let mut h = heap(&dir, 1024);
        h.insert(b"aaaaaaaaaaaa", b"hello").unwrap();
        h.flush_buffer().unwrap();
        assert_eq!(h.file_len().unwrap(), 4 + 12 + 5);
        assert_eq!(h.get(b"aaaaaaaaaaaa").unwrap().unwrap(), b"hello");
        assert_eq!(h.length(b"aaaaaaaaaaaa").unwrap(), Some(5));
    }

    #[test]
    fn overwrite_keeps_single_live_record() {
        let dir = TempDir::new().unwrap();
        let mut h = heap(&dir, 1024);
        h.insert(b"aaaaaaaaaaaa", b"first").unwrap();
        h.insert(b"aaaaaaaaaaaa", b"second").unwrap();
        assert_eq!(h.get(b"aaaaaaaaaaaa").unwrap().unwrap(), b"second");
        assert_eq!(h.size(), 1);
        h.flush_buffer().unwrap();
        h.insert(b"aaaaaaaaaaaa", b"third!").unwrap();
        assert_eq!(h.get(b"aaaaaaaaaaaa").unwrap().unwrap(), b"third!");
        assert_eq!(h.size(), 1);
    }

    #[test]
    fn empty_payload_is_not_stored() {
        let dir = TempDir::new().unwrap();
        let mut h = heap(&dir, 1024);
        h.insert(b"aaaaaaaaaaaa", b"").unwrap();
        assert!(!h.contains_key(b"aaaaaaaaaaaa"));
        assert_eq!(h.size(), 0);
    }

    #[test]
    fn delete_from_buffer_and_disk() {
        let dir = TempDir::new().unwrap();
        let mut h = heap(&dir, 1024);
        h.insert(b"aaaaaaaaaaaa", b"buffered").unwrap();
        h.insert(b"bbbbbbbbbbbb", b"on disk").unwrap();
        h.flush_buffer().unwrap();
        h.insert(b"cccccccccccc", b"buffered again").unwrap();

        h.delete(b"cccccccccccc").unwrap(); // buffer hit
        h.delete(b"aaaaaaaaaaaa").unwrap(); // disk hit
        h.delete(b"nosuchkey").unwrap(); // idempotent

        assert!(!h.contains_key(b"aaaaaaaaaaaa"));
        assert!(!h.contains_key(b"cccccccccccc"));
        assert_eq!(h.get(b"bbbbbbbbbbbb").unwrap().unwrap(), b"on disk");
        assert_eq!(h.size(), 1);
    }

    #[test]
    fn exact_gap_is_reused() {
        let dir = TempDir::new().unwrap();
        let mut h = heap(&dir, 1024);
        h.insert(b"aaaaaaaaaaaa", b"12345678").unwrap();
        h.insert(b"bbbbbbbbbbbb", b"tail").unwrap();
        h.flush_buffer().unwrap();
        let len_before = h.file_len().unwrap();

        h.delete(b"aaaaaaaaaaaa").unwrap();
        // same payload size: must land in the freed slot, not at the end
        h.insert(b"xxxxxxxxxxxx", b"87654321").unwrap();
        assert_eq!(h.file_len().unwrap(), len_before);
        assert_eq!(h.get(b"xxxxxxxxxxxx").unwrap().unwrap(), b"87654321");
        assert!(h.modifier.reader.gaps().unwrap().is_empty());
    }

    #[test]
    fn oversized_gap_is_split() {
        let dir = TempDir::new().unwrap();
        let mut h = heap(&dir, 1024);
        h.insert(b"aaaaaaaaaaaa", b"a long payload to leave a roomy gap")
            .unwrap();
        h.insert(b"bbbbbbbbbbbb", b"tail").unwrap();
        h.flush_buffer().unwrap();
        let len_before = h.file_len().unwrap();

        h.delete(b"aaaaaaaaaaaa").unwrap();
        h.insert(b"xxxxxxxxxxxx", b"small").unwrap();
        // no growth: the record went into the gap's front
        assert_eq!(h.file_len().unwrap(), len_before);
        assert_eq!(h.get(b"xxxxxxxxxxxx").unwrap().unwrap(), b"small");
        // remainder gap: 35-byte payload freed 47 bytes of record space;
        // 12+5 reused plus 4 for the new header leaves 47-17-4-4 = hmm,
        // just assert a single gap remains
        assert_eq!(h.modifier.reader.gaps().unwrap().size(), 1);
    }

    #[test]
    fn buffer_overflow_forces_flush() {
        let dir = TempDir::new().unwrap();
        let mut h = heap(&dir, 32);
        h.insert(b"aaaaaaaaaaaa", b"0123456789abcdef").unwrap(); // 16 bytes
        assert_eq!(h.file_len().unwrap(), 0);
        h.insert(b"bbbbbbbbbbbb", b"0123456789abcdefgh").unwrap(); // 18 bytes: over cap
        // first record was flushed to make room
        assert!(h.file_len().unwrap() > 0);
        assert_eq!(h.get(b"aaaaaaaaaaaa").unwrap().unwrap(), b"0123456789abcdef");
        assert_eq!(
            h.get(b"bbbbbbbbbbbb").unwrap().unwrap(),
            b"0123456789abcdefgh"
        );
    }

    #[test]
    fn record_larger_than_buffer_bypasses_it() {
        let dir = TempDir::new().unwrap();
        let mut h = heap(&dir, 8);
        h.insert(b"aaaaaaaaaaaa", b"way more than eight bytes").unwrap();
        // written straight to the file
        assert!(h.file_len().unwrap() > 0);
        assert_eq!(
            h.get(b"aaaaaaaaaaaa").unwrap().unwrap(),
            b"way more than eight bytes"
        );
    }

    #[test]
    fn keys_flush_and_iterate_in_order() {
        let dir = TempDir::new().unwrap();
        let mut h = heap(&dir, 1024);
        h.insert(b"cccccccccccc", b"3").unwrap();
        h.insert(b"aaaaaaaaaaaa", b"1").unwrap();
        h.flush_buffer().unwrap();
        h.insert(b"bbbbbbbbbbbb", b"2").unwrap();
        let keys: Vec<_> = h.key_iterator(true, false).unwrap().collect();
        assert_eq!(
            keys,
            vec![
                b"aaaaaaaaaaaa".to_vec(),
                b"bbbbbbbbbbbb".to_vec(),
                b"cccccccccccc".to_vec()
            ]
        );
    }

    #[test]
    fn close_flushes_shrinks_and_reopen_restores() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.blob");
        {
            let mut h = Heap::new(&path, 12, Arc::new(NaturalOrder), 1024).unwrap();
            h.insert(b"aaaaaaaaaaaa", b"one").unwrap();
            h.insert(b"bbbbbbbbbbbb", b"two").unwrap();
            h.insert(b"cccccccccccc", b"three").unwrap();
            h.insert(b"dddddddddddd", b"four").unwrap();
            h.delete(b"dddddddddddd").unwrap();
            h.close(true).unwrap();
        }
        let mut h = Heap::new(&path, 12, Arc::new(NaturalOrder), 1024).unwrap();
        assert_eq!(h.size(), 3);
        assert_eq!(h.get(b"aaaaaaaaaaaa").unwrap().unwrap(), b"one");
        assert_eq!(h.get(b"bbbbbbbbbbbb").unwrap().unwrap(), b"two");
        assert_eq!(h.get(b"cccccccccccc").unwrap().unwrap(), b"three");
        assert!(!h.contains_key(b"dddddddddddd"));
        h.close(false).unwrap();
        assert!(matches!(
            h.insert(b"aaaaaaaaaaaa", b"x"),
            Err(HeapError::Closed)
        ));
    }

    #[test]
    fn reduce_on_buffered_record() {
        let dir = TempDir::new().unwrap();
        let mut h = heap(&dir, 1024);
        h.insert(b"aaaaaaaaaaaa", b"0123456789").unwrap();
        let freed = h.reduce(b"aaaaaaaaaaaa", |_| b"0123".to_vec()).unwrap();
        assert_eq!(freed, 6);
        assert_eq!(h.get(b"aaaaaaaaaaaa").unwrap().unwrap(), b"0123");
    }

    #[test]
    fn heap_scenario() {
        // four inserts, two deletes, one refill into freed space
        let dir = TempDir::new().unwrap();
        let mut h = heap(&dir, 512 * 1024);
        h.insert(b"aaaaaaaaaaaa", b"eins zwei drei").unwrap();
        h.insert(b"aaaaaaaaaaab", b"vier fuenf sechs").unwrap();
        h.insert(b"aaaaaaaaaaac", b"sieben acht neun").unwrap();
        h.insert(b"aaaaaaaaaaad", b"zehn elf zwoelf").unwrap();
        h.delete(b"aaaaaaaaaaab").unwrap();
        h.delete(b"aaaaaaaaaaac").unwrap();
        h.insert(b"aaaaaaaaaaaX", b"WXYZ").unwrap();

        let keys: Vec<_> = h.key_iterator(true, false).unwrap().collect();
        assert_eq!(
            keys,
            vec![
                b"aaaaaaaaaaaX".to_vec(),
                b"aaaaaaaaaaaa".to_vec(),
                b"aaaaaaaaaaad".to_vec()
            ]
        );
        assert_eq!(h.get(b"aaaaaaaaaaaX").unwrap().unwrap(), b"WXYZ");
        assert_eq!(h.get(b"aaaaaaaaaaaa").unwrap().unwrap(), b"eins zwei drei");
        assert_eq!(h.get(b"aaaaaaaaaaad").unwrap().unwrap(), b"zehn elf zwoelf");
        assert_eq!(h.get(b"aaaaaaaaaaab").unwrap(), None);
        assert_eq!(h.get(b"aaaaaaaaaaac").unwrap(), None);
    }
}
