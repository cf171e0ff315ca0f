//! Handle Index
//!
//! The in-memory key→file-offset map behind every heap file. Keys have a fixed
//! length and sort through the injected [`ByteOrder`]; the index lives fully in
//! memory for the lifetime of an open file, which is why closing and trimming
//! old files matters.
//!
//! The index can be dumped to disk on close and reconstructed from the dump on
//! the next open, skipping the full file scan.

mod builder;

pub use builder::IndexBuilder;

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{HeapError, Result};
use crate::order::{ByteOrder, OrderedKey};

/// Fixed-key-length ordered map `key → file offset`
pub struct HandleIndex {
    key_length: usize,
    ordering: Arc<dyn ByteOrder>,
    map: BTreeMap<OrderedKey, u64>,
    /// Optional entry cap; `put` past it fails with `CapacityExceeded`
    capacity: Option<usize>,
}

/// On-disk shape of an index dump (bincode payload)
#[derive(Serialize, Deserialize)]
struct IndexDump {
    key_length: u64,
    entries: Vec<(Vec<u8>, u64)>,
}

impl HandleIndex {
    /// Create an empty index
    pub fn new(key_length: usize, ordering: Arc<dyn ByteOrder>) -> Self {
        Self {
            key_length,
            ordering,
            map: BTreeMap::new(),
            capacity: None,
        }
    }

    /// Create an empty index that refuses entries beyond `capacity`
    pub fn with_capacity_limit(
        key_length: usize,
        ordering: Arc<dyn ByteOrder>,
        capacity: usize,
    ) -> Self {
        Self {
            key_length,
            ordering,
            map: BTreeMap::new(),
            capacity: Some(capacity),
        }
    }

    /// Load an index from a dump file written by [`HandleIndex::dump`]
    pub fn load(path: &Path, key_length: usize, ordering: Arc<dyn ByteOrder>) -> Result<Self> {
        let raw = fs::read(path)?;
        let dump: IndexDump = bincode::deserialize(&raw)
            .map_err(|e| HeapError::Corruption(format!("index dump {}: {}", path.display(), e)))?;
        if dump.key_length as usize != key_length {
            return Err(HeapError::Corruption(format!(
                "index dump {} has key length {}, expected {}",
                path.display(),
                dump.key_length,
                key_length
            )));
        }
        let mut map = BTreeMap::new();
        for (key, seek) in dump.entries {
            map.insert(OrderedKey::new(ordering.clone(), key), seek);
        }
        Ok(Self {
            key_length,
            ordering,
            map,
            capacity: None,
        })
    }

    /// Write the index to `path` via a temp file and atomic rename
    pub fn dump(&self, path: &Path) -> Result<()> {
        let dump = IndexDump {
            key_length: self.key_length as u64,
            entries: self
                .map
                .iter()
                .map(|(k, &v)| (k.bytes().to_vec(), v))
                .collect(),
        };
        let raw = bincode::serialize(&dump)
            .map_err(|e| HeapError::Corruption(format!("index dump encode: {}", e)))?;
        let tmp = path.with_extension("prt");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&raw)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Offset stored for `key`, if any. The key must already be normalized.
    pub fn get(&self, key: &[u8]) -> Option<u64> {
        self.map.get(&self.wrap(key)).copied()
    }

    /// Store `key → seek`. Fails with `CapacityExceeded` when the entry cap is
    /// reached; overwriting an existing key never fails.
    pub fn put(&mut self, key: &[u8], seek: u64) -> Result<()> {
        debug_assert_eq!(key.len(), self.key_length);
        let k = self.wrap(key);
        if let Some(cap) = self.capacity {
            if self.map.len() >= cap && !self.map.contains_key(&k) {
                return Err(HeapError::CapacityExceeded(format!(
                    "{} entries",
                    self.map.len()
                )));
            }
        }
        self.map.insert(k, seek);
        Ok(())
    }

    /// Remove `key`, returning its previous offset
    pub fn remove(&mut self, key: &[u8]) -> Option<u64> {
        self.map.remove(&self.wrap(key))
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.map.contains_key(&self.wrap(key))
    }

    pub fn size(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn key_length(&self) -> usize {
        self.key_length
    }

    pub fn ordering(&self) -> Arc<dyn ByteOrder> {
        self.ordering.clone()
    }

    /// Smallest key under the index ordering
    pub fn smallest_key(&self) -> Option<Vec<u8>> {
        self.map.keys().next().map(|k| k.bytes().to_vec())
    }

    /// Largest key under the index ordering
    pub fn largest_key(&self) -> Option<Vec<u8>> {
        self.map.keys().next_back().map(|k| k.bytes().to_vec())
    }

    /// Approximate resident bytes of this index
    pub fn mem(&self) -> u64 {
        // key bytes + offset + per-entry map overhead estimate
        (self.map.len() * (self.key_length + 8 + 48)) as u64
    }

    /// Ordered key iteration, ascending or descending, optionally starting at
    /// `from` (the first key ≥/≤ `from` under the index ordering).
    ///
    /// The iterator is a snapshot: clonable, restartable, and unaffected by
    /// later index mutations.
    pub fn keys(&self, up: bool, from: Option<&[u8]>) -> KeyIterator {
        self.keys_inner(up, from, false)
    }

    /// Like [`HandleIndex::keys`] but wrapping around the end of the key space
    /// back to the start key, visiting every key exactly once.
    pub fn rotating_keys(&self, up: bool, from: Option<&[u8]>) -> KeyIterator {
        self.keys_inner(up, from, true)
    }

    fn keys_inner(&self, up: bool, from: Option<&[u8]>, rotating: bool) -> KeyIterator {
        let keys: Arc<[Vec<u8>]> = self
            .map
            .keys()
            .map(|k| k.bytes().to_vec())
            .collect::<Vec<_>>()
            .into();
        let start = match from {
            None => {
                if up || keys.is_empty() {
                    Some(0)
                } else {
                    Some(keys.len() - 1)
                }
            }
            Some(f) => {
                let bound = self.wrap(f);
                if up {
                    // first key >= from
                    self.map
                        .range((Bound::Included(bound), Bound::Unbounded))
                        .next()
                        .map(|(k, _)| self.position_of(k))
                } else {
                    // last key <= from
                    self.map
                        .range((Bound::Unbounded, Bound::Included(bound)))
                        .next_back()
                        .map(|(k, _)| self.position_of(k))
                }
            }
        };
        match start {
            Some(start) => KeyIterator::new(keys, up, start, rotating),
            None => KeyIterator::empty(),
        }
    }

    fn position_of(&self, key: &OrderedKey) -> usize {
        self.map.range(..key).count()
    }

    fn wrap(&self, key: &[u8]) -> OrderedKey {
        OrderedKey::new(self.ordering.clone(), key.to_vec())
    }
}

/// Snapshot iterator over index keys.
///
/// Cloning is cheap (the snapshot is shared); `restart` rewinds to the first
/// key of the sequence.
#[derive(Clone)]
pub struct KeyIterator {
    keys: Arc<[Vec<u8>]>,
    up: bool,
    start: usize,
    emitted: usize,
    rotating: bool,
}

impl KeyIterator {
    fn new(keys: Arc<[Vec<u8>]>, up: bool, start: usize, rotating: bool) -> Self {
        Self {
            keys,
            up,
            start,
            emitted: 0,
            rotating,
        }
    }

    /// An empty iterator
    pub fn empty() -> Self {
        Self::new(Vec::new().into(), true, 0, false)
    }

    /// Rewind to the first key of the sequence
    pub fn restart(&mut self) {
        self.emitted = 0;
    }

    /// Keys remaining in the sequence
    pub fn remaining(&self) -> usize {
        self.total().saturating_sub(self.emitted)
    }

    fn total(&self) -> usize {
        let n = self.keys.len();
        if n == 0 || self.start >= n {
            return 0;
        }
        if self.rotating {
            n
        } else if self.up {
            n - self.start
        } else {
            self.start + 1
        }
    }
}

impl Iterator for KeyIterator {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.emitted >= self.total() {
            return None;
        }
        let n = self.keys.len();
        let idx = if self.up {
            (self.start + self.emitted) % n
        } else {
            (self.start + n - self.emitted % n) % n
        };
        self.emitted += 1;
        Some(self.keys[idx].clone())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let r = self.remaining();
        (r, Some(r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::NaturalOrder;
    use tempfile::TempDir;

    fn index() -> HandleIndex {
        HandleIndex::new(4, Arc::new(NaturalOrder))
    }

    #[test]
    fn put_get_remove() {
        let mut idx = index();
        idx.put(b"aaaa", 0).unwrap();
        idx.put(b"bbbb", 42).unwrap();
        assert_eq!(idx.get(b"aaaa"), Some(0));
        assert_eq!(idx.get(b"bbbb"), Some(42));
        assert_eq!(idx.get(b"cccc"), None);
        assert_eq!(idx.remove(b"aaaa"), Some(0));
        assert_eq!(idx.get(b"aaaa"), None);
        assert_eq!(idx.size(), 1);
    }

    #[test]
    fn overwrite_keeps_single_entry() {
        let mut idx = index();
        idx.put(b"aaaa", 1).unwrap();
        idx.put(b"aaaa", 2).unwrap();
        assert_eq!(idx.size(), 1);
        assert_eq!(idx.get(b"aaaa"), Some(2));
    }

    #[test]
    fn capacity_limit_refuses_new_keys_but_allows_overwrites() {
        let mut idx = HandleIndex::with_capacity_limit(4, Arc::new(NaturalOrder), 2);
        idx.put(b"aaaa", 1).unwrap();
        idx.put(b"bbbb", 2).unwrap();
        assert!(matches!(
            idx.put(b"cccc", 3),
            Err(HeapError::CapacityExceeded(_))
        ));
        // overwriting an existing key still works at the cap
        idx.put(b"aaaa", 9).unwrap();
        assert_eq!(idx.get(b"aaaa"), Some(9));
    }

    #[test]
    fn smallest_largest() {
        let mut idx = index();
        idx.put(b"mmmm", 1).unwrap();
        idx.put(b"aaaa", 2).unwrap();
        idx.put(b"zzzz", 3).unwrap();
        assert_eq!(idx.smallest_key().unwrap(), b"aaaa");
        assert_eq!(idx.largest_key().unwrap(), b"zzzz");
    }

    #[test]
    fn keys_ascending_descending() {
        let mut idx = index();
        for k in [b"bbbb", b"aaaa", b"cccc"] {
            idx.put(k, 0).unwrap();
        }
        let up: Vec<_> = idx.keys(true, None).collect();
        assert_eq!(up, vec![b"aaaa".to_vec(), b"bbbb".to_vec(), b"cccc".to_vec()]);
        let down: Vec<_> = idx.keys(false, None).collect();
        assert_eq!(down, vec![b"cccc".to_vec(), b"bbbb".to_vec(), b"aaaa".to_vec()]);
    }

    #[test]
    fn keys_from_start_key() {
        let mut idx = index();
        for k in [b"aaaa", b"cccc", b"eeee"] {
            idx.put(k, 0).unwrap();
        }
        let up: Vec<_> = idx.keys(true, Some(b"bbbb")).collect();
        assert_eq!(up, vec![b"cccc".to_vec(), b"eeee".to_vec()]);
        let down: Vec<_> = idx.keys(false, Some(b"dddd")).collect();
        assert_eq!(down, vec![b"cccc".to_vec(), b"aaaa".to_vec()]);
    }

    #[test]
    fn rotating_keys_visit_all_once() {
        let mut idx = index();
        for k in [b"aaaa", b"bbbb", b"cccc"] {
            idx.put(k, 0).unwrap();
        }
        let rot: Vec<_> = idx.rotating_keys(true, Some(b"bbbb")).collect();
        assert_eq!(
            rot,
            vec![b"bbbb".to_vec(), b"cccc".to_vec(), b"aaaa".to_vec()]
        );
    }

    #[test]
    fn iterator_is_clonable_and_restartable() {
        let mut idx = index();
        for k in [b"aaaa", b"bbbb"] {
            idx.put(k, 0).unwrap();
        }
        let mut it = idx.keys(true, None);
        assert_eq!(it.next().unwrap(), b"aaaa");
        let clone: Vec<_> = it.clone().collect();
        assert_eq!(clone, vec![b"bbbb".to_vec()]);
        it.restart();
        assert_eq!(it.next().unwrap(), b"aaaa");
    }

    #[test]
    fn dump_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.idx");

        let mut idx = index();
        idx.put(b"aaaa", 10).unwrap();
        idx.put(b"bbbb", 20).unwrap();
        idx.dump(&path).unwrap();

        let loaded = HandleIndex::load(&path, 4, Arc::new(NaturalOrder)).unwrap();
        assert_eq!(loaded.size(), 2);
        assert_eq!(loaded.get(b"aaaa"), Some(10));
        assert_eq!(loaded.get(b"bbbb"), Some(20));
    }

    #[test]
    fn load_rejects_wrong_key_length() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.idx");
        let mut idx = index();
        idx.put(b"aaaa", 10).unwrap();
        idx.dump(&path).unwrap();
        assert!(matches!(
            HandleIndex::load(&path, 8, Arc::new(NaturalOrder)),
            Err(HeapError::Corruption(_))
        ));
    }
}
