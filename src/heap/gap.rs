//! Gap Set
//!
//! The free list of a heap file: an ordered map from file offset to the size
//! of the free record stored there. Offsets are disjoint; directly adjacent
//! gaps are coalesced by the owning heap on every delete.
//!
//! The set can be dumped next to the data file on close and restored on the
//! next open. The dump is a flat sequence of `(i64 offset, i32 size)`
//! big-endian pairs, no header, parsed until EOF.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::Result;

/// Ordered map `file offset → free record size`
#[derive(Debug, Default)]
pub struct GapSet {
    map: BTreeMap<u64, u32>,
}

impl GapSet {
    /// Create an empty gap set
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a gap set from a dump written by [`GapSet::dump`]
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut map = BTreeMap::new();
        let mut pair = [0u8; 12];
        loop {
            match reader.read_exact(&mut pair) {
                Ok(()) => {
                    let offset = i64::from_be_bytes(pair[0..8].try_into().unwrap());
                    let size = i32::from_be_bytes(pair[8..12].try_into().unwrap());
                    map.insert(offset as u64, size as u32);
                }
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Self { map })
    }

    /// Write the gap set to `path` via a temp file and atomic rename
    pub fn dump(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("prt");
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            for (&offset, &size) in &self.map {
                writer.write_all(&(offset as i64).to_be_bytes())?;
                writer.write_all(&(size as i32).to_be_bytes())?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Register a free record of `size` bytes at `offset`
    pub fn put(&mut self, offset: u64, size: u32) {
        self.map.insert(offset, size);
    }

    /// Remove the gap at `offset`, returning its size
    pub fn remove(&mut self, offset: u64) -> Option<u32> {
        self.map.remove(&offset)
    }

    /// Size of the gap at `offset`, if one is registered there
    pub fn get(&self, offset: u64) -> Option<u32> {
        self.map.get(&offset).copied()
    }

    /// Gaps in offset order
    pub fn iter(&self) -> impl Iterator<Item = (u64, u32)> + '_ {
        self.map.iter().map(|(&o, &s)| (o, s))
    }

    /// All gaps strictly before `offset`, in offset order
    pub fn head(&self, offset: u64) -> impl Iterator<Item = (u64, u32)> + '_ {
        self.map.range(..offset).map(|(&o, &s)| (o, s))
    }

    /// The gap immediately preceding `offset`, if any
    pub fn last_before(&self, offset: u64) -> Option<(u64, u32)> {
        self.map.range(..offset).next_back().map(|(&o, &s)| (o, s))
    }

    /// The gap at the highest offset
    pub fn last(&self) -> Option<(u64, u32)> {
        self.map.iter().next_back().map(|(&o, &s)| (o, s))
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

    /// Total free bytes, including the 4-byte header of each gap record
    pub fn free_bytes(&self) -> u64 {
        self.map.values().map(|&s| 4 + s as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn put_get_remove_in_offset_order() {
        let mut gaps = GapSet::new();
        gaps.put(100, 8);
        gaps.put(20, 16);
        gaps.put(500, 4);
        assert_eq!(gaps.get(100), Some(8));
        let offsets: Vec<u64> = gaps.iter().map(|(o, _)| o).collect();
        assert_eq!(offsets, vec![20, 100, 500]);
        assert_eq!(gaps.remove(100), Some(8));
        assert_eq!(gaps.get(100), None);
        assert_eq!(gaps.size(), 2);
    }

    #[test]
    fn last_before_finds_preceding_gap() {
        let mut gaps = GapSet::new();
        gaps.put(10, 4);
        gaps.put(50, 4);
        assert_eq!(gaps.last_before(50), Some((10, 4)));
        assert_eq!(gaps.last_before(10), None);
        assert_eq!(gaps.last(), Some((50, 4)));
    }

    #[test]
    fn head_yields_gaps_before_offset() {
        let mut gaps = GapSet::new();
        gaps.put(10, 4);
        gaps.put(50, 4);
        gaps.put(90, 4);
        let before: Vec<u64> = gaps.head(90).map(|(o, _)| o).collect();
        assert_eq!(before, vec![10, 50]);
    }

    #[test]
    fn free_bytes_counts_headers() {
        let mut gaps = GapSet::new();
        gaps.put(0, 10);
        gaps.put(100, 0); // zero-length stub still owns its header
        assert_eq!(gaps.free_bytes(), 14 + 4);
    }

    #[test]
    fn dump_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.gap");

        let mut gaps = GapSet::new();
        gaps.put(0, 42);
        gaps.put(1000, 7);
        gaps.dump(&path).unwrap();

        let loaded = GapSet::load(&path).unwrap();
        assert_eq!(loaded.size(), 2);
        assert_eq!(loaded.get(0), Some(42));
        assert_eq!(loaded.get(1000), Some(7));
    }

    #[test]
    fn empty_dump_loads_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.gap");
        GapSet::new().dump(&path).unwrap();
        assert!(GapSet::load(&path).unwrap().is_empty());
    }
}
