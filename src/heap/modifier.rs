//! Heap Modifier
//!
//! Adds in-place deletion and shrinking rewrites on top of [`HeapReader`].
//! Deleted records are zeroed on disk (their length header stays) and become
//! gaps; adjacent gaps are coalesced immediately.
//!
//! Gap merging is asymmetric on purpose: a delete merges with following gaps
//! recursively but with the preceding gap only once. A chain of deletes can
//! therefore leave a non-maximal gap pair behind; the reopen-time merge pass
//! picks those up.

use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::{error, info};

use crate::error::{HeapError, Result};
use crate::index::KeyIterator;
use crate::order::ByteOrder;

use super::reader::HeapReader;
use super::{read_reclen_at, write_reclen_at, zero_fill_at, RECORD_HEADER_LEN};

/// Read- and delete-capable access to a heap file
pub struct HeapModifier {
    pub(super) reader: HeapReader,
}

impl HeapModifier {
    /// Open a heap file for reading and deleting
    pub fn new(heap_file: &Path, key_length: usize, ordering: Arc<dyn ByteOrder>) -> Result<Self> {
        Ok(Self {
            reader: HeapReader::new(heap_file, key_length, ordering)?,
        })
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Remove the record for `key`. Deleting an absent key is a no-op.
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        let key = self.reader.normalize(key);
        self.delete_normalized(&key)
    }

    pub(super) fn delete_normalized(&mut self, key: &[u8]) -> Result<()> {
        let Some(pos) = self.reader.index()?.get(key) else {
            return Ok(());
        };
        if !self.reader.check_key(key, pos)? {
            error!(
                file = %self.reader.heap_file.display(),
                pos, "indexed position holds a foreign key, re-building index"
            );
            self.reader.reindex()?;
            let Some(pos) = self.reader.index()?.get(key) else {
                return Ok(());
            };
            return self.wipe_record(key, pos);
        }
        self.wipe_record(key, pos)
    }

    /// Zero the record body, register the gap, coalesce with neighbors
    fn wipe_record(&mut self, key: &[u8], pos: u64) -> Result<()> {
        let reclen = read_reclen_at(self.reader.file()?, pos)?;
        zero_fill_at(self.reader.file()?, pos + RECORD_HEADER_LEN, reclen as usize)?;
        self.reader.index_mut()?.remove(key);
        self.reader.gaps_mut()?.put(pos, reclen);
        self.merge_gaps_after(pos)?;
        self.merge_gap_before(pos)?;
        Ok(())
    }

    /// Absorb every gap directly following the one at `pos`, recursively.
    /// A zero-length stub gap still contributes its 4 header bytes.
    fn merge_gaps_after(&mut self, pos: u64) -> Result<()> {
        let file_len = self.reader.file_len()?;
        loop {
            let Some(size) = self.reader.gaps()?.get(pos) else {
                return Ok(());
            };
            let next = pos + RECORD_HEADER_LEN + size as u64;
            if next >= file_len {
                return Ok(());
            }
            let Some(next_size) = self.reader.gaps()?.get(next) else {
                return Ok(());
            };
            let merged = size + 4 + next_size;
            {
                let gaps = self.reader.gaps_mut()?;
                gaps.remove(next);
                gaps.put(pos, merged);
            }
            write_reclen_at(self.reader.file()?, pos, merged)?;
            // the absorbed header lies inside the gap payload now
            write_reclen_at(self.reader.file()?, next, 0)?;
        }
    }

    /// Merge the gap at `pos` into a directly preceding gap. One step only.
    fn merge_gap_before(&mut self, pos: u64) -> Result<()> {
        let Some(size) = self.reader.gaps()?.get(pos) else {
            return Ok(());
        };
        let Some((prev, prev_size)) = self.reader.gaps()?.last_before(pos) else {
            return Ok(());
        };
        if prev + RECORD_HEADER_LEN + prev_size as u64 != pos {
            return Ok(());
        }
        let merged = prev_size + 4 + size;
        {
            let gaps = self.reader.gaps_mut()?;
            gaps.remove(pos);
            gaps.put(prev, merged);
        }
        write_reclen_at(self.reader.file()?, prev, merged)?;
        write_reclen_at(self.reader.file()?, pos, 0)?;
        Ok(())
    }

    // =========================================================================
    // Reduce (shrink-in-place rewrite)
    // =========================================================================

    /// Rewrite the record for `key` with a payload produced by `reducer`.
    ///
    /// The new payload must have the same length (content rewrite in place) or
    /// be at least 4 bytes shorter, leaving room for the trailing gap record's
    /// header. A growing or 1–3 byte shrinking transform fails with
    /// `PolicyViolation` and the record stays unchanged.
    ///
    /// Returns the number of payload bytes freed.
    pub fn reduce<F>(&mut self, key: &[u8], reducer: F) -> Result<usize>
    where
        F: FnOnce(&[u8]) -> Vec<u8>,
    {
        let key = self.reader.normalize(key);
        let Some(payload) = self.reader.get_normalized(&key)? else {
            return Ok(0);
        };
        let reduced = reducer(&payload);
        if reduced.len() > payload.len() {
            return Err(HeapError::PolicyViolation(format!(
                "reduce grew payload from {} to {} bytes",
                payload.len(),
                reduced.len()
            )));
        }
        let freed = payload.len() - reduced.len();
        if freed > 0 && freed < 4 {
            return Err(HeapError::PolicyViolation(format!(
                "reduce freed {} bytes, too few for a gap record",
                freed
            )));
        }
        let Some(pos) = self.reader.index()?.get(&key) else {
            return Ok(0);
        };
        let key_length = self.reader.key_length;

        if freed == 0 {
            // equal length: the content may still differ, persist it
            let file = self.reader.file()?;
            file.seek(SeekFrom::Start(
                pos + RECORD_HEADER_LEN + key_length as u64,
            ))?;
            file.write_all(&reduced)?;
            return Ok(0);
        }

        let new_reclen = (key_length + reduced.len()) as u32;
        {
            let file = self.reader.file()?;
            file.seek(SeekFrom::Start(pos))?;
            file.write_all(&new_reclen.to_be_bytes())?;
            file.write_all(&key)?;
            file.write_all(&reduced)?;
        }
        // the freed space becomes a trailing gap record
        let gap_pos = pos + RECORD_HEADER_LEN + new_reclen as u64;
        let gap_size = (freed - 4) as u32;
        write_reclen_at(self.reader.file()?, gap_pos, gap_size)?;
        zero_fill_at(
            self.reader.file()?,
            gap_pos + RECORD_HEADER_LEN,
            gap_size as usize,
        )?;
        self.reader.gaps_mut()?.put(gap_pos, gap_size);
        self.merge_gaps_after(gap_pos)?;
        Ok(freed)
    }

    // =========================================================================
    // Whole-file operations
    // =========================================================================

    /// Truncate the file to zero length and reset index and gap set
    pub fn clear(&mut self) -> Result<()> {
        info!(file = %self.reader.heap_file.display(), "clearing heap");
        {
            let file = self.reader.file()?;
            file.set_len(0)?;
            file.sync_all()?;
        }
        self.reader.index_mut()?.clear();
        self.reader.gaps_mut()?.clear();
        Ok(())
    }

    /// Reclaim trailing free space: truncate the file while its very last
    /// record is a gap. No data moves.
    pub fn shrink_with_gaps_at_end(&mut self) -> Result<()> {
        loop {
            let file_len = self.reader.file_len()?;
            let Some((off, size)) = self.reader.gaps()?.last() else {
                return Ok(());
            };
            if off + RECORD_HEADER_LEN + size as u64 != file_len {
                return Ok(());
            }
            self.reader.file()?.set_len(off)?;
            self.reader.gaps_mut()?.remove(off);
        }
    }

    // =========================================================================
    // Read API (delegated)
    // =========================================================================

    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.reader.get(key)
    }

    pub fn length(&mut self, key: &[u8]) -> Result<Option<u64>> {
        self.reader.length(key)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.reader.contains_key(key)
    }

    pub fn size(&self) -> usize {
        self.reader.size()
    }

    pub fn is_empty(&self) -> bool {
        self.reader.is_empty()
    }

    pub fn smallest_key(&self) -> Option<Vec<u8>> {
        self.reader.smallest_key()
    }

    pub fn largest_key(&self) -> Option<Vec<u8>> {
        self.reader.largest_key()
    }

    pub fn first(&mut self) -> Result<Option<Vec<u8>>> {
        self.reader.first()
    }

    pub fn last(&mut self) -> Result<Option<Vec<u8>>> {
        self.reader.last()
    }

    pub fn key_iterator(&self, up: bool, rotating: bool) -> Result<KeyIterator> {
        self.reader.key_iterator(up, rotating)
    }

    pub fn keys_from(&self, up: bool, first_key: Option<&[u8]>) -> Result<KeyIterator> {
        self.reader.keys_from(up, first_key)
    }

    pub fn file_len(&self) -> Result<u64> {
        self.reader.file_len()
    }

    pub fn name(&self) -> String {
        self.reader.name()
    }

    pub fn location(&self) -> &Path {
        self.reader.location()
    }

    pub fn key_length(&self) -> usize {
        self.reader.key_length()
    }

    pub fn ordering(&self) -> Arc<dyn ByteOrder> {
        self.reader.ordering()
    }

    pub fn mem(&self) -> u64 {
        self.reader.mem()
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_closed()
    }

    pub fn close(&mut self, write_idx: bool) -> Result<()> {
        self.reader.close(write_idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::NaturalOrder;
    use std::fs;
    use std::io::Write as _;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn write_record(buf: &mut Vec<u8>, key: &[u8], payload: &[u8]) {
        let reclen = (key.len() + payload.len()) as u32;
        buf.extend_from_slice(&reclen.to_be_bytes());
        buf.extend_from_slice(key);
        buf.extend_from_slice(payload);
    }

    fn raw_heap(dir: &TempDir, records: &[(&[u8], &[u8])]) -> PathBuf {
        let path = dir.path().join("test.blob");
        let mut buf = Vec::new();
        for (k, p) in records {
            write_record(&mut buf, k, p);
        }
        fs::File::create(&path).unwrap().write_all(&buf).unwrap();
        path
    }

    fn modifier(path: &PathBuf) -> HeapModifier {
        HeapModifier::new(path, 4, Arc::new(NaturalOrder)).unwrap()
    }

    #[test]
    fn delete_zeroes_record_and_registers_gap() {
        let dir = TempDir::new().unwrap();
        let path = raw_heap(&dir, &[(b"aaaa", b"one"), (b"bbbb", b"twotwo")]);
        let mut m = modifier(&path);
        m.delete(b"aaaa").unwrap();
        assert!(!m.contains_key(b"aaaa"));
        assert_eq!(m.get(b"aaaa").unwrap(), None);
        assert_eq!(m.reader.gaps().unwrap().get(0), Some(7));
        // on-disk body is zeroed, header intact
        let raw = fs::read(&path).unwrap();
        assert_eq!(&raw[0..4], &7u32.to_be_bytes());
        assert!(raw[4..11].iter().all(|&b| b == 0));
        // the other record is untouched
        assert_eq!(m.get(b"bbbb").unwrap().unwrap(), b"twotwo");
    }

    #[test]
    fn delete_absent_key_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let path = raw_heap(&dir, &[(b"aaaa", b"one")]);
        let mut m = modifier(&path);
        m.delete(b"zzzz").unwrap();
        assert_eq!(m.size(), 1);
        assert!(m.reader.gaps().unwrap().is_empty());
    }

    #[test]
    fn delete_merges_forward_recursively() {
        let dir = TempDir::new().unwrap();
        // three records; delete middle, then first: the first's gap must
        // absorb the middle's gap in its forward pass
        let path = raw_heap(
            &dir,
            &[
                (b"aaaa", b"one"),    // 0..11
                (b"bbbb", b"two"),    // 11..22
                (b"cccc", b"threee"), // 22..
            ],
        );
        let mut m = modifier(&path);
        m.delete(b"bbbb").unwrap();
        m.delete(b"aaaa").unwrap();
        let gaps = m.reader.gaps().unwrap();
        assert_eq!(gaps.size(), 1);
        // 7 + 4 + 7
        assert_eq!(gaps.get(0), Some(18));
        assert_eq!(m.get(b"cccc").unwrap().unwrap(), b"threee");
    }

    #[test]
    fn delete_merges_backward_once() {
        let dir = TempDir::new().unwrap();
        let path = raw_heap(
            &dir,
            &[
                (b"aaaa", b"one"), // 0..11
                (b"bbbb", b"two"), // 11..22
                (b"cccc", b"xyz"), // 22..33
                (b"dddd", b"end"), // 33..
            ],
        );
        let mut m = modifier(&path);
        m.delete(b"aaaa").unwrap();
        m.delete(b"cccc").unwrap();
        // gaps at 0 and 22, not adjacent
        assert_eq!(m.reader.gaps().unwrap().size(), 2);
        // deleting bbbb merges forward into cccc's gap, then backward into
        // aaaa's gap: one maximal gap
        m.delete(b"bbbb").unwrap();
        let gaps = m.reader.gaps().unwrap();
        assert_eq!(gaps.size(), 1);
        assert_eq!(gaps.get(0), Some(7 + 4 + 7 + 4 + 7));
        assert_eq!(m.get(b"dddd").unwrap().unwrap(), b"end");
    }

    #[test]
    fn backward_merge_is_single_step_by_design() {
        // documents the asymmetry: gaps that become adjacent behind an
        // already-merged predecessor stay separate until reopen
        let dir = TempDir::new().unwrap();
        let path = raw_heap(
            &dir,
            &[
                (b"aaaa", b"one"), // 0..11
                (b"bbbb", b"two"), // 11..22
                (b"cccc", b"xyz"), // 22..33
                (b"dddd", b"end"), // 33..
            ],
        );
        let mut m = modifier(&path);
        // delete in ascending order: every delete merges backward once into
        // the growing front gap, so this order stays maximal...
        m.delete(b"aaaa").unwrap();
        m.delete(b"bbbb").unwrap();
        m.delete(b"cccc").unwrap();
        assert_eq!(m.reader.gaps().unwrap().size(), 1);

        // ...but an interleaved order exercises the forward recursion
        let path2 = {
            let p = dir.path().join("test2.blob");
            let mut buf = Vec::new();
            for (k, v) in [
                (b"aaaa", b"one"),
                (b"bbbb", b"two"),
                (b"cccc", b"xyz"),
                (b"dddd", b"end"),
            ] {
                write_record(&mut buf, k, v);
            }
            fs::File::create(&p).unwrap().write_all(&buf).unwrap();
            p
        };
        let mut m2 = HeapModifier::new(&path2, 4, Arc::new(NaturalOrder)).unwrap();
        m2.delete(b"cccc").unwrap();
        m2.delete(b"bbbb").unwrap(); // forward into cccc's gap
        m2.delete(b"aaaa").unwrap(); // forward into the merged gap
        let gaps = m2.reader.gaps().unwrap();
        assert_eq!(gaps.size(), 1);
        assert_eq!(gaps.get(0), Some(29));
    }

    #[test]
    fn reduce_shrinks_and_leaves_trailing_gap() {
        let dir = TempDir::new().unwrap();
        let path = raw_heap(&dir, &[(b"aaaa", b"0123456789"), (b"bbbb", b"x")]);
        let mut m = modifier(&path);
        let freed = m.reduce(b"aaaa", |_| b"012345".to_vec()).unwrap();
        assert_eq!(freed, 4);
        assert_eq!(m.get(b"aaaa").unwrap().unwrap(), b"012345");
        // gap record of size 0 right behind the shrunk record
        assert_eq!(m.reader.gaps().unwrap().get(14), Some(0));
        assert_eq!(m.get(b"bbbb").unwrap().unwrap(), b"x");
    }

    #[test]
    fn reduce_equal_length_persists_content() {
        let dir = TempDir::new().unwrap();
        let path = raw_heap(&dir, &[(b"aaaa", b"abcdef")]);
        let mut m = modifier(&path);
        let freed = m.reduce(b"aaaa", |_| b"ABCDEF".to_vec()).unwrap();
        assert_eq!(freed, 0);
        assert_eq!(m.get(b"aaaa").unwrap().unwrap(), b"ABCDEF");
        assert!(m.reader.gaps().unwrap().is_empty());
    }

    #[test]
    fn reduce_rejects_growth_and_leaves_record_unchanged() {
        let dir = TempDir::new().unwrap();
        let path = raw_heap(&dir, &[(b"aaaa", b"short")]);
        let mut m = modifier(&path);
        let err = m.reduce(b"aaaa", |_| b"much longer payload".to_vec());
        assert!(matches!(err, Err(HeapError::PolicyViolation(_))));
        assert_eq!(m.get(b"aaaa").unwrap().unwrap(), b"short");
    }

    #[test]
    fn reduce_rejects_tiny_shrink() {
        let dir = TempDir::new().unwrap();
        let path = raw_heap(&dir, &[(b"aaaa", b"abcdef")]);
        let mut m = modifier(&path);
        // freeing 2 bytes cannot hold a 4-byte gap header
        let err = m.reduce(b"aaaa", |_| b"abcd".to_vec());
        assert!(matches!(err, Err(HeapError::PolicyViolation(_))));
        assert_eq!(m.get(b"aaaa").unwrap().unwrap(), b"abcdef");
    }

    #[test]
    fn reduce_absent_key_frees_nothing() {
        let dir = TempDir::new().unwrap();
        let path = raw_heap(&dir, &[(b"aaaa", b"one")]);
        let mut m = modifier(&path);
        assert_eq!(m.reduce(b"zzzz", |p| p.to_vec()).unwrap(), 0);
    }

    #[test]
    fn shrink_truncates_trailing_gaps() {
        let dir = TempDir::new().unwrap();
        let path = raw_heap(
            &dir,
            &[
                (b"aaaa", b"one"), // 0..11
                (b"bbbb", b"two"), // 11..22
                (b"cccc", b"xyz"), // 22..33
            ],
        );
        let mut m = modifier(&path);
        m.delete(b"cccc").unwrap();
        m.delete(b"bbbb").unwrap(); // merges forward: one big trailing gap
        m.shrink_with_gaps_at_end().unwrap();
        assert_eq!(m.file_len().unwrap(), 11);
        assert!(m.reader.gaps().unwrap().is_empty());
        assert_eq!(m.get(b"aaaa").unwrap().unwrap(), b"one");
    }

    #[test]
    fn shrink_then_reopen_reproduces_live_keys() {
        let dir = TempDir::new().unwrap();
        let path = raw_heap(
            &dir,
            &[(b"aaaa", b"one"), (b"bbbb", b"two"), (b"cccc", b"xyz")],
        );
        {
            let mut m = modifier(&path);
            m.delete(b"bbbb").unwrap();
            m.shrink_with_gaps_at_end().unwrap();
            m.close(false).unwrap();
        }
        let mut m = modifier(&path);
        assert!(m.contains_key(b"aaaa"));
        assert!(!m.contains_key(b"bbbb"));
        assert!(m.contains_key(b"cccc"));
        assert_eq!(m.get(b"cccc").unwrap().unwrap(), b"xyz");
    }

    #[test]
    fn clear_resets_everything() {
        let dir = TempDir::new().unwrap();
        let path = raw_heap(&dir, &[(b"aaaa", b"one"), (b"bbbb", b"two")]);
        let mut m = modifier(&path);
        m.delete(b"aaaa").unwrap();
        m.clear().unwrap();
        assert_eq!(m.size(), 0);
        assert!(m.is_empty());
        assert_eq!(m.file_len().unwrap(), 0);
        assert!(m.reader.gaps().unwrap().is_empty());
    }

    #[test]
    fn gap_conservation_after_delete_sequence() {
        let dir = TempDir::new().unwrap();
        let path = raw_heap(
            &dir,
            &[
                (b"aaaa", b"one"),
                (b"bbbb", b"two"),
                (b"cccc", b"xyz"),
                (b"dddd", b"end"),
            ],
        );
        let mut m = modifier(&path);
        m.delete(b"bbbb").unwrap();
        m.delete(b"dddd").unwrap();
        // live bytes + gap bytes (headers included) account for the file
        let live: u64 = 2 * (4 + 7);
        let free = m.reader.gaps().unwrap().free_bytes();
        assert_eq!(live + free, m.file_len().unwrap());
    }
}
