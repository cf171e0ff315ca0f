//! Array/Shard Manager
//!
//! A directory of time-partitioned heap files managed as one logical BLOB
//! store. New records always go to the newest file; a new file is started when
//! the current one trips its age or size limit, so deleting old content is a
//! matter of dropping whole files. Lookups fan out across every member file.
//!
//! ## Responsibilities
//! - Discover member files on startup, garbage-collect leftovers
//! - Route inserts to the newest (only writable) file, roll over on limits
//! - Fan lookups out concurrently, deletes to every file
//! - Pick and merge member files for compaction

mod iterator;
pub mod merge;
mod pool;

pub use iterator::MergedKeys;
pub use merge::MergeFn;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::config::StackConfig;
use crate::error::{HeapError, Result};
use crate::heap::{Heap, HeapModifier, HeapWriter};
use crate::index::KeyIterator;
use crate::memory;
use crate::order::ByteOrder;

use pool::{Job, LookupPool};

/// Timestamp layout embedded in member file names: `YYYYMMDDhhmmssSSS`
const TS_FORMAT: &str = "%Y%m%d%H%M%S%3f";
const TS_LEN: usize = 17;

/// Length of a dump companion suffix: `.<fingerprint12>.idx` / `.gap`
const DUMP_SUFFIX_LEN: usize = 2 + crate::heap::fingerprint::FINGERPRINT_LEN + 3;

/// Best-match search gives up after this many pair comparisons once a
/// good-enough candidate exists
const BEST_MATCH_COMPARISONS: usize = 1000;

/// Smallest-file search stops early after this many members
const SMALLEST_SCAN_MAX: usize = 70;

// =============================================================================
// Member Files
// =============================================================================

/// One member file of the array: writable only while it is the newest
pub(crate) enum MemberBlob {
    Writable(Heap),
    ReadOnly(HeapModifier),
}

impl MemberBlob {
    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self {
            Self::Writable(h) => h.get(key),
            Self::ReadOnly(m) => m.get(key),
        }
    }

    fn insert(&mut self, key: &[u8], payload: &[u8]) -> Result<()> {
        match self {
            Self::Writable(h) => h.insert(key, payload),
            Self::ReadOnly(m) => Err(HeapError::PolicyViolation(format!(
                "{} is open read/delete-only",
                m.name()
            ))),
        }
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        match self {
            Self::Writable(h) => h.delete(key),
            Self::ReadOnly(m) => m.delete(key),
        }
    }

    fn contains_key(&self, key: &[u8]) -> bool {
        match self {
            Self::Writable(h) => h.contains_key(key),
            Self::ReadOnly(m) => m.contains_key(key),
        }
    }

    fn length(&mut self, key: &[u8]) -> Result<Option<u64>> {
        match self {
            Self::Writable(h) => h.length(key),
            Self::ReadOnly(m) => m.length(key),
        }
    }

    fn reduce(&mut self, key: &[u8], reducer: impl FnOnce(&[u8]) -> Vec<u8>) -> Result<usize> {
        match self {
            Self::Writable(h) => h.reduce(key, reducer),
            Self::ReadOnly(m) => m.reduce(key, reducer),
        }
    }

    fn size(&self) -> usize {
        match self {
            Self::Writable(h) => h.size(),
            Self::ReadOnly(m) => m.size(),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Self::Writable(h) => h.is_empty(),
            Self::ReadOnly(m) => m.is_empty(),
        }
    }

    fn key_iterator(&mut self, up: bool) -> Result<KeyIterator> {
        match self {
            Self::Writable(h) => h.key_iterator(up, false),
            Self::ReadOnly(m) => m.key_iterator(up, false),
        }
    }

    fn keys_from(&mut self, up: bool, first_key: Option<&[u8]>) -> Result<KeyIterator> {
        match self {
            Self::Writable(h) => h.keys_from(up, first_key),
            Self::ReadOnly(m) => m.keys_from(up, first_key),
        }
    }

    fn mem(&self) -> u64 {
        match self {
            Self::Writable(h) => h.mem(),
            Self::ReadOnly(m) => m.mem(),
        }
    }

    fn clear(&mut self) -> Result<()> {
        match self {
            Self::Writable(h) => h.clear(),
            Self::ReadOnly(m) => m.clear(),
        }
    }

    fn close(&mut self, write_idx: bool) -> Result<()> {
        match self {
            Self::Writable(h) => h.close(write_idx),
            Self::ReadOnly(m) => m.close(write_idx),
        }
    }
}

/// List entry: creation time (from the file name), location, open blob
#[derive(Clone)]
struct BlobItem {
    creation: DateTime<Utc>,
    location: PathBuf,
    writable: bool,
    blob: Arc<Mutex<MemberBlob>>,
}

// =============================================================================
// ArrayStack
// =============================================================================

/// A directory of time-partitioned heap files acting as one BLOB store
pub struct ArrayStack {
    heap_location: PathBuf,
    prefix: String,
    ordering: Arc<dyn ByteOrder>,
    config: StackConfig,
    /// Members in creation order; only the last may be writable
    blobs: Mutex<Vec<BlobItem>>,
    /// Fan-out pool for cross-file lookups
    pool: LookupPool,
}

impl ArrayStack {
    /// Open (or create) the array directory and mount every member file.
    ///
    /// Startup garbage-collects `.tmp`/`.prt` leftovers, orphaned dump files
    /// and empty members, and migrates legacy `YYYYMMDDhhmmss.blob` names.
    pub fn new(
        heap_location: &Path,
        prefix: &str,
        ordering: Arc<dyn ByteOrder>,
        config: StackConfig,
    ) -> Result<Self> {
        if heap_location.exists() {
            if !heap_location.is_dir() {
                return Err(HeapError::Io(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!(
                        "array directory {} is blocked by a file with the same name",
                        heap_location.display()
                    ),
                )));
            }
        } else {
            fs::create_dir_all(heap_location)?;
        }

        let stack = Self {
            heap_location: heap_location.to_path_buf(),
            prefix: prefix.to_string(),
            ordering,
            config,
            blobs: Mutex::new(Vec::new()),
            pool: LookupPool::new(prefix),
        };

        stack.collect_garbage()?;
        stack.migrate_legacy_names()?;
        stack.mount_all()?;
        Ok(stack)
    }

    /// Remove temp/partial files and dump files whose data file is gone
    fn collect_garbage(&self) -> Result<()> {
        let names: Vec<String> = self.list_names()?;
        let present: std::collections::HashSet<&str> =
            names.iter().map(|s| s.as_str()).collect();
        for name in &names {
            let path = self.heap_location.join(name);
            if name.ends_with(".tmp") || name.ends_with(".prt") {
                let _ = fs::remove_file(&path);
                continue;
            }
            if name.ends_with(".idx.gz") || name.ends_with(".gap.gz") {
                // compressed dumps from older deployments are never read
                let _ = fs::remove_file(&path);
                continue;
            }
            if name.ends_with(".idx") || name.ends_with(".gap") {
                // companion name is `<datafile>.<fingerprint12>.<ext>`
                if name.len() > DUMP_SUFFIX_LEN {
                    let base = &name[..name.len() - DUMP_SUFFIX_LEN];
                    if !present.contains(base) {
                        let _ = fs::remove_file(&path);
                    }
                }
            }
        }
        Ok(())
    }

    /// Rename `YYYYMMDDhhmmss.blob` members into the current scheme;
    /// empty members are deleted outright
    fn migrate_legacy_names(&self) -> Result<()> {
        for name in self.list_names()? {
            if !name.ends_with(".blob") {
                continue;
            }
            let path = self.heap_location.join(&name);
            if fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(false) {
                let _ = fs::remove_file(&path);
                continue;
            }
            let stem = &name[..name.len() - ".blob".len()];
            if stem.len() == 14 && stem.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(naive) = NaiveDateTime::parse_from_str(stem, "%Y%m%d%H%M%S") {
                    let creation = Utc.from_utc_datetime(&naive);
                    let target = self.member_path(creation);
                    info!(from = %name, to = %target.display(), "migrating legacy member name");
                    let _ = fs::rename(&path, &target);
                }
            }
        }
        Ok(())
    }

    /// Open every member; the newest (by embedded timestamp) opens writable
    fn mount_all(&self) -> Result<()> {
        let mut members: Vec<(DateTime<Utc>, PathBuf)> = Vec::new();
        for name in self.list_names()? {
            if let Some(creation) = self.parse_member_name(&name) {
                members.push((creation, self.heap_location.join(&name)));
            }
        }
        members.sort_by_key(|(t, _)| *t);
        let max_time = members.last().map(|(t, _)| *t);

        let mut items = Vec::with_capacity(members.len());
        for (creation, location) in members {
            let writable = Some(creation) == max_time && self.config.buffer_max > 0;
            match self.open_member(&location, writable) {
                Ok(blob) => items.push(BlobItem {
                    creation,
                    location,
                    writable,
                    blob: Arc::new(Mutex::new(blob)),
                }),
                Err(e) => {
                    if self.config.delete_on_fail {
                        warn!(
                            file = %location.display(),
                            error = %e,
                            "cannot read member file, deleting it"
                        );
                        HeapWriter::delete_with_companions(&location);
                    } else {
                        return Err(e);
                    }
                }
            }
        }
        *self.blobs.lock() = items;
        Ok(())
    }

    fn open_member(&self, location: &Path, writable: bool) -> Result<MemberBlob> {
        Ok(if writable {
            MemberBlob::Writable(Heap::new(
                location,
                self.config.key_length,
                self.ordering.clone(),
                self.config.buffer_max,
            )?)
        } else {
            MemberBlob::ReadOnly(HeapModifier::new(
                location,
                self.config.key_length,
                self.ordering.clone(),
            )?)
        })
    }

    // =========================================================================
    // Naming
    // =========================================================================

    /// Member path for a creation time: `<prefix>.<YYYYMMDDhhmmssSSS>.blob`
    pub fn new_blob_file(&self, creation: DateTime<Utc>) -> PathBuf {
        self.member_path(creation)
    }

    fn member_path(&self, creation: DateTime<Utc>) -> PathBuf {
        self.heap_location.join(format!(
            "{}.{}.blob",
            self.prefix,
            creation.format(TS_FORMAT)
        ))
    }

    fn parse_member_name(&self, name: &str) -> Option<DateTime<Utc>> {
        let rest = name.strip_prefix(self.prefix.as_str())?.strip_prefix('.')?;
        let ts = rest.strip_suffix(".blob")?;
        if ts.len() != TS_LEN || !ts.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        NaiveDateTime::parse_from_str(ts, TS_FORMAT)
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive))
    }

    fn list_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.heap_location)? {
            let entry = entry?;
            if entry.path().is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(names)
    }

    pub fn name(&self) -> String {
        self.heap_location
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.heap_location.display().to_string())
    }

    pub fn location(&self) -> &Path {
        &self.heap_location
    }

    pub fn key_length(&self) -> usize {
        self.config.key_length
    }

    pub fn ordering(&self) -> Arc<dyn ByteOrder> {
        self.ordering.clone()
    }

    // =========================================================================
    // Insert / Rollover
    // =========================================================================

    /// Store `payload` under `key` in the newest member file, starting a new
    /// file first when the current one is missing, over-age, over-size, or
    /// not writable. Afterwards the repository limits are enforced.
    pub fn insert(&self, key: &[u8], payload: &[u8]) -> Result<()> {
        let mut blobs = self.blobs.lock();
        let now = Utc::now();
        let needs_new = match blobs.last() {
            None => true,
            Some(item) => {
                !item.writable
                    || (now - item.creation)
                        > Duration::milliseconds(self.config.file_age_limit_ms)
                    || fs::metadata(&item.location).map(|m| m.len()).unwrap_or(0)
                        > self.config.file_size_limit
            }
        };
        if needs_new {
            let item = self.new_member(now)?;
            blobs.push(item);
        }
        blobs
            .last()
            .expect("member file just ensured")
            .blob
            .lock()
            .insert(key, payload)?;
        self.execute_limits(&mut blobs);
        Ok(())
    }

    /// Create and open a fresh writable member file
    fn new_member(&self, now: DateTime<Utc>) -> Result<BlobItem> {
        // bump the millisecond until the name is unused
        let mut creation = now;
        let mut location = self.member_path(creation);
        while location.exists() {
            creation = creation + Duration::milliseconds(1);
            location = self.member_path(creation);
        }
        let writable = self.config.buffer_max > 0;
        let blob = self.open_member(&location, writable)?;
        info!(file = %location.display(), "started new member file");
        Ok(BlobItem {
            creation,
            location,
            writable,
            blob: Arc::new(Mutex::new(blob)),
        })
    }

    /// Enforce repository age and size maxima by dropping the oldest members
    fn execute_limits(&self, blobs: &mut Vec<BlobItem>) {
        let now = Utc::now();
        while let Some(first) = blobs.first() {
            let over_age = (now - first.creation).num_milliseconds()
                .saturating_sub(self.config.file_age_limit_ms)
                > self.config.repository_age_max_ms;
            if !over_age {
                break;
            }
            let item = blobs.remove(0);
            info!(file = %item.location.display(), "dropping member file over repository age");
            if let Err(e) = item.blob.lock().close(false) {
                warn!(file = %item.location.display(), error = %e, "error closing evicted member");
            }
            HeapWriter::delete_with_companions(&item.location);
        }
        while !blobs.is_empty() && Self::bytes_of(blobs) > self.config.repository_size_max {
            let item = blobs.remove(0);
            info!(file = %item.location.display(), "dropping member file over repository size");
            if let Err(e) = item.blob.lock().close(false) {
                warn!(file = %item.location.display(), error = %e, "error closing evicted member");
            }
            HeapWriter::delete_with_companions(&item.location);
        }
    }

    fn bytes_of(blobs: &[BlobItem]) -> u64 {
        blobs
            .iter()
            .map(|b| fs::metadata(&b.location).map(|m| m.len()).unwrap_or(0))
            .sum()
    }

    // =========================================================================
    // Lookups (fan-out)
    // =========================================================================

    /// Read the payload stored under `key` from whichever member answers
    /// first. With concurrent duplicates across files the winner is the
    /// fastest file, not a deterministic choice.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let items = self.snapshot();
        match items.len() {
            0 => Ok(None),
            1 => items[0].blob.lock().get(key),
            _ => {
                // the newest file most probably holds the key
                if let Some(p) = items.last().expect("non-empty").blob.lock().get(key)? {
                    return Ok(Some(p));
                }
                if items.len() == 2 {
                    return items[0].blob.lock().get(key);
                }
                self.fan_out(&items[..items.len() - 1], key, |blob, key| {
                    blob.lock().get(key)
                })
            }
        }
    }

    /// Whether any member holds `key`
    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        let items = self.snapshot();
        match items.len() {
            0 => Ok(false),
            1 => Ok(items[0].blob.lock().contains_key(key)),
            _ => {
                if items.last().expect("non-empty").blob.lock().contains_key(key) {
                    return Ok(true);
                }
                if items.len() == 2 {
                    return Ok(items[0].blob.lock().contains_key(key));
                }
                let hit = self.fan_out(&items[..items.len() - 1], key, |blob, key| {
                    Ok(blob.lock().contains_key(key).then(Vec::new))
                })?;
                Ok(hit.is_some())
            }
        }
    }

    /// Dispatch one probe per member onto the pool, first non-null result
    /// wins. Rejected submissions run inline on the calling thread.
    fn fan_out<F>(&self, items: &[BlobItem], key: &[u8], probe: F) -> Result<Option<Vec<u8>>>
    where
        F: Fn(&Arc<Mutex<MemberBlob>>, &[u8]) -> Result<Option<Vec<u8>>> + Send + Sync + 'static,
    {
        let probe = Arc::new(probe);
        let (tx, rx) = crossbeam::channel::unbounded();
        for item in items {
            let blob = item.blob.clone();
            let key = key.to_vec();
            let tx = tx.clone();
            let probe = probe.clone();
            let job: Job = Box::new(move || {
                let _ = tx.send((probe.as_ref())(&blob, &key));
            });
            if let Err(job) = self.pool.submit(job) {
                // pool saturated or gone: degrade to inline execution
                job();
            }
        }
        drop(tx);

        let mut first_err = None;
        for result in rx.iter() {
            match result {
                Ok(Some(payload)) => return Ok(Some(payload)),
                Ok(None) => {}
                Err(e) => first_err = first_err.or(Some(e)),
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    /// Declared payload length of `key`, first member that knows it
    pub fn length(&self, key: &[u8]) -> Result<Option<u64>> {
        for item in self.snapshot() {
            if let Some(len) = item.blob.lock().length(key)? {
                return Ok(Some(len));
            }
        }
        Ok(None)
    }

    /// Every payload stored under `key` across all members, lazily.
    /// Useful while a merge window may hold transient duplicates.
    pub fn get_all(&self, key: &[u8]) -> AllValues {
        AllValues {
            items: self.snapshot(),
            pos: 0,
            key: key.to_vec(),
        }
    }

    // =========================================================================
    // Delete / Reduce
    // =========================================================================

    /// Remove `key` from every member file; absent keys are a no-op.
    /// One thread per file minus one; the calling thread handles the last.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let items = self.snapshot();
        if items.is_empty() {
            return Ok(());
        }
        if items.len() == 1 {
            return items[0].blob.lock().delete(key);
        }
        std::thread::scope(|scope| {
            let (last, rest) = items.split_last().expect("len >= 2");
            let mut handles = Vec::with_capacity(rest.len());
            for item in rest {
                let blob = item.blob.clone();
                let location = item.location.clone();
                handles.push(scope.spawn(move || {
                    if let Err(e) = blob.lock().delete(key) {
                        warn!(file = %location.display(), error = %e, "delete failed on member");
                    }
                }));
            }
            if let Err(e) = last.blob.lock().delete(key) {
                warn!(file = %last.location.display(), error = %e, "delete failed on member");
            }
            for handle in handles {
                let _ = handle.join();
            }
        });
        Ok(())
    }

    /// Apply a shrink-only rewrite to `key` in every member.
    /// Returns the total number of payload bytes freed.
    pub fn reduce<F>(&self, key: &[u8], reducer: F) -> Result<usize>
    where
        F: Fn(&[u8]) -> Vec<u8>,
    {
        let mut freed = 0;
        for item in self.snapshot() {
            freed += item.blob.lock().reduce(key, &reducer)?;
        }
        Ok(freed)
    }

    // =========================================================================
    // Iteration / Stats
    // =========================================================================

    /// Globally ordered key sequence: a k-way merge of every member's sorted
    /// iterator. Duplicates across files are not removed here.
    pub fn merged_keys(&self, up: bool) -> Result<MergedKeys> {
        let items = self.snapshot();
        let mut iters = Vec::with_capacity(items.len());
        for item in &items {
            iters.push(item.blob.lock().key_iterator(up)?);
        }
        Ok(MergedKeys::new(iters, self.ordering.clone(), up))
    }

    /// Like [`ArrayStack::merged_keys`], starting at `first_key`
    pub fn merged_keys_from(&self, up: bool, first_key: Option<&[u8]>) -> Result<MergedKeys> {
        let items = self.snapshot();
        let mut iters = Vec::with_capacity(items.len());
        for item in &items {
            iters.push(item.blob.lock().keys_from(up, first_key)?);
        }
        Ok(MergedKeys::new(iters, self.ordering.clone(), up))
    }

    /// Number of live records across all members
    pub fn size(&self) -> usize {
        self.snapshot().iter().map(|i| i.blob.lock().size()).sum()
    }

    /// Per-member record counts, oldest first
    pub fn sizes(&self) -> Vec<usize> {
        self.snapshot().iter().map(|i| i.blob.lock().size()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().iter().all(|i| i.blob.lock().is_empty())
    }

    /// Number of member files
    pub fn entries(&self) -> usize {
        self.blobs.lock().len()
    }

    /// Total bytes of all member files
    pub fn total_bytes(&self) -> u64 {
        Self::bytes_of(&self.blobs.lock())
    }

    /// Approximate resident memory of all member indexes
    pub fn mem(&self) -> u64 {
        self.snapshot().iter().map(|i| i.blob.lock().mem()).sum()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Delete every record and every member file
    pub fn clear(&self) -> Result<()> {
        let mut blobs = self.blobs.lock();
        for item in blobs.drain(..) {
            let mut blob = item.blob.lock();
            blob.clear()?;
            blob.close(false)?;
            HeapWriter::delete_with_companions(&item.location);
        }
        Ok(())
    }

    /// Close every member; `write_idx` controls dump writing
    pub fn close(&self, write_idx: bool) -> Result<()> {
        let mut blobs = self.blobs.lock();
        for item in blobs.drain(..) {
            if let Err(e) = item.blob.lock().close(write_idx) {
                warn!(file = %item.location.display(), error = %e, "error closing member");
            }
        }
        Ok(())
    }

    // =========================================================================
    // Compaction
    // =========================================================================

    /// Pick the two member files whose sizes match best (ratio heuristic),
    /// unmount them without dumps, and return their paths for merging.
    ///
    /// `maxq` caps the accepted `max/min` size ratio; `max_result_size` caps
    /// the combined size of the merged result. The pair search exits early
    /// once it has done over 1000 comparisons with an acceptable candidate.
    pub fn unmount_best_match(&self, maxq: f64, max_result_size: u64) -> Option<(PathBuf, PathBuf)> {
        let mut blobs = self.blobs.lock();
        if blobs.len() < 2 {
            return None;
        }
        let max_each = max_result_size >> 1;
        let lens: Vec<u64> = blobs
            .iter()
            .map(|b| fs::metadata(&b.location).map(|m| m.len()).unwrap_or(0))
            .collect();
        let mut min_q = f64::MAX;
        let mut best: Option<(usize, usize)> = None;
        let mut comparisons = 0;
        'main: for i in 0..blobs.len() - 1 {
            for j in i + 1..blobs.len() {
                comparisons += 1;
                let l = 1 + (lens[i] >> 1);
                let r = 1 + (lens[j] >> 1);
                if l + r > max_each {
                    continue;
                }
                let needed = blobs[i].blob.lock().mem() + blobs[j].blob.lock().mem();
                if !memory::request(needed) {
                    continue;
                }
                let q = l.max(r) as f64 / l.min(r) as f64;
                if q < min_q {
                    min_q = q;
                    best = Some((i, j));
                }
                if comparisons > BEST_MATCH_COMPARISONS && min_q <= maxq && best.is_some() {
                    break 'main;
                }
            }
        }
        if min_q > maxq {
            return None;
        }
        let (i, j) = best?;
        // remove the higher index first so the lower one stays valid
        let item_j = blobs.remove(j);
        let item_i = blobs.remove(i);
        drop(blobs);
        self.close_unmounted(&item_j);
        self.close_unmounted(&item_i);
        Some((item_i.location, item_j.location))
    }

    /// Unmount the two smallest member files whose combined size fits
    /// `max_result_size`
    pub fn unmount_smallest(&self, max_result_size: u64) -> Option<(PathBuf, PathBuf)> {
        let mut blobs = self.blobs.lock();
        if blobs.len() < 2 {
            return None;
        }
        let first = Self::smallest_member(&blobs, None, max_result_size)?;
        let first_len = fs::metadata(&blobs[first].location).map(|m| m.len()).unwrap_or(0);
        let second = Self::smallest_member(
            &blobs,
            Some(first),
            max_result_size.saturating_sub(first_len),
        )?;
        // remove the higher index first
        let (a, b) = if first > second { (first, second) } else { (second, first) };
        let item_a = blobs.remove(a);
        let item_b = blobs.remove(b);
        drop(blobs);
        self.close_unmounted(&item_a);
        self.close_unmounted(&item_b);
        // keep (first, second) order of discovery
        if first > second {
            Some((item_a.location, item_b.location))
        } else {
            Some((item_b.location, item_a.location))
        }
    }

    fn smallest_member(blobs: &[BlobItem], excluding: Option<usize>, max_size: u64) -> Option<usize> {
        let mut best: Option<(usize, u64)> = None;
        for (i, item) in blobs.iter().enumerate() {
            if Some(i) == excluding {
                continue;
            }
            let len = fs::metadata(&item.location).map(|m| m.len()).unwrap_or(0);
            if best.map(|(_, b)| len < b).unwrap_or(true) {
                best = Some((i, len));
            }
            if i > SMALLEST_SCAN_MAX {
                if let Some((_, b)) = best {
                    if b <= max_size {
                        break;
                    }
                }
            }
        }
        best.filter(|&(_, len)| len <= max_size).map(|(i, _)| i)
    }

    /// Unmount the oldest member file if it is older than the per-file age
    /// limit; returns its path
    pub fn unmount_oldest(&self) -> Option<PathBuf> {
        let mut blobs = self.blobs.lock();
        let first = blobs.first()?;
        if (Utc::now() - first.creation).num_milliseconds() < self.config.file_age_limit_ms {
            return None;
        }
        let item = blobs.remove(0);
        drop(blobs);
        self.close_unmounted(&item);
        Some(item.location)
    }

    fn close_unmounted(&self, item: &BlobItem) {
        // the file is about to be merged or deleted, a dump would be wasted
        if let Err(e) = item.blob.lock().close(false) {
            warn!(file = %item.location.display(), error = %e, "error closing unmounted member");
        }
    }

    /// Mount a member file produced outside the normal rollover (merge
    /// output). The name must follow the member naming scheme. Mounted files
    /// are read/delete-only unless `writable` and they become the newest.
    pub fn mount(&self, location: &Path, writable: bool) -> Result<()> {
        let name = location
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let Some(creation) = self.parse_member_name(&name) else {
            return Err(HeapError::PolicyViolation(format!(
                "file name {} does not match the member naming scheme",
                name
            )));
        };
        let mut blobs = self.blobs.lock();
        let open_writable =
            writable && self.config.buffer_max > 0 && blobs.last().map(|b| b.creation < creation).unwrap_or(true);
        let blob = self.open_member(location, open_writable)?;
        let item = BlobItem {
            creation,
            location: location.to_path_buf(),
            writable: open_writable,
            blob: Arc::new(Mutex::new(blob)),
        };
        // keep creation order so the newest member stays last
        let at = blobs.partition_point(|b| b.creation <= creation);
        blobs.insert(at, item);
        Ok(())
    }

    /// Unmount a specific member file by path; returns whether it was found
    pub fn unmount_file(&self, location: &Path, write_idx: bool) -> bool {
        let mut blobs = self.blobs.lock();
        let Some(pos) = blobs.iter().position(|b| b.location == location) else {
            error!(file = %location.display(), "file cannot be unmounted, not mounted");
            return false;
        };
        let item = blobs.remove(pos);
        drop(blobs);
        if let Err(e) = item.blob.lock().close(write_idx) {
            warn!(file = %item.location.display(), error = %e, "error closing unmounted member");
        }
        true
    }

    /// Merge two unmounted files (or rewrite one when `f2` is `None`) into
    /// `new_file` and mount the result read-only. Returns the mounted path;
    /// failures are logged and leave no partial output behind.
    pub fn merge_mount(
        &self,
        f1: &Path,
        f2: Option<&Path>,
        merge_fn: &MergeFn,
        new_file: &Path,
        write_buffer: usize,
    ) -> Option<PathBuf> {
        let result = match f2 {
            Some(f2) => {
                info!(f1 = %f1.display(), f2 = %f2.display(), "merging member files");
                merge::merge_worker(
                    f1,
                    f2,
                    self.config.key_length,
                    self.ordering.clone(),
                    merge_fn,
                    new_file,
                    write_buffer,
                )
            }
            None => {
                info!(f1 = %f1.display(), "rewriting member file");
                merge::rewrite_worker(
                    f1,
                    self.config.key_length,
                    self.ordering.clone(),
                    new_file,
                    write_buffer,
                )
            }
        };
        match result {
            Ok(Some(path)) => match self.mount(&path, false) {
                Ok(()) => {
                    info!(out = %path.display(), "merge result mounted");
                    Some(path)
                }
                Err(e) => {
                    warn!(out = %path.display(), error = %e, "merge succeeded but the result cannot be mounted");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                error!(error = %e, "merge failed");
                None
            }
        }
    }

    fn snapshot(&self) -> Vec<BlobItem> {
        self.blobs.lock().clone()
    }
}

/// Lazy iterator over every member's payload for one key
pub struct AllValues {
    items: Vec<BlobItem>,
    pos: usize,
    key: Vec<u8>,
}

impl Iterator for AllValues {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.items.len() {
            let item = &self.items[self.pos];
            self.pos += 1;
            match item.blob.lock().get(&self.key) {
                Ok(Some(payload)) => return Some(payload),
                Ok(None) => {}
                Err(e) => {
                    error!(
                        file = %item.location.display(),
                        error = %e,
                        "read failed while collecting all values"
                    );
                    return None;
                }
            }
        }
        None
    }
}
