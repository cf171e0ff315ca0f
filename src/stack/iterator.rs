//! Cross-file key merging
//!
//! An array's global key sequence is a k-way merge of each member file's own
//! sorted iterator. Duplicate keys across files are possible transiently (for
//! example during a merge window) and are NOT removed here; deduplication is
//! the caller's concern.

use std::sync::Arc;

use crate::index::KeyIterator;
use crate::order::ByteOrder;

/// K-way merge of per-file sorted key iterators into one ordered sequence
pub struct MergedKeys {
    iters: Vec<KeyIterator>,
    /// Current head of each input, `None` when drained
    heads: Vec<Option<Vec<u8>>>,
    ordering: Arc<dyn ByteOrder>,
    up: bool,
}

impl MergedKeys {
    pub fn new(mut iters: Vec<KeyIterator>, ordering: Arc<dyn ByteOrder>, up: bool) -> Self {
        let heads = iters.iter_mut().map(|i| i.next()).collect();
        Self {
            iters,
            heads,
            ordering,
            up,
        }
    }
}

impl Iterator for MergedKeys {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        // linear scan over the heads: member counts are small
        let mut best: Option<usize> = None;
        for (i, head) in self.heads.iter().enumerate() {
            let Some(key) = head else { continue };
            match best {
                None => best = Some(i),
                Some(b) => {
                    let cmp = self
                        .ordering
                        .compare(key, self.heads[b].as_ref().expect("best head present"));
                    let better = if self.up {
                        cmp == std::cmp::Ordering::Less
                    } else {
                        cmp == std::cmp::Ordering::Greater
                    };
                    if better {
                        best = Some(i);
                    }
                }
            }
        }
        let i = best?;
        let key = self.heads[i].take();
        self.heads[i] = self.iters[i].next();
        key
    }
}
