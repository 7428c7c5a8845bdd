//! At-most-once bookkeeping for applied operations.
//!
//! Every recorded key carries the Lamport counter at which it was applied
//! (its *stamp*). Retention is bounded by a causal-stability watermark: once
//! the owner knows no operation stamped at or below `w` can still arrive, it
//! calls [`Deduplicator::advance_watermark`] and all entries stamped `<= w`
//! are dropped. Keys whose stamp is known up front (operation ids) are still
//! reported as duplicates after compaction through [`Deduplicator::is_settled`].

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Per-room set of applied operation keys with watermark compaction.
#[derive(Debug, Clone)]
pub struct Deduplicator<K> {
    /// key → stamp
    seen: HashMap<K, u64>,
    /// stamp → keys, for range compaction
    by_stamp: BTreeMap<u64, Vec<K>>,
    /// Everything stamped at or below this is settled.
    watermark: u64,
}

impl<K: Eq + Hash + Clone> Default for Deduplicator<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> Deduplicator<K> {
    pub fn new() -> Self {
        Self {
            seen: HashMap::new(),
            by_stamp: BTreeMap::new(),
            watermark: 0,
        }
    }

    /// Is `key` still retained as applied?
    pub fn contains(&self, key: &K) -> bool {
        self.seen.contains_key(key)
    }

    /// Is `stamp` at or below the causal-stability watermark?
    pub fn is_settled(&self, stamp: u64) -> bool {
        stamp <= self.watermark
    }

    /// Record `key` as applied at `stamp`.
    ///
    /// Returns `false` (and records nothing) if the key is already present
    /// or its stamp is already settled.
    pub fn record(&mut self, key: K, stamp: u64) -> bool {
        if self.is_settled(stamp) || self.seen.contains_key(&key) {
            return false;
        }
        self.by_stamp.entry(stamp).or_default().push(key.clone());
        self.seen.insert(key, stamp);
        true
    }

    /// Advance the watermark and drop every entry stamped `<= watermark`.
    ///
    /// The watermark never moves backwards. Returns the number of dropped keys.
    pub fn advance_watermark(&mut self, watermark: u64) -> usize {
        if watermark <= self.watermark {
            return 0;
        }
        self.watermark = watermark;

        let retained = self.by_stamp.split_off(&watermark.saturating_add(1));
        let settled = std::mem::replace(&mut self.by_stamp, retained);

        let mut dropped = 0;
        for key in settled.into_values().flatten() {
            self.seen.remove(&key);
            dropped += 1;
        }
        dropped
    }

    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    /// Number of retained keys.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
