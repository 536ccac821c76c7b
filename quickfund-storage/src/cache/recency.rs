//! Sequence-based least-recently-used tracking.
//!
//! Keys live in an append-only slot vector ordered oldest to newest, with a
//! hash index from key to its slot. Touching a key tombstones its old slot
//! and appends a new one, so neither touching nor evicting ever walks the
//! whole key set. Tombstones accumulate until they pass the compaction
//! threshold, then the vector is rebuilt without them.
//!
//! Invariants:
//! - every tracked key occupies exactly one live slot, and the index points at it
//! - every slot before `offset` is a tombstone
//! - `size() == slots.len() - tombstones`

use std::collections::HashMap;
use std::hash::Hash;

use quickfund_core::RecencyError;
use serde::{Deserialize, Serialize};

/// Tombstone count above which the slot vector is compacted.
pub const COMPACTION_THRESHOLD: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot<K> {
    Live(K),
    Tombstone,
}

/// Serializable recency order, oldest key first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecencySnapshot<K> {
    pub keys: Vec<K>,
}

impl<K> Default for RecencySnapshot<K> {
    fn default() -> Self {
        Self { keys: Vec::new() }
    }
}

/// LRU order over keys of type `K`.
#[derive(Debug, Clone)]
pub struct RecencyList<K> {
    slots: Vec<Slot<K>>,
    index: HashMap<K, usize>,
    tombstones: usize,
    /// Every slot before this position is a tombstone.
    offset: usize,
    compaction_threshold: usize,
}

impl<K: Eq + Hash + Clone> Default for RecencyList<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> RecencyList<K> {
    pub fn new() -> Self {
        Self::with_compaction_threshold(COMPACTION_THRESHOLD)
    }

    pub fn with_compaction_threshold(threshold: usize) -> Self {
        Self {
            slots: Vec::new(),
            index: HashMap::new(),
            tombstones: 0,
            offset: 0,
            compaction_threshold: threshold,
        }
    }

    /// Mark `key` as the most recently used, inserting it if untracked.
    pub fn touch(&mut self, key: K) {
        if let Some(&old) = self.index.get(&key) {
            self.slots[old] = Slot::Tombstone;
            self.tombstones += 1;
        }
        self.slots.push(Slot::Live(key.clone()));
        self.index.insert(key, self.slots.len() - 1);
        self.maybe_compact();
    }

    /// Touch each key in order. A repeated key ends up at its last position.
    pub fn touch_many<I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = K>,
    {
        for key in keys {
            self.touch(key);
        }
    }

    /// Remove and return the least recently used key.
    pub fn evict_oldest(&mut self) -> Result<K, RecencyError> {
        let Some(pos) = self.slots[self.offset..]
            .iter()
            .position(|slot| matches!(slot, Slot::Live(_)))
            .map(|p| p + self.offset)
        else {
            self.offset = self.slots.len();
            return Err(RecencyError::Empty);
        };

        match std::mem::replace(&mut self.slots[pos], Slot::Tombstone) {
            Slot::Live(key) => {
                self.tombstones += 1;
                self.offset = pos + 1;
                self.index.remove(&key);
                self.maybe_compact();
                Ok(key)
            }
            Slot::Tombstone => Err(RecencyError::Corrupt {
                reason: "scan stopped on a tombstone".to_string(),
            }),
        }
    }

    /// Stop tracking `key`. Returns `false` if it was not tracked.
    pub fn remove(&mut self, key: &K) -> bool {
        match self.index.remove(key) {
            Some(pos) => {
                self.slots[pos] = Slot::Tombstone;
                self.tombstones += 1;
                self.maybe_compact();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Number of tracked keys.
    pub fn size(&self) -> usize {
        self.slots.len() - self.tombstones
    }

    pub fn len(&self) -> usize {
        self.size()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Drop all tombstones and rebuild the index. Order is preserved.
    pub fn compact(&mut self) {
        self.slots.retain(|slot| matches!(slot, Slot::Live(_)));
        self.index.clear();
        for (pos, slot) in self.slots.iter().enumerate() {
            if let Slot::Live(key) = slot {
                self.index.insert(key.clone(), pos);
            }
        }
        self.tombstones = 0;
        self.offset = 0;
    }

    fn maybe_compact(&mut self) {
        if self.tombstones > self.compaction_threshold {
            self.compact();
        }
    }

    /// Tracked keys, least recently used first.
    pub fn iter(&self) -> impl Iterator<Item = &K> + '_ {
        self.slots[self.offset..].iter().filter_map(|slot| match slot {
            Slot::Live(key) => Some(key),
            Slot::Tombstone => None,
        })
    }

    pub fn snapshot(&self) -> RecencySnapshot<K> {
        RecencySnapshot {
            keys: self.iter().cloned().collect(),
        }
    }

    /// Rebuild a list from a snapshot. Duplicate keys mean the snapshot
    /// was not produced by [`RecencyList::snapshot`].
    pub fn from_snapshot(snapshot: RecencySnapshot<K>) -> Result<Self, RecencyError> {
        let mut list = Self::new();
        list.slots.reserve(snapshot.keys.len());
        for key in snapshot.keys {
            if list.index.contains_key(&key) {
                return Err(RecencyError::Corrupt {
                    reason: "duplicate key in recency snapshot".to_string(),
                });
            }
            list.touch(key);
        }
        Ok(list)
    }

    /// Verify the internal invariants.
    pub fn check_invariants(&self) -> Result<(), RecencyError> {
        let corrupt = |reason: &str| RecencyError::Corrupt {
            reason: reason.to_string(),
        };

        if self.tombstones > self.slots.len() {
            return Err(corrupt("more tombstones than slots"));
        }
        if self.size() != self.index.len() {
            return Err(corrupt("live slot count differs from index size"));
        }
        if self.slots[..self.offset.min(self.slots.len())]
            .iter()
            .any(|slot| matches!(slot, Slot::Live(_)))
        {
            return Err(corrupt("live slot before scan offset"));
        }
        for (key, &pos) in &self.index {
            match self.slots.get(pos) {
                Some(Slot::Live(k)) if k == key => {}
                _ => return Err(corrupt("index entry does not point at its live slot")),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn drain<K: Eq + Hash + Clone>(list: &mut RecencyList<K>) -> Vec<K> {
        let mut out = Vec::new();
        while let Ok(key) = list.evict_oldest() {
            out.push(key);
        }
        out
    }

    /// Distinct keys ordered by their last occurrence in `seq`.
    fn by_last_occurrence(seq: &[u8]) -> Vec<u8> {
        let mut last = HashMap::new();
        for (i, k) in seq.iter().enumerate() {
            last.insert(*k, i);
        }
        let mut keys: Vec<u8> = last.keys().copied().collect();
        keys.sort_by_key(|k| last[k]);
        keys
    }

    #[test]
    fn test_touch_then_evict_in_lru_order() {
        let mut list = RecencyList::new();
        list.touch_many(["a", "b", "a", "c", "b"]);
        assert_eq!(list.size(), 3);
        assert_eq!(list.evict_oldest(), Ok("a"));
        assert_eq!(list.evict_oldest(), Ok("c"));
        assert_eq!(list.evict_oldest(), Ok("b"));
        assert_eq!(list.evict_oldest(), Err(RecencyError::Empty));
        assert!(list.is_empty());
    }

    #[test]
    fn test_evict_on_empty() {
        let mut list: RecencyList<u32> = RecencyList::new();
        assert_eq!(list.evict_oldest(), Err(RecencyError::Empty));
    }

    #[test]
    fn test_empty_eviction_skips_scanned_tombstones() {
        let mut list = RecencyList::new();
        list.touch_many([1u32, 2, 3]);
        for key in [1, 2, 3] {
            assert!(list.remove(&key));
        }
        assert_eq!(list.offset, 0);

        assert_eq!(list.evict_oldest(), Err(RecencyError::Empty));
        assert_eq!(list.offset, list.slots.len());
        assert!(list.check_invariants().is_ok());

        list.touch(4);
        assert_eq!(list.evict_oldest(), Ok(4));
    }

    #[test]
    fn test_single_key_touched_repeatedly() {
        let mut list = RecencyList::new();
        for _ in 0..500 {
            list.touch(7u32);
        }
        assert_eq!(list.size(), 1);
        assert!(list.slots.len() <= COMPACTION_THRESHOLD + 1);
        assert_eq!(list.evict_oldest(), Ok(7));
        assert_eq!(list.size(), 0);
    }

    #[test]
    fn test_compaction_triggered_past_threshold() {
        let mut list = RecencyList::with_compaction_threshold(3);
        list.touch_many([1u32, 2, 3]);
        list.touch_many([1, 2, 3]);
        assert_eq!(list.tombstones, 3);
        list.touch(1);
        assert_eq!(list.tombstones, 0);
        assert_eq!(list.offset, 0);
        assert_eq!(list.slots.len(), 3);
        assert_eq!(drain(&mut list), vec![2, 3, 1]);
    }

    #[test]
    fn test_remove() {
        let mut list = RecencyList::new();
        list.touch_many([1u32, 2, 3]);
        assert!(list.remove(&2));
        assert!(!list.remove(&2));
        assert!(!list.contains(&2));
        assert_eq!(drain(&mut list), vec![1, 3]);
    }

    #[test]
    fn test_snapshot_excludes_evicted() {
        let mut list = RecencyList::new();
        list.touch_many([1u32, 2, 3, 1]);
        list.evict_oldest().unwrap();
        assert_eq!(list.snapshot().keys, vec![3, 1]);
        assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec![3, 1]);
    }

    #[test]
    fn test_from_snapshot_rejects_duplicates() {
        let snapshot = RecencySnapshot { keys: vec![1u32, 2, 1] };
        assert!(matches!(
            RecencyList::from_snapshot(snapshot),
            Err(RecencyError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_snapshot_serde() {
        let mut list = RecencyList::new();
        list.touch_many(["000001".to_string(), "000002".to_string()]);
        let json = serde_json::to_string(&list.snapshot()).unwrap();
        let back: RecencySnapshot<String> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, list.snapshot());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_size_equals_distinct_keys(seq in prop::collection::vec(any::<u8>(), 0..600)) {
            let mut list = RecencyList::new();
            list.touch_many(seq.iter().copied());
            let distinct: HashSet<u8> = seq.iter().copied().collect();
            prop_assert_eq!(list.size(), distinct.len());
            prop_assert!(list.check_invariants().is_ok());
        }

        #[test]
        fn prop_eviction_follows_last_occurrence(seq in prop::collection::vec(0u8..32, 0..600)) {
            let mut list = RecencyList::new();
            list.touch_many(seq.iter().copied());
            prop_assert_eq!(drain(&mut list), by_last_occurrence(&seq));
        }

        #[test]
        fn prop_touch_evict_mix_keeps_invariants(
            ops in prop::collection::vec(prop_oneof![
                (0u8..16).prop_map(Some),
                Just(None),
            ], 0..800)
        ) {
            let mut list = RecencyList::with_compaction_threshold(8);
            let mut model: Vec<u8> = Vec::new();
            for op in ops {
                match op {
                    Some(k) => {
                        list.touch(k);
                        model.retain(|m| *m != k);
                        model.push(k);
                    }
                    None => {
                        let evicted = list.evict_oldest().ok();
                        let expected = if model.is_empty() { None } else { Some(model.remove(0)) };
                        prop_assert_eq!(evicted, expected);
                    }
                }
                prop_assert_eq!(list.size(), model.len());
                prop_assert!(list.check_invariants().is_ok());
            }
        }

        #[test]
        fn prop_compaction_preserves_order(seq in prop::collection::vec(0u8..64, 0..300), evictions in 0usize..20) {
            let mut list = RecencyList::new();
            list.touch_many(seq.iter().copied());
            for _ in 0..evictions {
                let _ = list.evict_oldest();
            }
            let mut compacted = list.clone();
            compacted.compact();
            prop_assert_eq!(compacted.size(), list.size());
            prop_assert!(compacted.check_invariants().is_ok());
            prop_assert_eq!(drain(&mut compacted), drain(&mut list));
        }

        #[test]
        fn prop_snapshot_restores_equivalent_list(seq in prop::collection::vec(0u8..64, 0..300)) {
            let mut list = RecencyList::new();
            list.touch_many(seq.iter().copied());
            let mut restored = RecencyList::from_snapshot(list.snapshot()).unwrap();
            prop_assert_eq!(restored.size(), list.size());
            prop_assert_eq!(drain(&mut restored), drain(&mut list));
        }
    }
}
