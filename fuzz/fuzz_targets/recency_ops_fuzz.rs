//! Fuzz test for RecencyList operation sequences
//!
//! Each input byte is one operation: values below 200 touch key `byte % 40`,
//! 200..=249 evict the oldest key, 250..=255 force a compaction. A naive
//! vector model runs alongside and must agree on every eviction.
//!
//! Run with: cargo +nightly fuzz run recency_ops_fuzz -- -max_total_time=60

#![no_main]

use libfuzzer_sys::fuzz_target;
use quickfund_storage::RecencyList;

fuzz_target!(|data: &[u8]| {
    let mut list = RecencyList::with_compaction_threshold(16);
    let mut model: Vec<u8> = Vec::new();

    for &op in data {
        match op {
            0..=199 => {
                let key = op % 40;
                list.touch(key);
                model.retain(|k| *k != key);
                model.push(key);
            }
            200..=249 => {
                let evicted = list.evict_oldest().ok();
                let expected = if model.is_empty() {
                    None
                } else {
                    Some(model.remove(0))
                };
                assert_eq!(evicted, expected, "eviction order diverged from model");
            }
            _ => list.compact(),
        }

        assert_eq!(list.size(), model.len(), "size diverged from model");
        assert!(list.check_invariants().is_ok(), "internal invariants violated");
    }

    let order: Vec<u8> = list.iter().copied().collect();
    assert_eq!(order, model, "final order diverged from model");
});
