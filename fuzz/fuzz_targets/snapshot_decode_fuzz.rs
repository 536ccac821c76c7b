//! Fuzz test for decoding persisted recency snapshots
//!
//! Stored snapshots are read back from disk, so arbitrary bytes must never
//! panic the decoder or produce a list that violates its invariants.
//!
//! Run with: cargo +nightly fuzz run snapshot_decode_fuzz -- -max_total_time=60

#![no_main]

use libfuzzer_sys::fuzz_target;
use quickfund_core::FundCode;
use quickfund_storage::{RecencyList, RecencySnapshot};

fuzz_target!(|data: &[u8]| {
    let Ok(snapshot) = serde_json::from_slice::<RecencySnapshot<FundCode>>(data) else {
        return;
    };

    // Every decoded code went through validation.
    for code in &snapshot.keys {
        assert!(FundCode::is_valid(code.as_str()));
    }

    if let Ok(list) = RecencyList::from_snapshot(snapshot.clone()) {
        assert!(list.check_invariants().is_ok());
        assert_eq!(list.snapshot(), snapshot, "restore must preserve order");
    }
});
