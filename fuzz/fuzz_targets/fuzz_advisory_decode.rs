//! Fuzz target for advisory decoding.
//!
//! Decoding never panics, and anything that decodes re-encodes to a
//! document that decodes to the same advisory.

#![no_main]

use libfuzzer_sys::fuzz_target;
use stream_replicator::AgeAdvisory;

fuzz_target!(|data: &[u8]| {
    if let Ok(advisory) = AgeAdvisory::from_json(data) {
        let encoded = serde_json::to_vec(&advisory).expect("advisory encodes");
        let again = AgeAdvisory::from_json(&encoded).expect("re-decodes");
        assert_eq!(again.value, advisory.value);
        assert_eq!(again.event, advisory.event);
        assert_eq!(again.seen, advisory.seen);
    }
});
