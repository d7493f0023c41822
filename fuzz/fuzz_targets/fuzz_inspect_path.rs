//! Fuzz target for inspect-path extraction.
//!
//! Arbitrary payloads and paths must never panic, and a payload that is not
//! a JSON object always yields an empty value.

#![no_main]

use libfuzzer_sys::fuzz_target;
use stream_replicator::limiter::path;

fuzz_target!(|data: (&[u8], &str, Option<&str>)| {
    let (payload, inspect, update_flag) = data;

    let extracted = path::extract(payload, inspect, update_flag);

    if serde_json::from_slice::<serde_json::Value>(payload).is_err() {
        assert!(extracted.value.is_empty());
        assert!(extracted.update.is_none());
    }

    // Splitting is total
    let _ = path::split(inspect);
});
