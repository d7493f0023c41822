//! Fuzz target for backoff delay calculation.
//!
//! Tests that delays never overflow or panic, stay under the cap, and never
//! shrink from one attempt to the next.

#![no_main]

use libfuzzer_sys::fuzz_target;
use std::time::Duration;
use stream_replicator::BackoffPolicy;

fuzz_target!(|data: (u64, u64, f64, usize)| {
    let (initial_ms, max_ms, factor, attempt) = data;
    if !factor.is_finite() || factor < 1.0 {
        return;
    }

    let policy = BackoffPolicy {
        max_attempts: usize::MAX,
        initial_delay: Duration::from_millis(initial_ms % 600_000),
        max_delay: Duration::from_millis(max_ms % 600_000),
        backoff_factor: factor,
    };

    let delay = policy.delay_for_attempt(attempt);
    assert!(delay <= policy.max_delay);
    assert!(delay <= policy.delay_for_attempt(attempt.saturating_add(1)));
});
