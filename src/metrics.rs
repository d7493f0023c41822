//! Metrics for observability.
//!
//! Emits through the `metrics` facade; the embedding binary installs the
//! exporter. Covers:
//! - Worker throughput (received, copied, failed, acks)
//! - Connection lifecycle (reconnects, closes, errors)
//! - Dedup limiter decisions and cache size
//! - Advisories by event kind
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `stream_replicator_`:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration)
//!
//! Every metric carries a `link` label; worker metrics add `worker`.
//!
//! # Usage
//!
//! ```rust,no_run
//! use stream_replicator::metrics;
//! use std::time::Duration;
//!
//! metrics::record_received("orders_link", "0", 512);
//! metrics::record_processing_time("orders_link", "0", Duration::from_millis(3));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Worker
// ═══════════════════════════════════════════════════════════════════════════════

/// Record a message delivered to a worker.
pub fn record_received(link: &str, worker: &str, bytes: usize) {
    counter!("stream_replicator_received_msgs_total", "link" => link.to_string(), "worker" => worker.to_string())
        .increment(1);
    counter!("stream_replicator_received_bytes_total", "link" => link.to_string(), "worker" => worker.to_string())
        .increment(bytes as u64);
}

/// Record a message published to the target.
pub fn record_copied(link: &str, worker: &str, bytes: usize) {
    counter!("stream_replicator_copied_msgs_total", "link" => link.to_string(), "worker" => worker.to_string())
        .increment(1);
    counter!("stream_replicator_copied_bytes_total", "link" => link.to_string(), "worker" => worker.to_string())
        .increment(bytes as u64);
}

/// Record a failed publish to the target.
pub fn record_copy_failed(link: &str, worker: &str) {
    counter!("stream_replicator_failed_msgs_total", "link" => link.to_string(), "worker" => worker.to_string())
        .increment(1);
}

/// Record a failed acknowledgment on the source.
pub fn record_ack_failed(link: &str, worker: &str) {
    counter!("stream_replicator_acks_failed_total", "link" => link.to_string(), "worker" => worker.to_string())
        .increment(1);
}

/// Set the last source sequence a worker handled.
pub fn set_current_sequence(link: &str, worker: &str, sequence: u64) {
    gauge!("stream_replicator_current_sequence", "link" => link.to_string(), "worker" => worker.to_string())
        .set(sequence as f64);
}

/// Record time spent handling one delivered message.
pub fn record_processing_time(link: &str, worker: &str, duration: Duration) {
    histogram!("stream_replicator_processing_time_seconds", "link" => link.to_string(), "worker" => worker.to_string())
        .record(duration.as_secs_f64());
}

/// Record a worker that exited with an error.
pub fn record_worker_failed(link: &str) {
    counter!("stream_replicator_worker_failures_total", "link" => link.to_string()).increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Connector
// ═══════════════════════════════════════════════════════════════════════════════

/// Record a transport reconnect performed by the broker client.
pub fn record_reconnection(link: &str, connection: &str) {
    counter!(
        "stream_replicator_connector_reconnections_total",
        "link" => link.to_string(),
        "connection" => connection.to_string()
    )
    .increment(1);
}

/// Record a durable session rebuilt after it was lost.
pub fn record_stream_reconnection(link: &str, connection: &str) {
    counter!(
        "stream_replicator_connector_stream_reconnections_total",
        "link" => link.to_string(),
        "connection" => connection.to_string()
    )
    .increment(1);
}

/// Record a transport that closed.
pub fn record_connection_closed(link: &str, connection: &str) {
    counter!(
        "stream_replicator_connector_closed_total",
        "link" => link.to_string(),
        "connection" => connection.to_string()
    )
    .increment(1);
}

/// Record an asynchronous transport error or a failed connect attempt.
pub fn record_connection_error(link: &str, connection: &str) {
    counter!(
        "stream_replicator_connector_errors_total",
        "link" => link.to_string(),
        "connection" => connection.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Limiter
// ═══════════════════════════════════════════════════════════════════════════════

/// Record a message suppressed by the dedup window.
pub fn record_limiter_skipped(link: &str) {
    counter!("stream_replicator_limiter_skipped_total", "link" => link.to_string()).increment(1);
}

/// Record a message allowed through the dedup window.
pub fn record_limiter_passed(link: &str) {
    counter!("stream_replicator_limiter_passed_total", "link" => link.to_string()).increment(1);
}

/// Record a continuation that returned an error.
pub fn record_limiter_error(link: &str) {
    counter!("stream_replicator_limiter_errors_total", "link" => link.to_string()).increment(1);
}

/// Record a snapshot read or write failure.
pub fn record_snapshot_failure(link: &str, operation: &str) {
    counter!(
        "stream_replicator_limiter_snapshot_failures_total",
        "link" => link.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Set the number of keys in the dedup cache.
pub fn set_limiter_seen(link: &str, count: usize) {
    gauge!("stream_replicator_limiter_seen", "link" => link.to_string()).set(count as f64);
}

/// Record entries dropped by eviction.
pub fn record_limiter_evicted(link: &str, count: usize) {
    counter!("stream_replicator_limiter_evicted_total", "link" => link.to_string()).increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Advisor
// ═══════════════════════════════════════════════════════════════════════════════

/// Record an advisory raised for `event` (timeout, recover, expire).
pub fn record_advisory(link: &str, event: &str) {
    counter!(
        "stream_replicator_advisories_total",
        "link" => link.to_string(),
        "event" => event.to_string()
    )
    .increment(1);
}

/// Record a failed advisory publish attempt.
pub fn record_advisory_publish_error(link: &str) {
    counter!("stream_replicator_advisor_publish_errors_total", "link" => link.to_string()).increment(1);
}

/// Record an advisory given up on (queue full or retries exhausted).
pub fn record_advisory_dropped(link: &str, reason: &str) {
    counter!(
        "stream_replicator_advisories_dropped_total",
        "link" => link.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Replicator
// ═══════════════════════════════════════════════════════════════════════════════

/// Set replicator state (for dashboards).
pub fn set_replicator_state(link: &str, state: &str) {
    // Reset all states to 0, then set current to 1
    for s in &["Created", "Connecting", "Running", "ShuttingDown", "Stopped", "Failed"] {
        gauge!("stream_replicator_state", "link" => link.to_string(), "state" => *s).set(0.0);
    }
    gauge!("stream_replicator_state", "link" => link.to_string(), "state" => state.to_string()).set(1.0);
}

/// Set the number of running workers.
pub fn set_running_workers(link: &str, count: usize) {
    gauge!("stream_replicator_running_workers", "link" => link.to_string()).set(count as f64);
}
