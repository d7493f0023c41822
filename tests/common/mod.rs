//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - Link configuration builders for the memory broker
//! - Polling helpers for asynchronous assertions

#![allow(dead_code)]

pub mod containers;

pub use containers::*;

use std::future::Future;
use std::path::Path;
use std::time::Duration;
use stream_replicator::broker::memory::MemoryBroker;
use stream_replicator::config::{AdvisoryConfig, LinkConfig, ReplicatorConfig};
use stream_replicator::Replicator;
use std::sync::Arc;

/// Subject replicated by most tests.
pub const TOPIC: &str = "acme.registration";

/// Key the test links are registered under.
pub const LINK: &str = "registration";

/// Install a tracing subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A plain link from cluster `east` to cluster `west`.
pub fn plain_link() -> LinkConfig {
    LinkConfig::for_testing(TOPIC, "east", "west")
}

/// A link deduplicating on `sender` with the given age.
pub fn dedup_link(age: &str) -> LinkConfig {
    LinkConfig {
        inspect: "sender".into(),
        update_flag: "changed".into(),
        age: age.into(),
        ..plain_link()
    }
}

/// Add advisories on `subject` to `link`, published on the target side.
pub fn with_advisories(link: LinkConfig, subject: &str, age: &str) -> LinkConfig {
    LinkConfig {
        advisory: Some(AdvisoryConfig {
            target: subject.into(),
            cluster: "target".into(),
            age: age.into(),
        }),
        ..link
    }
}

/// Process config holding one link under [`LINK`].
pub fn config(state_dir: Option<&Path>, link: LinkConfig) -> ReplicatorConfig {
    let mut config = match state_dir {
        Some(dir) => ReplicatorConfig::for_testing(dir),
        None => ReplicatorConfig::default(),
    };
    config.topics.insert(LINK.into(), link);
    config
}

/// Replicator over `broker` with fast timers.
pub fn replicator(broker: &MemoryBroker, config: ReplicatorConfig) -> Replicator {
    Replicator::new(config, LINK, Arc::new(broker.clone())).with_fast_timers()
}

/// Poll `check` every 10ms until it returns true or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until `cluster` has recorded at least `n` acks.
pub async fn wait_for_acks(broker: &MemoryBroker, cluster: &str, n: u64) -> bool {
    eventually(Duration::from_secs(5), || async move { broker.ack_count(cluster).await >= n }).await
}

/// Wait until `subject` on `cluster` holds at least `n` messages.
pub async fn wait_for_messages(broker: &MemoryBroker, cluster: &str, subject: &str, n: usize) -> bool {
    eventually(Duration::from_secs(5), || async move { broker.messages(cluster, subject).await.len() >= n }).await
}
