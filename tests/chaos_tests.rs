// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: inject broker failures and verify the replicator recovers.
//!
//! These tests verify the system handles failures without panics,
//! deadlocks, or lost messages.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::*;
use std::collections::BTreeSet;
use std::time::Duration;
use stream_replicator::broker::memory::MemoryBroker;
use stream_replicator::config::AdvisoryConfig;
use stream_replicator::ReplicatorState;
use tokio::time::sleep;

// =============================================================================
// Publish Failures
// =============================================================================

/// Test: A failed copy is not acked, is redelivered, and is copied exactly once.
#[tokio::test]
async fn failed_copy_is_redelivered() {
    init_tracing();
    let broker = MemoryBroker::with_ack_wait(Duration::from_millis(50));
    broker.fail_next_publishes("west", 2).await;

    let mut replicator = replicator(&broker, config(None, plain_link()));
    replicator.start().await.unwrap();

    broker.publish_direct("east", TOPIC, b"important").await;
    assert!(wait_for_acks(&broker, "east", 1).await);
    replicator.shutdown().await;

    assert_eq!(broker.messages("west", TOPIC).await, vec![b"important".to_vec()]);
    assert!(broker.delivery_count("east").await >= 3);
}

/// Test: A failed copy leaves the dedup cache untouched so the retry is copied.
#[tokio::test]
async fn failed_copy_does_not_poison_dedup_cache() {
    let broker = MemoryBroker::with_ack_wait(Duration::from_millis(50));
    broker.fail_next_publishes("west", 1).await;

    let mut replicator = replicator(&broker, config(None, dedup_link("1h")));
    replicator.start().await.unwrap();

    broker.publish_direct("east", TOPIC, br#"{"sender": "x"}"#).await;
    assert!(wait_for_acks(&broker, "east", 1).await);

    let limiter = replicator.limiter().expect("limiter configured");
    assert!(limiter.last_processed("x").await.is_some());
    replicator.shutdown().await;

    assert_eq!(broker.messages("west", TOPIC).await.len(), 1);
}

/// Test: Ack failures are survivable; the message is redelivered and deduplicated.
#[tokio::test]
async fn ack_failure_leads_to_duplicate_skip() {
    let broker = MemoryBroker::with_ack_wait(Duration::from_millis(50));
    broker.fail_next_acks("east", 1).await;

    let mut replicator = replicator(&broker, config(None, dedup_link("1h")));
    replicator.start().await.unwrap();

    broker.publish_direct("east", TOPIC, br#"{"sender": "x"}"#).await;
    assert!(wait_for_acks(&broker, "east", 1).await);
    replicator.shutdown().await;

    // Redelivery was skipped by the limiter and then acked.
    assert_eq!(broker.messages("west", TOPIC).await.len(), 1);
    assert!(broker.delivery_count("east").await >= 2);
}

// =============================================================================
// Connection Failures
// =============================================================================

/// Test: Workers keep retrying the initial connect until the broker is reachable.
#[tokio::test]
async fn initial_connect_failures_are_retried() {
    let broker = MemoryBroker::new();
    broker.fail_next_transport_connects(4);
    broker.fail_next_session_connects("east", 2).await;

    let mut replicator = replicator(&broker, config(None, plain_link()));
    replicator.start().await.unwrap();

    broker.publish_direct("east", TOPIC, b"eventually").await;
    assert!(wait_for_acks(&broker, "east", 1).await);
    replicator.shutdown().await;

    assert!(broker.transport_connects() >= 2);
    assert_eq!(broker.messages("west", TOPIC).await.len(), 1);
}

/// Test: Losing the source session replays the subscription and copying resumes.
#[tokio::test]
async fn source_session_loss_resumes_copying() {
    init_tracing();
    let broker = MemoryBroker::new();
    let mut replicator = replicator(&broker, config(None, plain_link()));
    replicator.start().await.unwrap();

    broker.publish_direct("east", TOPIC, b"before").await;
    assert!(wait_for_acks(&broker, "east", 1).await);

    assert_eq!(broker.drop_sessions("east").await, 1);
    let b = &broker;
    assert!(eventually(Duration::from_secs(5), || async move { b.open_sessions("east").await == 1 }).await);

    broker.publish_direct("east", TOPIC, b"after").await;
    assert!(wait_for_acks(&broker, "east", 2).await);
    replicator.shutdown().await;

    assert_eq!(
        broker.messages("west", TOPIC).await,
        vec![b"before".to_vec(), b"after".to_vec()]
    );
}

/// Test: Losing the target session only delays copies.
#[tokio::test]
async fn target_session_loss_resumes_copying() {
    let broker = MemoryBroker::with_ack_wait(Duration::from_millis(50));
    let mut replicator = replicator(&broker, config(None, plain_link()));
    replicator.start().await.unwrap();

    broker.publish_direct("east", TOPIC, b"one").await;
    assert!(wait_for_acks(&broker, "east", 1).await);

    broker.drop_sessions("west").await;
    broker.publish_direct("east", TOPIC, b"two").await;
    assert!(wait_for_acks(&broker, "east", 2).await);
    replicator.shutdown().await;

    assert_eq!(broker.messages("west", TOPIC).await.len(), 2);
}

/// Test: Transport bounces do not disturb an established session.
#[tokio::test]
async fn transport_bounce_is_harmless() {
    let broker = MemoryBroker::new();
    let mut replicator = replicator(&broker, config(None, plain_link()));
    replicator.start().await.unwrap();

    broker.publish_direct("east", TOPIC, b"one").await;
    assert!(wait_for_acks(&broker, "east", 1).await);
    broker.bounce_transports().await;
    broker.publish_direct("east", TOPIC, b"two").await;
    assert!(wait_for_acks(&broker, "east", 2).await);

    replicator.shutdown().await;
    assert_eq!(broker.messages("west", TOPIC).await.len(), 2);
}

/// Test: Shutdown while every connect is failing still completes.
#[tokio::test]
async fn shutdown_during_connect_storm() {
    let broker = MemoryBroker::new();
    broker.fail_next_transport_connects(usize::MAX);

    let mut config = config(None, plain_link());
    if let Some(link) = config.topics.get_mut(LINK) {
        link.workers = 4;
    }
    let mut replicator = replicator(&broker, config);
    replicator.start().await.unwrap();
    sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(5), replicator.shutdown())
        .await
        .expect("shutdown should not hang");
    assert_eq!(replicator.state(), ReplicatorState::Stopped);
    assert_eq!(replicator.running_workers(), 0);
}

// =============================================================================
// Queue Groups
// =============================================================================

/// Test: Several workers share one queue group; every message is copied once.
#[tokio::test]
async fn queue_group_splits_work() {
    init_tracing();
    let broker = MemoryBroker::new();
    let mut config = config(None, plain_link());
    if let Some(link) = config.topics.get_mut(LINK) {
        link.workers = 3;
    }
    let mut replicator = replicator(&broker, config);
    replicator.start().await.unwrap();
    assert_eq!(
        replicator.settings().and_then(|s| s.queue_group.clone()).as_deref(),
        Some("acme_registration_stream_replicator_grp")
    );

    for i in 0..30 {
        broker.publish_direct("east", TOPIC, format!("m{}", i).as_bytes()).await;
    }
    assert!(wait_for_acks(&broker, "east", 30).await);
    replicator.shutdown().await;

    let copied = broker.messages("west", TOPIC).await;
    assert_eq!(copied.len(), 30);
    let unique: BTreeSet<Vec<u8>> = copied.into_iter().collect();
    assert_eq!(unique.len(), 30);
}

// =============================================================================
// Advisory Publishing
// =============================================================================

/// Test: Advisory publish failures never block replication.
#[tokio::test]
async fn advisory_publish_failures_do_not_block_copies() {
    init_tracing();
    let broker = MemoryBroker::new();
    // Advisories go to the source side so copy publishes are unaffected.
    broker.fail_next_publishes("east", usize::MAX).await;

    let link = stream_replicator::LinkConfig {
        advisory: Some(AdvisoryConfig {
            target: "acme.advisories".into(),
            cluster: "source".into(),
            age: "50ms".into(),
        }),
        ..dedup_link("1h")
    };
    let mut replicator = replicator(&broker, config(None, link));
    replicator.start().await.unwrap();

    for sender in ["a", "b", "c"] {
        broker
            .publish_direct("east", TOPIC, format!(r#"{{"sender": "{}"}}"#, sender).as_bytes())
            .await;
    }
    assert!(wait_for_acks(&broker, "east", 3).await);

    // Let a few sweeps raise timeouts that cannot be published.
    sleep(Duration::from_millis(200)).await;
    assert!(replicator.advisor().is_timed_out("a").await);

    tokio::time::timeout(Duration::from_secs(10), replicator.shutdown())
        .await
        .expect("shutdown should not hang");

    assert_eq!(broker.messages("west", TOPIC).await.len(), 3);
    assert!(broker.messages("east", "acme.advisories").await.is_empty());
}

/// Test: A transient advisory publish failure is retried.
#[tokio::test]
async fn advisory_publish_is_retried() {
    let broker = MemoryBroker::new();
    let link = with_advisories(dedup_link("1h"), "acme.advisories", "50ms");
    let mut replicator = replicator(&broker, config(None, link));
    replicator.start().await.unwrap();

    broker.publish_direct("east", TOPIC, br#"{"sender": "x"}"#).await;
    assert!(wait_for_acks(&broker, "east", 1).await);
    assert!(wait_for_messages(&broker, "west", TOPIC, 1).await);

    // Only advisories publish on west from here on.
    broker.fail_next_publishes("west", 3).await;
    assert!(wait_for_messages(&broker, "west", "acme.advisories", 1).await);
    replicator.shutdown().await;
}
