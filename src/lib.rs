//! # Stream Replicator
//!
//! Copies messages from a topic on a durable pub/sub source cluster to the
//! same subject on a target cluster, at-least-once.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                          Replicator (per link)                            │
//! │                                                                           │
//! │  ┌──────────────────┐   ┌──────────────┐   ┌───────────────────────────┐  │
//! │  │ Worker × N       │──►│ Dedup limiter│──►│ publish to target, ack src│  │
//! │  │ (durable sub)    │   │ (inspect key)│   │                           │  │
//! │  └──────────────────┘   └──────────────┘   └───────────────────────────┘  │
//! │         │                      │                                          │
//! │         ▼                      ▼                                          │
//! │  ┌──────────────────┐   ┌──────────────┐                                  │
//! │  │ StreamConnection │   │ Advisor      │──► timeout / recover advisories  │
//! │  │ (reconnect+replay│   │ (liveness)   │                                  │
//! │  └──────────────────┘   └──────────────┘                                  │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery
//!
//! A message is acked on the source only after the copy was published or the
//! limiter decided to skip it. Anything else is redelivered by the broker.
//! There is no exactly-once delivery and no ordering across keys.
//!
//! ## Brokers
//!
//! The broker is a capability ([`broker::BrokerClient`]). Two implementations
//! ship with the crate: an in-process [`broker::memory::MemoryBroker`] and a
//! Redis Streams adapter, [`broker::redis_streams::RedisBroker`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use stream_replicator::broker::redis_streams::RedisBroker;
//! use stream_replicator::{Replicator, ReplicatorConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config: ReplicatorConfig =
//!         serde_json::from_str(&std::fs::read_to_string("replicator.json").unwrap()).unwrap();
//!
//!     let mut replicator = Replicator::new(config, "registration", Arc::new(RedisBroker::new()));
//!     replicator.start().await.expect("Failed to start");
//!
//!     tokio::signal::ctrl_c().await.unwrap();
//!     replicator.shutdown().await;
//! }
//! ```

pub mod advisor;
pub mod broker;
pub mod config;
pub mod connector;
pub mod coordinator;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod resilience;
pub mod worker;

// Re-exports for convenience
pub use advisor::{Advisor, AdvisoryEvent, AgeAdvisory};
pub use broker::{BrokerClient, BrokerError, Message};
pub use config::{LinkConfig, LinkSettings, ReplicatorConfig};
pub use connector::StreamConnection;
pub use coordinator::{HealthCheck, Replicator, ReplicatorState};
pub use error::{ReplicationError, Result};
pub use limiter::{Inspector, MemoryLimiter, PassThrough};
pub use resilience::BackoffPolicy;
pub use worker::Worker;
