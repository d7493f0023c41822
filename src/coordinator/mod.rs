// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replicator: one running link.
//!
//! The composition root that ties together:
//! - The [`Advisor`](crate::advisor::Advisor) and its publish connection
//! - The dedup limiter ([`MemoryLimiter`] or [`PassThrough`])
//! - `workers` [`Worker`] copy loops
//!
//! # Lifecycle
//!
//! 1. [`Replicator::start`] validates the link, starts the advisor, loads the
//!    dedup snapshot and spawns the workers
//! 2. Workers connect in the background and copy until shutdown
//! 3. [`Replicator::shutdown`] broadcasts cancellation and waits for every
//!    task, including the limiter's final snapshot
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> stream_replicator::Result<()> {
//! use stream_replicator::broker::memory::MemoryBroker;
//! use stream_replicator::config::{LinkConfig, ReplicatorConfig};
//! use stream_replicator::Replicator;
//! use std::sync::Arc;
//!
//! let mut config = ReplicatorConfig::default();
//! config.topics.insert("orders".into(), LinkConfig::for_testing("acme.orders", "east", "west"));
//!
//! let mut replicator = Replicator::new(config, "orders", Arc::new(MemoryBroker::new()));
//! replicator.start().await?;
//! // ...
//! replicator.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod types;

pub use types::{HealthCheck, ReplicatorState};

use crate::advisor::Advisor;
use crate::broker::BrokerClient;
use crate::config::{LinkSettings, ReplicatorConfig};
use crate::error::{ReplicationError, Result};
use crate::limiter::{Inspector, MemoryLimiter, PassThrough};
use crate::metrics;
use crate::worker::Worker;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long each background task gets to finish during shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Replicates one configured link.
pub struct Replicator {
    /// Full process configuration
    config: ReplicatorConfig,

    /// Key of the link in `config.topics`
    link: String,

    broker: Arc<dyn BrokerClient>,

    /// Shrink timers after setup (tests)
    fast_timers: bool,

    /// Validated link, set by `start()`
    settings: Option<Arc<LinkSettings>>,

    advisor: Advisor,

    limiter: Option<MemoryLimiter>,

    /// State (broadcast to watchers)
    state_tx: watch::Sender<ReplicatorState>,
    state_rx: watch::Receiver<ReplicatorState>,

    /// Shutdown signal shared by every task
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    /// Worker tasks still alive
    running_workers: Arc<AtomicUsize>,

    handles: Vec<JoinHandle<()>>,
}

impl Replicator {
    /// Create a replicator for the link registered as `link` in `config`.
    ///
    /// Nothing is validated or started until [`start()`](Self::start).
    pub fn new(config: ReplicatorConfig, link: impl Into<String>, broker: Arc<dyn BrokerClient>) -> Self {
        let (state_tx, state_rx) = watch::channel(ReplicatorState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            link: link.into(),
            broker,
            fast_timers: false,
            settings: None,
            advisor: Advisor::disabled(),
            limiter: None,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            running_workers: Arc::new(AtomicUsize::new(0)),
            handles: Vec::new(),
        }
    }

    /// Use millisecond timers for every retry and periodic task.
    pub fn with_fast_timers(mut self) -> Self {
        self.fast_timers = true;
        self
    }

    /// Get current state.
    pub fn state(&self) -> ReplicatorState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ReplicatorState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), ReplicatorState::Running)
    }

    /// Validated link settings, once started.
    pub fn settings(&self) -> Option<&LinkSettings> {
        self.settings.as_deref()
    }

    pub fn advisor(&self) -> &Advisor {
        &self.advisor
    }

    /// The dedup limiter, when the link configures one.
    pub fn limiter(&self) -> Option<&MemoryLimiter> {
        self.limiter.as_ref()
    }

    /// Number of worker tasks still running.
    pub fn running_workers(&self) -> usize {
        self.running_workers.load(Ordering::SeqCst)
    }

    /// Link name used in logs and metrics.
    fn display_name(&self) -> &str {
        self.settings.as_ref().map(|s| s.name.as_str()).unwrap_or(&self.link)
    }

    fn set_state(&self, state: ReplicatorState) {
        self.state_tx.send_replace(state);
        metrics::set_replicator_state(self.display_name(), &state.to_string());
    }

    /// Get health status for monitoring endpoints.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let workers_total = self.settings.as_ref().map(|s| s.workers).unwrap_or(0);
        let workers_running = self.running_workers();

        let limiter_entries = match &self.limiter {
            Some(limiter) => Some(limiter.len().await),
            None => None,
        };
        let advisor_tracked = if self.advisor.is_enabled() {
            Some(self.advisor.tracked().await)
        } else {
            None
        };

        HealthCheck {
            state,
            ready: state == ReplicatorState::Running && workers_total > 0 && workers_running == workers_total,
            workers_total,
            workers_running,
            limiter_entries,
            advisor_tracked,
        }
    }

    /// Start replicating.
    ///
    /// 1. Validates the link (state becomes `Failed` on error)
    /// 2. Starts the advisor when an advisory target is configured
    /// 3. Builds the limiter, loads its snapshot and starts its tasks
    /// 4. Spawns the workers
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != ReplicatorState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        self.set_state(ReplicatorState::Connecting);

        let settings = match self.config.link(&self.link) {
            Ok(settings) if self.fast_timers => settings.with_fast_timers(),
            Ok(settings) => settings,
            Err(e) => {
                error!(link = %self.link, error = %e, "Invalid link configuration");
                self.set_state(ReplicatorState::Failed);
                return Err(e);
            }
        };
        let settings = Arc::new(settings);
        self.settings = Some(Arc::clone(&settings));

        info!(
            link = %settings.name,
            topic = %settings.topic,
            workers = settings.workers,
            queue_group = ?settings.queue_group,
            dedup = settings.limiter.is_some(),
            advisories = settings.advisor.is_some(),
            "Starting replicator"
        );

        self.advisor = Advisor::from_settings(settings.advisor.clone());
        let advisor_tasks = self.advisor.start(Arc::clone(&self.broker), &self.shutdown_rx).await;
        self.handles.extend(advisor_tasks);

        let inspector: Arc<dyn Inspector> = match settings.limiter.clone() {
            Some(limiter_settings) => {
                let limiter = MemoryLimiter::configure(limiter_settings, self.advisor.clone()).await;
                self.handles.extend(limiter.spawn_tasks(&self.shutdown_rx));
                self.limiter = Some(limiter.clone());
                Arc::new(limiter)
            }
            None => Arc::new(PassThrough),
        };

        self.spawn_workers(&settings, inspector);

        self.set_state(ReplicatorState::Running);
        info!(link = %settings.name, "Replicator running");
        Ok(())
    }

    fn spawn_workers(&mut self, settings: &Arc<LinkSettings>, inspector: Arc<dyn Inspector>) {
        for index in 0..settings.workers {
            let worker = Worker::new(index, Arc::clone(settings), Arc::clone(&self.broker), Arc::clone(&inspector));
            let link = settings.name.clone();
            let running = Arc::clone(&self.running_workers);
            let shutdown = self.shutdown_rx.clone();

            metrics::set_running_workers(&link, running.fetch_add(1, Ordering::SeqCst) + 1);

            self.handles.push(tokio::spawn(async move {
                let name = worker.name().to_string();
                if let Err(e) = worker.run(shutdown).await {
                    error!(link = %link, worker = %name, error = %e, "Worker failed");
                    metrics::record_worker_failed(&link);
                }
                let remaining = running.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
                metrics::set_running_workers(&link, remaining);
            }));
        }
    }

    /// Stop replicating.
    ///
    /// Signals every task and waits up to ten seconds for each to finish.
    pub async fn shutdown(&mut self) {
        info!(link = %self.display_name(), "Shutting down replicator");
        self.set_state(ReplicatorState::ShuttingDown);

        self.shutdown_tx.send_replace(true);

        let handles = std::mem::take(&mut self.handles);
        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for tasks to complete");
        }

        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => {
                    debug!(task = i + 1, "Task completed gracefully");
                }
                Ok(Err(e)) => {
                    warn!(task = i + 1, error = %e, "Task panicked during shutdown");
                }
                Err(_) => {
                    warn!(task = i + 1, "Task timed out during shutdown");
                }
            }
        }

        self.set_state(ReplicatorState::Stopped);
        info!(link = %self.display_name(), "Replicator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::config::LinkConfig;

    fn test_config() -> ReplicatorConfig {
        let mut config = ReplicatorConfig::default();
        config
            .topics
            .insert("orders".into(), LinkConfig::for_testing("acme.orders", "east", "west"));
        config
    }

    fn replicator(config: ReplicatorConfig, broker: &MemoryBroker) -> Replicator {
        Replicator::new(config, "orders", Arc::new(broker.clone())).with_fast_timers()
    }

    #[test]
    fn test_replicator_initial_state() {
        let r = replicator(test_config(), &MemoryBroker::new());
        assert_eq!(r.state(), ReplicatorState::Created);
        assert!(!r.is_running());
        assert!(r.settings().is_none());
        assert!(!r.advisor().is_enabled());
    }

    #[tokio::test]
    async fn test_start_unknown_link_fails() {
        let mut r = Replicator::new(test_config(), "missing", Arc::new(MemoryBroker::new()));

        let result = r.start().await;
        assert!(matches!(result, Err(ReplicationError::Config(_))));
        assert_eq!(r.state(), ReplicatorState::Failed);
        assert_eq!(r.running_workers(), 0);
    }

    #[tokio::test]
    async fn test_start_invalid_config_fails() {
        let mut config = test_config();
        if let Some(link) = config.topics.get_mut("orders") {
            link.age = "soon".into();
            link.inspect = "sender".into();
        }
        let mut r = replicator(config, &MemoryBroker::new());

        assert!(r.start().await.is_err());
        assert_eq!(r.state(), ReplicatorState::Failed);
    }

    #[tokio::test]
    async fn test_start_invalid_state() {
        let mut r = replicator(test_config(), &MemoryBroker::new());
        r.state_tx.send_replace(ReplicatorState::Running);

        match r.start().await {
            Err(ReplicationError::InvalidState { expected, actual }) => {
                assert_eq!(expected, "Created");
                assert_eq!(actual, "Running");
            }
            other => panic!("Expected InvalidState error, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let broker = MemoryBroker::new();
        let mut config = test_config();
        if let Some(link) = config.topics.get_mut("orders") {
            link.workers = 3;
        }
        let mut r = replicator(config, &broker);

        r.start().await.unwrap();
        assert!(r.is_running());
        assert_eq!(r.running_workers(), 3);
        assert!(r.limiter().is_none());

        let health = r.health_check().await;
        assert!(health.ready);
        assert_eq!(health.workers_total, 3);
        assert_eq!(health.limiter_entries, None);

        r.shutdown().await;
        assert_eq!(r.state(), ReplicatorState::Stopped);
        assert_eq!(r.running_workers(), 0);
        assert_eq!(broker.open_sessions("east").await, 0);
    }

    #[tokio::test]
    async fn test_failed_worker_does_not_stop_replicator() {
        let broker = MemoryBroker::new();
        broker.fail_next_transport_connects(usize::MAX);
        let mut r = replicator(test_config(), &broker);

        r.start().await.unwrap();
        assert!(r.is_running());

        // Workers are stuck connecting; shutdown cancels them.
        r.shutdown().await;
        assert_eq!(r.state(), ReplicatorState::Stopped);
        assert_eq!(r.running_workers(), 0);
    }

    #[tokio::test]
    async fn test_failed_worker_leaves_sibling_copying() {
        let broker = MemoryBroker::new();
        broker.fail_next_subscribes("east", 1).await;
        let mut config = test_config();
        if let Some(link) = config.topics.get_mut("orders") {
            link.workers = 2;
        }
        let mut r = replicator(config, &broker);
        r.start().await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while r.running_workers() != 1 {
            assert!(tokio::time::Instant::now() < deadline, "failed worker never exited");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(r.is_running());
        assert!(!r.health_check().await.ready);

        for i in 0..5 {
            broker.publish_direct("east", "acme.orders", format!("m{}", i).as_bytes()).await;
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while broker.ack_count("east").await < 5 {
            assert!(tokio::time::Instant::now() < deadline, "survivor did not copy");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(r.running_workers(), 1);

        r.shutdown().await;
        assert_eq!(broker.messages("west", "acme.orders").await.len(), 5);
        assert_eq!(r.running_workers(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_from_created() {
        let mut r = replicator(test_config(), &MemoryBroker::new());
        r.shutdown().await;
        assert_eq!(r.state(), ReplicatorState::Stopped);
    }

    #[tokio::test]
    async fn test_state_receiver() {
        let r = replicator(test_config(), &MemoryBroker::new());
        let state_rx = r.state_receiver();
        assert_eq!(*state_rx.borrow(), ReplicatorState::Created);
    }
}
