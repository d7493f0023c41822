//! Copy loop for one worker of a link.
//!
//! A worker owns a source and a target [`StreamConnection`]. It subscribes
//! to the link topic on the source with a durable, manual-ack consumer and
//! copies each message to the same subject on the target:
//!
//! ```text
//!   source ──► handler ──► inspector ──► continuation(process)
//!                                            │
//!                         process? ──yes──► publish to target ──fail──► leave unacked
//!                                            │ok / no
//!                                            ▼
//!                                   sequence gauge, ack source
//! ```
//!
//! A message is acked only after the copy succeeded or the inspector chose
//! to skip it. A failed copy stays unacked and the broker redelivers it.
//!
//! # Shutdown
//!
//! On shutdown both connections are closed. In-flight messages are not
//! drained; anything unacked comes back to the next consumer.

use crate::broker::{self, BrokerClient, Message, SubscribeOptions};
use crate::config::{Direction, LinkSettings};
use crate::connector::StreamConnection;
use crate::error::Result;
use crate::limiter::{continuation, Inspector};
use crate::metrics;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

/// One copy loop.
pub struct Worker {
    name: String,
    settings: Arc<LinkSettings>,
    source: StreamConnection,
    target: StreamConnection,
    inspector: Arc<dyn Inspector>,
}

impl Worker {
    /// Build worker `index` of `settings`.
    pub fn new(
        index: usize,
        settings: Arc<LinkSettings>,
        broker: Arc<dyn BrokerClient>,
        inspector: Arc<dyn Inspector>,
    ) -> Self {
        let name = settings.worker_name(index);
        let source = StreamConnection::new(format!("{}_source", name), &settings, Direction::Source, Arc::clone(&broker));
        let target = StreamConnection::new(format!("{}_target", name), &settings, Direction::Target, broker);

        Self {
            name,
            settings,
            source,
            target,
            inspector,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &StreamConnection {
        &self.source
    }

    pub fn target(&self) -> &StreamConnection {
        &self.target
    }

    /// Connect, subscribe, and copy until `shutdown` flips.
    ///
    /// Returns an error when either side cannot be connected (including
    /// cancellation during the initial connect) or the subscription is
    /// refused. Both connections are closed before returning.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let span = tracing::info_span!("worker", link = %self.settings.name, worker = %self.name);
        self.run_inner(shutdown).instrument(span).await
    }

    async fn run_inner(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            topic = %self.settings.topic,
            source = %self.settings.source.url,
            target = %self.settings.target.url,
            queue_group = ?self.settings.queue_group,
            "Starting worker"
        );

        let (source, target) = tokio::join!(self.source.connect(&shutdown), self.target.connect(&shutdown));
        if let Err(e) = source.and(target) {
            error!(error = %e, "Worker could not connect");
            self.close().await;
            return Err(e);
        }

        let copier = Arc::new(Copier {
            link: self.settings.name.clone(),
            worker: self.name.clone(),
            target: self.target.clone(),
            inspector: Arc::clone(&self.inspector),
        });
        let handler = broker::handler(move |msg: Message| {
            let copier = Arc::clone(&copier);
            async move { copier.handle(msg).await }
        });

        let options = SubscribeOptions::durable(&self.settings.name, self.settings.max_inflight);
        if let Err(e) = self
            .source
            .subscribe(&self.settings.topic, self.settings.queue_group.as_deref(), options, handler)
            .await
        {
            error!(error = %e, "Worker could not subscribe");
            self.close().await;
            return Err(e);
        }

        info!("Worker running");
        let _ = shutdown.wait_for(|stop| *stop).await;

        info!("Worker shutting down");
        self.close().await;
        Ok(())
    }

    async fn close(&self) {
        for conn in [&self.source, &self.target] {
            if let Err(e) = conn.close().await {
                warn!(connection = %conn.name(), error = %e, "Error closing connection");
            }
        }
    }
}

/// Per-message copy state shared by all deliveries of one worker.
struct Copier {
    link: String,
    worker: String,
    target: StreamConnection,
    inspector: Arc<dyn Inspector>,
}

impl Copier {
    async fn handle(&self, msg: Message) {
        let started = Instant::now();
        metrics::record_received(&self.link, &self.worker, msg.payload.len());

        let msg = &msg;
        let result = self
            .inspector
            .process_and_record(msg, continuation(move |process| self.copy(msg, process)))
            .await;

        if let Err(e) = result {
            debug!(subject = %msg.subject, sequence = msg.sequence, error = %e, "Message left for redelivery");
        }

        metrics::record_processing_time(&self.link, &self.worker, started.elapsed());
    }

    async fn copy(&self, msg: &Message, process: bool) -> Result<()> {
        if process {
            if let Err(e) = self.target.publish(&msg.subject, &msg.payload).await {
                error!(subject = %msg.subject, sequence = msg.sequence, error = %e, "Could not publish message to target");
                metrics::record_copy_failed(&self.link, &self.worker);
                return Err(e);
            }
            metrics::record_copied(&self.link, &self.worker, msg.payload.len());
        }

        metrics::set_current_sequence(&self.link, &self.worker, msg.sequence);

        if let Err(e) = msg.ack().await {
            error!(subject = %msg.subject, sequence = msg.sequence, error = %e, "Could not ack message");
            metrics::record_ack_failed(&self.link, &self.worker);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::config::{LinkConfig, ReplicatorConfig};
    use crate::limiter::PassThrough;
    use std::time::Duration;

    fn settings() -> Arc<LinkSettings> {
        Arc::new(
            LinkConfig::for_testing("acme.orders", "east", "west")
                .setup("orders", &ReplicatorConfig::default())
                .unwrap()
                .with_fast_timers(),
        )
    }

    async fn wait_for_acks(broker: &MemoryBroker, cluster: &str, n: u64) {
        for _ in 0..200 {
            if broker.ack_count(cluster).await >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_worker_copies_to_same_subject() {
        let broker = MemoryBroker::new();
        let worker = Worker::new(0, settings(), Arc::new(broker.clone()), Arc::new(PassThrough));
        assert_eq!(worker.name(), "orders_acme_orders_stream_replicator_0");

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(rx));

        broker.publish_direct("east", "acme.orders", b"one").await;
        broker.publish_direct("east", "acme.orders", b"two").await;
        wait_for_acks(&broker, "east", 2).await;

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(broker.messages("west", "acme.orders").await, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(broker.ack_count("east").await, 2);
        assert_eq!(broker.open_sessions("east").await, 0);
        assert_eq!(broker.open_sessions("west").await, 0);
    }

    #[tokio::test]
    async fn test_failed_publish_is_not_acked() {
        let broker = MemoryBroker::with_ack_wait(Duration::from_millis(50));
        broker.fail_next_publishes("west", 1).await;
        let worker = Worker::new(0, settings(), Arc::new(broker.clone()), Arc::new(PassThrough));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(rx));

        broker.publish_direct("east", "acme.orders", b"one").await;
        wait_for_acks(&broker, "east", 1).await;

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(broker.messages("west", "acme.orders").await.len(), 1);
        assert_eq!(broker.ack_count("east").await, 1);
        assert!(broker.delivery_count("east").await >= 2);
    }

    #[tokio::test]
    async fn test_ack_failure_is_not_fatal() {
        let broker = MemoryBroker::new();
        broker.fail_next_acks("east", 1).await;
        let worker = Worker::new(0, settings(), Arc::new(broker.clone()), Arc::new(PassThrough));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(rx));

        broker.publish_direct("east", "acme.orders", b"one").await;
        broker.publish_direct("east", "acme.orders", b"two").await;
        wait_for_acks(&broker, "east", 1).await;

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(broker.messages("west", "acme.orders").await.len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_during_connect_returns_error() {
        let broker = MemoryBroker::new();
        broker.fail_next_transport_connects(usize::MAX);
        let worker = Worker::new(0, settings(), Arc::new(broker.clone()), Arc::new(PassThrough));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        assert!(handle.await.unwrap().is_err());
    }
}
