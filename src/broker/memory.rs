//! In-process durable broker.
//!
//! Implements the full [`BrokerClient`] capability in memory so the
//! replicator can be exercised without external services:
//!
//! - Per-cluster subject logs, sequence numbers start at 1
//! - Durable consumers (subject + queue group + durable name) that survive
//!   session loss and resume from the first unacknowledged message
//! - Redelivery of unacknowledged messages after `ack_wait`
//! - `max_inflight` backpressure and queue-group load balancing
//! - Fault injection: failing connects, publishes and acks, and dropped
//!   sessions (which fire the connection-lost callback)
//!
//! Cluster URLs are not interpreted; the cluster id selects the log.

use super::{
    Acker, BoxFuture, BrokerClient, BrokerError, ConnectionLostHandler, Message, MessageHandler,
    Session, SubscribeOptions, Subscription, Transport, TransportEvent, TransportEventHandler,
    TransportOptions,
};
use crate::resilience::is_shutdown;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, trace};

/// Default time before an unacknowledged message is redelivered.
const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

/// Upper bound on how long an idle delivery loop waits before re-checking.
const IDLE_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConsumerKey {
    subject: String,
    queue_group: String,
    durable: String,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    sequence: u64,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct ConsumerState {
    start_after: u64,
    acked: BTreeSet<u64>,
    /// sequence -> (delivered at, session id)
    inflight: HashMap<u64, (Instant, u64)>,
    deliveries: u64,
}

#[derive(Debug, Default)]
struct ClusterLog {
    subjects: HashMap<String, Vec<StoredMessage>>,
    consumers: HashMap<ConsumerKey, ConsumerState>,
    acks: u64,
    publish_failures: usize,
    session_failures: usize,
    ack_failures: usize,
    close_failures: usize,
    subscribe_failures: usize,
}

#[derive(Default)]
struct BrokerState {
    clusters: HashMap<String, ClusterLog>,
    sessions: Vec<Arc<SessionShared>>,
    transports: Vec<TransportEventHandler>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    notify: Notify,
    ack_wait: Duration,
    transport_failures: AtomicUsize,
    transport_connects: AtomicUsize,
    next_session_id: AtomicU64,
}

impl BrokerInner {
    async fn cluster_mut<R>(&self, cluster_id: &str, f: impl FnOnce(&mut ClusterLog) -> R) -> R {
        let mut state = self.state.lock().await;
        f(state.clusters.entry(cluster_id.to_string()).or_default())
    }
}

/// Shared liveness of one session.
struct SessionShared {
    id: u64,
    cluster_id: String,
    closed_tx: watch::Sender<bool>,
    lost_fired: AtomicBool,
    on_lost: ConnectionLostHandler,
}

impl SessionShared {
    fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }
}

/// In-memory durable broker. Cloning shares the same logs.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create a broker with the default 30s ack wait.
    pub fn new() -> Self {
        Self::with_ack_wait(DEFAULT_ACK_WAIT)
    }

    /// Create a broker that redelivers unacknowledged messages after `ack_wait`.
    pub fn with_ack_wait(ack_wait: Duration) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                ack_wait,
                transport_failures: AtomicUsize::new(0),
                transport_connects: AtomicUsize::new(0),
                next_session_id: AtomicU64::new(1),
            }),
        }
    }

    // =========================================================================
    // Direct access (bypasses sessions and fault injection)
    // =========================================================================

    /// Append a message to a subject log, returning its sequence.
    pub async fn publish_direct(&self, cluster_id: &str, subject: &str, payload: &[u8]) -> u64 {
        let sequence = self
            .inner
            .cluster_mut(cluster_id, |cluster| append(cluster, subject, payload))
            .await;
        self.inner.notify.notify_waiters();
        sequence
    }

    /// All payloads stored on a subject, in sequence order.
    pub async fn messages(&self, cluster_id: &str, subject: &str) -> Vec<Vec<u8>> {
        self.inner
            .cluster_mut(cluster_id, |cluster| {
                cluster
                    .subjects
                    .get(subject)
                    .map(|log| log.iter().map(|m| m.payload.clone()).collect())
                    .unwrap_or_default()
            })
            .await
    }

    /// Total successful acknowledgments on a cluster.
    pub async fn ack_count(&self, cluster_id: &str) -> u64 {
        self.inner.cluster_mut(cluster_id, |cluster| cluster.acks).await
    }

    /// Total deliveries (including redeliveries) across all consumers on a cluster.
    pub async fn delivery_count(&self, cluster_id: &str) -> u64 {
        self.inner
            .cluster_mut(cluster_id, |cluster| cluster.consumers.values().map(|c| c.deliveries).sum())
            .await
    }

    /// Number of sessions on a cluster that are still open.
    pub async fn open_sessions(&self, cluster_id: &str) -> usize {
        let state = self.inner.state.lock().await;
        state
            .sessions
            .iter()
            .filter(|s| s.cluster_id == cluster_id && !s.is_closed())
            .count()
    }

    /// Number of transport connections established so far.
    pub fn transport_connects(&self) -> usize {
        self.inner.transport_connects.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    /// Fail the next `n` transport connects.
    pub fn fail_next_transport_connects(&self, n: usize) {
        self.inner.transport_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` session connects on a cluster.
    pub async fn fail_next_session_connects(&self, cluster_id: &str, n: usize) {
        self.inner.cluster_mut(cluster_id, |c| c.session_failures = n).await;
    }

    /// Fail the next `n` publishes on a cluster.
    pub async fn fail_next_publishes(&self, cluster_id: &str, n: usize) {
        self.inner.cluster_mut(cluster_id, |c| c.publish_failures = n).await;
    }

    /// Fail the next `n` acks on a cluster.
    pub async fn fail_next_acks(&self, cluster_id: &str, n: usize) {
        self.inner.cluster_mut(cluster_id, |c| c.ack_failures = n).await;
    }

    /// Reject the next `n` subscribes on a cluster.
    pub async fn fail_next_subscribes(&self, cluster_id: &str, n: usize) {
        self.inner.cluster_mut(cluster_id, |c| c.subscribe_failures = n).await;
    }

    /// Report a failure from the next `n` session closes on a cluster.
    ///
    /// The session is still torn down; only the result is an error.
    pub async fn fail_next_session_closes(&self, cluster_id: &str, n: usize) {
        self.inner.cluster_mut(cluster_id, |c| c.close_failures = n).await;
    }

    /// Terminate every open session on a cluster as if the server dropped them.
    ///
    /// Each session's connection-lost callback fires once. Messages those
    /// sessions had in flight become immediately redeliverable.
    pub async fn drop_sessions(&self, cluster_id: &str) -> usize {
        let dropped: Vec<Arc<SessionShared>> = {
            let mut state = self.inner.state.lock().await;
            let dropped: Vec<_> = state
                .sessions
                .iter()
                .filter(|s| s.cluster_id == cluster_id && !s.is_closed())
                .cloned()
                .collect();
            if let Some(cluster) = state.clusters.get_mut(cluster_id) {
                for session in &dropped {
                    release_inflight(cluster, session.id);
                }
            }
            dropped
        };

        for session in &dropped {
            let _ = session.closed_tx.send_replace(true);
            if !session.lost_fired.swap(true, Ordering::SeqCst) {
                debug!(cluster_id, session_id = session.id, "Dropping memory broker session");
                (session.on_lost)(BrokerError::Closed);
            }
        }
        self.inner.notify.notify_waiters();
        dropped.len()
    }

    /// Report a disconnect followed by a reconnect on every open transport.
    pub async fn bounce_transports(&self) {
        let handlers: Vec<TransportEventHandler> = self.inner.state.lock().await.transports.clone();
        for events in handlers {
            events(TransportEvent::Disconnected(Some("connection reset".to_string())));
            events(TransportEvent::Reconnected("memory://".to_string()));
        }
    }
}

fn append(cluster: &mut ClusterLog, subject: &str, payload: &[u8]) -> u64 {
    let log = cluster.subjects.entry(subject.to_string()).or_default();
    let sequence = log.len() as u64 + 1;
    log.push(StoredMessage {
        sequence,
        payload: payload.to_vec(),
    });
    sequence
}

fn release_inflight(cluster: &mut ClusterLog, session_id: u64) {
    for consumer in cluster.consumers.values_mut() {
        consumer.inflight.retain(|_, (_, owner)| *owner != session_id);
    }
}

/// Pick the next message for a consumer and mark it in flight.
fn next_delivery(
    cluster: &mut ClusterLog,
    key: &ConsumerKey,
    max_inflight: usize,
    ack_wait: Duration,
    session_id: u64,
) -> Option<StoredMessage> {
    let log = cluster.subjects.get(&key.subject)?;
    let consumer = cluster.consumers.get_mut(key)?;
    let now = Instant::now();

    let outstanding = consumer
        .inflight
        .values()
        .filter(|(at, _)| now.duration_since(*at) < ack_wait)
        .count();
    if outstanding >= max_inflight {
        return None;
    }

    let candidate = log.iter().find(|m| {
        m.sequence > consumer.start_after
            && !consumer.acked.contains(&m.sequence)
            && consumer
                .inflight
                .get(&m.sequence)
                .map(|(at, _)| now.duration_since(*at) >= ack_wait)
                .unwrap_or(true)
    })?;

    consumer.inflight.insert(candidate.sequence, (now, session_id));
    consumer.deliveries += 1;
    Some(candidate.clone())
}

impl BrokerClient for MemoryBroker {
    fn connect_transport<'a>(
        &'a self,
        url: &'a str,
        options: TransportOptions,
        events: TransportEventHandler,
    ) -> BoxFuture<'a, Arc<dyn Transport>> {
        Box::pin(async move {
            let failed = self
                .inner
                .transport_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(BrokerError::Connect(format!("injected transport failure for {}", url)));
            }

            self.inner.transport_connects.fetch_add(1, Ordering::SeqCst);
            self.inner.state.lock().await.transports.push(events.clone());
            trace!(url, name = %options.name, "Memory transport connected");

            let transport: Arc<dyn Transport> = Arc::new(MemoryTransport {
                broker: Arc::clone(&self.inner),
                events,
                closed: AtomicBool::new(false),
            });
            Ok(transport)
        })
    }
}

struct MemoryTransport {
    broker: Arc<BrokerInner>,
    events: TransportEventHandler,
    closed: AtomicBool,
}

impl Transport for MemoryTransport {
    fn connect_session<'a>(
        &'a self,
        cluster_id: &'a str,
        client_name: &'a str,
        on_lost: ConnectionLostHandler,
    ) -> BoxFuture<'a, Arc<dyn Session>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(BrokerError::Closed);
            }

            let mut state = self.broker.state.lock().await;
            let cluster = state.clusters.entry(cluster_id.to_string()).or_default();
            if cluster.session_failures > 0 {
                cluster.session_failures -= 1;
                return Err(BrokerError::Connect(format!(
                    "injected session failure for {}",
                    cluster_id
                )));
            }

            let (closed_tx, _) = watch::channel(false);
            let shared = Arc::new(SessionShared {
                id: self.broker.next_session_id.fetch_add(1, Ordering::SeqCst),
                cluster_id: cluster_id.to_string(),
                closed_tx,
                lost_fired: AtomicBool::new(false),
                on_lost,
            });
            state.sessions.push(Arc::clone(&shared));
            debug!(cluster_id, client_name, session_id = shared.id, "Memory session connected");

            let session: Arc<dyn Session> = Arc::new(MemorySession {
                broker: Arc::clone(&self.broker),
                shared,
            });
            Ok(session)
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.closed.swap(true, Ordering::SeqCst) {
                (self.events)(TransportEvent::Closed(None));
            }
            Ok(())
        })
    }
}

struct MemorySession {
    broker: Arc<BrokerInner>,
    shared: Arc<SessionShared>,
}

impl Session for MemorySession {
    fn subscribe<'a>(
        &'a self,
        subject: &'a str,
        queue_group: Option<&'a str>,
        options: SubscribeOptions,
        handler: MessageHandler,
    ) -> BoxFuture<'a, Box<dyn Subscription>> {
        Box::pin(async move {
            if self.shared.is_closed() {
                return Err(BrokerError::Closed);
            }

            let key = ConsumerKey {
                subject: subject.to_string(),
                queue_group: queue_group.unwrap_or_default().to_string(),
                durable: options.durable_name.clone(),
            };

            self.broker
                .cluster_mut(&self.shared.cluster_id, |cluster| {
                    if cluster.subscribe_failures > 0 {
                        cluster.subscribe_failures -= 1;
                        return Err(BrokerError::Operation("injected subscribe failure".to_string()));
                    }
                    let head = cluster.subjects.get(subject).map(|l| l.len() as u64).unwrap_or(0);
                    cluster.consumers.entry(key.clone()).or_insert_with(|| ConsumerState {
                        start_after: if options.deliver_all_available { 0 } else { head },
                        ..Default::default()
                    });
                    Ok(())
                })
                .await?;

            let (stop_tx, stop_rx) = watch::channel(false);
            let delivery = DeliveryLoop {
                broker: Arc::clone(&self.broker),
                session: Arc::clone(&self.shared),
                key,
                max_inflight: options.max_inflight.max(1),
                handler,
                stop: stop_rx,
            };
            tokio::spawn(delivery.run());

            let subscription: Box<dyn Subscription> = Box::new(MemorySubscription { stop: stop_tx });
            Ok(subscription)
        })
    }

    fn publish<'a>(&'a self, subject: &'a str, payload: &'a [u8]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.shared.is_closed() {
                return Err(BrokerError::Closed);
            }

            self.broker
                .cluster_mut(&self.shared.cluster_id, |cluster| {
                    if cluster.publish_failures > 0 {
                        cluster.publish_failures -= 1;
                        return Err(BrokerError::Operation("injected publish failure".to_string()));
                    }
                    append(cluster, subject, payload);
                    Ok(())
                })
                .await?;

            self.broker.notify.notify_waiters();
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            // Closing is not a loss; the callback must not fire.
            self.shared.lost_fired.store(true, Ordering::SeqCst);
            let _ = self.shared.closed_tx.send_replace(true);
            let injected = self
                .broker
                .cluster_mut(&self.shared.cluster_id, |cluster| {
                    release_inflight(cluster, self.shared.id);
                    if cluster.close_failures > 0 {
                        cluster.close_failures -= 1;
                        return true;
                    }
                    false
                })
                .await;
            self.broker.notify.notify_waiters();
            if injected {
                return Err(BrokerError::Operation("injected close failure".to_string()));
            }
            Ok(())
        })
    }
}

struct MemorySubscription {
    stop: watch::Sender<bool>,
}

impl Subscription for MemorySubscription {
    fn unsubscribe(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.stop.send_replace(true);
            Ok(())
        })
    }
}

struct DeliveryLoop {
    broker: Arc<BrokerInner>,
    session: Arc<SessionShared>,
    key: ConsumerKey,
    max_inflight: usize,
    handler: MessageHandler,
    stop: watch::Receiver<bool>,
}

impl DeliveryLoop {
    async fn run(mut self) {
        let mut session_closed = self.session.closed_tx.subscribe();

        loop {
            if is_shutdown(&self.stop) || self.session.is_closed() {
                break;
            }

            let next = self
                .broker
                .cluster_mut(&self.session.cluster_id, |cluster| {
                    next_delivery(cluster, &self.key, self.max_inflight, self.broker.ack_wait, self.session.id)
                })
                .await;

            match next {
                Some(stored) => {
                    let acker = Arc::new(MemoryAcker {
                        broker: Arc::clone(&self.broker),
                        session: Arc::clone(&self.session),
                        key: self.key.clone(),
                        sequence: stored.sequence,
                    });
                    let msg = Message::new(self.key.subject.clone(), stored.sequence, stored.payload, acker);
                    (self.handler)(msg).await;
                }
                None => {
                    let wait = IDLE_POLL.min(self.broker.ack_wait);
                    tokio::select! {
                        _ = tokio::time::timeout(wait, self.broker.notify.notified()) => {}
                        _ = self.stop.changed() => {}
                        _ = session_closed.changed() => {}
                    }
                }
            }
        }

        trace!(subject = %self.key.subject, durable = %self.key.durable, "Memory delivery loop stopped");
    }
}

struct MemoryAcker {
    broker: Arc<BrokerInner>,
    session: Arc<SessionShared>,
    key: ConsumerKey,
    sequence: u64,
}

impl Acker for MemoryAcker {
    fn ack(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.session.is_closed() {
                return Err(BrokerError::Closed);
            }

            self.broker
                .cluster_mut(&self.session.cluster_id, |cluster| {
                    if cluster.ack_failures > 0 {
                        cluster.ack_failures -= 1;
                        return Err(BrokerError::Operation("injected ack failure".to_string()));
                    }
                    if let Some(consumer) = cluster.consumers.get_mut(&self.key) {
                        consumer.inflight.remove(&self.sequence);
                        if consumer.acked.insert(self.sequence) {
                            cluster.acks += 1;
                        }
                    }
                    Ok(())
                })
                .await?;

            self.broker.notify.notify_waiters();
            Ok(())
        })
    }
}
