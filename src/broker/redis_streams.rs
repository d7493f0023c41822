// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis Streams broker adapter.
//!
//! Maps the durable pub/sub capability onto Redis Streams:
//!
//! | Capability | Redis |
//! |------------|-------|
//! | subject log | stream `{cluster_id}:{subject}` |
//! | durable consumer | consumer group (queue group, or durable name) |
//! | consumer identity | session client name |
//! | deliver all available | `XGROUP CREATE ... 0 MKSTREAM` (else `$`) |
//! | delivery | `XREADGROUP ... COUNT max_inflight BLOCK` |
//! | redelivery | re-read own pending entries with id `0` |
//! | ack | `XACK` |
//! | publish | `INCR {stream}:seq` then `XADD * seq <n> payload <bytes>` |
//!
//! The transport is a `redis::aio::ConnectionManager`, which reconnects on
//! its own. Each subscription reads on a dedicated connection so a blocking
//! `XREADGROUP` never stalls publishes or acks. A failed read ends the
//! session and fires the connection-lost callback.
//!
//! TLS is selected by rewriting `redis://` to `rediss://`.

use super::{
    Acker, BoxFuture, BrokerClient, BrokerError, ConnectionLostHandler, Message, MessageHandler,
    Session, SubscribeOptions, Subscription, Transport, TransportEvent, TransportEventHandler,
    TransportOptions,
};
use crate::resilience::is_shutdown;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, RedisError, RedisResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

/// Timeout for establishing a Redis connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// XREADGROUP block timeout.
const READ_BLOCK: Duration = Duration::from_secs(1);

/// Delay before unacknowledged entries are read again from the pending list.
const DEFAULT_REDELIVERY: Duration = Duration::from_secs(5);

fn to_broker_error(operation: &str, e: RedisError) -> BrokerError {
    BrokerError::Operation(format!("{}: {}", operation, e))
}

/// Apply the TLS flag to a Redis URL.
pub fn effective_url(url: &str, tls: bool) -> String {
    match (tls, url.strip_prefix("redis://")) {
        (true, Some(rest)) => format!("rediss://{}", rest),
        _ => url.to_string(),
    }
}

/// Stream key holding a subject on a cluster.
pub fn stream_key(cluster_id: &str, subject: &str) -> String {
    format!("{}:{}", cluster_id, subject)
}

/// Broker client backed by Redis Streams.
#[derive(Debug, Clone)]
pub struct RedisBroker {
    redelivery: Duration,
}

impl Default for RedisBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl RedisBroker {
    pub fn new() -> Self {
        Self {
            redelivery: DEFAULT_REDELIVERY,
        }
    }

    /// Override how long unacknowledged entries wait before redelivery.
    pub fn with_redelivery(mut self, redelivery: Duration) -> Self {
        self.redelivery = redelivery;
        self
    }
}

impl BrokerClient for RedisBroker {
    fn connect_transport<'a>(
        &'a self,
        url: &'a str,
        options: TransportOptions,
        events: TransportEventHandler,
    ) -> BoxFuture<'a, Arc<dyn Transport>> {
        Box::pin(async move {
            let url = effective_url(url, options.tls);
            let client = Client::open(url.as_str())
                .map_err(|e| BrokerError::Connect(format!("invalid Redis URL: {}", e)))?;

            let conn = match timeout(CONNECT_TIMEOUT, client.get_connection_manager()).await {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => return Err(BrokerError::Connect(e.to_string())),
                Err(_) => {
                    return Err(BrokerError::Connect(format!(
                        "timed out after {}ms",
                        CONNECT_TIMEOUT.as_millis()
                    )))
                }
            };

            debug!(name = %options.name, "Redis transport connected");
            let transport: Arc<dyn Transport> = Arc::new(RedisTransport {
                client,
                conn,
                events,
                redelivery: self.redelivery,
                closed: AtomicBool::new(false),
            });
            Ok(transport)
        })
    }
}

struct RedisTransport {
    client: Client,
    conn: ConnectionManager,
    events: TransportEventHandler,
    redelivery: Duration,
    closed: AtomicBool,
}

impl Transport for RedisTransport {
    fn connect_session<'a>(
        &'a self,
        cluster_id: &'a str,
        client_name: &'a str,
        on_lost: ConnectionLostHandler,
    ) -> BoxFuture<'a, Arc<dyn Session>> {
        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(BrokerError::Closed);
            }

            let mut conn = self.conn.clone();
            let pong: RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
            if let Err(e) = pong {
                (self.events)(TransportEvent::Error(e.to_string()));
                return Err(BrokerError::Connect(e.to_string()));
            }

            let (closed_tx, _) = watch::channel(false);
            let session: Arc<dyn Session> = Arc::new(RedisSession {
                shared: Arc::new(SessionShared {
                    client: self.client.clone(),
                    conn: self.conn.clone(),
                    cluster_id: cluster_id.to_string(),
                    consumer: client_name.to_string(),
                    redelivery: self.redelivery,
                    closed_tx,
                    lost_fired: AtomicBool::new(false),
                    on_lost,
                }),
            });
            debug!(cluster_id, client_name, "Redis session established");
            Ok(session)
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.closed.swap(true, Ordering::AcqRel) {
                (self.events)(TransportEvent::Closed(None));
            }
            Ok(())
        })
    }
}

struct SessionShared {
    client: Client,
    conn: ConnectionManager,
    cluster_id: String,
    consumer: String,
    redelivery: Duration,
    closed_tx: watch::Sender<bool>,
    lost_fired: AtomicBool,
    on_lost: ConnectionLostHandler,
}

impl SessionShared {
    fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// End the session because of a failure, notifying the owner once.
    fn lose(&self, reason: BrokerError) {
        self.closed_tx.send_replace(true);
        if !self.lost_fired.swap(true, Ordering::AcqRel) {
            warn!(cluster_id = %self.cluster_id, consumer = %self.consumer, error = %reason, "Redis session lost");
            (self.on_lost)(reason);
        }
    }
}

struct RedisSession {
    shared: Arc<SessionShared>,
}

impl Session for RedisSession {
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

            let key = stream_key(&self.shared.cluster_id, subject);
            let group = queue_group.unwrap_or(&options.durable_name).to_string();
            let start = if options.deliver_all_available { "0" } else { "$" };

            let mut conn = self.shared.conn.clone();
            let created: RedisResult<()> = conn.xgroup_create_mkstream(&key, &group, start).await;
            if let Err(e) = created {
                if e.code() != Some("BUSYGROUP") {
                    return Err(to_broker_error("XGROUP CREATE", e));
                }
                trace!(stream = %key, group = %group, "Consumer group already exists");
            }

            let reader = match timeout(CONNECT_TIMEOUT, self.shared.client.get_connection_manager()).await {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => return Err(to_broker_error("connect reader", e)),
                Err(_) => return Err(BrokerError::Connect("reader connection timed out".to_string())),
            };

            let (stop_tx, stop_rx) = watch::channel(false);
            let read_loop = ReadLoop {
                session: Arc::clone(&self.shared),
                reader,
                subject: subject.to_string(),
                key,
                group,
                count: options.max_inflight.max(1),
                handler,
                stop: stop_rx,
            };
            tokio::spawn(read_loop.run());

            let subscription: Box<dyn Subscription> = Box::new(RedisSubscription { stop: stop_tx });
            Ok(subscription)
        })
    }

    fn publish<'a>(&'a self, subject: &'a str, payload: &'a [u8]) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.shared.is_closed() {
                return Err(BrokerError::Closed);
            }

            let key = stream_key(&self.shared.cluster_id, subject);
            let mut conn = self.shared.conn.clone();

            let sequence: u64 = conn
                .incr(format!("{}:seq", key), 1)
                .await
                .map_err(|e| to_broker_error("INCR", e))?;
            let sequence = sequence.to_string();

            let fields: [(&str, &[u8]); 2] = [("seq", sequence.as_bytes()), ("payload", payload)];
            let _id: String = conn
                .xadd(&key, "*", &fields)
                .await
                .map_err(|e| to_broker_error("XADD", e))?;
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.shared.lost_fired.store(true, Ordering::Release);
            self.shared.closed_tx.send_replace(true);
            Ok(())
        })
    }
}

struct RedisSubscription {
    stop: watch::Sender<bool>,
}

impl Subscription for RedisSubscription {
    fn unsubscribe(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.stop.send_replace(true);
            Ok(())
        })
    }
}

struct RedisAcker {
    conn: ConnectionManager,
    key: String,
    group: String,
    id: String,
    acked: Arc<AtomicBool>,
}

impl Acker for RedisAcker {
    fn ack(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let _: i64 = conn
                .xack(&self.key, &self.group, &[&self.id])
                .await
                .map_err(|e| to_broker_error("XACK", e))?;
            self.acked.store(true, Ordering::Release);
            Ok(())
        })
    }
}

struct ReadLoop {
    session: Arc<SessionShared>,
    reader: ConnectionManager,
    subject: String,
    key: String,
    group: String,
    count: usize,
    handler: MessageHandler,
    stop: watch::Receiver<bool>,
}

impl ReadLoop {
    /// Ack an entry that can never be delivered so it leaves the pending list.
    async fn discard(&self, id: &str) {
        let mut conn = self.session.conn.clone();
        let acked: RedisResult<i64> = conn.xack(&self.key, &self.group, &[id]).await;
        if let Err(e) = acked {
            warn!(stream = %self.key, id, error = %e, "Could not ack unreadable stream entry");
        }
    }

    async fn run(mut self) {
        let mut session_closed = self.session.closed_tx.subscribe();
        // Start with our own pending list so entries delivered before a
        // restart are retried first.
        let mut reading_pending = true;
        let mut retry_pending_at: Option<Instant> = None;

        loop {
            if is_shutdown(&self.stop) || self.session.is_closed() {
                break;
            }

            if let Some(at) = retry_pending_at {
                if Instant::now() >= at {
                    reading_pending = true;
                    retry_pending_at = None;
                }
            }

            let cursor = if reading_pending { "0" } else { ">" };
            let mut opts = StreamReadOptions::default()
                .group(&self.group, &self.session.consumer)
                .count(self.count);
            if !reading_pending {
                opts = opts.block(READ_BLOCK.as_millis() as usize);
            }

            let keys = [&self.key];
            let ids = [cursor];
            let read: RedisResult<StreamReadReply> = tokio::select! {
                r = self.reader.xread_options(&keys, &ids, &opts) => r,
                _ = self.stop.changed() => break,
                _ = session_closed.changed() => break,
            };

            let reply = match read {
                Ok(reply) => reply,
                Err(e) => {
                    if !is_shutdown(&self.stop) {
                        self.session.lose(to_broker_error("XREADGROUP", e));
                    }
                    break;
                }
            };

            let mut delivered = 0usize;
            let mut unacked = false;
            for stream in reply.keys {
                for entry in stream.ids {
                    let Some((sequence, payload)) = parse_entry(&entry.map) else {
                        // Pending entries whose data was trimmed come back empty.
                        warn!(stream = %self.key, id = %entry.id, "Discarding unreadable stream entry");
                        self.discard(&entry.id).await;
                        continue;
                    };

                    let acked = Arc::new(AtomicBool::new(false));
                    let acker = Arc::new(RedisAcker {
                        conn: self.session.conn.clone(),
                        key: self.key.clone(),
                        group: self.group.clone(),
                        id: entry.id.clone(),
                        acked: Arc::clone(&acked),
                    });
                    (self.handler)(Message::new(self.subject.clone(), sequence, payload, acker)).await;

                    delivered += 1;
                    if !acked.load(Ordering::Acquire) {
                        unacked = true;
                    }
                }
            }

            if reading_pending && delivered == 0 {
                reading_pending = false;
            } else if reading_pending {
                // Pending entries stay pending until acked; come back later.
                reading_pending = false;
                if unacked {
                    retry_pending_at = Some(Instant::now() + self.session.redelivery);
                }
            } else if unacked && retry_pending_at.is_none() {
                retry_pending_at = Some(Instant::now() + self.session.redelivery);
            }
        }

        trace!(stream = %self.key, group = %self.group, "Redis read loop stopped");
    }
}

/// Extract the sequence and payload from a stream entry.
fn parse_entry(fields: &HashMap<String, redis::Value>) -> Option<(u64, Vec<u8>)> {
    let payload = bytes_field(fields, "payload")?;
    let sequence = bytes_field(fields, "seq")
        .and_then(|raw| String::from_utf8(raw).ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    Some((sequence, payload))
}

fn bytes_field(fields: &HashMap<String, redis::Value>, name: &str) -> Option<Vec<u8>> {
    match fields.get(name)? {
        redis::Value::BulkString(bytes) => Some(bytes.clone()),
        redis::Value::SimpleString(s) => Some(s.as_bytes().to_vec()),
        redis::Value::Int(n) => Some(n.to_string().into_bytes()),
        _ => None,
    }
}
