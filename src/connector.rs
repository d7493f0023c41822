// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilient broker connection with subscription replay.
//!
//! A [`StreamConnection`] owns one transport and one durable session against
//! a single side of a link. It keeps both alive:
//!
//! ```text
//!   connect() ──► transport (retry with backoff) ──► session (retry with backoff)
//!                                                        │
//!        session lost ◄──── on_lost(generation) ◄────────┘
//!              │
//!              ▼
//!   reconnect task: rebuild transport + session, replay subscriptions
//! ```
//!
//! # Generations
//!
//! Every session gets a generation number. A connection-lost callback names
//! the generation it belongs to; callbacks from a session that has already
//! been replaced are ignored.
//!
//! # Locking
//!
//! `connect`, the reconnect path, `subscribe` and `close` serialize on one
//! lock, so subscription bookkeeping never interleaves with a rebuild.
//! `publish` only takes the lock to clone the session handle; the network
//! call happens outside it.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> stream_replicator::Result<()> {
//! use stream_replicator::broker::memory::MemoryBroker;
//! use stream_replicator::config::{Direction, LinkConfig, ReplicatorConfig};
//! use stream_replicator::connector::StreamConnection;
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! let settings = LinkConfig::for_testing("orders", "east", "west")
//!     .setup("orders", &ReplicatorConfig::default())?;
//! let (_tx, shutdown) = watch::channel(false);
//!
//! let conn = StreamConnection::new(
//!     settings.worker_name(0),
//!     &settings,
//!     Direction::Target,
//!     Arc::new(MemoryBroker::new()),
//! );
//! conn.connect(&shutdown).await?;
//! conn.publish("orders", b"{}").await?;
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::broker::{
    BrokerClient, BrokerError, ConnectionLostHandler, MessageHandler, Session, SubscribeOptions,
    Subscription, Transport, TransportEvent, TransportEventHandler, TransportOptions,
};
use crate::config::{Direction, Endpoint, LinkSettings};
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::resilience::BackoffPolicy;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

/// Message to the reconnect task.
#[derive(Debug)]
enum Control {
    Lost { generation: u64, reason: BrokerError },
    Stop,
}

/// A subscription retained for replay after a session rebuild.
struct DesiredSubscription {
    subject: String,
    queue_group: Option<String>,
    options: SubscribeOptions,
    handler: MessageHandler,
    active: Option<Box<dyn Subscription>>,
}

#[derive(Default)]
struct ConnectionState {
    transport: Option<Arc<dyn Transport>>,
    session: Option<Arc<dyn Session>>,
    subscriptions: Vec<DesiredSubscription>,
    generation: u64,
    closed: bool,
    control: Option<mpsc::UnboundedSender<Control>>,
    shutdown: Option<watch::Receiver<bool>>,
}

struct Inner {
    name: String,
    link: String,
    direction: Direction,
    endpoint: Endpoint,
    backoff: BackoffPolicy,
    broker: Arc<dyn BrokerClient>,
    state: Mutex<ConnectionState>,
}

/// Connection to one side of a link. Cloning shares the connection.
#[derive(Clone)]
pub struct StreamConnection {
    inner: Arc<Inner>,
}

impl StreamConnection {
    /// Create a connection named `name` to the `direction` side of `link`.
    ///
    /// Nothing happens on the network until [`connect`](Self::connect).
    pub fn new(
        name: impl Into<String>,
        link: &LinkSettings,
        direction: Direction,
        broker: Arc<dyn BrokerClient>,
    ) -> Self {
        Self::with_endpoint(
            name,
            link.name.clone(),
            direction,
            link.endpoint(direction).clone(),
            link.backoff.clone(),
            broker,
        )
    }

    /// Create a connection to an explicit endpoint.
    pub fn with_endpoint(
        name: impl Into<String>,
        link: impl Into<String>,
        direction: Direction,
        endpoint: Endpoint,
        backoff: BackoffPolicy,
        broker: Arc<dyn BrokerClient>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                link: link.into(),
                direction,
                endpoint,
                backoff,
                broker,
                state: Mutex::new(ConnectionState::default()),
            }),
        }
    }

    /// Client name presented to the broker.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// Whether a live session is currently held.
    pub async fn is_connected(&self) -> bool {
        self.inner.state.lock().await.session.is_some()
    }

    /// Number of subscriptions retained for replay.
    pub async fn subscription_count(&self) -> usize {
        self.inner.state.lock().await.subscriptions.len()
    }

    /// Generation of the current session (0 before the first connect).
    pub async fn generation(&self) -> u64 {
        self.inner.state.lock().await.generation
    }

    /// Establish the transport and the durable session.
    ///
    /// Retries both layers with the link's backoff until they succeed or
    /// `shutdown` flips, in which case a [`ReplicationError::Connection`] is
    /// returned. Calling it on a connected instance is a no-op.
    pub async fn connect(&self, shutdown: &watch::Receiver<bool>) -> Result<()> {
        let mut state = self.inner.state.lock().await;

        if state.closed {
            return Err(ReplicationError::connection(&self.inner.name, "connection is closed"));
        }
        if state.session.is_some() {
            return Ok(());
        }

        if state.control.is_none() {
            let (tx, rx) = mpsc::unbounded_channel();
            state.control = Some(tx);
            tokio::spawn(run_reconnects(Arc::clone(&self.inner), rx, shutdown.clone()));
        }
        state.shutdown = Some(shutdown.clone());

        let mut shutdown = shutdown.clone();
        self.inner.establish(&mut state, &mut shutdown).await
    }

    /// Subscribe on the current session and retain the subscription for replay.
    ///
    /// The subscription is only retained when the broker accepted it.
    pub async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        options: SubscribeOptions,
        handler: MessageHandler,
    ) -> Result<()> {
        let mut state = self.inner.state.lock().await;

        let session = state
            .session
            .clone()
            .ok_or_else(|| ReplicationError::broker("subscribe", BrokerError::NotConnected))?;

        let mut wanted = DesiredSubscription {
            subject: subject.to_string(),
            queue_group: queue_group.map(str::to_string),
            options,
            handler,
            active: None,
        };

        wanted.active = Some(self.inner.subscribe_one(session.as_ref(), &wanted).await?);
        state.subscriptions.push(wanted);
        Ok(())
    }

    /// Publish `payload` on `subject`.
    ///
    /// Failures are returned as-is; nothing is retried here.
    pub async fn publish(&self, subject: &str, payload: &[u8]) -> Result<()> {
        let session = self
            .inner
            .state
            .lock()
            .await
            .session
            .clone()
            .ok_or_else(|| ReplicationError::broker("publish", BrokerError::NotConnected))?;

        session
            .publish(subject, payload)
            .await
            .map_err(|e| ReplicationError::broker("publish", e))
    }

    /// Forget all subscriptions, close the session and the transport, and
    /// stop reconnecting. The connection cannot be reused afterwards.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;

        state.closed = true;
        state.subscriptions.clear();
        if let Some(control) = state.control.take() {
            let _ = control.send(Control::Stop);
        }

        let mut result = Ok(());
        if let Some(session) = state.session.take() {
            if let Err(e) = session.close().await {
                warn!(name = %self.inner.name, error = %e, "Session close failed");
                result = Err(ReplicationError::broker("close", e));
            }
        }
        if let Some(transport) = state.transport.take() {
            if let Err(e) = transport.close().await {
                debug!(name = %self.inner.name, error = %e, "Transport close failed");
            }
        }

        debug!(name = %self.inner.name, "Connection closed");
        result
    }
}

impl Inner {
    fn canceled(&self) -> ReplicationError {
        ReplicationError::connection(&self.name, "initial connection canceled due to shut down")
    }

    /// Build transport and session. Caller holds the state lock.
    async fn establish(&self, state: &mut ConnectionState, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        if let Some(session) = state.session.take() {
            if let Err(e) = session.close().await {
                debug!(name = %self.name, error = %e, "Closing replaced session failed");
            }
        }
        if let Some(transport) = state.transport.take() {
            if let Err(e) = transport.close().await {
                debug!(name = %self.name, error = %e, "Closing replaced transport failed");
            }
        }

        let transport = self.connect_transport(shutdown).await?;

        let generation = state.generation + 1;
        let on_lost: ConnectionLostHandler = match &state.control {
            Some(control) => {
                let control = control.clone();
                Arc::new(move |reason: BrokerError| {
                    let _ = control.send(Control::Lost { generation, reason });
                })
            }
            None => Arc::new(|_: BrokerError| {}),
        };

        let session = match self.connect_session(transport.as_ref(), on_lost, shutdown).await {
            Ok(session) => session,
            Err(e) => {
                if let Err(close_err) = transport.close().await {
                    debug!(name = %self.name, error = %close_err, "Closing unused transport failed");
                }
                return Err(e);
            }
        };

        state.transport = Some(transport);
        state.session = Some(session);
        state.generation = generation;
        Ok(())
    }

    async fn connect_transport(&self, shutdown: &mut watch::Receiver<bool>) -> Result<Arc<dyn Transport>> {
        let options = TransportOptions {
            name: self.name.clone(),
            tls: self.endpoint.tls,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;

            match self
                .broker
                .connect_transport(&self.endpoint.url, options.clone(), self.events_handler())
                .await
            {
                Ok(transport) => {
                    info!(
                        name = %self.name,
                        direction = %self.direction,
                        url = %self.endpoint.url,
                        attempt,
                        "Transport connected"
                    );
                    return Ok(transport);
                }
                Err(e) => {
                    metrics::record_connection_error(&self.link, &self.name);
                    warn!(
                        name = %self.name,
                        url = %self.endpoint.url,
                        attempt,
                        delay_ms = self.backoff.delay_for_attempt(attempt).as_millis(),
                        error = %e,
                        "Initial transport connection failed, retrying"
                    );
                    if self.backoff.sleep(attempt, shutdown).await.is_err() {
                        error!(name = %self.name, "Initial connection canceled due to shut down");
                        return Err(self.canceled());
                    }
                }
            }
        }
    }

    async fn connect_session(
        &self,
        transport: &dyn Transport,
        on_lost: ConnectionLostHandler,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Arc<dyn Session>> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            match transport
                .connect_session(&self.endpoint.cluster_id, &self.name, Arc::clone(&on_lost))
                .await
            {
                Ok(session) => {
                    info!(
                        name = %self.name,
                        cluster_id = %self.endpoint.cluster_id,
                        attempt,
                        "Durable session established"
                    );
                    return Ok(session);
                }
                Err(e) => {
                    metrics::record_connection_error(&self.link, &self.name);
                    warn!(
                        name = %self.name,
                        cluster_id = %self.endpoint.cluster_id,
                        attempt,
                        error = %e,
                        "Durable session connection failed, retrying"
                    );
                    if self.backoff.sleep(attempt, shutdown).await.is_err() {
                        error!(name = %self.name, "Initial connection canceled due to shut down");
                        return Err(self.canceled());
                    }
                }
            }
        }
    }

    async fn subscribe_one(&self, session: &dyn Session, wanted: &DesiredSubscription) -> Result<Box<dyn Subscription>> {
        match &wanted.queue_group {
            Some(group) => info!(name = %self.name, subject = %wanted.subject, group = %group, "Subscribing"),
            None => info!(name = %self.name, subject = %wanted.subject, "Subscribing"),
        }

        session
            .subscribe(
                &wanted.subject,
                wanted.queue_group.as_deref(),
                wanted.options.clone(),
                Arc::clone(&wanted.handler),
            )
            .await
            .map_err(|e| ReplicationError::broker("subscribe", e))
    }

    /// Rebuild after the session of `generation` was lost.
    async fn reconnect(&self, generation: u64, reason: BrokerError) {
        let mut state = self.state.lock().await;

        if state.closed || generation != state.generation {
            debug!(name = %self.name, generation, current = state.generation, "Ignoring stale connection loss");
            return;
        }

        metrics::record_stream_reconnection(&self.link, &self.name);
        error!(name = %self.name, error = %reason, "Reconnecting durable session after connection loss");

        let Some(mut shutdown) = state.shutdown.clone() else {
            return;
        };
        if let Err(e) = self.establish(&mut state, &mut shutdown).await {
            error!(name = %self.name, error = %e, "Reconnect abandoned");
            return;
        }

        let Some(session) = state.session.clone() else {
            return;
        };

        info!(name = %self.name, count = state.subscriptions.len(), "Resubscribing");
        let mut subscriptions = std::mem::take(&mut state.subscriptions);
        for wanted in subscriptions.iter_mut() {
            match self.subscribe_one(session.as_ref(), wanted).await {
                Ok(active) => wanted.active = Some(active),
                Err(e) => {
                    wanted.active = None;
                    error!(name = %self.name, subject = %wanted.subject, error = %e, "Could not re-subscribe");
                }
            }
        }
        state.subscriptions = subscriptions;
    }

    fn events_handler(&self) -> TransportEventHandler {
        let name = self.name.clone();
        let link = self.link.clone();

        Arc::new(move |event: TransportEvent| match event {
            TransportEvent::Disconnected(Some(reason)) => {
                warn!(name = %name, reason = %reason, "Transport disconnected")
            }
            TransportEvent::Disconnected(None) => warn!(name = %name, "Transport disconnected"),
            TransportEvent::Reconnected(url) => {
                warn!(name = %name, url = %url, "Transport reconnected after a previous disconnection");
                metrics::record_reconnection(&link, &name);
            }
            TransportEvent::Closed(reason) => {
                warn!(name = %name, reason = ?reason, "Transport closed");
                metrics::record_connection_closed(&link, &name);
            }
            TransportEvent::Error(message) => {
                error!(name = %name, error = %message, "Transport error");
                metrics::record_connection_error(&link, &name);
            }
        })
    }
}

async fn run_reconnects(
    inner: Arc<Inner>,
    mut control: mpsc::UnboundedReceiver<Control>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            msg = control.recv() => match msg {
                Some(Control::Lost { generation, reason }) => inner.reconnect(generation, reason).await,
                Some(Control::Stop) | None => break,
            },
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
        }
    }
    debug!(name = %inner.name, "Reconnect task stopped");
}
