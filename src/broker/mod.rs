// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Broker client capability.
//!
//! The replicator does not speak a wire protocol itself. It consumes a
//! durable, acknowledgment-based publish/subscribe bus through the traits in
//! this module:
//!
//! ```text
//! BrokerClient ──connect_transport──► Transport ──connect_session──► Session
//!                                                                     │
//!                                      subscribe / publish / close ◄──┘
//! ```
//!
//! - The **transport** reconnects on its own and reports what happened
//!   through a [`TransportEventHandler`].
//! - The **session** does not reconnect. When it dies unexpectedly the
//!   broker invokes the [`ConnectionLostHandler`] passed at creation; the
//!   caller rebuilds everything.
//!
//! Two implementations ship with the crate: [`memory::MemoryBroker`]
//! (in-process, used by tests) and [`redis_streams::RedisBroker`] (Redis Streams with
//! consumer groups).
//!
//! # Example
//!
//! ```rust,no_run
//! use stream_replicator::broker::{handler, Message};
//!
//! let on_message = handler(|msg: Message| async move {
//!     println!("{} #{}", msg.subject, msg.sequence);
//!     let _ = msg.ack().await;
//! });
//! ```

pub mod memory;
pub mod redis_streams;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Result type for broker operations.
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = BrokerResult<T>> + Send + 'a>>;

/// Future returned by a [`MessageHandler`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Callback invoked for every delivered message.
pub type MessageHandler = Arc<dyn Fn(Message) -> HandlerFuture + Send + Sync>;

/// Callback invoked when a session terminates unexpectedly.
pub type ConnectionLostHandler = Arc<dyn Fn(BrokerError) + Send + Sync>;

/// Callback invoked for transport-level lifecycle events.
pub type TransportEventHandler = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Wrap an async closure as a [`MessageHandler`].
pub fn handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |msg| -> HandlerFuture { Box::pin(f(msg)) })
}

/// Errors surfaced by a broker implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Could not reach the broker or establish a session.
    #[error("connect failed: {0}")]
    Connect(String),

    /// The session or transport was closed.
    #[error("connection closed")]
    Closed,

    /// No session exists yet.
    #[error("not connected")]
    NotConnected,

    /// The broker rejected or failed an operation.
    #[error("{0}")]
    Operation(String),
}

/// Transport-level events reported by the broker client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Transport dropped; the client is reconnecting on its own.
    Disconnected(Option<String>),
    /// Transport came back after a disconnection.
    Reconnected(String),
    /// Transport closed for good.
    Closed(Option<String>),
    /// Asynchronous error not tied to a specific call.
    Error(String),
}

/// Options for the transport connection.
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    /// Client name presented to the broker.
    pub name: String,
    /// Whether to use TLS for this connection.
    pub tls: bool,
}

/// Options for a durable subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Durable consumer identity. Re-subscribing with the same name resumes.
    pub durable_name: String,
    /// A fresh durable starts from the oldest retained message.
    pub deliver_all_available: bool,
    /// Messages must be acknowledged explicitly via [`Message::ack`].
    pub manual_ack: bool,
    /// Maximum unacknowledged messages outstanding for this subscription.
    pub max_inflight: usize,
}

impl SubscribeOptions {
    /// Durable, replay-from-start, manual-ack options.
    pub fn durable(name: impl Into<String>, max_inflight: usize) -> Self {
        Self {
            durable_name: name.into(),
            deliver_all_available: true,
            manual_ack: true,
            max_inflight: max_inflight.max(1),
        }
    }
}

/// Acknowledges one delivered message.
pub trait Acker: Send + Sync {
    fn ack(&self) -> BoxFuture<'_, ()>;
}

/// A message delivered by a subscription.
#[derive(Clone)]
pub struct Message {
    /// Subject the message was published on.
    pub subject: String,
    /// Broker-assigned sequence number.
    pub sequence: u64,
    /// Raw payload.
    pub payload: Vec<u8>,
    acker: Arc<dyn Acker>,
}

impl Message {
    pub fn new(subject: impl Into<String>, sequence: u64, payload: Vec<u8>, acker: Arc<dyn Acker>) -> Self {
        Self {
            subject: subject.into(),
            sequence,
            payload,
            acker,
        }
    }

    /// Acknowledge the message so the durable consumer moves past it.
    pub async fn ack(&self) -> BrokerResult<()> {
        self.acker.ack().await
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("subject", &self.subject)
            .field("sequence", &self.sequence)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Entry point of a broker client implementation.
pub trait BrokerClient: Send + Sync + 'static {
    /// Open a transport connection with client-side auto-reconnect enabled.
    fn connect_transport<'a>(
        &'a self,
        url: &'a str,
        options: TransportOptions,
        events: TransportEventHandler,
    ) -> BoxFuture<'a, Arc<dyn Transport>>;
}

/// A live transport connection.
pub trait Transport: Send + Sync {
    /// Open a durable session on top of this transport.
    ///
    /// `on_lost` fires at most once per session, when it ends without
    /// [`Session::close`] being called.
    fn connect_session<'a>(
        &'a self,
        cluster_id: &'a str,
        client_name: &'a str,
        on_lost: ConnectionLostHandler,
    ) -> BoxFuture<'a, Arc<dyn Session>>;

    fn close(&self) -> BoxFuture<'_, ()>;
}

/// A durable session.
pub trait Session: Send + Sync {
    /// Subscribe to `subject`, joining `queue_group` when given.
    fn subscribe<'a>(
        &'a self,
        subject: &'a str,
        queue_group: Option<&'a str>,
        options: SubscribeOptions,
        handler: MessageHandler,
    ) -> BoxFuture<'a, Box<dyn Subscription>>;

    fn publish<'a>(&'a self, subject: &'a str, payload: &'a [u8]) -> BoxFuture<'a, ()>;

    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Handle to an active subscription.
pub trait Subscription: Send + Sync {
    fn unsubscribe(&self) -> BoxFuture<'_, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAcker(Arc<AtomicUsize>);

    impl Acker for CountingAcker {
        fn ack(&self) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_message_ack_delegates() {
        let acks = Arc::new(AtomicUsize::new(0));
        let msg = Message::new("orders", 7, b"{}".to_vec(), Arc::new(CountingAcker(acks.clone())));

        msg.ack().await.unwrap();
        msg.ack().await.unwrap();
        assert_eq!(acks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_message_debug_hides_payload() {
        let acks = Arc::new(AtomicUsize::new(0));
        let msg = Message::new("orders", 7, vec![0u8; 32], Arc::new(CountingAcker(acks)));
        let debug = format!("{:?}", msg);
        assert!(debug.contains("payload_len: 32"));
        assert!(debug.contains("orders"));
    }

    #[tokio::test]
    async fn test_handler_wraps_closure() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let h = handler(move |_msg| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let acks = Arc::new(AtomicUsize::new(0));
        h(Message::new("a", 1, vec![], Arc::new(CountingAcker(acks)))).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_durable_options() {
        let opts = SubscribeOptions::durable("link", 0);
        assert!(opts.deliver_all_available);
        assert!(opts.manual_ack);
        assert_eq!(opts.max_inflight, 1);
        assert_eq!(opts.durable_name, "link");
    }

    #[test]
    fn test_broker_error_display() {
        assert_eq!(BrokerError::Closed.to_string(), "connection closed");
        assert_eq!(BrokerError::Connect("refused".into()).to_string(), "connect failed: refused");
    }
}
