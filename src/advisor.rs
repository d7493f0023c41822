// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Liveness advisories for dedup keys.
//!
//! The limiter reports every key it inspects through
//! [`Advisor::record_seen`]. A periodic sweep raises a **timeout** advisory
//! for keys that have gone quiet for longer than the advisory age, and the
//! next sighting of such a key raises a **recover** advisory.
//!
//! ```text
//!              record_seen                 sweep (silent > age)
//!   unknown ───────────────► seen ─────────────────────────────► timed out
//!      ▲                      ▲                                     │
//!      │                      └──────── record_seen (recover) ──────┤
//!      └──────────────────────────────── expire ────────────────────┘
//! ```
//!
//! # Publication
//!
//! Advisories are queued on a bounded channel and published as JSON by a
//! background task with its own [`StreamConnection`]. The sweep waits for
//! queue space. `record_seen` sits on the replication path and never waits:
//! when the queue is full the key stays timed out and the next sighting
//! raises the recover advisory again.
//!
//! An advisor built with [`Advisor::disabled`] ignores every call.

use crate::broker::BrokerClient;
use crate::config::AdvisorSettings;
use crate::connector::StreamConnection;
use crate::error::Result;
use crate::metrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Schema URI carried in every advisory.
pub const AGE_ADVISORY_SCHEMA: &str = "https://choria.io/schemas/sr/v1/age_advisory.json";

// ============================================================================
// Wire format
// ============================================================================

/// What triggered an advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdvisoryEvent {
    /// Not seen for longer than the advisory age.
    #[serde(rename = "timeout")]
    Timeout,
    /// Seen again after a timeout.
    #[serde(rename = "recover")]
    Recover,
    /// Forgotten.
    #[serde(rename = "expire")]
    Expire,
}

impl AdvisoryEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdvisoryEvent::Timeout => "timeout",
            AdvisoryEvent::Recover => "recover",
            AdvisoryEvent::Expire => "expire",
        }
    }
}

impl fmt::Display for AdvisoryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published advisory message.
///
/// ```json
/// {"$schema": "https://choria.io/schemas/sr/v1/age_advisory.json",
///  "inspect": "sender", "value": "web1", "age": 3720, "seen": 1768381964,
///  "replicator": "registration", "timestamp": 1768385684, "event": "timeout"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeAdvisory {
    #[serde(rename = "$schema")]
    pub schema: String,
    /// Inspect path the value was taken from.
    pub inspect: String,
    pub value: String,
    /// Seconds between `seen` and `timestamp`.
    pub age: i64,
    /// Unix seconds of the last sighting.
    pub seen: i64,
    /// Link name.
    pub replicator: String,
    /// Unix seconds the advisory was raised.
    pub timestamp: i64,
    pub event: AdvisoryEvent,
}

impl AgeAdvisory {
    fn new(settings: &AdvisorSettings, value: &str, event: AdvisoryEvent, seen: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            schema: AGE_ADVISORY_SCHEMA.to_string(),
            inspect: settings.inspect.clone(),
            value: value.to_string(),
            age: now.timestamp() - seen.timestamp(),
            seen: seen.timestamp(),
            replicator: settings.link_name.clone(),
            timestamp: now.timestamp(),
            event,
        }
    }

    /// Decode an advisory received from the wire.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

// ============================================================================
// Advisor
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
struct Liveness {
    seen: Option<DateTime<Utc>>,
    /// Set while timed out.
    advised: Option<DateTime<Utc>>,
}

struct AdvisorInner {
    settings: AdvisorSettings,
    records: Mutex<HashMap<String, Liveness>>,
    tx: mpsc::Sender<AgeAdvisory>,
    rx: Mutex<Option<mpsc::Receiver<AgeAdvisory>>>,
}

/// Liveness tracker for one link. Cloning shares state.
#[derive(Clone)]
pub struct Advisor {
    inner: Option<Arc<AdvisorInner>>,
}

impl Advisor {
    pub fn new(settings: AdvisorSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        Self {
            inner: Some(Arc::new(AdvisorInner {
                settings,
                records: Mutex::new(HashMap::new()),
                tx,
                rx: Mutex::new(Some(rx)),
            })),
        }
    }

    /// An advisor that does nothing.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Build from optional settings; `None` gives a disabled advisor.
    pub fn from_settings(settings: Option<AdvisorSettings>) -> Self {
        settings.map(Self::new).unwrap_or_else(Self::disabled)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Note that `key` was seen at `at`.
    ///
    /// A timed-out key raises a recover advisory first. If the queue is full
    /// the key stays timed out so a later sighting retries. The new time
    /// always replaces the previous one, even when it is older.
    pub async fn record_seen(&self, key: &str, at: DateTime<Utc>) {
        let Some(inner) = &self.inner else {
            return;
        };

        let recovery = {
            let mut records = inner.records.lock().await;
            let record = records.entry(key.to_string()).or_default();

            let recovery = record.advised.take().map(|advised_at| {
                let now = Utc::now();
                info!(
                    link = %inner.settings.link_name,
                    key,
                    advised_at = %advised_at,
                    "Sending advisory: returned after previous timeout"
                );
                let advisory =
                    AgeAdvisory::new(&inner.settings, key, AdvisoryEvent::Recover, record.seen.unwrap_or(now), now);
                (advisory, advised_at)
            });

            record.seen = Some(at);
            recovery
        };

        let Some((advisory, advised_at)) = recovery else {
            return;
        };

        match inner.tx.try_send(advisory) {
            Ok(()) => metrics::record_advisory(&inner.settings.link_name, AdvisoryEvent::Recover.as_str()),
            Err(e) => {
                // The key stays timed out so the next sighting raises the recover again.
                warn!(link = %inner.settings.link_name, key, error = %e, "Advisory queue full, deferring recover advisory");
                metrics::record_advisory_dropped(&inner.settings.link_name, "queue_full");
                if let Some(record) = inner.records.lock().await.get_mut(key) {
                    record.advised.get_or_insert(advised_at);
                }
            }
        }
    }

    /// Raise a timeout advisory for every key silent since before
    /// `now - age` that has not been advised yet. Returns how many.
    ///
    /// Waits for queue space.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let Some(inner) = &self.inner else {
            return 0;
        };
        let Some(oldest) = crate::limiter::cutoff(now, inner.settings.age) else {
            return 0;
        };

        let advisories: Vec<AgeAdvisory> = {
            let mut records = inner.records.lock().await;
            records
                .iter_mut()
                .filter_map(|(key, record)| match record.seen {
                    Some(seen) if seen < oldest && record.advised.is_none() => {
                        record.advised = Some(now);
                        Some(AgeAdvisory::new(&inner.settings, key, AdvisoryEvent::Timeout, seen, now))
                    }
                    _ => None,
                })
                .collect()
        };

        let raised = advisories.len();
        for advisory in advisories {
            info!(
                link = %inner.settings.link_name,
                key = %advisory.value,
                last_seen_secs = advisory.age,
                "Sending advisory: timed out"
            );
            match inner.tx.send(advisory).await {
                Ok(()) => metrics::record_advisory(&inner.settings.link_name, AdvisoryEvent::Timeout.as_str()),
                Err(_) => metrics::record_advisory_dropped(&inner.settings.link_name, "closed"),
            }
        }
        raised
    }

    /// Forget `key`, raising an expire advisory. Unknown keys are ignored.
    pub async fn expire(&self, key: &str) {
        let Some(inner) = &self.inner else {
            return;
        };

        let Some(record) = inner.records.lock().await.remove(key) else {
            return;
        };

        let now = Utc::now();
        let advisory = AgeAdvisory::new(&inner.settings, key, AdvisoryEvent::Expire, record.seen.unwrap_or(now), now);

        info!(link = %inner.settings.link_name, key, "Sending advisory: expiring");
        match inner.tx.send(advisory).await {
            Ok(()) => metrics::record_advisory(&inner.settings.link_name, AdvisoryEvent::Expire.as_str()),
            Err(_) => metrics::record_advisory_dropped(&inner.settings.link_name, "closed"),
        }
    }

    /// Last sighting of `key`.
    pub async fn last_seen(&self, key: &str) -> Option<DateTime<Utc>> {
        let inner = self.inner.as_ref()?;
        inner.records.lock().await.get(key).and_then(|r| r.seen)
    }

    /// Whether `key` is currently timed out.
    pub async fn is_timed_out(&self, key: &str) -> bool {
        match &self.inner {
            Some(inner) => inner.records.lock().await.get(key).is_some_and(|r| r.advised.is_some()),
            None => false,
        }
    }

    /// Number of tracked keys.
    pub async fn tracked(&self) -> usize {
        match &self.inner {
            Some(inner) => inner.records.lock().await.len(),
            None => 0,
        }
    }

    /// Start the sweep and publish tasks.
    ///
    /// The publish task connects in the background and closes its connection
    /// on shutdown. Returns no handles for a disabled advisor or when the
    /// tasks were already started.
    pub async fn start(&self, broker: Arc<dyn BrokerClient>, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let Some(inner) = &self.inner else {
            return Vec::new();
        };

        let Some(rx) = inner.rx.lock().await.take() else {
            warn!(link = %inner.settings.link_name, "Advisor already started");
            return Vec::new();
        };

        let settings = &inner.settings;
        info!(
            link = %settings.link_name,
            side = %settings.side,
            subject = %settings.target_subject,
            age = ?settings.age,
            "Starting advisor"
        );

        let connection = StreamConnection::with_endpoint(
            settings.client_name(),
            settings.link_name.clone(),
            settings.side,
            settings.endpoint.clone(),
            settings.connect_backoff.clone(),
            broker,
        );

        let publisher = Publisher {
            settings: settings.clone(),
            connection,
            rx,
            shutdown: shutdown.clone(),
        };

        vec![
            tokio::spawn(self.clone().run_sweeps(shutdown.clone())),
            tokio::spawn(publisher.run()),
        ]
    }

    async fn run_sweeps(self, mut shutdown: watch::Receiver<bool>) {
        let Some(interval) = self.inner.as_ref().map(|i| i.settings.sweep_interval) else {
            return;
        };

        let mut sweep_shutdown = shutdown.clone();
        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    debug!("Starting advisory sweep");
                    tokio::select! {
                        _ = self.sweep(Utc::now()) => {}
                        _ = async { let _ = sweep_shutdown.wait_for(|stop| *stop).await; } => break,
                    }
                }
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
            }
        }
    }
}

// ============================================================================
// Publisher
// ============================================================================

struct Publisher {
    settings: AdvisorSettings,
    connection: StreamConnection,
    rx: mpsc::Receiver<AgeAdvisory>,
    shutdown: watch::Receiver<bool>,
}

impl Publisher {
    async fn run(mut self) {
        if let Err(e) = self.connection.connect(&self.shutdown).await {
            warn!(link = %self.settings.link_name, error = %e, "Advisor connection not established");
            return;
        }

        loop {
            let advisory = tokio::select! {
                advisory = self.rx.recv() => advisory,
                _ = async { let _ = self.shutdown.wait_for(|stop| *stop).await; } => None,
            };
            match advisory {
                Some(advisory) => self.publish(advisory).await,
                None => break,
            }
        }

        info!(link = %self.settings.link_name, "Advisor shutting down");
        if let Err(e) = self.connection.close().await {
            warn!(link = %self.settings.link_name, error = %e, "Error closing advisor connection");
        }
    }

    async fn publish(&mut self, advisory: AgeAdvisory) {
        let link = self.settings.link_name.as_str();
        let payload = match serde_json::to_vec(&advisory) {
            Ok(payload) => payload,
            Err(e) => {
                error!(link, error = %e, "Cannot encode advisory");
                metrics::record_advisory_publish_error(link);
                metrics::record_advisory_dropped(link, "encode");
                return;
            }
        };

        let backoff = &self.settings.publish_backoff;
        for attempt in 1..=backoff.max_attempts {
            match self.connection.publish(&self.settings.target_subject, &payload).await {
                Ok(()) => {
                    debug!(link, event = %advisory.event, key = %advisory.value, "Published advisory");
                    return;
                }
                Err(e) => {
                    warn!(
                        link,
                        event = %advisory.event,
                        key = %advisory.value,
                        attempt,
                        error = %e,
                        "Failed to publish advisory"
                    );
                    metrics::record_advisory_publish_error(link);

                    if attempt < backoff.max_attempts && backoff.sleep(attempt, &mut self.shutdown).await.is_err() {
                        break;
                    }
                }
            }
        }

        error!(link, event = %advisory.event, key = %advisory.value, "Giving up on advisory");
        metrics::record_advisory_dropped(link, "publish_failed");
    }
}
