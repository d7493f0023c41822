// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process dedup cache with periodic eviction and snapshots.
//!
//! # Background Tasks
//!
//! [`MemoryLimiter::spawn_tasks`] starts three loops on the shared shutdown
//! signal:
//!
//! | Task | Default interval | Work |
//! |------|------------------|------|
//! | evict | 60s | drop entries older than 3 × age |
//! | persist | 30s | write the snapshot (and once more on shutdown) |
//! | metrics | 10s | refresh the cache size gauge |
//!
//! The persist task only runs when a state directory is configured.
//!
//! # Locking
//!
//! One mutex guards the cache. It is never held across file I/O or a call
//! into the advisor: snapshots are cloned under the lock and written after
//! it is released.

use super::{decide, path, snapshot, Continuation, InspectFuture, Inspector};
use crate::advisor::Advisor;
use crate::broker::Message;
use crate::config::LimiterSettings;
use crate::error::Result;
use crate::metrics;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct LimiterInner {
    settings: LimiterSettings,
    advisor: Advisor,
    processed: Mutex<snapshot::Entries>,
}

/// Memory-backed [`Inspector`]. Cloning shares the cache.
#[derive(Clone)]
pub struct MemoryLimiter {
    inner: Arc<LimiterInner>,
}

impl MemoryLimiter {
    /// Create an empty limiter. Call [`load_snapshot`](Self::load_snapshot)
    /// to seed it from disk.
    pub fn new(settings: LimiterSettings, advisor: Advisor) -> Self {
        Self {
            inner: Arc::new(LimiterInner {
                settings,
                advisor,
                processed: Mutex::new(snapshot::Entries::new()),
            }),
        }
    }

    /// Create a limiter and load its snapshot.
    pub async fn configure(settings: LimiterSettings, advisor: Advisor) -> Self {
        let limiter = Self::new(settings, advisor);
        limiter.load_snapshot().await;
        limiter
    }

    pub fn settings(&self) -> &LimiterSettings {
        &self.inner.settings
    }

    /// Number of cached keys.
    pub async fn len(&self) -> usize {
        self.inner.processed.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// When `key` was last copied, if it is cached.
    pub async fn last_processed(&self, key: &str) -> Option<DateTime<Utc>> {
        self.inner.processed.lock().await.get(key).copied()
    }

    fn retention_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        super::cutoff(now, self.inner.settings.retention())
    }

    /// Seed the cache from the snapshot file.
    ///
    /// A missing file is not an error. A file that cannot be read or parsed
    /// is logged and counted, and the cache stays empty. Entries older than
    /// the retention window are dropped; the rest are reported to the
    /// advisor with their original time. Returns the number of entries kept.
    pub async fn load_snapshot(&self) -> usize {
        let settings = &self.inner.settings;
        let Some(path) = settings.snapshot_path() else {
            warn!(link = %settings.link_name, "No state_dir configured, last processed cache is not saved");
            return 0;
        };

        let mut entries = match snapshot::load(&path).await {
            Ok(Some(entries)) => entries,
            Ok(None) => {
                debug!(link = %settings.link_name, path = %path.display(), "No dedup snapshot to load");
                return 0;
            }
            Err(e) => {
                error!(link = %settings.link_name, error = %e, "Could not read dedup snapshot");
                metrics::record_snapshot_failure(&settings.link_name, "read");
                return 0;
            }
        };

        let read = entries.len();
        if let Some(cutoff) = self.retention_cutoff(Utc::now()) {
            snapshot::retain_newer(&mut entries, cutoff);
        }

        let seeds: Vec<(String, DateTime<Utc>)> = entries.iter().map(|(k, t)| (k.clone(), *t)).collect();
        let kept = entries.len();
        *self.inner.processed.lock().await = entries;

        for (key, at) in seeds {
            self.inner.advisor.record_seen(&key, at).await;
        }

        info!(
            link = %settings.link_name,
            path = %path.display(),
            read,
            kept,
            "Loaded last processed cache"
        );
        kept
    }

    /// Write the current cache to the snapshot file.
    ///
    /// A no-op without a state directory.
    pub async fn persist(&self) -> Result<()> {
        let settings = &self.inner.settings;
        let Some(path) = settings.snapshot_path() else {
            return Ok(());
        };

        let entries = self.inner.processed.lock().await.clone();
        let written = snapshot::save(&path, &entries).await?;

        debug!(link = %settings.link_name, path = %path.display(), bytes = written, entries = entries.len(), "Wrote dedup snapshot");
        Ok(())
    }

    async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            error!(link = %self.inner.settings.link_name, error = %e, "Could not write last processed cache");
            metrics::record_snapshot_failure(&self.inner.settings.link_name, "write");
        }
    }

    /// Drop entries older than the retention window. Returns how many.
    pub async fn evict(&self, now: DateTime<Utc>) -> usize {
        let Some(cutoff) = self.retention_cutoff(now) else {
            return 0;
        };

        let removed = snapshot::retain_newer(&mut *self.inner.processed.lock().await, cutoff);
        if removed > 0 {
            debug!(link = %self.inner.settings.link_name, removed, "Evicted stale dedup entries");
            metrics::record_limiter_evicted(&self.inner.settings.link_name, removed);
        }
        removed
    }

    /// Start the evict, persist and metrics loops.
    pub fn spawn_tasks(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let settings = &self.inner.settings;
        let mut handles = Vec::with_capacity(3);

        let limiter = self.clone();
        handles.push(spawn_periodic(settings.evict_interval, shutdown.clone(), move || {
            let limiter = limiter.clone();
            async move {
                limiter.evict(Utc::now()).await;
            }
        }));

        let limiter = self.clone();
        handles.push(spawn_periodic(settings.metrics_interval, shutdown.clone(), move || {
            let limiter = limiter.clone();
            async move {
                let seen = limiter.len().await;
                metrics::set_limiter_seen(&limiter.inner.settings.link_name, seen);
            }
        }));

        if settings.snapshot_path().is_some() {
            let limiter = self.clone();
            let mut shutdown = shutdown.clone();
            let interval = settings.persist_interval;
            handles.push(tokio::spawn(async move {
                let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
                loop {
                    tokio::select! {
                        _ = timer.tick() => limiter.persist_logged().await,
                        _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                            info!(link = %limiter.inner.settings.link_name, "Saving last processed cache on exit");
                            limiter.persist_logged().await;
                            break;
                        }
                    }
                }
            }));
        }

        handles
    }
}

/// Run `tick` every `interval` until shutdown. The first tick is one interval in.
fn spawn_periodic<F, Fut>(interval: Duration, mut shutdown: watch::Receiver<bool>, tick: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = timer.tick() => tick().await,
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
            }
        }
    })
}

impl Inspector for MemoryLimiter {
    fn process_and_record<'a>(&'a self, message: &'a Message, next: Continuation<'a>) -> InspectFuture<'a> {
        Box::pin(async move {
            let settings = &self.inner.settings;
            let link = settings.link_name.as_str();

            if settings.inspect.is_empty() {
                metrics::record_limiter_passed(link);
                return next(true).await;
            }

            let extracted = path::extract(&message.payload, &settings.inspect, settings.update_flag.as_deref());
            let now = Utc::now();

            let last = if extracted.value.is_empty() {
                None
            } else {
                self.inner.processed.lock().await.get(&extracted.value).copied()
            };
            let process = decide(&extracted, last, settings.age, now);

            if process {
                metrics::record_limiter_passed(link);
            } else {
                metrics::record_limiter_skipped(link);
                debug!(
                    link,
                    key = %settings.inspect,
                    value = %extracted.value,
                    last_processed = ?last,
                    "Skipping message within freshness window"
                );
            }

            // Missing keys would otherwise collapse unrelated senders into one record.
            if !extracted.value.is_empty() {
                self.inner.advisor.record_seen(&extracted.value, now).await;
            }

            if let Err(e) = next(process).await {
                metrics::record_limiter_error(link);
                return Err(e);
            }

            if process && !extracted.value.is_empty() {
                self.inner.processed.lock().await.insert(extracted.value, Utc::now());
            }
            Ok(())
        })
    }
}
