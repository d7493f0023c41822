//! Configuration for the stream replicator.
//!
//! A [`ReplicatorConfig`] holds process-wide settings and one [`LinkConfig`]
//! per replicated topic. The raw link document mirrors the JSON keys operators
//! already write; [`LinkConfig::setup`] validates it, applies defaults, and
//! produces the [`LinkSettings`] every component is built from.
//!
//! # Quick Start
//!
//! ```rust
//! use stream_replicator::config::{LinkConfig, ReplicatorConfig};
//!
//! let mut config = ReplicatorConfig::default();
//! config.topics.insert(
//!     "orders".into(),
//!     LinkConfig::for_testing("orders.created", "east", "west"),
//! );
//!
//! let settings = config.link("orders").unwrap();
//! assert_eq!(settings.name, "orders_orders_created_stream_replicator");
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicatorConfig
//! ├── state_dir: Option<PathBuf>   # dedup cache snapshots, one per link
//! ├── tls: bool                    # global TLS switch
//! └── topics: name → LinkConfig
//!     ├── topic, name, workers, queued, queue_group
//!     ├── source_url / source_cluster_id / disable_source_tls
//!     ├── target_url / target_cluster_id / disable_target_tls
//!     ├── inspect, update_flag, age  # dedup limiter
//!     └── advisory: { target, cluster, age }
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "state_dir": "/var/lib/stream-replicator",
//!   "topics": {
//!     "registration": {
//!       "topic": "acme.registration",
//!       "source_url": "redis://source:6379",
//!       "source_cluster_id": "dc1",
//!       "target_url": "redis://target:6379",
//!       "target_cluster_id": "global",
//!       "workers": 4,
//!       "inspect": "sender",
//!       "update_flag": "registration.changed",
//!       "age": "1h",
//!       "advisory": { "target": "acme.advisories", "cluster": "target", "age": "30m" }
//!     }
//!   }
//! }
//! ```

use crate::error::{ReplicationError, Result};
use crate::resilience::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// Process-wide settings plus every configured link.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Directory for dedup cache snapshots. No persistence when unset.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    /// Use TLS for broker connections unless a link disables it per side.
    #[serde(default)]
    pub tls: bool,

    /// Links keyed by their configuration name.
    #[serde(default)]
    pub topics: BTreeMap<String, LinkConfig>,
}

impl ReplicatorConfig {
    /// Config with a state directory and no links.
    pub fn for_testing(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: Some(state_dir.into()),
            tls: false,
            topics: BTreeMap::new(),
        }
    }

    /// Validate and resolve the link registered under `name`.
    pub fn link(&self, name: &str) -> Result<LinkSettings> {
        let link = self
            .topics
            .get(name)
            .ok_or_else(|| ReplicationError::Config(format!("unknown topic configuration: {}", name)))?;
        link.setup(name, self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LinkConfig: raw per-topic document
// ═══════════════════════════════════════════════════════════════════════════════

/// Raw configuration for one replicated topic.
///
/// Every field is optional at the serde level; [`LinkConfig::setup`] decides
/// what is required.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Subject to replicate.
    #[serde(default)]
    pub topic: String,

    #[serde(default)]
    pub source_url: String,

    #[serde(default)]
    pub source_cluster_id: String,

    #[serde(default)]
    pub target_url: String,

    #[serde(default)]
    pub target_cluster_id: String,

    /// Number of parallel workers. Zero means one.
    #[serde(default)]
    pub workers: usize,

    /// Share the subscription across workers through a queue group.
    #[serde(default)]
    pub queued: bool,

    #[serde(default)]
    pub queue_group: String,

    /// Dot path of the dedup key inside each JSON payload.
    #[serde(default)]
    pub inspect: String,

    /// Dot path of a boolean that forces a copy when true.
    #[serde(default)]
    pub update_flag: String,

    /// Freshness window as a duration string (e.g., "1h").
    #[serde(default)]
    pub age: String,

    /// Link name; derived from the config name and topic when empty.
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub advisory: Option<AdvisoryConfig>,

    #[serde(default)]
    pub disable_source_tls: bool,

    #[serde(default)]
    pub disable_target_tls: bool,

    /// Maximum unacknowledged messages per worker subscription. Zero means 1024.
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
}

/// Advisory publication settings for a link.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdvisoryConfig {
    /// Subject advisories are published on. Empty disables advisories.
    #[serde(default)]
    pub target: String,

    /// `"source"` or `"target"`: which side to publish on.
    #[serde(default)]
    pub cluster: String,

    /// Silence after which a sender times out. Inherits the link age when empty.
    #[serde(default)]
    pub age: String,
}

fn default_max_inflight() -> usize {
    1024
}

fn default_source_url() -> String {
    "nats://localhost:4222".to_string()
}

/// Replace `.` with `_` so a subject can be embedded in names.
fn flatten_topic(topic: &str) -> String {
    topic.replace('.', "_")
}

fn parse_duration(field: &str, value: &str) -> Result<Option<Duration>> {
    if value.is_empty() {
        return Ok(None);
    }
    humantime::parse_duration(value)
        .map(Some)
        .map_err(|e| ReplicationError::Config(format!("{} cannot be parsed as a duration: {}", field, e)))
}

impl LinkConfig {
    /// Minimal valid link between two clusters on a local broker.
    pub fn for_testing(topic: &str, source_cluster_id: &str, target_cluster_id: &str) -> Self {
        Self {
            topic: topic.to_string(),
            source_url: "memory://source".to_string(),
            source_cluster_id: source_cluster_id.to_string(),
            target_url: "memory://target".to_string(),
            target_cluster_id: target_cluster_id.to_string(),
            max_inflight: default_max_inflight(),
            ..Default::default()
        }
    }

    /// Validate this link and apply defaults.
    ///
    /// `name` is the key the link was registered under in
    /// [`ReplicatorConfig::topics`].
    pub fn setup(&self, name: &str, global: &ReplicatorConfig) -> Result<LinkSettings> {
        if self.topic.is_empty() {
            return Err(ReplicationError::Config("a topic is required".to_string()));
        }

        let source_url = if self.source_url.is_empty() {
            default_source_url()
        } else {
            self.source_url.clone()
        };

        if self.source_cluster_id.is_empty() {
            return Err(ReplicationError::Config("a source cluster id is required".to_string()));
        }
        if self.target_url.is_empty() {
            return Err(ReplicationError::Config("a target URL is required".to_string()));
        }
        if self.target_cluster_id.is_empty() {
            return Err(ReplicationError::Config("a target cluster id is required".to_string()));
        }

        let workers = self.workers.max(1);
        let queued = self.queued || workers > 1;
        let queue_group = match (queued, self.queue_group.is_empty()) {
            (false, _) => None,
            (true, true) => Some(format!("{}_stream_replicator_grp", flatten_topic(&self.topic))),
            (true, false) => Some(self.queue_group.clone()),
        };

        let link_name = if self.name.is_empty() {
            format!("{}_{}_stream_replicator", name, flatten_topic(&self.topic))
        } else {
            self.name.clone()
        };

        let age = parse_duration("age", &self.age)?;

        let source = Endpoint {
            url: source_url,
            cluster_id: self.source_cluster_id.clone(),
            tls: global.tls && !self.disable_source_tls,
        };
        let target = Endpoint {
            url: self.target_url.clone(),
            cluster_id: self.target_cluster_id.clone(),
            tls: global.tls && !self.disable_target_tls,
        };

        let limiter = match (self.inspect.is_empty(), age) {
            (false, Some(age)) => Some(LimiterSettings {
                link_name: link_name.clone(),
                topic: self.topic.clone(),
                inspect: self.inspect.clone(),
                update_flag: (!self.update_flag.is_empty()).then(|| self.update_flag.clone()),
                age,
                state_dir: global.state_dir.clone(),
                ..LimiterSettings::default()
            }),
            _ => None,
        };

        let advisor = match &self.advisory {
            Some(advisory) if !advisory.target.is_empty() => {
                let advisory_age = parse_duration("advisory age", &advisory.age)?
                    .or(age)
                    .ok_or_else(|| ReplicationError::Config("an advisory age is required".to_string()))?;
                let side = Direction::from_cluster(&advisory.cluster);
                Some(AdvisorSettings {
                    link_name: link_name.clone(),
                    inspect: self.inspect.clone(),
                    target_subject: advisory.target.clone(),
                    side,
                    endpoint: match side {
                        Direction::Source => source.clone(),
                        Direction::Target => target.clone(),
                    },
                    age: advisory_age,
                    ..AdvisorSettings::default()
                })
            }
            _ => None,
        };

        Ok(LinkSettings {
            name: link_name,
            topic: self.topic.clone(),
            source,
            target,
            workers,
            queue_group,
            max_inflight: if self.max_inflight == 0 {
                default_max_inflight()
            } else {
                self.max_inflight
            },
            backoff: BackoffPolicy::connect(),
            limiter,
            advisor,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resolved settings
// ═══════════════════════════════════════════════════════════════════════════════

/// Which side of a link a connection talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Source,
    Target,
}

impl Direction {
    /// Interpret an advisory `cluster` value. Anything but `"source"` is the target.
    pub fn from_cluster(cluster: &str) -> Self {
        if cluster == "source" {
            Direction::Source
        } else {
            Direction::Target
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Source => write!(f, "source"),
            Direction::Target => write!(f, "target"),
        }
    }
}

/// One side of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub cluster_id: String,
    pub tls: bool,
}

/// A validated link, ready to build workers from.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub name: String,
    pub topic: String,
    pub source: Endpoint,
    pub target: Endpoint,
    pub workers: usize,
    /// Set when the subscription is shared across workers.
    pub queue_group: Option<String>,
    pub max_inflight: usize,
    /// Schedule for every connect loop on this link.
    pub backoff: BackoffPolicy,
    /// Present when both an inspect path and an age are configured.
    pub limiter: Option<LimiterSettings>,
    /// Present when an advisory target is configured.
    pub advisor: Option<AdvisorSettings>,
}

impl LinkSettings {
    pub fn endpoint(&self, direction: Direction) -> &Endpoint {
        match direction {
            Direction::Source => &self.source,
            Direction::Target => &self.target,
        }
    }

    /// Client name for worker `index`.
    pub fn worker_name(&self, index: usize) -> String {
        format!("{}_{}", self.name, index)
    }

    /// Shrink every timer for tests.
    pub fn with_fast_timers(mut self) -> Self {
        self.backoff = BackoffPolicy::testing();
        if let Some(limiter) = self.limiter.as_mut() {
            limiter.evict_interval = Duration::from_millis(50);
            limiter.persist_interval = Duration::from_millis(50);
            limiter.metrics_interval = Duration::from_millis(50);
        }
        if let Some(advisor) = self.advisor.as_mut() {
            advisor.sweep_interval = Duration::from_millis(50);
            advisor.publish_backoff = BackoffPolicy::testing().with_max_attempts(10);
            advisor.connect_backoff = BackoffPolicy::testing();
        }
        self
    }
}

/// Dedup limiter tunables.
#[derive(Debug, Clone)]
pub struct LimiterSettings {
    /// Also names the snapshot file.
    pub link_name: String,
    pub topic: String,
    pub inspect: String,
    pub update_flag: Option<String>,
    pub age: Duration,
    pub state_dir: Option<PathBuf>,
    pub evict_interval: Duration,
    pub persist_interval: Duration,
    pub metrics_interval: Duration,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            link_name: String::new(),
            topic: String::new(),
            inspect: String::new(),
            update_flag: None,
            age: Duration::from_secs(3600),
            state_dir: None,
            evict_interval: Duration::from_secs(60),
            persist_interval: Duration::from_secs(30),
            metrics_interval: Duration::from_secs(10),
        }
    }
}

impl LimiterSettings {
    /// Entries older than this are evicted.
    pub fn retention(&self) -> Duration {
        self.age.saturating_mul(3)
    }

    /// `{state_dir}/{link_name}.json`, when persistence is enabled.
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        self.state_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", self.link_name)))
    }
}

/// Advisor tunables.
#[derive(Debug, Clone)]
pub struct AdvisorSettings {
    pub link_name: String,
    pub inspect: String,
    pub target_subject: String,
    pub side: Direction,
    pub endpoint: Endpoint,
    /// Silence after which a sender times out.
    pub age: Duration,
    pub sweep_interval: Duration,
    pub queue_capacity: usize,
    pub publish_backoff: BackoffPolicy,
    pub connect_backoff: BackoffPolicy,
}

impl Default for AdvisorSettings {
    fn default() -> Self {
        Self {
            link_name: String::new(),
            inspect: String::new(),
            target_subject: String::new(),
            side: Direction::Target,
            endpoint: Endpoint {
                url: String::new(),
                cluster_id: String::new(),
                tls: false,
            },
            age: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(30),
            queue_capacity: 1000,
            publish_backoff: BackoffPolicy::advisory(),
            connect_backoff: BackoffPolicy::connect(),
        }
    }
}

impl AdvisorSettings {
    /// Client name of the advisor's own connection.
    pub fn client_name(&self) -> String {
        format!("{}_advisor", self.link_name)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
