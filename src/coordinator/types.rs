//! Replicator state types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Connecting
//!    │                              │
//!    │ (invalid config)             │ (tasks spawned)
//!    ↓                              ↓
//! Failed                        Running
//!                                   │
//!                         shutdown()│
//!                                   ↓
//!                             ShuttingDown
//!                                   │
//!                                   ↓
//!                                Stopped
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: Initial state after `Replicator::new()`. Nothing running.
//! - **Connecting**: `start()` called, building the advisor, limiter and workers.
//! - **Running**: Workers are copying. Individual workers may still be
//!   connecting in the background.
//! - **ShuttingDown**: `shutdown()` called. Waiting for tasks and the final snapshot.
//! - **Stopped**: Shutdown complete. Safe to drop.
//! - **Failed**: The link configuration was rejected.

/// State of a replicator.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    /// Created but not started.
    ///
    /// Call [`start()`](super::Replicator::start) to begin copying.
    Created,

    /// Starting components.
    Connecting,

    /// Running and copying.
    Running,

    /// Shutting down.
    ///
    /// Background tasks are finishing and the dedup cache is written one last time.
    ShuttingDown,

    /// Stopped.
    Stopped,

    /// Failed to start.
    ///
    /// Check logs for the configuration error.
    Failed,
}

impl std::fmt::Display for ReplicatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicatorState::Created => write!(f, "Created"),
            ReplicatorState::Connecting => write!(f, "Connecting"),
            ReplicatorState::Running => write!(f, "Running"),
            ReplicatorState::ShuttingDown => write!(f, "ShuttingDown"),
            ReplicatorState::Stopped => write!(f, "Stopped"),
            ReplicatorState::Failed => write!(f, "Failed"),
        }
    }
}

/// Point-in-time health of a replicator.
///
/// Collected from in-process state only; no network I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub state: ReplicatorState,
    /// Running with every worker alive.
    pub ready: bool,
    pub workers_total: usize,
    pub workers_running: usize,
    /// Dedup cache size, when a limiter is configured.
    pub limiter_entries: Option<usize>,
    /// Keys tracked by the advisor, when advisories are enabled.
    pub advisor_tracked: Option<usize>,
}
