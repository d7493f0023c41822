//! Retry timing: exponential backoff and an interruptible sleep.
//!
//! Every reconnect loop in the crate (transport connect, session connect)
//! and the advisory publisher share one [`BackoffPolicy`]. A loop never
//! sleeps past a cancellation request: [`BackoffPolicy::sleep`] returns
//! [`ReplicationError::Shutdown`] the moment the shutdown signal flips.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> stream_replicator::Result<()> {
//! use stream_replicator::resilience::BackoffPolicy;
//! use tokio::sync::watch;
//!
//! let (_tx, mut shutdown) = watch::channel(false);
//! let policy = BackoffPolicy::connect();
//!
//! for attempt in 1.. {
//!     // try something ...
//!     policy.sleep(attempt, &mut shutdown).await?;
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::{ReplicationError, Result};
use std::time::Duration;
use tokio::sync::watch;

/// Exponential backoff schedule.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Maximum number of attempts.
    /// Set to `usize::MAX` for infinite retries (connect loops).
    pub max_attempts: usize,

    /// Delay after the first failed attempt.
    pub initial_delay: Duration,

    /// Ceiling for the exponential curve.
    pub max_delay: Duration,

    /// Multiplier applied per attempt (e.g., 1.5).
    pub backoff_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::connect()
    }
}

impl BackoffPolicy {
    /// Infinite retry capped at five seconds, used by every connect loop.
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        500ms
    /// 2        750ms
    /// 3        1.12s
    /// 4        1.69s
    /// 5        2.53s
    /// 6        3.80s
    /// 7+       5s
    /// ```
    pub fn connect() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            backoff_factor: 1.5,
        }
    }

    /// Same curve as [`connect`](Self::connect), limited to 10 attempts.
    pub fn advisory() -> Self {
        Self {
            max_attempts: 10,
            ..Self::connect()
        }
    }

    /// Fast schedule for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
        }
    }

    /// Limit the number of attempts, keeping the curve.
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Calculate delay for a given attempt number (1-indexed).
    ///
    /// Attempt 0 is treated like attempt 1. The result never decreases
    /// as `attempt` grows and never exceeds `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let multiplier = self.backoff_factor.max(1.0).powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;

        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }

    /// Sleep for `delay_for_attempt(attempt)` unless shutdown is signalled first.
    ///
    /// Returns immediately with [`ReplicationError::Shutdown`] if the signal is
    /// already set or flips while sleeping. A dropped sender counts as shutdown.
    pub async fn sleep(&self, attempt: usize, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        interruptible_sleep(self.delay_for_attempt(attempt), shutdown).await
    }
}

/// Sleep for `delay` or until `shutdown` becomes true.
pub async fn interruptible_sleep(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
    if is_shutdown(shutdown) {
        return Err(ReplicationError::Shutdown);
    }

    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = shutdown.wait_for(|stop| *stop) => Err(ReplicationError::Shutdown),
    }
}

/// True once shutdown has been requested.
pub fn is_shutdown(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_connect_policy() {
        let policy = BackoffPolicy::connect();
        assert_eq!(policy.max_attempts, usize::MAX);
        assert_eq!(policy.initial_delay, Duration::from_millis(500));
        assert_eq!(policy.max_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_advisory_policy() {
        let policy = BackoffPolicy::advisory();
        assert_eq!(policy.max_attempts, 10);
        assert_eq!(policy.max_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_delay_for_attempt() {
        let policy = BackoffPolicy::connect();

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(750));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(1125));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(5));
    }

    #[test]
    fn test_delay_for_attempt_zero() {
        let policy = BackoffPolicy::connect();
        assert_eq!(policy.delay_for_attempt(0), policy.delay_for_attempt(1));
    }

    #[test]
    fn test_delay_for_attempt_huge_attempt_caps() {
        let policy = BackoffPolicy::testing();
        assert_eq!(policy.delay_for_attempt(usize::MAX), Duration::from_millis(100));
    }

    #[test]
    fn test_delay_never_decreases() {
        let policy = BackoffPolicy::connect();
        let mut previous = Duration::ZERO;
        for attempt in 1..50 {
            let delay = policy.delay_for_attempt(attempt);
            assert!(delay >= previous, "attempt {} went backwards", attempt);
            previous = delay;
        }
    }

    #[test]
    fn test_with_max_attempts_floor() {
        let policy = BackoffPolicy::testing().with_max_attempts(0);
        assert_eq!(policy.max_attempts, 1);
    }

    #[tokio::test]
    async fn test_sleep_completes() {
        let (_tx, mut rx) = watch::channel(false);
        let policy = BackoffPolicy::testing();
        assert!(policy.sleep(1, &mut rx).await.is_ok());
    }

    #[tokio::test]
    async fn test_sleep_returns_on_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let policy = BackoffPolicy {
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            ..BackoffPolicy::connect()
        };

        let start = Instant::now();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = tx.send(true);
        });

        let result = policy.sleep(1, &mut rx).await;
        assert!(matches!(result, Err(ReplicationError::Shutdown)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_sleep_already_shutdown() {
        let (_tx, mut rx) = watch::channel(true);
        let result = BackoffPolicy::connect().sleep(1, &mut rx).await;
        assert!(matches!(result, Err(ReplicationError::Shutdown)));
    }

    #[test]
    fn test_is_shutdown_follows_signal() {
        let (tx, rx) = watch::channel(false);
        assert!(!is_shutdown(&rx));
        tx.send_replace(true);
        assert!(is_shutdown(&rx));
    }

    #[tokio::test]
    async fn test_sleep_sender_dropped_counts_as_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let policy = BackoffPolicy {
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            ..BackoffPolicy::connect()
        };
        let result = policy.sleep(1, &mut rx).await;
        assert!(matches!(result, Err(ReplicationError::Shutdown)));
    }
}
