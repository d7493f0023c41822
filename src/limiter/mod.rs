//! Dedup limiter.
//!
//! Suppresses copies of semantically-unchanged updates. Each payload is
//! inspected for a key (a dot path such as `sender`); a key that was copied
//! less than `age` ago is skipped.
//!
//! ```text
//!            payload
//!               │
//!   update flag true? ──yes──► process
//!               │no
//!     key empty? ──────yes──► process (never cached)
//!               │no
//!   last copy older than now - age (or none)? ──yes──► process
//!               │no
//!             skip
//! ```
//!
//! Whatever the decision, a non-empty key is reported to the
//! [`Advisor`](crate::advisor::Advisor). The cache entry is only written
//! once the continuation succeeds.
//!
//! Two [`Inspector`] implementations exist: [`MemoryLimiter`] and the
//! null-object [`PassThrough`].

pub mod memory;
pub mod path;
pub mod snapshot;

pub use memory::MemoryLimiter;

use crate::broker::Message;
use crate::error::Result;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Future returned by an [`Inspector`] or a [`Continuation`].
pub type InspectFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// The copy step, called with the limiter's `process` decision.
pub type Continuation<'a> = Box<dyn FnOnce(bool) -> InspectFuture<'a> + Send + 'a>;

/// Wrap an async closure as a [`Continuation`].
pub fn continuation<'a, F, Fut>(f: F) -> Continuation<'a>
where
    F: FnOnce(bool) -> Fut + Send + 'a,
    Fut: Future<Output = Result<()>> + Send + 'a,
{
    Box::new(move |process| -> InspectFuture<'a> { Box::pin(f(process)) })
}

/// Decides whether a message should be copied and records the outcome.
pub trait Inspector: Send + Sync {
    /// Run `next` with the decision for `message`; record on success.
    ///
    /// The continuation's error is returned unchanged.
    fn process_and_record<'a>(&'a self, message: &'a Message, next: Continuation<'a>) -> InspectFuture<'a>;
}

/// Inspector that lets everything through.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl Inspector for PassThrough {
    fn process_and_record<'a>(&'a self, _message: &'a Message, next: Continuation<'a>) -> InspectFuture<'a> {
        next(true)
    }
}

/// `now - age`, or `None` when that predates the representable range.
pub fn cutoff(now: DateTime<Utc>, age: Duration) -> Option<DateTime<Utc>> {
    let age = chrono::Duration::from_std(age).ok()?;
    now.checked_sub_signed(age)
}

/// Whether a key last copied at `last` is due again at `now`.
pub fn should_process(last: Option<DateTime<Utc>>, age: Duration, now: DateTime<Utc>) -> bool {
    match (last, cutoff(now, age)) {
        (None, _) => true,
        (Some(last), Some(oldest)) => last < oldest,
        (Some(_), None) => false,
    }
}

/// The full decision for one payload.
pub fn decide(extracted: &path::Extracted, last: Option<DateTime<Utc>>, age: Duration, now: DateTime<Utc>) -> bool {
    if extracted.update == Some(true) || extracted.value.is_empty() {
        return true;
    }
    should_process(last, age, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Acker, BoxFuture};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct NoopAcker;

    impl Acker for NoopAcker {
        fn ack(&self) -> BoxFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn test_pass_through_always_processes() {
        let msg = Message::new("s", 1, b"{}".to_vec(), Arc::new(NoopAcker));
        let seen = Arc::new(AtomicBool::new(false));
        let flag = seen.clone();

        PassThrough
            .process_and_record(
                &msg,
                continuation(move |process| async move {
                    flag.store(process, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .await
            .unwrap();

        assert!(seen.load(Ordering::SeqCst));
    }

    #[test]
    fn test_should_process_window() {
        let now = Utc::now();
        let age = Duration::from_secs(60);

        assert!(should_process(None, age, now));
        assert!(!should_process(Some(now - chrono::Duration::seconds(30)), age, now));
        assert!(should_process(Some(now - chrono::Duration::seconds(61)), age, now));
    }

    #[test]
    fn test_should_process_exact_boundary_skips() {
        let now = Utc::now();
        let age = Duration::from_secs(60);
        assert!(!should_process(Some(now - chrono::Duration::seconds(60)), age, now));
    }

    #[test]
    fn test_should_process_huge_age() {
        let now = Utc::now();
        assert!(!should_process(Some(now), Duration::MAX, now));
    }

    #[test]
    fn test_decide_update_flag_forces() {
        let now = Utc::now();
        let extracted = path::Extracted {
            update: Some(true),
            value: "web1".into(),
        };
        assert!(decide(&extracted, Some(now), Duration::from_secs(60), now));
    }

    #[test]
    fn test_decide_update_flag_false_falls_through() {
        let now = Utc::now();
        let extracted = path::Extracted {
            update: Some(false),
            value: "web1".into(),
        };
        assert!(!decide(&extracted, Some(now), Duration::from_secs(60), now));
    }

    #[test]
    fn test_decide_empty_value_processes() {
        let now = Utc::now();
        let extracted = path::Extracted::default();
        assert!(decide(&extracted, Some(now), Duration::from_secs(60), now));
    }
}
