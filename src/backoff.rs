//! Retry executor for transient failures.
//!
//! Delays come from [`BackoffPolicy`]; this module adds the clock, the
//! jitter source, and the logging. Time is measured with
//! [`tokio::time::Instant`] so tests can drive it with a paused clock.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

pub use search_sync_core::backoff::BackoffPolicy;

/// Errors that know whether a retry may help.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

/// Retry bookkeeping for one logical operation.
///
/// Use [`retry`] when the operation is a plain closure. `Backoff` exists for
/// callers that need to mutate their own state between attempts.
pub struct Backoff<'a> {
    policy: &'a BackoffPolicy,
    op: &'a str,
    retries: u32,
    started: Instant,
}

impl<'a> Backoff<'a> {
    pub fn new(policy: &'a BackoffPolicy, op: &'a str) -> Self {
        Self {
            policy,
            op,
            retries: 0,
            started: Instant::now(),
        }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Decide what to do with a failed attempt. Returns the delay to sleep
    /// before the next attempt, or `None` when the error must be propagated.
    pub fn next_delay<E: Retryable + Display>(&mut self, err: &E) -> Option<Duration> {
        if !err.is_transient() {
            tracing::error!(op = self.op, error = %err, "non-retryable failure");
            return None;
        }
        if !self.policy.allows_retry(self.retries, self.started.elapsed()) {
            tracing::error!(
                op = self.op,
                attempts = self.retries + 1,
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                error = %err,
                "retry budget exhausted"
            );
            return None;
        }
        let base = self.policy.delay_for(self.retries);
        let delay = self
            .policy
            .apply_jitter(base, rand::thread_rng().gen::<f64>());
        self.retries += 1;
        tracing::warn!(
            op = self.op,
            attempt = self.retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "transient failure, backing off"
        );
        Some(delay)
    }
}

/// Call `f` until it succeeds, fails with a non-transient error, or the
/// policy's budget runs out.
pub async fn retry<T, E, F, Fut>(policy: &BackoffPolicy, op: &str, mut f: F) -> Result<T, E>
where
    E: Retryable + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut backoff = Backoff::new(policy, op);
    loop {
        match f().await {
            Ok(v) => {
                if backoff.retries() > 0 {
                    tracing::info!(op, retries = backoff.retries(), "recovered after retry");
                }
                return Ok(v);
            }
            Err(e) => match backoff.next_delay(&e) {
                Some(delay) => tokio::time::sleep(delay).await,
                None => return Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Flaky(bool);

    impl Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky(transient={})", self.0)
        }
    }

    impl Retryable for Flaky {
        fn is_transient(&self) -> bool {
            self.0
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success_with_expected_delays() {
        let calls = &AtomicU32::new(0);
        let start = Instant::now();
        let out: Result<u32, Flaky> = retry(&BackoffPolicy::default(), "probe", move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 4 {
                Err(Flaky(true))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(out.unwrap(), 4);
        // 0.1 + 0.2 + 0.4 + 0.8
        assert_eq!(start.elapsed(), Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let calls = &AtomicU32::new(0);
        let out: Result<(), Flaky> = retry(&BackoffPolicy::default(), "probe", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Flaky(false))
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_cap_surfaces_last_error() {
        let policy = BackoffPolicy {
            max_attempts: Some(3),
            ..Default::default()
        };
        let calls = &AtomicU32::new(0);
        let out: Result<(), Flaky> = retry(&policy, "probe", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Flaky(true))
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_policy_waits_at_cap() {
        let policy = BackoffPolicy {
            cap: Duration::from_secs(1),
            ..Default::default()
        };
        let calls = &AtomicU32::new(0);
        let start = Instant::now();
        let out: Result<(), Flaky> = retry(&policy, "probe", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 20 {
                Err(Flaky(true))
            } else {
                Ok(())
            }
        })
        .await;
        assert!(out.is_ok());
        // 0.1 + 0.2 + 0.4 + 0.8 then sixteen waits at the 1s cap
        assert_eq!(start.elapsed(), Duration::from_millis(1500 + 16_000));
    }
}
