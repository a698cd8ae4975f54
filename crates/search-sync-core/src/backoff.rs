//! Exponential backoff policy.
//!
//! The delay before retry `n` (zero-based) is `min(cap, start * factor^n)`.
//! The executor that sleeps and re-invokes lives in the service crate; this
//! module only does the arithmetic and the budget checks.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub start: Duration,
    /// Upper bound for any single delay.
    pub cap: Duration,
    pub factor: f64,
    /// Fraction in `[0, 1]` by which a delay may be randomly shortened.
    pub jitter: f64,
    /// Total attempts including the first call. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Stop retrying once this much time has passed since the first call.
    pub max_elapsed: Option<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            start: Duration::from_millis(100),
            cap: Duration::from_secs(10),
            factor: 2.0,
            jitter: 0.0,
            max_attempts: None,
            max_elapsed: None,
        }
    }
}

impl BackoffPolicy {
    /// Un-jittered delay before retry number `retry` (0 = first retry).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = self.factor.powi(retry.min(i32::MAX as u32) as i32);
        let secs = self.start.as_secs_f64() * exp;
        if !secs.is_finite() || secs >= self.cap.as_secs_f64() {
            self.cap
        } else {
            Duration::from_nanos((secs.max(0.0) * 1e9).round() as u64)
        }
    }

    /// Shorten `delay` by `jitter * unit`, where `unit` is drawn from `[0, 1)`.
    pub fn apply_jitter(&self, delay: Duration, unit: f64) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let scale = 1.0 - self.jitter.min(1.0) * unit.clamp(0.0, 1.0);
        delay.mul_f64(scale)
    }

    /// Whether another attempt is allowed after `retries` retries have
    /// already been made and `elapsed` time has passed.
    pub fn allows_retry(&self, retries: u32, elapsed: Duration) -> bool {
        if let Some(max) = self.max_attempts {
            if retries.saturating_add(1) >= max {
                return false;
            }
        }
        match self.max_elapsed {
            Some(limit) => elapsed + self.delay_for(retries) <= limit,
            None => true,
        }
    }

    /// A policy that never gives up on its own.
    pub fn is_unbounded(&self) -> bool {
        self.max_attempts.is_none() && self.max_elapsed.is_none()
    }
}
