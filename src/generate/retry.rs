// src/generate/retry.rs
//! Capped exponential backoff with optional full jitter.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
    /// Draw each wait uniformly from `0..=backoff` instead of sleeping the full backoff.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(10),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts,
            base,
            cap,
            jitter: false,
        }
    }

    #[must_use]
    pub const fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Upper bound of the wait after the `failed_attempt`-th attempt (1-based):
    /// `base * 2^(failed_attempt - 1)`, capped.
    #[must_use]
    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        if failed_attempt == 0 {
            return Duration::ZERO;
        }
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let cap_ms = u64::try_from(self.cap.as_millis()).unwrap_or(u64::MAX);
        let factor = 1_u64
            .checked_shl(failed_attempt - 1)
            .unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(cap_ms))
    }

    /// The wait actually slept after `failed_attempt`.
    #[must_use]
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        let capped = self.backoff(failed_attempt);
        if !self.jitter || capped.is_zero() {
            return capped;
        }
        let ms = u64::try_from(capped.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::rng().random_range(0..=ms))
    }

    /// Whether another attempt may follow `attempts_made` attempts.
    #[must_use]
    pub const fn can_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Sum of all backoffs a fully failing call can sleep.
    #[must_use]
    pub fn max_total_wait(&self) -> Duration {
        (1..self.max_attempts).map(|n| self.backoff(n)).sum()
    }
}
