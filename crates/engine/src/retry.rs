//! Retry and backoff policies.
//!
//! Two distinct concerns:
//! - [`RetryPolicy`] — the per-message state machine: how many finalized
//!   attempts a work item gets and the randomized backoff window applied
//!   to retryable outcomes.
//! - [`TransientRetry`] — round-level retries of claim/finalize calls
//!   against transient storage failures. These never surface to the
//!   consumer.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Per-message retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum finalized attempts before promotion to permanent failure.
    pub max_attempts: i32,
    /// Lower bound of the randomized backoff window.
    pub postpone_min: Duration,
    /// Upper bound of the randomized backoff window.
    pub postpone_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            postpone_min: Duration::from_secs(10 * 60),
            postpone_max: Duration::from_secs(45 * 60),
        }
    }
}

impl RetryPolicy {
    /// A uniformly random delay within the backoff window. Randomization
    /// spreads re-claims of a failed batch across schedulers.
    pub fn random_postpone(&self) -> Duration {
        if self.postpone_max <= self.postpone_min {
            return self.postpone_min;
        }
        let min = self.postpone_min.as_secs();
        let max = self.postpone_max.as_secs();
        Duration::from_secs(rand::thread_rng().gen_range(min..=max))
    }
}

/// Round-level retry of transient storage failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransientRetry {
    /// Attempts per storage call (1 = no retry).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter factor (0.0–1.0).
    pub jitter: f64,
}

impl Default for TransientRetry {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            jitter: 0.2,
        }
    }
}

impl TransientRetry {
    /// Exponential backoff with jitter for a given attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exp = 2_f64.powi((attempt - 1) as i32);
        let delay_ms = (base_ms * exp).min(max_ms);

        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_postpone_stays_in_window() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.random_postpone();
            assert!(delay >= policy.postpone_min);
            assert!(delay <= policy.postpone_max);
        }
    }

    #[test]
    fn degenerate_window_returns_min() {
        let policy = RetryPolicy {
            max_attempts: 3,
            postpone_min: Duration::from_secs(60),
            postpone_max: Duration::from_secs(60),
        };
        assert_eq!(policy.random_postpone(), Duration::from_secs(60));
    }

    #[test]
    fn transient_backoff_grows_and_caps() {
        let retry = TransientRetry {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            jitter: 0.0,
        };

        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(retry.delay_for_attempt(4), Duration::from_millis(400));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let retry = TransientRetry {
            max_attempts: 3,
            ..Default::default()
        };
        assert!(retry.should_retry(1));
        assert!(retry.should_retry(2));
        assert!(!retry.should_retry(3));
    }
}
