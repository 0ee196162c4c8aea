//! Retry policy implementation

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Every retry waits `base`.
    Fixed,
    /// Retry `n` waits `base * n`.
    Linear,
    /// Retry `n` waits `base * 2^(n-1)`.
    Exponential,
}

/// Configuration for retry delays.
///
/// The delay for a retry is computed from the attempt that just failed,
/// clamped to `max`, then jittered to avoid thundering herds.
///
/// # Example
///
/// ```
/// use tickwork::reliability::{Backoff, RetryPolicy};
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential(Duration::from_secs(1))
///     .with_max_delay(Duration::from_secs(60))
///     .with_jitter(0.25);
///
/// // First retry after ~1 second, second after ~2, then ~4, ...
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Backoff strategy.
    pub backoff: Backoff,

    /// Base delay before the first retry.
    #[serde(with = "crate::util::duration_millis")]
    pub base: Duration,

    /// Upper bound on any single delay, applied before jitter.
    #[serde(with = "crate::util::duration_millis")]
    pub max: Duration,

    /// Jitter factor in `[0, 1]`; the clamped delay is multiplied by
    /// `1 + U(-jitter, +jitter)`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1))
    }
}

impl RetryPolicy {
    /// Exponential backoff with a 5 minute cap and 25% jitter.
    pub fn exponential(base: Duration) -> Self {
        Self {
            backoff: Backoff::Exponential,
            base,
            max: Duration::from_secs(300),
            jitter: 0.25,
        }
    }

    /// Fixed delay between retries.
    pub fn fixed(base: Duration) -> Self {
        Self {
            backoff: Backoff::Fixed,
            base,
            max: base,
            jitter: 0.0,
        }
    }

    /// Linearly growing delay.
    pub fn linear(base: Duration) -> Self {
        Self {
            backoff: Backoff::Linear,
            base,
            max: Duration::from_secs(300),
            jitter: 0.25,
        }
    }

    /// Set the maximum delay.
    pub fn with_max_delay(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    /// Set the jitter factor (clamped to `[0, 1]`).
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the retry that follows failed attempt `attempt`
    /// (1-based).
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base = self.base.as_secs_f64();
        let raw = match self.backoff {
            Backoff::Fixed => base,
            Backoff::Linear => base * attempt as f64,
            Backoff::Exponential => base * 2f64.powi(attempt as i32 - 1),
        };
        let clamped = raw.min(self.max.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let factor = 1.0 + rng.gen_range(-self.jitter..=self.jitter);
            (clamped * factor).max(0.0)
        } else {
            clamped
        };

        Duration::from_secs_f64(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_delay_is_constant() {
        let policy = RetryPolicy::fixed(Duration::from_secs(5));
        assert_eq!(policy.delay_after_attempt(1), Duration::from_secs(5));
        assert_eq!(policy.delay_after_attempt(4), Duration::from_secs(5));
    }

    #[test]
    fn linear_delay_grows_with_attempt() {
        let policy = RetryPolicy::linear(Duration::from_secs(2)).with_jitter(0.0);
        assert_eq!(policy.delay_after_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after_attempt(3), Duration::from_secs(6));
    }

    #[test]
    fn exponential_delay_doubles() {
        let policy = RetryPolicy::exponential(Duration::from_secs(1)).with_jitter(0.0);
        assert_eq!(policy.delay_after_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_after_attempt(4), Duration::from_secs(8));
    }

    #[test]
    fn delay_is_clamped_to_max() {
        let policy = RetryPolicy::exponential(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_jitter(0.0);
        assert_eq!(policy.delay_after_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::exponential(Duration::from_secs(4)).with_jitter(0.25);
        for _ in 0..100 {
            let delay = policy.delay_after_attempt(1);
            assert!(delay >= Duration::from_secs(3));
            assert!(delay <= Duration::from_secs(5));
        }
    }

    #[test]
    fn jitter_is_clamped_to_unit_interval() {
        let policy = RetryPolicy::exponential(Duration::from_secs(1)).with_jitter(7.0);
        assert_eq!(policy.jitter, 1.0);
    }

    #[test]
    fn serialization_round_trip() {
        let policy = RetryPolicy::linear(Duration::from_millis(1500)).with_jitter(0.1);
        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, parsed);
    }
}
