//! Retry backoff policy

use std::time::Duration;

use rand::Rng;

use crate::config::SyncTuning;

/// Exponential backoff with jitter, capped at `max_delay`
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Attempts before a mutation is parked
    pub max_attempts: u32,
    /// Relative jitter, `0.0` disables it
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_tuning(&SyncTuning::default())
    }
}

impl RetryPolicy {
    pub fn from_tuning(tuning: &SyncTuning) -> Self {
        Self {
            base_delay: Duration::from_millis(tuning.retry_base_ms.max(1)),
            max_delay: Duration::from_millis(tuning.retry_max_ms.max(tuning.retry_base_ms).max(1)),
            max_attempts: tuning.max_attempts.max(1),
            jitter: tuning.retry_jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before the next attempt after `attempts` failures
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        let base = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        if self.jitter <= 0.0 {
            return base;
        }

        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        base.mul_f64(factor).min(self.max_delay)
    }

    /// Whether `attempts` failures exhaust the budget
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
