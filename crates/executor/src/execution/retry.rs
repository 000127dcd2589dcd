//! Rescheduling policy for failed jobs.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Growth of the delay between failed attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RetryBackoff {
    /// Fixed delay between retries
    #[default]
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// How far a failed job's due date is pushed back before it becomes acquirable again.
///
/// The number of attempts is not part of the policy: it is the job's own
/// `retries` counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub base_delay_millis: u64,
    pub max_delay_millis: u64,
    pub backoff: RetryBackoff,
    /// Jitter factor (0.0-1.0) spreading retries of jobs that failed together.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::immediate()
    }
}

impl RetryPolicy {
    /// Retry as soon as the job is acquired again.
    pub fn immediate() -> Self {
        Self {
            base_delay_millis: 0,
            max_delay_millis: 0,
            backoff: RetryBackoff::Fixed,
            jitter: 0.0,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        Self {
            base_delay_millis: ms,
            max_delay_millis: ms,
            backoff: RetryBackoff::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay_millis: base_delay.as_millis() as u64,
            max_delay_millis: max_delay.as_millis() as u64,
            backoff: RetryBackoff::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before the given failed attempt (1-indexed) without jitter.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.base_delay_millis == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay_millis as f64;
        let max_ms = self.max_delay_millis.max(self.base_delay_millis) as f64;

        let delay_ms = match self.backoff {
            RetryBackoff::Fixed => base_ms,
            RetryBackoff::Exponential => {
                let exp = 2_f64.powi((attempt - 1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
            RetryBackoff::Linear => (base_ms * attempt as f64).min(max_ms),
        };
        Duration::from_millis(delay_ms as u64)
    }

    /// Nominal delay moved by up to `jitter` of itself in either direction.
    pub fn delay_for_attempt<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let factor = self.jitter.clamp(0.0, 1.0);
        if nominal.is_zero() || factor == 0.0 {
            return nominal;
        }

        let spread = rng.random_range(-factor..=factor);
        let millis = nominal.as_millis() as f64 * (1.0 + spread);
        Duration::from_millis(millis.max(0.0) as u64)
    }
}
