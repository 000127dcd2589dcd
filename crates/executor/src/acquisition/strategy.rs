//! Adaptive page size and wait time between acquisition cycles.
//!
//! Three independent levels drive the wait:
//!
//! ```text
//! idle level     empty cycles in a row      → base_wait * wait_factor^(level-1), ≤ max_wait
//! backoff level  contended cycles           → base_backoff * backoff_factor^level + jitter, ≤ max_backoff
//! saturation     pool rejected a batch      → execution_saturation_wait
//! ```
//!
//! Idle wins over backoff, backoff over saturation; with none active the loop
//! re-acquires immediately.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::JobExecutorConfig;

/// Upper bound on page doublings after consecutive contended cycles.
pub const MAX_PAGE_DOUBLINGS: u32 = 3;

/// Maximum random addition to a backoff wait, relative to the nominal wait.
const MAX_JITTER: f64 = 0.5;

/// What one acquisition cycle ended with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionOutcome {
    /// The acquisition committed (possibly with nothing acquired).
    Acquired {
        requested: usize,
        acquired: usize,
        /// Rows returned by the query that had vanished or were locked by the time they were stamped.
        failed_to_lock: usize,
    },
    /// The commit lost an optimistic-locking race; nothing was acquired.
    Conflict,
    /// A store failure other than a conflict.
    Failed,
    /// Acquisition was skipped because earlier rejected batches are still pending.
    Skipped,
}

impl AcquisitionOutcome {
    pub fn is_contended(&self) -> bool {
        match self {
            AcquisitionOutcome::Conflict => true,
            AcquisitionOutcome::Acquired { failed_to_lock, .. } => *failed_to_lock > 0,
            _ => false,
        }
    }
}

/// Decides how many jobs to request and how long to wait between cycles.
pub trait JobAcquisitionStrategy: Send {
    /// Feed back the outcome of the cycle that just ran.
    fn reconfigure(&mut self, outcome: AcquisitionOutcome, execution_saturated: bool);

    /// Page size for the next acquisition.
    fn num_jobs_to_acquire(&self) -> usize;

    /// Wait before the next cycle.
    fn wait_time(&mut self) -> Duration;
}

/// Exponential idle wait plus jittered contention backoff.
#[derive(Debug, Clone)]
pub struct BackoffJobAcquisitionStrategy {
    base_num_jobs: usize,

    base_idle_wait: Duration,
    idle_increase_factor: f64,
    max_idle_wait: Duration,

    base_backoff: Duration,
    backoff_increase_factor: f64,
    max_backoff: Duration,
    backoff_decrease_threshold: u32,
    max_backoff_level: u32,

    execution_saturation_wait: Duration,

    idle_level: u32,
    backoff_level: u32,
    failure_streak: u32,
    successes_since_backoff_change: u32,
    last_failed: bool,
    execution_saturated: bool,
    rng: StdRng,
}

impl BackoffJobAcquisitionStrategy {
    pub fn new(config: &JobExecutorConfig) -> Self {
        Self::with_rng(config, StdRng::from_os_rng())
    }

    /// Deterministic jitter for tests and simulations.
    pub fn seeded(config: &JobExecutorConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &JobExecutorConfig, rng: StdRng) -> Self {
        let base_backoff = Duration::from_millis(config.backoff_time_in_millis);
        let max_backoff = Duration::from_millis(config.max_backoff);
        Self {
            base_num_jobs: config.max_jobs_per_acquisition.max(1),
            base_idle_wait: Duration::from_millis(config.wait_time_in_millis),
            idle_increase_factor: config.wait_increase_factor.max(1.0),
            max_idle_wait: Duration::from_millis(config.max_wait.max(config.wait_time_in_millis)),
            base_backoff,
            backoff_increase_factor: config.backoff_increase_factor.max(1.0),
            max_backoff,
            backoff_decrease_threshold: config.backoff_decrease_threshold.max(1),
            max_backoff_level: max_level(base_backoff, max_backoff, config.backoff_increase_factor),
            execution_saturation_wait: Duration::from_millis(
                config.execution_saturation_wait_time_in_millis,
            ),
            idle_level: 0,
            backoff_level: 0,
            failure_streak: 0,
            successes_since_backoff_change: 0,
            last_failed: false,
            execution_saturated: false,
            rng,
        }
    }

    pub fn idle_level(&self) -> u32 {
        self.idle_level
    }

    pub fn backoff_level(&self) -> u32 {
        self.backoff_level
    }

    pub fn max_backoff_level(&self) -> u32 {
        self.max_backoff_level
    }

    /// Backoff wait before jitter for the current level.
    pub fn nominal_backoff(&self) -> Duration {
        if self.backoff_level == 0 {
            return Duration::ZERO;
        }
        scaled(self.base_backoff, self.backoff_increase_factor, self.backoff_level, self.max_backoff)
    }

    fn idle_wait(&self) -> Duration {
        if self.idle_level == 0 {
            return Duration::ZERO;
        }
        scaled(
            self.base_idle_wait,
            self.idle_increase_factor,
            self.idle_level - 1,
            self.max_idle_wait,
        )
    }

    fn backoff_wait(&mut self) -> Duration {
        let nominal = self.nominal_backoff();
        if nominal.is_zero() {
            return nominal;
        }
        let jitter = nominal.mul_f64(self.rng.random_range(0.0..=MAX_JITTER));
        (nominal + jitter).min(self.max_backoff)
    }

    fn max_idle_level(&self) -> u32 {
        max_level(self.base_idle_wait, self.max_idle_wait, self.idle_increase_factor) + 1
    }
}

impl JobAcquisitionStrategy for BackoffJobAcquisitionStrategy {
    fn reconfigure(&mut self, outcome: AcquisitionOutcome, execution_saturated: bool) {
        self.execution_saturated = execution_saturated;
        self.last_failed = outcome == AcquisitionOutcome::Failed;

        match outcome {
            AcquisitionOutcome::Failed | AcquisitionOutcome::Skipped => return,
            AcquisitionOutcome::Acquired { acquired: 0, failed_to_lock: 0, .. } => {
                self.idle_level = (self.idle_level + 1).min(self.max_idle_level());
            }
            _ => self.idle_level = 0,
        }

        if outcome.is_contended() {
            self.successes_since_backoff_change = 0;
            self.failure_streak = (self.failure_streak + 1).min(MAX_PAGE_DOUBLINGS);
            if self.backoff_level < self.max_backoff_level {
                self.backoff_level += 1;
            }
        } else {
            self.failure_streak = 0;
            self.successes_since_backoff_change += 1;
            if self.backoff_level > 0
                && self.successes_since_backoff_change >= self.backoff_decrease_threshold
            {
                self.backoff_level -= 1;
                self.successes_since_backoff_change = 0;
            }
        }
    }

    fn num_jobs_to_acquire(&self) -> usize {
        self.base_num_jobs.saturating_mul(1 << self.failure_streak)
    }

    fn wait_time(&mut self) -> Duration {
        if self.last_failed {
            self.base_idle_wait
        } else if self.idle_level > 0 {
            self.idle_wait()
        } else if self.backoff_level > 0 {
            self.backoff_wait()
        } else if self.execution_saturated {
            self.execution_saturation_wait
        } else {
            Duration::ZERO
        }
    }
}

/// `base * factor^level`, capped at `max`.
fn scaled(base: Duration, factor: f64, level: u32, max: Duration) -> Duration {
    let millis = base.as_millis() as f64 * factor.powi(level.min(i32::MAX as u32) as i32);
    if !millis.is_finite() || millis >= max.as_millis() as f64 {
        return max;
    }
    Duration::from_millis(millis as u64)
}

/// Smallest level whose scaled wait reaches `max`; 0 when scaling is disabled.
fn max_level(base: Duration, max: Duration, factor: f64) -> u32 {
    if base.is_zero() || max <= base {
        return 0;
    }
    if factor <= 1.0 {
        return 1;
    }
    let ratio = max.as_millis() as f64 / base.as_millis() as f64;
    (ratio.ln() / factor.ln()).ceil().max(1.0) as u32
}
