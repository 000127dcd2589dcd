//! Executor metrics.
//!
//! Plain atomic counters; exporters can poll [`JobExecutorMetrics::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters updated by the acquisition loop and the job execution helper.
#[derive(Debug, Default)]
pub struct JobExecutorMetrics {
    acquisition_attempts: AtomicU64,
    acquisition_conflicts: AtomicU64,
    acquisition_failures: AtomicU64,
    jobs_acquired: AtomicU64,
    jobs_failed_to_lock: AtomicU64,
    batches_rejected: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    incidents_raised: AtomicU64,
}

/// Point-in-time copy of [`JobExecutorMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub acquisition_attempts: u64,
    /// Optimistic locking conflicts (expected contention, not errors).
    pub acquisition_conflicts: u64,
    /// Cycles aborted by a non-conflict persistence failure.
    pub acquisition_failures: u64,
    pub jobs_acquired: u64,
    pub jobs_failed_to_lock: u64,
    pub batches_rejected: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub incidents_raised: u64,
}

impl JobExecutorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_acquisition_attempt(&self) {
        self.acquisition_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acquisition_conflict(&self) {
        self.acquisition_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acquisition_failure(&self) {
        self.acquisition_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_jobs_acquired(&self, count: usize) {
        self.jobs_acquired.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_jobs_failed_to_lock(&self, count: usize) {
        self.jobs_failed_to_lock
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_batch_rejected(&self) {
        self.batches_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_succeeded(&self) {
        self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_incident(&self) {
        self.incidents_raised.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            acquisition_attempts: self.acquisition_attempts.load(Ordering::Relaxed),
            acquisition_conflicts: self.acquisition_conflicts.load(Ordering::Relaxed),
            acquisition_failures: self.acquisition_failures.load(Ordering::Relaxed),
            jobs_acquired: self.jobs_acquired.load(Ordering::Relaxed),
            jobs_failed_to_lock: self.jobs_failed_to_lock.load(Ordering::Relaxed),
            batches_rejected: self.batches_rejected.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            incidents_raised: self.incidents_raised.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_values() {
        let metrics = JobExecutorMetrics::new();
        metrics.record_acquisition_attempt();
        metrics.record_acquisition_attempt();
        metrics.record_acquisition_conflict();
        metrics.record_jobs_acquired(5);
        metrics.record_batch_rejected();

        let snap = metrics.snapshot();
        assert_eq!(snap.acquisition_attempts, 2);
        assert_eq!(snap.acquisition_conflicts, 1);
        assert_eq!(snap.jobs_acquired, 5);
        assert_eq!(snap.batches_rejected, 1);
        assert_eq!(snap.jobs_succeeded, 0);
    }

    #[test]
    fn snapshot_serializes_with_field_names() {
        let metrics = JobExecutorMetrics::new();
        metrics.record_incident();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["incidents_raised"], 1);
    }
}
