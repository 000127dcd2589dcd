//! Acquisition command: query a page of due jobs, lock them, group them into
//! exclusive batches.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use thiserror::Error;

use jobexec_core::{DeploymentId, ExclusivityKey, JobId};

use crate::command::Command;
use crate::config::JobExecutorConfig;
use crate::job_store::{AcquirableJobsQuery, JobStoreError, JobTransaction};

use super::acquired::AcquiredJobs;

/// Why an acquisition attempt produced nothing.
#[derive(Debug, Clone, Error)]
pub enum AcquisitionError {
    /// Another node locked or changed one of the same jobs first. Retryable.
    #[error("acquisition conflict: {0}")]
    Conflict(JobStoreError),
    /// Any other store failure; fatal for this cycle only.
    #[error("acquisition failed: {0}")]
    Store(JobStoreError),
}

impl AcquisitionError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, AcquisitionError::Conflict(_))
    }
}

impl From<JobStoreError> for AcquisitionError {
    fn from(err: JobStoreError) -> Self {
        if err.is_optimistic_locking() {
            AcquisitionError::Conflict(err)
        } else {
            AcquisitionError::Store(err)
        }
    }
}

/// One acquisition attempt. Run through [`crate::command::CommandExecutor`] so
/// that all lock stamps commit together or not at all.
#[derive(Debug, Clone)]
pub struct AcquireJobsCmd {
    pub query: AcquirableJobsQuery,
    pub lock_owner: String,
    pub lock_time: chrono::Duration,
}

impl AcquireJobsCmd {
    /// Command for one cycle of an executor configured by `config`.
    ///
    /// `registered_deployments` is only consulted when deployment awareness is
    /// on; `skip_locked` is the effective mode after checking store support.
    pub fn from_config(
        config: &JobExecutorConfig,
        now: DateTime<Utc>,
        num_jobs: usize,
        registered_deployments: impl FnOnce() -> HashSet<DeploymentId>,
        skip_locked: bool,
    ) -> Self {
        let mut query = AcquirableJobsQuery::new(now, num_jobs)
            .with_ordering(config.ordering())
            .with_skip_locked(skip_locked)
            .with_history_cleanup(config.history_cleanup_enabled)
            .with_null_due_date_is_due(!config.ensure_job_due_date_not_null)
            .with_exclusive_over_process_hierarchies(config.acquire_exclusive_over_process_hierarchies);

        // validated at startup; an inverted range cannot reach this point
        if let Ok(range) = config.priority_range() {
            if !range.is_unbounded() {
                query = query.with_priority_range(range);
            }
        }
        if config.job_executor_deployment_aware {
            query = query.deployment_aware(registered_deployments());
        }

        Self {
            query,
            lock_owner: config.lock_owner.clone(),
            lock_time: config.lock_time(),
        }
    }
}

impl Command for AcquireJobsCmd {
    type Output = AcquiredJobs;
    type Error = AcquisitionError;

    fn execute(&self, tx: &mut dyn JobTransaction) -> Result<AcquiredJobs, AcquisitionError> {
        let now = self.query.now;
        let candidates = tx.find_acquirable_jobs(&self.query)?;
        // Instances held by running exclusive jobs, including locks committed after the query.
        let held = tx.held_exclusive_keys(&self.query)?;

        let mut acquired = AcquiredJobs::new(self.query.page_size);
        let mut batches: Vec<Vec<JobId>> = Vec::new();
        let mut batch_index: HashMap<ExclusivityKey, usize> = HashMap::new();
        let mut failed_to_lock = 0;

        for candidate in candidates {
            // Re-read: the row may have been deleted or locked since the query.
            let Some(mut job) = tx.load(candidate.id)? else {
                failed_to_lock += 1;
                continue;
            };
            if job.is_locked(now)
                || !self.query.is_acquirable(&job)
                || self.query.is_blocked_by(&job, &held)
            {
                failed_to_lock += 1;
                continue;
            }

            job.lock_for(self.lock_owner.clone(), now, self.lock_time);
            tx.update(&job)?;

            let key = self.query.exclusivity_key(&job);
            match batch_index.get(&key) {
                Some(&index) => batches[index].push(job.id),
                None => {
                    batch_index.insert(key, batches.len());
                    batches.push(vec![job.id]);
                }
            }
        }

        for batch in batches {
            acquired.add_batch(batch);
        }
        acquired.add_failed_to_lock(failed_to_lock);
        Ok(acquired)
    }
}
