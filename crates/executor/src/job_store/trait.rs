use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use jobexec_core::{ExclusivityKey, Job, JobId};

use super::query::AcquirableJobsQuery;

/// Job store operation error.
///
/// `OptimisticLocking` is expected under contention between engine nodes and
/// is classified separately from genuine persistence failures.
#[derive(Debug, Clone, Error)]
pub enum JobStoreError {
    #[error("optimistic locking: {entity} {id} was updated by another transaction concurrently")]
    OptimisticLocking { entity: &'static str, id: JobId },
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    pub fn is_optimistic_locking(&self) -> bool {
        matches!(self, JobStoreError::OptimisticLocking { .. })
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

/// Job statistics for operational visibility.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub total: usize,
    /// Unlocked, active, retries left and due.
    pub due: usize,
    /// Holding an unexpired lock.
    pub locked: usize,
    pub suspended: usize,
    /// Retries exhausted.
    pub dead_lettered: usize,
}

/// Durable job table.
///
/// All writes the scheduler performs go through a [`JobTransaction`]; the
/// non-transactional methods are conveniences for producers and operators.
pub trait JobStore: Send + Sync {
    /// Open a transaction.
    fn begin(&self) -> Result<Box<dyn JobTransaction + '_>, JobStoreError>;

    /// Whether `find_acquirable_jobs` honours `skip_locked` natively.
    fn supports_skip_locked(&self) -> bool {
        false
    }

    /// Insert a job in its own transaction.
    fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut tx = self.begin()?;
        let id = tx.insert(job)?;
        tx.commit()?;
        Ok(id)
    }

    /// Read the committed state of a job.
    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// All jobs in insertion order (including dead-lettered ones).
    fn list(&self, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Jobs whose retries are exhausted, with their last failure retained.
    fn failed_jobs(&self, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Reset the retries of a job (operator action, e.g. after fixing a dead letter).
    fn set_retries(&self, job_id: JobId, retries: u32) -> Result<Job, JobStoreError> {
        let mut tx = self.begin()?;
        let mut job = tx.load(job_id)?.ok_or(JobStoreError::NotFound(job_id))?;
        job.retries = retries;
        tx.update(&job)?;
        tx.commit()?;
        Ok(job)
    }

    fn stats(&self, now: DateTime<Utc>) -> Result<JobStats, JobStoreError>;
}

/// A unit of work against the job store.
///
/// Writes are buffered and validated at commit against each row's revision.
/// Dropping an uncommitted transaction rolls it back.
pub trait JobTransaction {
    /// Up to `query.page_size` acquirable jobs, ordered per `query.ordering`.
    fn find_acquirable_jobs(
        &mut self,
        query: &AcquirableJobsQuery,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Keys of instances whose exclusive jobs are locked in committed state,
    /// judged at `query.now` under the query's hierarchy setting.
    fn held_exclusive_keys(
        &mut self,
        query: &AcquirableJobsQuery,
    ) -> Result<HashSet<ExclusivityKey>, JobStoreError>;

    /// Committed state of a job, overlaid with this transaction's own writes.
    fn load(&mut self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    fn insert(&mut self, job: Job) -> Result<JobId, JobStoreError>;

    /// Buffer an update; `job.revision` must be the revision that was read.
    fn update(&mut self, job: &Job) -> Result<(), JobStoreError>;

    /// Buffer a delete; `job.revision` must be the revision that was read.
    fn delete(&mut self, job: &Job) -> Result<(), JobStoreError>;

    fn commit(self: Box<Self>) -> Result<(), JobStoreError>;

    fn rollback(self: Box<Self>);
}
