use std::collections::HashSet;

use jobexec_core::JobId;

/// Outcome of one acquisition: locked job ids grouped into exclusive batches.
///
/// Built and consumed on the acquisition thread; batches are handed to the
/// execution pool by value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcquiredJobs {
    batches: Vec<Vec<JobId>>,
    acquired: HashSet<JobId>,
    attempted: usize,
    failed_to_lock: usize,
}

impl AcquiredJobs {
    /// `attempted` is the page size requested from the store.
    pub fn new(attempted: usize) -> Self {
        Self {
            attempted,
            ..Self::default()
        }
    }

    pub fn add_batch(&mut self, batch: Vec<JobId>) {
        if batch.is_empty() {
            return;
        }
        self.acquired.extend(batch.iter().copied());
        self.batches.push(batch);
    }

    /// Count jobs that were returned by the query but could not be locked.
    pub fn add_failed_to_lock(&mut self, count: usize) {
        self.failed_to_lock += count;
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.acquired.contains(job_id)
    }

    /// Remove a job from its batch; a batch left empty disappears.
    pub fn remove_job_id(&mut self, job_id: &JobId) -> bool {
        if !self.acquired.remove(job_id) {
            return false;
        }
        for batch in &mut self.batches {
            batch.retain(|id| id != job_id);
        }
        self.batches.retain(|batch| !batch.is_empty());
        true
    }

    pub fn batches(&self) -> &[Vec<JobId>] {
        &self.batches
    }

    pub fn into_batches(self) -> Vec<Vec<JobId>> {
        self.batches
    }

    /// Number of acquired jobs over all batches.
    pub fn size(&self) -> usize {
        self.acquired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acquired.is_empty()
    }

    pub fn number_of_jobs_attempted_to_acquire(&self) -> usize {
        self.attempted
    }

    pub fn number_of_jobs_failed_to_lock(&self) -> usize {
        self.failed_to_lock
    }

    /// Job ids in batch order, then in-batch order.
    pub fn job_ids(&self) -> impl Iterator<Item = JobId> + '_ {
        self.batches.iter().flatten().copied()
    }
}
