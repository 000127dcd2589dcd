//! Acquirable-jobs query: filter predicate and ordering strategy.
//!
//! Stores translate this into their native query; the in-memory store applies
//! it directly. Either way the same eligibility rules and ordering hold.

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobexec_core::{DeploymentId, ExclusivityKey, Job, JobKind, PriorityRange};

/// Ordering strategy for acquisition.
///
/// Every ordering ends with insertion order and then job id, so two queries
/// against an unchanged store return identical sequences.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionOrdering {
    pub by_due_date: bool,
    pub by_priority: bool,
    pub prefer_timer_jobs: bool,
}

impl AcquisitionOrdering {
    /// Priority ordering is a no-op while timer preference is active.
    pub fn priority_is_effective(&self) -> bool {
        self.by_priority && !self.prefer_timer_jobs
    }

    pub fn compare(&self, a: &Job, b: &Job) -> Ordering {
        let mut ord = Ordering::Equal;

        if self.prefer_timer_jobs {
            // timers first
            ord = b.kind.is_timer().cmp(&a.kind.is_timer());
        } else if self.by_priority {
            ord = b.priority.cmp(&a.priority);
        }

        if self.by_due_date {
            // `None` sorts first: no due date means immediately due.
            ord = ord.then_with(|| a.due_date.cmp(&b.due_date));
        }

        ord.then_with(|| a.sequence.cmp(&b.sequence))
            .then_with(|| a.id.cmp(&b.id))
    }
}

/// Parameters of one `findAcquirableJobs` call.
#[derive(Debug, Clone)]
pub struct AcquirableJobsQuery {
    /// Instant due dates and lock expirations are compared against.
    pub now: DateTime<Utc>,
    /// Hard row limit.
    pub page_size: usize,
    pub ordering: AcquisitionOrdering,
    /// Omit rows currently held by a concurrent reader instead of returning them.
    pub skip_locked: bool,
    /// `None` disables priority filtering.
    pub priority_range: Option<PriorityRange>,
    /// `Some` enables deployment awareness with the given registered set.
    pub registered_deployments: Option<HashSet<DeploymentId>>,
    pub history_cleanup_enabled: bool,
    /// Whether a job without due date counts as immediately due.
    pub null_due_date_is_due: bool,
    /// Exclusive jobs are held per root process instance instead of per process instance.
    pub exclusive_over_process_hierarchies: bool,
}

impl AcquirableJobsQuery {
    pub fn new(now: DateTime<Utc>, page_size: usize) -> Self {
        Self {
            now,
            page_size,
            ordering: AcquisitionOrdering::default(),
            skip_locked: false,
            priority_range: None,
            registered_deployments: None,
            history_cleanup_enabled: true,
            null_due_date_is_due: true,
            exclusive_over_process_hierarchies: false,
        }
    }

    pub fn with_ordering(mut self, ordering: AcquisitionOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn with_skip_locked(mut self, skip_locked: bool) -> Self {
        self.skip_locked = skip_locked;
        self
    }

    pub fn with_priority_range(mut self, range: PriorityRange) -> Self {
        self.priority_range = Some(range);
        self
    }

    pub fn deployment_aware(mut self, registered: HashSet<DeploymentId>) -> Self {
        self.registered_deployments = Some(registered);
        self
    }

    pub fn with_history_cleanup(mut self, enabled: bool) -> Self {
        self.history_cleanup_enabled = enabled;
        self
    }

    pub fn with_null_due_date_is_due(mut self, is_due: bool) -> Self {
        self.null_due_date_is_due = is_due;
        self
    }

    pub fn with_exclusive_over_process_hierarchies(mut self, enabled: bool) -> Self {
        self.exclusive_over_process_hierarchies = enabled;
        self
    }

    /// Batch key of `job` under this query's hierarchy setting.
    pub fn exclusivity_key(&self, job: &Job) -> ExclusivityKey {
        job.exclusivity_key(self.exclusive_over_process_hierarchies)
    }

    /// Instances (or hierarchies) in which an exclusive job holds an unexpired lock.
    pub fn held_exclusive_keys<'a>(
        &self,
        jobs: impl IntoIterator<Item = &'a Job>,
    ) -> HashSet<ExclusivityKey> {
        jobs.into_iter()
            .filter(|job| job.exclusive && job.is_locked(self.now))
            .map(|job| self.exclusivity_key(job))
            .filter(|key| matches!(key, ExclusivityKey::ProcessInstance(_)))
            .collect()
    }

    /// An exclusive job may not start while another exclusive job of its
    /// instance is locked.
    pub fn is_blocked_by(&self, job: &Job, held: &HashSet<ExclusivityKey>) -> bool {
        job.exclusive && held.contains(&self.exclusivity_key(job))
    }

    /// Eligibility predicate; independent of row-level contention.
    pub fn is_acquirable(&self, job: &Job) -> bool {
        if job.retries == 0 || job.is_suspended() {
            return false;
        }
        if !job.is_due(self.now, self.null_due_date_is_due) {
            return false;
        }
        if job.is_locked(self.now) {
            return false;
        }
        if let Some(range) = &self.priority_range {
            if !range.contains(job.priority) {
                return false;
            }
        }
        if let (Some(registered), Some(deployment)) =
            (&self.registered_deployments, &job.deployment_id)
        {
            if !registered.contains(deployment) {
                return false;
            }
        }
        if job.kind == JobKind::HistoryCleanup && !self.history_cleanup_enabled {
            return false;
        }
        true
    }

    /// Filter, order and limit `candidates`.
    ///
    /// `candidates` must include every locked row so that exclusive jobs of
    /// held instances are excluded. `is_row_locked` reports rows held by a
    /// concurrent reader; it is only consulted in skip-locked mode.
    pub fn select<'a>(
        &self,
        candidates: impl IntoIterator<Item = &'a Job>,
        is_row_locked: impl Fn(&Job) -> bool,
    ) -> Vec<Job> {
        let candidates: Vec<&Job> = candidates.into_iter().collect();
        let held = self.held_exclusive_keys(candidates.iter().copied());

        let mut selected: Vec<&Job> = candidates
            .into_iter()
            .filter(|job| self.is_acquirable(job))
            .filter(|job| !self.is_blocked_by(job, &held))
            .filter(|job| !(self.skip_locked && is_row_locked(job)))
            .collect();

        selected.sort_by(|a, b| self.ordering.compare(a, b));
        selected.truncate(self.page_size);
        selected.into_iter().cloned().collect()
    }
}
