//! Job entity and the small capability set acquisition relies on.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{DeploymentId, JobId, ProcessInstanceId};

/// Retries a freshly created job starts with.
pub const DEFAULT_JOB_RETRIES: u32 = 3;

/// Closed set of job kinds sharing the acquirable-jobs contract.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Asynchronous continuation / message job.
    Message,
    /// Timer job (due at a specific instant).
    Timer,
    /// Recurring history cleanup job.
    HistoryCleanup,
}

impl JobKind {
    pub fn is_timer(&self) -> bool {
        matches!(self, JobKind::Timer)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            JobKind::Message => "message",
            JobKind::Timer => "timer",
            JobKind::HistoryCleanup => "history-cleanup",
        }
    }
}

/// Suspension state, inherited from the process instance and job definition.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspensionState {
    #[default]
    Active,
    Suspended,
}

/// Lock stamp written at acquisition time.
///
/// Owner and expiration are only ever set together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLock {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

/// Key under which acquisition groups a job into a batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExclusivityKey {
    /// Runs on its own; may execute in parallel with anything.
    Job(JobId),
    /// Must run sequentially with every other job under the same instance (or hierarchy).
    ProcessInstance(ProcessInstanceId),
}

/// A persisted unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    /// Routing key into the handler registry.
    pub handler_type: String,
    /// Handler-specific payload.
    pub handler_configuration: serde_json::Value,
    /// `None` means "no due date"; whether that is immediately due is configuration.
    pub due_date: Option<DateTime<Utc>>,
    /// Higher runs first.
    pub priority: i64,
    pub lock: Option<JobLock>,
    pub retries: u32,
    pub exclusive: bool,
    pub process_instance_id: Option<ProcessInstanceId>,
    pub root_process_instance_id: Option<ProcessInstanceId>,
    pub deployment_id: Option<DeploymentId>,
    pub suspension_state: SuspensionState,
    pub exception_message: Option<String>,
    pub exception_details: Option<String>,
    /// Number of failed execution attempts so far.
    pub failed_attempts: u32,
    pub created_at: DateTime<Utc>,
    /// Insertion order assigned by the store; natural acquisition order.
    pub sequence: u64,
    /// Optimistic locking revision, bumped on every committed update.
    pub revision: u32,
}

impl Job {
    /// Create a new job of the given kind.
    pub fn new(kind: JobKind, handler_type: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            kind,
            handler_type: handler_type.into(),
            handler_configuration: serde_json::Value::Null,
            due_date: None,
            priority: 0,
            lock: None,
            retries: DEFAULT_JOB_RETRIES,
            exclusive: true,
            process_instance_id: None,
            root_process_instance_id: None,
            deployment_id: None,
            suspension_state: SuspensionState::Active,
            exception_message: None,
            exception_details: None,
            failed_attempts: 0,
            created_at: Utc::now(),
            sequence: 0,
            revision: 1,
        }
    }

    pub fn message(handler_type: impl Into<String>) -> Self {
        Self::new(JobKind::Message, handler_type)
    }

    pub fn timer(handler_type: impl Into<String>, due_date: DateTime<Utc>) -> Self {
        Self::new(JobKind::Timer, handler_type).with_due_date(due_date)
    }

    pub fn history_cleanup(handler_type: impl Into<String>) -> Self {
        Self::new(JobKind::HistoryCleanup, handler_type).with_exclusive(false)
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_due_date(mut self, due_date: DateTime<Utc>) -> Self {
        self.due_date = Some(due_date);
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_configuration(mut self, configuration: serde_json::Value) -> Self {
        self.handler_configuration = configuration;
        self
    }

    /// Attach the job to a top-level process instance (its own root).
    pub fn in_process_instance(mut self, id: impl Into<ProcessInstanceId>) -> Self {
        let id = id.into();
        self.root_process_instance_id = Some(id.clone());
        self.process_instance_id = Some(id);
        self
    }

    /// Attach the job to a called sub-instance of `root`.
    pub fn in_sub_process_instance(
        mut self,
        id: impl Into<ProcessInstanceId>,
        root: impl Into<ProcessInstanceId>,
    ) -> Self {
        self.process_instance_id = Some(id.into());
        self.root_process_instance_id = Some(root.into());
        self
    }

    pub fn with_deployment(mut self, id: impl Into<DeploymentId>) -> Self {
        self.deployment_id = Some(id.into());
        self
    }

    pub fn suspended(mut self) -> Self {
        self.suspension_state = SuspensionState::Suspended;
        self
    }

    pub fn is_suspended(&self) -> bool {
        self.suspension_state == SuspensionState::Suspended
    }

    /// Whether the job's due date has been reached.
    pub fn is_due(&self, now: DateTime<Utc>, null_due_date_is_due: bool) -> bool {
        match self.due_date {
            Some(due) => due <= now,
            None => null_due_date_is_due,
        }
    }

    /// A job is locked only while its lock expiration lies in the future.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lock.as_ref().is_some_and(|l| l.expires_at > now)
    }

    /// Locked by someone other than `owner` and not yet expired.
    pub fn is_locked_by_other(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.lock
            .as_ref()
            .is_some_and(|l| l.owner != owner && l.expires_at > now)
    }

    pub fn lock_owner(&self) -> Option<&str> {
        self.lock.as_ref().map(|l| l.owner.as_str())
    }

    /// Stamp a lock owned by `owner` until `now + duration`.
    pub fn lock_for(&mut self, owner: impl Into<String>, now: DateTime<Utc>, duration: Duration) {
        self.lock = Some(JobLock {
            owner: owner.into(),
            expires_at: now + duration,
        });
    }

    pub fn unlock(&mut self) {
        self.lock = None;
    }

    /// Dead-lettered jobs stay queryable but are never acquired again.
    pub fn is_dead_lettered(&self) -> bool {
        self.retries == 0
    }

    /// Batch key for acquisition.
    ///
    /// Non-exclusive jobs and jobs outside any process instance are keyed by
    /// their own id. Exclusive jobs are keyed by their process instance, or by
    /// the root of the hierarchy when `by_hierarchy` is set.
    pub fn exclusivity_key(&self, by_hierarchy: bool) -> ExclusivityKey {
        if !self.exclusive {
            return ExclusivityKey::Job(self.id);
        }

        let instance = if by_hierarchy {
            self.root_process_instance_id
                .as_ref()
                .or(self.process_instance_id.as_ref())
        } else {
            self.process_instance_id.as_ref()
        };

        match instance {
            Some(id) => ExclusivityKey::ProcessInstance(id.clone()),
            None => ExclusivityKey::Job(self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_expires_without_explicit_unlock() {
        let now = Utc::now();
        let mut job = Job::message("async-continuation");
        job.lock_for("node-a", now, Duration::seconds(10));

        assert!(job.is_locked(now));
        assert!(job.is_locked_by_other("node-b", now));
        assert!(!job.is_locked_by_other("node-a", now));

        let later = now + Duration::seconds(11);
        assert!(!job.is_locked(later));
        assert!(!job.is_locked_by_other("node-b", later));
    }

    #[test]
    fn null_due_date_follows_configuration() {
        let now = Utc::now();
        let job = Job::message("async-continuation");
        assert!(job.is_due(now, true));
        assert!(!job.is_due(now, false));

        let timer = Job::timer("timer-transition", now + Duration::minutes(1));
        assert!(!timer.is_due(now, true));
        assert!(timer.is_due(now + Duration::minutes(1), true));
    }

    #[test]
    fn exclusivity_key_respects_hierarchy_toggle() {
        let root = Job::message("a").in_process_instance("root");
        let child = Job::message("a").in_sub_process_instance("child", "root");

        assert_ne!(root.exclusivity_key(false), child.exclusivity_key(false));
        assert_eq!(root.exclusivity_key(true), child.exclusivity_key(true));
    }

    #[test]
    fn non_exclusive_and_orphan_jobs_get_their_own_key() {
        let shared = Job::message("a")
            .in_process_instance("pi")
            .with_exclusive(false);
        assert_eq!(shared.exclusivity_key(false), ExclusivityKey::Job(shared.id));

        let orphan = Job::message("a");
        assert_eq!(orphan.exclusivity_key(true), ExclusivityKey::Job(orphan.id));
    }

    #[test]
    fn history_cleanup_is_not_exclusive() {
        let job = Job::history_cleanup("history-cleanup");
        assert_eq!(job.kind, JobKind::HistoryCleanup);
        assert!(!job.exclusive);
        assert_eq!(job.kind.type_name(), "history-cleanup");
    }
}
