//! Runs one acquired job: handler and completion in one transaction, failure
//! bookkeeping in a second one.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use tracing::{debug, error, warn};

use jobexec_core::{Clock, Job, JobId, ProcessInstanceId, SystemClock};
use jobexec_observability::JobExecutorMetrics;

use crate::command::CommandExecutor;
use crate::job_store::JobStoreError;
use crate::pool::JobRunner;

use super::handler::JobHandlerRegistry;
use super::retry::RetryPolicy;

/// Raised when a job has no retries left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Incident {
    pub job_id: JobId,
    pub handler_type: String,
    pub process_instance_id: Option<ProcessInstanceId>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

pub trait IncidentSink: Send + Sync {
    fn raise(&self, incident: Incident);
}

/// Logs incidents at warn level.
#[derive(Debug, Default)]
pub struct LoggingIncidentSink;

impl IncidentSink for LoggingIncidentSink {
    fn raise(&self, incident: Incident) {
        warn!(
            job_id = %incident.job_id,
            handler_type = %incident.handler_type,
            message = %incident.message,
            "incident raised: job retries exhausted"
        );
    }
}

/// Keeps incidents in memory.
#[derive(Debug, Default)]
pub struct InMemoryIncidentSink {
    incidents: Mutex<Vec<Incident>>,
}

impl InMemoryIncidentSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incidents(&self) -> Vec<Incident> {
        self.incidents.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl IncidentSink for InMemoryIncidentSink {
    fn raise(&self, incident: Incident) {
        self.incidents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(incident);
    }
}

/// Receives every job failure, in addition to the executor's own handling.
pub type ExceptionLogger = Arc<dyn Fn(JobId, &anyhow::Error) + Send + Sync>;

/// Why a job was not executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Deleted between acquisition and execution.
    Missing,
    /// Its lock expired and another node acquired it.
    LockedByOther,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobExecutionOutcome {
    /// Handler succeeded and the job was deleted.
    Succeeded,
    /// Handler failed; retries were decremented.
    Failed { retries_left: u32 },
    /// The job changed concurrently while completing; failure recorded without
    /// consuming a retry.
    Conflicted,
    Skipped(SkipReason),
}

/// Executes acquired jobs by id.
pub struct ExecuteJobHelper {
    commands: CommandExecutor,
    handlers: Arc<JobHandlerRegistry>,
    lock_owner: String,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    metrics: Arc<JobExecutorMetrics>,
    incidents: Arc<dyn IncidentSink>,
    exception_logger: RwLock<Option<ExceptionLogger>>,
    /// Retry jitter source.
    rng: Mutex<StdRng>,
}

impl core::fmt::Debug for ExecuteJobHelper {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExecuteJobHelper")
            .field("lock_owner", &self.lock_owner)
            .field("handlers", &self.handlers)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ExecuteJobHelper {
    pub fn new(
        commands: CommandExecutor,
        handlers: Arc<JobHandlerRegistry>,
        lock_owner: impl Into<String>,
        metrics: Arc<JobExecutorMetrics>,
    ) -> Self {
        Self {
            commands,
            handlers,
            lock_owner: lock_owner.into(),
            retry: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
            metrics,
            incidents: Arc::new(LoggingIncidentSink),
            exception_logger: RwLock::new(None),
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Deterministic retry jitter.
    pub fn with_jitter_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn with_incident_sink(mut self, incidents: Arc<dyn IncidentSink>) -> Self {
        self.incidents = incidents;
        self
    }

    pub fn handlers(&self) -> Arc<JobHandlerRegistry> {
        self.handlers.clone()
    }

    pub fn incident_sink(&self) -> Arc<dyn IncidentSink> {
        self.incidents.clone()
    }

    pub fn exception_logger(&self) -> Option<ExceptionLogger> {
        self.exception_logger
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the exception logger; takes effect for the next failure.
    pub fn set_exception_logger(&self, logger: Option<ExceptionLogger>) {
        *self
            .exception_logger
            .write()
            .unwrap_or_else(|e| e.into_inner()) = logger;
    }

    /// Execute one job.
    ///
    /// Handler failures are part of the outcome; `Err` means the store itself failed.
    pub fn execute_job(&self, job_id: JobId) -> Result<JobExecutionOutcome, JobStoreError> {
        let now = self.clock.now();
        let mut tx = self.commands.store().begin()?;

        let Some(job) = tx.load(job_id)? else {
            tx.rollback();
            debug!(job_id = %job_id, "job vanished before execution, skipping");
            return Ok(JobExecutionOutcome::Skipped(SkipReason::Missing));
        };
        if job.is_locked_by_other(&self.lock_owner, now) {
            tx.rollback();
            debug!(
                job_id = %job_id,
                owner = job.lock_owner().unwrap_or_default(),
                "job locked by another executor, skipping"
            );
            return Ok(JobExecutionOutcome::Skipped(SkipReason::LockedByOther));
        }

        let result = match self.handlers.get(&job.handler_type) {
            Some(handler) => catch_unwind(AssertUnwindSafe(|| handler.execute(&job, tx.as_mut())))
                .unwrap_or_else(|panic| {
                    Err(anyhow!("job handler panicked: {}", panic_message(panic.as_ref())))
                }),
            None => Err(anyhow!(
                "no job handler registered for type '{}'",
                job.handler_type
            )),
        };

        if let Err(err) = result {
            tx.rollback();
            return self.record_failure(job_id, &err, true);
        }

        let completed = match tx.delete(&job) {
            Ok(()) => tx.commit(),
            Err(err) => {
                tx.rollback();
                Err(err)
            }
        };
        match completed {
            Ok(()) => {
                self.metrics.record_job_succeeded();
                debug!(job_id = %job_id, handler_type = %job.handler_type, "job completed");
                Ok(JobExecutionOutcome::Succeeded)
            }
            Err(err) => {
                let conflict = err.is_optimistic_locking();
                self.record_failure(job_id, &anyhow::Error::new(err), !conflict)
            }
        }
    }

    /// Persist a failure in a fresh transaction.
    fn record_failure(
        &self,
        job_id: JobId,
        err: &anyhow::Error,
        consume_retry: bool,
    ) -> Result<JobExecutionOutcome, JobStoreError> {
        self.log_exception(job_id, err);
        let now = self.clock.now();
        let owner = self.lock_owner.as_str();

        let updated = self.commands.run(|tx| -> Result<Result<Job, SkipReason>, JobStoreError> {
            let Some(mut job) = tx.load(job_id)? else {
                return Ok(Err(SkipReason::Missing));
            };
            if job.is_locked_by_other(owner, now) {
                return Ok(Err(SkipReason::LockedByOther));
            }

            if consume_retry {
                job.retries = job.retries.saturating_sub(1);
                job.failed_attempts += 1;
                let delay = {
                    let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
                    self.retry.delay_for_attempt(job.failed_attempts, &mut *rng)
                };
                if !delay.is_zero() && job.retries > 0 {
                    job.due_date = Some(now + chrono::Duration::milliseconds(delay.as_millis() as i64));
                }
            }
            job.exception_message = Some(format!("{err:#}"));
            job.exception_details = Some(format!("{err:?}"));
            job.unlock();
            tx.update(&job)?;
            Ok(Ok(job))
        })?;

        let job = match updated {
            Ok(job) => job,
            Err(reason) => {
                debug!(job_id = %job_id, ?reason, "failed job vanished or was re-acquired, nothing recorded");
                return Ok(JobExecutionOutcome::Skipped(reason));
            }
        };

        if !consume_retry {
            debug!(job_id = %job_id, error = %err, "job completion conflicted, retry not consumed");
            return Ok(JobExecutionOutcome::Conflicted);
        }

        self.metrics.record_job_failed();
        if job.retries == 0 {
            warn!(
                job_id = %job_id,
                handler_type = %job.handler_type,
                failed_attempts = job.failed_attempts,
                error = %err,
                "job failed with no retries left"
            );
            self.metrics.record_incident();
            self.incidents.raise(Incident {
                job_id,
                handler_type: job.handler_type.clone(),
                process_instance_id: job.process_instance_id.clone(),
                message: format!("{err:#}"),
                created_at: now,
            });
        } else {
            debug!(
                job_id = %job_id,
                retries_left = job.retries,
                error = %err,
                "job failed, will be retried"
            );
        }
        Ok(JobExecutionOutcome::Failed {
            retries_left: job.retries,
        })
    }

    fn log_exception(&self, job_id: JobId, err: &anyhow::Error) {
        if let Some(logger) = self.exception_logger() {
            if catch_unwind(AssertUnwindSafe(|| logger(job_id, err))).is_err() {
                error!(job_id = %job_id, "exception logger panicked");
            }
        }
    }
}

impl JobRunner for ExecuteJobHelper {
    fn run_job(&self, job_id: JobId) {
        if let Err(err) = self.execute_job(job_id) {
            error!(job_id = %job_id, error = ?err, "job execution aborted by store failure");
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
