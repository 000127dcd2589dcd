//! Job executor: owns the acquisition thread and the execution pool of one engine.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use jobexec_core::{Clock, ConfigError, ConfigResult, DeploymentId, Job, PriorityRange, SystemClock};
use jobexec_observability::{JobExecutorMetrics, MetricsSnapshot};

use crate::acquisition::{AcquisitionLoop, BackoffJobAcquisitionStrategy, WakeSignal};
use crate::command::CommandExecutor;
use crate::config::JobExecutorConfig;
use crate::deployment::DeploymentRegistry;
use crate::execution::{ExceptionLogger, ExecuteJobHelper, IncidentSink, JobHandlerRegistry};
use crate::job_store::{JobStore, JobStoreError};
use crate::pool::{ExecutionPool, JobRunner, PoolGauges, ShutdownMode};

/// Name of the acquisition thread.
pub const ACQUISITION_THREAD_NAME: &str = "job-acquisition";

#[derive(Debug, Error)]
pub enum JobExecutorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error("failed to spawn {thread} thread: {source}")]
    Spawn {
        thread: String,
        #[source]
        source: std::io::Error,
    },
    #[error("job executor {0} is already running")]
    AlreadyStarted(String),
}

/// Executor counters plus pool gauges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorMetrics {
    #[serde(flatten)]
    pub counters: MetricsSnapshot,
    pub pool: PoolGauges,
    pub active: bool,
}

struct Running {
    signal: Arc<WakeSignal>,
    pool: Arc<ExecutionPool>,
    join: thread::JoinHandle<()>,
}

/// Acquires due jobs from a shared store and executes them on a local pool.
///
/// Any number of executors (typically one per engine process) may run against
/// the same store.
pub struct JobExecutor {
    config: JobExecutorConfig,
    priority_range: PriorityRange,
    commands: CommandExecutor,
    helper: Arc<ExecuteJobHelper>,
    deployments: Arc<DeploymentRegistry>,
    metrics: Arc<JobExecutorMetrics>,
    clock: Arc<dyn Clock>,
    jitter_seed: Option<u64>,
    running: Mutex<Option<Running>>,
}

impl core::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("name", &self.config.name)
            .field("lock_owner", &self.config.lock_owner)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl JobExecutor {
    /// Validate `config` and assemble an executor; nothing runs until [`JobExecutor::start`].
    pub fn new(
        config: JobExecutorConfig,
        store: Arc<dyn JobStore>,
        handlers: JobHandlerRegistry,
    ) -> Result<Self, JobExecutorError> {
        config.validate()?;
        let priority_range = config.priority_range()?;
        let commands = CommandExecutor::new(store);
        let metrics = Arc::new(JobExecutorMetrics::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let helper = ExecuteJobHelper::new(
            commands.clone(),
            Arc::new(handlers),
            config.lock_owner.clone(),
            metrics.clone(),
        )
        .with_retry_policy(config.failed_job_retry.clone())
        .with_clock(clock.clone());

        Ok(Self {
            config,
            priority_range,
            commands,
            helper: Arc::new(helper),
            deployments: Arc::new(DeploymentRegistry::new()),
            metrics,
            clock,
            jitter_seed: None,
            running: Mutex::new(None),
        })
    }

    /// Replace the clock (before start).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock.clone();
        self.rebuild_helper(|helper| helper.with_clock(clock));
        self
    }

    /// Replace the incident sink (before start).
    pub fn with_incident_sink(mut self, incidents: Arc<dyn IncidentSink>) -> Self {
        self.rebuild_helper(|helper| helper.with_incident_sink(incidents));
        self
    }

    /// Seed backoff and retry jitter for reproducible runs.
    pub fn with_jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = Some(seed);
        self.rebuild_helper(|helper| helper);
        self
    }

    fn rebuild_helper(&mut self, configure: impl FnOnce(ExecuteJobHelper) -> ExecuteJobHelper) {
        let previous = &self.helper;
        let helper = ExecuteJobHelper::new(
            self.commands.clone(),
            previous.handlers(),
            self.config.lock_owner.clone(),
            self.metrics.clone(),
        )
        .with_retry_policy(self.config.failed_job_retry.clone())
        .with_clock(self.clock.clone())
        .with_incident_sink(previous.incident_sink());
        let helper = match self.jitter_seed {
            Some(seed) => configure(helper.with_jitter_seed(seed)),
            None => configure(helper),
        };
        helper.set_exception_logger(previous.exception_logger());
        self.helper = Arc::new(helper);
    }

    pub fn config(&self) -> &JobExecutorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        self.commands.store()
    }

    pub fn execution_helper(&self) -> &Arc<ExecuteJobHelper> {
        &self.helper
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start the execution pool and the acquisition thread.
    pub fn start(&self) -> Result<(), JobExecutorError> {
        let mut running = self.lock_running();
        if running.is_some() {
            return Err(JobExecutorError::AlreadyStarted(self.config.name.clone()));
        }

        let runner: Arc<dyn JobRunner> = self.helper.clone();
        let pool = Arc::new(ExecutionPool::new(self.config.pool_config(), runner));

        let mut acquisition = AcquisitionLoop::new(
            self.config.clone(),
            self.commands.clone(),
            pool.clone(),
            self.deployments.clone(),
            self.metrics.clone(),
        )
        .with_clock(self.clock.clone());
        if let Some(seed) = self.jitter_seed {
            acquisition =
                acquisition.with_strategy(Box::new(BackoffJobAcquisitionStrategy::seeded(&self.config, seed)));
        }
        let signal = acquisition.signal();

        let join = thread::Builder::new()
            .name(ACQUISITION_THREAD_NAME.to_string())
            .spawn(move || acquisition.run())
            .map_err(|source| JobExecutorError::Spawn {
                thread: ACQUISITION_THREAD_NAME.to_string(),
                source,
            })?;

        info!(
            executor = %self.config.name,
            lock_owner = %self.config.lock_owner,
            "job executor started"
        );
        *running = Some(Running { signal, pool, join });
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.lock_running().is_some()
    }

    /// Stop acquiring; in-flight batches finish, queued batches are dropped and
    /// recovered once their locks expire.
    pub fn shutdown(&self) {
        self.stop(ShutdownMode::Immediate);
    }

    /// Stop acquiring and run every queued batch before returning.
    pub fn shutdown_and_wait(&self) {
        self.stop(ShutdownMode::Drain);
    }

    fn stop(&self, mode: ShutdownMode) {
        let Some(running) = self.lock_running().take() else {
            return;
        };

        running.signal.shutdown();
        if running.join.join().is_err() {
            tracing::error!(executor = %self.config.name, "acquisition thread panicked");
        }
        running.pool.shutdown(mode);
        info!(executor = %self.config.name, ?mode, "job executor stopped");
    }

    /// Hint that a job was created; re-acquires immediately if the job is due
    /// and within this executor's priority range.
    pub fn job_was_added(&self, job: &Job) {
        let running = self.lock_running();
        let Some(running) = running.as_ref() else {
            return;
        };
        let due = job.is_due(self.clock.now(), !self.config.ensure_job_due_date_not_null);
        if due && self.priority_range.contains(job.priority) {
            debug!(executor = %self.config.name, job_id = %job.id, "new job available, waking acquisition");
            running.signal.wake();
        }
    }

    pub fn register_deployment(&self, id: impl Into<DeploymentId>) -> ConfigResult<bool> {
        self.deployments.register(id.into())
    }

    pub fn unregister_deployment(&self, id: impl Into<DeploymentId>) -> ConfigResult<bool> {
        self.deployments.unregister(&id.into())
    }

    pub fn registered_deployments(&self) -> HashSet<DeploymentId> {
        self.deployments.snapshot()
    }

    /// Replace the exception logger at runtime.
    pub fn set_exception_logger(&self, logger: Option<ExceptionLogger>) {
        self.helper.set_exception_logger(logger);
    }

    pub fn metrics(&self) -> ExecutorMetrics {
        let running = self.lock_running();
        ExecutorMetrics {
            counters: self.metrics.snapshot(),
            pool: running
                .as_ref()
                .map(|r| r.pool.gauges())
                .unwrap_or_default(),
            active: running.is_some(),
        }
    }
}

impl Drop for JobExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
