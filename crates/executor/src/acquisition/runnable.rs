//! The acquisition control loop.
//!
//! ```text
//! loop {
//!   resubmit batches the pool rejected last time
//!   acquire a page of jobs (one transaction)
//!   dispatch each batch to the pool
//!   feed the outcome to the strategy
//!   wait (interrupted by shutdown or a new-job hint)
//! }
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use jobexec_core::{Clock, SystemClock};
use jobexec_observability::JobExecutorMetrics;

use crate::command::CommandExecutor;
use crate::config::JobExecutorConfig;
use crate::deployment::DeploymentRegistry;
use crate::pool::{Batch, ExecutionPool, SubmitOutcome};

use super::command::{AcquireJobsCmd, AcquisitionError};
use super::strategy::{AcquisitionOutcome, BackoffJobAcquisitionStrategy, JobAcquisitionStrategy};

#[derive(Debug, Default)]
struct SignalState {
    woken: bool,
    shutdown: bool,
}

/// Interruptible sleep shared between the loop and its controllers.
#[derive(Debug, Default)]
pub struct WakeSignal {
    state: Mutex<SignalState>,
    changed: Condvar,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cut the current (or next) wait short.
    pub fn wake(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.woken = true;
        self.changed.notify_all();
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.shutdown = true;
        self.changed.notify_all();
    }

    /// Drop a wake that arrived before the cycle about to run.
    pub fn clear_pending_wake(&self) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).woken = false;
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).shutdown
    }

    /// Sleep up to `timeout`; returns early on wake or shutdown. Consumes a pending wake.
    pub fn wait(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while !state.woken && !state.shutdown {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        state.woken = false;
    }
}

/// One engine's acquisition loop. Runs on its own thread via [`AcquisitionLoop::run`],
/// or cycle by cycle via [`AcquisitionLoop::run_cycle`].
pub struct AcquisitionLoop {
    config: JobExecutorConfig,
    commands: CommandExecutor,
    pool: Arc<ExecutionPool>,
    deployments: Arc<DeploymentRegistry>,
    metrics: Arc<JobExecutorMetrics>,
    clock: Arc<dyn Clock>,
    strategy: Box<dyn JobAcquisitionStrategy>,
    signal: Arc<WakeSignal>,
    rejected: VecDeque<Batch>,
    skip_locked: bool,
}

impl core::fmt::Debug for AcquisitionLoop {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AcquisitionLoop")
            .field("executor", &self.config.name)
            .field("skip_locked", &self.skip_locked)
            .field("pending_rejected", &self.rejected.len())
            .finish_non_exhaustive()
    }
}

impl AcquisitionLoop {
    pub fn new(
        config: JobExecutorConfig,
        commands: CommandExecutor,
        pool: Arc<ExecutionPool>,
        deployments: Arc<DeploymentRegistry>,
        metrics: Arc<JobExecutorMetrics>,
    ) -> Self {
        let store_supports = commands.store().supports_skip_locked();
        if config.acquire_with_skip_locked && !store_supports {
            warn!(
                executor = %config.name,
                "job store does not support skip-locked queries, using plain acquisition"
            );
        }

        Self {
            skip_locked: config.acquire_with_skip_locked && store_supports,
            strategy: Box::new(BackoffJobAcquisitionStrategy::new(&config)),
            config,
            commands,
            pool,
            deployments,
            metrics,
            clock: Arc::new(SystemClock),
            signal: Arc::new(WakeSignal::new()),
            rejected: VecDeque::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_strategy(mut self, strategy: Box<dyn JobAcquisitionStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn signal(&self) -> Arc<WakeSignal> {
        self.signal.clone()
    }

    /// Batches the pool rejected and that wait for resubmission.
    pub fn pending_rejected(&self) -> usize {
        self.rejected.len()
    }

    /// Run until the signal is shut down.
    pub fn run(mut self) {
        info!(executor = %self.config.name, skip_locked = self.skip_locked, "job acquisition started");

        while !self.signal.is_shutdown() {
            let wait = self.run_cycle();
            if !wait.is_zero() && !self.signal.is_shutdown() {
                debug!(executor = %self.config.name, wait_ms = wait.as_millis() as u64, "acquisition waiting");
                self.signal.wait(wait);
            }
        }

        if !self.rejected.is_empty() {
            info!(
                executor = %self.config.name,
                batches = self.rejected.len(),
                "dropping rejected batches on shutdown; their locks will expire"
            );
        }
        info!(executor = %self.config.name, "job acquisition stopped");
    }

    /// One acquisition cycle; returns the wait before the next one.
    pub fn run_cycle(&mut self) -> Duration {
        // this cycle serves any hint received so far
        self.signal.clear_pending_wake();

        if !self.resubmit_rejected() {
            self.strategy.reconfigure(AcquisitionOutcome::Skipped, true);
            return self.strategy.wait_time();
        }

        let requested = self.strategy.num_jobs_to_acquire();
        let command = AcquireJobsCmd::from_config(
            &self.config,
            self.clock.now(),
            requested,
            || self.deployments.snapshot(),
            self.skip_locked,
        );

        self.metrics.record_acquisition_attempt();
        let mut saturated = false;
        let outcome = match self.commands.execute(&command) {
            Ok(acquired) => {
                let outcome = AcquisitionOutcome::Acquired {
                    requested,
                    acquired: acquired.size(),
                    failed_to_lock: acquired.number_of_jobs_failed_to_lock(),
                };
                self.metrics.record_jobs_acquired(acquired.size());
                self.metrics
                    .record_jobs_failed_to_lock(acquired.number_of_jobs_failed_to_lock());
                if !acquired.is_empty() {
                    debug!(
                        executor = %self.config.name,
                        jobs = acquired.size(),
                        batches = acquired.batches().len(),
                        "acquired jobs"
                    );
                }

                for batch in acquired.into_batches() {
                    saturated |= self.dispatch(batch);
                }
                outcome
            }
            Err(AcquisitionError::Conflict(err)) => {
                self.metrics.record_acquisition_conflict();
                debug!(executor = %self.config.name, error = %err, "job acquisition conflicted");
                AcquisitionOutcome::Conflict
            }
            Err(AcquisitionError::Store(err)) => {
                self.metrics.record_acquisition_failure();
                error!(executor = %self.config.name, error = ?err, "job acquisition failed");
                AcquisitionOutcome::Failed
            }
        };

        self.strategy.reconfigure(outcome, saturated);
        self.strategy.wait_time()
    }

    /// Submit a batch; returns `true` if the pool was saturated.
    fn dispatch(&mut self, batch: Batch) -> bool {
        match self.pool.submit(batch) {
            SubmitOutcome::Accepted | SubmitOutcome::RanOnCaller => false,
            SubmitOutcome::Discarded => {
                self.metrics.record_batch_rejected();
                true
            }
            SubmitOutcome::Rejected(batch) => {
                self.metrics.record_batch_rejected();
                self.rejected.push_back(batch);
                true
            }
        }
    }

    /// Resubmit previously rejected batches; `false` if some are still rejected.
    fn resubmit_rejected(&mut self) -> bool {
        let pending = std::mem::take(&mut self.rejected);
        let total = pending.len();
        for batch in pending {
            match self.pool.submit(batch) {
                SubmitOutcome::Rejected(batch) => self.rejected.push_back(batch),
                SubmitOutcome::Discarded => self.metrics.record_batch_rejected(),
                SubmitOutcome::Accepted | SubmitOutcome::RanOnCaller => {}
            }
        }
        if total > 0 {
            debug!(
                executor = %self.config.name,
                resubmitted = total - self.rejected.len(),
                still_rejected = self.rejected.len(),
                "resubmitted rejected batches"
            );
        }
        self.rejected.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_store::{
        AcquirableJobsQuery, InMemoryJobStore, JobStats, JobStore, JobStoreError, JobTransaction,
    };
    use crate::pool::{JobRunner, PoolConfig, RejectionPolicy, ShutdownMode};
    use chrono::{DateTime, Utc};
    use jobexec_core::{ExclusivityKey, Job, JobId, ManualClock};
    use std::collections::HashSet;
    use std::thread;

    #[derive(Default)]
    struct Recorder {
        ran: Mutex<Vec<JobId>>,
    }

    impl JobRunner for Recorder {
        fn run_job(&self, job_id: JobId) {
            self.ran.lock().unwrap().push(job_id);
        }
    }

    /// In-memory store without skip-locked support whose commits can be made to conflict.
    #[derive(Default)]
    struct ScriptedStore {
        inner: InMemoryJobStore,
        conflict_on_commit: Mutex<bool>,
    }

    struct ScriptedTx<'a> {
        inner: Box<dyn JobTransaction + 'a>,
        conflict: bool,
    }

    impl JobTransaction for ScriptedTx<'_> {
        fn find_acquirable_jobs(
            &mut self,
            query: &AcquirableJobsQuery,
        ) -> Result<Vec<Job>, JobStoreError> {
            self.inner.find_acquirable_jobs(query)
        }
        fn held_exclusive_keys(
            &mut self,
            query: &AcquirableJobsQuery,
        ) -> Result<HashSet<ExclusivityKey>, JobStoreError> {
            self.inner.held_exclusive_keys(query)
        }
        fn load(&mut self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
            self.inner.load(job_id)
        }
        fn insert(&mut self, job: Job) -> Result<JobId, JobStoreError> {
            self.inner.insert(job)
        }
        fn update(&mut self, job: &Job) -> Result<(), JobStoreError> {
            self.inner.update(job)
        }
        fn delete(&mut self, job: &Job) -> Result<(), JobStoreError> {
            self.inner.delete(job)
        }
        fn commit(self: Box<Self>) -> Result<(), JobStoreError> {
            if self.conflict {
                self.inner.rollback();
                return Err(JobStoreError::OptimisticLocking {
                    entity: "job",
                    id: JobId::new(),
                });
            }
            self.inner.commit()
        }
        fn rollback(self: Box<Self>) {
            self.inner.rollback()
        }
    }

    impl JobStore for ScriptedStore {
        fn begin(&self) -> Result<Box<dyn JobTransaction + '_>, JobStoreError> {
            Ok(Box::new(ScriptedTx {
                inner: self.inner.begin()?,
                conflict: *self.conflict_on_commit.lock().unwrap(),
            }))
        }
        fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
            self.inner.get(job_id)
        }
        fn list(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
            self.inner.list(limit)
        }
        fn failed_jobs(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
            self.inner.failed_jobs(limit)
        }
        fn stats(&self, now: DateTime<Utc>) -> Result<JobStats, JobStoreError> {
            self.inner.stats(now)
        }
    }

    fn pool(policy: RejectionPolicy, queue: usize, runner: Arc<dyn JobRunner>) -> Arc<ExecutionPool> {
        Arc::new(ExecutionPool::new(
            PoolConfig {
                core_pool_size: 1,
                max_pool_size: 1,
                queue_capacity: queue,
                rejection_policy: policy,
                ..PoolConfig::default()
            },
            runner,
        ))
    }

    fn acquisition_loop(
        config: JobExecutorConfig,
        store: Arc<InMemoryJobStore>,
        pool: Arc<ExecutionPool>,
    ) -> (AcquisitionLoop, Arc<JobExecutorMetrics>) {
        let metrics = Arc::new(JobExecutorMetrics::new());
        let acquisition = AcquisitionLoop::new(
            config.clone(),
            CommandExecutor::new(store),
            pool,
            Arc::new(DeploymentRegistry::new()),
            metrics.clone(),
        )
        .with_strategy(Box::new(BackoffJobAcquisitionStrategy::seeded(&config, 11)))
        .with_clock(Arc::new(ManualClock::starting_now()));
        (acquisition, metrics)
    }

    #[test]
    fn dispatches_acquired_batches_and_reports_idle() {
        let store = InMemoryJobStore::arc();
        for _ in 0..2 {
            store.insert(Job::message("a")).unwrap();
        }
        let runner = Arc::new(Recorder::default());
        let pool = pool(RejectionPolicy::AbortAndLog, 10, runner.clone());
        let config = JobExecutorConfig::default().with_wait(Duration::from_millis(500), Duration::from_secs(5));
        let (mut acquisition, metrics) = acquisition_loop(config, store, pool.clone());

        // partial page: no idle level, no backoff
        assert_eq!(acquisition.run_cycle(), Duration::ZERO);
        assert_eq!(acquisition.run_cycle(), Duration::from_millis(500));
        assert_eq!(acquisition.run_cycle(), Duration::from_millis(1_000));

        pool.shutdown(ShutdownMode::Drain);
        assert_eq!(runner.ran.lock().unwrap().len(), 2);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.acquisition_attempts, 3);
        assert_eq!(snapshot.jobs_acquired, 2);
    }

    #[test]
    fn rejected_batches_are_resubmitted_before_acquiring() {
        struct Blocking(Mutex<bool>, Condvar);
        impl JobRunner for Blocking {
            fn run_job(&self, _: JobId) {
                let mut open = self.0.lock().unwrap();
                while !*open {
                    open = self.1.wait(open).unwrap();
                }
            }
        }

        let store = InMemoryJobStore::arc();
        for i in 0..3 {
            store
                .insert(Job::message("a").in_process_instance(format!("pi-{i}")))
                .unwrap();
        }
        let runner = Arc::new(Blocking(Mutex::new(false), Condvar::new()));
        let pool = pool(RejectionPolicy::AbortAndLog, 1, runner.clone());
        let (mut acquisition, metrics) =
            acquisition_loop(JobExecutorConfig::default(), store.clone(), pool.clone());

        // one running, one queued, one rejected
        assert_eq!(acquisition.run_cycle(), Duration::from_millis(100));
        assert_eq!(acquisition.pending_rejected(), 1);
        assert_eq!(metrics.snapshot().batches_rejected, 1);

        // still saturated: acquisition is skipped
        store.insert(Job::message("a")).unwrap();
        assert_eq!(acquisition.run_cycle(), Duration::from_millis(100));
        assert_eq!(metrics.snapshot().acquisition_attempts, 1);

        *runner.0.lock().unwrap() = true;
        runner.1.notify_all();
        while !pool.is_idle() {
            thread::sleep(Duration::from_millis(5));
        }

        acquisition.run_cycle();
        assert_eq!(acquisition.pending_rejected(), 0);
        assert_eq!(metrics.snapshot().acquisition_attempts, 2);
        assert_eq!(metrics.snapshot().jobs_acquired, 4);
        pool.shutdown(ShutdownMode::Drain);
    }

    #[test]
    fn conflict_is_counted_and_backs_off() {
        let store = Arc::new(ScriptedStore::default());
        store.inner.insert(Job::message("a")).unwrap();
        *store.conflict_on_commit.lock().unwrap() = true;

        let pool = pool(RejectionPolicy::AbortAndLog, 10, Arc::new(Recorder::default()));
        let config = JobExecutorConfig::default()
            .with_backoff(Duration::from_millis(50), Duration::from_millis(500));
        let metrics = Arc::new(JobExecutorMetrics::new());
        let mut acquisition = AcquisitionLoop::new(
            config.clone(),
            CommandExecutor::new(store.clone()),
            pool.clone(),
            Arc::new(DeploymentRegistry::new()),
            metrics.clone(),
        )
        .with_strategy(Box::new(BackoffJobAcquisitionStrategy::seeded(&config, 3)));

        let wait = acquisition.run_cycle();
        assert!(wait >= Duration::from_millis(100) && wait <= Duration::from_millis(150));
        assert_eq!(metrics.snapshot().acquisition_conflicts, 1);
        assert_eq!(metrics.snapshot().jobs_acquired, 0);
        // nothing of the failed attempt persisted
        assert!(store.inner.list(10).unwrap()[0].lock.is_none());

        *store.conflict_on_commit.lock().unwrap() = false;
        acquisition.run_cycle();
        assert_eq!(metrics.snapshot().jobs_acquired, 1);
        pool.shutdown(ShutdownMode::Drain);
    }

    #[test]
    fn wake_signal_interrupts_wait() {
        let signal = Arc::new(WakeSignal::new());
        let waker = {
            let signal = signal.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                signal.wake();
            })
        };
        let started = Instant::now();
        signal.wait(Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(5));
        waker.join().unwrap();

        signal.shutdown();
        signal.wait(Duration::from_secs(10));
        assert!(signal.is_shutdown());
    }

    #[test]
    fn hint_served_by_a_cycle_does_not_cut_the_next_wait() {
        let store = InMemoryJobStore::arc();
        let pool = pool(RejectionPolicy::AbortAndLog, 10, Arc::new(Recorder::default()));
        let (mut acquisition, _) = acquisition_loop(JobExecutorConfig::default(), store, pool.clone());
        let signal = acquisition.signal();

        signal.wake();
        acquisition.run_cycle();

        let started = Instant::now();
        signal.wait(Duration::from_millis(40));
        assert!(started.elapsed() >= Duration::from_millis(40));
        pool.shutdown(ShutdownMode::Drain);
    }

    #[test]
    fn unsupported_skip_locked_falls_back() {
        let store: Arc<dyn JobStore> = Arc::new(ScriptedStore::default());
        let acquisition = AcquisitionLoop::new(
            JobExecutorConfig::default().with_skip_locked(true),
            CommandExecutor::new(store),
            pool(RejectionPolicy::AbortAndLog, 1, Arc::new(Recorder::default())),
            Arc::new(DeploymentRegistry::new()),
            Arc::new(JobExecutorMetrics::new()),
        );
        assert!(!acquisition.skip_locked);
    }
}
