//! Bounded execution pool for acquired batches.
//!
//! Each batch runs on one worker thread, its job ids strictly in order. Batches
//! run in parallel up to `max_pool_size`. Threads beyond `core_pool_size` are
//! started only when the queue is full and exit after `keep_alive` without work.
//!
//! ```text
//! submit(batch)
//!   workers < core      → new worker runs it
//!   queue has room      → queued
//!   workers < max       → new worker runs it
//!   otherwise           → rejection policy
//! ```

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use jobexec_core::{ConfigError, JobId};

/// Job ids that must execute sequentially on one worker.
pub type Batch = Vec<JobId>;

/// Runs a single acquired job to completion. Implemented by the execution helper.
pub trait JobRunner: Send + Sync {
    fn run_job(&self, job_id: JobId);
}

/// What happens to a batch submitted while the queue is full and every thread is busy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RejectionPolicy {
    /// Drop the batch with a warning; its jobs are picked up again once their locks expire.
    Discard,
    /// Run the batch synchronously on the submitting thread.
    CallerRuns,
    /// Hand the batch back to the submitter, which counts it and retries later.
    #[default]
    AbortAndLog,
}

impl FromStr for RejectionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "discard" => Ok(Self::Discard),
            "callerruns" => Ok(Self::CallerRuns),
            "abortandlog" | "abort" => Ok(Self::AbortAndLog),
            other => Err(ConfigError::invalid(format!("unknown rejection policy: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Prefix of worker thread names.
    pub name: String,
    pub core_pool_size: usize,
    pub max_pool_size: usize,
    pub queue_capacity: usize,
    pub keep_alive: Duration,
    pub rejection_policy: RejectionPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "job-executor".to_string(),
            core_pool_size: 3,
            max_pool_size: 10,
            queue_capacity: 3,
            keep_alive: Duration::from_secs(10),
            rejection_policy: RejectionPolicy::AbortAndLog,
        }
    }
}

/// Result of [`ExecutionPool::submit`].
#[derive(Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Running on a worker or waiting in the queue.
    Accepted,
    /// Executed on the submitting thread before `submit` returned.
    RanOnCaller,
    /// Dropped under [`RejectionPolicy::Discard`].
    Discarded,
    /// Handed back under [`RejectionPolicy::AbortAndLog`] or after shutdown.
    Rejected(Batch),
}

/// How [`ExecutionPool::shutdown`] treats queued batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Drop queued batches; in-flight batches finish.
    Immediate,
    /// Run every queued batch before the workers exit.
    Drain,
}

/// Point-in-time pool gauges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolGauges {
    pub queue_depth: usize,
    pub in_flight_jobs: usize,
    /// Threads currently running a batch.
    pub active_threads: usize,
    /// Live worker threads, busy or idle.
    pub pool_size: usize,
    pub rejection_count: u64,
}

#[derive(Debug, Default)]
struct PoolState {
    queue: VecDeque<Batch>,
    workers: usize,
    active: usize,
    next_worker: usize,
    shutdown: Option<ShutdownMode>,
}

struct Inner {
    config: PoolConfig,
    runner: Arc<dyn JobRunner>,
    state: Mutex<PoolState>,
    work_available: Condvar,
    in_flight: AtomicUsize,
    rejections: AtomicU64,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn run_batch(&self, batch: &[JobId]) {
        for &job_id in batch {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            let result = catch_unwind(AssertUnwindSafe(|| self.runner.run_job(job_id)));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if result.is_err() {
                error!(executor = %self.config.name, job_id = %job_id, "job runner panicked");
            }
        }
    }

    /// Block until a batch is available; `None` means this worker should exit.
    fn next_batch(&self) -> Option<Batch> {
        let mut state = self.lock_state();
        loop {
            if state.shutdown == Some(ShutdownMode::Immediate) {
                break;
            }
            if let Some(batch) = state.queue.pop_front() {
                state.active += 1;
                return Some(batch);
            }
            if state.shutdown == Some(ShutdownMode::Drain) {
                break;
            }
            if state.workers > self.config.core_pool_size {
                let (guard, timeout) = self
                    .work_available
                    .wait_timeout(state, self.config.keep_alive)
                    .unwrap_or_else(|e| e.into_inner());
                state = guard;
                if timeout.timed_out()
                    && state.queue.is_empty()
                    && state.workers > self.config.core_pool_size
                {
                    debug!(executor = %self.config.name, "idle worker exits after keep-alive");
                    break;
                }
            } else {
                state = self
                    .work_available
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner());
            }
        }
        state.workers -= 1;
        None
    }

    fn finish_batch(&self) {
        let mut state = self.lock_state();
        state.active = state.active.saturating_sub(1);
    }
}

fn worker_loop(inner: Arc<Inner>, first: Batch) {
    inner.run_batch(&first);
    inner.finish_batch();

    while let Some(batch) = inner.next_batch() {
        inner.run_batch(&batch);
        inner.finish_batch();
    }
}

/// Thread pool local to one engine process.
pub struct ExecutionPool {
    inner: Arc<Inner>,
}

impl core::fmt::Debug for ExecutionPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ExecutionPool")
            .field("config", &self.inner.config)
            .field("gauges", &self.gauges())
            .finish()
    }
}

impl ExecutionPool {
    pub fn new(config: PoolConfig, runner: Arc<dyn JobRunner>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                runner,
                state: Mutex::new(PoolState::default()),
                work_available: Condvar::new(),
                in_flight: AtomicUsize::new(0),
                rejections: AtomicU64::new(0),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Submit a batch; empty batches are accepted as no-ops.
    pub fn submit(&self, batch: Batch) -> SubmitOutcome {
        if batch.is_empty() {
            return SubmitOutcome::Accepted;
        }

        let inner = &self.inner;
        let mut state = inner.lock_state();
        if state.shutdown.is_some() {
            debug!(executor = %inner.config.name, jobs = batch.len(), "pool shut down, batch rejected");
            return SubmitOutcome::Rejected(batch);
        }

        if state.workers < inner.config.core_pool_size {
            return match self.spawn_worker(&mut state, batch) {
                Ok(()) => SubmitOutcome::Accepted,
                Err(batch) => self.enqueue_or_reject(state, batch),
            };
        }

        self.enqueue_or_reject(state, batch)
    }

    fn enqueue_or_reject(&self, mut state: MutexGuard<'_, PoolState>, batch: Batch) -> SubmitOutcome {
        let inner = &self.inner;
        if state.queue.len() < inner.config.queue_capacity {
            state.queue.push_back(batch);
            inner.work_available.notify_one();
            return SubmitOutcome::Accepted;
        }

        let batch = if state.workers < inner.config.max_pool_size {
            match self.spawn_worker(&mut state, batch) {
                Ok(()) => return SubmitOutcome::Accepted,
                Err(batch) => batch,
            }
        } else {
            batch
        };
        drop(state);

        self.reject(batch)
    }

    fn reject(&self, batch: Batch) -> SubmitOutcome {
        let inner = &self.inner;
        inner.rejections.fetch_add(1, Ordering::Relaxed);
        match inner.config.rejection_policy {
            RejectionPolicy::Discard => {
                warn!(
                    executor = %inner.config.name,
                    jobs = batch.len(),
                    "execution pool saturated, batch discarded"
                );
                SubmitOutcome::Discarded
            }
            RejectionPolicy::CallerRuns => {
                debug!(
                    executor = %inner.config.name,
                    jobs = batch.len(),
                    "execution pool saturated, running batch on caller"
                );
                inner.run_batch(&batch);
                SubmitOutcome::RanOnCaller
            }
            RejectionPolicy::AbortAndLog => {
                warn!(
                    executor = %inner.config.name,
                    jobs = batch.len(),
                    "execution pool saturated, batch rejected"
                );
                SubmitOutcome::Rejected(batch)
            }
        }
    }

    /// Start a worker whose first batch is `batch`; gives the batch back if the
    /// thread could not be spawned.
    fn spawn_worker(&self, state: &mut PoolState, batch: Batch) -> Result<(), Batch> {
        let inner = self.inner.clone();
        let name = format!("{}-worker-{}", self.inner.config.name, state.next_worker);

        // The closure owns the batch; keep a copy to hand back on spawn failure.
        let fallback = batch.clone();
        match thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(inner, batch))
        {
            Ok(handle) => {
                state.workers += 1;
                state.active += 1;
                state.next_worker += 1;
                let mut handles = self.inner.handles.lock().unwrap_or_else(|e| e.into_inner());
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
                debug!(executor = %self.inner.config.name, thread = %name, "worker started");
                Ok(())
            }
            Err(err) => {
                error!(executor = %self.inner.config.name, error = ?err, "failed to spawn worker thread");
                Err(fallback)
            }
        }
    }

    pub fn gauges(&self) -> PoolGauges {
        let state = self.inner.lock_state();
        PoolGauges {
            queue_depth: state.queue.len(),
            in_flight_jobs: self.inner.in_flight.load(Ordering::SeqCst),
            active_threads: state.active,
            pool_size: state.workers,
            rejection_count: self.inner.rejections.load(Ordering::Relaxed),
        }
    }

    /// Whether no batch is queued or running.
    pub fn is_idle(&self) -> bool {
        let state = self.inner.lock_state();
        state.queue.is_empty() && state.active == 0
    }

    /// Stop accepting batches and join every worker.
    ///
    /// Returns the number of queued batches dropped (always 0 for `Drain`).
    pub fn shutdown(&self, mode: ShutdownMode) -> usize {
        let dropped = {
            let mut state = self.inner.lock_state();
            if state.shutdown == Some(ShutdownMode::Immediate) {
                0
            } else {
                state.shutdown = Some(mode);
                match mode {
                    ShutdownMode::Immediate => {
                        let dropped = state.queue.len();
                        state.queue.clear();
                        dropped
                    }
                    ShutdownMode::Drain => 0,
                }
            }
        };
        self.inner.work_available.notify_all();

        let handles: Vec<_> = self
            .inner
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.join();
        }

        info!(executor = %self.inner.config.name, ?mode, dropped, "execution pool stopped");
        dropped
    }
}

impl Drop for ExecutionPool {
    fn drop(&mut self) {
        let mut state = self.inner.lock_state();
        if state.shutdown.is_none() {
            state.shutdown = Some(ShutdownMode::Immediate);
            state.queue.clear();
        }
        drop(state);
        self.inner.work_available.notify_all();
    }
}
