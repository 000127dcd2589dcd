//! Job acquisition and execution.
//!
//! ```text
//! JobStore ──► AcquisitionLoop ──► AcquireJobsCmd (lock + batch) ──► ExecutionPool
//!                  ▲   │                                                   │
//!   job_was_added ─┘   └── BackoffJobAcquisitionStrategy (wait, page)      ▼
//!                                                              ExecuteJobHelper ──► JobHandler
//! ```
//!
//! Several executors may share one store; row locks with an expiration and
//! optimistic locking on commit keep them from running a job twice.

pub mod acquisition;
pub mod command;
pub mod config;
pub mod deployment;
pub mod execution;
pub mod executor;
pub mod job_store;
pub mod pool;

#[cfg(test)]
mod integration_tests;

pub use acquisition::{
    AcquiredJobs, AcquireJobsCmd, AcquisitionError, AcquisitionLoop, AcquisitionOutcome,
    BackoffJobAcquisitionStrategy, JobAcquisitionStrategy, WakeSignal,
};
pub use command::{Command, CommandExecutor};
pub use config::JobExecutorConfig;
pub use deployment::DeploymentRegistry;
pub use execution::{
    ExceptionLogger, ExecuteJobHelper, InMemoryIncidentSink, Incident, IncidentSink,
    JobExecutionOutcome, JobHandler, JobHandlerRegistry, RetryBackoff, RetryPolicy,
};
pub use executor::{ExecutorMetrics, JobExecutor, JobExecutorError};
pub use job_store::{
    AcquirableJobsQuery, AcquisitionOrdering, InMemoryJobStore, JobStats, JobStore,
    JobStoreError, JobTransaction,
};
pub use pool::{ExecutionPool, PoolConfig, PoolGauges, RejectionPolicy, ShutdownMode, SubmitOutcome};
