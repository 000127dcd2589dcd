//! Job execution: handler registry, retry policy and the per-job execution helper.

pub mod handler;
pub mod helper;
pub mod retry;

pub use handler::{JobHandler, JobHandlerRegistry};
pub use helper::{
    ExceptionLogger, ExecuteJobHelper, InMemoryIncidentSink, Incident, IncidentSink,
    JobExecutionOutcome, LoggingIncidentSink, SkipReason,
};
pub use retry::{RetryBackoff, RetryPolicy};
