//! `jobexec-core` — domain building blocks of the job scheduler.
//!
//! This crate contains **pure domain** primitives (no storage, threads or IO):
//! job entities, identifiers, the acquisition priority window and the clock
//! abstraction every time-dependent decision goes through.

pub mod clock;
pub mod error;
pub mod id;
pub mod job;
pub mod priority;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ConfigError, ConfigResult};
pub use id::{DeploymentId, JobId, ProcessInstanceId};
pub use job::{ExclusivityKey, Job, JobKind, JobLock, SuspensionState};
pub use priority::PriorityRange;
