//! Job acquisition: the transactional acquisition command, its result, the
//! adaptive wait strategy and the loop tying them together.

pub mod acquired;
pub mod command;
pub mod runnable;
pub mod strategy;

pub use acquired::AcquiredJobs;
pub use command::{AcquireJobsCmd, AcquisitionError};
pub use runnable::{AcquisitionLoop, WakeSignal};
pub use strategy::{AcquisitionOutcome, BackoffJobAcquisitionStrategy, JobAcquisitionStrategy};
