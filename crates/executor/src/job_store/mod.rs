//! Job store boundary.
//!
//! The durable job table is an external collaborator; this module defines the
//! narrow contract the scheduler consumes (acquirable-jobs query, transactional
//! writes with optimistic locking) plus an in-memory implementation.

pub mod in_memory;
pub mod query;
pub mod r#trait;

pub use in_memory::{InMemoryJobStore, InMemoryJobTransaction};
pub use query::{AcquirableJobsQuery, AcquisitionOrdering};
pub use r#trait::{JobStats, JobStore, JobStoreError, JobTransaction};
