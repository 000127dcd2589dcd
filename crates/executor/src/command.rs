//! Transactional command execution.
//!
//! Every unit of work the scheduler performs against the job store (acquiring
//! a page of jobs, executing one job, recording a failure) runs as a command:
//!
//! ```text
//! begin transaction
//!   ↓
//! command reads / buffers writes
//!   ↓
//! Ok  → commit (optimistic locking check; may still fail)
//! Err → rollback
//! ```
//!
//! No IO happens here beyond what the injected store does.

use std::sync::Arc;

use crate::job_store::{JobStore, JobStoreError, JobTransaction};

/// A unit of work executed inside one transaction.
pub trait Command {
    type Output;
    type Error: From<JobStoreError>;

    fn execute(&self, tx: &mut dyn JobTransaction) -> Result<Self::Output, Self::Error>;
}

/// Runs commands transactionally against a shared job store.
#[derive(Clone)]
pub struct CommandExecutor {
    store: Arc<dyn JobStore>,
}

impl core::fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandExecutor").finish_non_exhaustive()
    }
}

impl CommandExecutor {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Execute `command` in a fresh transaction.
    pub fn execute<C: Command>(&self, command: &C) -> Result<C::Output, C::Error> {
        self.run(|tx| command.execute(tx))
    }

    /// Execute a closure in a fresh transaction; commit on `Ok`, roll back on `Err`.
    pub fn run<T, E>(
        &self,
        work: impl FnOnce(&mut dyn JobTransaction) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<JobStoreError>,
    {
        let mut tx = self.store.begin()?;
        match work(tx.as_mut()) {
            Ok(output) => {
                tx.commit()?;
                Ok(output)
            }
            Err(err) => {
                tx.rollback();
                Err(err)
            }
        }
    }
}
