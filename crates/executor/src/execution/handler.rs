//! Job handlers and their registry.

use std::collections::HashMap;
use std::sync::Arc;

use jobexec_core::Job;

use crate::job_store::JobTransaction;

/// Executes the work behind one job type.
///
/// Runs inside the job's transaction: writes made through `tx` commit together
/// with the deletion of the job, or roll back with it on failure.
pub trait JobHandler: Send + Sync {
    fn execute(&self, job: &Job, tx: &mut dyn JobTransaction) -> anyhow::Result<()>;
}

impl<F> JobHandler for F
where
    F: Fn(&Job, &mut dyn JobTransaction) -> anyhow::Result<()> + Send + Sync,
{
    fn execute(&self, job: &Job, tx: &mut dyn JobTransaction) -> anyhow::Result<()> {
        self(job, tx)
    }
}

/// Handler lookup by job handler type.
///
/// Built once at startup and shared by reference with the execution helper.
#[derive(Clone, Default)]
pub struct JobHandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl core::fmt::Debug for JobHandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut types: Vec<&String> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("JobHandlerRegistry")
            .field("handler_types", &types)
            .finish()
    }
}

impl JobHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a handler type.
    ///
    /// `"prefix.*"` patterns match every type starting with `prefix.`; `"*"`
    /// matches anything not matched otherwise.
    pub fn register(&mut self, handler_type: impl Into<String>, handler: impl JobHandler + 'static) {
        self.handlers.insert(handler_type.into(), Arc::new(handler));
    }

    pub fn with_handler(
        mut self,
        handler_type: impl Into<String>,
        handler: impl JobHandler + 'static,
    ) -> Self {
        self.register(handler_type, handler);
        self
    }

    pub fn get(&self, handler_type: &str) -> Option<Arc<dyn JobHandler>> {
        // Try exact match first
        if let Some(h) = self.handlers.get(handler_type) {
            return Some(h.clone());
        }

        // Longest matching category wins
        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = handler_type.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len);
        if let Some((_, handler)) = category {
            return Some(handler.clone());
        }

        self.handlers.get("*").cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
