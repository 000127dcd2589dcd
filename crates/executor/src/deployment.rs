//! Deployments registered with this engine's job executor.
//!
//! Mutated by the deployment lifecycle; read by every acquisition cycle when
//! deployment awareness is enabled.

use std::collections::HashSet;
use std::sync::RwLock;

use tracing::info;

use jobexec_core::{ConfigError, ConfigResult, DeploymentId};

#[derive(Debug, Default)]
pub struct DeploymentRegistry {
    deployments: RwLock<HashSet<DeploymentId>>,
}

impl DeploymentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn validate(id: &DeploymentId) -> ConfigResult<()> {
        if id.as_str().trim().is_empty() {
            return Err(ConfigError::invalid_deployment("deployment id must not be empty"));
        }
        Ok(())
    }

    /// Register a deployment; returns `false` if it was already registered.
    pub fn register(&self, id: DeploymentId) -> ConfigResult<bool> {
        Self::validate(&id)?;
        let mut deployments = self.deployments.write().unwrap_or_else(|e| e.into_inner());
        let added = deployments.insert(id.clone());
        if added {
            info!(deployment_id = %id, "registered deployment for job execution");
        }
        Ok(added)
    }

    /// Unregister a deployment; returns `false` if it was not registered.
    pub fn unregister(&self, id: &DeploymentId) -> ConfigResult<bool> {
        Self::validate(id)?;
        let mut deployments = self.deployments.write().unwrap_or_else(|e| e.into_inner());
        let removed = deployments.remove(id);
        if removed {
            info!(deployment_id = %id, "unregistered deployment from job execution");
        }
        Ok(removed)
    }

    pub fn is_registered(&self, id: &DeploymentId) -> bool {
        self.deployments
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(id)
    }

    /// Copy of the registered set, taken once per acquisition cycle.
    pub fn snapshot(&self) -> HashSet<DeploymentId> {
        self.deployments
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
