//! Configuration error model.

use thiserror::Error;

/// Result type used for configuration and argument validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration-level error.
///
/// Raised at engine startup or at the offending API call. Values are never
/// silently clamped into a valid shape.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The acquisition priority window is inverted.
    #[error("invalid priority range: min ({min}) must not exceed max ({max})")]
    InvalidPriorityRange { min: i64, max: i64 },

    /// A deployment reference was malformed.
    #[error("invalid deployment id: {0}")]
    InvalidDeployment(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// Any other option holds a value the executor cannot run with.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_deployment(msg: impl Into<String>) -> Self {
        Self::InvalidDeployment(msg.into())
    }
}
