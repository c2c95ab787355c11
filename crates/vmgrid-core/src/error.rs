//! Error types for VMGrid configuration.

use thiserror::Error;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating a cloud configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cloud name must not be empty")]
    EmptyCloudName,

    #[error("vm at position {0} has an empty vmid")]
    EmptyVmid(usize),

    #[error("duplicate vmid: {0}")]
    DuplicateVmid(String),

    #[error("invalid label expression {expr:?}: {reason}")]
    Label { expr: String, reason: String },
}
