//! Error types for the VM state tracker.

use thiserror::Error;

use crate::instance::InstanceId;

/// Result type alias for tracker operations.
pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("unknown instance: {0}")]
    UnknownInstance(InstanceId),

    #[error("instance {vmid} is already provisioned as {agent}")]
    AlreadyProvisioned { vmid: String, agent: String },

    #[error("duplicate vmid: {0}")]
    DuplicateVmid(String),
}
