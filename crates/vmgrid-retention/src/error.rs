//! Retention error types.

use thiserror::Error;

use vmgrid_core::PowerCommand;

/// Failures during one reclamation attempt. The record stays live and the
/// next check retries.
#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("failed to disconnect agent {agent}: {source}")]
    Disconnect {
        agent: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to send {command} to vm {vmid}: {source}")]
    PowerCommand {
        vmid: String,
        command: PowerCommand,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to terminate agent {agent}: {source}")]
    Terminate {
        agent: String,
        #[source]
        source: anyhow::Error,
    },
}

pub type RetentionResult<T> = Result<T, RetentionError>;
