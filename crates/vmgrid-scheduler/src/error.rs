//! Scheduler error types.

use thiserror::Error;

/// Errors that can occur while provisioning a single instance.
///
/// None of these escape `provision`; they are logged and the scan moves on.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to start vm {vmid}: {source}")]
    Start {
        vmid: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("agent bring-up failed for {agent}: {source}")]
    BringUp {
        agent: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("agent bring-up task for {agent} did not complete: {source}")]
    Join {
        agent: String,
        #[source]
        source: tokio::task::JoinError,
    },

    #[error("state error: {0}")]
    State(#[from] vmgrid_state::StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
