//! vmgrid-retention — reclamation of idle agents.
//!
//! Every live agent gets a `RetentionRecord`. A periodic check measures how
//! long the agent has been idle and, once its retention policy says so,
//! disconnects it, sends the post-build power command to its VM, and
//! reports the release so the instance can be provisioned again.
//!
//! # Architecture
//!
//! ```text
//! RetentionMonitor
//!   ├── Per-agent background task
//!   │   ├── RetentionRecord (idle start, state, try-lock)
//!   │   ├── post_build_command() → PowerCommand
//!   │   └── AgentTransport (disconnect, power command, terminate)
//!   └── Optional ReleaseCallback for the provisioning engine
//! ```
//!
//! # Record states
//!
//! ```text
//! Idle ⇄ Busy ──(policy due)──► ReclaimPending ──► Reclaimed
//!                                     │
//!                                     └─(error)──► Busy, retried next cycle
//! ```
//!
//! A check that finds the record already locked by another check returns
//! at once without side effects.

pub mod error;
pub mod monitor;
pub mod record;
pub mod transport;

#[cfg(test)]
mod testing;

pub use error::{RetentionError, RetentionResult};
pub use monitor::{ReleaseCallback, RetentionMonitor};
pub use record::{CheckOutcome, RecordState, RetentionRecord, CHECK_INTERVAL, RECHECK_SOON};
pub use transport::AgentTransport;
