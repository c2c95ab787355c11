//! vmgrid-state — runtime state of VM instances.
//!
//! A `VmTracker` is an arena of `VmInstance`s addressed by `InstanceId`.
//! Template instances are inserted once from configuration; linked clones
//! come and go as they are provisioned and released.
//!
//! The tracker does no locking of its own. The provisioning engine owns it
//! behind a single mutex, so every check-then-mark happens under one guard.

pub mod error;
pub mod instance;
pub mod tracker;

pub use error::{StateError, StateResult};
pub use instance::{InstanceId, VmInstance};
pub use tracker::VmTracker;
