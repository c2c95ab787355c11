//! vmgrid-core — shared types for VMGrid.
//!
//! - Cloud and VM template configuration (`vmgrid.toml`)
//! - Post-build behavior resolution and power-state parsing
//! - Label expressions used to match workload requests to templates

pub mod agent;
pub mod behavior;
pub mod config;
pub mod error;
pub mod label;
pub mod types;

pub use agent::{AgentHandle, ReleasedAgent};
pub use behavior::{post_build_command, PostBuildBehavior, PowerCommand, VmPowerState};
pub use config::CloudConfig;
pub use error::{ConfigError, ConfigResult};
pub use label::{ExprLabelMatcher, LabelExpr, LabelMatcher};
pub use types::*;
