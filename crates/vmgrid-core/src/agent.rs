//! Agent handles passed between the provisioning engine, the connector, and
//! the retention monitor.

use serde::{Deserialize, Serialize};

use crate::behavior::{PostBuildBehavior, VmPowerState};
use crate::types::{LaunchConfig, RetentionPolicy, Vmid};

/// A build agent running on one VM instance.
///
/// Carries everything reclamation needs so the retention monitor never has
/// to reach back into the fleet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentHandle {
    pub name: String,
    pub vmid: Vmid,
    pub remote_fs: String,
    pub launcher: LaunchConfig,
    pub post_build_behavior: PostBuildBehavior,
    /// Power state of the VM before it was started for this agent.
    pub previous_state: Option<VmPowerState>,
    pub retention: RetentionPolicy,
}

/// Notification that an agent was reclaimed and its VM handed back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasedAgent {
    pub agent_name: String,
    pub vmid: Vmid,
    /// State the VM was left in.
    pub power_state: VmPowerState,
}
