//! Connector capabilities consumed by the provisioning engine.
//!
//! The connector is the always-on control agent on the VM host. It is the
//! engine's only way to query, start, and clone VMs, and to bring agents up
//! on them. Concrete implementations live with whatever transport a host
//! wires in.

use std::sync::Arc;

use async_trait::async_trait;

use vmgrid_core::{AgentHandle, CloudConfig, LaunchConfig, PowerCommand, VmPowerState};
use vmgrid_state::VmInstance;

/// Everything needed to create the connector for one cloud.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorSpec {
    pub name: String,
    pub labels: String,
    pub remote_fs: String,
    pub launcher: LaunchConfig,
    /// Whether the connector host also runs builds itself.
    pub use_as_builder: bool,
}

impl ConnectorSpec {
    pub fn for_cloud(cloud: &CloudConfig) -> Self {
        Self {
            name: format!("{} host agent", cloud.name),
            labels: cloud.label_string.clone(),
            remote_fs: cloud.remote_fs.clone(),
            launcher: cloud.launcher.clone(),
            use_as_builder: cloud.use_connector_as_builder,
        }
    }
}

/// Result of a successful VM start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmStarted {
    /// Address the VM reported, if the transport knows it.
    pub host: Option<String>,
}

/// Creates the connector on first use.
#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    async fn create(&self, spec: &ConnectorSpec) -> anyhow::Result<Arc<dyn Connector>>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Whether the connector can currently accept commands.
    async fn is_online(&self) -> bool;

    /// Current power state of a VM. `Ok(None)` when the state is unrecognized.
    async fn power_state(&self, vmid: &str) -> anyhow::Result<Option<VmPowerState>>;

    /// Start a VM. For a linked clone, the clone is created from
    /// `parent_vmid` first.
    async fn start_vm(&self, vm: &VmInstance) -> anyhow::Result<VmStarted>;

    /// Bring an agent up on a started VM.
    ///
    /// Runs on a worker task, never while the fleet lock is held.
    async fn create_agent_on(
        &self,
        vm: &VmInstance,
        planned: &AgentHandle,
    ) -> anyhow::Result<AgentHandle>;

    /// Put a started VM into another power state. Used to hand a VM back
    /// when no agent ever came up on it.
    async fn apply_power_command(&self, vmid: &str, command: PowerCommand) -> anyhow::Result<()>;
}
