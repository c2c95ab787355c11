//! Agent transport capability.

use async_trait::async_trait;

use vmgrid_core::{AgentHandle, PowerCommand};

/// Connection and VM control for live agents.
///
/// Calls made during a check are awaited to completion; implementations
/// should bound their own waits.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Open the agent's connection. Called once, off the caller's path.
    async fn connect(&self, agent: &AgentHandle) -> anyhow::Result<()>;

    async fn disconnect(&self, agent: &AgentHandle) -> anyhow::Result<()>;

    /// Remove the agent from the host once its VM has been handled.
    async fn terminate(&self, agent: &AgentHandle) -> anyhow::Result<()>;

    async fn send_power_command(&self, vmid: &str, command: PowerCommand) -> anyhow::Result<()>;
}
