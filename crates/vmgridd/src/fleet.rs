//! Fleet — the provisioning engine and retention monitor wired together.
//!
//! Agents that come up are handed to the monitor; agents the monitor
//! reclaims are released back to the engine, which can then provision
//! their instances again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use vmgrid_core::CloudConfig;
use vmgrid_retention::{AgentTransport, ReleaseCallback, RetentionMonitor};
use vmgrid_scheduler::{ConnectorFactory, ProvisioningEngine};

/// How often `run_until_drained` looks at the live agent count.
const DRAIN_POLL: Duration = Duration::from_secs(1);

pub struct Fleet {
    engine: Arc<ProvisioningEngine>,
    monitor: RetentionMonitor,
}

impl Fleet {
    pub fn new(
        config: CloudConfig,
        factory: Arc<dyn ConnectorFactory>,
        transport: Arc<dyn AgentTransport>,
    ) -> Self {
        let engine = Arc::new(ProvisioningEngine::new(config, factory));

        let release_engine = engine.clone();
        let on_release: ReleaseCallback = Arc::new(move |released| {
            let engine = release_engine.clone();
            Box::pin(async move {
                engine.release(&released).await;
            })
        });
        let monitor = RetentionMonitor::new(transport).with_callback(on_release);

        Self { engine, monitor }
    }

    /// Override the retention monitor's check interval.
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.monitor = self.monitor.with_check_interval(interval);
        self
    }

    pub fn engine(&self) -> &ProvisioningEngine {
        &self.engine
    }

    pub fn monitor(&self) -> &RetentionMonitor {
        &self.monitor
    }

    /// Provision for `label` and start tracking each agent as soon as its
    /// own bring-up finishes. Returns the names of the agents that came up,
    /// in provisioning order.
    pub async fn provision(&self, label: Option<&str>, excess_workload: u32) -> Vec<String> {
        let planned = self.engine.provision(label, excess_workload).await;
        let mut bring_ups = JoinSet::new();

        for (slot, agent) in planned.into_iter().enumerate() {
            let monitor = self.monitor.clone();
            bring_ups.spawn(async move {
                match agent.wait().await {
                    Ok(handle) => {
                        let name = handle.name.clone();
                        monitor.start(handle).await;
                        Some((slot, name))
                    }
                    Err(e) => {
                        warn!(error = %e, "agent did not come up");
                        None
                    }
                }
            });
        }

        let mut live = Vec::new();
        while let Some(joined) = bring_ups.join_next().await {
            match joined {
                Ok(Some(agent)) => live.push(agent),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "bring-up task failed"),
            }
        }
        live.sort_by_key(|(slot, _)| *slot);

        info!(agents = live.len(), "agents online");
        live.into_iter().map(|(_, name)| name).collect()
    }

    /// The connector went away; the next `provision` creates a new one.
    pub async fn connector_terminated(&self) {
        self.engine.connector_terminated().await;
    }

    /// An agent was torn down outside the retention monitor. Its instance
    /// becomes available again.
    pub async fn agent_terminated(&self, agent_name: &str) {
        self.monitor.stop(agent_name).await;
    }

    /// Wait until every tracked agent has been reclaimed, or until
    /// `shutdown` fires.
    pub async fn run_until_drained(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if self.monitor.active_agents().await.is_empty() {
                info!("all agents reclaimed");
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(DRAIN_POLL) => {}
                _ = shutdown.changed() => {
                    info!("shutdown requested");
                    return;
                }
            }
        }
    }

    /// Stop all retention loops. Running VMs are left as they are.
    pub async fn shutdown(&self) {
        self.monitor.stop_all().await;
    }
}
