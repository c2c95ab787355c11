//! Provisioning engine — turns excess workload into started VMs.
//!
//! `provision` is first-fit: instances are tried in declaration order and
//! the first eligible ones win. The whole scan runs under the fleet lock,
//! so two concurrent calls can never mark the same instance provisioned.
//! Agent bring-up is spawned onto the tokio worker pool and never holds
//! the lock.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use vmgrid_core::{
    post_build_command, AgentHandle, CloudConfig, ExprLabelMatcher, LabelMatcher, ReleasedAgent,
    VmPowerState,
};
use vmgrid_state::{InstanceId, VmInstance, VmTracker};

use crate::clone::create_linked_clone;
use crate::connector::{Connector, ConnectorFactory, ConnectorSpec};
use crate::error::{SchedulerError, SchedulerResult};

/// An agent whose VM has been started and whose bring-up is in flight.
pub struct PlannedAgent {
    pub name: String,
    pub vmid: String,
    /// Executors this agent contributes. Always 1.
    pub executors: u32,
    handle: JoinHandle<anyhow::Result<AgentHandle>>,
}

impl PlannedAgent {
    /// Wait for bring-up to finish.
    pub async fn wait(self) -> SchedulerResult<AgentHandle> {
        match self.handle.await {
            Ok(Ok(agent)) => Ok(agent),
            Ok(Err(source)) => Err(SchedulerError::BringUp {
                agent: self.name,
                source,
            }),
            Err(source) => Err(SchedulerError::Join {
                agent: self.name,
                source,
            }),
        }
    }
}

impl std::fmt::Debug for PlannedAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlannedAgent")
            .field("name", &self.name)
            .field("vmid", &self.vmid)
            .field("executors", &self.executors)
            .finish()
    }
}

/// Provisions VM-backed agents for one cloud.
pub struct ProvisioningEngine {
    config: CloudConfig,
    /// All instances of this cloud. Held for the whole provisioning scan.
    fleet: Arc<Mutex<VmTracker>>,
    /// The connector, created on first use and cleared when it terminates.
    connector: Mutex<Option<Arc<dyn Connector>>>,
    factory: Arc<dyn ConnectorFactory>,
    matcher: Arc<dyn LabelMatcher>,
}

impl ProvisioningEngine {
    pub fn new(config: CloudConfig, factory: Arc<dyn ConnectorFactory>) -> Self {
        let fleet = VmTracker::from_templates(&config.vms);
        Self {
            config,
            fleet: Arc::new(Mutex::new(fleet)),
            connector: Mutex::new(None),
            factory,
            matcher: Arc::new(ExprLabelMatcher),
        }
    }

    /// Replace the default label matcher.
    pub fn with_matcher(mut self, matcher: Arc<dyn LabelMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn config(&self) -> &CloudConfig {
        &self.config
    }

    /// Whether any configured template could serve `label`.
    pub fn can_provision(&self, label: Option<&str>) -> bool {
        let Some(label) = label else {
            return false;
        };
        self.config
            .vms
            .iter()
            .any(|vm| self.matcher.matches(label, &vm.labels))
    }

    /// Start up to `excess_workload` VMs matching `label` and plan an agent
    /// on each.
    ///
    /// Never fails: an offline connector, a missing label, or a full
    /// ceiling all yield fewer (possibly zero) planned agents.
    pub async fn provision(&self, label: Option<&str>, excess_workload: u32) -> Vec<PlannedAgent> {
        let mut planned = Vec::new();
        if excess_workload == 0 {
            return planned;
        }
        info!(cloud = %self.config.name, ?label, excess_workload, "provisioning executors");

        let Some(label) = label else {
            debug!(cloud = %self.config.name, "no label requested, nothing to provision");
            return planned;
        };

        let Some(connector) = self.connector().await else {
            return planned;
        };
        if !connector.is_online().await {
            warn!(cloud = %self.config.name, "connector offline, skipping provisioning");
            return planned;
        }

        let ceiling = self.config.max_concurrent_vms as usize;
        let mut remaining = excess_workload;
        let mut fleet = self.fleet.lock().await;

        for id in fleet.ids() {
            if remaining == 0 {
                break;
            }
            if fleet.provisioned_count() >= ceiling {
                debug!(cloud = %self.config.name, max = ceiling, "concurrent vm ceiling reached");
                break;
            }
            let Some(candidate) = fleet.get(id) else {
                continue;
            };
            if candidate.provisioned || candidate.is_linked_clone {
                continue;
            }
            if !self.matcher.matches(label, &candidate.labels) {
                continue;
            }

            let target = if self.config.use_linked_clones {
                let clone = unique_clone(&fleet, create_linked_clone(candidate));
                match fleet.insert(clone) {
                    Ok(clone_id) => clone_id,
                    Err(e) => {
                        warn!(error = %e, "failed to register linked clone");
                        continue;
                    }
                }
            } else {
                id
            };

            match self.start_instance(&mut fleet, &connector, target).await {
                Ok(agent) => {
                    remaining -= 1;
                    planned.push(agent);
                }
                Err(e) => {
                    warn!(
                        cloud = %self.config.name,
                        error = %e,
                        "instance not started, trying next"
                    );
                    if target != id {
                        if let Err(e) = fleet.remove(target) {
                            error!(error = %e, "failed to drop unstarted linked clone");
                        }
                    }
                }
            }
        }

        info!(
            cloud = %self.config.name,
            planned = planned.len(),
            provisioned = fleet.provisioned_count(),
            "provisioning pass complete"
        );
        planned
    }

    /// Capacity-freed notification from the retention monitor.
    ///
    /// Returns `false` if no instance is provisioned under that agent name.
    pub async fn release(&self, released: &ReleasedAgent) -> bool {
        let mut fleet = self.fleet.lock().await;
        let Some(id) = fleet.find_by_agent(&released.agent_name) else {
            warn!(agent = %released.agent_name, "release for unknown agent");
            return false;
        };
        let is_clone = fleet.get(id).is_some_and(|i| i.is_linked_clone);
        let result = if is_clone {
            fleet.remove(id).map(|_| ())
        } else {
            fleet
                .record_power_state(id, Some(released.power_state))
                .and_then(|()| fleet.mark_released(id))
        };
        match result {
            Ok(()) => {
                info!(
                    agent = %released.agent_name,
                    vmid = %released.vmid,
                    state = %released.power_state,
                    linked_clone = is_clone,
                    "instance released"
                );
                true
            }
            Err(e) => {
                error!(agent = %released.agent_name, error = %e, "failed to release instance");
                false
            }
        }
    }

    /// Forget the connector so the next `provision` creates a new one.
    pub async fn connector_terminated(&self) {
        let mut slot = self.connector.lock().await;
        if slot.take().is_some() {
            info!(cloud = %self.config.name, "connector terminated");
        }
    }

    pub async fn provisioned_count(&self) -> usize {
        self.fleet.lock().await.provisioned_count()
    }

    /// Snapshot of one instance.
    pub async fn instance(&self, vmid: &str) -> Option<VmInstance> {
        let fleet = self.fleet.lock().await;
        fleet.find_by_vmid(vmid).and_then(|id| fleet.get(id).cloned())
    }

    /// Snapshot of every instance in slot order.
    pub async fn instances(&self) -> Vec<VmInstance> {
        let fleet = self.fleet.lock().await;
        fleet.iter().map(|(_, i)| i.clone()).collect()
    }

    // ── Internal helpers ────────────────────────────────────────────

    /// Get or create the connector. `None` if creation fails.
    async fn connector(&self) -> Option<Arc<dyn Connector>> {
        let mut slot = self.connector.lock().await;
        if let Some(connector) = slot.as_ref() {
            return Some(Arc::clone(connector));
        }
        let spec = ConnectorSpec::for_cloud(&self.config);
        match self.factory.create(&spec).await {
            Ok(connector) => {
                info!(cloud = %self.config.name, connector = %spec.name, "connector created");
                *slot = Some(Arc::clone(&connector));
                Some(connector)
            }
            Err(e) => {
                error!(cloud = %self.config.name, error = %e, "failed to create connector");
                None
            }
        }
    }

    /// Start one instance, mark it provisioned, and spawn its bring-up.
    async fn start_instance(
        &self,
        fleet: &mut VmTracker,
        connector: &Arc<dyn Connector>,
        id: InstanceId,
    ) -> SchedulerResult<PlannedAgent> {
        let instance = fleet
            .get(id)
            .cloned()
            .ok_or(vmgrid_state::StateError::UnknownInstance(id))?;

        // A fresh clone has no history worth restoring.
        if !instance.is_linked_clone {
            match connector.power_state(&instance.vmid).await {
                Ok(state) => fleet.record_power_state(id, state)?,
                Err(e) => {
                    warn!(vmid = %instance.vmid, error = %e, "could not read power state");
                }
            }
        }

        let started = connector
            .start_vm(&instance)
            .await
            .map_err(|source| SchedulerError::Start {
                vmid: instance.vmid.clone(),
                source,
            })?;
        if let Some(host) = &started.host {
            fleet.set_launcher_host(id, host)?;
        }

        let agent_name = format!("{} {}", self.config.name, instance.vmid);
        fleet.mark_provisioned(id, &agent_name)?;

        let snapshot = fleet
            .get(id)
            .cloned()
            .ok_or(vmgrid_state::StateError::UnknownInstance(id))?;
        let planned = agent_handle(&snapshot, &agent_name);
        info!(vmid = %snapshot.vmid, agent = %agent_name, "vm started");

        let connector = Arc::clone(connector);
        let fleet = Arc::clone(&self.fleet);
        let name = agent_name.clone();
        let handle = tokio::spawn(async move {
            match connector.create_agent_on(&snapshot, &planned).await {
                Ok(agent) => {
                    info!(agent = %agent.name, vmid = %agent.vmid, "agent ready");
                    Ok(agent)
                }
                Err(e) => {
                    warn!(agent = %name, error = %e, "agent bring-up failed, releasing instance");
                    release_failed(&fleet, connector.as_ref(), &name).await;
                    Err(e)
                }
            }
        });

        Ok(PlannedAgent {
            name: agent_name,
            vmid: instance.vmid,
            executors: 1,
            handle,
        })
    }
}

/// The handle an agent on `instance` starts out with.
fn agent_handle(instance: &VmInstance, name: &str) -> AgentHandle {
    AgentHandle {
        name: name.to_string(),
        vmid: instance.vmid.clone(),
        remote_fs: instance.remote_fs.clone(),
        launcher: instance.launcher.clone(),
        post_build_behavior: instance.post_build_behavior,
        previous_state: instance.last_power_state,
        retention: instance.retention.clone(),
    }
}

/// Make a clone's vmid unique within the fleet.
fn unique_clone(fleet: &VmTracker, mut clone: VmInstance) -> VmInstance {
    if fleet.find_by_vmid(&clone.vmid).is_none() {
        return clone;
    }
    let base = clone.vmid.clone();
    let mut n = 1;
    while fleet.find_by_vmid(&format!("{base}-{n}")).is_some() {
        n += 1;
    }
    clone.vmid = format!("{base}-{n}");
    clone
}

/// Undo provisioning for an agent whose bring-up failed.
///
/// The VM was already started, so it gets the post-build command first.
/// If that fails the VM is left running.
async fn release_failed(fleet: &Mutex<VmTracker>, connector: &dyn Connector, agent_name: &str) {
    let target = {
        let fleet = fleet.lock().await;
        fleet
            .find_by_agent(agent_name)
            .and_then(|id| fleet.get(id))
            .map(|i| {
                let command = post_build_command(i.post_build_behavior, i.last_power_state);
                (i.vmid.clone(), command)
            })
    };
    let Some((vmid, command)) = target else {
        return;
    };

    let mut power_state = VmPowerState::Running;
    if let Some(command) = command {
        match connector.apply_power_command(&vmid, command).await {
            Ok(()) => power_state = command.resulting_state(),
            Err(e) => {
                warn!(vmid = %vmid, %command, error = %e, "could not hand back vm, left running");
            }
        }
    }

    let mut fleet = fleet.lock().await;
    let Some(id) = fleet.find_by_agent(agent_name) else {
        return;
    };
    let result = if fleet.get(id).is_some_and(|i| i.is_linked_clone) {
        fleet.remove(id).map(|_| ())
    } else {
        fleet
            .record_power_state(id, Some(power_state))
            .and_then(|()| fleet.mark_released(id))
    };
    match result {
        Ok(()) => {
            info!(vmid = %vmid, state = %power_state, "instance released after failed bring-up");
        }
        Err(e) => error!(agent = %agent_name, error = %e, "failed to release failed instance"),
    }
}
