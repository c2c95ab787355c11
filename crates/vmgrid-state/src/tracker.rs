//! Instance arena.
//!
//! Slots freed by `remove` are reused by later inserts, so a long run of
//! linked clones does not grow the arena without bound. Iteration follows
//! slot order, which for template instances is declaration order.

use tracing::debug;

use vmgrid_core::{VmPowerState, VmTemplate};

use crate::error::{StateError, StateResult};
use crate::instance::{InstanceId, VmInstance};

#[derive(Debug, Default)]
pub struct VmTracker {
    slots: Vec<Option<VmInstance>>,
}

impl VmTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tracker holding one instance per template, in order.
    pub fn from_templates<'a>(templates: impl IntoIterator<Item = &'a VmTemplate>) -> Self {
        let slots = templates
            .into_iter()
            .map(|t| Some(VmInstance::from_template(t)))
            .collect();
        Self { slots }
    }

    /// Add an instance. Its `vmid` must not already be tracked.
    pub fn insert(&mut self, instance: VmInstance) -> StateResult<InstanceId> {
        if self.find_by_vmid(&instance.vmid).is_some() {
            return Err(StateError::DuplicateVmid(instance.vmid));
        }
        let id = match self.slots.iter().position(Option::is_none) {
            Some(free) => {
                self.slots[free] = Some(instance);
                InstanceId(free)
            }
            None => {
                self.slots.push(Some(instance));
                InstanceId(self.slots.len() - 1)
            }
        };
        Ok(id)
    }

    pub fn remove(&mut self, id: InstanceId) -> StateResult<VmInstance> {
        self.slots
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or(StateError::UnknownInstance(id))
    }

    pub fn get(&self, id: InstanceId) -> Option<&VmInstance> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, id: InstanceId) -> StateResult<&mut VmInstance> {
        self.slots
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(StateError::UnknownInstance(id))
    }

    pub fn find_by_vmid(&self, vmid: &str) -> Option<InstanceId> {
        self.iter().find(|(_, i)| i.vmid == vmid).map(|(id, _)| id)
    }

    pub fn find_by_agent(&self, agent_name: &str) -> Option<InstanceId> {
        self.iter()
            .find(|(_, i)| i.agent_name.as_deref() == Some(agent_name))
            .map(|(id, _)| id)
    }

    /// Live instances in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (InstanceId, &VmInstance)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|inst| (InstanceId(i), inst)))
    }

    /// Ids of live instances in slot order.
    pub fn ids(&self) -> Vec<InstanceId> {
        self.iter().map(|(id, _)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn provisioned_count(&self) -> usize {
        self.iter().filter(|(_, i)| i.provisioned).count()
    }

    /// Mark an instance as backing `agent_name`.
    pub fn mark_provisioned(&mut self, id: InstanceId, agent_name: &str) -> StateResult<()> {
        let inst = self.get_mut(id)?;
        if inst.provisioned {
            return Err(StateError::AlreadyProvisioned {
                vmid: inst.vmid.clone(),
                agent: inst.agent_name.clone().unwrap_or_default(),
            });
        }
        inst.provisioned = true;
        inst.agent_name = Some(agent_name.to_string());
        debug!(vmid = %inst.vmid, agent = %agent_name, "instance provisioned");
        Ok(())
    }

    /// Make an instance eligible for provisioning again.
    pub fn mark_released(&mut self, id: InstanceId) -> StateResult<()> {
        let inst = self.get_mut(id)?;
        inst.provisioned = false;
        inst.agent_name = None;
        debug!(vmid = %inst.vmid, "instance released");
        Ok(())
    }

    pub fn record_power_state(
        &mut self,
        id: InstanceId,
        state: Option<VmPowerState>,
    ) -> StateResult<()> {
        let inst = self.get_mut(id)?;
        inst.last_power_state = state;
        Ok(())
    }

    /// Set the address agents on this instance connect to.
    pub fn set_launcher_host(&mut self, id: InstanceId, host: &str) -> StateResult<()> {
        self.get_mut(id)?.launcher.set_host(host);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmgrid_core::VmTemplate;

    fn tracker() -> VmTracker {
        let templates = [
            VmTemplate::new("build1", "linux"),
            VmTemplate::new("build2", "macos"),
        ];
        VmTracker::from_templates(&templates)
    }

    fn clone_of(vmid: &str, parent: &str) -> VmInstance {
        let mut inst = VmInstance::from_template(&VmTemplate::new(vmid, "linux"));
        inst.parent_vmid = Some(parent.to_string());
        inst.is_linked_clone = true;
        inst
    }

    #[test]
    fn templates_keep_declaration_order() {
        let t = tracker();
        let vmids: Vec<_> = t.iter().map(|(_, i)| i.vmid.as_str()).collect();
        assert_eq!(vmids, ["build1", "build2"]);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn provision_and_release() {
        let mut t = tracker();
        let id = t.find_by_vmid("build1").unwrap();

        t.mark_provisioned(id, "farm build1").unwrap();
        assert_eq!(t.provisioned_count(), 1);
        assert_eq!(t.find_by_agent("farm build1"), Some(id));

        let again = t.mark_provisioned(id, "farm build1-b");
        assert!(matches!(again, Err(StateError::AlreadyProvisioned { .. })));

        t.mark_released(id).unwrap();
        let inst = t.get(id).unwrap();
        assert!(!inst.provisioned);
        assert!(inst.agent_name.is_none());
        assert_eq!(t.provisioned_count(), 0);
    }

    #[test]
    fn record_power_state_overwrites() {
        let mut t = tracker();
        let id = t.find_by_vmid("build2").unwrap();
        t.record_power_state(id, Some(VmPowerState::Paused)).unwrap();
        assert_eq!(t.get(id).unwrap().last_power_state, Some(VmPowerState::Paused));
        t.record_power_state(id, None).unwrap();
        assert_eq!(t.get(id).unwrap().last_power_state, None);
    }

    #[test]
    fn removed_slots_are_reused() {
        let mut t = tracker();
        let c1 = t.insert(clone_of("build1_a", "build1")).unwrap();
        assert_eq!(c1.index(), 2);

        t.remove(c1).unwrap();
        assert!(t.get(c1).is_none());
        assert_eq!(t.len(), 2);

        let c2 = t.insert(clone_of("build1_b", "build1")).unwrap();
        assert_eq!(c2, c1);
        assert_eq!(t.get(c2).unwrap().template_vmid(), "build1");
    }

    #[test]
    fn unknown_ids_are_errors() {
        let mut t = tracker();
        let id = t.insert(clone_of("build1_a", "build1")).unwrap();
        t.remove(id).unwrap();
        assert!(matches!(t.mark_released(id), Err(StateError::UnknownInstance(_))));
        assert!(matches!(t.remove(id), Err(StateError::UnknownInstance(_))));
    }

    #[test]
    fn duplicate_vmid_rejected() {
        let mut t = tracker();
        let dup = VmInstance::from_template(&VmTemplate::new("build1", "linux"));
        assert!(matches!(t.insert(dup), Err(StateError::DuplicateVmid(_))));
    }

    #[test]
    fn launcher_host_set_through_tracker() {
        let mut t = tracker();
        let id = t.find_by_vmid("build1").unwrap();
        t.set_launcher_host(id, "10.211.55.9").unwrap();
        assert_eq!(t.get(id).unwrap().launcher.host.as_deref(), Some("10.211.55.9"));
    }
}
