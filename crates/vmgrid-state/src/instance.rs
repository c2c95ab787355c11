//! A single VM instance and its runtime state.

use std::fmt;

use serde::{Deserialize, Serialize};

use vmgrid_core::{LaunchConfig, PostBuildBehavior, RetentionPolicy, VmPowerState, VmTemplate, Vmid};

/// Index of an instance inside a `VmTracker`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub(crate) usize);

impl InstanceId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Runtime view of a VM: the template it came from plus mutable state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmInstance {
    pub vmid: Vmid,
    pub labels: String,
    pub remote_fs: String,
    pub launcher: LaunchConfig,
    pub post_build_behavior: PostBuildBehavior,
    pub retention: RetentionPolicy,
    /// Template this instance was cloned from, if any.
    pub parent_vmid: Option<Vmid>,
    pub is_linked_clone: bool,

    pub provisioned: bool,
    pub agent_name: Option<String>,
    /// Power state observed before the last start, `None` if unknown.
    pub last_power_state: Option<VmPowerState>,
}

impl VmInstance {
    /// Instance for a configured template, used directly (no cloning).
    pub fn from_template(template: &VmTemplate) -> Self {
        Self {
            vmid: template.vmid.clone(),
            labels: template.labels.clone(),
            remote_fs: template.remote_fs.clone(),
            launcher: template.launcher.clone(),
            post_build_behavior: template.post_build_behavior,
            retention: template.retention.clone(),
            parent_vmid: None,
            is_linked_clone: false,
            provisioned: false,
            agent_name: None,
            last_power_state: Some(VmPowerState::Suspended),
        }
    }

    /// The template identity this instance belongs to.
    pub fn template_vmid(&self) -> &str {
        self.parent_vmid.as_deref().unwrap_or(&self.vmid)
    }
}
