//! vmgrid.toml configuration parser.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::types::{LaunchConfig, VmTemplate};

/// One VM cloud: a connector host plus the VM templates it can start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloudConfig {
    pub name: String,
    /// Labels offered by the connector host itself.
    #[serde(default)]
    pub label_string: String,
    /// Working directory of the connector agent on the host.
    #[serde(default)]
    pub remote_fs: String,
    /// Whether the connector host also accepts builds.
    #[serde(default)]
    pub use_connector_as_builder: bool,
    /// Upper bound on simultaneously provisioned VMs.
    #[serde(default = "default_max_concurrent_vms")]
    pub max_concurrent_vms: u32,
    /// Clone templates on demand instead of starting them directly.
    #[serde(default)]
    pub use_linked_clones: bool,
    /// How the connector agent is launched on the host.
    #[serde(default)]
    pub launcher: LaunchConfig,
    #[serde(default)]
    pub vms: Vec<VmTemplate>,
}

fn default_max_concurrent_vms() -> u32 {
    1
}

impl CloudConfig {
    /// An empty cloud with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label_string: String::new(),
            remote_fs: String::new(),
            use_connector_as_builder: false,
            max_concurrent_vms: default_max_concurrent_vms(),
            use_linked_clones: false,
            launcher: LaunchConfig::default(),
            vms: Vec::new(),
        }
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: CloudConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check the invariants the engine relies on.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyCloudName);
        }
        let mut seen = HashSet::new();
        for (i, vm) in self.vms.iter().enumerate() {
            if vm.vmid.trim().is_empty() {
                return Err(ConfigError::EmptyVmid(i));
            }
            if !seen.insert(vm.vmid.as_str()) {
                return Err(ConfigError::DuplicateVmid(vm.vmid.clone()));
            }
        }
        Ok(())
    }

    pub fn with_vm(mut self, vm: VmTemplate) -> Self {
        self.vms.push(vm);
        self
    }

    pub fn with_max_concurrent_vms(mut self, max: u32) -> Self {
        self.max_concurrent_vms = max;
        self
    }

    pub fn with_linked_clones(mut self, enabled: bool) -> Self {
        self.use_linked_clones = enabled;
        self
    }
}
