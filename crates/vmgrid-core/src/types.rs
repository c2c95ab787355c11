//! Template-level domain types.
//!
//! A `VmTemplate` is one `[[vms]]` entry of the cloud configuration. It is
//! immutable once loaded; runtime state lives in `vmgrid-state`.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::behavior::PostBuildBehavior;

/// Identifier of a VM known to the control transport.
pub type Vmid = String;

/// Default idle time before an agent is reclaimed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// A configured, reusable VM descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmTemplate {
    pub vmid: Vmid,
    /// Whitespace-separated label atoms this VM offers.
    #[serde(default)]
    pub labels: String,
    /// Agent working directory inside the VM.
    #[serde(default)]
    pub remote_fs: String,
    /// How the agent is launched on the VM.
    #[serde(default)]
    pub launcher: LaunchConfig,
    #[serde(default, deserialize_with = "lenient_behavior")]
    pub post_build_behavior: PostBuildBehavior,
    #[serde(default)]
    pub retention: RetentionPolicy,
}

impl VmTemplate {
    /// Build a template with default launcher, behavior, and retention.
    pub fn new(vmid: impl Into<Vmid>, labels: impl Into<String>) -> Self {
        Self {
            vmid: vmid.into(),
            labels: labels.into(),
            remote_fs: String::new(),
            launcher: LaunchConfig::default(),
            post_build_behavior: PostBuildBehavior::default(),
            retention: RetentionPolicy::default(),
        }
    }

    pub fn with_behavior(mut self, behavior: PostBuildBehavior) -> Self {
        self.post_build_behavior = behavior;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_remote_fs(mut self, remote_fs: impl Into<String>) -> Self {
        self.remote_fs = remote_fs.into();
        self
    }
}

/// Agent launch settings.
///
/// `host` is filled in once a started VM reports its address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub credentials_id: Option<String>,
    /// Command run inside the VM to start the agent process.
    #[serde(default)]
    pub command: Option<String>,
}

impl LaunchConfig {
    pub fn set_host(&mut self, host: impl Into<String>) {
        self.host = Some(host.into());
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.set_host(host);
        self
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
            credentials_id: None,
            command: None,
        }
    }
}

fn default_port() -> u16 {
    22
}

/// When an agent's VM is handed back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Reclaim once the agent has been idle longer than the timeout.
    KeepUntilIdle {
        #[serde(default = "default_idle_timeout_secs")]
        idle_timeout_secs: u64,
    },
    /// Reclaim as soon as the agent has finished one build.
    RunOnce,
}

impl RetentionPolicy {
    /// Idle timeout for `KeepUntilIdle`, `None` for `RunOnce`.
    pub fn idle_timeout(&self) -> Option<Duration> {
        match self {
            Self::KeepUntilIdle { idle_timeout_secs } => {
                Some(Duration::from_secs(*idle_timeout_secs))
            }
            Self::RunOnce => None,
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::KeepUntilIdle {
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

fn default_idle_timeout_secs() -> u64 {
    DEFAULT_IDLE_TIMEOUT.as_secs()
}

fn lenient_behavior<'de, D>(deserializer: D) -> Result<PostBuildBehavior, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(PostBuildBehavior::parse(&raw))
}
