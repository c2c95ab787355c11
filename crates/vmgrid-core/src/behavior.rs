//! Post-build behavior and VM power states.
//!
//! `post_build_command` is the only place that decides which power command
//! a VM receives when its agent is reclaimed.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// What to do with a VM once its agent has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PostBuildBehavior {
    #[default]
    Suspend,
    Stop,
    KeepRunning,
    ReturnPrevState,
}

impl PostBuildBehavior {
    /// Parse a configured behavior name.
    ///
    /// Unrecognized names fall back to `Suspend`.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Suspend" => Self::Suspend,
            "Stop" => Self::Stop,
            "KeepRunning" => Self::KeepRunning,
            "ReturnPrevState" => Self::ReturnPrevState,
            other => {
                warn!(behavior = %other, "unknown post-build behavior, using Suspend");
                Self::Suspend
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Suspend => "Suspend",
            Self::Stop => "Stop",
            Self::KeepRunning => "KeepRunning",
            Self::ReturnPrevState => "ReturnPrevState",
        }
    }
}

impl fmt::Display for PostBuildBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Power state of a VM as reported by the control transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmPowerState {
    #[default]
    Suspended,
    Paused,
    Running,
    Stopped,
}

impl VmPowerState {
    /// Parse a raw state string. Matching is exact and case-sensitive.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "stopped" => Some(Self::Stopped),
            "paused" => Some(Self::Paused),
            "running" => Some(Self::Running),
            "suspended" => Some(Self::Suspended),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Suspended => "suspended",
            Self::Paused => "paused",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for VmPowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A power command sent to a VM on reclamation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerCommand {
    Stop,
    Suspend,
    Pause,
}

impl PowerCommand {
    /// The verb understood by the VM control transport.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Suspend => "suspend",
            Self::Pause => "pause",
        }
    }

    /// The state the VM is expected to be in after the command completes.
    pub fn resulting_state(&self) -> VmPowerState {
        match self {
            Self::Stop => VmPowerState::Stopped,
            Self::Suspend => VmPowerState::Suspended,
            Self::Pause => VmPowerState::Paused,
        }
    }
}

impl fmt::Display for PowerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolve the command to issue for a VM whose agent is being reclaimed.
///
/// `None` leaves the VM as it is. An unknown previous state is treated
/// like `Suspended`.
pub fn post_build_command(
    behavior: PostBuildBehavior,
    previous: Option<VmPowerState>,
) -> Option<PowerCommand> {
    match behavior {
        PostBuildBehavior::Stop => Some(PowerCommand::Stop),
        PostBuildBehavior::KeepRunning => None,
        PostBuildBehavior::Suspend => Some(PowerCommand::Suspend),
        PostBuildBehavior::ReturnPrevState => match previous {
            Some(VmPowerState::Paused) => Some(PowerCommand::Pause),
            Some(VmPowerState::Running) => None,
            Some(VmPowerState::Stopped) => Some(PowerCommand::Stop),
            Some(VmPowerState::Suspended) | None => Some(PowerCommand::Suspend),
        },
    }
}
