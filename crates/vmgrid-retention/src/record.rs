//! Per-agent retention record and the reclamation check.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info};

use vmgrid_core::{
    post_build_command, AgentHandle, ReleasedAgent, RetentionPolicy, VmPowerState,
    DEFAULT_IDLE_TIMEOUT,
};

use crate::error::{RetentionError, RetentionResult};
use crate::transport::AgentTransport;

/// Suggested delay between regular checks.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Suggested delay after a check found the record locked.
pub const RECHECK_SOON: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Idle,
    Busy,
    ReclaimPending,
    Reclaimed,
}

/// What one check did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Another check holds the record; nothing was evaluated.
    Contended,
    /// The agent stays.
    Retained { idle_ms: u64 },
    /// The agent was disconnected and its VM handed back.
    Reclaimed(ReleasedAgent),
    /// Reclamation was attempted and failed; the next check retries.
    Failed,
    /// A previous check already reclaimed the agent.
    AlreadyReclaimed,
}

impl CheckOutcome {
    /// Advisory delay until the next check.
    pub fn next_check(&self) -> Duration {
        match self {
            Self::Contended => RECHECK_SOON,
            _ => CHECK_INTERVAL,
        }
    }
}

#[derive(Debug)]
struct Activity {
    state: RecordState,
    idle_start_ms: u64,
    /// Whether the agent is running a build right now.
    in_build: bool,
    builds_completed: u32,
}

/// Retention state for one live agent.
#[derive(Debug)]
pub struct RetentionRecord {
    agent: AgentHandle,
    /// Held for the duration of a check. Checks only `try_lock` it.
    check_lock: tokio::sync::Mutex<()>,
    activity: Mutex<Activity>,
}

impl RetentionRecord {
    /// A record for a freshly connected, idle agent.
    pub fn new(agent: AgentHandle, now_ms: u64) -> Self {
        Self {
            agent,
            check_lock: tokio::sync::Mutex::new(()),
            activity: Mutex::new(Activity {
                state: RecordState::Idle,
                idle_start_ms: now_ms,
                in_build: false,
                builds_completed: 0,
            }),
        }
    }

    pub fn agent(&self) -> &AgentHandle {
        &self.agent
    }

    pub fn state(&self) -> RecordState {
        self.activity().state
    }

    /// The agent picked up a build.
    pub fn mark_busy(&self) {
        let mut a = self.activity();
        if a.state == RecordState::Reclaimed {
            return;
        }
        a.state = RecordState::Busy;
        a.in_build = true;
    }

    /// The agent finished its build and is idle from `now_ms`.
    pub fn mark_idle(&self, now_ms: u64) {
        let mut a = self.activity();
        if a.state == RecordState::Reclaimed {
            return;
        }
        if a.in_build {
            a.builds_completed += 1;
        }
        a.state = RecordState::Idle;
        a.in_build = false;
        a.idle_start_ms = now_ms;
    }

    /// Retire an agent torn down elsewhere, without touching it.
    ///
    /// Waits for a running check to finish. Returns `false` if the agent was
    /// already reclaimed, so exactly one path reports the release.
    pub async fn retire(&self) -> bool {
        let _guard = self.check_lock.lock().await;
        let mut a = self.activity();
        if a.state == RecordState::Reclaimed {
            return false;
        }
        a.state = RecordState::Reclaimed;
        true
    }

    /// Run one check at wall-clock time `now_ms`.
    pub async fn check_at(&self, now_ms: u64, transport: &dyn AgentTransport) -> CheckOutcome {
        let Ok(_guard) = self.check_lock.try_lock() else {
            debug!(agent = %self.agent.name, "check already in progress, skipping");
            return CheckOutcome::Contended;
        };

        let (due, idle_ms) = {
            let a = self.activity();
            if a.state == RecordState::Reclaimed {
                return CheckOutcome::AlreadyReclaimed;
            }
            let idle_ms = now_ms.saturating_sub(a.idle_start_ms);
            (reclaim_due(&self.agent.retention, &a, idle_ms), idle_ms)
        };
        debug!(agent = %self.agent.name, idle_ms, due, "checked agent");

        if !due {
            return CheckOutcome::Retained { idle_ms };
        }

        self.set_state(RecordState::ReclaimPending);
        match self.reclaim(transport).await {
            Ok(released) => {
                self.set_state(RecordState::Reclaimed);
                info!(
                    agent = %released.agent_name,
                    vmid = %released.vmid,
                    state = %released.power_state,
                    "agent reclaimed"
                );
                CheckOutcome::Reclaimed(released)
            }
            Err(e) => {
                error!(agent = %self.agent.name, error = %e, "reclamation failed, will retry");
                self.set_state(RecordState::Busy);
                CheckOutcome::Failed
            }
        }
    }

    async fn reclaim(&self, transport: &dyn AgentTransport) -> RetentionResult<ReleasedAgent> {
        let agent = &self.agent;
        info!(agent = %agent.name, "disconnecting idle agent");
        transport
            .disconnect(agent)
            .await
            .map_err(|source| RetentionError::Disconnect {
                agent: agent.name.clone(),
                source,
            })?;

        let command = post_build_command(agent.post_build_behavior, agent.previous_state);
        let power_state = match command {
            Some(command) => {
                transport
                    .send_power_command(&agent.vmid, command)
                    .await
                    .map_err(|source| RetentionError::PowerCommand {
                        vmid: agent.vmid.clone(),
                        command,
                        source,
                    })?;
                command.resulting_state()
            }
            None => VmPowerState::Running,
        };

        transport
            .terminate(agent)
            .await
            .map_err(|source| RetentionError::Terminate {
                agent: agent.name.clone(),
                source,
            })?;

        Ok(ReleasedAgent {
            agent_name: agent.name.clone(),
            vmid: agent.vmid.clone(),
            power_state,
        })
    }

    fn set_state(&self, state: RecordState) {
        self.activity().state = state;
    }

    fn activity(&self) -> MutexGuard<'_, Activity> {
        self.activity.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Whether the policy wants the agent reclaimed now.
///
/// An agent in the middle of a build is never due. `RunOnce` agents that
/// never receive a build fall back to the default idle timeout.
fn reclaim_due(policy: &RetentionPolicy, activity: &Activity, idle_ms: u64) -> bool {
    if activity.in_build {
        return false;
    }
    let timeout = policy.idle_timeout().unwrap_or(DEFAULT_IDLE_TIMEOUT);
    let idle_expired = u128::from(idle_ms) > timeout.as_millis();
    match policy {
        RetentionPolicy::KeepUntilIdle { .. } => idle_expired,
        RetentionPolicy::RunOnce => activity.builds_completed > 0 || idle_expired,
    }
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
