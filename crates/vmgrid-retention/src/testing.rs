//! Test doubles shared by the retention tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use vmgrid_core::{AgentHandle, PowerCommand};

use crate::transport::AgentTransport;

/// Pauses `disconnect` until released.
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

/// Records every call as `"<verb> <target>"`.
#[derive(Default)]
pub struct FakeTransport {
    calls: Mutex<Vec<String>>,
    disconnect_failures: AtomicU32,
    power_failures: AtomicU32,
    gate: Mutex<Option<Arc<Gate>>>,
}

impl FakeTransport {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_disconnect(&self, times: u32) {
        self.disconnect_failures.store(times, Ordering::SeqCst);
    }

    pub fn fail_power(&self, times: u32) {
        self.power_failures.store(times, Ordering::SeqCst);
    }

    pub fn block_disconnect(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl AgentTransport for FakeTransport {
    async fn connect(&self, agent: &AgentHandle) -> anyhow::Result<()> {
        self.log(format!("connect {}", agent.name));
        Ok(())
    }

    async fn disconnect(&self, agent: &AgentHandle) -> anyhow::Result<()> {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if take_failure(&self.disconnect_failures) {
            anyhow::bail!("channel closed");
        }
        self.log(format!("disconnect {}", agent.name));
        Ok(())
    }

    async fn terminate(&self, agent: &AgentHandle) -> anyhow::Result<()> {
        self.log(format!("terminate {}", agent.name));
        Ok(())
    }

    async fn send_power_command(&self, vmid: &str, command: PowerCommand) -> anyhow::Result<()> {
        if take_failure(&self.power_failures) {
            anyhow::bail!("vm {vmid} did not respond");
        }
        self.log(format!("{command} {vmid}"));
        Ok(())
    }
}
