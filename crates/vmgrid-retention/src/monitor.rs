//! Retention monitor — background checks for every live agent.
//!
//! `start` registers an agent, opens its connection without waiting, and
//! spawns a loop that checks the agent at the advisory interval until it
//! is reclaimed or the monitor is told to stop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vmgrid_core::{AgentHandle, ReleasedAgent, VmPowerState};

use crate::record::{epoch_millis, CheckOutcome, RetentionRecord, CHECK_INTERVAL};
use crate::transport::AgentTransport;

/// Callback invoked after an agent has been reclaimed.
///
/// The provisioning engine uses this to free the instance.
pub type ReleaseCallback = Arc<dyn Fn(ReleasedAgent) -> BoxFuture + Send + Sync>;

type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// Per-agent monitor state.
struct MonitorSlot {
    record: Arc<RetentionRecord>,
    /// Handle to the background check task.
    handle: JoinHandle<()>,
    /// Shutdown signal for this agent's loop.
    shutdown_tx: watch::Sender<bool>,
}

/// Tracks every live agent and reclaims the idle ones.
#[derive(Clone)]
pub struct RetentionMonitor {
    transport: Arc<dyn AgentTransport>,
    /// Live agents: agent name → slot.
    records: Arc<RwLock<HashMap<String, MonitorSlot>>>,
    on_release: Option<ReleaseCallback>,
    check_interval: Duration,
}

impl RetentionMonitor {
    pub fn new(transport: Arc<dyn AgentTransport>) -> Self {
        Self {
            transport,
            records: Arc::new(RwLock::new(HashMap::new())),
            on_release: None,
            check_interval: CHECK_INTERVAL,
        }
    }

    /// Set a callback for reclaimed agents.
    pub fn with_callback(mut self, callback: ReleaseCallback) -> Self {
        self.on_release = Some(callback);
        self
    }

    /// Override the upper bound between background checks.
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Start tracking a newly created agent.
    pub async fn start(&self, agent: AgentHandle) {
        let name = agent.name.clone();
        info!(agent = %name, vmid = %agent.vmid, "starting agent");

        let record = Arc::new(RetentionRecord::new(agent, epoch_millis()));

        let transport = self.transport.clone();
        let connecting = record.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.connect(connecting.agent()).await {
                warn!(agent = %connecting.agent().name, error = %e, "agent connection failed");
            }
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = self.clone();
        let loop_name = name.clone();
        let handle = tokio::spawn(async move {
            monitor.run_check_loop(&loop_name, shutdown_rx).await;
        });

        let mut records = self.records.write().await;
        if let Some(old) = records.insert(
            name,
            MonitorSlot {
                record,
                handle,
                shutdown_tx,
            },
        ) {
            // Replace a stale loop for the same agent name.
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }
    }

    /// Check one agent now. `None` if the agent is not tracked.
    pub async fn check(&self, agent_name: &str) -> Option<CheckOutcome> {
        self.check_at(agent_name, epoch_millis()).await
    }

    /// Check one agent as if the time were `now_ms`.
    pub async fn check_at(&self, agent_name: &str, now_ms: u64) -> Option<CheckOutcome> {
        let record = self.record(agent_name).await?;
        let outcome = record.check_at(now_ms, self.transport.as_ref()).await;

        if let CheckOutcome::Reclaimed(released) = &outcome {
            self.forget(agent_name).await;
            if let Some(ref cb) = self.on_release {
                cb(released.clone()).await;
            }
        }
        Some(outcome)
    }

    /// The agent picked up a build.
    pub async fn agent_busy(&self, agent_name: &str) -> bool {
        match self.record(agent_name).await {
            Some(record) => {
                record.mark_busy();
                true
            }
            None => false,
        }
    }

    /// The agent finished its build.
    pub async fn agent_idle(&self, agent_name: &str) -> bool {
        match self.record(agent_name).await {
            Some(record) => {
                record.mark_idle(epoch_millis());
                true
            }
            None => false,
        }
    }

    /// Stop tracking an agent torn down elsewhere.
    ///
    /// The agent is not contacted. Its VM is reported released in the
    /// `Running` state it was left in, unless a check reclaimed it first.
    pub async fn stop(&self, agent_name: &str) {
        let Some(slot) = self.records.write().await.remove(agent_name) else {
            return;
        };
        // A check in flight finishes on its own and reports its reclaim.
        let _ = slot.shutdown_tx.send(true);
        info!(agent = %agent_name, "retention tracking stopped");

        if !slot.record.retire().await {
            return;
        }
        let agent = slot.record.agent();
        let released = ReleasedAgent {
            agent_name: agent.name.clone(),
            vmid: agent.vmid.clone(),
            power_state: VmPowerState::Running,
        };
        if let Some(ref cb) = self.on_release {
            cb(released).await;
        }
    }

    /// Stop all loops (for graceful shutdown).
    pub async fn stop_all(&self) {
        let mut records = self.records.write().await;
        for (name, slot) in records.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(agent = %name, "retention tracking stopped");
        }
        info!("all retention loops stopped");
    }

    /// Names of agents currently tracked.
    pub async fn active_agents(&self) -> Vec<String> {
        let records = self.records.read().await;
        records.keys().cloned().collect()
    }

    pub async fn is_tracking(&self, agent_name: &str) -> bool {
        let records = self.records.read().await;
        records.contains_key(agent_name)
    }

    async fn record(&self, agent_name: &str) -> Option<Arc<RetentionRecord>> {
        let records = self.records.read().await;
        records.get(agent_name).map(|slot| slot.record.clone())
    }

    /// Drop a reclaimed agent. Its loop notices the shutdown signal and
    /// exits on its own, since this may run inside that loop.
    async fn forget(&self, agent_name: &str) {
        let mut records = self.records.write().await;
        if let Some(slot) = records.remove(agent_name) {
            let _ = slot.shutdown_tx.send(true);
        }
    }

    /// The check loop for a single agent.
    async fn run_check_loop(&self, agent_name: &str, mut shutdown: watch::Receiver<bool>) {
        let mut wait = self.check_interval;
        debug!(agent = %agent_name, "retention loop starting");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    match self.check(agent_name).await {
                        None
                        | Some(CheckOutcome::Reclaimed(_))
                        | Some(CheckOutcome::AlreadyReclaimed) => break,
                        Some(outcome) => wait = outcome.next_check().min(self.check_interval),
                    }
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }

        debug!(agent = %agent_name, "retention loop finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::mpsc;
    use vmgrid_core::{PostBuildBehavior, RetentionPolicy};

    use crate::testing::FakeTransport;

    fn agent(name: &str, idle_timeout_secs: u64) -> AgentHandle {
        AgentHandle {
            name: name.to_string(),
            vmid: name.replace("farm ", ""),
            remote_fs: String::new(),
            launcher: Default::default(),
            post_build_behavior: PostBuildBehavior::Stop,
            previous_state: None,
            retention: RetentionPolicy::KeepUntilIdle { idle_timeout_secs },
        }
    }

    fn release_channel() -> (ReleaseCallback, mpsc::UnboundedReceiver<ReleasedAgent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cb: ReleaseCallback = Arc::new(move |released| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(released);
            })
        });
        (cb, rx)
    }

    #[tokio::test]
    async fn monitor_starts_and_stops() {
        let monitor = RetentionMonitor::new(Arc::new(FakeTransport::default()));
        assert!(monitor.active_agents().await.is_empty());

        monitor.start(agent("farm build1", 120)).await;
        assert!(monitor.is_tracking("farm build1").await);

        monitor.stop("farm build1").await;
        assert!(!monitor.is_tracking("farm build1").await);
    }

    #[tokio::test]
    async fn monitor_stop_all() {
        let monitor = RetentionMonitor::new(Arc::new(FakeTransport::default()));
        monitor.start(agent("farm build1", 120)).await;
        monitor.start(agent("farm build2", 120)).await;
        assert_eq!(monitor.active_agents().await.len(), 2);

        monitor.stop_all().await;
        assert!(monitor.active_agents().await.is_empty());
    }

    #[tokio::test]
    async fn start_connects_the_agent() {
        let transport = Arc::new(FakeTransport::default());
        let monitor = RetentionMonitor::new(transport.clone());
        monitor.start(agent("farm build1", 120)).await;

        for _ in 0..50 {
            if !transport.calls().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(transport.calls(), ["connect farm build1"]);
        monitor.stop_all().await;
    }

    #[tokio::test]
    async fn reclaim_forgets_agent_and_notifies() {
        let transport = Arc::new(FakeTransport::default());
        let (cb, mut rx) = release_channel();
        let monitor = RetentionMonitor::new(transport.clone()).with_callback(cb);
        monitor.start(agent("farm build1", 120)).await;

        let now = epoch_millis();
        let outcome = monitor.check_at("farm build1", now + 1_000).await.unwrap();
        assert!(matches!(outcome, CheckOutcome::Retained { .. }));
        assert!(monitor.is_tracking("farm build1").await);

        let outcome = monitor
            .check_at("farm build1", now + 121_000)
            .await
            .unwrap();
        assert!(matches!(outcome, CheckOutcome::Reclaimed(_)));
        assert!(!monitor.is_tracking("farm build1").await);

        let released = rx.recv().await.unwrap();
        assert_eq!(released.agent_name, "farm build1");
        assert_eq!(released.power_state, VmPowerState::Stopped);
        assert!(transport.calls().contains(&"stop build1".to_string()));
    }

    #[tokio::test]
    async fn stop_reports_the_release() {
        let transport = Arc::new(FakeTransport::default());
        let (cb, mut rx) = release_channel();
        let monitor = RetentionMonitor::new(transport.clone()).with_callback(cb);
        monitor.start(agent("farm build1", 120)).await;

        monitor.stop("farm build1").await;
        assert!(!monitor.is_tracking("farm build1").await);

        let released = rx.recv().await.unwrap();
        assert_eq!(released.agent_name, "farm build1");
        assert_eq!(released.vmid, "build1");
        assert_eq!(released.power_state, VmPowerState::Running);
        // Torn down elsewhere: no power command was sent.
        assert!(!transport.calls().iter().any(|c| c.starts_with("stop ")));
    }

    #[tokio::test]
    async fn stop_after_reclaim_reports_once() {
        let (cb, mut rx) = release_channel();
        let monitor = RetentionMonitor::new(Arc::new(FakeTransport::default())).with_callback(cb);
        monitor.start(agent("farm build1", 120)).await;

        let record = monitor.record("farm build1").await.unwrap();
        monitor
            .check_at("farm build1", epoch_millis() + 121_000)
            .await
            .unwrap();
        monitor.stop("farm build1").await;
        assert!(!record.retire().await);

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn check_unknown_agent_returns_none() {
        let monitor = RetentionMonitor::new(Arc::new(FakeTransport::default()));
        assert!(monitor.check("farm ghost").await.is_none());
        assert!(!monitor.agent_busy("farm ghost").await);
    }

    #[tokio::test]
    async fn busy_agent_survives_checks() {
        let monitor = RetentionMonitor::new(Arc::new(FakeTransport::default()));
        monitor.start(agent("farm build1", 120)).await;
        assert!(monitor.agent_busy("farm build1").await);

        let outcome = monitor
            .check_at("farm build1", epoch_millis() + 600_000)
            .await
            .unwrap();
        assert!(matches!(outcome, CheckOutcome::Retained { .. }));

        assert!(monitor.agent_idle("farm build1").await);
        monitor.stop_all().await;
    }

    #[tokio::test]
    async fn background_loop_reclaims_idle_agent() {
        let transport = Arc::new(FakeTransport::default());
        let (cb, mut rx) = release_channel();
        let monitor = RetentionMonitor::new(transport.clone())
            .with_callback(cb)
            .with_check_interval(Duration::from_millis(20));

        // Zero timeout: due as soon as a millisecond has passed.
        monitor.start(agent("farm build1", 0)).await;

        let released = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("agent was not reclaimed in time")
            .unwrap();
        assert_eq!(released.vmid, "build1");
        assert!(!monitor.is_tracking("farm build1").await);
    }

    #[tokio::test]
    async fn restarting_an_agent_replaces_its_record() {
        let monitor = RetentionMonitor::new(Arc::new(FakeTransport::default()));
        monitor.start(agent("farm build1", 120)).await;
        monitor.start(agent("farm build1", 120)).await;
        assert_eq!(monitor.active_agents().await.len(), 1);
        monitor.stop_all().await;
    }
}
