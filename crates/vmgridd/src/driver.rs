//! `prlctl` driver — VM control through the Parallels command-line tool.
//!
//! One `PrlctlDriver` serves as connector factory, connector, and agent
//! transport. Every operation shells out to a `prlctl`-compatible
//! executable, so tests and unusual hosts can point it at a wrapper.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use vmgrid_core::{AgentHandle, PowerCommand, VmPowerState};
use vmgrid_retention::AgentTransport;
use vmgrid_scheduler::{Connector, ConnectorFactory, ConnectorSpec, VmStarted};
use vmgrid_state::VmInstance;

pub const DEFAULT_PRLCTL: &str = "prlctl";

/// Longest any single `prlctl` invocation may run.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct PrlctlDriver {
    program: PathBuf,
    timeout: Duration,
}

impl Default for PrlctlDriver {
    fn default() -> Self {
        Self::new(DEFAULT_PRLCTL)
    }
}

impl PrlctlDriver {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Run one `prlctl` invocation and return its stdout.
    async fn run(&self, args: &[&str]) -> anyhow::Result<String> {
        debug!(program = %self.program.display(), ?args, "running prlctl");
        let running = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, running)
            .await
            .with_context(|| {
                format!("prlctl {} timed out after {:?}", args.join(" "), self.timeout)
            })?
            .with_context(|| format!("failed to run {}", self.program.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "prlctl {} failed ({}): {}",
                args.join(" "),
                output.status,
                stderr.trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run a shell script inside the VM.
    async fn exec(&self, vmid: &str, script: &str) -> anyhow::Result<String> {
        self.run(&["exec", vmid, "sh", "-c", script]).await
    }

    /// Address the VM reports for itself, if any.
    async fn reported_host(&self, vmid: &str) -> Option<String> {
        match self.run(&["list", "--full", "--json", vmid]).await {
            Ok(listing) => parse_reported_host(&listing),
            Err(e) => {
                debug!(vmid = %vmid, error = %e, "no address reported");
                None
            }
        }
    }
}

#[async_trait]
impl ConnectorFactory for PrlctlDriver {
    async fn create(&self, spec: &ConnectorSpec) -> anyhow::Result<Arc<dyn Connector>> {
        info!(
            connector = %spec.name,
            labels = %spec.labels,
            builder = spec.use_as_builder,
            "using local prlctl as connector"
        );
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl Connector for PrlctlDriver {
    async fn is_online(&self) -> bool {
        match self.run(&["list"]).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "prlctl not available");
                false
            }
        }
    }

    async fn power_state(&self, vmid: &str) -> anyhow::Result<Option<VmPowerState>> {
        let status = self.run(&["status", vmid]).await?;
        Ok(parse_status(&status))
    }

    async fn start_vm(&self, vm: &VmInstance) -> anyhow::Result<VmStarted> {
        if vm.is_linked_clone {
            let parent = vm.template_vmid();
            info!(parent = %parent, vmid = %vm.vmid, "creating linked clone");
            self.run(&["clone", parent, "--name", &vm.vmid, "--linked"])
                .await?;
        }
        self.run(&["start", &vm.vmid]).await?;
        let host = self.reported_host(&vm.vmid).await;
        Ok(VmStarted { host })
    }

    async fn create_agent_on(
        &self,
        vm: &VmInstance,
        planned: &AgentHandle,
    ) -> anyhow::Result<AgentHandle> {
        if let Some(command) = &planned.launcher.command {
            info!(agent = %planned.name, vmid = %vm.vmid, "launching agent");
            self.exec(&vm.vmid, &launch_script(&vm.vmid, command)).await?;
        }
        Ok(planned.clone())
    }

    async fn apply_power_command(&self, vmid: &str, command: PowerCommand) -> anyhow::Result<()> {
        self.run(&[command.as_str(), vmid]).await?;
        Ok(())
    }
}

#[async_trait]
impl AgentTransport for PrlctlDriver {
    async fn connect(&self, agent: &AgentHandle) -> anyhow::Result<()> {
        match self.power_state(&agent.vmid).await? {
            Some(VmPowerState::Running) => Ok(()),
            Some(state) => bail!("vm {} is {}, not running", agent.vmid, state),
            None => bail!("vm {} reported an unknown state", agent.vmid),
        }
    }

    async fn disconnect(&self, agent: &AgentHandle) -> anyhow::Result<()> {
        // prlctl holds no channel to the agent.
        debug!(agent = %agent.name, "agent disconnected");
        Ok(())
    }

    async fn terminate(&self, agent: &AgentHandle) -> anyhow::Result<()> {
        if agent.launcher.command.is_none() {
            return Ok(());
        }
        match self.power_state(&agent.vmid).await? {
            Some(VmPowerState::Running) => {
                self.exec(&agent.vmid, &stop_script(&agent.vmid)).await?;
                info!(agent = %agent.name, "agent process stopped");
            }
            state => {
                // Stopped with its VM; the next launch replaces a resumed one.
                debug!(agent = %agent.name, ?state, "vm not running, agent stopped with it");
            }
        }
        Ok(())
    }

    async fn send_power_command(&self, vmid: &str, command: PowerCommand) -> anyhow::Result<()> {
        self.apply_power_command(vmid, command).await
    }
}

// ── Agent process scripts ───────────────────────────────────────

fn pid_file(vmid: &str) -> String {
    let safe: String = vmid
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("/tmp/vmgrid-agent-{safe}.pid")
}

/// Kill the agent recorded in the pid file, if any, and its children.
fn stop_script(vmid: &str) -> String {
    let pid_file = pid_file(vmid);
    format!(
        "if [ -f {pid_file} ]; then pid=$(cat {pid_file}); \
         pkill -P \"$pid\" 2>/dev/null; kill \"$pid\" 2>/dev/null; rm -f {pid_file}; fi; true"
    )
}

/// Replace any previous agent with `command`, detached from the exec session.
fn launch_script(vmid: &str, command: &str) -> String {
    format!(
        "{stop}; nohup sh -c {cmd} >/dev/null 2>&1 & echo $! > {pid_file}",
        stop = stop_script(vmid),
        cmd = shell_quote(command),
        pid_file = pid_file(vmid),
    )
}

fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

// ── Output parsing ──────────────────────────────────────────────

/// `prlctl status` prints `VM <name> exist <state>`.
fn parse_status(output: &str) -> Option<VmPowerState> {
    output.split_whitespace().last().and_then(VmPowerState::parse)
}

/// First usable `ip_configured` entry of `prlctl list --full --json`.
fn parse_reported_host(listing: &str) -> Option<String> {
    let entries: Vec<serde_json::Value> = serde_json::from_str(listing).ok()?;
    entries
        .iter()
        .filter_map(|entry| entry.get("ip_configured")?.as_str())
        .map(str::trim)
        .find(|ip| !ip.is_empty() && *ip != "-")
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_uses_last_word() {
        assert_eq!(
            parse_status("VM build1 exist running\n"),
            Some(VmPowerState::Running)
        );
        assert_eq!(
            parse_status("VM build1 exist suspended"),
            Some(VmPowerState::Suspended)
        );
        assert_eq!(parse_status("VM build1 exist stopping"), None);
        assert_eq!(parse_status(""), None);
    }

    #[test]
    fn reported_host_from_listing() {
        let listing =
            r#"[{"name": "build1", "status": "running", "ip_configured": "10.211.55.7"}]"#;
        assert_eq!(parse_reported_host(listing).as_deref(), Some("10.211.55.7"));
    }

    #[test]
    fn unconfigured_ip_is_no_host() {
        let listing = r#"[{"name": "build1", "status": "running", "ip_configured": "-"}]"#;
        assert_eq!(parse_reported_host(listing), None);
        assert_eq!(parse_reported_host("not json"), None);
        assert_eq!(parse_reported_host("[]"), None);
    }

    #[tokio::test]
    async fn missing_program_is_offline() {
        let driver = PrlctlDriver::new("/nonexistent/vmgrid-prlctl");
        assert!(!driver.is_online().await);
        assert!(driver.power_state("build1").await.is_err());
        assert!(
            driver
                .send_power_command("build1", PowerCommand::Suspend)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn factory_hands_out_the_driver() {
        let driver = PrlctlDriver::default();
        assert_eq!(driver.program(), Path::new("prlctl"));

        let spec = ConnectorSpec {
            name: "farm host agent".into(),
            labels: String::new(),
            remote_fs: String::new(),
            launcher: Default::default(),
            use_as_builder: false,
        };
        assert!(driver.create(&spec).await.is_ok());
    }

    #[test]
    fn launch_detaches_and_records_pid() {
        let script = launch_script("build1", "java -jar agent.jar 'x'");
        assert!(script.starts_with(&stop_script("build1")));
        assert!(script.contains(r"nohup sh -c 'java -jar agent.jar '\''x'\''' >/dev/null 2>&1 &"));
        assert!(script.ends_with("echo $! > /tmp/vmgrid-agent-build1.pid"));
    }

    #[test]
    fn pid_file_name_is_sanitized() {
        assert_eq!(pid_file("a b/c"), "/tmp/vmgrid-agent-a_b_c.pid");
        assert_eq!(pid_file("build1_0926-1"), "/tmp/vmgrid-agent-build1_0926-1.pid");
    }

    /// A `prlctl` stand-in: `exec` runs the script locally, `start` hangs.
    #[cfg(unix)]
    fn fake_prlctl(name: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("vmgrid-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("prlctl");
        std::fs::write(
            &path,
            "#!/bin/sh\n\
             case \"$1\" in\n\
             status) echo \"VM $2 exist running\" ;;\n\
             exec) shift 2; exec \"$@\" ;;\n\
             start) sleep 30 ;;\n\
             esac\n",
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    fn vm_with_agent(vmid: &str, command: &str) -> (VmInstance, AgentHandle) {
        use vmgrid_core::{LaunchConfig, PostBuildBehavior, RetentionPolicy, VmTemplate};

        let mut vm = VmInstance::from_template(&VmTemplate::new(vmid, "linux"));
        vm.launcher = LaunchConfig {
            command: Some(command.to_string()),
            ..Default::default()
        };
        let agent = AgentHandle {
            name: format!("farm {vmid}"),
            vmid: vmid.to_string(),
            remote_fs: String::new(),
            launcher: vm.launcher.clone(),
            post_build_behavior: PostBuildBehavior::Suspend,
            previous_state: None,
            retention: RetentionPolicy::default(),
        };
        (vm, agent)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn long_running_agent_does_not_block_bring_up() {
        let driver = PrlctlDriver::new(fake_prlctl("launch"));
        let vmid = format!("launch-{}", std::process::id());
        let (vm, agent) = vm_with_agent(&vmid, "sleep 30");

        let bring_up = driver.create_agent_on(&vm, &agent);
        let launched = tokio::time::timeout(Duration::from_secs(10), bring_up)
            .await
            .expect("bring-up waited for the agent to exit");
        assert_eq!(launched.unwrap(), agent);

        let pid_path = pid_file(&vmid);
        let pid = std::fs::read_to_string(&pid_path).unwrap();
        assert!(pid.trim().parse::<u32>().is_ok());

        driver.terminate(&agent).await.unwrap();
        assert!(!Path::new(&pid_path).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hung_prlctl_times_out() {
        let driver =
            PrlctlDriver::new(fake_prlctl("hang")).with_timeout(Duration::from_millis(200));
        let (vm, _) = vm_with_agent("hung1", "true");

        let started = tokio::time::timeout(Duration::from_secs(10), driver.start_vm(&vm))
            .await
            .expect("timeout was not enforced");
        let err = started.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
