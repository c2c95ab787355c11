//! vmgridd — provisions build VMs for a label and reclaims them once idle.
//!
//! # Usage
//!
//! ```text
//! vmgridd validate --config vmgrid.toml
//! vmgridd run --config vmgrid.toml --label "linux && docker" --workload 2
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

use vmgrid_core::CloudConfig;
use vmgridd::driver::DEFAULT_PRLCTL;
use vmgridd::{Fleet, PrlctlDriver};

/// Log filter used when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "info,vmgridd=debug,vmgrid=debug";

#[derive(Parser)]
#[command(name = "vmgridd", about = "VMGrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check a cloud configuration and print its templates.
    Validate {
        /// Path to the cloud configuration.
        #[arg(long, default_value = "vmgrid.toml")]
        config: PathBuf,

        /// Print the parsed configuration as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Provision agents for a label and keep them until they are reclaimed.
    Run {
        /// Path to the cloud configuration.
        #[arg(long, default_value = "vmgrid.toml")]
        config: PathBuf,

        /// Label expression the workload asks for.
        #[arg(long)]
        label: String,

        /// Number of executors needed.
        #[arg(long, default_value = "1")]
        workload: u32,

        /// `prlctl` executable to drive.
        #[arg(long, default_value = DEFAULT_PRLCTL)]
        prlctl: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { config, json } => validate(config, json),
        Command::Run {
            config,
            label,
            workload,
            prlctl,
        } => run(config, label, workload, prlctl).await,
    }
}

fn validate(path: PathBuf, json: bool) -> anyhow::Result<()> {
    let config = CloudConfig::from_file(&path)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    println!(
        "cloud {:?}: {} template(s), max {} concurrent, linked clones {}",
        config.name,
        config.vms.len(),
        config.max_concurrent_vms,
        if config.use_linked_clones { "on" } else { "off" },
    );
    for vm in &config.vms {
        println!(
            "  {:<20} labels={:?} after-build={} retention={:?}",
            vm.vmid, vm.labels, vm.post_build_behavior, vm.retention
        );
    }
    Ok(())
}

async fn run(path: PathBuf, label: String, workload: u32, prlctl: PathBuf) -> anyhow::Result<()> {
    let config = CloudConfig::from_file(&path)?;
    info!(cloud = %config.name, path = ?path, "configuration loaded");

    let driver = Arc::new(PrlctlDriver::new(prlctl));
    let fleet = Fleet::new(config, driver.clone(), driver);

    if !fleet.engine().can_provision(Some(&label)) {
        warn!(label = %label, "no template matches the label");
        return Ok(());
    }

    let agents = fleet.provision(Some(&label), workload).await;
    if agents.is_empty() {
        warn!(label = %label, "nothing was provisioned");
        return Ok(());
    }

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                error!(error = %e, "failed to install Ctrl-C handler");
                shutdown_tx.closed().await;
            }
        }
    });

    fleet.run_until_drained(shutdown_rx).await;
    fleet.shutdown().await;

    info!("VMGrid daemon stopped");
    Ok(())
}
