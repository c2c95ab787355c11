//! vmgridd — the VMGrid daemon.
//!
//! Assembles the provisioning engine and the retention monitor around a
//! `prlctl` driver:
//!
//! ```text
//! vmgridd
//!   ├── CloudConfig (vmgrid.toml)
//!   ├── Fleet
//!   │   ├── ProvisioningEngine ──► PlannedAgent ──► RetentionMonitor
//!   │   └── RetentionMonitor ──(ReleasedAgent)──► ProvisioningEngine
//!   └── PrlctlDriver (ConnectorFactory, Connector, AgentTransport)
//! ```

pub mod driver;
pub mod fleet;

pub use driver::PrlctlDriver;
pub use fleet::Fleet;
