//! vmgrid-scheduler — provisioning of VM-backed build agents.
//!
//! Turns a capacity signal (`label`, `excess_workload`) into started VMs and
//! planned agents. The engine:
//!
//! - Gates every request on a lazily created connector being online
//! - Scans instances first-fit in declaration order under one fleet lock
//! - Enforces `max_concurrent_vms` across all calls
//! - Optionally starts linked clones instead of the templates themselves
//! - Brings agents up on the tokio worker pool, outside the lock
//!
//! # Architecture
//!
//! ```text
//! ProvisioningEngine
//!   ├── CloudConfig (templates, ceiling, clone mode)
//!   ├── Arc<Mutex<VmTracker>> (the fleet)
//!   ├── Option<Arc<dyn Connector>> (get-or-create, cleared on terminate)
//!   ├── ConnectorFactory
//!   └── LabelMatcher
//! ```

pub mod clone;
pub mod connector;
pub mod engine;
pub mod error;

pub use clone::create_linked_clone;
pub use connector::{Connector, ConnectorFactory, ConnectorSpec, VmStarted};
pub use engine::{PlannedAgent, ProvisioningEngine};
pub use error::{SchedulerError, SchedulerResult};
