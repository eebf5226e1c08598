mod archive;
mod common;
mod config;
mod control_plane;
mod download;
mod driver;
mod identity;
mod lock;
mod logging;
mod manifest;
mod orchestrator;
mod replace;
mod supervisor;

pub use common::{PROJECT_NAME, PROJECT_VERSION};
pub use config::AgentConfig;
pub use control_plane::ControlPlaneClient;
pub use driver::run;
pub use identity::{NodeIdentity, node_id};
pub use logging::Logging;
pub use manifest::{BinaryEntry, Manifest};
pub use orchestrator::{Outcome, rollback as rollback_binary, upgrade as upgrade_binary};
pub use supervisor::{RestartSupervisor, ServiceStatus, SupervisorCtl};
