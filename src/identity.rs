//! Node Identity Probe — gathers the small fixed set of facts about this
//! machine that the manifest's `nodeInfo` block and every control-plane call
//! carry: architecture, OS release string, hostname, and agent version.

use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::common::PROJECT_VERSION;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    #[serde(rename = "cpuArch")]
    pub cpu_arch: String,
    #[serde(rename = "osRelease")]
    pub os_release: String,
    #[serde(rename = "nodeName")]
    pub node_name: String,
    #[serde(rename = "binProxyVersion")]
    pub bin_proxy_version: String,
}

impl NodeIdentity {
    /// Collects the identity tuple from the local environment. Individual
    /// probes degrade to a best-effort fallback rather than failing the
    /// whole collection — a missing OS release string shouldn't prevent the
    /// agent from running.
    #[must_use]
    pub fn collect() -> Self {
        Self {
            cpu_arch: std::env::consts::ARCH.to_string(),
            os_release: os_release(),
            node_name: node_name(),
            bin_proxy_version: PROJECT_VERSION.to_string(),
        }
    }
}

fn os_release() -> String {
    System::long_os_version().unwrap_or_else(|| std::env::consts::OS.to_string())
}

fn node_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// The stable node identifier used as the control plane's correlation key.
/// The spec fixes this to the node's hostname.
#[must_use]
pub fn node_id() -> String {
    node_name()
}
