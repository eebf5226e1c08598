//! Driver — the agent's single external entry point: load the manifest,
//! refresh node identity, best-effort keepalive, then drive the Update
//! Orchestrator once per tracked binary, tolerant of any one binary failing.

use anyhow::{Context, Result};
use log::{error, info};

use crate::config::AgentConfig;
use crate::control_plane::ControlPlaneClient;
use crate::identity::{NodeIdentity, node_id};
use crate::manifest::Manifest;
use crate::orchestrator;
use crate::supervisor::RestartSupervisor;

/// Runs one pass over every binary the manifest tracks. Errors loading the
/// manifest itself are fatal (propagated to the caller); errors processing
/// an individual binary are logged and do not stop the remaining binaries.
pub fn run(config: &AgentConfig, supervisor: &dyn RestartSupervisor) -> Result<()> {
    info!("=== starting bin-proxy v{} ===", crate::common::PROJECT_VERSION);

    let mut manifest = Manifest::load(&config.bin_manifests)
        .with_context(|| format!("Manifest file not found: {}", config.bin_manifests.display()))?;

    manifest.update_node_info(NodeIdentity::collect());

    let control_plane = ControlPlaneClient::new(config);
    let node_name = node_id();
    control_plane.keepalive(&node_name, &manifest.node_info);

    let binary_names: Vec<String> = manifest.binaries.iter().map(|b| b.binary_name.clone()).collect();

    for binary_name in binary_names {
        let current_hash = manifest.find(&binary_name).map(|b| b.version.clone()).unwrap_or_default();

        info!("processing binary: {binary_name}");
        match process_one(config, &control_plane, supervisor, &node_name, &binary_name, &current_hash) {
            Ok(Some(installed_hash)) => manifest.update_binary(&binary_name, &installed_hash),
            Ok(None) => {}
            Err(e) => error!("error processing {binary_name}: {e}"),
        }
    }

    manifest.save(&config.bin_manifests)?;
    info!("=== bin-proxy completed ===");
    Ok(())
}

fn process_one(
    config: &AgentConfig,
    control_plane: &ControlPlaneClient<'_>,
    supervisor: &dyn RestartSupervisor,
    node_name: &str,
    binary_name: &str,
    current_hash: &str,
) -> Result<Option<String>> {
    let target_hash = control_plane
        .query_latest_hash(binary_name)
        .with_context(|| format!("failed to get latest hash for {binary_name}"))?;

    let outcome = orchestrator::upgrade(
        config,
        control_plane,
        supervisor,
        node_name,
        binary_name,
        current_hash,
        &target_hash,
    )?;

    Ok(outcome.installed_hash)
}
