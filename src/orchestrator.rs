//! Update Orchestrator — the per-binary state machine: query latest hash,
//! lock, stage+verify, archive current, replace, restart, verify-live, with
//! compensating rollback on any restart-time failure.
//!
//! Modeled as an explicit enum plus a driving loop rather than inline
//! control flow, so the rollback path (which re-enters at `Archived`) shares
//! every later transition with the upgrade path, and each transition is
//! independently testable against a [`FakeSupervisor`](crate::supervisor::FakeSupervisor).

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use log::{error, info, warn};

use crate::archive::{archive_if_absent, archived_path};
use crate::config::AgentConfig;
use crate::control_plane::ControlPlaneClient;
use crate::lock;
use crate::replace::{atomic_replace_binary, sha256};
use crate::supervisor::{RestartSupervisor, ServiceStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Queried,
    Locked,
    Staged,
    Verified,
    Archived,
    Replaced,
    Restarted,
    VerifiedLive,
    Done,
    Failed,
}

/// The operation driving one pass through the state machine: an upgrade
/// stages a fresh download, a rollback restores from the archive. Both
/// converge at [`OrchestratorState::Archived`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Upgrade,
    Rollback,
}

pub struct Outcome {
    pub final_state: OrchestratorState,
    /// The hash now installed, if the run reached `Done` (upgrade or
    /// successful auto-rollback); `None` otherwise.
    pub installed_hash: Option<String>,
}

/// Runs the binary at `binary_name`, currently at `current_hash` (empty
/// string if not yet installed), to `target_hash`.
pub fn upgrade(
    config: &AgentConfig,
    control_plane: &ControlPlaneClient<'_>,
    supervisor: &dyn RestartSupervisor,
    node_name: &str,
    binary_name: &str,
    current_hash: &str,
    target_hash: &str,
) -> Result<Outcome> {
    if target_hash.is_empty() {
        bail!("target hash for {binary_name} is empty");
    }

    if !current_hash.is_empty() && current_hash == target_hash {
        info!("{binary_name} is already up to date ({current_hash})");
        return Ok(Outcome { final_state: OrchestratorState::Done, installed_hash: None });
    }

    if !lock::acquire(&config.lock_dir, binary_name, target_hash, config.lock_timeout)? {
        warn!("lock busy for {binary_name}, skipping this run");
        return Ok(Outcome { final_state: OrchestratorState::Failed, installed_hash: None });
    }

    let result = (|| -> Result<Outcome> {
        crate::download::kill_stragglers(binary_name, std::process::id());

        control_plane.report_progress(node_name, binary_name, target_hash, 0, "in_progress");

        let staging_dir = std::env::temp_dir();
        let random_suffix: u32 = rand::Rng::random(&mut rand::rng());
        let staging_path = staging_dir.join(format!("{binary_name}.tmp.{random_suffix:08x}"));

        if let Err(e) = crate::download::check_free_space(&staging_dir).context("insufficient space to stage download") {
            fail_upgrade(control_plane, config, node_name, binary_name, target_hash, &e);
            return Ok(terminal_failure());
        }

        let url = format!("{}/{binary_name}", config.download_base_url);
        if let Err(e) = crate::download::fetch(&url, &staging_path, config.download_timeout.as_secs()) {
            let _ = std::fs::remove_file(&staging_path);
            fail_upgrade(control_plane, config, node_name, binary_name, target_hash, &e);
            return Ok(terminal_failure());
        }

        let staged_hash = sha256(&staging_path)?;
        if staged_hash != target_hash {
            let _ = std::fs::remove_file(&staging_path);
            error!("checksum mismatch for {binary_name}: expected {target_hash}, got {staged_hash}");
            fail_upgrade_message(control_plane, config, node_name, binary_name, target_hash, "checksum mismatch");
            return Ok(terminal_failure());
        }

        finish_from_staged(
            config,
            control_plane,
            supervisor,
            node_name,
            binary_name,
            target_hash,
            &staging_path,
            Operation::Upgrade,
        )
    })();

    lock::release(&config.lock_dir, binary_name, target_hash)?;
    result
}

/// The rollback-only entry point: restores `binary_name` to `target_hash`
/// from the archive, with no network download and no re-verification (the
/// archive is trusted by construction).
pub fn rollback(
    config: &AgentConfig,
    control_plane: &ControlPlaneClient<'_>,
    supervisor: &dyn RestartSupervisor,
    node_name: &str,
    binary_name: &str,
    current_hash: &str,
    target_hash: &str,
) -> Result<Outcome> {
    if target_hash.is_empty() {
        bail!("target hash for {binary_name} rollback is empty");
    }

    if !lock::acquire(&config.lock_dir, binary_name, target_hash, config.lock_timeout)? {
        warn!("lock busy for {binary_name}, cannot roll back right now");
        return Ok(Outcome { final_state: OrchestratorState::Failed, installed_hash: None });
    }

    let result = (|| -> Result<Outcome> {
        let archived = archived_path(&config.bin_dir, binary_name, target_hash);
        if !archived.exists() {
            bail!("rollback failed: no archived binary for {binary_name} at {target_hash}");
        }

        info!("rolling back {binary_name} from {current_hash} to {target_hash}");
        finish_from_staged(
            config,
            control_plane,
            supervisor,
            node_name,
            binary_name,
            target_hash,
            &archived,
            Operation::Rollback,
        )
    })();

    lock::release(&config.lock_dir, binary_name, target_hash)?;
    result
}

/// Shared tail of both paths, starting from `Verified` (the staged or
/// archived source is already known good): archive current → replace →
/// restart → verify-live, with compensating rollback on restart failure.
/// Archives and later rolls back against whatever hash is actually on disk
/// at `<bin_dir>/<binary_name>` right now, not a caller-supplied hash — see
/// the comment at the archive call below.
#[allow(clippy::too_many_arguments)]
fn finish_from_staged(
    config: &AgentConfig,
    control_plane: &ControlPlaneClient<'_>,
    supervisor: &dyn RestartSupervisor,
    node_name: &str,
    binary_name: &str,
    target_hash: &str,
    source: &Path,
    operation: Operation,
) -> Result<Outcome> {
    let installed_path = config.bin_dir.join(binary_name);

    // Archive keyed by the hash actually on disk right now, not the
    // manifest's recorded `current_hash`: those two can diverge (a prior
    // out-of-band replacement, or a manifest left stale by a crash), and the
    // archive invariant (§8: `<archive>/<name>/P` has sha256 `P`) only holds
    // if the key matches the bytes being archived.
    let installed_hash = if installed_path.exists() { sha256(&installed_path)? } else { String::new() };
    if !installed_hash.is_empty() {
        archive_if_absent(&config.bin_dir, binary_name, &installed_hash, &installed_path)?;
    }

    atomic_replace_binary(source, &installed_path)
        .with_context(|| format!("failed to install {binary_name}"))?;
    if operation == Operation::Upgrade {
        let _ = std::fs::remove_file(source);
    }

    if !supervisor.available() {
        info!("no supervisor available, skipping restart for {binary_name}");
        return finish_success(control_plane, config, node_name, binary_name, target_hash, operation);
    }

    let restarted = supervisor.restart(binary_name).unwrap_or(false);
    if restarted {
        let status = supervisor.status(binary_name).unwrap_or(ServiceStatus::Other);
        if status == ServiceStatus::Running {
            return finish_success(control_plane, config, node_name, binary_name, target_hash, operation);
        }
        error!("{binary_name} not running after restart");
    } else {
        error!("failed to restart {binary_name}");
    }

    compensate(config, control_plane, supervisor, node_name, binary_name, &installed_hash, target_hash, operation)
}

fn finish_success(
    control_plane: &ControlPlaneClient<'_>,
    config: &AgentConfig,
    node_name: &str,
    binary_name: &str,
    target_hash: &str,
    operation: Operation,
) -> Result<Outcome> {
    let elapsed = lock::held_duration(&config.lock_dir, binary_name, target_hash)?.unwrap_or(Duration::ZERO);

    if operation == Operation::Upgrade {
        control_plane.report_progress(node_name, binary_name, target_hash, elapsed.as_secs(), "success");
        control_plane.report_installed(node_name, binary_name, target_hash);
    }

    Ok(Outcome { final_state: OrchestratorState::Done, installed_hash: Some(target_hash.to_string()) })
}

/// On restart failure: if a prior version is archived, copy it back and
/// restart once more; either way the attempt is reported failed.
#[allow(clippy::too_many_arguments)]
fn compensate(
    config: &AgentConfig,
    control_plane: &ControlPlaneClient<'_>,
    supervisor: &dyn RestartSupervisor,
    node_name: &str,
    binary_name: &str,
    current_hash: &str,
    target_hash: &str,
    operation: Operation,
) -> Result<Outcome> {
    let installed_path = config.bin_dir.join(binary_name);
    let mut rolled_back_hash = None;

    if !current_hash.is_empty() {
        let rollback_source = archived_path(&config.bin_dir, binary_name, current_hash);
        if rollback_source.exists() {
            info!("auto-rollback: restoring {binary_name} to {current_hash}");
            if atomic_replace_binary(&rollback_source, &installed_path).is_ok()
                && supervisor.restart(binary_name).unwrap_or(false)
            {
                info!("auto-rollback successful for {binary_name}");
                rolled_back_hash = Some(current_hash.to_string());
            } else {
                error!("auto-rollback failed for {binary_name}, service may be down");
            }
        }
    }

    let elapsed = lock::held_duration(&config.lock_dir, binary_name, target_hash)?.unwrap_or(Duration::ZERO);
    if operation == Operation::Upgrade {
        control_plane.report_progress(node_name, binary_name, target_hash, elapsed.as_secs(), "failed");
    }

    Ok(Outcome { final_state: OrchestratorState::Failed, installed_hash: rolled_back_hash })
}

fn fail_upgrade(
    control_plane: &ControlPlaneClient<'_>,
    config: &AgentConfig,
    node_name: &str,
    binary_name: &str,
    target_hash: &str,
    error: &anyhow::Error,
) {
    error!("failed to stage {binary_name}: {error}");
    fail_upgrade_message(control_plane, config, node_name, binary_name, target_hash, &error.to_string());
}

fn fail_upgrade_message(
    control_plane: &ControlPlaneClient<'_>,
    config: &AgentConfig,
    node_name: &str,
    binary_name: &str,
    target_hash: &str,
    _message: &str,
) {
    let elapsed = lock::held_duration(&config.lock_dir, binary_name, target_hash)
        .ok()
        .flatten()
        .unwrap_or(Duration::ZERO);
    control_plane.report_progress(node_name, binary_name, target_hash, elapsed.as_secs(), "failed");
}

fn terminal_failure() -> Outcome {
    Outcome { final_state: OrchestratorState::Failed, installed_hash: None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::FakeSupervisor;
    use std::time::Duration as StdDuration;

    fn test_config(temp: &std::path::Path) -> AgentConfig {
        AgentConfig::builder()
            .bin_manifests(temp.join("manifest.json"))
            .bin_manager_api("http://127.0.0.1:1/api/v1".to_string())
            .bin_dir(temp.join("bin"))
            .lock_dir(temp.join("lock"))
            .lock_timeout(StdDuration::from_secs(600))
            .download_base_url("http://127.0.0.1:1/api/v1/download".to_string())
            .download_timeout(StdDuration::from_secs(300))
            .build()
    }

    #[test]
    fn test_upgrade_short_circuits_when_hashes_equal() {
        let temp = tempfile::tempdir().unwrap();
        let config = test_config(temp.path());
        let control_plane = ControlPlaneClient::new(&config);
        let supervisor = FakeSupervisor { restart_ok: true, status: ServiceStatus::Running };

        let outcome =
            upgrade(&config, &control_plane, &supervisor, "host1", "svc", "AA", "AA").unwrap();

        assert_eq!(outcome.final_state, OrchestratorState::Done);
        assert!(outcome.installed_hash.is_none());
    }

    #[test]
    fn test_upgrade_rejects_empty_target_hash() {
        let temp = tempfile::tempdir().unwrap();
        let config = test_config(temp.path());
        let control_plane = ControlPlaneClient::new(&config);
        let supervisor = FakeSupervisor { restart_ok: true, status: ServiceStatus::Running };

        let result = upgrade(&config, &control_plane, &supervisor, "host1", "svc", "", "");
        assert!(result.is_err());
    }

    #[test]
    fn test_upgrade_fails_when_lock_already_held() {
        let temp = tempfile::tempdir().unwrap();
        let config = test_config(temp.path());
        let control_plane = ControlPlaneClient::new(&config);
        let supervisor = FakeSupervisor { restart_ok: true, status: ServiceStatus::Running };

        lock::acquire(&config.lock_dir, "svc", "BB", config.lock_timeout).unwrap();

        let outcome =
            upgrade(&config, &control_plane, &supervisor, "host1", "svc", "AA", "BB").unwrap();
        assert_eq!(outcome.final_state, OrchestratorState::Failed);
    }

    #[test]
    fn test_rollback_fails_when_archive_missing() {
        let temp = tempfile::tempdir().unwrap();
        let config = test_config(temp.path());
        let control_plane = ControlPlaneClient::new(&config);
        let supervisor = FakeSupervisor { restart_ok: true, status: ServiceStatus::Running };

        let result =
            rollback(&config, &control_plane, &supervisor, "host1", "svc", "BB", "AA");
        assert!(result.is_err());
    }

    #[test]
    fn test_rollback_succeeds_from_archive() {
        let temp = tempfile::tempdir().unwrap();
        let config = test_config(temp.path());
        std::fs::create_dir_all(&config.bin_dir).unwrap();

        let archive_dir = config.bin_dir.join(".archive").join("svc");
        std::fs::create_dir_all(&archive_dir).unwrap();
        std::fs::write(archive_dir.join("AA"), b"old-binary").unwrap();

        let control_plane = ControlPlaneClient::new(&config);
        let supervisor = FakeSupervisor { restart_ok: true, status: ServiceStatus::Running };

        let outcome =
            rollback(&config, &control_plane, &supervisor, "host1", "svc", "BB", "AA").unwrap();

        assert_eq!(outcome.final_state, OrchestratorState::Done);
        assert_eq!(std::fs::read(config.bin_dir.join("svc")).unwrap(), b"old-binary");
    }

    #[test]
    fn test_rollback_releases_lock_on_completion() {
        let temp = tempfile::tempdir().unwrap();
        let config = test_config(temp.path());
        std::fs::create_dir_all(&config.bin_dir).unwrap();

        let archive_dir = config.bin_dir.join(".archive").join("svc");
        std::fs::create_dir_all(&archive_dir).unwrap();
        std::fs::write(archive_dir.join("AA"), b"old-binary").unwrap();

        let control_plane = ControlPlaneClient::new(&config);
        let supervisor = FakeSupervisor { restart_ok: true, status: ServiceStatus::Running };

        rollback(&config, &control_plane, &supervisor, "host1", "svc", "BB", "AA").unwrap();

        assert!(!lock::lock_path(&config.lock_dir, "svc", "AA").exists());
    }

    #[test]
    fn test_finish_from_staged_triggers_compensating_rollback_on_restart_failure() {
        let temp = tempfile::tempdir().unwrap();
        let config = test_config(temp.path());
        std::fs::create_dir_all(&config.bin_dir).unwrap();

        let installed_path = config.bin_dir.join("svc");
        std::fs::write(&installed_path, b"old-binary").unwrap();
        // finish_from_staged archives whatever is on disk under its own
        // computed hash before replacing, so compensation finds it later
        // without the test having to pre-seed the archive itself.
        let old_hash = sha256(&installed_path).unwrap();

        let staged = temp.path().join("staged");
        std::fs::write(&staged, b"new-binary").unwrap();

        let control_plane = ControlPlaneClient::new(&config);
        let supervisor = FakeSupervisor { restart_ok: false, status: ServiceStatus::Other };

        lock::acquire(&config.lock_dir, "svc", "BB", config.lock_timeout).unwrap();
        let outcome = finish_from_staged(
            &config,
            &control_plane,
            &supervisor,
            "host1",
            "svc",
            "BB",
            &staged,
            Operation::Upgrade,
        )
        .unwrap();

        assert_eq!(outcome.final_state, OrchestratorState::Failed);
        assert_eq!(outcome.installed_hash, Some(old_hash));
        assert_eq!(std::fs::read(config.bin_dir.join("svc")).unwrap(), b"old-binary");
    }

    #[test]
    fn test_finish_from_staged_skips_restart_when_supervisor_unavailable() {
        let temp = tempfile::tempdir().unwrap();
        let config = test_config(temp.path());
        std::fs::create_dir_all(&config.bin_dir).unwrap();

        let staged = temp.path().join("staged");
        std::fs::write(&staged, b"new-binary").unwrap();

        let control_plane = ControlPlaneClient::new(&config);

        struct Unavailable;
        impl RestartSupervisor for Unavailable {
            fn available(&self) -> bool {
                false
            }
            fn restart(&self, _binary_name: &str) -> Result<bool> {
                unreachable!("restart should not be called when unavailable")
            }
            fn status(&self, _binary_name: &str) -> Result<ServiceStatus> {
                unreachable!("status should not be called when unavailable")
            }
        }

        lock::acquire(&config.lock_dir, "svc", "BB", config.lock_timeout).unwrap();
        let outcome = finish_from_staged(
            &config,
            &control_plane,
            &Unavailable,
            "host1",
            "svc",
            "BB",
            &staged,
            Operation::Upgrade,
        )
        .unwrap();

        assert_eq!(outcome.final_state, OrchestratorState::Done);
        assert_eq!(std::fs::read(config.bin_dir.join("svc")).unwrap(), b"new-binary");
    }
}
