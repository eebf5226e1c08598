//! End-to-end exercises of the upgrade/rollback state machine against a
//! throwaway local HTTP server standing in for the control plane's download
//! endpoint, covering the scenarios from the behavioral spec this agent
//! implements: fresh install, no-op, checksum mismatch, restart-triggered
//! rollback, lock contention, and stale-lock recovery.

use std::time::Duration;

use bin_proxy::{AgentConfig, ControlPlaneClient, Manifest, NodeIdentity, ServiceStatus, RestartSupervisor};
use sha2::{Digest, Sha256};
use tiny_http::{Response, Server};

struct FixedSupervisor {
    restart_ok: bool,
    status: ServiceStatus,
}

impl RestartSupervisor for FixedSupervisor {
    fn available(&self) -> bool {
        true
    }

    fn restart(&self, _binary_name: &str) -> anyhow::Result<bool> {
        Ok(self.restart_ok)
    }

    fn status(&self, _binary_name: &str) -> anyhow::Result<ServiceStatus> {
        Ok(self.status)
    }
}

/// Spawns a one-shot-per-request HTTP server serving `body` for any path, on
/// an OS-assigned port, returning the base URL to reach it at.
fn spawn_download_server(body: &'static [u8]) -> String {
    let server = Server::http("127.0.0.1:0").expect("failed to bind test server");
    let addr = server.server_addr();
    let base_url = format!("http://{addr}");

    std::thread::spawn(move || {
        for request in server.incoming_requests() {
            let _ = request.respond(Response::from_data(body));
        }
    });

    base_url
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

fn test_config(temp: &std::path::Path, base_url: &str) -> AgentConfig {
    AgentConfig::builder()
        .bin_manifests(temp.join("manifest.json"))
        .bin_manager_api(format!("{base_url}/api/v1"))
        .bin_dir(temp.join("bin"))
        .lock_dir(temp.join("lock"))
        .lock_timeout(Duration::from_secs(600))
        .download_base_url(base_url.to_string())
        .download_timeout(Duration::from_secs(30))
        .build()
}

fn sample_identity() -> NodeIdentity {
    NodeIdentity::collect()
}

fn seed_manifest(config: &AgentConfig, binary_name: &str, version: &str) {
    let manifest = Manifest {
        node_info: sample_identity(),
        binaries: vec![bin_proxy::BinaryEntry {
            binary_name: binary_name.to_string(),
            version: version.to_string(),
            previous_version: String::new(),
        }],
    };
    manifest.save(&config.bin_manifests).unwrap();
}

#[test]
fn test_fresh_install_downloads_verifies_and_installs() {
    let temp = tempfile::tempdir().unwrap();
    let body: &'static [u8] = b"binary-contents-v1";
    let target_hash = sha256_hex(body);
    let base_url = spawn_download_server(body);

    let config = test_config(temp.path(), &base_url);
    seed_manifest(&config, "svc", "");

    let control_plane = ControlPlaneClient::new(&config);
    let supervisor = FixedSupervisor { restart_ok: true, status: ServiceStatus::Running };

    let outcome =
        bin_proxy::upgrade_binary(&config, &control_plane, &supervisor, "host1", "svc", "", &target_hash)
            .unwrap();

    assert_eq!(outcome.installed_hash, Some(target_hash));
    assert_eq!(std::fs::read(config.bin_dir.join("svc")).unwrap(), body);
}

#[test]
fn test_noop_when_current_equals_target() {
    let temp = tempfile::tempdir().unwrap();
    // No server spawned: a no-op must never reach the network.
    let config = test_config(temp.path(), "http://127.0.0.1:1");
    seed_manifest(&config, "svc", "AA");

    let control_plane = ControlPlaneClient::new(&config);
    let supervisor = FixedSupervisor { restart_ok: true, status: ServiceStatus::Running };

    let outcome =
        bin_proxy::upgrade_binary(&config, &control_plane, &supervisor, "host1", "svc", "AA", "AA")
            .unwrap();

    assert!(outcome.installed_hash.is_none());
}

#[test]
fn test_checksum_mismatch_fails_without_installing() {
    let temp = tempfile::tempdir().unwrap();
    let body: &'static [u8] = b"unexpected-contents";
    let base_url = spawn_download_server(body);

    let config = test_config(temp.path(), &base_url);
    seed_manifest(&config, "svc", "");

    let control_plane = ControlPlaneClient::new(&config);
    let supervisor = FixedSupervisor { restart_ok: true, status: ServiceStatus::Running };

    let outcome = bin_proxy::upgrade_binary(
        &config,
        &control_plane,
        &supervisor,
        "host1",
        "svc",
        "",
        "0000000000000000000000000000000000000000000000000000000000000000",
    )
    .unwrap();

    assert!(outcome.installed_hash.is_none());
    assert!(!config.bin_dir.join("svc").exists());
}

#[test]
fn test_restart_failure_triggers_rollback_to_archived_version() {
    let temp = tempfile::tempdir().unwrap();
    let new_body: &'static [u8] = b"broken-new-version";
    let target_hash = sha256_hex(new_body);
    let base_url = spawn_download_server(new_body);

    let config = test_config(temp.path(), &base_url);
    std::fs::create_dir_all(&config.bin_dir).unwrap();

    let old_body = b"known-good-version";
    let current_hash = sha256_hex(old_body);
    std::fs::write(config.bin_dir.join("svc"), old_body).unwrap();

    let archive_dir = config.bin_dir.join(".archive").join("svc");
    std::fs::create_dir_all(&archive_dir).unwrap();
    std::fs::write(archive_dir.join(&current_hash), old_body).unwrap();

    seed_manifest(&config, "svc", &current_hash);

    let control_plane = ControlPlaneClient::new(&config);
    let supervisor = FixedSupervisor { restart_ok: false, status: ServiceStatus::Other };

    let outcome = bin_proxy::upgrade_binary(
        &config,
        &control_plane,
        &supervisor,
        "host1",
        "svc",
        &current_hash,
        &target_hash,
    )
    .unwrap();

    assert_eq!(outcome.installed_hash, Some(current_hash));
    assert_eq!(std::fs::read(config.bin_dir.join("svc")).unwrap(), old_body);
}

#[test]
fn test_lock_contention_fails_fast_without_touching_network() {
    let temp = tempfile::tempdir().unwrap();
    // No server: a request blocked on the lock must never attempt a download.
    let config = test_config(temp.path(), "http://127.0.0.1:1");
    seed_manifest(&config, "svc", "");

    let lock_dir = &config.lock_dir;
    std::fs::create_dir_all(lock_dir).unwrap();
    std::fs::write(lock_dir.join("svc-BB.lock"), format!("{}", now_epoch())).unwrap();

    let control_plane = ControlPlaneClient::new(&config);
    let supervisor = FixedSupervisor { restart_ok: true, status: ServiceStatus::Running };

    let outcome =
        bin_proxy::upgrade_binary(&config, &control_plane, &supervisor, "host1", "svc", "", "BB")
            .unwrap();

    assert!(outcome.installed_hash.is_none());
}

#[test]
fn test_stale_lock_is_reclaimed_and_install_proceeds() {
    let temp = tempfile::tempdir().unwrap();
    let body: &'static [u8] = b"binary-contents-v2";
    let target_hash = sha256_hex(body);
    let base_url = spawn_download_server(body);

    let mut config = test_config(temp.path(), &base_url);
    config.lock_timeout = Duration::from_secs(0);
    seed_manifest(&config, "svc", "");

    std::fs::create_dir_all(&config.lock_dir).unwrap();
    std::fs::write(config.lock_dir.join(format!("svc-{target_hash}.lock")), "0").unwrap();

    let control_plane = ControlPlaneClient::new(&config);
    let supervisor = FixedSupervisor { restart_ok: true, status: ServiceStatus::Running };

    let outcome =
        bin_proxy::upgrade_binary(&config, &control_plane, &supervisor, "host1", "svc", "", &target_hash)
            .unwrap();

    assert_eq!(outcome.installed_hash, Some(target_hash));
}

#[test]
fn test_lock_for_different_target_hash_is_superseded_not_blocking() {
    let temp = tempfile::tempdir().unwrap();
    let body: &'static [u8] = b"binary-contents-v3";
    let target_hash = sha256_hex(body);
    let base_url = spawn_download_server(body);

    let config = test_config(temp.path(), &base_url);
    seed_manifest(&config, "svc", "");

    // A live lock for a since-superseded target hash must not block a
    // worker now pursuing a different one, and must be removed rather than
    // left behind.
    std::fs::create_dir_all(&config.lock_dir).unwrap();
    let old_lock = config.lock_dir.join("svc-OLDTARGET.lock");
    std::fs::write(&old_lock, format!("{}", now_epoch())).unwrap();

    let control_plane = ControlPlaneClient::new(&config);
    let supervisor = FixedSupervisor { restart_ok: true, status: ServiceStatus::Running };

    let outcome =
        bin_proxy::upgrade_binary(&config, &control_plane, &supervisor, "host1", "svc", "", &target_hash)
            .unwrap();

    assert_eq!(outcome.installed_hash, Some(target_hash));
    assert!(!old_lock.exists());
}

fn now_epoch() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
