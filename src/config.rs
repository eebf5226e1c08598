//! Process-start configuration for the agent.
//!
//! Every environment variable named in the external-interfaces section of the
//! specification is read exactly once, here, and folded into an immutable
//! [`AgentConfig`]. No other module calls `std::env::var` — components take a
//! `&AgentConfig` instead of reaching into the environment themselves, so unit
//! tests can exercise them against an arbitrary configuration without mutating
//! process-global state.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bon::Builder;

const ENV_BIN_MANIFESTS: &str = "BIN_MANIFESTS";
const ENV_BIN_MANAGER_API: &str = "BIN_MANAGER_API";
const ENV_BIN_DIR: &str = "BIN_DIR";
const ENV_LOG_FILE: &str = "LOG_FILE";
const ENV_LOCK_DIR: &str = "LOCK_DIR";
const ENV_LOCK_TIMEOUT: &str = "LOCK_TIMEOUT";
const ENV_DOWNLOAD_BASE_URL: &str = "DOWNLOAD_BASE_URL";
const ENV_DOWNLOAD_TIMEOUT: &str = "DOWNLOAD_TIMEOUT";

const DEFAULT_BIN_MANIFESTS: &str = "./bin-manifests.json";
const DEFAULT_BIN_MANAGER_API: &str = "http://localhost:8080/api/v1";
const DEFAULT_BIN_DIR: &str = "/usr/local/bin";
const DEFAULT_LOG_FILE: &str = "/var/log/bin-proxy.log";
const DEFAULT_LOCK_DIR: &str = "/var/run/bin-proxy";
const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 600;
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;

/// Minimum free space required in the staging directory before a download starts, in KiB.
pub const MIN_FREE_KB: u64 = 102_400;

/// Default timeout for control-plane JSON calls (keepalive, query-hash, report-*).
pub const CONTROL_PLANE_TIMEOUT_SECS: u64 = 10;
/// Timeout for a restart request issued to the supervisor.
pub const RESTART_TIMEOUT_SECS: u64 = 30;
/// Timeout for a status probe issued to the supervisor.
pub const STATUS_TIMEOUT_SECS: u64 = 10;
/// Pause between issuing a restart and probing status.
pub const RESTART_SETTLE: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, Builder)]
pub struct AgentConfig {
    pub bin_manifests: PathBuf,
    pub bin_manager_api: String,
    pub bin_dir: PathBuf,
    pub log_file: Option<PathBuf>,
    pub lock_dir: PathBuf,
    pub lock_timeout: Duration,
    pub download_base_url: String,
    pub download_timeout: Duration,
}

impl AgentConfig {
    /// Loads configuration from the environment, applying defaults for every
    /// variable left unset and validating directory overrides.
    pub fn from_env() -> Result<Self> {
        let bin_manager_api = std::env::var(ENV_BIN_MANAGER_API)
            .unwrap_or_else(|_| DEFAULT_BIN_MANAGER_API.to_string());

        let bin_manifests = std::env::var(ENV_BIN_MANIFESTS)
            .map_or_else(|_| PathBuf::from(DEFAULT_BIN_MANIFESTS), PathBuf::from);

        let bin_dir = resolve_dir(ENV_BIN_DIR, DEFAULT_BIN_DIR)?;
        let lock_dir = resolve_dir(ENV_LOCK_DIR, DEFAULT_LOCK_DIR)?;

        let log_file = match std::env::var(ENV_LOG_FILE) {
            Ok(path) => Some(PathBuf::from(path)),
            Err(_) => Some(PathBuf::from(DEFAULT_LOG_FILE)),
        };

        let lock_timeout = Duration::from_secs(read_u64(ENV_LOCK_TIMEOUT, DEFAULT_LOCK_TIMEOUT_SECS)?);
        let download_timeout =
            Duration::from_secs(read_u64(ENV_DOWNLOAD_TIMEOUT, DEFAULT_DOWNLOAD_TIMEOUT_SECS)?);

        let download_base_url = std::env::var(ENV_DOWNLOAD_BASE_URL)
            .unwrap_or_else(|_| format!("{bin_manager_api}/download"));

        let config = Self {
            bin_manifests,
            bin_manager_api,
            bin_dir,
            log_file,
            lock_dir,
            lock_timeout,
            download_base_url,
            download_timeout,
        };

        config.validate_urls()?;
        Ok(config)
    }

    fn validate_urls(&self) -> Result<()> {
        url::Url::parse(&self.bin_manager_api)
            .with_context(|| format!("BIN_MANAGER_API is not a valid URL: {}", self.bin_manager_api))?;
        url::Url::parse(&self.download_base_url).with_context(|| {
            format!("DOWNLOAD_BASE_URL is not a valid URL: {}", self.download_base_url)
        })?;
        Ok(())
    }
}

fn read_u64(env_name: &str, default: u64) -> Result<u64> {
    match std::env::var(env_name) {
        Ok(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("{env_name} must be a non-negative integer, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

/// Resolves a directory from an environment variable override, validating the
/// override for absolute-path and no-traversal, or falls back to a built-in
/// default path. Neither branch creates the directory; callers create it
/// lazily at first use.
fn resolve_dir(env_name: &str, default: &str) -> Result<PathBuf> {
    match std::env::var(env_name) {
        Ok(value) => validate_dir_override(env_name, &value),
        Err(_) => Ok(PathBuf::from(default)),
    }
}

/// Validates an override path from an environment variable: must be absolute
/// and must contain no parent-directory (`..`) components.
fn validate_dir_override(env_name: &str, value: &str) -> Result<PathBuf> {
    let path = PathBuf::from(value);

    if !path.is_absolute() {
        bail!("{env_name} must be an absolute path: {value}");
    }

    for component in path.components() {
        if let Component::ParentDir = component {
            bail!("{env_name} contains parent directory references: {value}");
        }
    }

    Ok(path)
}

/// Ensures a directory exists, creating it (and parents) if necessary.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Unable to create directory: {}", dir.display()))?;
    }
    Ok(())
}
