//! Restart Supervisor Adapter — the seam between the orchestrator and
//! whatever process supervisor actually restarts a binary on this node.
//! Abstracted behind a trait so tests exercise the state machine without a
//! real `supervisorctl` on disk.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};

use crate::config::{RESTART_SETTLE, RESTART_TIMEOUT_SECS, STATUS_TIMEOUT_SECS};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceStatus {
    Running,
    Other,
}

pub trait RestartSupervisor {
    /// Whether this supervisor is usable on the current host at all.
    fn available(&self) -> bool;

    /// Issues a restart for `binary_name`. `Ok(true)` means the supervisor
    /// reported the restart command itself succeeded (exit code 0); it says
    /// nothing about whether the service is actually up afterward — callers
    /// must follow up with [`RestartSupervisor::status`].
    fn restart(&self, binary_name: &str) -> Result<bool>;

    /// Probes whether `binary_name` is running, after the caller has waited
    /// out [`RESTART_SETTLE`].
    fn status(&self, binary_name: &str) -> Result<ServiceStatus>;
}

/// Shells out to `supervisorctl`, matching the original agent's restart
/// mechanism. Not constructed if `supervisorctl` isn't on `PATH`.
pub struct SupervisorCtl;

impl RestartSupervisor for SupervisorCtl {
    fn available(&self) -> bool {
        which_supervisorctl().is_some()
    }

    fn restart(&self, binary_name: &str) -> Result<bool> {
        let binary = which_supervisorctl().context("supervisorctl not found on PATH")?;

        info!("restarting service {binary_name} via supervisorctl");
        let output = run_with_timeout(&binary, &["restart", binary_name], RESTART_TIMEOUT_SECS)?;

        if !output.stdout.trim().is_empty() {
            info!("{}", output.stdout.trim());
        }
        if !output.stderr.trim().is_empty() {
            warn!("{}", output.stderr.trim());
        }

        Ok(output.status.success())
    }

    fn status(&self, binary_name: &str) -> Result<ServiceStatus> {
        let binary = which_supervisorctl().context("supervisorctl not found on PATH")?;

        std::thread::sleep(RESTART_SETTLE);

        let output = run_with_timeout(&binary, &["status", binary_name], STATUS_TIMEOUT_SECS)?;
        if output.stdout.contains("RUNNING") {
            Ok(ServiceStatus::Running)
        } else {
            Ok(ServiceStatus::Other)
        }
    }
}

struct CommandOutput {
    status: std::process::ExitStatus,
    stdout: String,
    stderr: String,
}

/// Runs `binary args...`, killing it and reporting a timeout error if it
/// hasn't exited within `timeout_secs` — `Command` has no built-in timeout,
/// so this polls a background wait with a deadline.
fn run_with_timeout(binary: &str, args: &[&str], timeout_secs: u64) -> Result<CommandOutput> {
    let mut child = Command::new(binary)
        .args(args)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .with_context(|| format!("Unable to spawn {binary}"))?;

    let deadline = std::time::Instant::now() + Duration::from_secs(timeout_secs);
    loop {
        if let Some(status) = child.try_wait().with_context(|| format!("Unable to wait on {binary}"))? {
            let output = child
                .wait_with_output()
                .with_context(|| format!("Unable to collect output from {binary}"))?;
            return Ok(CommandOutput {
                status,
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        if std::time::Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            anyhow::bail!("Timeout waiting for {binary} {}", args.join(" "));
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}

fn which_supervisorctl() -> Option<String> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var).find_map(|dir| {
        let candidate = dir.join("supervisorctl");
        candidate.is_file().then(|| candidate.to_string_lossy().into_owned())
    })
}

/// In-memory fake for tests: configurable restart/status outcomes per
/// binary name, no subprocess involved.
#[cfg(test)]
pub struct FakeSupervisor {
    pub restart_ok: bool,
    pub status: ServiceStatus,
}

#[cfg(test)]
impl RestartSupervisor for FakeSupervisor {
    fn available(&self) -> bool {
        true
    }

    fn restart(&self, _binary_name: &str) -> Result<bool> {
        Ok(self.restart_ok)
    }

    fn status(&self, _binary_name: &str) -> Result<ServiceStatus> {
        Ok(self.status)
    }
}
