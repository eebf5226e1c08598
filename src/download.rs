//! Download Engine — fetches a binary from the control plane's download
//! endpoint into a staging path, after checking free disk space and clearing
//! out any stragglers left behind by a prior attempt that never cleaned up.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use log::{info, warn};
use sysinfo::{Disks, ProcessesToUpdate, System};

use crate::common::user_agent;
use crate::config::MIN_FREE_KB;

/// Downloads `url` into `staging_path`, truncating any existing file there.
/// Sets the executable bit on success. Does not verify checksum; callers
/// verify separately so a checksum mismatch and a transport failure are
/// distinguishable.
pub fn fetch(url: &str, staging_path: &Path, timeout_secs: u64) -> Result<()> {
    let mut fd = fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .open(staging_path)
        .with_context(|| format!("Unable to open {} for writing", staging_path.display()))?;

    info!("downloading {url}");

    let response = minreq::get(url)
        .with_header("User-Agent", user_agent())
        .with_timeout(timeout_secs)
        .send()
        .with_context(|| format!("{url} failed"))?;

    if !(200..300).contains(&response.status_code) {
        bail!("{url} returned status {}", response.status_code);
    }

    std::io::Write::write_all(&mut fd, response.as_bytes())
        .with_context(|| format!("Unable to write {}", staging_path.display()))?;

    crate::replace::make_executable(staging_path)?;

    Ok(())
}

/// Checks that at least [`MIN_FREE_KB`] kibibytes are free on the filesystem
/// backing `dir`. `dir` must already exist. Picks the disk mounted at the
/// longest matching prefix of `dir`, the same "most specific mount wins"
/// rule `df` uses.
pub fn check_free_space(dir: &Path) -> Result<()> {
    let canonical = dir
        .canonicalize()
        .with_context(|| format!("Unable to resolve {}", dir.display()))?;

    let disks = Disks::new_with_refreshed_list();
    let disk = disks
        .list()
        .iter()
        .filter(|disk| canonical.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .with_context(|| format!("Unable to determine filesystem for {}", dir.display()))?;

    let free_kb = disk.available_space() / 1024;
    if free_kb < MIN_FREE_KB {
        bail!(
            "Insufficient free space in {}: {free_kb} KiB available, {MIN_FREE_KB} KiB required",
            dir.display()
        );
    }
    Ok(())
}

/// Kills leftover download processes from a previous invocation that died
/// mid-transfer on this same `binary_name` without cleaning up. The original
/// implementation shelled out to `curl` and tracked it by PID; this agent
/// downloads in-process via `minreq`, so the only stragglers that can exist
/// are other `bin-proxy` processes themselves — scanned via the process
/// table rather than a PID file, since no subprocess is spawned to leave one
/// behind. Only a process whose command line names both this agent and this
/// `binary_name` is a match; a concurrent invocation updating a different
/// binary is left alone.
pub fn kill_stragglers(binary_name: &str, own_pid: u32) {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    for (pid, process) in system.processes() {
        if pid.as_u32() == own_pid {
            continue;
        }
        let Some(name) = process.name().to_str() else { continue };
        if name != crate::common::PROJECT_NAME {
            continue;
        }
        let names_this_binary = process
            .cmd()
            .iter()
            .any(|arg| arg.to_str().is_some_and(|arg| arg == binary_name));
        if !names_this_binary {
            continue;
        }
        warn!("killing straggler process {pid} for {binary_name}");
        process.kill();
    }
}
