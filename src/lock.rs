//! Lock Manager — cross-process mutual exclusion for a single
//! `(binary_name, target_hash)` upgrade attempt, realized as a lock file
//! whose mere existence (and exclusive creation) is the lock.
//!
//! This deliberately does not reuse an OS-level `flock`: the lock must
//! survive being inspected and cleaned up by a completely separate process
//! invocation (a later cron tick, or a human running `rollback`), and the
//! staleness rule is wall-clock based rather than liveness based.
//!
//! The lock key is the pair, not the binary name alone: a lock file for
//! `(binary, old_hash)` left behind by a worker pursuing a now-superseded
//! target is removed outright by whoever next acquires `(binary, new_hash)`,
//! while a live lock for the *same* target backs the new attempt off. This
//! lets a freshly-desired version jump ahead of a stuck old-target attempt
//! without waiting out its full staleness window.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use log::info;

/// Builds the lock file path for a given `(binary_name, target_hash)` pair.
#[must_use]
pub fn lock_path(lock_dir: &Path, binary_name: &str, target_hash: &str) -> PathBuf {
    lock_dir.join(format!("{binary_name}-{target_hash}.lock"))
}

/// Removes every lock file for `binary_name` whose target hash differs from
/// `target_hash`: a prior worker's attempt at a since-superseded version.
/// Best-effort; a removal failure is logged, not propagated, since a
/// leftover superseded lock only delays cleanup, it cannot block this
/// acquisition (which only ever contends on the exact-match path).
fn remove_superseded_locks(lock_dir: &Path, binary_name: &str, target_hash: &str) {
    let Ok(entries) = fs::read_dir(lock_dir) else { return };
    let prefix = format!("{binary_name}-");
    let current_name = format!("{binary_name}-{target_hash}.lock");

    for entry in entries.filter_map(Result::ok) {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name == current_name {
            continue;
        }
        if !name.starts_with(&prefix) || !name.ends_with(".lock") {
            continue;
        }
        info!("superseding stale lock {name} for {binary_name} (new target {target_hash})");
        if let Err(e) = fs::remove_file(entry.path()) {
            info!("could not remove superseded lock {name}: {e}");
        }
    }
}

/// Attempts to acquire the lock for `(binary_name, target_hash)`. First
/// supersedes any lock held for this binary under a different target hash,
/// then checks whether a lock already exists for this exact target: a live
/// one causes this acquisition to back off (`Ok(false)`), a stale one is
/// reclaimed. Returns `Ok(true)` iff this call created the lock file.
pub fn acquire(lock_dir: &Path, binary_name: &str, target_hash: &str, timeout: Duration) -> Result<bool> {
    crate::config::ensure_dir(lock_dir)?;

    remove_superseded_locks(lock_dir, binary_name, target_hash);

    let path = lock_path(lock_dir, binary_name, target_hash);

    if let Some(age) = lock_age(&path)? {
        if age < timeout {
            return Ok(false);
        }
        fs::remove_file(&path)
            .with_context(|| format!("Unable to remove stale lock: {}", path.display()))?;
    }

    match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
        Ok(mut fd) => {
            write!(fd, "{}", now_epoch())
                .with_context(|| format!("Unable to write lock timestamp: {}", path.display()))?;
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Unable to create lock: {}", path.display())),
    }
}

/// Releases the lock for `(binary_name, target_hash)`. Missing locks are not
/// an error: a caller may release defensively after an operation that may or
/// may not have actually acquired one.
pub fn release(lock_dir: &Path, binary_name: &str, target_hash: &str) -> Result<()> {
    let path = lock_path(lock_dir, binary_name, target_hash);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Unable to remove lock: {}", path.display())),
    }
}

/// Seconds since the lock file was created, used to compute the
/// `processingTime` field reported alongside progress and completion events.
/// Returns `None` if no lock file exists for `(binary_name, target_hash)`.
pub fn held_duration(lock_dir: &Path, binary_name: &str, target_hash: &str) -> Result<Option<Duration>> {
    let path = lock_path(lock_dir, binary_name, target_hash);
    lock_age(&path)
}

fn lock_age(path: &Path) -> Result<Option<Duration>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Unable to read lock: {}", path.display())),
    };

    let created_epoch: u64 = raw.trim().parse().unwrap_or(0);
    let now = now_epoch();
    Ok(Some(Duration::from_secs(now.saturating_sub(created_epoch))))
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
