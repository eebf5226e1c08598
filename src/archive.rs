//! Archive — a content-addressed store of every binary this agent has ever
//! installed, so a rollback can restore a previous version without going
//! back to the control plane for a redownload.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::replace::make_executable;

/// Path at which `binary_name`'s copy for `hash` is (or would be) archived.
#[must_use]
pub fn archived_path(bin_dir: &Path, binary_name: &str, hash: &str) -> PathBuf {
    bin_dir.join(".archive").join(binary_name).join(hash)
}

/// Copies `source` into the archive for `binary_name`/`hash`, unless a copy
/// is already there. Idempotent: archiving the same content twice is a
/// no-op, not an error.
pub fn archive_if_absent(bin_dir: &Path, binary_name: &str, hash: &str, source: &Path) -> Result<()> {
    let dest = archived_path(bin_dir, binary_name, hash);
    if dest.exists() {
        return Ok(());
    }

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Unable to create archive directory: {}", parent.display()))?;
    }

    fs::copy(source, &dest)
        .with_context(|| format!("Unable to archive {} to {}", source.display(), dest.display()))?;
    make_executable(&dest)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_if_absent_copies_file() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("svc");
        fs::write(&source, b"contents").unwrap();

        archive_if_absent(temp.path(), "svc", "deadbeef", &source).unwrap();

        let dest = archived_path(temp.path(), "svc", "deadbeef");
        assert_eq!(fs::read(&dest).unwrap(), b"contents");
    }

    #[test]
    fn test_archive_if_absent_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("svc");
        fs::write(&source, b"contents").unwrap();

        archive_if_absent(temp.path(), "svc", "deadbeef", &source).unwrap();
        fs::write(&source, b"different-but-should-not-be-recopied").unwrap();
        archive_if_absent(temp.path(), "svc", "deadbeef", &source).unwrap();

        let dest = archived_path(temp.path(), "svc", "deadbeef");
        assert_eq!(fs::read(&dest).unwrap(), b"contents");
    }

    #[test]
    fn test_archived_path_is_content_addressed() {
        let bin_dir = Path::new("/usr/local/bin");
        let path = archived_path(bin_dir, "svc", "abc123");
        assert_eq!(path, PathBuf::from("/usr/local/bin/.archive/svc/abc123"));
    }

    #[cfg(unix)]
    #[test]
    fn test_archive_if_absent_sets_executable_bit() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("svc");
        fs::write(&source, b"contents").unwrap();

        archive_if_absent(temp.path(), "svc", "deadbeef", &source).unwrap();

        let dest = archived_path(temp.path(), "svc", "deadbeef");
        let mode = fs::metadata(&dest).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
    }
}
