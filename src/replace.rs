//! Atomic binary replacement and the SHA-256 helpers used to decide whether
//! a replacement is needed in the first place.

use std::fs;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::common::PROJECT_NAME;

#[cfg(not(windows))]
pub const EXECUTABLE_EXT: &str = "";
#[cfg(windows)]
pub const EXECUTABLE_EXT: &str = ".exe";

/// SHA-256 of a file's contents, as a lowercase hex string. Returns an empty
/// string if the file does not exist, matching the installed-hash convention
/// used throughout the manifest and control-plane reports: "no file" and "no
/// hash" are the same observation.
pub fn sha256(path: &Path) -> Result<String> {
    let mut file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(e).with_context(|| format!("Unable to open {}", path.display())),
    };

    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = file
            .read(&mut buffer)
            .with_context(|| format!("Unable to read {}", path.display()))?;
        if bytes_read == 0 {
            break;
        }
        if let Some(chunk) = buffer.get(..bytes_read) {
            hasher.update(chunk);
        }
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(unix)]
pub fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("Unable to make {} executable", path.display()))
}

#[cfg(not(unix))]
pub fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(windows)]
fn move_file_replace_windows(src: &Path, dst: &Path) -> Result<()> {
    use std::os::windows::ffi::OsStrExt;

    use anyhow::bail;
    use windows_sys::Win32::Storage::FileSystem::{
        MOVEFILE_REPLACE_EXISTING, MOVEFILE_WRITE_THROUGH, MoveFileExW,
    };

    let src_wide: Vec<u16> = src.as_os_str().encode_wide().chain(Some(0)).collect();
    let dst_wide: Vec<u16> = dst.as_os_str().encode_wide().chain(Some(0)).collect();

    // SAFETY: both pointers are valid, null-terminated UTF-16 buffers that
    // outlive the call.
    let result = unsafe {
        MoveFileExW(
            src_wide.as_ptr(),
            dst_wide.as_ptr(),
            MOVEFILE_REPLACE_EXISTING | MOVEFILE_WRITE_THROUGH,
        )
    };

    if result == 0 {
        bail!("MoveFileExW failed: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

/// Replaces `dst` with the contents of `src` atomically: copy to a temp file
/// in the same directory, make it executable, then rename over `dst`. `dst`
/// is never observably missing — on Unix the rename is atomic, and on
/// Windows `MoveFileExW` provides the same guarantee.
pub fn atomic_replace_binary(src: &Path, dst: &Path) -> Result<()> {
    let dst_dir = dst.parent().context("Unable to get destination directory")?;

    let random_suffix: u32 = rand::Rng::random(&mut rand::rng());
    let temp_name = format!(".{PROJECT_NAME}_new_{random_suffix:08x}{EXECUTABLE_EXT}");
    let temp_path = dst_dir.join(&temp_name);

    let prepare = (|| -> Result<()> {
        fs::copy(src, &temp_path)
            .with_context(|| format!("Unable to copy {} to {}", src.display(), temp_path.display()))?;
        make_executable(&temp_path)?;
        if let Ok(file) = fs::File::open(&temp_path) {
            let _ = file.sync_all();
        }
        Ok(())
    })();

    if let Err(e) = prepare {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    #[cfg(unix)]
    let rename_result = fs::rename(&temp_path, dst)
        .with_context(|| format!("Unable to rename {} to {}", temp_path.display(), dst.display()));
    #[cfg(windows)]
    let rename_result = move_file_replace_windows(&temp_path, dst);

    if let Err(e) = rename_result {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    #[cfg(unix)]
    if let Ok(dir) = fs::File::open(dst_dir) {
        let _ = dir.sync_all();
    }

    Ok(())
}
