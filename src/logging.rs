//! Structured logging, built the way the rest of this codebase's ancestor
//! configures `env_logger`: a small builder over a filter level and an
//! optional file sink, rather than a bespoke formatter.

use std::fs;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use env_logger::Target;
use log::LevelFilter;

#[derive(Default)]
pub struct Logging {
    file_path: Option<PathBuf>,
    debug_mode: bool,
}

impl Logging {
    #[must_use]
    pub fn new() -> Self {
        Self {
            file_path: None,
            debug_mode: false,
        }
    }

    #[must_use]
    pub fn with_file<P>(mut self, file_path: P) -> Self
    where
        P: Into<PathBuf>,
    {
        self.file_path = Some(file_path.into());
        self
    }

    #[must_use]
    pub fn with_debug_mode(mut self, enable: bool) -> Self {
        self.debug_mode = enable;
        self
    }

    pub fn start(&self) -> Result<()> {
        let mut builder = env_logger::builder();

        builder.filter_level(if self.debug_mode {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        });

        if let Some(file_path) = &self.file_path {
            let fd = open_log_file(file_path)?;
            builder.target(Target::Pipe(Box::new(fd)));
        }

        builder.init();
        Ok(())
    }
}

/// Opens the log file for appending, creating it with secure permissions
/// (0600 on Unix) the first time it is written, and creating its parent
/// directory if needed.
fn open_log_file(path: &Path) -> Result<fs::File> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Unable to create log directory: {}", parent.display()))?;
    }

    #[cfg(unix)]
    {
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("Unable to open {} for writing", path.display()))
    }

    #[cfg(not(unix))]
    {
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Unable to open {} for writing", path.display()))
    }
}
