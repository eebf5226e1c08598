//! Manifest Store — the single JSON document recording which binaries this
//! node tracks and the content hash last confirmed installed for each.

use std::fs;
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::identity::NodeIdentity;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BinaryEntry {
    #[serde(rename = "binaryName")]
    pub binary_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, rename = "previousVersion")]
    pub previous_version: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "nodeInfo")]
    pub node_info: NodeIdentity,
    pub binaries: Vec<BinaryEntry>,
}

impl Manifest {
    /// Loads the manifest from `path`. A missing or unparseable manifest is a
    /// fatal startup condition per the spec; the two cases are distinguished
    /// in the error message so operators can tell a deployment gap from a
    /// corrupt file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("Manifest file not found: {}", path.display());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("Unable to read manifest: {}", path.display()))?;

        serde_json::from_str(&raw)
            .with_context(|| format!("Manifest at {} is not valid JSON", path.display()))
    }

    /// Persists the manifest durably: write to a sibling temp file, then
    /// rename over the destination (atomic on the same filesystem), matching
    /// the same temp-then-rename idiom the orchestrator uses for binaries.
    pub fn save(&self, path: &Path) -> Result<()> {
        let body = serde_json::to_string_pretty(self).context("Unable to serialize manifest")?;

        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let random_suffix: u32 = rand::Rng::random(&mut rand::rng());
        let temp_path = dir.join(format!(".manifest.tmp.{random_suffix:08x}"));

        let write_result = (|| -> Result<()> {
            #[cfg(unix)]
            let mut fd = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&temp_path)
                .with_context(|| format!("Unable to create {}", temp_path.display()))?;

            #[cfg(not(unix))]
            let mut fd = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&temp_path)
                .with_context(|| format!("Unable to create {}", temp_path.display()))?;

            fd.write_all(body.as_bytes())
                .with_context(|| format!("Unable to write {}", temp_path.display()))?;
            fd.sync_all().ok();
            Ok(())
        })();

        if let Err(e) = write_result {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }

        if let Err(e) = fs::rename(&temp_path, path).with_context(|| {
            format!("Unable to rename {} to {}", temp_path.display(), path.display())
        }) {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }

        Ok(())
    }

    /// Finds the entry for `binary_name`, if tracked.
    #[must_use]
    pub fn find(&self, binary_name: &str) -> Option<&BinaryEntry> {
        self.binaries.iter().find(|b| b.binary_name == binary_name)
    }

    /// Updates the installed hash for one binary: `previousVersion` takes the
    /// prior `version`, and `version` becomes `new_hash`. No-op if the binary
    /// is not tracked (it should always be, since the driver iterates tracked
    /// entries only).
    pub fn update_binary(&mut self, binary_name: &str, new_hash: &str) {
        if let Some(entry) = self.binaries.iter_mut().find(|b| b.binary_name == binary_name) {
            entry.previous_version = std::mem::take(&mut entry.version);
            entry.version = new_hash.to_string();
        }
    }

    /// Replaces the `nodeInfo` block.
    pub fn update_node_info(&mut self, node_info: NodeIdentity) {
        self.node_info = node_info;
    }
}
