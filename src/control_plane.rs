//! Control-Plane Client — every HTTP call this agent makes outward, to the
//! binary manager API. Best-effort calls (keepalive, progress, completion)
//! swallow their own errors and log instead of propagating, since a reporting
//! failure should never abort an upgrade that otherwise succeeded.

use anyhow::{Context, Result};
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::json;

use crate::common::user_agent;
use crate::config::{AgentConfig, CONTROL_PLANE_TIMEOUT_SECS};
use crate::identity::NodeIdentity;

pub struct ControlPlaneClient<'a> {
    config: &'a AgentConfig,
}

#[derive(Deserialize)]
struct LatestHashResponse {
    #[serde(default)]
    sha256sum: Option<String>,
    #[serde(default)]
    sha256: Option<String>,
}

impl<'a> ControlPlaneClient<'a> {
    #[must_use]
    pub fn new(config: &'a AgentConfig) -> Self {
        Self { config }
    }

    /// Confirms this node is registered with the control plane, registering
    /// it (by posting its identity) if the keepalive probe comes back
    /// anything other than 200. Errors are logged, never propagated: a dead
    /// control plane should not stop the agent from proceeding with
    /// already-known work.
    pub fn keepalive(&self, node_id: &str, identity: &NodeIdentity) {
        let url = format!(
            "{}/keepalive?node_id={}",
            self.config.bin_manager_api,
            urlencoding::encode(node_id)
        );

        let registered = minreq::get(&url)
            .with_header("User-Agent", user_agent())
            .with_timeout(CONTROL_PLANE_TIMEOUT_SECS)
            .send()
            .map(|response| response.status_code == 200)
            .unwrap_or(false);

        if registered {
            info!("keepalive check successful");
            return;
        }

        info!("node not registered, posting node info");
        let mut body = serde_json::to_value(identity).unwrap_or_else(|_| json!({}));
        if let Some(map) = body.as_object_mut() {
            map.insert("node_id".to_string(), json!(node_id));
        }

        let post_url = format!("{}/keepalive", self.config.bin_manager_api);
        if let Err(e) = minreq::post(&post_url)
            .with_header("User-Agent", user_agent())
            .with_header("Content-Type", "application/json")
            .with_timeout(CONTROL_PLANE_TIMEOUT_SECS)
            .with_json(&body)
            .and_then(minreq::Request::send)
        {
            error!("failed to post keepalive: {e}");
        }
    }

    /// Queries the latest hash the control plane wants installed for
    /// `binary_name`. Accepts either a `sha256sum` or `sha256` field in the
    /// response, per the manager API's historical inconsistency.
    pub fn query_latest_hash(&self, binary_name: &str) -> Result<String> {
        let url = format!("{}/bins/{binary_name}", self.config.bin_manager_api);

        let response = minreq::get(&url)
            .with_header("User-Agent", user_agent())
            .with_timeout(CONTROL_PLANE_TIMEOUT_SECS)
            .send()
            .with_context(|| format!("Failed to query latest hash for {binary_name}"))?;

        if response.status_code != 200 {
            anyhow::bail!("Failed to query latest hash for {binary_name}: HTTP {}", response.status_code);
        }

        let parsed: LatestHashResponse = response
            .json()
            .with_context(|| format!("Malformed response querying {binary_name}"))?;

        parsed
            .sha256sum
            .or(parsed.sha256)
            .with_context(|| format!("Response for {binary_name} had neither sha256sum nor sha256"))
    }

    /// Reports an in-progress or terminal status for one upgrade attempt.
    /// Fire-and-forget: errors are logged and swallowed.
    pub fn report_progress(&self, node_name: &str, binary_name: &str, target_hash: &str, processing_time_secs: u64, status: &str) {
        let url = format!("{}/bins/{binary_name}/progress", self.config.bin_manager_api);
        let payload = json!({
            "nodeName": node_name,
            "binName": binary_name,
            "targetHash": target_hash,
            "processingTime": processing_time_secs,
            "status": status,
        });

        let result = minreq::post(&url)
            .with_header("User-Agent", user_agent())
            .with_header("Content-Type", "application/json")
            .with_timeout(CONTROL_PLANE_TIMEOUT_SECS)
            .with_json(&payload)
            .and_then(minreq::Request::send);

        match result {
            Ok(_) => info!("reported {status} for {binary_name} (took {processing_time_secs}s)"),
            Err(e) => warn!("failed to report {status} for {binary_name}: {e}"),
        }
    }

    /// Posts the hash actually installed for `binary_name` after a
    /// successful upgrade. Returns whether the control plane accepted it;
    /// callers treat a failure here as non-fatal to the upgrade itself.
    pub fn report_installed(&self, node_id: &str, binary_name: &str, installed_hash: &str) -> bool {
        let url = format!("{}/bins/{binary_name}", self.config.bin_manager_api);
        let payload = json!({
            "node_id": node_id,
            "sha256sum": installed_hash,
        });

        let result = minreq::post(&url)
            .with_header("User-Agent", user_agent())
            .with_header("Content-Type", "application/json")
            .with_timeout(CONTROL_PLANE_TIMEOUT_SECS)
            .with_json(&payload)
            .and_then(minreq::Request::send);

        match result {
            Ok(response) if (200..300).contains(&response.status_code) => {
                info!("posted install status for {binary_name}");
                true
            }
            Ok(response) => {
                error!("failed to post install status for {binary_name}: HTTP {}", response.status_code);
                false
            }
            Err(e) => {
                error!("failed to post install status for {binary_name}: {e}");
                false
            }
        }
    }
}
