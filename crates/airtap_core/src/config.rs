/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - AIRTAP Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "https://api.airtap.dev/";
pub const DEFAULT_WS_URL: &str = "wss://api.airtap.dev/ws";

#[derive(Clone, Debug, serde::Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub ws_url: Option<String>,
    #[serde(default)]
    pub data_dir: Option<String>,
    /// Roster cap applied to discovery links. `0` disables the cap.
    #[serde(default)]
    pub max_peers: Option<usize>,
    /// First reconnect delay after the signaling socket drops (milliseconds).
    #[serde(default)]
    pub reconnect_base_ms: Option<u64>,
    /// Upper bound for the exponential reconnect delay (milliseconds).
    #[serde(default)]
    pub reconnect_max_ms: Option<u64>,
    /// How long an outbound envelope waits for its ack before being re-sent.
    #[serde(default)]
    pub ack_timeout_ms: Option<u64>,
    /// Re-sends per unacknowledged envelope. `0` means fire-and-forget.
    #[serde(default)]
    pub ack_max_retries: Option<u32>,
    /// WebSocket keepalive ping interval (seconds).
    #[serde(default)]
    pub ping_secs: Option<u64>,
    /// HTTP client timeout for account API calls (seconds).
    #[serde(default)]
    pub http_timeout_secs: Option<u64>,
    /// Scheme accepted for `scheme://discover?code=...` links.
    #[serde(default)]
    pub link_scheme: Option<String>,
    /// Keychain service name used for the account credential.
    #[serde(default)]
    pub keyring_service: Option<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            api_base_url: Some(DEFAULT_API_BASE_URL.to_string()),
            ws_url: Some(DEFAULT_WS_URL.to_string()),
            data_dir: None,
            max_peers: Some(6),
            reconnect_base_ms: Some(250),
            reconnect_max_ms: Some(30_000),
            ack_timeout_ms: Some(3_000),
            ack_max_retries: Some(3),
            ping_secs: Some(15),
            http_timeout_secs: Some(30),
            link_scheme: Some("airtap".to_string()),
            keyring_service: Some("airtap".to_string()),
        }
    }
}

/// Signaling socket tuning, resolved from [`CoreConfig`].
#[derive(Clone, Debug)]
pub struct SignalingSettings {
    pub ws_url: String,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub ack_timeout: Duration,
    pub ack_max_retries: u32,
    pub ping_interval: Duration,
}

impl Default for SignalingSettings {
    fn default() -> Self {
        CoreConfig::default().signaling()
    }
}

fn non_empty(v: Option<&String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl CoreConfig {
    pub fn api_base_url(&self) -> String {
        let base = non_empty(self.api_base_url.as_ref()).unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
        format!("{}/", base.trim_end_matches('/'))
    }

    pub fn ws_url(&self) -> String {
        non_empty(self.ws_url.as_ref()).unwrap_or_else(|| DEFAULT_WS_URL.to_string())
    }

    pub fn max_peers(&self) -> Option<usize> {
        match self.max_peers.unwrap_or(6) {
            0 => None,
            n => Some(n),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.unwrap_or(30).clamp(5, 120))
    }

    pub fn link_scheme(&self) -> String {
        non_empty(self.link_scheme.as_ref())
            .unwrap_or_else(|| "airtap".to_string())
            .to_ascii_lowercase()
    }

    pub fn keyring_service(&self) -> String {
        non_empty(self.keyring_service.as_ref()).unwrap_or_else(|| "airtap".to_string())
    }

    pub fn signaling(&self) -> SignalingSettings {
        let base_ms = self.reconnect_base_ms.unwrap_or(250).clamp(50, 10_000);
        let max_ms = self.reconnect_max_ms.unwrap_or(30_000).clamp(base_ms, 300_000);
        SignalingSettings {
            ws_url: self.ws_url(),
            reconnect_base: Duration::from_millis(base_ms),
            reconnect_max: Duration::from_millis(max_ms),
            ack_timeout: Duration::from_millis(self.ack_timeout_ms.unwrap_or(3_000).clamp(200, 60_000)),
            ack_max_retries: self.ack_max_retries.unwrap_or(3).min(10),
            ping_interval: Duration::from_secs(self.ping_secs.unwrap_or(15).clamp(1, 300)),
        }
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = non_empty(self.data_dir.as_ref()) {
            return Ok(PathBuf::from(dir));
        }
        default_data_dir()
    }
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Ok(v) = std::env::var("AIRTAP_DATA_DIR") {
        return Ok(PathBuf::from(v));
    }
    let proj = ProjectDirs::from("dev", "airtap", "Airtap")
        .context("unable to determine platform data dir")?;
    Ok(proj.data_local_dir().to_path_buf())
}
