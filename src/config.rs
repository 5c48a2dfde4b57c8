//! Configuration management for the nodelink client.
//!
//! Handles loading and saving configuration from the platform config
//! directory (`nodelink/config.toml`), and the per-tunnel settings the
//! relay subsystem consumes.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::RelayError;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub local: LocalConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default = "default_tunnels")]
    pub tunnels: Vec<TunnelConfig>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub api_key_id: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub client_id: Option<String>,
    /// Host description sent with `register`
    pub client_info: Option<serde_json::Value>,
    pub keypair_path: Option<PathBuf>,
    /// Advertised capacity (`numOfBrowsers`)
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    #[serde(default = "default_primary_url")]
    pub primary_url: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_info: None,
            keypair_path: None,
            capacity: default_capacity(),
            primary_url: default_primary_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Origin of the local HTTP service proxied by the primary channel
    #[serde(default = "default_http_base_url")]
    pub http_base_url: String,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            http_base_url: default_http_base_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_interval_secs")]
    pub liveness_interval_secs: u64,
    #[serde(default = "default_interval_secs")]
    pub monitor_interval_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_interval_secs(),
            liveness_interval_secs: default_interval_secs(),
            monitor_interval_secs: default_interval_secs(),
        }
    }
}

impl TimingConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs.max(1))
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs.max(1))
    }
}

fn default_capacity() -> u32 {
    4
}

fn default_interval_secs() -> u64 {
    5
}

fn default_primary_url() -> String {
    "wss://api.example.net:443".to_string()
}

fn default_http_base_url() -> String {
    "http://localhost:8051".to_string()
}

/// Sub-protocols a tunnel can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubProtocol {
    Http,
    Https,
    Ws,
    Wss,
}

/// Static description of one tunnel endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub name: String,
    pub remote_url: String,
    pub local_base_path: String,
    #[serde(default)]
    pub api_key_id: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub disabled_sub_protocols: BTreeSet<SubProtocol>,
}

impl TunnelConfig {
    /// HTTP relaying is off when either http or https is disabled
    pub fn http_enabled(&self) -> bool {
        !self.disabled_sub_protocols.contains(&SubProtocol::Http)
            && !self.disabled_sub_protocols.contains(&SubProtocol::Https)
    }

    /// WebSocket bridging is off only when both ws and wss are disabled
    pub fn ws_enabled(&self) -> bool {
        !(self.disabled_sub_protocols.contains(&SubProtocol::Ws)
            && self.disabled_sub_protocols.contains(&SubProtocol::Wss))
    }

    /// Fill in credentials from the shared auth section where unset
    pub fn with_auth(mut self, auth: &AuthConfig) -> Self {
        if self.api_key_id.is_none() {
            self.api_key_id = auth.api_key_id.clone();
        }
        if self.api_key.is_none() {
            self.api_key = auth.api_key.clone();
        }
        self
    }
}

/// The tunnels a node serves out of the box
fn default_tunnels() -> Vec<TunnelConfig> {
    use SubProtocol::*;

    let tunnel = |name: &str, remote: &str, local: &str, disabled: &[SubProtocol]| TunnelConfig {
        name: name.to_string(),
        remote_url: remote.to_string(),
        local_base_path: local.to_string(),
        api_key_id: None,
        api_key: None,
        disabled_sub_protocols: disabled.iter().copied().collect(),
    };

    vec![
        tunnel(
            "node-server",
            "wss://node.example.net:443",
            "/",
            &[Http, Ws, Wss],
        ),
        tunnel(
            "cdp-proxy",
            "wss://ws.example.net:443",
            "http://localhost:8051/ws/",
            &[Http, Https, Ws],
        ),
        tunnel(
            "vnc-proxy",
            "wss://vnc.example.net:443",
            "http://localhost:8051/vnc/",
            &[Http, Https, Ws],
        ),
    ]
}

/// Join a request path onto a local base.
///
/// Absolute URLs are returned unchanged; otherwise exactly one `/` separates
/// base and path.
pub fn join_local_url(base: &str, path: &str) -> String {
    if path.starts_with("http://")
        || path.starts_with("https://")
        || path.starts_with("ws://")
        || path.starts_with("wss://")
    {
        return path.to_string();
    }

    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) if !path.is_empty() => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Rewrite an http(s) URL to the matching ws(s) scheme
pub fn to_ws_url(url: &str) -> std::result::Result<url::Url, RelayError> {
    let mut parsed = url::Url::parse(url)?;
    let scheme = match parsed.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(RelayError::InvalidUrl(format!(
                "unsupported scheme '{}' in {}",
                other, url
            )))
        }
    };
    if parsed.scheme() != scheme && parsed.set_scheme(scheme).is_err() {
        return Err(RelayError::InvalidUrl(url.to_string()));
    }
    Ok(parsed)
}

impl Config {
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self {
                tunnels: default_tunnels(),
                ..Self::default()
            });
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    pub fn config_path() -> Result<PathBuf> {
        let proj_dirs =
            ProjectDirs::from("", "", "nodelink").context("Could not determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// Tunnel configs with the shared credentials applied
    pub fn resolved_tunnels(&self) -> Vec<TunnelConfig> {
        self.tunnels
            .iter()
            .cloned()
            .map(|t| t.with_auth(&self.auth))
            .collect()
    }
}
