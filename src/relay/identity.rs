use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::config::NodeConfig;
use crate::crypto::Keypair;
use crate::error::{RelayError, Result};
use crate::protocol::ClientId;

/// Who this node claims to be when it registers
#[derive(Debug, Clone, PartialEq)]
pub struct NodeIdentity {
    pub client_id: ClientId,
    pub client_info: Value,
    pub public_key: String,
}

impl NodeIdentity {
    /// Build the identity from configuration. Registering without a client id
    /// or client info is not possible, so both are required here.
    pub fn from_config(node: &NodeConfig, keypair: &Keypair) -> Result<Self> {
        let client_id = node
            .client_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                RelayError::Config("no client id configured; run `nodelink init`".to_string())
            })?;

        let client_info = node
            .client_info
            .clone()
            .filter(|info| !info.is_null())
            .ok_or_else(|| {
                RelayError::Config("no client info configured; run `nodelink init`".to_string())
            })?;

        Ok(Self {
            client_id: ClientId::from(client_id.to_string()),
            client_info,
            public_key: keypair.public_key_base64(),
        })
    }
}

/// Fill in a missing client id and client info. Returns whether anything changed.
pub fn bootstrap_identity(node: &mut NodeConfig) -> bool {
    let mut changed = false;

    if node.client_id.as_deref().map_or(true, str::is_empty) {
        node.client_id = Some(ClientId::generate().to_string());
        changed = true;
    }

    if node.client_info.as_ref().map_or(true, Value::is_null) {
        node.client_info = Some(json!({
            "hostname": hostname(),
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "cpus": cpu_count(),
        }));
        changed = true;
    }

    changed
}

fn hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Supplies the opaque report attached to `register` and `heartbeat`
#[async_trait]
pub trait ReportProvider: Send + Sync + 'static {
    async fn full_report(&self) -> Value;

    /// Lightweight payload for heartbeats
    fn liveness(&self) -> Option<Value> {
        None
    }
}

/// Report built from what the process can see about its host
pub struct SystemReport {
    started: Instant,
}

impl SystemReport {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemReport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReportProvider for SystemReport {
    async fn full_report(&self) -> Value {
        json!({
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "cpus": cpu_count(),
            "hostname": hostname(),
            "uptimeSecs": self.started.elapsed().as_secs(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })
    }

    fn liveness(&self) -> Option<Value> {
        Some(json!({
            "uptimeSecs": self.started.elapsed().as_secs(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
    }
}
