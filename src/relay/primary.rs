use serde_json::json;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

use super::endpoint::{ConnectOutcome, DisconnectOutcome};
use super::http_relay::{HttpRelay, LocalHttp};
use super::identity::{NodeIdentity, ReportProvider};
use super::link::{ControlLink, ControlSink, DisconnectReason, InboundFrame, LinkTarget};
use super::policy::{HttpRelayPolicy, ReconnectPolicy};
use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::protocol::{ClientId, HeartbeatMessage, Inbound, Outbound, RegisterMessage};

/// Connection settings for the primary channel
#[derive(Debug, Clone)]
pub struct PrimarySettings {
    pub url: String,
    pub api_key_id: Option<String>,
    pub api_key: Option<String>,
    pub capacity: u32,
    pub local_base_url: String,
    pub heartbeat_interval: Duration,
    pub monitor_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl PrimarySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            url: config.node.primary_url.clone(),
            api_key_id: config.auth.api_key_id.clone(),
            api_key: config.auth.api_key.clone(),
            capacity: config.node.capacity,
            local_base_url: config.local.http_base_url.clone(),
            heartbeat_interval: config.timing.heartbeat_interval(),
            monitor_interval: config.timing.monitor_interval(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

struct Inner {
    settings: PrimarySettings,
    link: Arc<ControlLink>,
    identity: RwLock<Option<NodeIdentity>>,
    client_ids: watch::Sender<Option<ClientId>>,
    reports: Arc<dyn ReportProvider>,
    http: Arc<HttpRelay>,
}

/// The always-on registration and heartbeat connection.
///
/// Registers once per connection epoch, heartbeats on a fixed interval, answers
/// bandwidth tests, and serves `proxy-request` against the local HTTP service.
/// Unlike tunnel endpoints it retries forever with backoff, and reconnects
/// at once when the server closed the session or the session went stale.
pub struct PrimaryControlChannel {
    inner: Arc<Inner>,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl PrimaryControlChannel {
    pub fn new(
        settings: PrimarySettings,
        identity: Option<NodeIdentity>,
        reports: Arc<dyn ReportProvider>,
        local: Arc<dyn LocalHttp>,
    ) -> Self {
        let http = Arc::new(HttpRelay::new(
            "primary",
            &settings.local_base_url,
            local,
            HttpRelayPolicy::default(),
        ));
        let (client_ids, _) = watch::channel(identity.as_ref().map(|i| i.client_id.clone()));
        Self {
            inner: Arc::new(Inner {
                settings,
                link: ControlLink::new("primary"),
                identity: RwLock::new(identity),
                client_ids,
                reports,
                http,
            }),
            runner: Mutex::new(None),
        }
    }

    /// Connect and keep the channel up. Returns the outcome of the first
    /// handshake; on failure the channel keeps retrying in the background.
    pub async fn connect(&self) -> ConnectOutcome {
        if self.running() {
            return ConnectOutcome::AlreadyConnected;
        }

        let Some(identity) = self.inner.identity() else {
            error!(tunnel = "primary", "No client identity configured, not connecting");
            return ConnectOutcome::Error(
                "no client identity configured; run `nodelink init`".to_string(),
            );
        };

        let first = self.inner.open(&identity).await;
        let outcome = match &first {
            Ok(_) => ConnectOutcome::Connected,
            Err(e) => {
                warn!(tunnel = "primary", "Initial connect failed: {}", e);
                ConnectOutcome::Error(e.to_string())
            }
        };

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.run(first.ok()).await });
        *self.runner.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        outcome
    }

    pub async fn disconnect(&self) -> DisconnectOutcome {
        let runner = self.runner.lock().unwrap_or_else(|e| e.into_inner()).take();
        let was_running = runner.is_some();
        if let Some(runner) = runner {
            runner.abort();
        }
        self.inner.http.clear_cache();

        if self.inner.link.close() || was_running {
            info!(tunnel = "primary", "Disconnected");
            DisconnectOutcome::Disconnected
        } else {
            DisconnectOutcome::AlreadyDisconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.link.is_connected()
    }

    #[cfg(test)]
    fn identity(&self) -> Option<NodeIdentity> {
        self.inner.identity()
    }

    /// Follows the client id, changing when the server assigns a new one
    pub fn client_ids(&self) -> watch::Receiver<Option<ClientId>> {
        self.inner.client_ids.subscribe()
    }

    fn running(&self) -> bool {
        self.runner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Inner {
    fn identity(&self) -> Option<NodeIdentity> {
        self.identity
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn open(&self, identity: &NodeIdentity) -> Result<mpsc::UnboundedReceiver<InboundFrame>> {
        let target = LinkTarget::new(
            &self.settings.url,
            identity.client_id.as_str(),
            self.settings.api_key_id.clone(),
            self.settings.api_key.clone(),
        )?;
        self.link
            .open(&target, self.settings.reconnect.connect_timeout)
            .await
    }

    async fn run(self: Arc<Self>, mut inbound: Option<mpsc::UnboundedReceiver<InboundFrame>>) {
        let mut attempt = 0u32;

        loop {
            let rx = match inbound.take() {
                Some(rx) => rx,
                None => {
                    attempt = attempt.saturating_add(1);
                    let delay = self.settings.reconnect.backoff(attempt);
                    info!(tunnel = "primary", "Reconnecting in {:?} (attempt {})", delay, attempt);
                    tokio::time::sleep(delay).await;

                    let Some(identity) = self.identity() else {
                        error!(tunnel = "primary", "Client identity disappeared, giving up");
                        return;
                    };
                    match self.open(&identity).await {
                        Ok(rx) => rx,
                        Err(e) => {
                            warn!(tunnel = "primary", "Reconnect failed: {}", e);
                            continue;
                        }
                    }
                }
            };

            attempt = 0;
            self.session(rx).await;

            // Stale ids must not replay against the next session.
            self.http.clear_cache();

            let reason = self.link.last_disconnect_reason();
            info!(tunnel = "primary", "Session ended ({:?})", reason);
            if matches!(
                reason,
                Some(
                    DisconnectReason::ServerClosed
                        | DisconnectReason::ProtocolError
                        | DisconnectReason::Stale
                )
            ) {
                if let Some(identity) = self.identity() {
                    match self.open(&identity).await {
                        Ok(rx) => inbound = Some(rx),
                        Err(e) => warn!(tunnel = "primary", "Immediate reconnect failed: {}", e),
                    }
                }
            }
        }
    }

    /// Drive one connection epoch until the link drops
    async fn session(self: &Arc<Self>, mut inbound: mpsc::UnboundedReceiver<InboundFrame>) {
        if let Err(e) = self.register().await {
            error!(tunnel = "primary", "Register failed: {}", e);
        }

        let heartbeat_every = self.settings.heartbeat_interval;
        let monitor_every = self.settings.monitor_interval;
        let mut heartbeat = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
        let mut monitor = interval_at(Instant::now() + monitor_every, monitor_every);

        loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some((msg, ack)) => self.handle(msg, ack),
                    None => break,
                },
                _ = heartbeat.tick() => {
                    let message = HeartbeatMessage {
                        full_report: self.reports.liveness(),
                    };
                    if let Err(e) = self.link.emit(Outbound::Heartbeat(message)) {
                        debug!(tunnel = "primary", "Heartbeat not sent: {}", e);
                    }
                }
                _ = monitor.tick() => {
                    if !self.link.check_health(monitor_every * 3) {
                        break;
                    }
                    let _ = self.link.ping();
                }
            }
        }
    }

    async fn register(&self) -> Result<()> {
        let identity = self.identity().ok_or_else(|| {
            RelayError::Config("no client identity configured".to_string())
        })?;

        let message = RegisterMessage {
            client_id: identity.client_id.clone(),
            client_info: identity.client_info,
            public_key: identity.public_key,
            version: env!("CARGO_PKG_VERSION").to_string(),
            full_report: self.reports.full_report().await,
            num_of_browsers: self.settings.capacity,
        };
        self.link.emit(Outbound::Register(message))?;
        info!(tunnel = "primary", "Registered as {}", identity.client_id);
        Ok(())
    }

    fn handle(self: &Arc<Self>, msg: Inbound, ack: Option<u64>) {
        let reply = match msg {
            Inbound::ProxyRequest(request) => {
                if let Some(id) = ack {
                    let _ = self.link.ack(id, json!({ "received": true }));
                }
                let inner = self.clone();
                tokio::spawn(async move {
                    let request_id = request.request_id.clone();
                    if let Err(e) = inner.http.handle(inner.link.as_ref(), request).await {
                        error!(tunnel = "primary", request_id = %request_id, "Failed to answer: {}", e);
                    }
                });
                return;
            }
            Inbound::TestBandwidth => json!({
                "timestamp": chrono::Utc::now().timestamp_millis(),
            }),
            Inbound::BandwidthDownloadTest { received_bytes } => {
                debug!(tunnel = "primary", "Bandwidth test received {} bytes", received_bytes);
                json!({
                    "receivedBytes": received_bytes,
                    "timestamp": chrono::Utc::now().timestamp_millis(),
                })
            }
            Inbound::ReconnectAttempt { attempt } => {
                info!(tunnel = "primary", "Server reports reconnect attempt {}", attempt);
                json!({})
            }
            Inbound::ClientId(client_id) => {
                let mut identity = self.identity.write().unwrap_or_else(|e| e.into_inner());
                if let Some(identity) = identity.as_mut() {
                    if identity.client_id != client_id {
                        info!(tunnel = "primary", "Adopting client id {}", client_id);
                        identity.client_id = client_id.clone();
                        self.client_ids.send_replace(Some(client_id));
                    }
                }
                json!({})
            }
            other => {
                debug!(tunnel = "primary", "Ignoring {:?}", other);
                json!({})
            }
        };

        if let Some(id) = ack {
            let _ = self.link.ack(id, reply);
        }
    }
}
