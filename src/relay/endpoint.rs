use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::http_relay::{HttpRelay, LocalHttp};
use super::link::{ConnectionState, ControlLink, ControlSink, InboundFrame, LinkTarget};
use super::policy::{HttpRelayPolicy, WsRelayPolicy};
use super::ws_relay::WebSocketRelay;
use crate::config::TunnelConfig;
use crate::protocol::Inbound;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected,
    AlreadyConnected,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectOutcome {
    Disconnected,
    AlreadyDisconnected,
    Error(String),
}

/// Something the supervisor can connect, disconnect, and audit
#[async_trait]
pub trait Tunnel: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn connect(&self, node_id: &str) -> ConnectOutcome;

    async fn disconnect(&self) -> DisconnectOutcome;

    fn is_connected(&self) -> bool;
}

/// One named control connection and the relays it feeds
pub struct TunnelEndpoint {
    config: TunnelConfig,
    link: Arc<ControlLink>,
    http: Arc<HttpRelay>,
    ws: Arc<WebSocketRelay>,
    connect_timeout: Duration,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl TunnelEndpoint {
    pub fn new(
        config: TunnelConfig,
        local: Arc<dyn LocalHttp>,
        connect_timeout: Duration,
    ) -> Arc<Self> {
        let link = ControlLink::new(&config.name);
        let http = Arc::new(HttpRelay::new(
            &config.name,
            &config.local_base_path,
            local,
            HttpRelayPolicy::default(),
        ));
        let ws = WebSocketRelay::new(
            &config.name,
            &config.local_base_path,
            link.clone(),
            WsRelayPolicy::default(),
        );

        Arc::new(Self {
            config,
            link,
            http,
            ws,
            connect_timeout,
            dispatcher: Mutex::new(None),
        })
    }

    fn take_dispatcher(&self) -> Option<JoinHandle<()>> {
        self.dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            config: self.config.clone(),
            link: self.link.clone(),
            http: self.http.clone(),
            ws: self.ws.clone(),
        }
    }
}

/// Routes inbound frames of one control session to the relays
struct Dispatcher {
    config: TunnelConfig,
    link: Arc<ControlLink>,
    http: Arc<HttpRelay>,
    ws: Arc<WebSocketRelay>,
}

impl Dispatcher {
    async fn run(self, mut inbound: mpsc::UnboundedReceiver<InboundFrame>) {
        let name = self.config.name.as_str();

        while let Some((msg, ack)) = inbound.recv().await {
            match msg {
                Inbound::ProxyRequest(request) => {
                    if !self.config.http_enabled() {
                        warn!(
                            tunnel = %name,
                            request_id = %request.request_id,
                            "HTTP disabled, ignoring proxy-request",
                        );
                        continue;
                    }
                    // Ack receipt now; the response follows once the relay finishes.
                    if let Some(id) = ack {
                        let _ = self.link.ack(id, json!({ "received": true }));
                    }
                    debug!(
                        tunnel = %name,
                        request_id = %request.request_id,
                        "proxy-request {} {}",
                        request.method,
                        request.path,
                    );

                    let http = self.http.clone();
                    let link = self.link.clone();
                    let name = name.to_string();
                    tokio::spawn(async move {
                        let request_id = request.request_id.clone();
                        if let Err(e) = http.handle(link.as_ref(), request).await {
                            error!(tunnel = %name, request_id = %request_id, "Failed to answer: {}", e);
                        }
                    });
                    continue;
                }
                Inbound::WsConnect(connect) => {
                    if !self.config.ws_enabled() {
                        warn!(
                            tunnel = %name,
                            request_id = %connect.request_id,
                            "WebSocket disabled, ignoring proxy-ws-connect",
                        );
                        continue;
                    }
                    let _ = self.ws.connect(connect);
                }
                Inbound::WsDisconnect(disconnect) => {
                    self.ws.disconnect(&disconnect.request_id);
                }
                Inbound::WsMessage { request_id, packet } => {
                    self.ws.deliver(&request_id, packet);
                }
                other => debug!(tunnel = %name, "Ignoring {:?}", other),
            }

            if let Some(id) = ack {
                let _ = self.link.ack(id, json!({}));
            }
        }

        // The session is over; its request ids must not replay on the next one.
        self.http.clear_cache();
        self.ws.shutdown_all();
        info!(tunnel = %name, "Control session ended ({:?})", self.link.last_disconnect_reason());
    }
}

#[async_trait]
impl Tunnel for TunnelEndpoint {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn connect(&self, node_id: &str) -> ConnectOutcome {
        if self.link.is_connected() {
            return ConnectOutcome::AlreadyConnected;
        }

        let target = match LinkTarget::new(
            &self.config.remote_url,
            node_id,
            self.config.api_key_id.clone(),
            self.config.api_key.clone(),
        ) {
            Ok(target) => target,
            Err(e) => return ConnectOutcome::Error(e.to_string()),
        };

        // A new session starts clean even if the last dispatcher never saw
        // its session end.
        if let Some(previous) = self.take_dispatcher() {
            previous.abort();
        }
        self.http.clear_cache();
        self.ws.shutdown_all();

        match self.link.open(&target, self.connect_timeout).await {
            Ok(inbound) => {
                let handle = tokio::spawn(self.dispatcher().run(inbound));
                *self.dispatcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
                ConnectOutcome::Connected
            }
            Err(e) => {
                warn!(tunnel = %self.config.name, "Connect failed: {}", e);
                ConnectOutcome::Error(e.to_string())
            }
        }
    }

    async fn disconnect(&self) -> DisconnectOutcome {
        let mut failure = None;
        if let Some(dispatcher) = self.take_dispatcher() {
            if dispatcher.is_finished() {
                if let Err(e) = dispatcher.await {
                    failure = Some(format!("dispatcher failed: {}", e));
                }
            } else {
                dispatcher.abort();
            }
        }
        self.http.clear_cache();
        self.ws.shutdown_all();
        let closed = self.link.close();

        if let Some(failure) = failure {
            warn!(tunnel = %self.config.name, "{}", failure);
            DisconnectOutcome::Error(failure)
        } else if closed {
            info!(tunnel = %self.config.name, "Disconnected");
            DisconnectOutcome::Disconnected
        } else {
            DisconnectOutcome::AlreadyDisconnected
        }
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }
}
