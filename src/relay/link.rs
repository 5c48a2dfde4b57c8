use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest, Message},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::to_ws_url;
use crate::error::{RelayError, Result};
use crate::protocol::{Frame, Inbound, Outbound};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
        }
    }
}

/// Why the last session on a link ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// We closed it
    ClientClosed,
    /// Socket reset, EOF, or handshake failure
    TransportClosed,
    /// The remote sent a close frame
    ServerClosed,
    /// The remote violated the WebSocket protocol
    ProtocolError,
    /// The link claimed to be connected but its session was dead
    Stale,
}

/// Inbound message plus the ack id the sender asked for, if any
pub type InboundFrame = (Inbound, Option<u64>);

/// Where a link connects and with which credentials
#[derive(Debug, Clone)]
pub struct LinkTarget {
    pub url: Url,
    pub api_key_id: Option<String>,
    pub api_key: Option<String>,
}

impl LinkTarget {
    pub fn new(
        remote_url: &str,
        node_id: &str,
        api_key_id: Option<String>,
        api_key: Option<String>,
    ) -> Result<Self> {
        let mut url = to_ws_url(remote_url)?;
        url.query_pairs_mut().append_pair("nodeId", node_id);
        Ok(Self {
            url,
            api_key_id,
            api_key,
        })
    }

    fn request(&self) -> Result<http::Request<()>> {
        let mut request = self.url.as_str().into_client_request()?;
        let credentials = [
            ("x-api-key-id", self.api_key_id.as_deref()),
            ("x-api-key", self.api_key.as_deref()),
        ];
        for (name, value) in credentials {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                let value = http::HeaderValue::from_str(value)
                    .map_err(|e| RelayError::Config(format!("invalid {} header: {}", name, e)))?;
                request
                    .headers_mut()
                    .insert(http::HeaderName::from_static(name), value);
            }
        }
        Ok(request)
    }
}

/// The surface relays publish through.
#[async_trait]
pub trait ControlSink: Send + Sync + 'static {
    fn is_connected(&self) -> bool;

    /// Queue a message without waiting for delivery
    fn emit(&self, message: Outbound) -> Result<()>;

    /// Publish and wait for the remote to acknowledge
    async fn emit_with_ack(&self, message: Outbound, timeout: Duration) -> Result<Value>;

    async fn wait_connected(&self, timeout: Duration) -> Result<()>;
}

struct Session {
    epoch: u64,
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// One outbound control connection.
///
/// A link is reusable: each `open` starts a new session (epoch) and each
/// session ends exactly once, either through `close` or when its reader
/// observes the socket going away. The link never reconnects by itself.
pub struct ControlLink {
    name: String,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Option<Session>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    next_ack: AtomicU64,
    next_epoch: AtomicU64,
    last_reason: Mutex<Option<DisconnectReason>>,
    last_seen: Mutex<Instant>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl ControlLink {
    pub fn new(name: &str) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            name: name.to_string(),
            state,
            session: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_ack: AtomicU64::new(0),
            next_epoch: AtomicU64::new(0),
            last_reason: Mutex::new(None),
            last_seen: Mutex::new(Instant::now()),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn last_disconnect_reason(&self) -> Option<DisconnectReason> {
        *lock(&self.last_reason)
    }

    /// Open a new session. Inbound messages are delivered on the returned
    /// channel, which closes when the session ends.
    pub async fn open(
        self: &Arc<Self>,
        target: &LinkTarget,
        connect_timeout: Duration,
    ) -> Result<mpsc::UnboundedReceiver<InboundFrame>> {
        self.close_session(DisconnectReason::ClientClosed);

        let request = target.request()?;
        info!(tunnel = %self.name, "Connecting to {}...", redact(&target.url));
        self.state.send_replace(ConnectionState::Connecting);

        let ws_stream = match tokio::time::timeout(connect_timeout, connect_async(request)).await
        {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(e)) => {
                self.mark_failed(DisconnectReason::TransportClosed);
                return Err(e.into());
            }
            Err(_) => {
                self.mark_failed(DisconnectReason::TransportClosed);
                return Err(RelayError::ConnectTimeout);
            }
        };

        let (mut write, read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<InboundFrame>();
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed) + 1;

        // Held across the spawns so the reader cannot finish the session
        // before it is recorded.
        let mut session = lock(&self.session);
        *lock(&self.last_seen) = Instant::now();
        self.state.send_replace(ConnectionState::Connected);

        // The writer exclusively owns the sink; it exits once every sender is gone.
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    debug!("Send error (connection closing): {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        let link = Arc::clone(self);
        let pong_tx = out_tx.clone();
        let reader = tokio::spawn(async move {
            let reason = link.read_loop(read, &in_tx, &pong_tx).await;
            link.finish_session(epoch, reason);
        });

        *session = Some(Session {
            epoch,
            outbound: out_tx,
            reader,
            writer,
        });
        drop(session);

        info!(tunnel = %self.name, "Connected");
        Ok(in_rx)
    }

    async fn read_loop<S>(
        &self,
        mut read: S,
        in_tx: &mpsc::UnboundedSender<InboundFrame>,
        pong_tx: &mpsc::UnboundedSender<Message>,
    ) -> DisconnectReason
    where
        S: futures_util::Stream<Item = std::result::Result<Message, tungstenite::Error>> + Unpin,
    {
        while let Some(result) = read.next().await {
            match result {
                Ok(Message::Text(text)) => {
                    self.touch();
                    let parsed = Frame::from_json(&text).and_then(|frame| {
                        let ack = frame.ack;
                        Inbound::from_frame(frame).map(|msg| (msg, ack))
                    });
                    match parsed {
                        Ok((Inbound::Ack { id, data }, _)) => self.resolve_ack(id, data),
                        Ok(frame) => {
                            if in_tx.send(frame).is_err() {
                                return DisconnectReason::ClientClosed;
                            }
                        }
                        Err(e) => warn!(tunnel = %self.name, "Rejected frame: {}", e),
                    }
                }
                Ok(Message::Ping(data)) => {
                    self.touch();
                    let _ = pong_tx.send(Message::Pong(data));
                }
                Ok(Message::Pong(_)) => self.touch(),
                Ok(Message::Close(frame)) => {
                    info!(
                        tunnel = %self.name,
                        "Server closed connection: {:?}",
                        frame.map(|f| f.reason.to_string()),
                    );
                    return DisconnectReason::ServerClosed;
                }
                Ok(Message::Binary(_)) => {
                    debug!(tunnel = %self.name, "Received binary message (ignoring)");
                }
                Ok(_) => {}
                Err(tungstenite::Error::Protocol(e)) => {
                    warn!(tunnel = %self.name, "WebSocket protocol error: {}", e);
                    return DisconnectReason::ProtocolError;
                }
                Err(e) => {
                    debug!(tunnel = %self.name, "WebSocket read error: {}", e);
                    return DisconnectReason::TransportClosed;
                }
            }
        }
        DisconnectReason::TransportClosed
    }

    /// Called by the reader when its socket goes away
    fn finish_session(&self, epoch: u64, reason: DisconnectReason) {
        let mut session = lock(&self.session);
        if session.as_ref().map(|s| s.epoch) != Some(epoch) {
            return;
        }
        // The writer drains and exits once the reader's sender is dropped.
        session.take();
        drop(session);

        info!(tunnel = %self.name, "Disconnected ({:?})", reason);
        self.mark_failed(reason);
    }

    /// End the current session, if any. Returns whether one was open.
    pub fn close(&self) -> bool {
        self.close_session(DisconnectReason::ClientClosed)
    }

    fn close_session(&self, reason: DisconnectReason) -> bool {
        let Some(session) = lock(&self.session).take() else {
            if self.state() != ConnectionState::Disconnected {
                self.state.send_replace(ConnectionState::Disconnected);
            }
            return false;
        };

        let _ = session.outbound.send(Message::Close(None));
        session.reader.abort();
        self.mark_failed(reason);
        true
    }

    fn mark_failed(&self, reason: DisconnectReason) {
        *lock(&self.last_reason) = Some(reason);
        // Dropping the senders wakes every ack waiter with an error.
        lock(&self.pending).clear();
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Verify a link that reports Connected actually has a live session
    /// that heard from the remote within `stale_after`. Forces the link
    /// closed on mismatch and returns false.
    pub fn check_health(&self, stale_after: Duration) -> bool {
        if self.state() != ConnectionState::Connected {
            return true;
        }

        let alive = lock(&self.session)
            .as_ref()
            .map(|s| !s.reader.is_finished() && !s.writer.is_finished())
            .unwrap_or(false);
        let fresh = lock(&self.last_seen).elapsed() < stale_after;

        if alive && fresh {
            return true;
        }

        warn!(
            tunnel = %self.name,
            "Link reports connected but session is dead (alive={}, fresh={})",
            alive,
            fresh,
        );
        self.close_session(DisconnectReason::Stale);
        false
    }

    /// Send a transport-level ping; the pong refreshes liveness
    pub fn ping(&self) -> Result<()> {
        self.send_raw(Message::Ping(Vec::new()))
    }

    /// Answer a frame that requested acknowledgment
    pub fn ack(&self, id: u64, data: Value) -> Result<()> {
        self.send_frame(Frame::ack_reply(id, data))
    }

    fn send_frame(&self, frame: Frame) -> Result<()> {
        let json = frame.to_json()?;
        self.send_raw(Message::Text(json))
    }

    fn send_raw(&self, msg: Message) -> Result<()> {
        match lock(&self.session).as_ref() {
            Some(session) => session
                .outbound
                .send(msg)
                .map_err(|_| RelayError::NotConnected),
            None => Err(RelayError::NotConnected),
        }
    }

    fn resolve_ack(&self, id: u64, data: Value) {
        match lock(&self.pending).remove(&id) {
            Some(tx) => {
                let _ = tx.send(data);
            }
            None => debug!(tunnel = %self.name, "Ack for unknown id {}", id),
        }
    }

    fn touch(&self) {
        *lock(&self.last_seen) = Instant::now();
    }
}

#[async_trait]
impl ControlSink for ControlLink {
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn emit(&self, message: Outbound) -> Result<()> {
        self.send_frame(message.into_frame()?)
    }

    async fn emit_with_ack(&self, message: Outbound, timeout: Duration) -> Result<Value> {
        let mut frame = message.into_frame()?;
        let id = self.next_ack.fetch_add(1, Ordering::Relaxed) + 1;
        frame.ack = Some(id);

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        if let Err(e) = self.send_frame(frame) {
            lock(&self.pending).remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(_)) => Err(RelayError::NotConnected),
            Err(_) => {
                lock(&self.pending).remove(&id);
                Err(RelayError::AckTimeout)
            }
        }
    }

    async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.subscribe();
        let connected =
            tokio::time::timeout(timeout, rx.wait_for(|s| *s == ConnectionState::Connected))
                .await
                .is_ok_and(|r| r.is_ok());
        if connected {
            Ok(())
        } else {
            Err(RelayError::NotConnected)
        }
    }
}

/// Strip credentials from a URL before logging it
fn redact(url: &Url) -> String {
    let mut url = url.clone();
    let _ = url.set_password(None);
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RequestId, WsPacket};
    use crate::relay::testutil::{recv_frame, send_frame, spawn_ws_server};
    use serde_json::json;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    fn target(url: &str) -> LinkTarget {
        LinkTarget::new(url, "node-1", Some("kid".into()), Some("secret".into())).unwrap()
    }

    #[test]
    fn test_target_maps_scheme_and_node_id() {
        let t = LinkTarget::new("https://ws.example.net:443", "n 1", None, None).unwrap();
        assert_eq!(t.url.as_str(), "wss://ws.example.net/?nodeId=n+1");
        let req = t.request().unwrap();
        assert!(req.headers().get("x-api-key").is_none());
    }

    #[tokio::test]
    async fn test_open_sends_credentials_and_node_id() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let callback = |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
                let header = |n: &str| {
                    req.headers()
                        .get(n)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string)
                };
                let _ = seen_tx.send((
                    req.uri().query().map(str::to_string),
                    header("x-api-key-id"),
                    header("x-api-key"),
                ));
                Ok(resp)
            };
            let _ws = tokio_tungstenite::accept_hdr_async(stream, callback)
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let link = ControlLink::new("test");
        let _rx = link
            .open(&target(&format!("ws://{}", addr)), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(link.is_connected());

        let (query, key_id, key) = seen_rx.await.unwrap();
        assert_eq!(query.as_deref(), Some("nodeId=node-1"));
        assert_eq!(key_id.as_deref(), Some("kid"));
        assert_eq!(key.as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn test_ack_round_trip() {
        let url = spawn_ws_server(|mut ws| async move {
            let frame = recv_frame(&mut ws).await.unwrap();
            assert_eq!(frame.event, "proxy-ws-close:r1");
            let ack = frame.ack.unwrap();
            send_frame(&mut ws, Frame::ack_reply(ack, json!({"success": true}))).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;

        let link = ControlLink::new("test");
        let _rx = link.open(&target(&url), Duration::from_secs(5)).await.unwrap();
        let reply = link
            .emit_with_ack(Outbound::WsClose(RequestId::from("r1")), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(reply["success"], true);
    }

    #[tokio::test]
    async fn test_ack_timeout() {
        let url = spawn_ws_server(|mut ws| async move {
            let _ = recv_frame(&mut ws).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;

        let link = ControlLink::new("test");
        let _rx = link.open(&target(&url), Duration::from_secs(5)).await.unwrap();
        let result = link
            .emit_with_ack(
                Outbound::WsReady(RequestId::from("r1")),
                Duration::from_millis(200),
            )
            .await;
        assert!(matches!(result, Err(RelayError::AckTimeout)));
    }

    #[tokio::test]
    async fn test_inbound_delivery_skips_invalid_frames() {
        let url = spawn_ws_server(|mut ws| async move {
            ws.send(Message::Text("{not json".to_string())).await.unwrap();
            send_frame(&mut ws, Frame::new("mystery", Value::Null)).await;
            let mut frame = Frame::new(
                "proxy-ws-message:r2",
                serde_json::to_value(WsPacket::text("hi")).unwrap(),
            );
            frame.ack = Some(4);
            send_frame(&mut ws, frame).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;

        let link = ControlLink::new("test");
        let mut rx = link.open(&target(&url), Duration::from_secs(5)).await.unwrap();
        let (msg, ack) = rx.recv().await.unwrap();
        assert_eq!(ack, Some(4));
        assert_eq!(
            msg,
            Inbound::WsMessage {
                request_id: RequestId::from("r2"),
                packet: WsPacket::text("hi"),
            }
        );
    }

    #[tokio::test]
    async fn test_server_close_ends_session() {
        let url = spawn_ws_server(|mut ws| async move {
            ws.close(None).await.unwrap();
        })
        .await;

        let link = ControlLink::new("test");
        let mut rx = link.open(&target(&url), Duration::from_secs(5)).await.unwrap();
        assert!(rx.recv().await.is_none());

        let mut state = link.subscribe();
        state
            .wait_for(|s| *s == ConnectionState::Disconnected)
            .await
            .unwrap();
        assert_eq!(
            link.last_disconnect_reason(),
            Some(DisconnectReason::ServerClosed)
        );
        assert!(matches!(
            link.emit(Outbound::WsClose(RequestId::from("r1"))),
            Err(RelayError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_close_fails_pending_acks() {
        let url = spawn_ws_server(|mut ws| async move {
            let _ = recv_frame(&mut ws).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;

        let link = ControlLink::new("test");
        let _rx = link.open(&target(&url), Duration::from_secs(5)).await.unwrap();

        let waiter = {
            let link = Arc::clone(&link);
            tokio::spawn(async move {
                link.emit_with_ack(
                    Outbound::WsReady(RequestId::from("r1")),
                    Duration::from_secs(5),
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(link.close());
        assert!(!link.close());
        assert!(matches!(
            waiter.await.unwrap(),
            Err(RelayError::NotConnected)
        ));
        assert_eq!(
            link.last_disconnect_reason(),
            Some(DisconnectReason::ClientClosed)
        );
    }

    #[tokio::test]
    async fn test_open_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let link = ControlLink::new("test");
        let result = link
            .open(&target(&format!("ws://{}", addr)), Duration::from_secs(5))
            .await;
        assert!(result.is_err());
        assert_eq!(link.state(), ConnectionState::Disconnected);
        assert!(matches!(
            link.wait_connected(Duration::from_millis(50)).await,
            Err(RelayError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_wait_connected_resolves_once_open() {
        let url = spawn_ws_server(|ws| async move {
            let _ws = ws;
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;

        let link = ControlLink::new("test");
        let waiter = {
            let link = Arc::clone(&link);
            tokio::spawn(async move { link.wait_connected(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        let _rx = link.open(&target(&url), Duration::from_secs(5)).await.unwrap();
        assert!(waiter.await.unwrap().is_ok());
        assert!(link.wait_connected(Duration::ZERO).await.is_ok());
    }

    #[tokio::test]
    async fn test_health_check_detects_silent_link() {
        let url = spawn_ws_server(|ws| async move {
            let _ws = ws;
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;

        let link = ControlLink::new("test");
        let _rx = link.open(&target(&url), Duration::from_secs(5)).await.unwrap();
        assert!(link.check_health(Duration::from_secs(60)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!link.check_health(Duration::from_millis(10)));
        assert!(!link.is_connected());
        assert_eq!(link.last_disconnect_reason(), Some(DisconnectReason::Stale));
    }
}
