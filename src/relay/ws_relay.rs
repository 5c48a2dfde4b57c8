use futures_util::{FutureExt, SinkExt, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::link::ControlSink;
use super::policy::WsRelayPolicy;
use crate::config::{join_local_url, to_ws_url};
use crate::error::{RelayError, Result};
use crate::protocol::{FrameKind, Outbound, RequestId, WsConnectMessage, WsPacket};

/// Bounded FIFO holding frames while a session is opening
#[derive(Debug)]
pub struct FrameQueue<T> {
    frames: VecDeque<T>,
    capacity: usize,
}

impl<T> FrameQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            capacity,
        }
    }

    pub fn push(&mut self, frame: T) -> Result<()> {
        if self.frames.len() >= self.capacity {
            return Err(RelayError::Protocol(format!(
                "WebSocket buffer overflow ({} frames)",
                self.capacity
            )));
        }
        self.frames.push_back(frame);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Take every buffered frame in arrival order
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.frames.drain(..)
    }
}

/// How a session ended, from the session task's point of view
enum SessionEnd {
    Closed,
    Failed(String),
    Cancelled,
}

/// State shared between the relay's session table and the session task
struct SessionShared {
    request_id: RequestId,
    notified: AtomicBool,
    cancel: CancellationToken,
}

impl SessionShared {
    /// Publish the session's terminal notice; only the first call emits
    fn notify(&self, sink: &dyn ControlSink, notice: Outbound) {
        if self.notified.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = sink.emit(notice) {
            debug!(request_id = %self.request_id, "Could not notify session end: {}", e);
        }
    }

    fn end(&self, sink: &dyn ControlSink) {
        self.notify(sink, Outbound::WsClose(self.request_id.clone()));
        self.cancel.cancel();
    }

    /// Stop without notifying; used when the control link is already gone
    fn abandon(&self) {
        self.notified.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

struct SessionHandle {
    to_local: mpsc::UnboundedSender<WsPacket>,
    shared: Arc<SessionShared>,
}

/// Bridges remote-initiated WebSocket sessions to the local WebSocket service.
///
/// Each session runs as its own task: Opening (frames from the remote side are
/// buffered), Bridged (frames are forwarded as they arrive), then Closed.
pub struct WebSocketRelay {
    name: String,
    base_path: String,
    policy: WsRelayPolicy,
    sink: Arc<dyn ControlSink>,
    sessions: Mutex<HashMap<RequestId, SessionHandle>>,
}

impl WebSocketRelay {
    pub fn new(
        name: &str,
        base_path: &str,
        sink: Arc<dyn ControlSink>,
        policy: WsRelayPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            base_path: base_path.to_string(),
            policy,
            sink,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<RequestId, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.sessions().len()
    }

    /// Handle `proxy-ws-connect`: replace any session using the same request id
    /// and start bridging to the local target.
    pub fn connect(self: &Arc<Self>, msg: WsConnectMessage) -> Result<()> {
        let request_id = msg.request_id.clone();

        let url = match msg
            .target()
            .and_then(|target| to_ws_url(&join_local_url(&self.base_path, target)))
        {
            Ok(url) => url,
            Err(e) => {
                warn!(tunnel = %self.name, request_id = %request_id, "Rejecting WebSocket session: {}", e);
                let _ = self
                    .sink
                    .emit(Outbound::WsError(request_id, e.to_string()));
                return Err(e);
            }
        };

        let (to_local, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SessionShared {
            request_id: request_id.clone(),
            notified: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        let stale = self.sessions().insert(
            request_id.clone(),
            SessionHandle {
                to_local,
                shared: shared.clone(),
            },
        );
        if let Some(stale) = stale {
            info!(tunnel = %self.name, request_id = %request_id, "Replacing stale WebSocket session");
            stale.shared.end(self.sink.as_ref());
        }

        info!(tunnel = %self.name, request_id = %request_id, "Opening WebSocket session to {}", url);
        let relay = self.clone();
        tokio::spawn(async move {
            relay.run_session(shared, url, rx).await;
        });
        Ok(())
    }

    /// Route a `proxy-ws-message` from the remote side. Returns false when no
    /// session exists for the id.
    pub fn deliver(&self, request_id: &RequestId, packet: WsPacket) -> bool {
        match self.sessions().get(request_id) {
            Some(handle) => handle.to_local.send(packet).is_ok(),
            None => {
                debug!(tunnel = %self.name, request_id = %request_id, "Dropping frame for unknown session");
                false
            }
        }
    }

    /// Handle `proxy-ws-disconnect`
    pub fn disconnect(&self, request_id: &RequestId) -> bool {
        let handle = self.sessions().remove(request_id);
        match handle {
            Some(handle) => {
                info!(tunnel = %self.name, request_id = %request_id, "Closing WebSocket session");
                handle.shared.end(self.sink.as_ref());
                true
            }
            None => false,
        }
    }

    /// Tear down every session after the control link dropped
    pub fn shutdown_all(&self) {
        let handles: Vec<SessionHandle> = self.sessions().drain().map(|(_, h)| h).collect();
        if !handles.is_empty() {
            info!(tunnel = %self.name, "Tearing down {} WebSocket session(s)", handles.len());
        }
        for handle in handles {
            handle.shared.abandon();
        }
    }

    async fn run_session(
        self: Arc<Self>,
        shared: Arc<SessionShared>,
        url: Url,
        mut rx: mpsc::UnboundedReceiver<WsPacket>,
    ) {
        let end = self.bridge(&shared, &url, &mut rx).await;
        let request_id = shared.request_id.clone();

        match end {
            SessionEnd::Closed => {
                info!(tunnel = %self.name, request_id = %request_id, "WebSocket session closed");
                shared.notify(self.sink.as_ref(), Outbound::WsClose(request_id.clone()));
            }
            SessionEnd::Failed(error) => {
                warn!(tunnel = %self.name, request_id = %request_id, "WebSocket session failed: {}", error);
                shared.notify(self.sink.as_ref(), Outbound::WsError(request_id.clone(), error));
            }
            SessionEnd::Cancelled => {
                debug!(tunnel = %self.name, request_id = %request_id, "WebSocket session cancelled");
            }
        }

        // Only forget the entry if it still belongs to this session.
        let mut sessions = self.sessions();
        if sessions
            .get(&request_id)
            .is_some_and(|h| Arc::ptr_eq(&h.shared, &shared))
        {
            sessions.remove(&request_id);
        }
    }

    async fn bridge(
        &self,
        shared: &SessionShared,
        url: &Url,
        rx: &mut mpsc::UnboundedReceiver<WsPacket>,
    ) -> SessionEnd {
        let request_id = &shared.request_id;
        let mut incoming = FrameQueue::new(self.policy.buffer_capacity);

        // Opening
        let connect = tokio::time::timeout(self.policy.connect_timeout, connect_async(url.as_str()));
        tokio::pin!(connect);
        let ws_stream = loop {
            tokio::select! {
                _ = shared.cancel.cancelled() => return SessionEnd::Cancelled,
                result = &mut connect => match result {
                    Ok(Ok((ws_stream, _))) => break ws_stream,
                    Ok(Err(e)) => {
                        return SessionEnd::Failed(format!("Failed to connect to local service: {}", e))
                    }
                    Err(_) => return SessionEnd::Failed("Connection timeout".to_string()),
                },
                Some(packet) = rx.recv() => {
                    if let Err(e) = incoming.push(packet) {
                        return SessionEnd::Failed(e.to_string());
                    }
                }
            }
        };

        let (mut write, mut read) = ws_stream.split();

        // Frames the local service sent during the handshake
        let mut outgoing = FrameQueue::new(self.policy.buffer_capacity);
        let mut early_end = None;
        while let Some(next) = read.next().now_or_never() {
            match next {
                Some(Ok(msg)) => {
                    if let Some(packet) = to_packet(&msg) {
                        if let Err(e) = outgoing.push(packet) {
                            return SessionEnd::Failed(e.to_string());
                        }
                    } else if msg.is_close() {
                        early_end = Some(SessionEnd::Closed);
                        break;
                    }
                }
                Some(Err(e)) => {
                    early_end = Some(SessionEnd::Failed(e.to_string()));
                    break;
                }
                None => {
                    early_end = Some(SessionEnd::Closed);
                    break;
                }
            }
        }

        // Bridged
        debug!(
            tunnel = %self.name,
            request_id = %request_id,
            "Local socket open, flushing {} incoming and {} outgoing frame(s)",
            incoming.len(),
            outgoing.len(),
        );
        for packet in incoming.drain() {
            if let Some(msg) = to_message(request_id, packet) {
                if let Err(e) = write.send(msg).await {
                    return SessionEnd::Failed(e.to_string());
                }
            }
        }

        self.emit(Outbound::WsConnected(request_id.clone()));
        self.emit(Outbound::WsReady(request_id.clone()));

        for packet in outgoing.drain() {
            self.emit(Outbound::WsMessage(request_id.clone(), packet));
        }

        if let Some(end) = early_end {
            return end;
        }

        loop {
            tokio::select! {
                _ = shared.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Cancelled;
                }
                packet = rx.recv() => {
                    let Some(packet) = packet else {
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Cancelled;
                    };
                    if let Some(msg) = to_message(request_id, packet) {
                        if let Err(e) = write.send(msg).await {
                            return SessionEnd::Failed(e.to_string());
                        }
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(msg)) => {
                        if let Some(packet) = to_packet(&msg) {
                            self.emit(Outbound::WsMessage(request_id.clone(), packet));
                        } else if msg.is_close() {
                            return SessionEnd::Closed;
                        }
                    }
                    Some(Err(e)) => return SessionEnd::Failed(e.to_string()),
                    None => return SessionEnd::Closed,
                }
            }
        }
    }

    fn emit(&self, message: Outbound) {
        if let Err(e) = self.sink.emit(message) {
            debug!(tunnel = %self.name, "Dropped WebSocket event: {}", e);
        }
    }
}

fn to_packet(msg: &Message) -> Option<WsPacket> {
    match msg {
        Message::Text(text) => Some(WsPacket::text(text.as_str())),
        Message::Binary(data) => Some(WsPacket::binary(data)),
        _ => None,
    }
}

fn to_message(request_id: &RequestId, packet: WsPacket) -> Option<Message> {
    match packet.kind {
        FrameKind::Utf8 => Some(Message::Text(packet.data)),
        FrameKind::Binary => match packet.payload() {
            Ok(data) => Some(Message::Binary(data)),
            Err(e) => {
                warn!(request_id = %request_id, "Skipping frame: {}", e);
                None
            }
        },
    }
}
