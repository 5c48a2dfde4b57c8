//! Shared fixtures for relay tests: an in-process control-plane server and a
//! recording [`ControlSink`].

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};

use super::link::ControlSink;
use crate::error::{RelayError, Result};
use crate::protocol::{Frame, Outbound};

pub type ServerWs = WebSocketStream<TcpStream>;

/// Accept one WebSocket connection on an ephemeral port and hand it to `handler`.
pub async fn spawn_ws_server<F, Fut>(handler: F) -> String
where
    F: FnOnce(ServerWs) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        handler(ws).await;
    });
    format!("ws://{}", addr)
}

/// Control-plane server accepting any number of connections; each accepted
/// socket is handed to the test through the returned channel.
pub async fn spawn_ws_acceptor() -> (String, mpsc::UnboundedReceiver<ServerWs>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                if tx.send(ws).is_err() {
                    break;
                }
            }
        }
    });
    (format!("ws://{}", addr), rx)
}

/// Local WebSocket service accepting any number of sessions. Records each
/// request path, optionally sends a greeting, then echoes text and binary frames.
pub async fn spawn_local_ws(
    handshake_delay: Duration,
    greeting: Option<&'static str>,
) -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (paths_tx, paths_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let paths_tx = paths_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(handshake_delay).await;
                let callback = |req: &Request,
                                resp: Response|
                 -> std::result::Result<Response, ErrorResponse> {
                    let _ = paths_tx.send(req.uri().path().to_string());
                    Ok(resp)
                };
                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    return;
                };
                if let Some(greeting) = greeting {
                    let _ = ws.send(Message::Text(greeting.to_string())).await;
                }
                while let Some(Ok(msg)) = ws.next().await {
                    match msg {
                        Message::Text(_) | Message::Binary(_) => {
                            if ws.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            });
        }
    });

    (format!("http://{}", addr), paths_rx)
}

/// Next control frame from the client, skipping non-text messages
pub async fn recv_frame(ws: &mut ServerWs) -> Option<Frame> {
    while let Some(msg) = ws.next().await {
        match msg.ok()? {
            Message::Text(text) => return Frame::from_json(&text).ok(),
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

pub async fn send_frame(ws: &mut ServerWs, frame: Frame) {
    ws.send(Message::Text(frame.to_json().unwrap())).await.unwrap();
}

/// A sink that records everything published to it
pub struct RecordingSink {
    connected: AtomicBool,
    ack: Mutex<Option<RelayError>>,
    sent: Mutex<Vec<Outbound>>,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl RecordingSink {
    pub fn new() -> (std::sync::Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = std::sync::Arc::new(Self {
            connected: AtomicBool::new(true),
            ack: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            tx,
        });
        (sink, rx)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Make the next acknowledged publish fail with `err`
    pub fn fail_next_ack(&self, err: RelayError) {
        *self.ack.lock().unwrap() = Some(err);
    }

    pub fn sent(&self) -> Vec<Outbound> {
        self.sent.lock().unwrap().clone()
    }

    fn record(&self, message: Outbound) {
        self.sent.lock().unwrap().push(message.clone());
        let _ = self.tx.send(message);
    }
}

#[async_trait]
impl ControlSink for RecordingSink {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn emit(&self, message: Outbound) -> Result<()> {
        if !self.is_connected() {
            return Err(RelayError::NotConnected);
        }
        self.record(message);
        Ok(())
    }

    async fn emit_with_ack(&self, message: Outbound, _timeout: Duration) -> Result<Value> {
        if !self.is_connected() {
            return Err(RelayError::NotConnected);
        }
        if let Some(err) = self.ack.lock().unwrap().take() {
            return Err(err);
        }
        self.record(message);
        Ok(json!({ "success": true }))
    }

    async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        tokio::time::sleep(timeout).await;
        if self.is_connected() {
            Ok(())
        } else {
            Err(RelayError::NotConnected)
        }
    }
}
