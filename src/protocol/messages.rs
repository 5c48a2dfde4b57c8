use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use super::{ClientId, RequestId};
use crate::error::{RelayError, Result};

/// Highest frame version this client understands
pub const PROTOCOL_VERSION: u8 = 1;

fn default_version() -> u8 {
    PROTOCOL_VERSION
}

/// Envelope for every control-channel frame.
///
/// A frame carrying `ack` asks the receiver to answer with an `ack` event
/// echoing the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(default = "default_version")]
    pub v: u8,
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Frame {
            v: PROTOCOL_VERSION,
            event: event.into(),
            data,
            ack: None,
        }
    }

    pub fn ack_reply(id: u64, data: Value) -> Self {
        Frame {
            v: PROTOCOL_VERSION,
            event: "ack".to_string(),
            data,
            ack: Some(id),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let frame: Frame = serde_json::from_str(json)?;
        if frame.v > PROTOCOL_VERSION {
            return Err(RelayError::Protocol(format!(
                "unsupported frame version {} for event '{}'",
                frame.v, frame.event
            )));
        }
        Ok(frame)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRequestMessage {
    pub request_id: RequestId,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyResponseEnvelope {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_encoding: Option<String>,
}

impl ProxyResponseEnvelope {
    /// Build an envelope from a raw local response.
    ///
    /// JSON bodies are embedded as JSON, other UTF-8 bodies as a string, and
    /// anything else as base64.
    pub fn from_local(status: u16, headers: BTreeMap<String, String>, body: Vec<u8>) -> Self {
        let is_json = headers
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case("content-type") && v.contains("json"));

        let (body, body_encoding) = if body.is_empty() {
            (Value::Null, None)
        } else if is_json {
            match serde_json::from_slice::<Value>(&body) {
                Ok(value) => (value, None),
                Err(_) => encode_body(body),
            }
        } else {
            encode_body(body)
        };

        ProxyResponseEnvelope {
            status,
            headers,
            body,
            body_encoding,
        }
    }

    /// A relay-generated failure response
    pub fn synthetic(status: u16, error: &str) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        ProxyResponseEnvelope {
            status,
            headers,
            body: json!({ "success": false, "error": error }),
            body_encoding: None,
        }
    }
}

fn encode_body(data: Vec<u8>) -> (Value, Option<String>) {
    match String::from_utf8(data) {
        Ok(s) => (Value::String(s), None),
        Err(e) => {
            let encoded = base64::engine::general_purpose::STANDARD.encode(e.as_bytes());
            (Value::String(encoded), Some("base64".to_string()))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsConnectMessage {
    pub request_id: RequestId,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

impl WsConnectMessage {
    /// The local target, preferring an explicit path over a session id
    pub fn target(&self) -> Result<&str> {
        self.path
            .as_deref()
            .or(self.session_id.as_deref())
            .ok_or_else(|| {
                RelayError::Protocol(format!(
                    "proxy-ws-connect for {} has neither path nor sessionId",
                    self.request_id
                ))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsDisconnectMessage {
    pub request_id: RequestId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Utf8,
    Binary,
}

/// One WebSocket frame carried over the control channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsPacket {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    pub data: String,
}

impl WsPacket {
    pub fn text(text: impl Into<String>) -> Self {
        WsPacket {
            kind: FrameKind::Utf8,
            data: text.into(),
        }
    }

    pub fn binary(data: &[u8]) -> Self {
        WsPacket {
            kind: FrameKind::Binary,
            data: base64::engine::general_purpose::STANDARD.encode(data),
        }
    }

    /// Raw frame bytes (base64-decoded for binary frames)
    pub fn payload(&self) -> Result<Vec<u8>> {
        match self.kind {
            FrameKind::Utf8 => Ok(self.data.clone().into_bytes()),
            FrameKind::Binary => base64::engine::general_purpose::STANDARD
                .decode(&self.data)
                .map_err(|e| RelayError::Protocol(format!("invalid base64 frame: {}", e))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterMessage {
    pub client_id: ClientId,
    pub client_info: Value,
    pub public_key: String,
    pub version: String,
    pub full_report: Value,
    pub num_of_browsers: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_report: Option<Value>,
}

/// Messages received from the control plane
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    ProxyRequest(ProxyRequestMessage),
    WsConnect(WsConnectMessage),
    WsDisconnect(WsDisconnectMessage),
    WsMessage {
        request_id: RequestId,
        packet: WsPacket,
    },
    TestBandwidth,
    BandwidthDownloadTest {
        received_bytes: usize,
    },
    ReconnectAttempt {
        attempt: u64,
    },
    ClientId(ClientId),
    Ack {
        id: u64,
        data: Value,
    },
}

impl Inbound {
    /// Validate a frame against the schema of its event
    pub fn from_frame(frame: Frame) -> Result<Self> {
        let Frame {
            event, data, ack, ..
        } = frame;

        if let Some((name, request_id)) = event.split_once(':') {
            if name == "proxy-ws-message" && !request_id.is_empty() {
                return Ok(Inbound::WsMessage {
                    request_id: RequestId::from(request_id),
                    packet: serde_json::from_value(data)?,
                });
            }
            return Err(RelayError::Protocol(format!("unknown event '{}'", event)));
        }

        let msg = match event.as_str() {
            "proxy-request" => Inbound::ProxyRequest(serde_json::from_value(data)?),
            "proxy-ws-connect" => Inbound::WsConnect(serde_json::from_value(data)?),
            "proxy-ws-disconnect" => Inbound::WsDisconnect(serde_json::from_value(data)?),
            "test-bandwidth" => Inbound::TestBandwidth,
            "bandwidth-download-test" => {
                let payload = data.get("payload").cloned().unwrap_or(Value::Null);
                let received_bytes = match &payload {
                    Value::String(s) => s.len(),
                    Value::Null => 0,
                    other => other.to_string().len(),
                };
                Inbound::BandwidthDownloadTest { received_bytes }
            }
            "reconnect_attempt" => {
                let attempt = data
                    .as_u64()
                    .or_else(|| data.get("attempt").and_then(Value::as_u64))
                    .unwrap_or(0);
                Inbound::ReconnectAttempt { attempt }
            }
            "client-id" => {
                let id = data
                    .as_str()
                    .or_else(|| data.get("clientId").and_then(Value::as_str))
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| RelayError::Protocol("client-id without an id".to_string()))?;
                Inbound::ClientId(ClientId::from(id.to_string()))
            }
            "ack" => {
                let id = ack
                    .ok_or_else(|| RelayError::Protocol("ack frame without an id".to_string()))?;
                Inbound::Ack { id, data }
            }
            _ => return Err(RelayError::Protocol(format!("unknown event '{}'", event))),
        };

        Ok(msg)
    }
}

/// Messages sent to the control plane
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Register(RegisterMessage),
    Heartbeat(HeartbeatMessage),
    ProxyResponse {
        request_id: RequestId,
        response: ProxyResponseEnvelope,
    },
    WsConnected(RequestId),
    WsReady(RequestId),
    WsMessage(RequestId, WsPacket),
    WsClose(RequestId),
    WsError(RequestId, String),
}

impl Outbound {
    pub fn event_name(&self) -> String {
        match self {
            Outbound::Register(_) => "register".to_string(),
            Outbound::Heartbeat(_) => "heartbeat".to_string(),
            Outbound::ProxyResponse { .. } => "proxy-response".to_string(),
            Outbound::WsConnected(id) => format!("proxy-ws-connected:{}", id),
            Outbound::WsReady(id) => format!("proxy-ws-ready:{}", id),
            Outbound::WsMessage(id, _) => format!("proxy-ws-message:{}", id),
            Outbound::WsClose(id) => format!("proxy-ws-close:{}", id),
            Outbound::WsError(id, _) => format!("proxy-ws-error:{}", id),
        }
    }

    pub fn into_frame(self) -> Result<Frame> {
        let event = self.event_name();
        let data = match self {
            Outbound::Register(msg) => serde_json::to_value(msg)?,
            Outbound::Heartbeat(msg) => serde_json::to_value(msg)?,
            Outbound::ProxyResponse {
                request_id,
                response,
            } => json!({ "requestId": request_id, "response": response }),
            Outbound::WsMessage(_, packet) => serde_json::to_value(packet)?,
            Outbound::WsError(_, error) => json!({ "error": error }),
            Outbound::WsConnected(_) | Outbound::WsReady(_) | Outbound::WsClose(_) => Value::Null,
        };
        Ok(Frame::new(event, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proxy_request() {
        let frame = Frame::from_json(
            r#"{"event":"proxy-request","ack":3,"data":{"requestId":"abc","method":"POST","path":"/run","body":{"x":1}}}"#,
        )
        .unwrap();
        assert_eq!(frame.ack, Some(3));

        match Inbound::from_frame(frame).unwrap() {
            Inbound::ProxyRequest(req) => {
                assert_eq!(req.request_id, RequestId::from("abc"));
                assert_eq!(req.method, "POST");
                assert_eq!(req.body, json!({"x": 1}));
                assert!(req.headers.is_empty());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_rejects_unknown_event() {
        let frame = Frame::new("proxy-teleport", json!({}));
        assert!(matches!(
            Inbound::from_frame(frame),
            Err(RelayError::Protocol(_))
        ));

        let frame = Frame::new("proxy-ws-close:r1", Value::Null);
        assert!(Inbound::from_frame(frame).is_err());
    }

    #[test]
    fn test_rejects_malformed_payload() {
        let frame = Frame::new("proxy-request", json!({"requestId": "abc"}));
        assert!(matches!(Inbound::from_frame(frame), Err(RelayError::Json(_))));
    }

    #[test]
    fn test_rejects_future_version() {
        let result = Frame::from_json(r#"{"v":9,"event":"heartbeat"}"#);
        assert!(matches!(result, Err(RelayError::Protocol(_))));
    }

    #[test]
    fn test_ws_message_event_carries_request_id() {
        let frame = Frame::new(
            "proxy-ws-message:r1",
            json!({"type": "binary", "data": "AAEC"}),
        );
        match Inbound::from_frame(frame).unwrap() {
            Inbound::WsMessage { request_id, packet } => {
                assert_eq!(request_id.as_str(), "r1");
                assert_eq!(packet.payload().unwrap(), vec![0, 1, 2]);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_ws_connect_target_prefers_path() {
        let msg: WsConnectMessage =
            serde_json::from_value(json!({"requestId": "r1", "sessionId": "s", "path": "/p"}))
                .unwrap();
        assert_eq!(msg.target().unwrap(), "/p");

        let msg: WsConnectMessage =
            serde_json::from_value(json!({"requestId": "r1", "sessionId": "s"})).unwrap();
        assert_eq!(msg.target().unwrap(), "s");

        let msg: WsConnectMessage = serde_json::from_value(json!({"requestId": "r1"})).unwrap();
        assert!(msg.target().is_err());
    }

    #[test]
    fn test_client_id_accepts_bare_string() {
        let frame = Frame::new("client-id", json!("node-7"));
        assert_eq!(
            Inbound::from_frame(frame).unwrap(),
            Inbound::ClientId(ClientId::from("node-7".to_string()))
        );
    }

    #[test]
    fn test_outbound_event_names() {
        let id = RequestId::from("r9");
        assert_eq!(Outbound::WsReady(id.clone()).event_name(), "proxy-ws-ready:r9");
        assert_eq!(
            Outbound::WsError(id, "boom".to_string())
                .into_frame()
                .unwrap()
                .data,
            json!({"error": "boom"})
        );
    }

    #[test]
    fn test_proxy_response_shape() {
        let frame = Outbound::ProxyResponse {
            request_id: RequestId::from("r1"),
            response: ProxyResponseEnvelope::synthetic(504, "Gateway Timeout"),
        }
        .into_frame()
        .unwrap();

        assert_eq!(frame.event, "proxy-response");
        assert_eq!(frame.data["requestId"], "r1");
        assert_eq!(frame.data["response"]["status"], 504);
        assert_eq!(frame.data["response"]["body"]["success"], false);
        assert!(frame.data["response"].get("bodyEncoding").is_none());
    }

    #[test]
    fn test_local_body_encoding() {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        let env = ProxyResponseEnvelope::from_local(200, headers, br#"{"ok":true}"#.to_vec());
        assert_eq!(env.body, json!({"ok": true}));

        let env = ProxyResponseEnvelope::from_local(200, BTreeMap::new(), b"plain".to_vec());
        assert_eq!(env.body, json!("plain"));
        assert_eq!(env.body_encoding, None);

        let env = ProxyResponseEnvelope::from_local(200, BTreeMap::new(), vec![0xff, 0xfe]);
        assert_eq!(env.body, json!("//4="));
        assert_eq!(env.body_encoding.as_deref(), Some("base64"));
    }
}
