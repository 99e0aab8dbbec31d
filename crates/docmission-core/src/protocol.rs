//! Wire protocol for the agent service
//!
//! The service speaks Socket.IO (protocol 5) on top of Engine.IO (protocol 4),
//! carried over a single WebSocket. Every text frame is one Engine.IO packet,
//! and Socket.IO packets ride inside Engine.IO `message` packets:
//!
//! ```text
//! 0{"sid":"..","pingInterval":25000,"pingTimeout":20000}   open        (server)
//! 2 / 3                                                     ping / pong
//! 40                                                        join "/"    (client)
//! 40{"sid":".."}                                            joined      (server)
//! 42["start_agent",{"project_path":"/repo"}]                event       (client)
//! 42["log",{"level":"INFO","message":".."}]                 event       (server)
//! 42["final_result",{"documentation":"..","report":{..}}]   event       (server)
//! ```

use std::fmt::Display;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;
use url::Url;

use crate::error::{ProtocolError, TransportError};
use crate::types::{LogLevel, MissionReport};

pub const EVENT_START_AGENT: &str = "start_agent";
pub const EVENT_LOG: &str = "log";
pub const EVENT_FINAL_RESULT: &str = "final_result";

// Lifecycle pseudo-events raised by the transport itself
pub const EVENT_CONNECT: &str = "connect";
pub const EVENT_DISCONNECT: &str = "disconnect";
pub const EVENT_MALFORMED_FRAME: &str = "malformed_frame";

/// Names a server may not use for its own events
pub const RESERVED_EVENTS: [&str; 3] = [EVENT_CONNECT, EVENT_DISCONNECT, EVENT_MALFORMED_FRAME];

const ENGINE_PATH: &str = "/socket.io/";
const DEFAULT_NAMESPACE: &str = "/";

fn malformed(reason: impl Display) -> ProtocolError {
    ProtocolError::MalformedFrame(reason.to_string())
}

// ============ Endpoint ============

/// Where to open the WebSocket, and which namespace to join once there
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: Url,
    pub namespace: String,
}

impl Endpoint {
    /// Resolve a server URL the way Socket.IO clients do
    ///
    /// `http://host:8000` and `ws://host:8000` both map to
    /// `ws://host:8000/socket.io/?EIO=4&transport=websocket`. A path on the
    /// server URL names the namespace (`http://host/admin` joins `/admin`).
    pub fn parse(raw: &str) -> Result<Self, TransportError> {
        let invalid = || TransportError::InvalidEndpoint(raw.to_string());
        let mut url = Url::parse(raw.trim()).map_err(|_| invalid())?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            _ => return Err(invalid()),
        };
        if url.host_str().is_none() {
            return Err(invalid());
        }
        url.set_scheme(scheme).map_err(|_| invalid())?;

        let namespace = match url.path().trim_end_matches('/') {
            "" => DEFAULT_NAMESPACE.to_string(),
            path => path.to_string(),
        };

        url.set_path(ENGINE_PATH);
        url.set_fragment(None);
        url.query_pairs_mut()
            .append_pair("EIO", "4")
            .append_pair("transport", "websocket");

        Ok(Self { url, namespace })
    }
}

// ============ Engine.IO ============

/// Parameters the server announces in its `open` packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    /// Milliseconds between server pings
    pub ping_interval: u64,
    /// Milliseconds the server waits for our pong
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

impl Handshake {
    /// How long the server may stay silent before the connection is dead
    pub fn liveness(&self) -> Duration {
        Duration::from_millis(self.ping_interval.saturating_add(self.ping_timeout))
    }
}

/// One Engine.IO packet (one WebSocket text frame)
#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(Handshake),
    Close,
    Ping,
    Pong,
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let mut chars = text.chars();
        let kind = chars.next().ok_or_else(|| malformed("empty frame"))?;
        let body = chars.as_str();

        match kind {
            '0' => serde_json::from_str(body)
                .map(EnginePacket::Open)
                .map_err(|e| malformed(format!("bad open packet: {}", e))),
            '1' => Ok(EnginePacket::Close),
            // Transport-upgrade pings carry a body we don't need
            '2' => Ok(EnginePacket::Ping),
            '3' => Ok(EnginePacket::Pong),
            '4' => Ok(EnginePacket::Message(body.to_string())),
            '5' => Ok(EnginePacket::Upgrade),
            '6' => Ok(EnginePacket::Noop),
            other => Err(malformed(format!("unknown engine packet type {:?}", other))),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        Ok(match self {
            EnginePacket::Open(handshake) => format!("0{}", serde_json::to_string(handshake)?),
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping => "2".to_string(),
            EnginePacket::Pong => "3".to_string(),
            EnginePacket::Message(body) => format!("4{}", body),
            EnginePacket::Upgrade => "5".to_string(),
            EnginePacket::Noop => "6".to_string(),
        })
    }
}

// ============ Socket.IO ============

/// One Socket.IO packet, carried in an Engine.IO `message`
///
/// Binary packets are not part of this service's protocol and are rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect {
        namespace: String,
        data: Option<Value>,
    },
    Disconnect {
        namespace: String,
    },
    /// `data` is the first argument after the event name (`null` if none)
    Event {
        namespace: String,
        id: Option<u64>,
        name: String,
        data: Value,
    },
    Ack {
        namespace: String,
        id: u64,
        data: Value,
    },
    ConnectError {
        namespace: String,
        data: Value,
    },
}

impl SocketPacket {
    pub fn connect(namespace: &str) -> Self {
        SocketPacket::Connect {
            namespace: namespace.to_string(),
            data: None,
        }
    }

    pub fn event(namespace: &str, name: &str, data: Value) -> Self {
        SocketPacket::Event {
            namespace: namespace.to_string(),
            id: None,
            name: name.to_string(),
            data,
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            SocketPacket::Connect { namespace, .. }
            | SocketPacket::Disconnect { namespace }
            | SocketPacket::Event { namespace, .. }
            | SocketPacket::Ack { namespace, .. }
            | SocketPacket::ConnectError { namespace, .. } => namespace,
        }
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let kind = match text.as_bytes().first() {
            Some(b) if b.is_ascii_digit() => *b,
            _ => return Err(malformed(format!("bad socket packet: {:?}", text))),
        };
        if kind == b'5' || kind == b'6' {
            return Err(malformed("binary packets are not supported"));
        }

        let mut rest = &text[1..];
        let namespace = if rest.starts_with('/') {
            let (ns, tail) = rest.split_once(',').unwrap_or((rest, ""));
            rest = tail;
            ns.to_string()
        } else {
            DEFAULT_NAMESPACE.to_string()
        };

        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        let id = match digits {
            0 => None,
            n => Some(
                rest[..n]
                    .parse::<u64>()
                    .map_err(|e| malformed(format!("bad ack id: {}", e)))?,
            ),
        };
        rest = &rest[digits..];

        let data: Option<Value> = if rest.is_empty() {
            None
        } else {
            Some(serde_json::from_str(rest).map_err(|e| malformed(format!("bad packet body: {}", e)))?)
        };

        match kind {
            b'0' => Ok(SocketPacket::Connect { namespace, data }),
            b'1' => Ok(SocketPacket::Disconnect { namespace }),
            b'2' => {
                let Some(Value::Array(args)) = data else {
                    return Err(malformed("event packet without arguments"));
                };
                let mut args = args.into_iter();
                let name = match args.next() {
                    Some(Value::String(name)) if !name.is_empty() => name,
                    _ => return Err(malformed("event name is not a string")),
                };
                Ok(SocketPacket::Event {
                    namespace,
                    id,
                    name,
                    data: args.next().unwrap_or(Value::Null),
                })
            }
            b'3' => Ok(SocketPacket::Ack {
                namespace,
                id: id.ok_or_else(|| malformed("ack without id"))?,
                data: data.unwrap_or(Value::Null),
            }),
            b'4' => Ok(SocketPacket::ConnectError {
                namespace,
                data: data.unwrap_or(Value::Null),
            }),
            other => Err(malformed(format!("unknown socket packet type {}", other as char))),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let (kind, id, body) = match self {
            SocketPacket::Connect { data, .. } => {
                ('0', None, data.as_ref().map(serde_json::to_string).transpose()?)
            }
            SocketPacket::Disconnect { .. } => ('1', None, None),
            SocketPacket::Event { id, name, data, .. } => {
                let args = if data.is_null() {
                    json!([name])
                } else {
                    json!([name, data])
                };
                ('2', *id, Some(serde_json::to_string(&args)?))
            }
            SocketPacket::Ack { id, data, .. } => {
                ('3', Some(*id), Some(serde_json::to_string(&json!([data]))?))
            }
            SocketPacket::ConnectError { data, .. } => ('4', None, Some(serde_json::to_string(data)?)),
        };

        let mut out = String::new();
        out.push(kind);
        let namespace = self.namespace();
        if namespace != DEFAULT_NAMESPACE {
            out.push_str(namespace);
            out.push(',');
        }
        if let Some(id) = id {
            out.push_str(&id.to_string());
        }
        if let Some(body) = body {
            out.push_str(&body);
        }
        Ok(out)
    }

    /// Encode as a complete WebSocket text frame
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        EnginePacket::Message(self.encode()?).encode()
    }
}

// ============ Client → Server ============

/// Events the client emits
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    StartAgent { project_path: String },
}

#[derive(Serialize)]
struct StartAgentPayload<'a> {
    project_path: &'a str,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::StartAgent { .. } => EVENT_START_AGENT,
        }
    }

    pub fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            ClientEvent::StartAgent { project_path } => {
                serde_json::to_value(StartAgentPayload { project_path })
            }
        }
    }
}

// ============ Server → Client ============

/// `log` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPayload {
    pub level: String,
    pub message: String,
}

impl LogPayload {
    pub fn level(&self) -> LogLevel {
        LogLevel::parse(&self.level)
    }
}

/// `final_result` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalResultPayload {
    pub documentation: String,
    pub report: Option<MissionReport>,
}

#[derive(Deserialize)]
struct RawFinalResult {
    documentation: String,
    #[serde(default)]
    report: Option<Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawFeedback {
    One(String),
    Many(Vec<String>),
}

#[derive(Deserialize)]
struct RawReport {
    status: String,
    #[serde(default)]
    feedback: Option<RawFeedback>,
}

impl From<RawReport> for MissionReport {
    fn from(raw: RawReport) -> Self {
        let feedback = match raw.feedback {
            Some(RawFeedback::One(line)) if line.is_empty() => Vec::new(),
            Some(RawFeedback::One(line)) => vec![line],
            Some(RawFeedback::Many(lines)) => lines,
            None => Vec::new(),
        };
        MissionReport {
            status: raw.status,
            feedback,
        }
    }
}

/// Events the server emits that the session understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    Log(LogPayload),
    FinalResult(FinalResultPayload),
}

impl ServerEvent {
    /// Decode a named event; unknown names yield `Ok(None)`
    pub fn decode(event: &str, data: &Value) -> Result<Option<Self>, ProtocolError> {
        match event {
            EVENT_LOG => Ok(Some(ServerEvent::Log(payload(event, data)?))),
            EVENT_FINAL_RESULT => {
                let raw: RawFinalResult = payload(event, data)?;
                // A report we can't read never costs us the document
                let report = raw.report.filter(|v| !v.is_null()).and_then(|value| {
                    match serde_json::from_value::<RawReport>(value) {
                        Ok(report) => Some(report.into()),
                        Err(e) => {
                            warn!(error = %e, "Ignoring unreadable mission report");
                            None
                        }
                    }
                });
                Ok(Some(ServerEvent::FinalResult(FinalResultPayload {
                    documentation: raw.documentation,
                    report,
                })))
            }
            _ => Ok(None),
        }
    }
}

fn payload<T: DeserializeOwned>(event: &str, data: &Value) -> Result<T, ProtocolError> {
    T::deserialize(data).map_err(|e| ProtocolError::MalformedPayload {
        event: event.to_string(),
        reason: e.to_string(),
    })
}
