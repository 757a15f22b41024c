//! Wire packets.
//!
//! All control traffic is JSON, tagged by `type`:
//!
//! - `call`: `{type, id, method: "unit.ver/method", args}`
//! - `callback`: `{type, id, result}` or `{type, id?, error: {code, message}}`
//! - `event`: `{type, name, data}` (bidirectional transports only)
//! - `stream`: `{type, id, name?, size?, status?}`

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

/// Exact payload of a keep-alive ping; answered with an empty object.
pub const PING: &[u8] = b"{}";

/// Largest integer a JavaScript peer can represent exactly.
pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

/// Correlation id carried by `call`, `callback` and `stream` packets.
///
/// Peers send either strings or numbers; the id is echoed back verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PacketId {
    /// Numeric id.
    Number(u64),
    /// String id (UUIDs in practice).
    Text(String),
}

impl PacketId {
    /// Whether the id is usable for correlation (`""` and `0` are not).
    pub fn is_present(&self) -> bool {
        match self {
            Self::Number(n) => *n != 0,
            Self::Text(s) => !s.is_empty(),
        }
    }

    fn from_value(value: &Value) -> Option<Self> {
        let id = match value {
            Value::String(s) => Self::Text(s.clone()),
            Value::Number(n) => Self::Number(n.as_u64()?),
            _ => return None,
        };
        id.is_present().then_some(id)
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for PacketId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for PacketId {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Error object nested under `error` in a failed `callback`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Numeric protocol code (HTTP-like).
    pub code: i64,
    /// Human-readable message.
    pub message: String,
}

/// An RPC invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallPacket {
    /// Correlation id.
    pub id: PacketId,
    /// `unit.version/method` or `unit/method`.
    pub method: String,
    /// Handler arguments.
    #[serde(default)]
    pub args: Value,
}

/// A call result or failure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallbackPacket {
    /// Correlation id of the call being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<PacketId>,
    /// Successful result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// A server-to-peer event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventPacket {
    /// Event name.
    pub name: String,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
}

/// Terminal status of a stream control packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    /// All data was sent.
    End,
    /// The sender aborted the stream.
    Terminate,
}

/// Stream announcement (no status) or terminal control packet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamPacket {
    /// Stream id, scoped to the connection.
    pub id: PacketId,
    /// Stream name (required on init).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Declared total size in bytes (required on init).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Number>,
    /// `end` or `terminate`; absent on init.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StreamStatus>,
}

impl StreamPacket {
    /// Announcement of a new stream.
    pub fn init(id: PacketId, name: &str, size: u64) -> Self {
        Self {
            id,
            name: Some(name.to_owned()),
            size: Some(Number::from(size)),
            status: None,
        }
    }

    /// Terminal packet for an existing stream.
    pub fn finish(id: PacketId, status: StreamStatus) -> Self {
        Self {
            id,
            name: None,
            size: None,
            status: Some(status),
        }
    }
}

/// Any packet, tagged by `type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Packet {
    /// RPC invocation.
    Call(CallPacket),
    /// RPC result or failure.
    Callback(CallbackPacket),
    /// Server-to-peer event.
    Event(EventPacket),
    /// Stream control.
    Stream(StreamPacket),
}

impl Packet {
    /// Successful `callback`.
    pub fn callback(id: PacketId, result: Value) -> Self {
        Self::Callback(CallbackPacket {
            id: Some(id),
            result: Some(result),
            error: None,
        })
    }

    /// Failed `callback`.
    pub fn error(id: Option<PacketId>, code: i64, message: impl Into<String>) -> Self {
        Self::Callback(CallbackPacket {
            id,
            result: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
            }),
        })
    }

    /// Server-to-peer `event`.
    pub fn event(name: &str, data: Value) -> Self {
        Self::Event(EventPacket {
            name: name.to_owned(),
            data,
        })
    }
}

/// Classification of a raw text payload.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    /// The exact two-byte `{}` keep-alive.
    Ping,
    /// A well-formed call.
    Call(CallPacket),
    /// A well-formed stream control packet.
    Stream(StreamPacket),
    /// Anything else; the reason is for logging only.
    Invalid(&'static str),
}

impl Inbound {
    /// Classify raw bytes received on a transport.
    ///
    /// A call needs `type`, `id` and `method`; a stream packet needs `type`
    /// and `id`. Other fields are checked later by the engine so that their
    /// violations map to stream errors rather than structure errors.
    pub fn parse(data: &[u8]) -> Self {
        if data == PING {
            return Self::Ping;
        }
        let Ok(Value::Object(packet)) = serde_json::from_slice::<Value>(data) else {
            return Self::Invalid("not a JSON object");
        };
        let Some(id) = packet.get("id").and_then(PacketId::from_value) else {
            return Self::Invalid("missing id");
        };
        match packet.get("type").and_then(Value::as_str) {
            Some("call") => {
                let Some(method) = packet
                    .get("method")
                    .and_then(Value::as_str)
                    .filter(|m| !m.is_empty())
                else {
                    return Self::Invalid("missing method");
                };
                Self::Call(CallPacket {
                    id,
                    method: method.to_owned(),
                    args: packet.get("args").cloned().unwrap_or(Value::Null),
                })
            }
            Some("stream") => {
                let status = match packet.get("status") {
                    None | Some(Value::Null) => None,
                    Some(value) => match StreamStatus::deserialize(value) {
                        Ok(status) => Some(status),
                        Err(_) => return Self::Invalid("unknown stream status"),
                    },
                };
                Self::Stream(StreamPacket {
                    id,
                    name: packet.get("name").and_then(Value::as_str).map(str::to_owned),
                    size: match packet.get("size") {
                        Some(Value::Number(size)) => Some(size.clone()),
                        _ => None,
                    },
                    status,
                })
            }
            _ => Self::Invalid("unsupported packet type"),
        }
    }
}

/// A `unit.version/method` target split into its parts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodPath<'a> {
    /// Unit (namespace) name.
    pub unit: &'a str,
    /// Unit version, `*` when omitted.
    pub version: &'a str,
    /// Method name within the unit.
    pub method: &'a str,
}

impl<'a> MethodPath<'a> {
    /// Wildcard version used when the caller does not pin one.
    pub const ANY_VERSION: &'static str = "*";

    /// Split `unit.ver/method`. A missing `/method` leaves the name empty;
    /// segments past the second `/` or `.` are ignored.
    pub fn parse(target: &'a str) -> Self {
        let mut parts = target.split('/');
        let unit_name = parts.next().unwrap_or_default();
        let method = parts.next().unwrap_or_default();
        let mut unit_parts = unit_name.split('.');
        let unit = unit_parts.next().unwrap_or_default();
        let version = unit_parts.next().unwrap_or(Self::ANY_VERSION);
        Self {
            unit,
            version,
            method,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ping_is_exact_match_only() {
        assert_eq!(Inbound::parse(b"{}"), Inbound::Ping);
        assert_eq!(Inbound::parse(b"{ }"), Inbound::Invalid("missing id"));
    }

    #[test]
    fn parse_call() {
        let raw = br#"{"type":"call","id":"abc","method":"test/hello","args":{"name":"Max"}}"#;
        let Inbound::Call(call) = Inbound::parse(raw) else {
            panic!("expected call");
        };
        assert_eq!(call.id, PacketId::from("abc"));
        assert_eq!(call.method, "test/hello");
        assert_eq!(call.args["name"], "Max");
    }

    #[test]
    fn parse_call_with_numeric_id() {
        let raw = br#"{"type":"call","id":7,"method":"a/b"}"#;
        let Inbound::Call(call) = Inbound::parse(raw) else {
            panic!("expected call");
        };
        assert_eq!(call.id, PacketId::Number(7));
        assert_eq!(call.args, Value::Null);
    }

    #[test]
    fn call_without_method_is_invalid() {
        let raw = br#"{"type":"call","id":"1"}"#;
        assert_eq!(Inbound::parse(raw), Inbound::Invalid("missing method"));
    }

    #[test]
    fn falsy_ids_are_invalid() {
        assert_eq!(
            Inbound::parse(br#"{"type":"call","id":"","method":"a/b"}"#),
            Inbound::Invalid("missing id")
        );
        assert_eq!(
            Inbound::parse(br#"{"type":"call","id":0,"method":"a/b"}"#),
            Inbound::Invalid("missing id")
        );
    }

    #[test]
    fn garbage_is_invalid() {
        assert_eq!(Inbound::parse(b"not json"), Inbound::Invalid("not a JSON object"));
        assert_eq!(Inbound::parse(b"[1,2]"), Inbound::Invalid("not a JSON object"));
    }

    #[test]
    fn unknown_type_is_invalid() {
        let raw = br#"{"type":"event","id":"1","name":"x"}"#;
        assert_eq!(Inbound::parse(raw), Inbound::Invalid("unsupported packet type"));
    }

    #[test]
    fn parse_stream_init_keeps_raw_fields() {
        let raw = br#"{"type":"stream","id":"s1","name":"photo.jpg","size":-5}"#;
        let Inbound::Stream(packet) = Inbound::parse(raw) else {
            panic!("expected stream");
        };
        assert_eq!(packet.name.as_deref(), Some("photo.jpg"));
        assert_eq!(packet.size.unwrap().as_i64(), Some(-5));
        assert!(packet.status.is_none());
    }

    #[test]
    fn parse_stream_status() {
        let raw = br#"{"type":"stream","id":"s1","status":"terminate"}"#;
        let Inbound::Stream(packet) = Inbound::parse(raw) else {
            panic!("expected stream");
        };
        assert_eq!(packet.status, Some(StreamStatus::Terminate));
        let raw = br#"{"type":"stream","id":"s1","status":"pause"}"#;
        assert_eq!(Inbound::parse(raw), Inbound::Invalid("unknown stream status"));
    }

    #[test]
    fn callback_serializes_in_wire_shape() {
        let packet = Packet::callback(PacketId::from("abc"), json!("Hello, Max"));
        let value = serde_json::to_value(&packet).unwrap();
        assert_eq!(
            value,
            json!({"type": "callback", "id": "abc", "result": "Hello, Max"})
        );
    }

    #[test]
    fn error_serializes_without_result() {
        let packet = Packet::error(None, 404, "Not Found");
        let value = serde_json::to_value(&packet).unwrap();
        assert_eq!(
            value,
            json!({"type": "callback", "error": {"code": 404, "message": "Not Found"}})
        );
    }

    #[test]
    fn stream_packets_serialize() {
        let init = Packet::Stream(StreamPacket::init(PacketId::from("s"), "a.bin", 10));
        assert_eq!(
            serde_json::to_value(&init).unwrap(),
            json!({"type": "stream", "id": "s", "name": "a.bin", "size": 10})
        );
        let end = Packet::Stream(StreamPacket::finish(PacketId::from("s"), StreamStatus::End));
        assert_eq!(
            serde_json::to_value(&end).unwrap(),
            json!({"type": "stream", "id": "s", "status": "end"})
        );
    }

    #[test]
    fn method_path_with_version() {
        let path = MethodPath::parse("auth.2/signin");
        assert_eq!(path.unit, "auth");
        assert_eq!(path.version, "2");
        assert_eq!(path.method, "signin");
    }

    #[test]
    fn method_path_defaults_version() {
        let path = MethodPath::parse("test/hello");
        assert_eq!(path.unit, "test");
        assert_eq!(path.version, MethodPath::ANY_VERSION);
        assert_eq!(path.method, "hello");
    }

    #[test]
    fn method_path_without_method() {
        let path = MethodPath::parse("lonely");
        assert_eq!(path.unit, "lonely");
        assert_eq!(path.method, "");
    }

    #[test]
    fn method_path_ignores_extra_segments() {
        let path = MethodPath::parse("files.1.3/upload/chunk");
        assert_eq!(path.unit, "files");
        assert_eq!(path.version, "1");
        assert_eq!(path.method, "upload");
    }
}
