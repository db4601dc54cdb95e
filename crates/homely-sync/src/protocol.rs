//! # Realtime Wire Protocol
//!
//! Engine.IO v4 / Socket.IO v5 framing as spoken by the Homely realtime
//! server over a plain WebSocket.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Realtime Handshake                                 │
//! │                                                                         │
//! │  HANDSHAKE FLOW                                                        │
//! │  ──────────────                                                        │
//! │  server ───► 0{"sid":..,"pingInterval":..}     Engine.IO open          │
//! │  client ───► 40                                 Socket.IO connect       │
//! │  server ───► 40{"sid":..}                       subscribed (connected)  │
//! │          or  44{"message":..}                   connect error           │
//! │                                                                         │
//! │  EVENTS                                                                │
//! │  ──────                                                                │
//! │  server ───► 42["event",{"type":..,"data":..}]                         │
//! │                                                                         │
//! │  KEEPALIVE                                                             │
//! │  ─────────                                                             │
//! │  server ───► 2        client ───► 3                                    │
//! │                                                                         │
//! │  CLOSE                                                                 │
//! │  ─────                                                                 │
//! │  server ───► 1 (Engine.IO close) or 41 (namespace disconnect)          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use homely_core::LocationId;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::error::{SyncError, SyncResult};

/// Engine.IO protocol revision.
pub const ENGINE_IO_VERSION: u8 = 4;

/// Socket.IO event name carrying realtime events.
pub const EVENT_NAME: &str = "event";

// =============================================================================
// Engine.IO Frames
// =============================================================================

/// One Engine.IO text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Open(OpenPayload),
    Close,
    Ping(Option<String>),
    Pong(Option<String>),
    Message(Packet),
    Upgrade,
    Noop,
}

/// Engine.IO open handshake.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPayload {
    pub sid: String,

    #[serde(default)]
    pub upgrades: Vec<String>,

    /// Milliseconds between server pings.
    #[serde(default)]
    pub ping_interval: u64,

    /// Milliseconds the server waits for a pong.
    #[serde(default)]
    pub ping_timeout: u64,

    #[serde(default)]
    pub max_payload: Option<u64>,
}

impl Frame {
    /// Parses one text frame.
    pub fn parse(text: &str) -> SyncResult<Frame> {
        let mut chars = text.chars();
        let kind = chars
            .next()
            .ok_or_else(|| SyncError::UnexpectedFrame("empty frame".into()))?;
        let rest = chars.as_str();
        let data = (!rest.is_empty()).then(|| rest.to_string());

        match kind {
            '0' => Ok(Frame::Open(serde_json::from_str(rest)?)),
            '1' => Ok(Frame::Close),
            '2' => Ok(Frame::Ping(data)),
            '3' => Ok(Frame::Pong(data)),
            '4' => Ok(Frame::Message(Packet::parse(rest)?)),
            '5' => Ok(Frame::Upgrade),
            '6' => Ok(Frame::Noop),
            other => Err(SyncError::UnexpectedFrame(format!(
                "unknown Engine.IO packet type {:?}",
                other
            ))),
        }
    }

    /// Encodes the frame for sending.
    pub fn encode(&self) -> String {
        match self {
            Frame::Open(_) => "0".to_string(),
            Frame::Close => "1".to_string(),
            Frame::Ping(data) => format!("2{}", data.as_deref().unwrap_or("")),
            Frame::Pong(data) => format!("3{}", data.as_deref().unwrap_or("")),
            Frame::Message(packet) => format!("4{}", packet.encode()),
            Frame::Upgrade => "5".to_string(),
            Frame::Noop => "6".to_string(),
        }
    }

    /// Socket.IO connect to the default namespace (`40`).
    pub fn connect() -> Frame {
        Frame::Message(Packet::Connect(None))
    }
}

// =============================================================================
// Socket.IO Packets
// =============================================================================

/// A Socket.IO packet carried in an Engine.IO message frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(Option<Value>),
    Disconnect,
    Event { name: String, args: Vec<Value> },
    Ack { id: u64, args: Vec<Value> },
    ConnectError(Value),
}

impl Packet {
    fn parse(text: &str) -> SyncResult<Packet> {
        let mut chars = text.chars();
        let kind = chars
            .next()
            .ok_or_else(|| SyncError::UnexpectedFrame("empty Socket.IO packet".into()))?;
        let mut rest = chars.as_str();

        // Optional namespace: "/name,"
        if rest.starts_with('/') {
            rest = match rest.find(',') {
                Some(idx) => &rest[idx + 1..],
                None => "",
            };
        }

        // Optional ack id
        let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        let ack_id = if digits > 0 {
            rest[..digits].parse::<u64>().ok()
        } else {
            None
        };
        rest = &rest[digits..];

        let payload: Option<Value> = if rest.is_empty() {
            None
        } else {
            Some(serde_json::from_str(rest)?)
        };

        match kind {
            '0' => Ok(Packet::Connect(payload)),
            '1' => Ok(Packet::Disconnect),
            '2' => {
                let mut args = match payload {
                    Some(Value::Array(items)) => items,
                    other => {
                        return Err(SyncError::UnexpectedFrame(format!(
                            "event payload must be an array, got {:?}",
                            other
                        )))
                    }
                };
                if args.is_empty() {
                    return Err(SyncError::UnexpectedFrame("event without name".into()));
                }
                let name = match args.remove(0) {
                    Value::String(name) => name,
                    other => {
                        return Err(SyncError::UnexpectedFrame(format!(
                            "event name must be a string, got {}",
                            other
                        )))
                    }
                };
                Ok(Packet::Event { name, args })
            }
            '3' => {
                let args = match payload {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                };
                Ok(Packet::Ack {
                    id: ack_id.unwrap_or_default(),
                    args,
                })
            }
            '4' => Ok(Packet::ConnectError(payload.unwrap_or(Value::Null))),
            other => Err(SyncError::UnexpectedFrame(format!(
                "unsupported Socket.IO packet type {:?}",
                other
            ))),
        }
    }

    fn encode(&self) -> String {
        match self {
            Packet::Connect(None) => "0".to_string(),
            Packet::Connect(Some(data)) => format!("0{}", data),
            Packet::Disconnect => "1".to_string(),
            Packet::Event { name, args } => {
                let mut items = vec![Value::String(name.clone())];
                items.extend(args.iter().cloned());
                format!("2{}", Value::Array(items))
            }
            Packet::Ack { id, args } => format!("3{}{}", id, Value::Array(args.clone())),
            Packet::ConnectError(data) => format!("4{}", data),
        }
    }
}

// =============================================================================
// Connection URL
// =============================================================================

/// Builds the realtime URL for one location.
///
/// `https`/`http` base URLs are switched to `wss`/`ws`.
pub fn socket_url(ws_url: &str, location_id: LocationId, token: &str) -> SyncResult<Url> {
    let mut url = Url::parse(ws_url)?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(SyncError::InvalidUrl(format!(
                "unsupported realtime scheme: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SyncError::InvalidUrl(format!("cannot use scheme {} for {}", scheme, ws_url)))?;
    url.set_path("/socket.io/");

    let token: String = url::form_urlencoded::byte_serialize(token.as_bytes()).collect();
    url.set_query(Some(&format!(
        "EIO={}&transport=websocket&locationId={}&token=Bearer%20{}",
        ENGINE_IO_VERSION, location_id, token
    )));
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_open() {
        let frame = Frame::parse(
            r#"0{"sid":"lv_VI97HAXpY6yYWAAAC","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#,
        )
        .unwrap();
        match frame {
            Frame::Open(open) => {
                assert_eq!(open.sid, "lv_VI97HAXpY6yYWAAAC");
                assert_eq!(open.ping_interval, 25000);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_parse_keepalive_and_close() {
        assert_eq!(Frame::parse("2").unwrap(), Frame::Ping(None));
        assert_eq!(Frame::parse("3probe").unwrap(), Frame::Pong(Some("probe".into())));
        assert_eq!(Frame::parse("1").unwrap(), Frame::Close);
        assert_eq!(Frame::parse("41").unwrap(), Frame::Message(Packet::Disconnect));
        assert_eq!(Frame::Pong(None).encode(), "3");
    }

    #[test]
    fn test_parse_connect_results() {
        assert_eq!(
            Frame::parse(r#"40{"sid":"abc"}"#).unwrap(),
            Frame::Message(Packet::Connect(Some(json!({"sid": "abc"}))))
        );
        assert_eq!(
            Frame::parse(r#"44{"message":"Not authorized"}"#).unwrap(),
            Frame::Message(Packet::ConnectError(json!({"message": "Not authorized"})))
        );
        assert_eq!(Frame::connect().encode(), "40");
    }

    #[test]
    fn test_parse_event() {
        let frame = Frame::parse(
            r#"42["event",{"type":"alarm-state-changed","data":{"locationId":"x","state":"DISARMED"}}]"#,
        )
        .unwrap();
        match frame {
            Frame::Message(Packet::Event { name, args }) => {
                assert_eq!(name, "event");
                assert_eq!(args[0]["type"], "alarm-state-changed");
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        // Namespaced, with ack id
        let frame = Frame::parse(r#"42/homely,7["event",{}]"#).unwrap();
        assert!(matches!(frame, Frame::Message(Packet::Event { .. })));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(Frame::parse("").is_err());
        assert!(Frame::parse("9").is_err());
        assert!(Frame::parse("42{not json").is_err());
        assert!(Frame::parse(r#"42{"type":"x"}"#).is_err());
        assert!(Frame::parse("42[]").is_err());
    }

    #[test]
    fn test_event_round_trip() {
        let packet = Packet::Event {
            name: "event".into(),
            args: vec![json!({"type": "alarm-state-changed"})],
        };
        let encoded = Frame::Message(packet.clone()).encode();
        assert_eq!(encoded, r#"42["event",{"type":"alarm-state-changed"}]"#);
        assert_eq!(Frame::parse(&encoded).unwrap(), Frame::Message(packet));
    }

    #[test]
    fn test_socket_url() {
        let location: LocationId = "550e8400-e29b-41d4-a716-446655440100".parse().unwrap();
        let url = socket_url("https://sdk.iotiliti.cloud", location, "abc.def").unwrap();
        assert_eq!(
            url.as_str(),
            "wss://sdk.iotiliti.cloud/socket.io/?EIO=4&transport=websocket&locationId=550e8400-e29b-41d4-a716-446655440100&token=Bearer%20abc.def"
        );

        let url = socket_url("ws://127.0.0.1:9000", location, "t").unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.port(), Some(9000));

        assert!(socket_url("ftp://example.com", location, "t").is_err());
    }
}
