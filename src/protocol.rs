//! Socket.IO protocol v5 / Engine.IO v4 framing.
//!
//! This implements the wire format described in
//! <https://github.com/socketio/socket.io-protocol>: an Engine.IO packet is a
//! single type digit followed by an opaque body; a MESSAGE body is a Socket.IO
//! packet `<type-digit>[namespace,][ack-id][json payload]`.
//!
//! Everything in this module is pure: no I/O, no shared state apart from the
//! [`AckTracker`] used by server-initiated acknowledgements.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;
use tokio::sync::{oneshot, Mutex};

use crate::config::SocketIoConfig;
use crate::error::SocketIoError;

/// Engine.IO packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePacketType {
    Open = 0,    // Sent from server immediately after the upgrade
    Close = 1,   // Request closing of the transport
    Ping = 2,    // Keep-alive probe (server-originated here)
    Pong = 3,    // Keep-alive reply
    Message = 4, // Carries a Socket.IO packet
    Upgrade = 5, // Transport upgrade marker
    Noop = 6,    // Forces a packet flush
}

impl EnginePacketType {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '0' => Some(Self::Open),
            '1' => Some(Self::Close),
            '2' => Some(Self::Ping),
            '3' => Some(Self::Pong),
            '4' => Some(Self::Message),
            '5' => Some(Self::Upgrade),
            '6' => Some(Self::Noop),
            _ => None,
        }
    }

    pub fn to_char(self) -> char {
        (b'0' + self as u8) as char
    }
}

/// Socket.IO packet types, carried inside Engine.IO MESSAGE packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketPacketType {
    Connect = 0,
    Disconnect = 1,
    Event = 2,
    Ack = 3,
    ConnectError = 4,
    BinaryEvent = 5,
    BinaryAck = 6,
}

impl SocketPacketType {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '0' => Some(Self::Connect),
            '1' => Some(Self::Disconnect),
            '2' => Some(Self::Event),
            '3' => Some(Self::Ack),
            '4' => Some(Self::ConnectError),
            '5' => Some(Self::BinaryEvent),
            '6' => Some(Self::BinaryAck),
            _ => None,
        }
    }

    pub fn to_char(self) -> char {
        (b'0' + self as u8) as char
    }
}

/// An Engine.IO packet: a type digit plus an opaque text body.
#[derive(Debug, Clone)]
pub struct EnginePacket {
    pub packet_type: EnginePacketType,
    pub data: String,
}

impl EnginePacket {
    pub fn new(packet_type: EnginePacketType, data: String) -> Self {
        Self { packet_type, data }
    }

    /// The OPEN handshake sent right after the upgrade, advertising the
    /// session id and the keep-alive parameters in milliseconds.
    pub fn open(sid: &str, config: &SocketIoConfig) -> Self {
        let body = serde_json::json!({
            "sid": sid,
            "upgrades": ["websocket"],
            "pingInterval": config.ping_interval.as_millis() as u64,
            "pingTimeout": config.ping_timeout.as_millis() as u64,
            "maxPayload": config.max_payload,
        });
        Self::new(EnginePacketType::Open, body.to_string())
    }

    pub fn message(data: String) -> Self {
        Self::new(EnginePacketType::Message, data)
    }

    pub fn ping() -> Self {
        Self::new(EnginePacketType::Ping, String::new())
    }

    /// Encode to the text form sent over a WebSocket text frame.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(1 + self.data.len());
        out.push(self.packet_type.to_char());
        out.push_str(&self.data);
        out
    }

    pub fn decode(s: &str) -> Result<Self, SocketIoError> {
        let mut chars = s.chars();
        let packet_type = chars
            .next()
            .and_then(EnginePacketType::from_char)
            .ok_or(SocketIoError::MalformedFrame("missing engine packet type"))?;
        Ok(Self {
            packet_type,
            data: chars.as_str().to_string(),
        })
    }
}

/// A Socket.IO packet.
///
/// `namespace` is `/` for the root namespace; `id` is the acknowledgement id
/// when the packet participates in a request/ack exchange; `data` is the JSON
/// payload root (an array for EVENT/ACK, an object for CONNECT and
/// CONNECT_ERROR).
#[derive(Debug, Clone, PartialEq)]
pub struct SocketPacket {
    pub packet_type: SocketPacketType,
    pub namespace: String,
    pub id: Option<u64>,
    pub data: Option<JsonValue>,
}

impl SocketPacket {
    /// Server CONNECT acknowledgement carrying the session id.
    pub fn connect(namespace: &str, sid: &str) -> Self {
        Self {
            packet_type: SocketPacketType::Connect,
            namespace: namespace.to_string(),
            id: None,
            data: Some(serde_json::json!({ "sid": sid })),
        }
    }

    /// CONNECT_ERROR with a `{message}` body (invalid namespace, failed
    /// authentication).
    pub fn connect_error(namespace: &str, message: &str) -> Self {
        Self {
            packet_type: SocketPacketType::ConnectError,
            namespace: namespace.to_string(),
            id: None,
            data: Some(serde_json::json!({ "message": message })),
        }
    }

    pub fn disconnect(namespace: &str) -> Self {
        Self {
            packet_type: SocketPacketType::Disconnect,
            namespace: namespace.to_string(),
            id: None,
            data: None,
        }
    }

    /// EVENT whose payload array is `[event, ...args]`.
    pub fn event(namespace: &str, event: &str, args: Vec<JsonValue>) -> Self {
        let mut body = Vec::with_capacity(1 + args.len());
        body.push(JsonValue::String(event.to_string()));
        body.extend(args);
        Self {
            packet_type: SocketPacketType::Event,
            namespace: namespace.to_string(),
            id: None,
            data: Some(JsonValue::Array(body)),
        }
    }

    /// EVENT expecting an acknowledgement under `ack_id`.
    pub fn event_with_ack(namespace: &str, event: &str, args: Vec<JsonValue>, ack_id: u64) -> Self {
        let mut packet = Self::event(namespace, event, args);
        packet.id = Some(ack_id);
        packet
    }

    /// ACK reply. The payload carries the arguments only; there is no
    /// event-name slot in an acknowledgement body.
    pub fn ack(namespace: &str, id: u64, args: Vec<JsonValue>) -> Self {
        Self {
            packet_type: SocketPacketType::Ack,
            namespace: namespace.to_string(),
            id: Some(id),
            data: Some(JsonValue::Array(args)),
        }
    }

    /// Encode to `<type>[namespace,][id][payload]`.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push(self.packet_type.to_char());
        if self.namespace != "/" {
            out.push_str(&self.namespace);
            out.push(',');
        }
        if let Some(id) = self.id {
            out.push_str(&id.to_string());
        }
        if let Some(data) = &self.data {
            out.push_str(&data.to_string());
        }
        out
    }

    /// Decode the body of an Engine.IO MESSAGE packet.
    ///
    /// The split relies on the payload root always being a JSON array or
    /// object: the earliest `{` or `[` in the frame anchors the payload, the
    /// last comma before it terminates the namespace, and the digit run
    /// between the two is the ack id. A bare-scalar payload would defeat the
    /// anchor, but no supported packet type produces one.
    pub fn decode(s: &str) -> Result<Self, SocketIoError> {
        let mut chars = s.chars();
        let packet_type = chars
            .next()
            .and_then(SocketPacketType::from_char)
            .ok_or(SocketIoError::MalformedFrame("missing socket packet type"))?;
        let body = chars.as_str();

        let payload_pos = body.find(['{', '[']);
        let head = &body[..payload_pos.unwrap_or(body.len())];

        let (namespace, id_digits) = match head.rfind(',') {
            Some(c) => (&head[..c], &head[c + 1..]),
            None => ("", head),
        };
        let namespace = if namespace.is_empty() {
            "/".to_string()
        } else {
            namespace.to_string()
        };

        let id = if !id_digits.is_empty() && id_digits.bytes().all(|b| b.is_ascii_digit()) {
            id_digits.parse::<u64>().ok()
        } else {
            None
        };

        let data = match payload_pos {
            Some(p) => Some(
                serde_json::from_str(&body[p..])
                    .map_err(|_| SocketIoError::MalformedFrame("unparseable payload"))?,
            ),
            None => None,
        };

        Ok(Self {
            packet_type,
            namespace,
            id,
            data,
        })
    }

    /// Encode and wrap into an Engine.IO MESSAGE frame.
    pub fn encode_frame(&self) -> String {
        EnginePacket::message(self.encode()).encode()
    }
}

struct PendingAck {
    tx: oneshot::Sender<Vec<JsonValue>>,
    created_at: Instant,
}

/// Tracker for server-initiated acknowledgements.
///
/// `emit_with_ack` registers a pending entry under a monotonically increasing
/// id; the matching inbound ACK frame resolves it. Entries the client never
/// answers are swept by the supervisor tick.
pub struct AckTracker {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingAck>>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn next_ack_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub async fn register(&self, id: u64) -> oneshot::Receiver<Vec<JsonValue>> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().await;
        pending.insert(
            id,
            PendingAck {
                tx,
                created_at: Instant::now(),
            },
        );
        rx
    }

    /// Resolve a pending acknowledgement. Returns `false` for unknown ids.
    pub async fn resolve(&self, id: u64, args: Vec<JsonValue>) -> bool {
        let mut pending = self.pending.lock().await;
        match pending.remove(&id) {
            Some(ack) => ack.tx.send(args).is_ok(),
            None => false,
        }
    }

    /// Drop a registration that never made it onto the wire.
    pub async fn forget(&self, id: u64) {
        self.pending.lock().await.remove(&id);
    }

    /// Drop entries older than `ttl`; their receivers observe a closed
    /// channel and report [`SocketIoError::AckTimeout`].
    pub async fn sweep_expired(&self, ttl: Duration) {
        let now = Instant::now();
        let mut pending = self.pending.lock().await;
        pending.retain(|_, ack| now.duration_since(ack.created_at) < ttl);
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_packet_round_trip() {
        let packet = EnginePacket::message("2[\"chat\",\"hi\"]".to_string());
        let encoded = packet.encode();
        assert_eq!(encoded, "42[\"chat\",\"hi\"]");

        let decoded = EnginePacket::decode(&encoded).unwrap();
        assert_eq!(decoded.packet_type, EnginePacketType::Message);
        assert_eq!(decoded.data, "2[\"chat\",\"hi\"]");
    }

    #[test]
    fn open_packet_advertises_config() {
        let config = SocketIoConfig::default();
        let packet = EnginePacket::open("abc-123", &config);
        let encoded = packet.encode();
        assert!(encoded.starts_with('0'));

        let body: JsonValue = serde_json::from_str(&encoded[1..]).unwrap();
        assert_eq!(body["sid"], "abc-123");
        assert_eq!(body["upgrades"], serde_json::json!(["websocket"]));
        assert_eq!(body["pingInterval"], 25_000);
        assert_eq!(body["pingTimeout"], 25_000);
        assert_eq!(body["maxPayload"], 1_000_000);
    }

    #[test]
    fn event_round_trip_all_shapes() {
        for namespace in ["/", "/hello"] {
            for id in [None, Some(7u64)] {
                for arg_count in 0..=3 {
                    let args: Vec<JsonValue> = (0..arg_count)
                        .map(|i| serde_json::json!(format!("arg{i}")))
                        .collect();
                    let mut packet = SocketPacket::event(namespace, "chat message", args);
                    packet.id = id;

                    let decoded = SocketPacket::decode(&packet.encode()).unwrap();
                    assert_eq!(decoded, packet);
                }
            }
        }
    }

    #[test]
    fn decode_event_with_namespace_and_ack() {
        let packet = SocketPacket::decode("2/hello,7[\"chat message\",\"hi\"]").unwrap();
        assert_eq!(packet.packet_type, SocketPacketType::Event);
        assert_eq!(packet.namespace, "/hello");
        assert_eq!(packet.id, Some(7));
        assert_eq!(packet.data, Some(serde_json::json!(["chat message", "hi"])));
    }

    #[test]
    fn decode_multi_digit_ack_id() {
        let packet = SocketPacket::decode("2/n,137[\"q\"]").unwrap();
        assert_eq!(packet.namespace, "/n");
        assert_eq!(packet.id, Some(137));
    }

    #[test]
    fn decode_ack_without_namespace() {
        let packet = SocketPacket::decode("27[\"x\"]").unwrap();
        assert_eq!(packet.namespace, "/");
        assert_eq!(packet.id, Some(7));
    }

    #[test]
    fn decode_event_with_zero_args() {
        let packet = SocketPacket::decode("2[\"ping\"]").unwrap();
        assert_eq!(packet.namespace, "/");
        assert_eq!(packet.id, None);
        assert_eq!(packet.data, Some(serde_json::json!(["ping"])));
    }

    #[test]
    fn decode_connect_without_body() {
        let packet = SocketPacket::decode("0").unwrap();
        assert_eq!(packet.packet_type, SocketPacketType::Connect);
        assert_eq!(packet.namespace, "/");
        assert_eq!(packet.id, None);
        assert_eq!(packet.data, None);
    }

    #[test]
    fn decode_disconnect_with_namespace() {
        let packet = SocketPacket::decode("1/hello,").unwrap();
        assert_eq!(packet.packet_type, SocketPacketType::Disconnect);
        assert_eq!(packet.namespace, "/hello");
        assert_eq!(packet.id, None);
    }

    #[test]
    fn closest_comma_before_payload_delimits_namespace() {
        // Namespaces containing commas are unsupported; the last comma before
        // the payload root wins, so the trailing segment parses as an ack id
        // when it is all digits and the rest becomes the namespace.
        let packet = SocketPacket::decode("2/a,b,7[\"x\"]").unwrap();
        assert_eq!(packet.namespace, "/a,b");
        assert_eq!(packet.id, Some(7));
    }

    #[test]
    fn braces_inside_strings_do_not_shift_the_anchor() {
        let packet = SocketPacket::decode("2[\"msg\",\"a{b[c\"]").unwrap();
        assert_eq!(packet.namespace, "/");
        assert_eq!(packet.data, Some(serde_json::json!(["msg", "a{b[c"])));
    }

    #[test]
    fn connect_ack_wire_format() {
        let packet = SocketPacket::connect("/", "X");
        assert_eq!(packet.encode_frame(), "40{\"sid\":\"X\"}");

        let packet = SocketPacket::connect("/hello", "X");
        assert_eq!(packet.encode_frame(), "40/hello,{\"sid\":\"X\"}");
    }

    #[test]
    fn ack_body_has_no_event_name_slot() {
        let packet = SocketPacket::ack("/hello", 5, vec![serde_json::json!("r")]);
        assert_eq!(packet.encode_frame(), "43/hello,5[\"r\"]");
    }

    #[test]
    fn connect_error_wire_format() {
        let packet = SocketPacket::connect_error("/hello", "Invalid namespace");
        assert_eq!(
            packet.encode_frame(),
            "44/hello,{\"message\":\"Invalid namespace\"}"
        );
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(SocketPacket::decode("").is_err());
        assert!(SocketPacket::decode("9[\"x\"]").is_err());
        assert!(SocketPacket::decode("2[not json").is_err());
        assert!(EnginePacket::decode("").is_err());
    }

    #[tokio::test]
    async fn ack_tracker_resolves_pending() {
        let tracker = AckTracker::new();
        let id = tracker.next_ack_id();
        let rx = tracker.register(id).await;

        assert!(tracker.resolve(id, vec![serde_json::json!("ok")]).await);
        assert_eq!(rx.await.unwrap(), vec![serde_json::json!("ok")]);

        assert!(!tracker.resolve(id, vec![]).await);
    }

    #[tokio::test]
    async fn ack_tracker_sweeps_expired() {
        let tracker = AckTracker::new();
        let id = tracker.next_ack_id();
        let rx = tracker.register(id).await;
        assert_eq!(tracker.pending_count().await, 1);

        tracker.sweep_expired(Duration::ZERO).await;
        assert_eq!(tracker.pending_count().await, 0);
        assert!(rx.await.is_err());
    }
}
