//! Gateway frame model.
//!
//! Every frame on the wire is a JSON object `{op, d, s, t}`. Inbound frames
//! are decoded into [`GatewayPayload`]; the session builds the outbound
//! control frames (IDENTIFY, RESUME, HEARTBEAT) from the typed bodies here.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

/// Gateway opcodes handled by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Dispatch = 0,
    Heartbeat = 1,
    Identify = 2,
    PresenceUpdate = 3,
    Resume = 6,
    Reconnect = 7,
    InvalidSession = 9,
    Hello = 10,
    HeartbeatAck = 11,
}

impl Opcode {
    pub fn from_u8(op: u8) -> Option<Self> {
        match op {
            0 => Some(Opcode::Dispatch),
            1 => Some(Opcode::Heartbeat),
            2 => Some(Opcode::Identify),
            3 => Some(Opcode::PresenceUpdate),
            6 => Some(Opcode::Resume),
            7 => Some(Opcode::Reconnect),
            9 => Some(Opcode::InvalidSession),
            10 => Some(Opcode::Hello),
            11 => Some(Opcode::HeartbeatAck),
            _ => None,
        }
    }
}

/// A raw gateway frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayPayload {
    /// Build a frame with the given opcode and body
    pub fn new(op: Opcode, d: Value) -> Self {
        Self {
            op: op as u8,
            d,
            s: None,
            t: None,
        }
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u8(self.op)
    }

    /// HEARTBEAT carrying the last sequence seen (or null)
    pub fn heartbeat(sequence: Option<u64>) -> Self {
        Self::new(Opcode::Heartbeat, json!(sequence))
    }

    pub fn identify(identify: &Identify) -> Self {
        Self::new(Opcode::Identify, json!(identify))
    }

    pub fn resume(resume: &Resume) -> Self {
        Self::new(Opcode::Resume, json!(resume))
    }

    /// Presence update, typically multicast to every shard
    pub fn presence_update(presence: Value) -> Self {
        Self::new(Opcode::PresenceUpdate, presence)
    }

    /// Decode a frame from a WebSocket message.
    ///
    /// Returns `None` for control messages (ping, pong, close).
    pub fn from_message(message: &Message) -> Option<Result<Self, serde_json::Error>> {
        match message {
            Message::Text(text) => Some(serde_json::from_str(text.as_str())),
            Message::Binary(data) => Some(serde_json::from_slice(data)),
            _ => None,
        }
    }

    pub fn to_message(&self) -> Result<Message, serde_json::Error> {
        serde_json::to_string(self).map(Message::text)
    }
}

/// Connection properties reported in IDENTIFY
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// IDENTIFY body
#[derive(Debug, Clone, Serialize)]
pub struct Identify {
    pub token: String,
    pub properties: IdentifyProperties,
    pub shard: [u32; 2],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intents: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<Value>,
}

/// RESUME body
#[derive(Debug, Clone, Serialize)]
pub struct Resume {
    pub token: String,
    pub session_id: String,
    pub seq: u64,
}

/// HELLO body
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Hello {
    /// Milliseconds between heartbeats
    pub heartbeat_interval: u64,
}

/// Fields extracted from the READY dispatch
#[derive(Debug, Clone, Deserialize)]
pub struct Ready {
    pub session_id: String,
    #[serde(default)]
    pub shard: Option<[u32; 2]>,
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
}

/// A frame queued for a shard, optionally tagged with the logical shard
/// it is meant for when several logical shards share one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundPayload {
    pub payload: GatewayPayload,
    pub shard_index: Option<u32>,
}

#[derive(Serialize)]
struct TaggedPayload<'a> {
    #[serde(flatten)]
    payload: &'a GatewayPayload,
    shard: u32,
}

impl OutboundPayload {
    pub fn new(payload: GatewayPayload) -> Self {
        Self {
            payload,
            shard_index: None,
        }
    }

    pub fn routed(payload: GatewayPayload, shard_index: u32) -> Self {
        Self {
            payload,
            shard_index: Some(shard_index),
        }
    }

    pub fn to_message(&self) -> Result<Message, serde_json::Error> {
        match self.shard_index {
            Some(shard) => serde_json::to_string(&TaggedPayload {
                payload: &self.payload,
                shard,
            })
            .map(Message::text),
            None => self.payload.to_message(),
        }
    }
}

/// How the session reacts to a close code sent by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseBehavior {
    /// Reconnect and resume the session
    Resume,
    /// Reconnect with a fresh identify
    Reconnect,
    /// Token rejected
    Authentication,
    /// Never reconnect
    Fatal,
}

impl CloseBehavior {
    pub fn from_code(code: u16) -> Self {
        match code {
            4004 => CloseBehavior::Authentication,
            // invalid shard, sharding required, invalid version, invalid or disallowed intents
            4010..=4014 => CloseBehavior::Fatal,
            4000..=4999 => CloseBehavior::Reconnect,
            _ => CloseBehavior::Resume,
        }
    }
}
