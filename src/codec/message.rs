// Message types and their on-wire bodies (spec §4.2). Field layout of each
// variant is encoded with MessagePack via `rmp-serde` — the teacher pulls in
// `rmp-serde` for exactly this purpose (`Cargo.toml`'s `rmp-serde = "1.1"`)
// and `src/networking/protocol/codec.rs` hand-rolls only the outer framing,
// leaving structured payloads to a real serializer, which is the split this
// module follows too.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::common::{LTime, Name};
use crate::error::{Error, Result};

/// Leading byte of every undecorated message, and of every envelope layer
/// (`Compress`, `Encrypt`, `HasCRC`) that wraps one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Ping = 0,
    IndirectPing = 1,
    AckResp = 2,
    Suspect = 3,
    Alive = 4,
    Dead = 5,
    PushPull = 6,
    Compound = 7,
    User = 8,
    Compress = 9,
    Encrypt = 10,
    NackResp = 11,
    HasCRC = 12,
    Join = 13,
    Leave = 14,
    UserEvent = 15,
    Query = 16,
    QueryResponse = 17,
    Relay = 18,
    KeyRequest = 19,
    KeyResponse = 20,
}

impl MessageType {
    pub fn from_byte(b: u8) -> Result<Self> {
        use MessageType::*;
        Ok(match b {
            0 => Ping,
            1 => IndirectPing,
            2 => AckResp,
            3 => Suspect,
            4 => Alive,
            5 => Dead,
            6 => PushPull,
            7 => Compound,
            8 => User,
            9 => Compress,
            10 => Encrypt,
            11 => NackResp,
            12 => HasCRC,
            13 => Join,
            14 => Leave,
            15 => UserEvent,
            16 => Query,
            17 => QueryResponse,
            18 => Relay,
            19 => KeyRequest,
            20 => KeyResponse,
            other => return Err(Error::Decode(format!("unknown message type {other}"))),
        })
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ping {
    pub seq_no: u32,
    pub node: Name,
    /// Set when this ping is itself relayed via TCP fallback, so the target
    /// knows where to send the nack/ack if it cannot reach us directly.
    pub source_addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndirectPing {
    pub seq_no: u32,
    pub target: SocketAddr,
    pub node: Name,
    pub nack: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AckResp {
    pub seq_no: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NackResp {
    pub seq_no: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Suspect {
    pub incarnation: u64,
    pub node: Name,
    pub from: Name,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alive {
    pub incarnation: u64,
    pub node: Name,
    pub addr: SocketAddr,
    pub meta: Vec<u8>,
    /// `(pmin, pmax, pcur, dmin, dmax, dcur)`, spec §3/§4.6.
    pub vsn: [u8; 6],
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dead {
    pub incarnation: u64,
    pub node: Name,
    pub from: Name,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushNodeState {
    pub name: Name,
    pub addr: SocketAddr,
    pub meta: Vec<u8>,
    pub incarnation: u64,
    pub state: crate::membership::NodeState,
    pub vsn: [u8; 6],
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushPull {
    pub nodes: Vec<PushNodeState>,
    /// Opaque orchestration-layer state blob (join/leave intents, LTimes).
    pub user_state: Vec<u8>,
    pub join: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Join {
    pub ltime: LTime,
    pub node: Name,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Leave {
    pub ltime: LTime,
    pub node: Name,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserEventMsg {
    pub ltime: LTime,
    pub name: String,
    pub payload: Vec<u8>,
    pub coalesce: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryFilter {
    pub node_names: Vec<String>,
    pub tags: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Query {
    pub ltime: LTime,
    pub id: u32,
    pub source_node: Name,
    pub source_addr: SocketAddr,
    pub filters: QueryFilter,
    pub relay_factor: u8,
    pub timeout_ms: u64,
    pub name: String,
    pub payload: Vec<u8>,
    pub request_ack: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryResponse {
    pub ltime: LTime,
    pub id: u32,
    pub from: Name,
    pub payload: Vec<u8>,
    pub ack: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Relay {
    pub dest: SocketAddr,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeyRequest {
    pub op: KeyOp,
    pub key: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum KeyOp {
    Install,
    Use,
    Remove,
    List,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeyResponse {
    pub result: bool,
    pub message: String,
    pub keys: Vec<Vec<u8>>,
    pub primary: Option<Vec<u8>>,
}

/// Serializes `value` with a leading type byte, ready to hand to the
/// envelope layer.
pub fn encode_message<T: Serialize>(ty: MessageType, value: &T) -> Result<Vec<u8>> {
    let mut buf = vec![ty.to_byte()];
    rmp_serde::encode::write(&mut buf, value)?;
    Ok(buf)
}

pub fn decode_message<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<(MessageType, T)> {
    if bytes.is_empty() {
        return Err(Error::Decode("empty message".into()));
    }
    let ty = MessageType::from_byte(bytes[0])?;
    let value = rmp_serde::from_slice(&bytes[1..])?;
    Ok((ty, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_round_trips() {
        let ping = Ping {
            seq_no: 7,
            node: Name::new("a").unwrap(),
            source_addr: None,
        };
        let encoded = encode_message(MessageType::Ping, &ping).unwrap();
        let (ty, decoded): (MessageType, Ping) = decode_message(&encoded).unwrap();
        assert_eq!(ty, MessageType::Ping);
        assert_eq!(decoded, ping);
    }
}
