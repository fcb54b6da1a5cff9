//! Control-protocol wire format (spec §4.10/§6): MessagePack-encoded request
//! and response objects, each prefixed with a big-endian `u32` byte length so
//! an async reader can frame them without driving a blocking MessagePack
//! stream decoder. Grounded in the teacher's `networking/protocol/handshake.rs`
//! version-negotiation shape and the `rmp-serde` dependency already used for
//! gossip payloads.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

pub const PROTOCOL_VERSION: u32 = 1;

/// Largest single frame this server will read, guarding against a
/// misbehaving client claiming an enormous length prefix.
const MAX_FRAME: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestHeader {
    #[serde(rename = "Command")]
    pub command: String,
    #[serde(rename = "Seq")]
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseHeader {
    #[serde(rename = "Seq")]
    pub seq: u64,
    #[serde(rename = "Error")]
    pub error: String,
}

impl ResponseHeader {
    pub fn ok(seq: u64) -> Self {
        Self {
            seq,
            error: String::new(),
        }
    }

    pub fn err(seq: u64, message: impl Into<String>) -> Self {
        Self {
            seq,
            error: message.into(),
        }
    }
}

pub const ERR_HANDSHAKE_REQUIRED: &str = "handshake required";
pub const ERR_AUTH_REQUIRED: &str = "auth required";
pub const ERR_INVALID_AUTH: &str = "invalid auth token";
pub const ERR_UNSUPPORTED_COMMAND: &str = "unsupported command";
pub const ERR_DUPLICATE_HANDSHAKE: &str = "duplicate handshake";

/// Reads one length-prefixed MessagePack frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let len = reader.read_u32().await.map_err(Error::Io)? as usize;
    if len > MAX_FRAME {
        return Err(Error::Control(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME} byte limit"
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(Error::Io)?;
    Ok(buf)
}

/// Writes one length-prefixed MessagePack frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> Result<()> {
    writer.write_u32(bytes.len() as u32).await.map_err(Error::Io)?;
    writer.write_all(bytes).await.map_err(Error::Io)?;
    Ok(())
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(value).map_err(Error::from)
}

pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    rmp_serde::from_slice(bytes).map_err(Error::from)
}
