// Error taxonomy for the membership and orchestration engine.
//
// Mirrors the severity/propagation rules in spec §7: transient transport and
// decode errors never reach this type (they are logged and counted in place);
// what remains here is what a caller of a public operation can actually act on.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid node name {0:?}: must be 1-128 chars of [A-Za-z0-9.-]")]
    InvalidName(String),

    #[error("protocol version mismatch with {addr}: local accepts {local_min}..={local_max}, peer advertised {peer}")]
    ProtocolVersionMismatch {
        addr: String,
        local_min: u8,
        local_max: u8,
        peer: u8,
    },

    #[error("name conflict for {0:?}: existing member retained")]
    NameConflict(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("keyring error: {0}")]
    Keyring(String),

    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("join failed: {succeeded} of {attempted} peers reachable; causes: {causes:?}")]
    JoinFailed {
        attempted: usize,
        succeeded: usize,
        causes: Vec<(String, String)>,
    },

    #[error("shutdown already in progress")]
    ShuttingDown,

    #[error("snapshot corrupt at line {line}: {reason}")]
    SnapshotCorrupt { line: usize, reason: String },

    #[error("control protocol error: {0}")]
    Control(String),

    #[error("payload too large: {size} bytes exceeds limit {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("{0}")]
    Other(String),
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Encode(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

impl From<aes_gcm::Error> for Error {
    fn from(e: aes_gcm::Error) -> Self {
        Error::Encryption(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
