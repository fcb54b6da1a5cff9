//! Packet/stream abstraction the membership layer runs over (spec §4.1).
//! Two implementations are provided: [`net::NetTransport`] over real UDP+TCP
//! sockets, and [`channel::ChannelTransport`] over in-memory `tokio::mpsc`
//! channels for deterministic tests — grounded on the teacher's split
//! between `networking::transport::tcp` (real sockets) and its test doubles.

pub mod address;
pub mod channel;
pub mod net;

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// One received UDP-equivalent packet.
#[derive(Debug, Clone)]
pub struct Packet {
    pub buf: Vec<u8>,
    pub from: SocketAddr,
}

/// A bidirectional byte stream, used for TCP fallback and push/pull.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

/// What the membership layer needs from the network (spec §4.1). Matches
/// memberlist's `Transport` interface shape: a packet-oriented send/receive
/// side plus a stream-oriented dial/accept side.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The address other nodes should be told to reach us at, after
    /// resolving `0.0.0.0`-style binds to a concrete routable address.
    fn final_advertise_addr(&self, configured: Option<SocketAddr>) -> Result<SocketAddr>;

    /// Sends one packet, returning the time the write started (used by
    /// callers measuring round-trip time from send rather than from call).
    async fn write_to(&self, buf: &[u8], addr: SocketAddr) -> Result<std::time::Instant>;

    /// Receives the next packet from any peer.
    async fn read_packet(&self) -> Result<Packet>;

    /// Opens a TCP-equivalent stream to `addr`, bounded by `timeout`.
    async fn dial_timeout(&self, addr: SocketAddr, timeout: Duration) -> Result<Box<dyn Conn>>;

    /// Accepts the next inbound stream connection.
    async fn accept_stream(&self) -> Result<(Box<dyn Conn>, SocketAddr)>;

    /// Stops accepting new I/O; in-flight operations are allowed to drain.
    async fn shutdown(&self) -> Result<()>;
}
