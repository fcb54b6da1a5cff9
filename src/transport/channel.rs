//! In-memory transport for deterministic tests: a process-wide registry of
//! named endpoints wired together with `tokio::mpsc` channels instead of
//! real sockets, so integration tests can run many "nodes" in one process
//! without touching the loopback network stack.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::transport::{Conn, Packet, Transport};

type Registry = Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Packet>>>;
type StreamRegistry = Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<(DuplexStream, SocketAddr)>>>;

fn packet_registry() -> &'static Registry {
    static REG: OnceLock<Registry> = OnceLock::new();
    REG.get_or_init(|| Mutex::new(HashMap::new()))
}

fn stream_registry() -> &'static StreamRegistry {
    static REG: OnceLock<StreamRegistry> = OnceLock::new();
    REG.get_or_init(|| Mutex::new(HashMap::new()))
}

pub struct ChannelTransport {
    addr: SocketAddr,
    packet_rx: Mutex<mpsc::UnboundedReceiver<Packet>>,
    stream_rx: Mutex<mpsc::UnboundedReceiver<(DuplexStream, SocketAddr)>>,
}

impl ChannelTransport {
    /// Registers a new endpoint at `addr`. Panics if `addr` is already
    /// registered — tests should pick distinct loopback ports per node even
    /// though no real binding occurs.
    pub fn register(addr: SocketAddr) -> Arc<Self> {
        let (ptx, prx) = mpsc::unbounded_channel();
        let (stx, srx) = mpsc::unbounded_channel();
        {
            let mut packets = packet_registry().lock();
            assert!(
                packets.insert(addr, ptx).is_none(),
                "address already registered: {addr}"
            );
        }
        stream_registry().lock().insert(addr, stx);
        Arc::new(Self {
            addr,
            packet_rx: Mutex::new(prx),
            stream_rx: Mutex::new(srx),
        })
    }
}

impl Drop for ChannelTransport {
    fn drop(&mut self) {
        packet_registry().lock().remove(&self.addr);
        stream_registry().lock().remove(&self.addr);
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn final_advertise_addr(&self, configured: Option<SocketAddr>) -> Result<SocketAddr> {
        Ok(configured.unwrap_or(self.addr))
    }

    async fn write_to(&self, buf: &[u8], addr: SocketAddr) -> Result<Instant> {
        let started = Instant::now();
        let sender = packet_registry()
            .lock()
            .get(&addr)
            .cloned()
            .ok_or_else(|| Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "no such peer")))?;
        sender
            .send(Packet {
                buf: buf.to_vec(),
                from: self.addr,
            })
            .map_err(|_| Error::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer gone")))?;
        Ok(started)
    }

    async fn read_packet(&self) -> Result<Packet> {
        self.packet_rx
            .lock()
            .recv()
            .await
            .ok_or_else(|| Error::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed")))
    }

    async fn dial_timeout(&self, addr: SocketAddr, timeout: Duration) -> Result<Box<dyn Conn>> {
        let sender = stream_registry()
            .lock()
            .get(&addr)
            .cloned()
            .ok_or_else(|| Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "no such peer")))?;
        let (a, b) = tokio::io::duplex(64 * 1024);
        tokio::time::timeout(timeout, async {
            sender
                .send((b, self.addr))
                .map_err(|_| Error::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer gone")))
        })
        .await
        .map_err(|_| Error::Timeout(timeout))??;
        Ok(Box::new(a))
    }

    async fn accept_stream(&self) -> Result<(Box<dyn Conn>, SocketAddr)> {
        let (stream, from) = self
            .stream_rx
            .lock()
            .recv()
            .await
            .ok_or_else(|| Error::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed")))?;
        Ok((Box::new(stream), from))
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn packets_round_trip_between_two_endpoints() {
        let a_addr: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let b_addr: SocketAddr = "127.0.0.1:40002".parse().unwrap();
        let a = ChannelTransport::register(a_addr);
        let b = ChannelTransport::register(b_addr);

        a.write_to(b"hello", b_addr).await.unwrap();
        let pkt = b.read_packet().await.unwrap();
        assert_eq!(pkt.buf, b"hello");
        assert_eq!(pkt.from, a_addr);
    }

    #[tokio::test]
    async fn streams_connect_between_two_endpoints() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let a_addr: SocketAddr = "127.0.0.1:40011".parse().unwrap();
        let b_addr: SocketAddr = "127.0.0.1:40012".parse().unwrap();
        let a = ChannelTransport::register(a_addr);
        let b = ChannelTransport::register(b_addr);

        let accept = tokio::spawn(async move { b.accept_stream().await });
        let mut client = a.dial_timeout(b_addr, Duration::from_secs(1)).await.unwrap();
        let (mut server, from) = accept.await.unwrap().unwrap();
        assert_eq!(from, a_addr);

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
