//! Real UDP+TCP transport. Grounded on the teacher's
//! `networking::transport::tcp::TcpConfig`/connection-setup shape (bind,
//! `TCP_NODELAY`, buffer sizing) generalized to also own the UDP packet
//! socket SWIM needs.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use socket2::{Domain, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use crate::error::{Error, Result};
use crate::transport::address::resolve_advertise_addr;
use crate::transport::{Conn, Packet, Transport};

pub struct NetTransportConfig {
    pub bind_addr: SocketAddr,
    pub advertise_addr: Option<SocketAddr>,
    pub udp_buffer_size: usize,
    pub tcp_timeout: Duration,
}

pub struct NetTransport {
    config: NetTransportConfig,
    udp: UdpSocket,
    tcp: TcpListener,
    closed: AtomicBool,
}

impl NetTransport {
    pub async fn bind(config: NetTransportConfig) -> Result<Self> {
        let udp_socket = Socket::new(Domain::for_address(config.bind_addr), Type::DGRAM, None)?;
        udp_socket.set_nonblocking(true)?;
        udp_socket.set_recv_buffer_size(config.udp_buffer_size)?;
        udp_socket.bind(&config.bind_addr.into())?;
        let udp = UdpSocket::from_std(udp_socket.into())?;

        let tcp = TcpListener::bind(config.bind_addr).await?;

        Ok(Self {
            config,
            udp,
            tcp,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Transport for NetTransport {
    fn final_advertise_addr(&self, configured: Option<SocketAddr>) -> Result<SocketAddr> {
        resolve_advertise_addr(
            self.config.bind_addr,
            configured.or(self.config.advertise_addr),
        )
    }

    async fn write_to(&self, buf: &[u8], addr: SocketAddr) -> Result<Instant> {
        let started = Instant::now();
        self.udp.send_to(buf, addr).await?;
        Ok(started)
    }

    async fn read_packet(&self) -> Result<Packet> {
        let mut buf = vec![0u8; self.config.udp_buffer_size];
        let (n, from) = self.udp.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok(Packet { buf, from })
    }

    async fn dial_timeout(&self, addr: SocketAddr, timeout: Duration) -> Result<Box<dyn Conn>> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout(timeout))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn accept_stream(&self) -> Result<(Box<dyn Conn>, SocketAddr)> {
        let (stream, addr) = self.tcp.accept().await?;
        stream.set_nodelay(true)?;
        Ok((Box::new(stream), addr))
    }

    async fn shutdown(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
