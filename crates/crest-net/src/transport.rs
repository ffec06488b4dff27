//! UDP sockets for beacon broadcast and inter-CH unicast.
//!
//! Sockets are created through socket2 so buffer sizes and address
//! reuse are configured before binding, then handed to tokio.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::CONTROL_PORT;

/// Transport configuration for one node.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Local bind address for the beacon socket.
    pub bind: SocketAddr,
    /// Where beacons are sent (a broadcast or multicast address).
    pub broadcast: SocketAddr,
    /// Local port for the inter-CH control socket.
    pub control_port: u16,
    /// Send buffer size in bytes.
    pub sndbuf: usize,
    /// Receive buffer size in bytes.
    pub rcvbuf: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:45000".parse().expect("static address"),
            broadcast: "255.255.255.255:45000".parse().expect("static address"),
            control_port: CONTROL_PORT,
            sndbuf: 1024 * 1024,
            rcvbuf: 1024 * 1024,
        }
    }
}

fn bind_udp(addr: SocketAddr, cfg: &TransportConfig, broadcast: bool) -> anyhow::Result<UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    socket.set_send_buffer_size(cfg.sndbuf)?;
    socket.set_recv_buffer_size(cfg.rcvbuf)?;
    socket.set_reuse_address(true)?;
    if broadcast {
        socket.set_broadcast(true)?;
    }

    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

/// The two sockets of one node.
pub struct UdpTransport {
    beacon: Arc<UdpSocket>,
    control: Arc<UdpSocket>,
    broadcast_to: SocketAddr,
    control_port: u16,
}

impl UdpTransport {
    pub async fn bind(cfg: TransportConfig) -> anyhow::Result<Self> {
        let beacon = bind_udp(cfg.bind, &cfg, true)?;
        let control_addr = SocketAddr::new(cfg.bind.ip(), cfg.control_port);
        let control = bind_udp(control_addr, &cfg, false)?;

        tracing::info!(
            beacon = %beacon.local_addr()?,
            control = %control.local_addr()?,
            "transport bound"
        );

        Ok(Self {
            beacon: Arc::new(beacon),
            control: Arc::new(control),
            broadcast_to: cfg.broadcast,
            control_port: cfg.control_port,
        })
    }

    /// Redirect beacons, e.g. at a peer's socket in loopback tests.
    pub fn set_broadcast(&mut self, addr: SocketAddr) {
        self.broadcast_to = addr;
    }

    /// Send one beacon carrier to the broadcast address.
    pub async fn send_broadcast(&self, data: &[u8]) -> anyhow::Result<()> {
        self.beacon.send_to(data, self.broadcast_to).await?;
        Ok(())
    }

    /// Send one control frame to a peer head's control port.
    pub async fn send_control(&self, peer: Ipv4Addr, data: &[u8]) -> anyhow::Result<()> {
        let addr = SocketAddr::new(peer.into(), self.control_port);
        self.control.send_to(data, addr).await?;
        Ok(())
    }

    pub async fn recv_beacon(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)> {
        Ok(self.beacon.recv_from(buf).await?)
    }

    pub async fn recv_control(&self, buf: &mut [u8]) -> anyhow::Result<(usize, SocketAddr)> {
        Ok(self.control.recv_from(buf).await?)
    }

    pub fn beacon_socket(&self) -> Arc<UdpSocket> {
        self.beacon.clone()
    }

    pub fn control_socket(&self) -> Arc<UdpSocket> {
        self.control.clone()
    }

    pub fn beacon_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.beacon.local_addr()?)
    }
}
