//! UDP audio transport: multicast sender/receiver plus unicast emission.
//!
//! The sender is bound to the host LAN interface with multicast loopback
//! disabled and TTL 1, so hub-originated streams never re-enter the hub's
//! own receiver and never cross a router. The receiver binds
//! `0.0.0.0:<port>` and joins the group on the resolved interface.
//!
//! Interface resolution is explicit: a configured `multicast_interface`
//! wins; otherwise the host IP is auto-detected. Detection failure is a
//! configuration error - joining on INADDR_ANY would silently pick the
//! wrong interface inside containers.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::error::{IntercomError, IntercomResult};
use crate::packet::AudioFrame;
use crate::protocol::{MAX_PACKET_SIZE, MULTICAST_TTL};

/// Resolves the LAN interface to bind multicast traffic to.
pub fn resolve_interface(configured: Option<Ipv4Addr>) -> IntercomResult<Ipv4Addr> {
    if let Some(iface) = configured {
        return Ok(iface);
    }
    match local_ip_address::local_ip() {
        Ok(IpAddr::V4(ip)) => Ok(ip),
        Ok(IpAddr::V6(ip)) => Err(IntercomError::Configuration(format!(
            "detected IPv6 host address {}; set multicast_interface explicitly",
            ip
        ))),
        Err(e) => Err(IntercomError::Configuration(format!(
            "could not detect host interface ({}); set multicast_interface explicitly",
            e
        ))),
    }
}

fn new_udp_socket() -> std::io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

// ─────────────────────────────────────────────────────────────────────────────
// Sender
// ─────────────────────────────────────────────────────────────────────────────

/// Multicast + unicast audio sender bound to the host LAN interface.
pub struct MulticastSender {
    socket: UdpSocket,
    group: SocketAddrV4,
}

impl MulticastSender {
    /// Binds the TX socket. `IP_MULTICAST_LOOP` is cleared and TTL forced
    /// to 1; both are invariants of the system, not tunables.
    pub fn new(group: Ipv4Addr, port: u16, iface: Ipv4Addr) -> IntercomResult<Self> {
        let socket = new_udp_socket().map_err(IntercomError::TransportBind)?;
        socket
            .set_multicast_if_v4(&iface)
            .map_err(IntercomError::TransportBind)?;
        socket
            .set_multicast_loop_v4(false)
            .map_err(IntercomError::TransportBind)?;
        socket
            .set_multicast_ttl_v4(MULTICAST_TTL)
            .map_err(IntercomError::TransportBind)?;
        socket
            .bind(&SocketAddr::new(IpAddr::V4(iface), 0).into())
            .map_err(IntercomError::TransportBind)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).map_err(IntercomError::TransportBind)?;

        log::info!(
            "[Transport] TX bound on {} for group {}:{} (loop=0, ttl={})",
            iface,
            group,
            port,
            MULTICAST_TTL
        );
        Ok(Self {
            socket,
            group: SocketAddrV4::new(group, port),
        })
    }

    /// Sends a frame to the multicast group. Soft failure.
    pub async fn send_multicast(&self, frame: &AudioFrame) -> IntercomResult<()> {
        self.send_raw_multicast(&frame.serialize()).await
    }

    /// Sends already-serialized packet bytes to the group unchanged
    /// (node-to-node traffic is never re-encoded).
    pub async fn send_raw_multicast(&self, packet: &[u8]) -> IntercomResult<()> {
        self.socket
            .send_to(packet, SocketAddr::V4(self.group))
            .await
            .map(|_| ())
            .map_err(IntercomError::Send)
    }

    /// Sends packet bytes to a single node's address on the audio port.
    pub async fn send_unicast(&self, packet: &[u8], addr: SocketAddr) -> IntercomResult<()> {
        self.socket
            .send_to(packet, addr)
            .await
            .map(|_| ())
            .map_err(IntercomError::Send)
    }

    /// The audio port every node listens on.
    pub fn port(&self) -> u16 {
        self.group.port()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Receiver
// ─────────────────────────────────────────────────────────────────────────────

/// Multicast audio receiver joined to the group on the LAN interface.
pub struct MulticastReceiver {
    socket: UdpSocket,
}

impl MulticastReceiver {
    /// Binds `0.0.0.0:<port>` and joins the group on `iface`.
    ///
    /// `SO_REUSEADDR` allows rapid restarts while a previous socket is
    /// still in TIME_WAIT-like teardown.
    pub fn new(group: Ipv4Addr, port: u16, iface: Ipv4Addr) -> IntercomResult<Self> {
        let socket = new_udp_socket().map_err(IntercomError::TransportBind)?;
        socket
            .set_reuse_address(true)
            .map_err(IntercomError::TransportBind)?;
        socket
            .bind(&SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port).into())
            .map_err(IntercomError::TransportBind)?;
        socket
            .join_multicast_v4(&group, &iface)
            .map_err(IntercomError::GroupJoin)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).map_err(IntercomError::TransportBind)?;

        log::info!(
            "[Transport] RX bound on 0.0.0.0:{}, joined {} via {}",
            port,
            group,
            iface
        );
        Ok(Self { socket })
    }

    /// Receives one datagram. Soft failure: callers log, back off on
    /// sustained errors, and keep the loop alive.
    pub async fn recv(&self) -> IntercomResult<(Vec<u8>, SocketAddr)> {
        let mut buf = [0u8; MAX_PACKET_SIZE * 2];
        let (len, addr) = self
            .socket
            .recv_from(&mut buf)
            .await
            .map_err(IntercomError::Recv)?;
        Ok((buf[..len].to_vec(), addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{DeviceId, Priority};
    use bytes::Bytes;

    fn loopback_pair() -> Option<(MulticastSender, MulticastReceiver)> {
        // Loopback-scoped group on an ephemeral-ish port; skip when the
        // environment has no multicast-capable loopback.
        let group = Ipv4Addr::new(239, 255, 0, 101);
        let iface = Ipv4Addr::LOCALHOST;
        let port = 45005;
        let tx = MulticastSender::new(group, port, iface).ok()?;
        let rx = MulticastReceiver::new(group, port, iface).ok()?;
        Some((tx, rx))
    }

    #[test]
    fn explicit_interface_wins_resolution() {
        let iface = Ipv4Addr::new(192, 168, 7, 4);
        assert_eq!(resolve_interface(Some(iface)).unwrap(), iface);
    }

    #[tokio::test]
    async fn hub_never_receives_its_own_multicast() {
        let Some((tx, rx)) = loopback_pair() else {
            return;
        };
        let frame = AudioFrame::new(
            DeviceId([1; 8]),
            1,
            Priority::Normal,
            Bytes::from_static(&[0x55; 20]),
        );
        tx.send_multicast(&frame).await.unwrap();
        // With IP_MULTICAST_LOOP=0 our own receiver must stay silent.
        let got =
            tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv()).await;
        assert!(got.is_err(), "self-sent frame looped back to the hub");
    }

    #[tokio::test]
    async fn unicast_reaches_a_plain_socket() {
        let Some((tx, _rx)) = loopback_pair() else {
            return;
        };
        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = peer.local_addr().unwrap();
        let frame = AudioFrame::new(
            DeviceId([2; 8]),
            9,
            Priority::High,
            Bytes::from_static(&[0xaa; 16]),
        );
        tx.send_unicast(&frame.serialize(), addr).await.unwrap();

        let mut buf = [0u8; MAX_PACKET_SIZE];
        let (len, _) = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            peer.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        let parsed = AudioFrame::parse(&buf[..len]).unwrap();
        assert_eq!(parsed.frame, frame);
    }
}
