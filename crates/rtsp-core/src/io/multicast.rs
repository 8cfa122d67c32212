//! Multicast write path.
//!
//! One handler per media per stream: packets written to the stream are
//! sent once to the group regardless of how many readers joined it. The
//! group is joined on every multicast-capable interface so that
//! membership reaches each attached segment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::trace;

use crate::error::{Error, Result};

/// TTL used for outgoing multicast packets.
pub const MULTICAST_TTL: u32 = 127;

/// IPv4 addresses of the local interfaces that are up and
/// multicast-capable.
#[cfg(unix)]
fn multicast_capable_interfaces() -> Vec<Ipv4Addr> {
    use nix::ifaddrs::getifaddrs;
    use nix::net::if_::InterfaceFlags;

    let Ok(addrs) = getifaddrs() else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for ifaddr in addrs {
        if !ifaddr.flags.contains(InterfaceFlags::IFF_UP)
            || !ifaddr.flags.contains(InterfaceFlags::IFF_MULTICAST)
        {
            continue;
        }
        let Some(address) = ifaddr.address else {
            continue;
        };
        let Some(sin) = address.as_sockaddr_in() else {
            continue;
        };
        let ip = Ipv4Addr::from(sin.ip());
        if !out.contains(&ip) {
            out.push(ip);
        }
    }
    out
}

#[cfg(not(unix))]
fn multicast_capable_interfaces() -> Vec<Ipv4Addr> {
    Vec::new()
}

/// Fire-and-forget writer towards one multicast group.
#[derive(Clone)]
pub struct MulticastHandler {
    socket: Arc<UdpSocket>,
    rtp_addr: SocketAddr,
    rtcp_addr: SocketAddr,
}

impl MulticastHandler {
    /// Creates a writer towards `group` on the given RTP/RTCP port pair,
    /// joining the group on every multicast-capable interface.
    pub fn new(group: Ipv4Addr, rtp_port: u16, rtcp_port: u16) -> Result<Self> {
        if !group.is_multicast() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{group} is not a multicast address"),
            )));
        }
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_multicast_ttl_v4(MULTICAST_TTL)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0).into())?;
        let socket = UdpSocket::from_std(socket.into())?;

        let interfaces = multicast_capable_interfaces();
        if interfaces.is_empty() {
            // No enumerable interface: join via the OS default so IGMP
            // state still exists on the segment.
            if let Err(e) = socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED) {
                trace!("multicast join on the default interface failed: {e}");
            }
        } else {
            for interface in interfaces {
                if let Err(e) = socket.join_multicast_v4(group, interface) {
                    trace!("multicast join on {interface} failed: {e}");
                }
            }
        }

        Ok(Self {
            socket: Arc::new(socket),
            rtp_addr: SocketAddr::new(IpAddr::V4(group), rtp_port),
            rtcp_addr: SocketAddr::new(IpAddr::V4(group), rtcp_port),
        })
    }

    /// Multicast group address.
    pub fn group(&self) -> Ipv4Addr {
        match self.rtp_addr.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => unreachable!(),
        }
    }

    /// RTP/RTCP port pair of the group.
    pub fn ports(&self) -> (u16, u16) {
        (self.rtp_addr.port(), self.rtcp_addr.port())
    }

    /// Sends an RTP packet to the group; errors are dropped.
    pub async fn write_rtp(&self, payload: &[u8]) {
        if let Err(e) = self.socket.send_to(payload, self.rtp_addr).await {
            trace!("multicast RTP write failed: {e}");
        }
    }

    /// Sends an RTCP packet to the group; errors are dropped.
    pub async fn write_rtcp(&self, payload: &[u8]) {
        if let Err(e) = self.socket.send_to(payload, self.rtcp_addr).await {
            trace!("multicast RTCP write failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_unicast_group() {
        assert!(MulticastHandler::new(Ipv4Addr::new(10, 0, 0, 1), 8000, 8001).is_err());
    }

    #[tokio::test]
    async fn exposes_group_and_ports() {
        let h = MulticastHandler::new(Ipv4Addr::new(224, 1, 0, 5), 8000, 8001).unwrap();
        assert_eq!(h.group(), Ipv4Addr::new(224, 1, 0, 5));
        assert_eq!(h.ports(), (8000, 8001));
    }

    #[test]
    fn interface_enumeration_deduplicates() {
        let interfaces = multicast_capable_interfaces();
        let mut unique = interfaces.clone();
        unique.dedup();
        assert_eq!(interfaces, unique);
    }
}
