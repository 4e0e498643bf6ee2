//! Source-IP helper: hostname resolution and local source-address
//! determination.
//!
//! Unsolicited outbound frames (discovery responses, server-initiated
//! disconnects) carry an HPAI naming the server as the peer will reach
//! it. The kernel picks the source address per destination; the portable
//! way to learn its choice is a connected UDP probe, which never sends a
//! datagram. On lookup failure the caller must not emit the frame.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use crate::error::{KnxError, Result};
use crate::net::{IpEndpoint, Ipv6Addr};

/// Resolve a host name to an IPv6 address, preferring native IPv6 records
/// and falling back to the v4-mapped form of an IPv4 record.
pub fn resolve_host(name: &str) -> Result<Ipv6Addr> {
    let addrs = (name, 0u16)
        .to_socket_addrs()
        .map_err(|_| KnxError::no_source_address())?;

    let mut v4: Option<Ipv6Addr> = None;
    for addr in addrs {
        match addr {
            SocketAddr::V6(a) => return Ok((*a.ip()).into()),
            SocketAddr::V4(a) => {
                v4.get_or_insert_with(|| a.ip().to_ipv6_mapped().into());
            }
        }
    }
    v4.ok_or_else(KnxError::no_source_address)
}

/// Determine the local address the kernel will use to reach `dest`.
///
/// Connect-probe: binding an unspecified socket and connecting it makes
/// the kernel run route selection without emitting traffic; the socket's
/// local address is the answer.
pub fn source_address_for(dest: IpEndpoint) -> Result<IpEndpoint> {
    let probe = UdpSocket::bind("[::]:0").map_err(|_| KnxError::no_source_address())?;
    probe
        .connect(SocketAddr::from(dest))
        .map_err(|_| KnxError::no_source_address())?;
    let local = probe.local_addr().map_err(|_| KnxError::no_source_address())?;
    IpEndpoint::try_from(local).map_err(|_| KnxError::no_source_address())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_localhost() {
        let addr = resolve_host("localhost").unwrap();
        // ::1 or the mapped form of 127.0.0.1, depending on the resolver
        assert!(addr == Ipv6Addr::LOCALHOST || addr.octets()[10..12] == [0xFF, 0xFF]);
    }

    #[test]
    fn test_resolve_failure() {
        assert!(resolve_host("no-such-host.invalid").is_err());
    }

    #[test]
    fn test_source_for_loopback() {
        let dest = IpEndpoint::new(Ipv6Addr::LOCALHOST, 3671);
        let src = source_address_for(dest).unwrap();
        assert_eq!(src.addr, Ipv6Addr::LOCALHOST);
        assert_ne!(src.port, 0);
    }
}
