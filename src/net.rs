//! Network types for the gateway.
//!
//! The server is IPv6-native: every endpoint it tracks (client control and
//! data endpoints, the multicast group, its own source address) is an
//! [`Ipv6Addr`] plus a UDP port. The types here are `no_std`-friendly and
//! convert to and from `std::net` on hosted targets.

pub mod endpoint;
pub mod transport;

// Hosted UDP adapter and interface helpers
#[cfg(feature = "std")]
pub mod netif;
#[cfg(feature = "std")]
pub mod udp;

// Mock transport (only in tests or when std is available)
#[cfg(any(test, feature = "std"))]
pub mod mock_transport;

use core::fmt;

/// IPv6 address representation.
///
/// A lightweight wrapper around the 16-byte address that provides the
/// conversions and predicates the wire codec needs.
///
/// # Examples
///
/// ```
/// use knx_gateway::net::Ipv6Addr;
///
/// let group: Ipv6Addr = "ff12::4242".parse().unwrap();
/// assert!(group.is_multicast());
/// assert_eq!(group.octets()[0], 0xFF);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Ipv6Addr {
    octets: [u8; 16],
}

impl Ipv6Addr {
    /// The unspecified address `::`.
    pub const UNSPECIFIED: Self = Self { octets: [0; 16] };

    /// The loopback address `::1`.
    pub const LOCALHOST: Self = Self {
        octets: [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1],
    };

    /// Create an address from eight 16-bit segments.
    pub const fn new(segments: [u16; 8]) -> Self {
        let mut octets = [0u8; 16];
        let mut i = 0;
        while i < 8 {
            octets[i * 2] = (segments[i] >> 8) as u8;
            octets[i * 2 + 1] = segments[i] as u8;
            i += 1;
        }
        Self { octets }
    }

    /// The sixteen octets of this address in network byte order.
    #[inline]
    pub const fn octets(&self) -> [u8; 16] {
        self.octets
    }

    /// The eight 16-bit segments of this address.
    pub const fn segments(&self) -> [u16; 8] {
        let mut seg = [0u16; 8];
        let mut i = 0;
        while i < 8 {
            seg[i] = ((self.octets[i * 2] as u16) << 8) | self.octets[i * 2 + 1] as u16;
            i += 1;
        }
        seg
    }

    /// Whether this is the all-zero address.
    #[inline]
    pub fn is_unspecified(&self) -> bool {
        self.octets == [0; 16]
    }

    /// Whether this address is in `ff00::/8`.
    #[inline]
    pub const fn is_multicast(&self) -> bool {
        self.octets[0] == 0xFF
    }
}

impl From<[u8; 16]> for Ipv6Addr {
    #[inline]
    fn from(octets: [u8; 16]) -> Self {
        Self { octets }
    }
}

impl From<Ipv6Addr> for [u8; 16] {
    #[inline]
    fn from(addr: Ipv6Addr) -> [u8; 16] {
        addr.octets
    }
}

impl From<[u16; 8]> for Ipv6Addr {
    #[inline]
    fn from(segments: [u16; 8]) -> Self {
        Self::new(segments)
    }
}

#[cfg(feature = "std")]
impl From<std::net::Ipv6Addr> for Ipv6Addr {
    fn from(addr: std::net::Ipv6Addr) -> Self {
        Self {
            octets: addr.octets(),
        }
    }
}

#[cfg(feature = "std")]
impl From<Ipv6Addr> for std::net::Ipv6Addr {
    fn from(addr: Ipv6Addr) -> Self {
        std::net::Ipv6Addr::from(addr.octets)
    }
}

impl fmt::Display for Ipv6Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seg = self.segments();

        // Longest run of zero segments, compressed as "::" when two or more
        let mut best_start = 0;
        let mut best_len = 0;
        let mut run_start = 0;
        let mut run_len = 0;
        for (i, &s) in seg.iter().enumerate() {
            if s == 0 {
                if run_len == 0 {
                    run_start = i;
                }
                run_len += 1;
                if run_len > best_len {
                    best_start = run_start;
                    best_len = run_len;
                }
            } else {
                run_len = 0;
            }
        }

        if best_len < 2 {
            for (i, &s) in seg.iter().enumerate() {
                if i > 0 {
                    write!(f, ":")?;
                }
                write!(f, "{s:x}")?;
            }
            return Ok(());
        }

        for (i, &s) in seg.iter().enumerate().take(best_start) {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{s:x}")?;
        }
        write!(f, "::")?;
        for (i, &s) in seg.iter().enumerate().skip(best_start + best_len) {
            if i > best_start + best_len {
                write!(f, ":")?;
            }
            write!(f, "{s:x}")?;
        }
        Ok(())
    }
}

impl core::str::FromStr for Ipv6Addr {
    type Err = crate::error::KnxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use crate::error::KnxError;

        fn parse_groups(part: &str, out: &mut heapless::Vec<u16, 8>) -> Result<(), KnxError> {
            if part.is_empty() {
                return Ok(());
            }
            for group in part.split(':') {
                if group.is_empty() || group.len() > 4 {
                    return Err(KnxError::invalid_ip_address());
                }
                let value =
                    u16::from_str_radix(group, 16).map_err(|_| KnxError::invalid_ip_address())?;
                out.push(value).map_err(|_| KnxError::invalid_ip_address())?;
            }
            Ok(())
        }

        // Embedded IPv4 notation is not supported
        if s.contains('.') {
            return Err(KnxError::invalid_ip_address());
        }

        let mut head: heapless::Vec<u16, 8> = heapless::Vec::new();
        let mut tail: heapless::Vec<u16, 8> = heapless::Vec::new();

        match s.find("::") {
            Some(pos) => {
                if s[pos + 2..].contains("::") {
                    return Err(KnxError::invalid_ip_address());
                }
                parse_groups(&s[..pos], &mut head)?;
                parse_groups(&s[pos + 2..], &mut tail)?;
                if head.len() + tail.len() > 7 {
                    return Err(KnxError::invalid_ip_address());
                }
            }
            None => {
                parse_groups(s, &mut head)?;
                if head.len() != 8 {
                    return Err(KnxError::invalid_ip_address());
                }
            }
        }

        let mut segments = [0u16; 8];
        segments[..head.len()].copy_from_slice(&head);
        segments[8 - tail.len()..].copy_from_slice(&tail);
        Ok(Self::new(segments))
    }
}

/// IP endpoint (IPv6 address + port) for network communication.
///
/// # Examples
///
/// ```
/// use knx_gateway::net::{IpEndpoint, Ipv6Addr};
///
/// let endpoint = IpEndpoint::new("fe80::1".parse().unwrap(), 3671);
/// assert_eq!(endpoint.port, 3671);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IpEndpoint {
    /// IP address
    pub addr: Ipv6Addr,
    /// Port number
    pub port: u16,
}

impl IpEndpoint {
    /// Create a new IP endpoint.
    #[inline]
    pub const fn new(addr: Ipv6Addr, port: u16) -> Self {
        Self { addr, port }
    }

    /// The unspecified endpoint `[::]:0`.
    pub const UNSPECIFIED: Self = Self {
        addr: Ipv6Addr::UNSPECIFIED,
        port: 0,
    };
}

impl Default for IpEndpoint {
    fn default() -> Self {
        Self::UNSPECIFIED
    }
}

impl From<(Ipv6Addr, u16)> for IpEndpoint {
    #[inline]
    fn from((addr, port): (Ipv6Addr, u16)) -> Self {
        Self { addr, port }
    }
}

impl From<([u8; 16], u16)> for IpEndpoint {
    #[inline]
    fn from((addr, port): ([u8; 16], u16)) -> Self {
        Self {
            addr: Ipv6Addr::from(addr),
            port,
        }
    }
}

#[cfg(feature = "std")]
impl From<IpEndpoint> for std::net::SocketAddr {
    fn from(ep: IpEndpoint) -> Self {
        std::net::SocketAddr::new(std::net::IpAddr::V6(ep.addr.into()), ep.port)
    }
}

#[cfg(feature = "std")]
impl TryFrom<std::net::SocketAddr> for IpEndpoint {
    type Error = crate::error::KnxError;

    fn try_from(addr: std::net::SocketAddr) -> Result<Self, Self::Error> {
        match addr {
            std::net::SocketAddr::V6(v6) => Ok(Self {
                addr: (*v6.ip()).into(),
                port: v6.port(),
            }),
            std::net::SocketAddr::V4(_) => Err(crate::error::KnxError::invalid_ip_address()),
        }
    }
}

impl fmt::Display for IpEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]:{}", self.addr, self.port)
    }
}
