//! Server configuration.
//!
//! Mirrors the configuration section of the daemon: one value per key,
//! presence-style `tunnel`/`router` sub-sections whose contents are opaque
//! to the core and only handed to the bus router for stack validation.

use crate::net::{IpEndpoint, Ipv6Addr};
use crate::protocol::constants::{KNXNETIP_DEFAULT_PORT, MAX_FRAME_SIZE};
use crate::protocol::dib::MEDIUM_TP1;

// Compile-time guard: a discovery response must fit one datagram
const _: () = assert!(MAX_FRAME_SIZE >= 128);

/// Default multicast group `ff12::4242`.
pub const DEFAULT_MULTICAST: Ipv6Addr = Ipv6Addr::new([0xFF12, 0, 0, 0, 0, 0, 0, 0x4242]);

/// Tunnelling feature sub-section.
///
/// Presence enables tunnelling; the parameters inside configure the
/// per-client link stack and are interpreted by the bus router, not here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub struct TunnelSection {}

/// Routing feature sub-section.
///
/// Presence enables routing; contents parametrise the routing link stack
/// and are opaque to the core.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub struct RoutingSection {}

/// KNXnet/IP server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServerConfig {
    /// UDP port (default 3671)
    pub port: u16,
    /// Outgoing/inbound interface name; empty = default routing
    pub interface: heapless::String<16>,
    /// Routing/discovery multicast group
    pub multicast_address: Ipv6Addr,
    /// Use a second socket for multicast traffic
    pub multi_port: bool,
    /// Answer `SEARCH_REQUEST`/`DESCRIPTION_REQUEST`
    pub discover: bool,
    /// KNX medium byte advertised in the device DIB
    pub medium: u8,
    /// 30-byte friendly name; `None` uses the bus router's server name
    pub name: Option<heapless::String<30>>,
    /// Tunnelling feature; presence enables it
    pub tunnel: Option<TunnelSection>,
    /// Routing feature; presence enables it
    pub router: Option<RoutingSection>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: KNXNETIP_DEFAULT_PORT,
            interface: heapless::String::new(),
            multicast_address: DEFAULT_MULTICAST,
            multi_port: false,
            discover: false,
            medium: MEDIUM_TP1,
            name: None,
            tunnel: None,
            router: None,
        }
    }
}

impl ServerConfig {
    /// Whether tunnelling is enabled.
    pub fn tunnel_enabled(&self) -> bool {
        self.tunnel.is_some()
    }

    /// Whether routing is enabled.
    pub fn route_enabled(&self) -> bool {
        self.router.is_some()
    }

    /// The multicast group endpoint.
    pub fn multicast_endpoint(&self) -> IpEndpoint {
        IpEndpoint::new(self.multicast_address, self.port)
    }
}
