//! KNXnet/IP protocol constants and service type identifiers.

use crate::time::Duration;

/// KNXnet/IP protocol version 1.0
pub const KNXNETIP_VERSION_10: u8 = 0x10;

/// Standard KNXnet/IP header length (6 bytes)
pub const HEADER_SIZE_10: u8 = 0x06;

/// Standard UDP port for KNXnet/IP communication
pub const KNXNETIP_DEFAULT_PORT: u16 = 3671;

/// Default IPv6 multicast group for routing and discovery
pub const KNXNETIP_DEFAULT_MULTICAST: &str = "ff12::4242";

/// Maximum size of a KNXnet/IP datagram; larger datagrams are truncated at
/// the OS boundary and rejected by the length check
pub const MAX_FRAME_SIZE: usize = 255;

/// Maximum size of a cEMI frame carried in a tunnel or routing payload
pub const MAX_CEMI_SIZE: usize = 245;

/// Retry interval for unacknowledged tunnel/config requests
pub const TUNNELING_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Sends of one frame before the connection is torn down (initial + retries)
pub const TUNNELING_MAX_SENDS: u8 = 3;

/// Idle interval after which a connection without client liveness is dropped
pub const CONNECTION_ALIVE_TIME: Duration = Duration::from_secs(120);

/// Multicast hop limit applied to the server socket
pub const MULTICAST_HOPS: u32 = 10;

/// Consecutive hard send errors tolerated before the endpoint fails
pub const MAX_SEND_ERRORS: u8 = 5;

// =============================================================================
// Service Type Identifiers
// =============================================================================

/// KNXnet/IP Service Type Identifiers
///
/// Closed enumeration: datagrams carrying any other value are dropped with
/// a trace by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum ServiceType {
    // Core services (0x02xx)
    /// `SEARCH_REQUEST` - Device discovery request
    SearchRequest = 0x0201,
    /// `SEARCH_RESPONSE` - Device discovery response
    SearchResponse = 0x0202,
    /// `DESCRIPTION_REQUEST` - Device description request
    DescriptionRequest = 0x0203,
    /// `DESCRIPTION_RESPONSE` - Device description response
    DescriptionResponse = 0x0204,
    /// `CONNECT_REQUEST` - Connection request
    ConnectRequest = 0x0205,
    /// `CONNECT_RESPONSE` - Connection response
    ConnectResponse = 0x0206,
    /// `CONNECTIONSTATE_REQUEST` - Connection state request (heartbeat)
    ConnectionstateRequest = 0x0207,
    /// `CONNECTIONSTATE_RESPONSE` - Connection state response
    ConnectionstateResponse = 0x0208,
    /// `DISCONNECT_REQUEST` - Disconnect request
    DisconnectRequest = 0x0209,
    /// `DISCONNECT_RESPONSE` - Disconnect response
    DisconnectResponse = 0x020A,

    // Device Management (0x03xx)
    /// `DEVICE_CONFIGURATION_REQUEST`
    DeviceConfigurationRequest = 0x0310,
    /// `DEVICE_CONFIGURATION_ACK`
    DeviceConfigurationAck = 0x0311,

    // Tunnelling (0x04xx)
    /// `TUNNELLING_REQUEST` - Tunnelling data request
    TunnellingRequest = 0x0420,
    /// `TUNNELLING_ACK` - Tunnelling acknowledgement
    TunnellingAck = 0x0421,

    // Routing (0x05xx)
    /// `ROUTING_INDICATION` - Routing indication (multicast)
    RoutingIndication = 0x0530,
}

impl ServiceType {
    /// Convert a u16 to `ServiceType`
    pub const fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0201 => Some(Self::SearchRequest),
            0x0202 => Some(Self::SearchResponse),
            0x0203 => Some(Self::DescriptionRequest),
            0x0204 => Some(Self::DescriptionResponse),
            0x0205 => Some(Self::ConnectRequest),
            0x0206 => Some(Self::ConnectResponse),
            0x0207 => Some(Self::ConnectionstateRequest),
            0x0208 => Some(Self::ConnectionstateResponse),
            0x0209 => Some(Self::DisconnectRequest),
            0x020A => Some(Self::DisconnectResponse),
            0x0310 => Some(Self::DeviceConfigurationRequest),
            0x0311 => Some(Self::DeviceConfigurationAck),
            0x0420 => Some(Self::TunnellingRequest),
            0x0421 => Some(Self::TunnellingAck),
            0x0530 => Some(Self::RoutingIndication),
            _ => None,
        }
    }

    /// Convert `ServiceType` to u16
    pub const fn to_u16(self) -> u16 {
        self as u16
    }
}

// =============================================================================
// Connection Type Codes
// =============================================================================

/// Connection type for `DEVICE_MGMT_CONNECTION`
pub const DEVICE_MGMT_CONNECTION: u8 = 0x03;

/// Connection type for `TUNNEL_CONNECTION`
pub const TUNNEL_CONNECTION: u8 = 0x04;

/// KNX layer code for link-layer tunnelling
pub const TUNNEL_LINKLAYER: u8 = 0x02;

/// KNX layer code for busmonitor tunnelling
pub const TUNNEL_BUSMONITOR: u8 = 0x80;

// =============================================================================
// Host Protocol Codes
// =============================================================================

/// UDP host protocol code (shared by the IPv4 and IPv6 HPAI forms)
pub const HPAI_PROTO_UDP: u8 = 0x01;

// =============================================================================
// Error Codes
// =============================================================================

/// Error code for successful operation
pub const E_NO_ERROR: u8 = 0x00;

/// Error code for unsupported host protocol
pub const E_HOST_PROTOCOL_TYPE: u8 = 0x01;

/// Error code for unsupported protocol version
pub const E_VERSION_NOT_SUPPORTED: u8 = 0x02;

/// Error code for out-of-order sequence number
pub const E_SEQUENCE_NUMBER: u8 = 0x04;

/// Error code for unknown communication channel
pub const E_CONNECTION_ID: u8 = 0x21;

/// Error code for connection type not supported
pub const E_CONNECTION_TYPE: u8 = 0x22;

/// Error code for no more connections available
pub const E_NO_MORE_CONNECTIONS: u8 = 0x24;

/// Error code for data connection error
pub const E_DATA_CONNECTION: u8 = 0x26;

/// Error code for tunnelling layer not supported
pub const E_TUNNELING_LAYER: u8 = 0x29;

// =============================================================================
// cEMI Message Codes
// =============================================================================

/// cEMI Message Codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum CEMIMessageCode {
    /// `L_Data.req` - Data request
    LDataReq = 0x11,
    /// `L_Data.ind` - Data indication
    LDataInd = 0x29,
    /// `L_Busmon.ind` - Bus monitor indication
    LBusmonInd = 0x2B,
    /// `L_Data.con` - Data confirmation
    LDataCon = 0x2E,
    /// `M_PropRead.req` - Property read request
    MPropReadReq = 0xFC,
    /// `M_PropRead.con` - Property read confirmation
    MPropReadCon = 0xFB,
}

impl CEMIMessageCode {
    /// Convert u8 to `CEMIMessageCode`
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x11 => Some(Self::LDataReq),
            0x29 => Some(Self::LDataInd),
            0x2B => Some(Self::LBusmonInd),
            0x2E => Some(Self::LDataCon),
            0xFC => Some(Self::MPropReadReq),
            0xFB => Some(Self::MPropReadCon),
            _ => None,
        }
    }

    /// Convert `CEMIMessageCode` to u8
    pub const fn to_u8(self) -> u8 {
        self as u8
    }
}

// =============================================================================
// KNX Priority
// =============================================================================

/// KNX message priority levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Priority {
    /// System priority
    System = 0b00,
    /// Normal priority (default)
    #[default]
    Normal = 0b01,
    /// Urgent priority
    Urgent = 0b10,
    /// Low priority
    Low = 0b11,
}

impl Priority {
    /// Convert u8 to Priority
    pub const fn from_u8(value: u8) -> Self {
        match value & 0b11 {
            0b00 => Self::System,
            0b01 => Self::Normal,
            0b10 => Self::Urgent,
            _ => Self::Low,
        }
    }

    /// Convert Priority to u8
    pub const fn to_u8(self) -> u8 {
        self as u8
    }
}
