//! KNXnet/IP service payload encode/decode pairs.
//!
//! Every service frame is `header ∥ body`. Each type here owns one service
//! body: `build` writes the complete frame (header included) into a caller
//! buffer, `parse` reads the body of an already-validated frame. Parsing is
//! strict: fixed-size bodies must match exactly and structure length bytes
//! must agree with the actual payload, otherwise the frame is malformed.
//!
//! ## Protocol Flow (server view)
//!
//! ```text
//! Client                          Server
//!   |------- SEARCH_REQUEST ------->|  (multicast)
//!   |<------ SEARCH_RESPONSE -------|
//!   |------- CONNECT_REQUEST ------>|
//!   |<------ CONNECT_RESPONSE ------|
//!   |------ TUNNELING_REQUEST ----->|
//!   |<------ TUNNELING_ACK ---------|
//!   |<----- TUNNELING_REQUEST ------|  (bus traffic)
//!   |------- TUNNELING_ACK -------->|
//!   |--- CONNECTIONSTATE_REQUEST -->|  (heartbeat)
//!   |<-- CONNECTIONSTATE_RESPONSE --|
//!   |------ DISCONNECT_REQUEST ---->|
//!   |<----- DISCONNECT_RESPONSE ----|
//! ```

use crate::addressing::IndividualAddress;
use crate::error::{KnxError, Result};
use crate::net::IpEndpoint;
use crate::protocol::constants::*;
use crate::protocol::dib::{DeviceDib, ServiceFamiliesDib};
use crate::protocol::frame::{Hpai, KnxnetIpHeader};

/// Fixed connection header length in tunnel/config frames
const CONN_HEADER_LEN: u8 = 0x04;

fn write_header(service: u16, total: usize, buf: &mut [u8]) -> Result<()> {
    if buf.len() < total || total > MAX_FRAME_SIZE {
        return Err(KnxError::buffer_too_small());
    }
    buf[0] = HEADER_SIZE_10;
    buf[1] = KNXNETIP_VERSION_10;
    buf[2..4].copy_from_slice(&service.to_be_bytes());
    buf[4..6].copy_from_slice(&(total as u16).to_be_bytes());
    Ok(())
}

// =============================================================================
// Discovery
// =============================================================================

/// `SEARCH_REQUEST` service (0x0201)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchRequest {
    /// Client discovery endpoint (where the response is sent)
    pub endpoint: Hpai,
    /// Whether the client declared NAT
    pub nat: bool,
}

impl SearchRequest {
    /// Create a new `SEARCH_REQUEST`
    pub const fn new(endpoint: Hpai) -> Self {
        Self {
            endpoint,
            nat: false,
        }
    }

    /// Build the complete frame
    pub fn build(&self, buf: &mut [u8]) -> Result<usize> {
        let total = KnxnetIpHeader::SIZE + Hpai::SIZE;
        write_header(ServiceType::SearchRequest.to_u16(), total, buf)?;
        self.endpoint.encode(self.nat, &mut buf[6..])?;
        Ok(total)
    }

    /// Parse from frame body
    pub fn parse(body: &[u8], src: IpEndpoint) -> Result<Self> {
        if body.len() != Hpai::SIZE {
            return Err(KnxError::malformed_frame());
        }
        let (endpoint, nat) = Hpai::parse(body, src)?;
        Ok(Self { endpoint, nat })
    }
}

/// `SEARCH_RESPONSE` service (0x0202)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    /// Server control endpoint
    pub control: Hpai,
    /// Encode the control endpoint in NAT form
    pub nat: bool,
    /// Device information DIB
    pub device: DeviceDib,
    /// Supported service families DIB
    pub families: ServiceFamiliesDib,
}

impl SearchResponse {
    /// Build the complete frame
    pub fn build(&self, buf: &mut [u8]) -> Result<usize> {
        let total = KnxnetIpHeader::SIZE + Hpai::SIZE + DeviceDib::SIZE + self.families.size();
        write_header(ServiceType::SearchResponse.to_u16(), total, buf)?;
        let mut offset = KnxnetIpHeader::SIZE;
        offset += self.control.encode(self.nat, &mut buf[offset..])?;
        offset += self.device.encode(&mut buf[offset..])?;
        offset += self.families.encode(&mut buf[offset..])?;
        debug_assert_eq!(offset, total);
        Ok(total)
    }

    /// Parse from frame body
    pub fn parse(body: &[u8], src: IpEndpoint) -> Result<Self> {
        if body.len() < Hpai::SIZE + DeviceDib::SIZE + 2 {
            return Err(KnxError::malformed_frame());
        }
        let (control, nat) = Hpai::parse(body, src)?;
        let device = DeviceDib::parse(&body[Hpai::SIZE..])?;
        let families = ServiceFamiliesDib::parse(&body[Hpai::SIZE + DeviceDib::SIZE..])?;
        Ok(Self {
            control,
            nat,
            device,
            families,
        })
    }
}

/// `DESCRIPTION_REQUEST` service (0x0203)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptionRequest {
    /// Client control endpoint
    pub endpoint: Hpai,
    /// Whether the client declared NAT
    pub nat: bool,
}

impl DescriptionRequest {
    /// Create a new `DESCRIPTION_REQUEST`
    pub const fn new(endpoint: Hpai) -> Self {
        Self {
            endpoint,
            nat: false,
        }
    }

    /// Build the complete frame
    pub fn build(&self, buf: &mut [u8]) -> Result<usize> {
        let total = KnxnetIpHeader::SIZE + Hpai::SIZE;
        write_header(ServiceType::DescriptionRequest.to_u16(), total, buf)?;
        self.endpoint.encode(self.nat, &mut buf[6..])?;
        Ok(total)
    }

    /// Parse from frame body
    pub fn parse(body: &[u8], src: IpEndpoint) -> Result<Self> {
        if body.len() != Hpai::SIZE {
            return Err(KnxError::malformed_frame());
        }
        let (endpoint, nat) = Hpai::parse(body, src)?;
        Ok(Self { endpoint, nat })
    }
}

/// `DESCRIPTION_RESPONSE` service (0x0204)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptionResponse {
    /// Device information DIB
    pub device: DeviceDib,
    /// Supported service families DIB
    pub families: ServiceFamiliesDib,
}

impl DescriptionResponse {
    /// Build the complete frame
    pub fn build(&self, buf: &mut [u8]) -> Result<usize> {
        let total = KnxnetIpHeader::SIZE + DeviceDib::SIZE + self.families.size();
        write_header(ServiceType::DescriptionResponse.to_u16(), total, buf)?;
        let mut offset = KnxnetIpHeader::SIZE;
        offset += self.device.encode(&mut buf[offset..])?;
        offset += self.families.encode(&mut buf[offset..])?;
        debug_assert_eq!(offset, total);
        Ok(total)
    }

    /// Parse from frame body
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < DeviceDib::SIZE + 2 {
            return Err(KnxError::malformed_frame());
        }
        Ok(Self {
            device: DeviceDib::parse(body)?,
            families: ServiceFamiliesDib::parse(&body[DeviceDib::SIZE..])?,
        })
    }
}

// =============================================================================
// Connection lifecycle
// =============================================================================

/// Connection Request Information
///
/// The structure length byte on the wire counts the whole block:
/// tunnel `[04 04 <layer> 00]`, config `[02 03]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cri {
    /// Tunnel connection with the requested KNX layer
    Tunnel {
        /// `0x02` link layer, `0x80` busmonitor
        layer: u8,
    },
    /// Device management (configuration) connection
    Config,
    /// Unrecognised connection request; kept verbatim so the server can
    /// answer `E_CONNECTION_TYPE`
    Other(heapless::Vec<u8, 16>),
}

impl Cri {
    /// Encoded size in bytes, length byte included.
    pub fn size(&self) -> usize {
        match self {
            Cri::Tunnel { .. } => 4,
            Cri::Config => 2,
            Cri::Other(raw) => 1 + raw.len(),
        }
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let size = self.size();
        if buf.len() < size {
            return Err(KnxError::buffer_too_small());
        }
        buf[0] = size as u8;
        match self {
            Cri::Tunnel { layer } => {
                buf[1] = TUNNEL_CONNECTION;
                buf[2] = *layer;
                buf[3] = 0x00;
            }
            Cri::Config => buf[1] = DEVICE_MGMT_CONNECTION,
            Cri::Other(raw) => buf[1..size].copy_from_slice(raw),
        }
        Ok(size)
    }

    fn decode(content: &[u8]) -> Result<Self> {
        match content {
            [TUNNEL_CONNECTION, layer, _reserved] => Ok(Cri::Tunnel { layer: *layer }),
            [DEVICE_MGMT_CONNECTION] => Ok(Cri::Config),
            other => {
                let mut raw = heapless::Vec::new();
                raw.extend_from_slice(other)
                    .map_err(|_| KnxError::malformed_frame())?;
                Ok(Cri::Other(raw))
            }
        }
    }
}

/// Connection Response Data, mirroring [`Cri`]:
/// tunnel `[04 04 <addr_hi> <addr_lo>]`, config `[02 03]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Crd {
    /// Tunnel connection carrying the assigned client address
    Tunnel(IndividualAddress),
    /// Device management connection (no address)
    Config,
}

impl Crd {
    /// Encoded size in bytes, length byte included.
    pub const fn size(&self) -> usize {
        match self {
            Crd::Tunnel(_) => 4,
            Crd::Config => 2,
        }
    }

    fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let size = self.size();
        if buf.len() < size {
            return Err(KnxError::buffer_too_small());
        }
        buf[0] = size as u8;
        match self {
            Crd::Tunnel(addr) => {
                buf[1] = TUNNEL_CONNECTION;
                addr.encode(&mut buf[2..4])?;
            }
            Crd::Config => buf[1] = DEVICE_MGMT_CONNECTION,
        }
        Ok(size)
    }

    fn decode(content: &[u8]) -> Result<Self> {
        match content {
            [TUNNEL_CONNECTION, hi, lo] => Ok(Crd::Tunnel(IndividualAddress::from(
                u16::from_be_bytes([*hi, *lo]),
            ))),
            [DEVICE_MGMT_CONNECTION] => Ok(Crd::Config),
            _ => Err(KnxError::malformed_frame()),
        }
    }
}

/// `CONNECT_REQUEST` service (0x0205)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Client control endpoint (lifecycle replies)
    pub control: Hpai,
    /// Client data endpoint (session traffic)
    pub data: Hpai,
    /// Whether the client declared NAT in either HPAI
    pub nat: bool,
    /// Connection request information
    pub cri: Cri,
}

impl ConnectRequest {
    /// Create a new `CONNECT_REQUEST`
    pub const fn new(control: Hpai, data: Hpai, cri: Cri) -> Self {
        Self {
            control,
            data,
            nat: false,
            cri,
        }
    }

    /// Build the complete frame
    pub fn build(&self, buf: &mut [u8]) -> Result<usize> {
        let total = KnxnetIpHeader::SIZE + 2 * Hpai::SIZE + self.cri.size();
        write_header(ServiceType::ConnectRequest.to_u16(), total, buf)?;
        let mut offset = KnxnetIpHeader::SIZE;
        offset += self.control.encode(self.nat, &mut buf[offset..])?;
        offset += self.data.encode(self.nat, &mut buf[offset..])?;
        offset += self.cri.encode(&mut buf[offset..])?;
        debug_assert_eq!(offset, total);
        Ok(total)
    }

    /// Parse from frame body
    pub fn parse(body: &[u8], src: IpEndpoint) -> Result<Self> {
        const CRI_OFFSET: usize = 2 * Hpai::SIZE;
        if body.len() < CRI_OFFSET + 2 {
            return Err(KnxError::malformed_frame());
        }
        let (control, nat_c) = Hpai::parse(body, src)?;
        let (data, nat_d) = Hpai::parse(&body[Hpai::SIZE..], src)?;
        // The structure length byte counts the whole trailing block
        if body.len() - CRI_OFFSET != body[CRI_OFFSET] as usize {
            return Err(KnxError::malformed_frame());
        }
        let cri = Cri::decode(&body[CRI_OFFSET + 1..])?;
        Ok(Self {
            control,
            data,
            nat: nat_c || nat_d,
            cri,
        })
    }
}

/// `CONNECT_RESPONSE` service (0x0206)
///
/// An error status yields the short two-byte form without data endpoint
/// or CRD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    /// Communication channel ID
    pub channel: u8,
    /// Status code (0 = OK)
    pub status: u8,
    /// Server data endpoint and CRD, present when status is 0
    pub ok: Option<(Hpai, Crd)>,
    /// Encode the data endpoint in NAT form
    pub nat: bool,
}

impl ConnectResponse {
    /// Create a success response
    pub const fn ok(channel: u8, data: Hpai, crd: Crd, nat: bool) -> Self {
        Self {
            channel,
            status: E_NO_ERROR,
            ok: Some((data, crd)),
            nat,
        }
    }

    /// Create an error response
    pub const fn error(status: u8) -> Self {
        Self {
            channel: 0,
            status,
            ok: None,
            nat: false,
        }
    }

    /// Check if the connection was accepted
    pub const fn is_ok(&self) -> bool {
        self.status == E_NO_ERROR
    }

    /// Build the complete frame
    pub fn build(&self, buf: &mut [u8]) -> Result<usize> {
        match &self.ok {
            Some((data, crd)) if self.status == E_NO_ERROR => {
                let total = KnxnetIpHeader::SIZE + 2 + Hpai::SIZE + crd.size();
                write_header(ServiceType::ConnectResponse.to_u16(), total, buf)?;
                buf[6] = self.channel;
                buf[7] = self.status;
                let mut offset = 8;
                offset += data.encode(self.nat, &mut buf[offset..])?;
                offset += crd.encode(&mut buf[offset..])?;
                debug_assert_eq!(offset, total);
                Ok(total)
            }
            _ => {
                let total = KnxnetIpHeader::SIZE + 2;
                write_header(ServiceType::ConnectResponse.to_u16(), total, buf)?;
                buf[6] = self.channel;
                buf[7] = self.status;
                Ok(total)
            }
        }
    }

    /// Parse from frame body
    pub fn parse(body: &[u8], src: IpEndpoint) -> Result<Self> {
        if body.len() < 2 {
            return Err(KnxError::malformed_frame());
        }
        let channel = body[0];
        let status = body[1];
        if status != E_NO_ERROR {
            if body.len() != 2 {
                return Err(KnxError::malformed_frame());
            }
            return Ok(Self {
                channel,
                status,
                ok: None,
                nat: false,
            });
        }

        const CRD_OFFSET: usize = 2 + Hpai::SIZE;
        if body.len() < CRD_OFFSET + 2 {
            return Err(KnxError::malformed_frame());
        }
        let (data, nat) = Hpai::parse(&body[2..], src)?;
        if body.len() - CRD_OFFSET != body[CRD_OFFSET] as usize {
            return Err(KnxError::malformed_frame());
        }
        let crd = Crd::decode(&body[CRD_OFFSET + 1..])?;
        Ok(Self {
            channel,
            status,
            ok: Some((data, crd)),
            nat,
        })
    }
}

/// `CONNECTIONSTATE_REQUEST` service (0x0207)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStateRequest {
    /// Communication channel ID
    pub channel: u8,
    /// Client control endpoint
    pub control: Hpai,
    /// Whether the client declared NAT
    pub nat: bool,
}

impl ConnectionStateRequest {
    /// Create a new `CONNECTIONSTATE_REQUEST`
    pub const fn new(channel: u8, control: Hpai) -> Self {
        Self {
            channel,
            control,
            nat: false,
        }
    }

    /// Build the complete frame
    pub fn build(&self, buf: &mut [u8]) -> Result<usize> {
        let total = KnxnetIpHeader::SIZE + 2 + Hpai::SIZE;
        write_header(ServiceType::ConnectionstateRequest.to_u16(), total, buf)?;
        buf[6] = self.channel;
        buf[7] = 0x00;
        self.control.encode(self.nat, &mut buf[8..])?;
        Ok(total)
    }

    /// Parse from frame body
    pub fn parse(body: &[u8], src: IpEndpoint) -> Result<Self> {
        if body.len() != 2 + Hpai::SIZE {
            return Err(KnxError::malformed_frame());
        }
        let (control, nat) = Hpai::parse(&body[2..], src)?;
        Ok(Self {
            channel: body[0],
            control,
            nat,
        })
    }
}

/// `CONNECTIONSTATE_RESPONSE` service (0x0208)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStateResponse {
    /// Communication channel ID
    pub channel: u8,
    /// Status code (0 = OK)
    pub status: u8,
}

impl ConnectionStateResponse {
    /// Create a new `CONNECTIONSTATE_RESPONSE`
    pub const fn new(channel: u8, status: u8) -> Self {
        Self { channel, status }
    }

    /// Build the complete frame
    pub fn build(&self, buf: &mut [u8]) -> Result<usize> {
        let total = KnxnetIpHeader::SIZE + 2;
        write_header(ServiceType::ConnectionstateResponse.to_u16(), total, buf)?;
        buf[6] = self.channel;
        buf[7] = self.status;
        Ok(total)
    }

    /// Parse from frame body
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() != 2 {
            return Err(KnxError::malformed_frame());
        }
        Ok(Self {
            channel: body[0],
            status: body[1],
        })
    }
}

/// `DISCONNECT_REQUEST` service (0x0209)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectRequest {
    /// Communication channel ID
    pub channel: u8,
    /// Control endpoint of the sender
    pub control: Hpai,
    /// Whether the sender declared NAT
    pub nat: bool,
}

impl DisconnectRequest {
    /// Create a new `DISCONNECT_REQUEST`
    pub const fn new(channel: u8, control: Hpai, nat: bool) -> Self {
        Self {
            channel,
            control,
            nat,
        }
    }

    /// Build the complete frame
    pub fn build(&self, buf: &mut [u8]) -> Result<usize> {
        let total = KnxnetIpHeader::SIZE + 2 + Hpai::SIZE;
        write_header(ServiceType::DisconnectRequest.to_u16(), total, buf)?;
        buf[6] = self.channel;
        buf[7] = 0x00;
        self.control.encode(self.nat, &mut buf[8..])?;
        Ok(total)
    }

    /// Parse from frame body
    pub fn parse(body: &[u8], src: IpEndpoint) -> Result<Self> {
        if body.len() != 2 + Hpai::SIZE {
            return Err(KnxError::malformed_frame());
        }
        let (control, nat) = Hpai::parse(&body[2..], src)?;
        Ok(Self {
            channel: body[0],
            control,
            nat,
        })
    }
}

/// `DISCONNECT_RESPONSE` service (0x020A)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectResponse {
    /// Communication channel ID
    pub channel: u8,
    /// Status code (0 = OK)
    pub status: u8,
}

impl DisconnectResponse {
    /// Create a new `DISCONNECT_RESPONSE`
    pub const fn new(channel: u8, status: u8) -> Self {
        Self { channel, status }
    }

    /// Build the complete frame
    pub fn build(&self, buf: &mut [u8]) -> Result<usize> {
        let total = KnxnetIpHeader::SIZE + 2;
        write_header(ServiceType::DisconnectResponse.to_u16(), total, buf)?;
        buf[6] = self.channel;
        buf[7] = self.status;
        Ok(total)
    }

    /// Parse from frame body
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() != 2 {
            return Err(KnxError::malformed_frame());
        }
        Ok(Self {
            channel: body[0],
            status: body[1],
        })
    }
}

// =============================================================================
// Session traffic
// =============================================================================

/// Session request body shared by tunnelling and device configuration:
/// `04 <channel> <seq> 00 <CEMI…>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRequest<'a> {
    /// Communication channel ID
    pub channel: u8,
    /// Sequence counter (mod 256)
    pub seqno: u8,
    /// cEMI frame data
    pub cemi: &'a [u8],
}

impl<'a> SessionRequest<'a> {
    /// Create a new session request body
    pub const fn new(channel: u8, seqno: u8, cemi: &'a [u8]) -> Self {
        Self {
            channel,
            seqno,
            cemi,
        }
    }

    fn build(&self, service: u16, buf: &mut [u8]) -> Result<usize> {
        let total = KnxnetIpHeader::SIZE + 4 + self.cemi.len();
        write_header(service, total, buf)?;
        buf[6] = CONN_HEADER_LEN;
        buf[7] = self.channel;
        buf[8] = self.seqno;
        buf[9] = 0x00;
        buf[10..total].copy_from_slice(self.cemi);
        Ok(total)
    }

    /// Parse from frame body
    pub fn parse(body: &'a [u8]) -> Result<Self> {
        // Connection header plus at least a two-byte cEMI frame
        if body.len() < 6 || body[0] != CONN_HEADER_LEN {
            return Err(KnxError::malformed_frame());
        }
        Ok(Self {
            channel: body[1],
            seqno: body[2],
            cemi: &body[4..],
        })
    }
}

/// `TUNNELING_REQUEST` service (0x0420)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelingRequest<'a>(pub SessionRequest<'a>);

impl<'a> TunnelingRequest<'a> {
    /// Create a new `TUNNELING_REQUEST`
    pub const fn new(channel: u8, seqno: u8, cemi: &'a [u8]) -> Self {
        Self(SessionRequest::new(channel, seqno, cemi))
    }

    /// Build the complete frame
    pub fn build(&self, buf: &mut [u8]) -> Result<usize> {
        self.0.build(ServiceType::TunnellingRequest.to_u16(), buf)
    }

    /// Parse from frame body
    pub fn parse(body: &'a [u8]) -> Result<Self> {
        SessionRequest::parse(body).map(Self)
    }
}

/// `DEVICE_CONFIGURATION_REQUEST` service (0x0310)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigRequest<'a>(pub SessionRequest<'a>);

impl<'a> ConfigRequest<'a> {
    /// Create a new `DEVICE_CONFIGURATION_REQUEST`
    pub const fn new(channel: u8, seqno: u8, cemi: &'a [u8]) -> Self {
        Self(SessionRequest::new(channel, seqno, cemi))
    }

    /// Build the complete frame
    pub fn build(&self, buf: &mut [u8]) -> Result<usize> {
        self.0
            .build(ServiceType::DeviceConfigurationRequest.to_u16(), buf)
    }

    /// Parse from frame body
    pub fn parse(body: &'a [u8]) -> Result<Self> {
        SessionRequest::parse(body).map(Self)
    }
}

/// Session acknowledgement body shared by tunnelling and device
/// configuration: `04 <channel> <seq> <status>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionAck {
    /// Communication channel ID
    pub channel: u8,
    /// Acknowledged sequence number
    pub seqno: u8,
    /// Status code (0 = OK)
    pub status: u8,
}

impl SessionAck {
    /// Create a new session acknowledgement
    pub const fn new(channel: u8, seqno: u8, status: u8) -> Self {
        Self {
            channel,
            seqno,
            status,
        }
    }

    /// Check if the frame was acknowledged successfully
    pub const fn is_ok(&self) -> bool {
        self.status == E_NO_ERROR
    }

    fn build(&self, service: u16, buf: &mut [u8]) -> Result<usize> {
        let total = KnxnetIpHeader::SIZE + 4;
        write_header(service, total, buf)?;
        buf[6] = CONN_HEADER_LEN;
        buf[7] = self.channel;
        buf[8] = self.seqno;
        buf[9] = self.status;
        Ok(total)
    }

    /// Parse from frame body
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() != 4 || body[0] != CONN_HEADER_LEN {
            return Err(KnxError::malformed_frame());
        }
        Ok(Self {
            channel: body[1],
            seqno: body[2],
            status: body[3],
        })
    }
}

/// `TUNNELING_ACK` service (0x0421)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelingAck(pub SessionAck);

impl TunnelingAck {
    /// Create a new `TUNNELING_ACK`
    pub const fn new(channel: u8, seqno: u8, status: u8) -> Self {
        Self(SessionAck::new(channel, seqno, status))
    }

    /// Build the complete frame
    pub fn build(&self, buf: &mut [u8]) -> Result<usize> {
        self.0.build(ServiceType::TunnellingAck.to_u16(), buf)
    }

    /// Parse from frame body
    pub fn parse(body: &[u8]) -> Result<Self> {
        SessionAck::parse(body).map(Self)
    }
}

/// `DEVICE_CONFIGURATION_ACK` service (0x0311)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigAck(pub SessionAck);

impl ConfigAck {
    /// Create a new `DEVICE_CONFIGURATION_ACK`
    pub const fn new(channel: u8, seqno: u8, status: u8) -> Self {
        Self(SessionAck::new(channel, seqno, status))
    }

    /// Build the complete frame
    pub fn build(&self, buf: &mut [u8]) -> Result<usize> {
        self.0
            .build(ServiceType::DeviceConfigurationAck.to_u16(), buf)
    }

    /// Parse from frame body
    pub fn parse(body: &[u8]) -> Result<Self> {
        SessionAck::parse(body).map(Self)
    }
}

// =============================================================================
// Routing
// =============================================================================

/// `ROUTING_INDICATION` service (0x0530)
///
/// Carries one cEMI frame to the multicast group; no acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingIndication<'a> {
    /// cEMI frame data
    pub cemi: &'a [u8],
}

impl<'a> RoutingIndication<'a> {
    /// Create a new `ROUTING_INDICATION`
    pub const fn new(cemi: &'a [u8]) -> Self {
        Self { cemi }
    }

    /// Build the complete frame
    pub fn build(&self, buf: &mut [u8]) -> Result<usize> {
        let total = KnxnetIpHeader::SIZE + self.cemi.len();
        write_header(ServiceType::RoutingIndication.to_u16(), total, buf)?;
        buf[6..total].copy_from_slice(self.cemi);
        Ok(total)
    }

    /// Parse from frame body
    pub fn parse(body: &'a [u8]) -> Result<Self> {
        if body.len() < 2 {
            return Err(KnxError::malformed_frame());
        }
        Ok(Self { cemi: body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Ipv6Addr;
    use crate::protocol::dib::{ServiceFamily, MEDIUM_TP1};
    use crate::protocol::frame::KnxnetIpFrame;

    fn src() -> IpEndpoint {
        IpEndpoint::new("fe80::99".parse().unwrap(), 40000)
    }

    fn hpai(addr: &str, port: u16) -> Hpai {
        Hpai::new(addr.parse().unwrap(), port)
    }

    fn roundtrip(buf: &[u8], expected: ServiceType) -> (ServiceType, heapless::Vec<u8, 255>) {
        let frame = KnxnetIpFrame::parse(buf).unwrap();
        assert_eq!(frame.service_type(), expected);
        let mut body = heapless::Vec::new();
        body.extend_from_slice(frame.body()).unwrap();
        (frame.service_type(), body)
    }

    #[test]
    fn test_search_request_roundtrip() {
        let req = SearchRequest::new(hpai("fe80::1", 9999));
        let mut buf = [0u8; 64];
        let len = req.build(&mut buf).unwrap();
        assert_eq!(len, 26);

        let (_, body) = roundtrip(&buf[..len], ServiceType::SearchRequest);
        let parsed = SearchRequest::parse(&body, src()).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn test_search_request_rejects_bad_length() {
        let req = SearchRequest::new(hpai("fe80::1", 9999));
        let mut buf = [0u8; 64];
        let len = req.build(&mut buf).unwrap();
        assert!(SearchRequest::parse(&buf[6..len - 1], src()).is_err());
    }

    #[test]
    fn test_search_response_roundtrip() {
        let mut families = ServiceFamiliesDib::default();
        families.push(ServiceFamily::Core);
        families.push(ServiceFamily::Tunnelling);
        let rsp = SearchResponse {
            control: hpai("fd00::2", 3671),
            nat: false,
            device: DeviceDib {
                medium: MEDIUM_TP1,
                status: 0,
                addr: IndividualAddress::new(1, 0, 0).unwrap(),
                install_id: 0,
                serial: [1, 2, 3, 4, 5, 6],
                multicast: "ff12::4242".parse().unwrap(),
                mac: [1, 2, 3, 4, 5, 6],
                name: DeviceDib::encode_name("eibd-test"),
            },
            families,
        };

        let mut buf = [0u8; 128];
        let len = rsp.build(&mut buf).unwrap();
        assert_eq!(len, 6 + 20 + 66 + 6);

        let (_, body) = roundtrip(&buf[..len], ServiceType::SearchResponse);
        let parsed = SearchResponse::parse(&body, src()).unwrap();
        assert_eq!(parsed, rsp);
        assert_eq!(parsed.device.name_str(), "eibd-test");
    }

    #[test]
    fn test_description_pair_roundtrip() {
        let req = DescriptionRequest::new(hpai("fe80::1", 1234));
        let mut buf = [0u8; 128];
        let len = req.build(&mut buf).unwrap();
        let parsed = DescriptionRequest::parse(&buf[6..len], src()).unwrap();
        assert_eq!(parsed, req);

        let mut families = ServiceFamiliesDib::default();
        families.push(ServiceFamily::Core);
        let rsp = DescriptionResponse {
            device: DeviceDib {
                medium: MEDIUM_TP1,
                status: 0,
                addr: IndividualAddress::new(1, 0, 0).unwrap(),
                install_id: 0,
                serial: [0; 6],
                multicast: Ipv6Addr::UNSPECIFIED,
                mac: [0; 6],
                name: DeviceDib::encode_name("gw"),
            },
            families,
        };
        let len = rsp.build(&mut buf).unwrap();
        let (_, body) = roundtrip(&buf[..len], ServiceType::DescriptionResponse);
        assert_eq!(DescriptionResponse::parse(&body).unwrap(), rsp);
    }

    #[test]
    fn test_connect_request_tunnel_roundtrip() {
        let req = ConnectRequest::new(
            hpai("fe80::1", 1111),
            hpai("fe80::1", 2222),
            Cri::Tunnel {
                layer: TUNNEL_LINKLAYER,
            },
        );
        let mut buf = [0u8; 128];
        let len = req.build(&mut buf).unwrap();
        assert_eq!(len, 6 + 20 + 20 + 4);

        let (_, body) = roundtrip(&buf[..len], ServiceType::ConnectRequest);
        // CRI block: [04 04 02 00]
        assert_eq!(&body[40..], &[0x04, 0x04, 0x02, 0x00]);
        let parsed = ConnectRequest::parse(&body, src()).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn test_connect_request_config_roundtrip() {
        let req = ConnectRequest::new(hpai("fe80::1", 1111), hpai("fe80::1", 2222), Cri::Config);
        let mut buf = [0u8; 128];
        let len = req.build(&mut buf).unwrap();
        assert_eq!(len, 6 + 20 + 20 + 2);

        let parsed = ConnectRequest::parse(&buf[6..len], src()).unwrap();
        assert_eq!(parsed.cri, Cri::Config);
    }

    #[test]
    fn test_connect_request_rejects_cri_length_mismatch() {
        let req = ConnectRequest::new(
            hpai("fe80::1", 1111),
            hpai("fe80::1", 2222),
            Cri::Tunnel {
                layer: TUNNEL_LINKLAYER,
            },
        );
        let mut buf = [0u8; 128];
        let len = req.build(&mut buf).unwrap();
        buf[6 + 40] = 5; // structure length disagrees with payload
        assert!(ConnectRequest::parse(&buf[6..len], src()).is_err());
    }

    #[test]
    fn test_connect_request_keeps_unknown_cri() {
        let req = ConnectRequest::new(hpai("fe80::1", 1), hpai("fe80::1", 2), Cri::Config);
        let mut buf = [0u8; 128];
        let len = req.build(&mut buf).unwrap();
        buf[6 + 41] = 0x08; // OBJSVR_CONNECTION, not supported
        let parsed = ConnectRequest::parse(&buf[6..len], src()).unwrap();
        assert!(matches!(parsed.cri, Cri::Other(_)));
    }

    #[test]
    fn test_connect_response_ok_roundtrip() {
        let addr = IndividualAddress::new(1, 1, 42).unwrap();
        let rsp = ConnectResponse::ok(1, hpai("fd00::2", 3671), Crd::Tunnel(addr), false);
        let mut buf = [0u8; 128];
        let len = rsp.build(&mut buf).unwrap();
        assert_eq!(len, 6 + 2 + 20 + 4);
        // CRD block: [04 04 11 2A]
        assert_eq!(&buf[len - 4..len], &[0x04, 0x04, 0x11, 0x2A]);

        let (_, body) = roundtrip(&buf[..len], ServiceType::ConnectResponse);
        let parsed = ConnectResponse::parse(&body, src()).unwrap();
        assert_eq!(parsed, rsp);
    }

    #[test]
    fn test_connect_response_error_is_short() {
        let rsp = ConnectResponse::error(E_NO_MORE_CONNECTIONS);
        let mut buf = [0u8; 64];
        let len = rsp.build(&mut buf).unwrap();
        assert_eq!(len, 8);
        assert_eq!(buf[7], 0x24);

        let parsed = ConnectResponse::parse(&buf[6..len], src()).unwrap();
        assert!(!parsed.is_ok());
        assert!(parsed.ok.is_none());
    }

    #[test]
    fn test_connectionstate_pair_roundtrip() {
        let req = ConnectionStateRequest::new(7, hpai("fe80::1", 1234));
        let mut buf = [0u8; 64];
        let len = req.build(&mut buf).unwrap();
        assert_eq!(len, 28);
        let parsed = ConnectionStateRequest::parse(&buf[6..len], src()).unwrap();
        assert_eq!(parsed, req);

        let rsp = ConnectionStateResponse::new(7, E_CONNECTION_ID);
        let len = rsp.build(&mut buf).unwrap();
        assert_eq!(ConnectionStateResponse::parse(&buf[6..len]).unwrap(), rsp);
    }

    #[test]
    fn test_disconnect_pair_roundtrip() {
        let req = DisconnectRequest::new(3, hpai("fe80::1", 1234), false);
        let mut buf = [0u8; 64];
        let len = req.build(&mut buf).unwrap();
        let parsed = DisconnectRequest::parse(&buf[6..len], src()).unwrap();
        assert_eq!(parsed, req);

        let rsp = DisconnectResponse::new(3, 0);
        let len = rsp.build(&mut buf).unwrap();
        assert_eq!(DisconnectResponse::parse(&buf[6..len]).unwrap(), rsp);
    }

    #[test]
    fn test_tunneling_request_roundtrip() {
        let cemi = [0x11, 0x00, 0xBC, 0xE0, 0x00, 0x00, 0x0A, 0x03, 0x01, 0x00, 0x81];
        let req = TunnelingRequest::new(1, 0, &cemi);
        let mut buf = [0u8; 64];
        let len = req.build(&mut buf).unwrap();
        assert_eq!(len, 6 + 4 + cemi.len());
        assert_eq!(&buf[6..10], &[0x04, 0x01, 0x00, 0x00]);

        let (_, body) = roundtrip(&buf[..len], ServiceType::TunnellingRequest);
        let parsed = TunnelingRequest::parse(&body).unwrap();
        assert_eq!(parsed.0.channel, 1);
        assert_eq!(parsed.0.seqno, 0);
        assert_eq!(parsed.0.cemi, &cemi);
    }

    #[test]
    fn test_tunneling_request_rejects_bad_header() {
        // Wrong structure length constant
        assert!(TunnelingRequest::parse(&[0x05, 0x01, 0x00, 0x00, 0x11, 0x00]).is_err());
        // Too short for a cEMI frame
        assert!(TunnelingRequest::parse(&[0x04, 0x01, 0x00, 0x00, 0x11]).is_err());
    }

    #[test]
    fn test_tunneling_ack_roundtrip() {
        let ack = TunnelingAck::new(3, 15, 0);
        let mut buf = [0u8; 16];
        let len = ack.build(&mut buf).unwrap();
        assert_eq!(len, 10);
        assert!(ack.0.is_ok());

        let parsed = TunnelingAck::parse(&buf[6..len]).unwrap();
        assert_eq!(parsed, ack);
    }

    #[test]
    fn test_config_pair_roundtrip() {
        let cemi = [0xFC, 0x00, 0x00, 0x00, 0x00, 0x10, 0x01];
        let req = ConfigRequest::new(2, 5, &cemi);
        let mut buf = [0u8; 64];
        let len = req.build(&mut buf).unwrap();
        let (_, body) = roundtrip(&buf[..len], ServiceType::DeviceConfigurationRequest);
        assert_eq!(ConfigRequest::parse(&body).unwrap(), req);

        let ack = ConfigAck::new(2, 5, E_DATA_CONNECTION);
        let len = ack.build(&mut buf).unwrap();
        let (_, body) = roundtrip(&buf[..len], ServiceType::DeviceConfigurationAck);
        assert_eq!(ConfigAck::parse(&body).unwrap(), ack);
    }

    #[test]
    fn test_routing_indication_roundtrip() {
        let cemi = [0x29, 0x00, 0xBC, 0xE0, 0x12, 0x03, 0x00, 0x01, 0x01, 0x00, 0x81];
        let ind = RoutingIndication::new(&cemi);
        let mut buf = [0u8; 64];
        let len = ind.build(&mut buf).unwrap();
        assert_eq!(len, 6 + cemi.len());

        let (_, body) = roundtrip(&buf[..len], ServiceType::RoutingIndication);
        let parsed = RoutingIndication::parse(&body).unwrap();
        assert_eq!(parsed.cemi, &cemi);

        assert!(RoutingIndication::parse(&[0x29]).is_err());
    }
}
