//! KNXnet/IP frame parsing and encoding.
//!
//! Zero-copy parsing of the 6-byte common header and the HPAI endpoint
//! structures. One UDP datagram carries exactly one frame, so the parser
//! enforces strict equality between the header length field and the buffer.

use crate::error::{KnxError, Result};
use crate::net::{IpEndpoint, Ipv6Addr};
use crate::protocol::constants::*;

/// Compiler hint for unlikely branches (error paths)
#[inline(always)]
#[cold]
const fn unlikely(b: bool) -> bool {
    b
}

/// KNXnet/IP frame header (6 bytes)
///
/// ```text
/// ┌──────────────┬──────────────┬─────────────────────┐
/// │ Header Len   │ Protocol Ver │  Service Type ID    │
/// │   (1 byte)   │   (1 byte)   │     (2 bytes)       │
/// ├──────────────┴──────────────┴─────────────────────┤
/// │           Total Length (2 bytes)                   │
/// └────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct KnxnetIpHeader {
    /// Header length (should be 0x06)
    pub header_length: u8,
    /// Protocol version (should be 0x10 for v1.0)
    pub protocol_version: u8,
    /// Service type identifier
    pub service_type: ServiceType,
    /// Total length of frame (header + body)
    pub total_length: u16,
}

impl KnxnetIpHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = 6;

    /// Create a new header
    pub const fn new(service_type: ServiceType, body_length: u16) -> Self {
        Self {
            header_length: HEADER_SIZE_10,
            protocol_version: KNXNETIP_VERSION_10,
            service_type,
            total_length: Self::SIZE as u16 + body_length,
        }
    }

    /// Parse a header from a byte slice
    ///
    /// # Errors
    ///
    /// Returns error if the buffer is too small, the header constants are
    /// wrong, the version is unsupported, or the service type is unknown.
    #[inline(always)]
    pub fn parse(data: &[u8]) -> Result<Self> {
        if unlikely(data.len() < Self::SIZE) {
            return Err(KnxError::buffer_too_small());
        }

        let header_length = data[0];
        let protocol_version = data[1];
        let service_type_raw = u16::from_be_bytes([data[2], data[3]]);
        let total_length = u16::from_be_bytes([data[4], data[5]]);

        if unlikely(header_length != HEADER_SIZE_10) {
            return Err(KnxError::malformed_frame());
        }

        if unlikely(protocol_version != KNXNETIP_VERSION_10) {
            return Err(KnxError::unsupported_version());
        }

        let service_type =
            ServiceType::from_u16(service_type_raw).ok_or(KnxError::unsupported_service_type())?;

        Ok(Self {
            header_length,
            protocol_version,
            service_type,
            total_length,
        })
    }

    /// Encode the header into a byte buffer
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < Self::SIZE {
            return Err(KnxError::buffer_too_small());
        }

        buf[0] = self.header_length;
        buf[1] = self.protocol_version;
        buf[2..4].copy_from_slice(&self.service_type.to_u16().to_be_bytes());
        buf[4..6].copy_from_slice(&self.total_length.to_be_bytes());

        Ok(Self::SIZE)
    }

    /// Get the expected body length from the header
    pub const fn body_length(&self) -> u16 {
        self.total_length.saturating_sub(Self::SIZE as u16)
    }
}

/// Zero-copy view of a KNXnet/IP frame
///
/// References the datagram buffer directly; the body accessor returns the
/// payload beyond the header without copying.
#[derive(Debug)]
pub struct KnxnetIpFrame<'a> {
    /// Reference to the complete frame data
    data: &'a [u8],
    /// Parsed header
    header: KnxnetIpHeader,
}

impl<'a> KnxnetIpFrame<'a> {
    /// Parse a KNXnet/IP frame from one datagram.
    ///
    /// # Errors
    ///
    /// Returns a malformed-frame error when the total length field
    /// disagrees with the datagram size.
    #[inline(always)]
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let header = KnxnetIpHeader::parse(data)?;

        // One datagram, one frame: the length field must match exactly
        if unlikely(data.len() != header.total_length as usize) {
            return Err(KnxError::malformed_frame());
        }

        Ok(Self { data, header })
    }

    /// Get the frame header
    #[inline(always)]
    pub const fn header(&self) -> &KnxnetIpHeader {
        &self.header
    }

    /// Get the service type
    #[inline(always)]
    pub const fn service_type(&self) -> ServiceType {
        self.header.service_type
    }

    /// Get the frame body (payload after header)
    #[inline(always)]
    pub fn body(&self) -> &'a [u8] {
        &self.data[KnxnetIpHeader::SIZE..]
    }

    /// Get the complete frame data
    #[inline(always)]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }
}

/// Builder for creating KNXnet/IP frames
#[derive(Debug)]
pub struct FrameBuilder<'a> {
    service_type: ServiceType,
    body: &'a [u8],
}

impl<'a> FrameBuilder<'a> {
    /// Create a new frame builder
    pub const fn new(service_type: ServiceType, body: &'a [u8]) -> Self {
        Self { service_type, body }
    }

    /// Build the frame into a buffer
    pub fn build(&self, buf: &mut [u8]) -> Result<usize> {
        let total_size = KnxnetIpHeader::SIZE + self.body.len();

        if total_size > MAX_FRAME_SIZE {
            return Err(KnxError::payload_too_large());
        }

        if buf.len() < total_size {
            return Err(KnxError::buffer_too_small());
        }

        let header = KnxnetIpHeader::new(self.service_type, self.body.len() as u16);
        header.encode(buf)?;
        buf[KnxnetIpHeader::SIZE..total_size].copy_from_slice(self.body);

        Ok(total_size)
    }

    /// Calculate the total frame size
    pub const fn size(&self) -> usize {
        KnxnetIpHeader::SIZE + self.body.len()
    }
}

/// Host Protocol Address Information, IPv6 form (20 bytes)
///
/// ```text
/// ┌──────────────┬──────────────┬─────────────────────┐
/// │ Structure Len│ Host Protocol│   IPv6 Address      │
/// │   (0x14)     │   (0x01)     │     (16 bytes)      │
/// ├──────────────┴──────────────┴─────────────────────┤
/// │                Port (2 bytes)                      │
/// └────────────────────────────────────────────────────┘
/// ```
///
/// All multi-byte fields are network byte order. An all-zero address with a
/// nonzero port signals NAT: the receiver substitutes the datagram's source
/// address (and source port when the port is also zero).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Hpai {
    /// IPv6 address
    pub addr: Ipv6Addr,
    /// UDP port
    pub port: u16,
}

impl Hpai {
    /// Size of the IPv6 HPAI structure
    pub const SIZE: usize = 20;

    /// Create a new HPAI for IPv6 UDP
    pub const fn new(addr: Ipv6Addr, port: u16) -> Self {
        Self { addr, port }
    }

    /// Create from an endpoint
    pub const fn from_endpoint(ep: IpEndpoint) -> Self {
        Self {
            addr: ep.addr,
            port: ep.port,
        }
    }

    /// The endpoint carried by this HPAI
    pub const fn endpoint(&self) -> IpEndpoint {
        IpEndpoint::new(self.addr, self.port)
    }

    /// Parse an HPAI, applying NAT substitution against the datagram source.
    ///
    /// Returns the decoded endpoint and whether the sender declared NAT.
    pub fn parse(data: &[u8], src: IpEndpoint) -> Result<(Self, bool)> {
        if data.len() < Self::SIZE {
            return Err(KnxError::buffer_too_small());
        }

        if data[0] != Self::SIZE as u8 || data[1] != HPAI_PROTO_UDP {
            return Err(KnxError::malformed_frame());
        }

        let mut octets = [0u8; 16];
        octets.copy_from_slice(&data[2..18]);
        let addr = Ipv6Addr::from(octets);
        let port = u16::from_be_bytes([data[18], data[19]]);

        let nat = addr.is_unspecified();
        let addr = if nat { src.addr } else { addr };
        let port = if port == 0 { src.port } else { port };

        Ok((Self { addr, port }, nat))
    }

    /// Encode the HPAI. With `nat` the address and port region is zeroed.
    pub fn encode(&self, nat: bool, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < Self::SIZE {
            return Err(KnxError::buffer_too_small());
        }

        buf[0] = Self::SIZE as u8;
        buf[1] = HPAI_PROTO_UDP;
        if nat {
            buf[2..Self::SIZE].fill(0);
        } else {
            buf[2..18].copy_from_slice(&self.addr.octets());
            buf[18..20].copy_from_slice(&self.port.to_be_bytes());
        }

        Ok(Self::SIZE)
    }
}

/// Host Protocol Address Information, IPv4 form (8 bytes)
///
/// Kept for the IPv4 address-family instantiation of the protocol; the
/// IPv6-native server never emits it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HpaiV4 {
    /// IPv4 address (4 bytes)
    pub addr: [u8; 4],
    /// UDP port
    pub port: u16,
}

impl HpaiV4 {
    /// Size of the IPv4 HPAI structure
    pub const SIZE: usize = 8;

    /// Create a new HPAI for IPv4 UDP
    pub const fn new(addr: [u8; 4], port: u16) -> Self {
        Self { addr, port }
    }

    /// Parse an HPAI, applying NAT substitution against the datagram source.
    pub fn parse(data: &[u8], src_addr: [u8; 4], src_port: u16) -> Result<(Self, bool)> {
        if data.len() < Self::SIZE {
            return Err(KnxError::buffer_too_small());
        }

        if data[0] != Self::SIZE as u8 || data[1] != HPAI_PROTO_UDP {
            return Err(KnxError::malformed_frame());
        }

        let addr = [data[2], data[3], data[4], data[5]];
        let port = u16::from_be_bytes([data[6], data[7]]);

        let nat = addr == [0, 0, 0, 0];
        let addr = if nat { src_addr } else { addr };
        let port = if port == 0 { src_port } else { port };

        Ok((Self { addr, port }, nat))
    }

    /// Encode the HPAI. With `nat` the address and port region is zeroed.
    pub fn encode(&self, nat: bool, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < Self::SIZE {
            return Err(KnxError::buffer_too_small());
        }

        buf[0] = Self::SIZE as u8;
        buf[1] = HPAI_PROTO_UDP;
        if nat {
            buf[2..Self::SIZE].fill(0);
        } else {
            buf[2..6].copy_from_slice(&self.addr);
            buf[6..8].copy_from_slice(&self.port.to_be_bytes());
        }

        Ok(Self::SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src() -> IpEndpoint {
        IpEndpoint::new("fe80::99".parse().unwrap(), 40000)
    }

    #[test]
    fn test_header_parse() {
        let data = [0x06, 0x10, 0x02, 0x01, 0x00, 0x0E];
        let header = KnxnetIpHeader::parse(&data).unwrap();
        assert_eq!(header.header_length, 0x06);
        assert_eq!(header.protocol_version, 0x10);
        assert_eq!(header.service_type, ServiceType::SearchRequest);
        assert_eq!(header.total_length, 14);
        assert_eq!(header.body_length(), 8);
    }

    #[test]
    fn test_header_rejects_bad_constants() {
        assert!(KnxnetIpHeader::parse(&[0x05, 0x10, 0x02, 0x01, 0x00, 0x0E]).is_err());
        assert!(KnxnetIpHeader::parse(&[0x06, 0x11, 0x02, 0x01, 0x00, 0x0E]).is_err());
        // Unknown service type
        assert!(KnxnetIpHeader::parse(&[0x06, 0x10, 0x09, 0x50, 0x00, 0x0E]).is_err());
    }

    #[test]
    fn test_header_encode() {
        let header = KnxnetIpHeader::new(ServiceType::SearchRequest, 8);
        let mut buf = [0u8; 6];
        let size = header.encode(&mut buf).unwrap();

        assert_eq!(size, 6);
        assert_eq!(buf, [0x06, 0x10, 0x02, 0x01, 0x00, 0x0E]);
    }

    #[test]
    fn test_frame_builder() {
        let body = [0x01, 0x02, 0x03, 0x04];
        let builder = FrameBuilder::new(ServiceType::RoutingIndication, &body);

        let mut buf = [0u8; 32];
        let size = builder.build(&mut buf).unwrap();

        assert_eq!(size, 10);
        assert_eq!(buf[0], 0x06);
        assert_eq!(buf[1], 0x10);
        assert_eq!(buf[2..4], [0x05, 0x30]);
        assert_eq!(buf[4..6], [0x00, 0x0A]);
        assert_eq!(&buf[6..10], &body);
    }

    #[test]
    fn test_frame_parse_exact_length() {
        let data = [0x06, 0x10, 0x05, 0x30, 0x00, 0x0A, 0x01, 0x02, 0x03, 0x04];
        let frame = KnxnetIpFrame::parse(&data).unwrap();
        assert_eq!(frame.service_type(), ServiceType::RoutingIndication);
        assert_eq!(frame.body(), &[0x01, 0x02, 0x03, 0x04]);

        // Length field disagreeing with the buffer is rejected both ways
        let short = [0x06, 0x10, 0x05, 0x30, 0x00, 0x0B, 0x01, 0x02, 0x03, 0x04];
        assert!(KnxnetIpFrame::parse(&short).is_err());
        let long = [0x06, 0x10, 0x05, 0x30, 0x00, 0x09, 0x01, 0x02, 0x03, 0x04];
        assert!(KnxnetIpFrame::parse(&long).is_err());
    }

    #[test]
    fn test_hpai_roundtrip() {
        let hpai = Hpai::new("fe80::1".parse().unwrap(), 3671);
        let mut buf = [0u8; 20];
        let len = hpai.encode(false, &mut buf).unwrap();
        assert_eq!(len, 20);
        assert_eq!(buf[0], 20);
        assert_eq!(buf[1], 0x01);
        assert_eq!(&buf[18..20], &[0x0E, 0x57]);

        let (decoded, nat) = Hpai::parse(&buf, src()).unwrap();
        assert_eq!(decoded, hpai);
        assert!(!nat);
    }

    #[test]
    fn test_hpai_nat_substitution() {
        // Zero address, nonzero port: source address substituted, port kept
        let mut buf = [0u8; 20];
        Hpai::new(Ipv6Addr::UNSPECIFIED, 9999)
            .encode(false, &mut buf)
            .unwrap();
        let (decoded, nat) = Hpai::parse(&buf, src()).unwrap();
        assert!(nat);
        assert_eq!(decoded.addr, src().addr);
        assert_eq!(decoded.port, 9999);

        // Zero address and port: both substituted
        Hpai::new("fe80::1".parse().unwrap(), 1234)
            .encode(true, &mut buf)
            .unwrap();
        let (decoded, nat) = Hpai::parse(&buf, src()).unwrap();
        assert!(nat);
        assert_eq!(decoded.endpoint(), src());
    }

    #[test]
    fn test_hpai_rejects_bad_constants() {
        let mut buf = [0u8; 20];
        Hpai::new("fe80::1".parse().unwrap(), 3671)
            .encode(false, &mut buf)
            .unwrap();

        let mut bad = buf;
        bad[0] = 8;
        assert!(Hpai::parse(&bad, src()).is_err());

        let mut bad = buf;
        bad[1] = 0x02;
        assert!(Hpai::parse(&bad, src()).is_err());
    }

    #[test]
    fn test_hpai_v4_roundtrip() {
        let hpai = HpaiV4::new([192, 168, 1, 100], 3671);
        let mut buf = [0u8; 8];
        hpai.encode(false, &mut buf).unwrap();
        assert_eq!(buf, [0x08, 0x01, 192, 168, 1, 100, 0x0E, 0x57]);

        let (decoded, nat) = HpaiV4::parse(&buf, [10, 0, 0, 1], 5000).unwrap();
        assert_eq!(decoded, hpai);
        assert!(!nat);
    }

    #[test]
    fn test_hpai_v4_nat() {
        let mut buf = [0u8; 8];
        HpaiV4::new([1, 2, 3, 4], 77).encode(true, &mut buf).unwrap();
        let (decoded, nat) = HpaiV4::parse(&buf, [10, 0, 0, 1], 5000).unwrap();
        assert!(nat);
        assert_eq!(decoded.addr, [10, 0, 0, 1]);
        assert_eq!(decoded.port, 5000);
    }

    #[test]
    fn test_parse_fuzz_never_panics() {
        // Deterministic xorshift byte soup; every accepted frame must have
        // a length field that agrees with the buffer
        let mut state = 0x2545_F491_4F6C_DD1Du64;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        let mut buf = [0u8; MAX_FRAME_SIZE];
        for _ in 0..20_000 {
            let len = (next() as usize) % (MAX_FRAME_SIZE + 1);
            for byte in buf.iter_mut().take(len) {
                *byte = next() as u8;
            }
            // Bias some samples toward a valid header so deeper paths run
            if next() % 2 == 0 && len >= 6 {
                buf[0] = 0x06;
                buf[1] = 0x10;
                buf[2] = 0x02;
                buf[3] = (next() % 16) as u8;
            }

            if let Ok(frame) = KnxnetIpFrame::parse(&buf[..len]) {
                assert_eq!(frame.header().total_length as usize, len);
                let src = src();
                let body = frame.body();
                // Service parsers must reject or accept without panicking
                let _ = Hpai::parse(body, src);
                let _ = HpaiV4::parse(body, [1, 2, 3, 4], 1);
            }
        }
    }
}
