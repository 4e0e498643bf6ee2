//! Description Information Blocks for discovery responses.
//!
//! `SEARCH_RESPONSE` and `DESCRIPTION_RESPONSE` carry a device-information
//! DIB followed by a supported-service-families DIB. The canonical 54-byte
//! device DIB has a 4-byte multicast field; this IPv6-native instantiation
//! widens it to 16 bytes (structure length 66) so the full group address
//! survives discovery.

use crate::addressing::IndividualAddress;
use crate::error::{KnxError, Result};
use crate::net::Ipv6Addr;

/// Description type code for the device-information DIB
pub const DIB_DEVICE_INFO: u8 = 0x01;

/// Description type code for the supported-service-families DIB
pub const DIB_SUPP_SVC_FAMILIES: u8 = 0x02;

/// KNX medium code for TP1 (twisted pair)
pub const MEDIUM_TP1: u8 = 0x02;

/// Device information DIB (66 bytes)
///
/// ```text
/// [0]      structure length (66)
/// [1]      description type (0x01)
/// [2]      KNX medium
/// [3]      device status
/// [4..6]   KNX individual address
/// [6..8]   installation id
/// [8..14]  serial number
/// [14..30] routing multicast address (IPv6)
/// [30..36] MAC address
/// [36..66] friendly name, NUL padded
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceDib {
    /// KNX medium code (TP1 by default, configurable)
    pub medium: u8,
    /// Device status byte
    pub status: u8,
    /// KNX individual address of the server
    pub addr: IndividualAddress,
    /// Installation identifier
    pub install_id: u16,
    /// Six-byte serial number
    pub serial: [u8; 6],
    /// Routing multicast address
    pub multicast: Ipv6Addr,
    /// Ethernet MAC address
    pub mac: [u8; 6],
    /// Friendly name, NUL padded
    pub name: [u8; 30],
}

impl DeviceDib {
    /// Size of the device DIB in bytes
    pub const SIZE: usize = 66;

    /// Copy a friendly name into the fixed 30-byte NUL-padded field.
    pub fn encode_name(name: &str) -> [u8; 30] {
        let mut out = [0u8; 30];
        let bytes = name.as_bytes();
        let len = bytes.len().min(out.len());
        out[..len].copy_from_slice(&bytes[..len]);
        out
    }

    /// The friendly name up to the first NUL.
    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(30);
        core::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    /// Encode the DIB into a buffer.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < Self::SIZE {
            return Err(KnxError::buffer_too_small());
        }

        buf[0] = Self::SIZE as u8;
        buf[1] = DIB_DEVICE_INFO;
        buf[2] = self.medium;
        buf[3] = self.status;
        self.addr.encode(&mut buf[4..6])?;
        buf[6..8].copy_from_slice(&self.install_id.to_be_bytes());
        buf[8..14].copy_from_slice(&self.serial);
        buf[14..30].copy_from_slice(&self.multicast.octets());
        buf[30..36].copy_from_slice(&self.mac);
        buf[36..66].copy_from_slice(&self.name);

        Ok(Self::SIZE)
    }

    /// Parse the DIB from a buffer.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(KnxError::buffer_too_small());
        }
        if data[0] != Self::SIZE as u8 || data[1] != DIB_DEVICE_INFO {
            return Err(KnxError::malformed_frame());
        }

        let mut serial = [0u8; 6];
        serial.copy_from_slice(&data[8..14]);
        let mut multicast = [0u8; 16];
        multicast.copy_from_slice(&data[14..30]);
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&data[30..36]);
        let mut name = [0u8; 30];
        name.copy_from_slice(&data[36..66]);
        // Terminator, in case the sender filled all 30 bytes
        name[29] = 0;

        Ok(Self {
            medium: data[2],
            status: data[3],
            addr: IndividualAddress::decode(&data[4..6])?,
            install_id: u16::from_be_bytes([data[6], data[7]]),
            serial,
            multicast: Ipv6Addr::from(multicast),
            mac,
            name,
        })
    }
}

/// KNXnet/IP service families advertised in discovery responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ServiceFamily {
    /// Core
    Core = 0x02,
    /// Device Management
    DeviceManagement = 0x03,
    /// Tunnelling
    Tunnelling = 0x04,
    /// Routing
    Routing = 0x05,
}

impl ServiceFamily {
    /// Convert u8 to `ServiceFamily`
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x02 => Some(Self::Core),
            0x03 => Some(Self::DeviceManagement),
            0x04 => Some(Self::Tunnelling),
            0x05 => Some(Self::Routing),
            _ => None,
        }
    }
}

/// Supported-service-families DIB
///
/// Wire layout: `[2 + 2n, 0x02, (family, version)*]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ServiceFamiliesDib {
    /// Advertised (family, version) entries
    pub families: heapless::Vec<(ServiceFamily, u8), 8>,
}

impl ServiceFamiliesDib {
    /// Add a family with protocol version 1.
    pub fn push(&mut self, family: ServiceFamily) {
        // Capacity 8 comfortably holds the four defined families
        let _ = self.families.push((family, 1));
    }

    /// Whether a family is advertised.
    pub fn contains(&self, family: ServiceFamily) -> bool {
        self.families.iter().any(|&(f, _)| f == family)
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        2 + self.families.len() * 2
    }

    /// Encode the DIB into a buffer.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let size = self.size();
        if buf.len() < size {
            return Err(KnxError::buffer_too_small());
        }

        buf[0] = size as u8;
        buf[1] = DIB_SUPP_SVC_FAMILIES;
        for (i, &(family, version)) in self.families.iter().enumerate() {
            buf[2 + i * 2] = family as u8;
            buf[3 + i * 2] = version;
        }

        Ok(size)
    }

    /// Parse the DIB from a buffer.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(KnxError::buffer_too_small());
        }
        let size = data[0] as usize;
        if data[1] != DIB_SUPP_SVC_FAMILIES || size % 2 != 0 || size < 2 || data.len() < size {
            return Err(KnxError::malformed_frame());
        }

        let mut dib = Self::default();
        for i in 0..(size - 2) / 2 {
            let family = ServiceFamily::from_u8(data[2 + i * 2])
                .ok_or_else(KnxError::malformed_frame)?;
            dib.families
                .push((family, data[3 + i * 2]))
                .map_err(|_| KnxError::malformed_frame())?;
        }
        Ok(dib)
    }
}
