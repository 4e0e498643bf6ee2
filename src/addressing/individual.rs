//! KNX Individual Address implementation.
//!
//! Individual addresses identify physical devices on the KNX bus.
//! Format: Area.Line.Device (e.g., 1.1.5)
//! - Area: 0-15 (4 bits)
//! - Line: 0-15 (4 bits)
//! - Device: 0-255 (8 bits)

use crate::error::{KnxError, Result};
use core::fmt;

/// KNX Individual Address (Area.Line.Device)
///
/// The server hands one of these to every tunnelling client from the
/// router's client-address pool; address `0.0.0` marks an unassigned or
/// configuration-only connection.
///
/// # Examples
///
/// ```
/// use knx_gateway::IndividualAddress;
///
/// let addr = IndividualAddress::new(1, 1, 42).unwrap();
/// assert_eq!(addr.to_string(), "1.1.42");
/// assert_eq!(addr.raw(), 0x112A);
///
/// let addr: IndividualAddress = "1.1.42".parse().unwrap();
/// assert_eq!(u16::from(addr), 0x112A);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IndividualAddress {
    raw: u16,
}

impl IndividualAddress {
    /// Maximum area value (4 bits)
    pub const MAX_AREA: u8 = 15;
    /// Maximum line value (4 bits)
    pub const MAX_LINE: u8 = 15;

    /// The unassigned address `0.0.0`.
    pub const UNASSIGNED: Self = Self { raw: 0 };

    /// Create a new Individual Address from components.
    ///
    /// # Errors
    ///
    /// Returns an addressing error if `area` or `line` is out of range.
    pub fn new(area: u8, line: u8, device: u8) -> Result<Self> {
        if area > Self::MAX_AREA || line > Self::MAX_LINE {
            return Err(KnxError::address_out_of_range());
        }
        let raw = (u16::from(area) << 12) | (u16::from(line) << 8) | u16::from(device);
        Ok(Self { raw })
    }

    /// Get the raw u16 representation of the address.
    #[inline(always)]
    pub const fn raw(self) -> u16 {
        self.raw
    }

    /// Whether this is the unassigned address `0.0.0`.
    #[inline(always)]
    pub const fn is_unassigned(self) -> bool {
        self.raw == 0
    }

    /// Get the area component (0-15).
    #[inline(always)]
    pub const fn area(self) -> u8 {
        ((self.raw >> 12) & 0x0F) as u8
    }

    /// Get the line component (0-15).
    #[inline(always)]
    pub const fn line(self) -> u8 {
        ((self.raw >> 8) & 0x0F) as u8
    }

    /// Get the device component (0-255).
    #[inline(always)]
    pub const fn device(self) -> u8 {
        (self.raw & 0xFF) as u8
    }

    /// Encode the address into a byte buffer (big-endian).
    #[inline]
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < 2 {
            return Err(KnxError::buffer_too_small());
        }
        buf[0..2].copy_from_slice(&self.raw.to_be_bytes());
        Ok(2)
    }

    /// Decode an address from a byte buffer (big-endian).
    #[inline]
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(KnxError::buffer_too_small());
        }
        Ok(Self {
            raw: u16::from_be_bytes([buf[0], buf[1]]),
        })
    }
}

impl fmt::Display for IndividualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.area(), self.line(), self.device())
    }
}

impl From<u16> for IndividualAddress {
    #[inline(always)]
    fn from(raw: u16) -> Self {
        Self { raw }
    }
}

impl From<IndividualAddress> for u16 {
    #[inline(always)]
    fn from(addr: IndividualAddress) -> u16 {
        addr.raw
    }
}

impl core::str::FromStr for IndividualAddress {
    type Err = KnxError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('.');

        let area = parts
            .next()
            .and_then(|s| s.parse::<u8>().ok())
            .ok_or_else(KnxError::invalid_individual_address)?;

        let line = parts
            .next()
            .and_then(|s| s.parse::<u8>().ok())
            .ok_or_else(KnxError::invalid_individual_address)?;

        let device = parts
            .next()
            .and_then(|s| s.parse::<u8>().ok())
            .ok_or_else(KnxError::invalid_individual_address)?;

        if parts.next().is_some() {
            return Err(KnxError::invalid_individual_address());
        }

        Self::new(area, line, device).map_err(|_| KnxError::invalid_individual_address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_valid() {
        let addr = IndividualAddress::new(1, 2, 3).unwrap();
        assert_eq!(addr.area(), 1);
        assert_eq!(addr.line(), 2);
        assert_eq!(addr.device(), 3);
    }

    #[test]
    fn test_new_invalid() {
        assert!(IndividualAddress::new(16, 0, 0).is_err());
        assert!(IndividualAddress::new(0, 16, 0).is_err());
    }

    #[test]
    fn test_raw_roundtrip() {
        let addr = IndividualAddress::from(0x1203u16);
        assert_eq!(addr.area(), 1);
        assert_eq!(addr.line(), 2);
        assert_eq!(addr.device(), 3);
        assert_eq!(u16::from(addr), 0x1203);
    }

    #[test]
    fn test_unassigned() {
        assert!(IndividualAddress::UNASSIGNED.is_unassigned());
        assert!(!IndividualAddress::new(0, 0, 1).unwrap().is_unassigned());
    }

    #[test]
    fn test_encode_decode() {
        let addr = IndividualAddress::new(15, 15, 255).unwrap();
        let mut buf = [0u8; 2];
        addr.encode(&mut buf).unwrap();
        assert_eq!(IndividualAddress::decode(&buf).unwrap(), addr);
    }

    #[test]
    fn test_display() {
        let addr = IndividualAddress::new(1, 2, 3).unwrap();
        let mut s = heapless::String::<16>::new();
        core::fmt::write(&mut s, format_args!("{addr}")).unwrap();
        assert_eq!(s.as_str(), "1.2.3");
    }

    #[test]
    fn test_from_str() {
        let addr: IndividualAddress = "1.2.3".parse().unwrap();
        assert_eq!(addr.raw(), 0x1203);
    }

    #[test]
    fn test_from_str_invalid() {
        assert!("1.2".parse::<IndividualAddress>().is_err());
        assert!("16.0.0".parse::<IndividualAddress>().is_err());
        assert!("1.2.3.4".parse::<IndividualAddress>().is_err());
        assert!("a.b.c".parse::<IndividualAddress>().is_err());
        assert!("".parse::<IndividualAddress>().is_err());
    }
}
