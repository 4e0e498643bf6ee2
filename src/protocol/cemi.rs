//! Common External Message Interface (cEMI) codec.
//!
//! cEMI is the byte-level telegram format carried inside KNXnet/IP
//! payloads. The gateway treats the transport PDU as opaque: it converts
//! between the raw byte sequence and an owned [`LData`] record (control
//! fields, source, destination, payload), re-stamps leaders when echoing,
//! and never interprets APCI.
//!
//! ## L_Data frame structure
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ Message Code (1 byte)                    │
//! ├──────────────────────────────────────────┤
//! │ Additional Info Length (1 byte)          │
//! ├──────────────────────────────────────────┤
//! │ Additional Info (variable)               │
//! ├──────────────────────────────────────────┤
//! │ Control Field 1 (1 byte)                 │
//! │ Control Field 2 (1 byte)                 │
//! │ Source Address (2 bytes)                 │
//! │ Destination Address (2 bytes)            │
//! │ NPDU Length (1 byte)                     │
//! │ TPCI/APCI + Data (NPDU Length bytes)     │
//! └──────────────────────────────────────────┘
//! ```

use crate::addressing::{GroupAddress, IndividualAddress};
use crate::error::{KnxError, Result};
use crate::protocol::constants::{CEMIMessageCode, Priority, MAX_CEMI_SIZE};

/// Maximum transport PDU (TPCI/APCI + data) carried by one cEMI frame
pub const MAX_TPDU_SIZE: usize = MAX_CEMI_SIZE - 9;

/// Additional-info type code for busmonitor status (carries the monitor
/// sequence number)
pub const ADDINFO_BUSMONITOR_STATUS: u8 = 0x03;

/// Control Field 1 of `L_Data` frame
///
/// ```text
/// Bit 7: Frame Type (0=extended, 1=standard)
/// Bit 6: Reserved
/// Bit 5: Repeat (0=repeat, 1=do not repeat)
/// Bit 4: System Broadcast (0=system, 1=broadcast)
/// Bit 3-2: Priority (00=system, 01=normal, 10=urgent, 11=low)
/// Bit 1: Acknowledge Request
/// Bit 0: Confirm (0=no error, 1=error)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ControlField1 {
    raw: u8,
}

impl From<u8> for ControlField1 {
    #[inline(always)]
    fn from(raw: u8) -> Self {
        Self { raw }
    }
}

impl From<ControlField1> for u8 {
    #[inline(always)]
    fn from(ctrl: ControlField1) -> u8 {
        ctrl.raw
    }
}

impl ControlField1 {
    /// Get raw byte value
    #[inline(always)]
    pub const fn raw(self) -> u8 {
        self.raw
    }

    /// Check if frame is standard (true) or extended (false)
    #[inline(always)]
    pub const fn is_standard_frame(self) -> bool {
        (self.raw & 0x80) != 0
    }

    /// Get priority
    #[inline(always)]
    pub const fn priority(self) -> Priority {
        Priority::from_u8((self.raw >> 2) & 0x03)
    }

    /// Check if confirm error flag is set
    #[inline(always)]
    pub const fn has_error(self) -> bool {
        (self.raw & 0x01) != 0
    }
}

impl Default for ControlField1 {
    #[inline]
    fn default() -> Self {
        // Standard frame, repeat allowed, broadcast, normal priority
        Self { raw: 0xBC }
    }
}

/// Control Field 2 of `L_Data` frame
///
/// ```text
/// Bit 7: Destination Address Type (0=individual, 1=group)
/// Bit 6-4: Hop Count (0-7)
/// Bit 3-0: Extended Frame Format (0000=standard)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ControlField2 {
    raw: u8,
}

impl From<u8> for ControlField2 {
    #[inline(always)]
    fn from(raw: u8) -> Self {
        Self { raw }
    }
}

impl From<ControlField2> for u8 {
    #[inline(always)]
    fn from(ctrl: ControlField2) -> u8 {
        ctrl.raw
    }
}

impl ControlField2 {
    /// Get raw byte value
    #[inline(always)]
    pub const fn raw(self) -> u8 {
        self.raw
    }

    /// Check if destination is group address (true) or individual (false)
    #[inline(always)]
    pub const fn is_group_address(self) -> bool {
        (self.raw & 0x80) != 0
    }

    /// Get hop count (0-7)
    #[inline(always)]
    pub const fn hop_count(self) -> u8 {
        (self.raw >> 4) & 0x07
    }
}

impl Default for ControlField2 {
    #[inline]
    fn default() -> Self {
        // Group address, hop count 6, standard format
        Self { raw: 0xE0 }
    }
}

/// Owned KNX data-link telegram.
///
/// The record the bus router exchanges with the gateway core. Conversion to
/// and from raw cEMI bytes is the pure pair [`LData::from_cemi`] /
/// [`LData::to_cemi`]; the message code lives on the wire only, so one
/// record can be re-emitted under a different leader (request, indication,
/// confirmation).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LData {
    /// Control field 1
    pub ctrl1: ControlField1,
    /// Control field 2
    pub ctrl2: ControlField2,
    /// Source address (individual)
    pub source: IndividualAddress,
    /// Destination address (individual or group, see ctrl2)
    pub destination: u16,
    /// Transport PDU: TPCI/APCI and application data
    pub payload: heapless::Vec<u8, MAX_TPDU_SIZE>,
}

impl LData {
    /// Create a group-addressed telegram with default control fields.
    pub fn new(source: IndividualAddress, destination: GroupAddress, payload: &[u8]) -> Result<Self> {
        let mut tpdu = heapless::Vec::new();
        tpdu.extend_from_slice(payload)
            .map_err(|_| KnxError::payload_too_large())?;
        Ok(Self {
            ctrl1: ControlField1::default(),
            ctrl2: ControlField2::default(),
            source,
            destination: destination.raw(),
            payload: tpdu,
        })
    }

    /// Get destination as group address (if applicable)
    #[inline]
    pub fn destination_group(&self) -> Option<GroupAddress> {
        self.ctrl2
            .is_group_address()
            .then(|| GroupAddress::from(self.destination))
    }

    /// Get destination as individual address (if applicable)
    #[inline]
    pub fn destination_individual(&self) -> Option<IndividualAddress> {
        (!self.ctrl2.is_group_address()).then(|| IndividualAddress::from(self.destination))
    }

    /// Parse an `L_Data` cEMI frame (`L_Data.req`, `L_Data.ind` or
    /// `L_Data.con`), skipping any additional information.
    ///
    /// # Errors
    ///
    /// Returns an invalid-message-code error for other leaders and a
    /// malformed-frame error when the NPDU length overruns the buffer.
    pub fn from_cemi(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(KnxError::buffer_too_small());
        }
        match CEMIMessageCode::from_u8(data[0]) {
            Some(
                CEMIMessageCode::LDataReq | CEMIMessageCode::LDataInd | CEMIMessageCode::LDataCon,
            ) => {}
            _ => return Err(KnxError::invalid_message_code()),
        }

        let service = 2 + data[1] as usize;
        if data.len() < service + 7 {
            return Err(KnxError::malformed_frame());
        }

        let npdu_length = data[service + 6] as usize;
        let end = service + 7 + npdu_length;
        if data.len() < end || npdu_length > MAX_TPDU_SIZE {
            return Err(KnxError::malformed_frame());
        }

        let mut payload = heapless::Vec::new();
        // Length checked against MAX_TPDU_SIZE above
        payload
            .extend_from_slice(&data[service + 7..end])
            .map_err(|_| KnxError::malformed_frame())?;

        Ok(Self {
            ctrl1: ControlField1::from(data[service]),
            ctrl2: ControlField2::from(data[service + 1]),
            source: IndividualAddress::decode(&data[service + 2..service + 4])?,
            destination: u16::from_be_bytes([data[service + 4], data[service + 5]]),
            payload,
        })
    }

    /// Emit this telegram as a cEMI frame under the given message code,
    /// without additional information.
    pub fn to_cemi(&self, code: CEMIMessageCode, buf: &mut [u8]) -> Result<usize> {
        let total = 9 + self.payload.len();
        if buf.len() < total {
            return Err(KnxError::buffer_too_small());
        }

        buf[0] = code.to_u8();
        buf[1] = 0x00;
        buf[2] = self.ctrl1.raw();
        buf[3] = self.ctrl2.raw();
        self.source.encode(&mut buf[4..6])?;
        buf[6..8].copy_from_slice(&self.destination.to_be_bytes());
        buf[8] = self.payload.len() as u8;
        buf[9..total].copy_from_slice(&self.payload);

        Ok(total)
    }
}

/// Message code of a cEMI frame, without validating the rest.
///
/// Used by the dispatcher to branch on the leader byte before full parsing.
#[inline]
pub fn message_code(data: &[u8]) -> Option<CEMIMessageCode> {
    data.first().copied().and_then(CEMIMessageCode::from_u8)
}

/// Wrap a raw bus frame into an `L_Busmon.ind` cEMI frame.
///
/// The monitor sequence number travels in a busmonitor-status additional
/// information block: `[2B 03 03 01 <seq> <frame…>]`.
pub fn busmonitor_to_cemi(seqno: u8, frame: &[u8], buf: &mut [u8]) -> Result<usize> {
    let total = 5 + frame.len();
    if total > MAX_CEMI_SIZE {
        return Err(KnxError::payload_too_large());
    }
    if buf.len() < total {
        return Err(KnxError::buffer_too_small());
    }

    buf[0] = CEMIMessageCode::LBusmonInd.to_u8();
    buf[1] = 0x03;
    buf[2] = ADDINFO_BUSMONITOR_STATUS;
    buf[3] = 0x01;
    buf[4] = seqno;
    buf[5..total].copy_from_slice(frame);

    Ok(total)
}

/// `M_PropRead` request/confirmation fields.
///
/// Device-management cEMI has no additional-info byte: the seven-byte
/// layout is `[code, object_type(2), object_instance, property_id,
/// count(4 bits)|start_hi(4 bits), start_lo]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PropRead {
    /// Interface object type
    pub object_type: u16,
    /// Object instance
    pub object_instance: u8,
    /// Property identifier
    pub property_id: u8,
    /// Number of elements (4 bits)
    pub count: u8,
    /// Start index (12 bits)
    pub start: u16,
}

impl PropRead {
    /// Size of an `M_PropRead.req` frame
    pub const REQ_SIZE: usize = 7;

    /// Parse an `M_PropRead.req` cEMI frame.
    pub fn parse_req(cemi: &[u8]) -> Result<Self> {
        if cemi.len() != Self::REQ_SIZE {
            return Err(KnxError::malformed_frame());
        }
        if cemi[0] != CEMIMessageCode::MPropReadReq.to_u8() {
            return Err(KnxError::invalid_message_code());
        }
        Ok(Self {
            object_type: u16::from_be_bytes([cemi[1], cemi[2]]),
            object_instance: cemi[3],
            property_id: cemi[4],
            count: (cemi[5] >> 4) & 0x0F,
            start: (u16::from(cemi[5] & 0x0F) << 8) | u16::from(cemi[6]),
        })
    }

    /// Build an `M_PropRead.con` cEMI frame carrying `data`.
    pub fn build_con(&self, data: &[u8], buf: &mut [u8]) -> Result<usize> {
        let total = Self::REQ_SIZE + data.len();
        if buf.len() < total {
            return Err(KnxError::buffer_too_small());
        }

        buf[0] = CEMIMessageCode::MPropReadCon.to_u8();
        buf[1..3].copy_from_slice(&self.object_type.to_be_bytes());
        buf[3] = self.object_instance;
        buf[4] = self.property_id;
        buf[5] = ((self.count & 0x0F) << 4) | ((self.start >> 8) as u8 & 0x0F);
        buf[6] = (self.start & 0xFF) as u8;
        buf[7..total].copy_from_slice(data);

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // L_Data.ind, group write 0/0/1 from 1.2.3, value 0x81
    const SAMPLE_IND: [u8; 11] = [
        0x29, 0x00, 0xBC, 0xE0, 0x12, 0x03, 0x00, 0x01, 0x02, 0x00, 0x81,
    ];

    #[test]
    fn test_from_cemi() {
        let l = LData::from_cemi(&SAMPLE_IND).unwrap();
        assert_eq!(l.source, IndividualAddress::new(1, 2, 3).unwrap());
        assert_eq!(l.destination_group().unwrap(), crate::ga!(0 / 0 / 1));
        assert!(l.destination_individual().is_none());
        assert_eq!(l.payload.as_slice(), &[0x00, 0x81]);
        assert!(l.ctrl1.is_standard_frame());
        assert_eq!(l.ctrl1.priority(), Priority::Normal);
        assert_eq!(l.ctrl2.hop_count(), 6);
    }

    #[test]
    fn test_from_cemi_with_additional_info() {
        let data = [
            0x11, 0x04, 0xAA, 0xBB, 0xCC, 0xDD, // code, add info
            0xBC, 0xE0, 0x12, 0x03, 0x00, 0x01, 0x02, 0x00, 0x81,
        ];
        let l = LData::from_cemi(&data).unwrap();
        assert_eq!(l.payload.as_slice(), &[0x00, 0x81]);
    }

    #[test]
    fn test_from_cemi_rejects_wrong_leader() {
        let mut data = SAMPLE_IND;
        data[0] = 0x2B; // busmonitor, not L_Data
        assert!(LData::from_cemi(&data).is_err());
        data[0] = 0xF0;
        assert!(LData::from_cemi(&data).is_err());
    }

    #[test]
    fn test_from_cemi_rejects_npdu_overrun() {
        let mut data = SAMPLE_IND;
        data[8] = 0x20; // NPDU length beyond the buffer
        assert!(LData::from_cemi(&data).is_err());
    }

    #[test]
    fn test_to_cemi_roundtrip() {
        let l = LData::from_cemi(&SAMPLE_IND).unwrap();
        let mut buf = [0u8; 64];
        let len = l.to_cemi(CEMIMessageCode::LDataInd, &mut buf).unwrap();
        assert_eq!(&buf[..len], &SAMPLE_IND);
    }

    #[test]
    fn test_to_cemi_relabels_leader() {
        let l = LData::from_cemi(&SAMPLE_IND).unwrap();
        let mut buf = [0u8; 64];
        let len = l.to_cemi(CEMIMessageCode::LDataCon, &mut buf).unwrap();
        assert_eq!(buf[0], 0x2E);
        assert_eq!(&buf[1..len], &SAMPLE_IND[1..]);
    }

    #[test]
    fn test_message_code_peek() {
        assert_eq!(message_code(&SAMPLE_IND), Some(CEMIMessageCode::LDataInd));
        assert_eq!(message_code(&[0xF0, 0x00]), None);
        assert_eq!(message_code(&[]), None);
    }

    #[test]
    fn test_busmonitor_wrapping() {
        let raw = [0xBC, 0x12, 0x03, 0x00, 0x01, 0xE1, 0x00, 0x81, 0x5A];
        let mut buf = [0u8; 64];
        let len = busmonitor_to_cemi(7, &raw, &mut buf).unwrap();
        assert_eq!(len, 5 + raw.len());
        assert_eq!(&buf[..5], &[0x2B, 0x03, 0x03, 0x01, 0x07]);
        assert_eq!(&buf[5..len], &raw);
    }

    #[test]
    fn test_prop_read_parse() {
        // object 0, instance 0, property 0, count 1, start 0
        let req = [0xFC, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00];
        let p = PropRead::parse_req(&req).unwrap();
        assert_eq!(p.object_type, 0);
        assert_eq!(p.object_instance, 0);
        assert_eq!(p.property_id, 0);
        assert_eq!(p.count, 1);
        assert_eq!(p.start, 0);

        assert!(PropRead::parse_req(&req[..6]).is_err());
        let mut bad = req;
        bad[0] = 0xFB;
        assert!(PropRead::parse_req(&bad).is_err());
    }

    #[test]
    fn test_prop_read_start_is_12_bits() {
        let req = [0xFC, 0x00, 0x08, 0x01, 0x35, 0x21, 0x34];
        let p = PropRead::parse_req(&req).unwrap();
        assert_eq!(p.object_type, 8);
        assert_eq!(p.count, 2);
        assert_eq!(p.start, 0x134);
    }

    #[test]
    fn test_prop_read_con_roundtrip() {
        let p = PropRead {
            object_type: 0,
            object_instance: 0,
            property_id: 0,
            count: 1,
            start: 0,
        };
        let mut buf = [0u8; 16];
        let len = p.build_con(&[0x00, 0x00], &mut buf).unwrap();
        assert_eq!(len, 9);
        assert_eq!(buf[0], 0xFB);
        assert_eq!(&buf[7..9], &[0x00, 0x00]);
        assert_eq!(buf[5], 0x10);
    }
}
