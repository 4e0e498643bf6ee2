//! Error types for the KNXnet/IP server.
//!
//! A single [`KnxError`] enum wraps per-category kind enums so that callers
//! can match broadly (protocol vs. transport) or narrowly (a specific kind)
//! without the crate exporting a flat, ever-growing variant list.

use core::fmt;

/// Result type alias for gateway operations.
pub type Result<T> = core::result::Result<T, KnxError>;

// =============================================================================
// Error Kind Enums
// =============================================================================

/// Protocol error variants (frame and payload parsing)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolErrorKind {
    /// Structural parse failure: length field disagrees with the buffer,
    /// bad HPAI constant, bad CRI/CRD length byte, bad connection header
    MalformedFrame,
    UnsupportedVersion,
    UnsupportedServiceType,
    PayloadTooLarge,
    InvalidMessageCode,
}

/// Connection error variants (per-client state machines)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionErrorKind {
    UnknownChannel,
    SequenceMismatch,
    RetryExhausted,
    HeartbeatExpired,
    NoFreeChannels,
}

/// Transport error variants (socket and queue)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportErrorKind {
    SendFailed,
    ReceiveFailed,
    BufferTooSmall,
    NotBound,
    /// Repeated hard send errors or a non-transient receive error;
    /// the server reacts by stopping
    EndpointFailed,
}

/// Addressing error variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AddressingErrorKind {
    InvalidIndividualAddress,
    InvalidGroupAddress,
    InvalidIpAddress,
    OutOfRange,
}

/// Server lifecycle and configuration error variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ServerErrorKind {
    /// Neither tunnel, route nor discover was requested
    NothingEnabled,
    /// Tunnelling requested but the router cannot supply client addresses
    NoClientAddrs,
    /// A feature link stack failed validation
    StackCheckFailed,
    /// Operation not valid in the current lifecycle state
    InvalidState,
    /// Local source address could not be determined
    NoSourceAddress,
}

// =============================================================================
// Main Error Type
// =============================================================================

/// Gateway error type.
///
/// Returned by all fallible operations in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum KnxError {
    /// Frame or payload parsing errors
    Protocol(ProtocolErrorKind),
    /// Connection state machine errors
    Connection(ConnectionErrorKind),
    /// Socket and send-queue errors
    Transport(TransportErrorKind),
    /// KNX or IP address errors
    Addressing(AddressingErrorKind),
    /// Server lifecycle and configuration errors
    Server(ServerErrorKind),
    /// Operation timeout
    Timeout,
}

// =============================================================================
// Convenience Constructors
// =============================================================================

impl KnxError {
    // Protocol errors
    #[inline]
    pub(crate) const fn malformed_frame() -> Self {
        Self::Protocol(ProtocolErrorKind::MalformedFrame)
    }

    #[inline]
    pub(crate) const fn unsupported_version() -> Self {
        Self::Protocol(ProtocolErrorKind::UnsupportedVersion)
    }

    #[inline]
    pub(crate) const fn unsupported_service_type() -> Self {
        Self::Protocol(ProtocolErrorKind::UnsupportedServiceType)
    }

    #[inline]
    pub(crate) const fn payload_too_large() -> Self {
        Self::Protocol(ProtocolErrorKind::PayloadTooLarge)
    }

    #[inline]
    pub(crate) const fn invalid_message_code() -> Self {
        Self::Protocol(ProtocolErrorKind::InvalidMessageCode)
    }

    // Connection errors
    pub(crate) const fn unknown_channel() -> Self {
        Self::Connection(ConnectionErrorKind::UnknownChannel)
    }

    // Transport errors
    pub(crate) const fn buffer_too_small() -> Self {
        Self::Transport(TransportErrorKind::BufferTooSmall)
    }

    pub(crate) const fn send_failed() -> Self {
        Self::Transport(TransportErrorKind::SendFailed)
    }

    pub(crate) const fn receive_failed() -> Self {
        Self::Transport(TransportErrorKind::ReceiveFailed)
    }

    pub(crate) const fn not_bound() -> Self {
        Self::Transport(TransportErrorKind::NotBound)
    }

    pub(crate) const fn endpoint_failed() -> Self {
        Self::Transport(TransportErrorKind::EndpointFailed)
    }

    // Addressing errors
    pub(crate) const fn invalid_individual_address() -> Self {
        Self::Addressing(AddressingErrorKind::InvalidIndividualAddress)
    }

    pub(crate) const fn invalid_group_address() -> Self {
        Self::Addressing(AddressingErrorKind::InvalidGroupAddress)
    }

    pub(crate) const fn invalid_ip_address() -> Self {
        Self::Addressing(AddressingErrorKind::InvalidIpAddress)
    }

    pub(crate) const fn address_out_of_range() -> Self {
        Self::Addressing(AddressingErrorKind::OutOfRange)
    }

    // Server errors
    pub(crate) const fn nothing_enabled() -> Self {
        Self::Server(ServerErrorKind::NothingEnabled)
    }

    pub(crate) const fn no_client_addrs() -> Self {
        Self::Server(ServerErrorKind::NoClientAddrs)
    }

    pub(crate) const fn stack_check_failed() -> Self {
        Self::Server(ServerErrorKind::StackCheckFailed)
    }

    pub(crate) const fn invalid_state() -> Self {
        Self::Server(ServerErrorKind::InvalidState)
    }

    pub(crate) const fn no_source_address() -> Self {
        Self::Server(ServerErrorKind::NoSourceAddress)
    }
}

// =============================================================================
// Predicates
// =============================================================================

impl KnxError {
    /// Check if this is a structural parse failure
    pub fn is_malformed_frame(&self) -> bool {
        matches!(self, Self::Protocol(ProtocolErrorKind::MalformedFrame))
    }

    /// Check if this is an endpoint failure (the server must stop)
    pub fn is_endpoint_failed(&self) -> bool {
        matches!(self, Self::Transport(TransportErrorKind::EndpointFailed))
    }

    /// Check if this is an out-of-window sequence number
    pub fn is_sequence_mismatch(&self) -> bool {
        matches!(self, Self::Connection(ConnectionErrorKind::SequenceMismatch))
    }
}

// =============================================================================
// Display Implementation
// =============================================================================

impl fmt::Display for KnxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KnxError::Protocol(kind) => write!(f, "Protocol error: {kind:?}"),
            KnxError::Connection(kind) => write!(f, "Connection error: {kind:?}"),
            KnxError::Transport(kind) => write!(f, "Transport error: {kind:?}"),
            KnxError::Addressing(kind) => write!(f, "Addressing error: {kind:?}"),
            KnxError::Server(kind) => write!(f, "Server error: {kind:?}"),
            KnxError::Timeout => write!(f, "Operation timeout"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for KnxError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        assert!(KnxError::malformed_frame().is_malformed_frame());
        assert!(KnxError::endpoint_failed().is_endpoint_failed());
        let seq = KnxError::Connection(ConnectionErrorKind::SequenceMismatch);
        assert!(seq.is_sequence_mismatch());
        assert!(!KnxError::Timeout.is_malformed_frame());
    }

    #[test]
    fn test_display() {
        let err = KnxError::unknown_channel();
        let mut buf = heapless::String::<64>::new();
        core::fmt::write(&mut buf, format_args!("{err}")).unwrap();
        assert!(buf.contains("UnknownChannel"));
    }
}
