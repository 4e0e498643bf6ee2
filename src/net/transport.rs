//! Network transport abstraction for KNXnet/IP communication.
//!
//! The `AsyncTransport` trait decouples the server core from the actual
//! datagram socket, enabling:
//! - Testability through mock implementations
//! - Flexibility across socket stacks (hosted `async-io`, embedded, …)
//!
//! The server core never calls a transport directly; the serve loop moves
//! datagrams between the transport and the sans-I/O [`Endpoint`]
//! (`net::endpoint`) queue.
//!
//! [`Endpoint`]: crate::net::endpoint::Endpoint

use crate::error::Result;
use crate::net::{IpEndpoint, Ipv6Addr};

/// Asynchronous datagram transport.
///
/// Implementations map transient send conditions (`EAGAIN`,
/// `EWOULDBLOCK`, `EINTR`) to [`KnxError::Timeout`] so the caller can
/// retry the same datagram, and all other failures to hard transport
/// errors.
///
/// [`KnxError::Timeout`]: crate::error::KnxError::Timeout
#[allow(async_fn_in_trait)]
pub trait AsyncTransport {
    /// Send one datagram to a specific endpoint.
    async fn send_to(&mut self, data: &[u8], addr: IpEndpoint) -> Result<()>;

    /// Receive one datagram.
    ///
    /// Returns the number of bytes received and the source endpoint.
    /// Oversize datagrams are truncated to the buffer; the frame codec's
    /// length check rejects them afterwards.
    async fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, IpEndpoint)>;

    /// Join an IPv6 multicast group.
    ///
    /// Default implementation is a no-op for transports without multicast
    /// support.
    fn join_multicast(&mut self, _group: Ipv6Addr) -> Result<()> {
        Ok(())
    }

    /// Leave an IPv6 multicast group. No-op by default.
    fn leave_multicast(&mut self, _group: Ipv6Addr) -> Result<()> {
        Ok(())
    }

    /// The local endpoint this transport is bound to, if known.
    fn local_endpoint(&self) -> Option<IpEndpoint> {
        None
    }

    /// Close the transport and release resources. No-op by default.
    fn close(&mut self) {}
}
