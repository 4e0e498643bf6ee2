//! Mock transport implementation for testing.
//!
//! Simulates the datagram socket so protocol and server logic can be
//! exercised without network hardware: pre-program inbound datagrams,
//! inspect what was sent, and simulate send failures.
//!
//! When the inbound queue runs dry, `recv_from` reports a receive failure;
//! the serve loop treats that as a non-transient error and stops, which
//! conveniently terminates test runs after all programmed traffic has been
//! consumed.

use crate::error::{KnxError, Result};
use crate::net::transport::AsyncTransport;
use crate::net::{IpEndpoint, Ipv6Addr};

#[cfg(feature = "std")]
use std::collections::VecDeque;
#[cfg(feature = "std")]
use std::vec::Vec;

#[cfg(not(feature = "std"))]
extern crate alloc;
#[cfg(not(feature = "std"))]
use alloc::collections::VecDeque;
#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

/// Mock transport for testing KNX communication without a real network.
#[derive(Debug, Default)]
pub struct MockTransport {
    /// Queue of pre-programmed datagrams returned by `recv_from()`
    inbound: VecDeque<(Vec<u8>, IpEndpoint)>,
    /// Record of all datagrams sent via `send_to()`
    sent: Vec<(Vec<u8>, IpEndpoint)>,
    /// Sends to fail with a transient error before succeeding
    transient_failures: usize,
    /// Multicast groups currently joined
    joined: Vec<Ipv6Addr>,
    /// Local endpoint reported to the server
    local: Option<IpEndpoint>,
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the local endpoint reported by `local_endpoint()`.
    pub fn set_local(&mut self, local: IpEndpoint) {
        self.local = Some(local);
    }

    /// Queue a datagram to be returned by the next `recv_from()` call.
    ///
    /// Datagrams are returned in FIFO order.
    pub fn push_inbound(&mut self, data: &[u8], from: IpEndpoint) {
        self.inbound.push_back((data.to_vec(), from));
    }

    /// All datagrams sent via `send_to()`, as `(data, destination)` pairs.
    pub fn sent(&self) -> &[(Vec<u8>, IpEndpoint)] {
        &self.sent
    }

    /// The last datagram sent, if any.
    pub fn last_sent(&self) -> Option<&(Vec<u8>, IpEndpoint)> {
        self.sent.last()
    }

    /// Clear the sent-datagram history.
    pub fn clear_sent(&mut self) {
        self.sent.clear();
    }

    /// Fail the next `count` sends with a transient error.
    pub fn fail_next_sends(&mut self, count: usize) {
        self.transient_failures = count;
    }

    /// Multicast groups joined and not yet left.
    pub fn joined_groups(&self) -> &[Ipv6Addr] {
        &self.joined
    }

    /// Number of datagrams still queued for delivery.
    pub fn pending(&self) -> usize {
        self.inbound.len()
    }
}

impl AsyncTransport for MockTransport {
    async fn send_to(&mut self, data: &[u8], addr: IpEndpoint) -> Result<()> {
        if self.transient_failures > 0 {
            self.transient_failures -= 1;
            return Err(KnxError::Timeout);
        }
        self.sent.push((data.to_vec(), addr));
        Ok(())
    }

    async fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, IpEndpoint)> {
        match self.inbound.pop_front() {
            Some((data, from)) => {
                // Oversize datagrams are truncated like a real socket
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok((len, from))
            }
            None => Err(KnxError::receive_failed()),
        }
    }

    fn join_multicast(&mut self, group: Ipv6Addr) -> Result<()> {
        self.joined.push(group);
        Ok(())
    }

    fn leave_multicast(&mut self, group: Ipv6Addr) -> Result<()> {
        self.joined.retain(|g| *g != group);
        Ok(())
    }

    fn local_endpoint(&self) -> Option<IpEndpoint> {
        self.local
    }

    fn close(&mut self) {
        self.inbound.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::future::block_on;

    fn ep(addr: &str, port: u16) -> IpEndpoint {
        IpEndpoint::new(addr.parse().unwrap(), port)
    }

    #[test]
    fn test_mock_send_receive() {
        block_on(async {
            let mut mock = MockTransport::new();
            mock.push_inbound(&[0x01, 0x02, 0x03], ep("fe80::1", 3671));

            let dest = ep("fe80::2", 3671);
            mock.send_to(&[0xAA, 0xBB], dest).await.unwrap();

            assert_eq!(mock.sent().len(), 1);
            assert_eq!(mock.sent()[0].0, vec![0xAA, 0xBB]);
            assert_eq!(mock.sent()[0].1, dest);

            let mut buf = [0u8; 16];
            let (n, from) = mock.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], &[0x01, 0x02, 0x03]);
            assert_eq!(from, ep("fe80::1", 3671));
        });
    }

    #[test]
    fn test_mock_empty_queue_is_receive_error() {
        block_on(async {
            let mut mock = MockTransport::new();
            let mut buf = [0u8; 16];
            assert!(mock.recv_from(&mut buf).await.is_err());
        });
    }

    #[test]
    fn test_mock_fifo_order() {
        block_on(async {
            let mut mock = MockTransport::new();
            mock.push_inbound(&[1], ep("fe80::1", 1));
            mock.push_inbound(&[2], ep("fe80::1", 1));

            let mut buf = [0u8; 16];
            let (_, _) = mock.recv_from(&mut buf).await.unwrap();
            assert_eq!(buf[0], 1);
            let (_, _) = mock.recv_from(&mut buf).await.unwrap();
            assert_eq!(buf[0], 2);
        });
    }

    #[test]
    fn test_mock_transient_failures() {
        block_on(async {
            let mut mock = MockTransport::new();
            mock.fail_next_sends(2);

            let dest = ep("fe80::2", 3671);
            assert_eq!(mock.send_to(&[1], dest).await, Err(KnxError::Timeout));
            assert_eq!(mock.send_to(&[1], dest).await, Err(KnxError::Timeout));
            assert!(mock.send_to(&[1], dest).await.is_ok());
            assert_eq!(mock.sent().len(), 1);
        });
    }

    #[test]
    fn test_mock_multicast_bookkeeping() {
        let mut mock = MockTransport::new();
        let group: Ipv6Addr = "ff12::4242".parse().unwrap();
        mock.join_multicast(group).unwrap();
        assert_eq!(mock.joined_groups(), &[group]);
        mock.leave_multicast(group).unwrap();
        assert!(mock.joined_groups().is_empty());
    }
}
