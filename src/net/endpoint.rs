//! Sans-I/O UDP endpoint: send queue and receive filter.
//!
//! The endpoint owns the outbound FIFO of `(frame, destination)` pairs and
//! the inbound source filter. It performs no I/O itself; the serve loop
//! pulls the queue head, attempts the actual send, and reports the outcome
//! back so the retry/drop policy stays testable without sockets.

use crate::error::{KnxError, Result};
use crate::net::IpEndpoint;
use crate::protocol::constants::{MAX_FRAME_SIZE, MAX_SEND_ERRORS};

#[cfg(feature = "std")]
use std::collections::VecDeque;

#[cfg(not(feature = "std"))]
extern crate alloc;
#[cfg(not(feature = "std"))]
use alloc::collections::VecDeque;

/// One encoded KNXnet/IP frame, bounded by the maximum datagram size.
pub type FrameBuf = heapless::Vec<u8, MAX_FRAME_SIZE>;

/// Inbound source-address filter policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvFilter {
    /// Every datagram is delivered (server control socket).
    AcceptAll,
    /// Only datagrams from one preconfigured remote.
    FixedPeer(IpEndpoint),
    /// Drop datagrams whose source equals our own local endpoint; used by
    /// the multicast socket to suppress loopback echo.
    NotSelf,
    /// Accept datagrams from either of two configured peers.
    EitherPeer(IpEndpoint, IpEndpoint),
}

/// Result of one send attempt, reported by the I/O driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Datagram left the socket; pop it.
    Sent,
    /// Transient error (`EAGAIN`, `EWOULDBLOCK`, `EINTR`); keep the head.
    Transient,
    /// Hard error; repeated hard errors fail the endpoint.
    Hard,
}

/// Outbound queue plus receive filter for one UDP socket.
#[derive(Debug)]
pub struct Endpoint {
    queue: VecDeque<(FrameBuf, IpEndpoint)>,
    filter: RecvFilter,
    local: Option<IpEndpoint>,
    send_errors: u8,
    failed: bool,
}

impl Endpoint {
    /// Create an endpoint with the given receive filter.
    pub fn new(filter: RecvFilter) -> Self {
        Self {
            queue: VecDeque::new(),
            filter,
            local: None,
            send_errors: 0,
            failed: false,
        }
    }

    /// Record the local address this endpoint is reachable at. Unsolicited
    /// frames carrying our HPAI are only emitted once this is known.
    pub fn set_local(&mut self, local: IpEndpoint) {
        self.local = Some(local);
    }

    /// The local endpoint, if determined.
    pub fn local(&self) -> Option<IpEndpoint> {
        self.local
    }

    /// Replace the receive filter.
    pub fn set_filter(&mut self, filter: RecvFilter) {
        self.filter = filter;
    }

    /// Apply the receive filter to a datagram source.
    pub fn accepts(&self, src: &IpEndpoint) -> bool {
        match self.filter {
            RecvFilter::AcceptAll => true,
            RecvFilter::FixedPeer(peer) => *src == peer,
            RecvFilter::NotSelf => self.local.is_none_or(|local| *src != local),
            RecvFilter::EitherPeer(a, b) => *src == a || *src == b,
        }
    }

    /// Append one frame to the send queue.
    pub fn enqueue(&mut self, frame: &[u8], dst: IpEndpoint) -> Result<()> {
        let mut buf = FrameBuf::new();
        buf.extend_from_slice(frame)
            .map_err(|_| KnxError::payload_too_large())?;
        self.queue.push_back((buf, dst));
        Ok(())
    }

    /// The queue head, if any.
    pub fn front(&self) -> Option<(&[u8], IpEndpoint)> {
        self.queue.front().map(|(frame, dst)| (frame.as_slice(), *dst))
    }

    /// Number of queued datagrams.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the send queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Take the queue head, bypassing the error bookkeeping. Used by tests
    /// and by drivers that cannot report outcomes.
    pub fn pop(&mut self) -> Option<(FrameBuf, IpEndpoint)> {
        self.queue.pop_front()
    }

    /// Report the outcome of sending the queue head.
    ///
    /// A transient outcome leaves the datagram in place. After
    /// `MAX_SEND_ERRORS` consecutive hard errors the head is dropped and
    /// the endpoint is marked failed; the server reacts by stopping.
    pub fn record_send(&mut self, outcome: SendOutcome) {
        match outcome {
            SendOutcome::Sent => {
                self.queue.pop_front();
                self.send_errors = 0;
            }
            SendOutcome::Transient => {}
            SendOutcome::Hard => {
                self.send_errors += 1;
                if self.send_errors >= MAX_SEND_ERRORS {
                    if let Some((frame, _)) = self.queue.pop_front() {
                        klog!(warn, "endpoint: dropped frame after {} send errors ({} bytes)",
                            self.send_errors, frame.len());
                    }
                    self.send_errors = 0;
                    self.failed = true;
                }
            }
        }
    }

    /// Whether the endpoint gave up on a datagram; the server must stop.
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// Drop all queued datagrams and reset the failure state.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.send_errors = 0;
        self.failed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(addr: &str, port: u16) -> IpEndpoint {
        IpEndpoint::new(addr.parse().unwrap(), port)
    }

    #[test]
    fn test_fifo_order() {
        let mut endpoint = Endpoint::new(RecvFilter::AcceptAll);
        endpoint.enqueue(&[1], ep("fe80::1", 1)).unwrap();
        endpoint.enqueue(&[2], ep("fe80::2", 2)).unwrap();

        assert_eq!(endpoint.len(), 2);
        assert_eq!(endpoint.front().unwrap().0, &[1]);
        endpoint.record_send(SendOutcome::Sent);
        assert_eq!(endpoint.front().unwrap().0, &[2]);
        endpoint.record_send(SendOutcome::Sent);
        assert!(endpoint.is_empty());
    }

    #[test]
    fn test_transient_error_keeps_head() {
        let mut endpoint = Endpoint::new(RecvFilter::AcceptAll);
        endpoint.enqueue(&[1], ep("fe80::1", 1)).unwrap();
        endpoint.record_send(SendOutcome::Transient);
        assert_eq!(endpoint.len(), 1);
        assert!(!endpoint.has_failed());
    }

    #[test]
    fn test_hard_errors_fail_endpoint() {
        let mut endpoint = Endpoint::new(RecvFilter::AcceptAll);
        endpoint.enqueue(&[1], ep("fe80::1", 1)).unwrap();

        for _ in 0..MAX_SEND_ERRORS - 1 {
            endpoint.record_send(SendOutcome::Hard);
            assert!(!endpoint.has_failed());
            assert_eq!(endpoint.len(), 1);
        }
        endpoint.record_send(SendOutcome::Hard);
        assert!(endpoint.has_failed());
        assert!(endpoint.is_empty());
    }

    #[test]
    fn test_success_resets_error_count() {
        let mut endpoint = Endpoint::new(RecvFilter::AcceptAll);
        endpoint.enqueue(&[1], ep("fe80::1", 1)).unwrap();
        endpoint.enqueue(&[2], ep("fe80::1", 1)).unwrap();

        for _ in 0..MAX_SEND_ERRORS - 1 {
            endpoint.record_send(SendOutcome::Hard);
        }
        endpoint.record_send(SendOutcome::Sent);
        // Counter reset; more hard errors start from zero again
        for _ in 0..MAX_SEND_ERRORS - 1 {
            endpoint.record_send(SendOutcome::Hard);
            assert!(!endpoint.has_failed());
        }
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let mut endpoint = Endpoint::new(RecvFilter::AcceptAll);
        let big = [0u8; MAX_FRAME_SIZE + 1];
        assert!(endpoint.enqueue(&big, ep("fe80::1", 1)).is_err());
    }

    #[test]
    fn test_filter_accept_all() {
        let endpoint = Endpoint::new(RecvFilter::AcceptAll);
        assert!(endpoint.accepts(&ep("fe80::1", 1)));
    }

    #[test]
    fn test_filter_fixed_peer() {
        let peer = ep("fe80::1", 3671);
        let endpoint = Endpoint::new(RecvFilter::FixedPeer(peer));
        assert!(endpoint.accepts(&peer));
        assert!(!endpoint.accepts(&ep("fe80::2", 3671)));
        assert!(!endpoint.accepts(&ep("fe80::1", 3672)));
    }

    #[test]
    fn test_filter_not_self() {
        let local = ep("fe80::1", 3671);
        let mut endpoint = Endpoint::new(RecvFilter::NotSelf);
        // Until the local address is known, nothing is dropped
        assert!(endpoint.accepts(&local));
        endpoint.set_local(local);
        assert!(!endpoint.accepts(&local));
        assert!(endpoint.accepts(&ep("fe80::2", 3671)));
    }

    #[test]
    fn test_filter_either_peer() {
        let a = ep("fe80::1", 1);
        let b = ep("fe80::2", 2);
        let endpoint = Endpoint::new(RecvFilter::EitherPeer(a, b));
        assert!(endpoint.accepts(&a));
        assert!(endpoint.accepts(&b));
        assert!(!endpoint.accepts(&ep("fe80::3", 3)));
    }
}
