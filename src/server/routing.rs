//! Routing driver: the multicast link.
//!
//! A degenerate link registered with the bus router under channel 0. The
//! transmit path wraps each downward telegram into a `ROUTING_INDICATION`
//! (`L_Data.ind` cEMI) bound for the multicast group; the receive path
//! forwards indications the dispatcher already parsed up to the router.
//! No per-packet acknowledgement; loss is tolerated.

use crate::error::Result;
use crate::net::endpoint::Endpoint;
use crate::net::IpEndpoint;
use crate::protocol::cemi::LData;
use crate::protocol::constants::{CEMIMessageCode, MAX_CEMI_SIZE, MAX_FRAME_SIZE};
use crate::protocol::services::RoutingIndication;
use crate::server::BusRouter;

/// Channel id the routing link is registered under.
pub const ROUTING_CHANNEL: u8 = 0;

/// The server's multicast link.
#[derive(Debug, Clone)]
pub struct RoutingDriver {
    group: IpEndpoint,
}

impl RoutingDriver {
    /// Create a driver bound to the multicast group endpoint.
    pub const fn new(group: IpEndpoint) -> Self {
        Self { group }
    }

    /// The multicast group this driver transmits to.
    pub const fn group(&self) -> IpEndpoint {
        self.group
    }

    /// Transmit one telegram to the IP fabric as `ROUTING_INDICATION`.
    pub(crate) fn send_ldata<R: BusRouter>(
        &self,
        l: &LData,
        endpoint: &mut Endpoint,
        router: &mut R,
    ) -> Result<()> {
        let mut cemi = [0u8; MAX_CEMI_SIZE];
        let cemi_len = l.to_cemi(CEMIMessageCode::LDataInd, &mut cemi)?;

        let mut frame = [0u8; MAX_FRAME_SIZE];
        let frame_len = RoutingIndication::new(&cemi[..cemi_len]).build(&mut frame)?;
        endpoint.enqueue(&frame[..frame_len], self.group)?;

        // Multicast has no ACK; the link is immediately ready again
        router.send_next(ROUTING_CHANNEL);
        Ok(())
    }

    /// Forward an inbound indication up to the bus router.
    pub(crate) fn recv_ldata<R: BusRouter>(&self, l: LData, router: &mut R) {
        router.recv_ldata(l);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::endpoint::RecvFilter;
    use crate::server::tests::RecordingRouter;

    #[test]
    fn test_send_emits_routing_indication() {
        let mut endpoint = Endpoint::new(RecvFilter::AcceptAll);
        let mut router = RecordingRouter::default();
        let group = IpEndpoint::new("ff12::4242".parse().unwrap(), 3671);
        let driver = RoutingDriver::new(group);

        let l = LData::new(
            crate::ia!(1, 2, 3),
            crate::ga!(0 / 0 / 1),
            &[0x00, 0x81],
        )
        .unwrap();
        driver.send_ldata(&l, &mut endpoint, &mut router).unwrap();

        let (frame, dst) = endpoint.pop().unwrap();
        assert_eq!(dst, group);
        // ROUTING_INDICATION header, then the L_Data.ind leader
        assert_eq!(&frame[..6], &[0x06, 0x10, 0x05, 0x30, 0x00, 0x11]);
        assert_eq!(frame[6], 0x29);
        assert_eq!(router.send_next_calls, vec![ROUTING_CHANNEL]);
    }
}
