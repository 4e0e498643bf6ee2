//! Per-client connection state machine.
//!
//! One `Connection` per accepted `CONNECTION_REQUEST`. It tracks the
//! sequence counters in both directions, the outbound cEMI queue with its
//! retry timer, and the liveness deadline. All transitions run
//! synchronously inside the event that caused them; the only way out is
//! the drop queue, drained by the server at loop turn.
//!
//! ## States
//!
//! ```text
//! Live ──(client disconnect | heartbeat | retry exhaustion | shutdown)──▶ Stopping
//! ```

use crate::addressing::IndividualAddress;
use crate::net::IpEndpoint;
use crate::protocol::cemi::{busmonitor_to_cemi, LData, PropRead};
use crate::protocol::constants::*;
use crate::protocol::frame::Hpai;
use crate::protocol::services::{
    ConfigAck, ConfigRequest, DisconnectRequest, TunnelingAck, TunnelingRequest,
};
use crate::server::{BusRouter, Ctx, LinkType};
use crate::time::Instant;

#[cfg(feature = "std")]
use std::collections::VecDeque;

#[cfg(not(feature = "std"))]
extern crate alloc;
#[cfg(not(feature = "std"))]
use alloc::collections::VecDeque;

/// One queued cEMI frame awaiting a peer ACK.
pub type CemiBuf = heapless::Vec<u8, MAX_CEMI_SIZE>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Live,
    Stopping,
}

/// Per-client connection record and state machine.
#[derive(Debug)]
pub struct Connection {
    channel: u8,
    link: LinkType,
    /// Assigned client address; released to the router pool exactly once
    addr: Option<IndividualAddress>,
    daddr: IpEndpoint,
    caddr: IpEndpoint,
    nat: bool,
    /// Next expected inbound sequence number
    rno: u8,
    /// Sequence number for the next outbound send
    sno: u8,
    /// Busmonitor frame counter
    monitor_no: u8,
    /// Sends of the current head so far; 0 when idle
    retries: u8,
    /// Pending cEMI frames; only the head is ever in flight
    outq: VecDeque<CemiBuf>,
    /// Upstream flow control: a router-pushed telegram is outstanding
    want_send_next: bool,
    send_deadline: Option<Instant>,
    heartbeat_deadline: Instant,
    state: ConnState,
}

impl Connection {
    /// Create a live connection. `addr` is `None` for config connections.
    pub(crate) fn new(
        channel: u8,
        link: LinkType,
        addr: Option<IndividualAddress>,
        daddr: IpEndpoint,
        caddr: IpEndpoint,
        nat: bool,
        now: Instant,
    ) -> Self {
        debug_assert!(link != LinkType::Routing);
        Self {
            channel,
            link,
            addr,
            daddr,
            caddr,
            nat,
            rno: 0,
            sno: 0,
            monitor_no: 1,
            retries: 0,
            outq: VecDeque::new(),
            want_send_next: false,
            send_deadline: None,
            heartbeat_deadline: now + CONNECTION_ALIVE_TIME,
            state: ConnState::Live,
        }
    }

    /// Channel id (the connection's key in the server table).
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Connection type.
    pub fn link(&self) -> LinkType {
        self.link
    }

    /// Assigned client address, until released at teardown.
    pub fn addr(&self) -> Option<IndividualAddress> {
        self.addr
    }

    /// Whether teardown has begun.
    pub fn is_stopping(&self) -> bool {
        self.state == ConnState::Stopping
    }

    /// Client data endpoint.
    pub fn data_endpoint(&self) -> IpEndpoint {
        self.daddr
    }

    /// Number of frames awaiting ACK.
    pub fn pending(&self) -> usize {
        self.outq.len()
    }

    fn reset_heartbeat(&mut self, now: Instant) {
        self.heartbeat_deadline = now + CONNECTION_ALIVE_TIME;
    }

    /// Restart the liveness deadline (valid heartbeat or session frame).
    pub(crate) fn touch(&mut self, now: Instant) {
        self.reset_heartbeat(now);
    }

    // =========================================================================
    // Inbound session traffic
    // =========================================================================

    /// Handle `TUNNELING_REQUEST` from the client.
    pub(crate) fn handle_tunnel_request<R: BusRouter>(
        &mut self,
        seqno: u8,
        cemi: &[u8],
        ctx: &mut Ctx<'_, R>,
    ) {
        if self.is_stopping() {
            return;
        }

        if self.rno == seqno.wrapping_add(1) {
            // Our previous ACK was lost; repeat it without re-delivering
            klog!(debug, "channel {}: lost ACK for {}", self.channel, seqno);
            self.send_tunnel_ack(seqno, E_NO_ERROR, ctx);
            return;
        }
        if self.rno != seqno {
            klog!(debug, "channel {}: wrong sequence {}<->{}", self.channel, seqno, self.rno);
            return;
        }

        let mut status = E_NO_ERROR;
        if self.link == LinkType::TunnelStandard {
            match LData::from_cemi(cemi) {
                Ok(mut l) if cemi[0] == CEMIMessageCode::LDataReq.to_u8() => {
                    // Echo the request back as L_Data.con, then hand it
                    // upward as an indication
                    self.enqueue_ldata(&l, CEMIMessageCode::LDataCon);
                    if l.source.is_unassigned() {
                        if let Some(addr) = self.addr {
                            l.source = addr;
                        }
                    }
                    ctx.router.recv_ldata(l);
                }
                Ok(mut l) if cemi[0] == CEMIMessageCode::LDataInd.to_u8() => {
                    if l.source.is_unassigned() {
                        if let Some(addr) = self.addr {
                            l.source = addr;
                        }
                    }
                    ctx.router.recv_ldata(l);
                }
                Ok(_) | Err(_) => {
                    klog!(debug, "channel {}: unusable tunnel cEMI, leader {:#04x}",
                        self.channel, cemi.first().copied().unwrap_or(0));
                    status = E_TUNNELING_LAYER;
                }
            }
        } else {
            klog!(debug, "channel {}: TUNNEL_REQ on non-tunnel connection", self.channel);
            status = E_TUNNELING_LAYER;
        }

        self.rno = self.rno.wrapping_add(1);
        // ACK first; a freshly queued echo goes out behind it
        self.send_tunnel_ack(seqno, status, ctx);
        self.kick(ctx);
        // The client is evidently alive if it can send
        self.reset_heartbeat(ctx.now);
    }

    /// Handle `TUNNELING_ACK` from the client.
    pub(crate) fn handle_tunnel_ack<R: BusRouter>(
        &mut self,
        seqno: u8,
        status: u8,
        ctx: &mut Ctx<'_, R>,
    ) {
        if self.is_stopping() {
            return;
        }
        if self.sno != seqno {
            klog!(debug, "channel {}: ACK wrong sequence {}<->{}", self.channel, seqno, self.sno);
            return;
        }
        if status != E_NO_ERROR {
            klog!(debug, "channel {}: ACK status {:#04x}", self.channel, status);
            return;
        }
        if self.retries == 0 {
            klog!(debug, "channel {}: unexpected ACK", self.channel);
            return;
        }
        if !matches!(self.link, LinkType::TunnelStandard | LinkType::TunnelBusmonitor) {
            klog!(debug, "channel {}: ACK on non-tunnel connection", self.channel);
            return;
        }

        self.complete_send(ctx);
    }

    /// Handle `DEVICE_CONFIGURATION_REQUEST` from the client.
    pub(crate) fn handle_config_request<R: BusRouter>(
        &mut self,
        seqno: u8,
        cemi: &[u8],
        ctx: &mut Ctx<'_, R>,
    ) {
        if self.is_stopping() {
            return;
        }

        if self.rno == seqno.wrapping_add(1) {
            self.send_config_ack(seqno, E_NO_ERROR, ctx);
            return;
        }
        if self.rno != seqno {
            klog!(debug, "channel {}: wrong sequence {}<->{}", self.channel, seqno, self.rno);
            return;
        }

        let status = if self.link == LinkType::Config {
            self.answer_property_read(cemi)
        } else {
            E_TUNNELING_LAYER
        };

        self.rno = self.rno.wrapping_add(1);
        self.send_config_ack(seqno, status, ctx);
        self.kick(ctx);
        self.reset_heartbeat(ctx.now);
    }

    /// Handle `DEVICE_CONFIGURATION_ACK` from the client.
    pub(crate) fn handle_config_ack<R: BusRouter>(
        &mut self,
        seqno: u8,
        status: u8,
        ctx: &mut Ctx<'_, R>,
    ) {
        if self.is_stopping() {
            return;
        }
        if self.sno != seqno {
            klog!(debug, "channel {}: ACK wrong sequence {}<->{}", self.channel, seqno, self.sno);
            return;
        }
        if status != E_NO_ERROR {
            klog!(debug, "channel {}: ACK status {:#04x}", self.channel, status);
            return;
        }
        if self.retries == 0 {
            klog!(debug, "channel {}: unexpected ACK", self.channel);
            return;
        }
        if self.link != LinkType::Config {
            klog!(debug, "channel {}: CONFIG_ACK on non-config connection", self.channel);
            return;
        }

        self.complete_send(ctx);
    }

    /// The object-server stub behind config connections.
    ///
    /// Only `M_PropRead.req` is understood. Object 0 / instance 0 /
    /// property 0 (PID_OBJECT_TYPE) answers two zero bytes; every other
    /// property answers `count=0`.
    fn answer_property_read(&mut self, cemi: &[u8]) -> u8 {
        if cemi.len() < 2 || cemi[0] != CEMIMessageCode::MPropReadReq.to_u8() {
            return E_DATA_CONNECTION;
        }
        let Ok(mut prop) = PropRead::parse_req(cemi) else {
            return E_DATA_CONNECTION;
        };

        let mut data: heapless::Vec<u8, 2> = heapless::Vec::new();
        if prop.object_type == 0 && prop.object_instance == 0 && prop.property_id == 0 {
            let _ = data.extend_from_slice(&[0, 0]);
            prop.start = 0;
        } else {
            prop.count = 0;
            let _ = data.push(0);
        }

        let mut con = [0u8; MAX_CEMI_SIZE];
        let Ok(len) = prop.build_con(&data, &mut con) else {
            return E_DATA_CONNECTION;
        };
        self.enqueue_cemi(&con[..len]);
        E_NO_ERROR
    }

    // =========================================================================
    // Bus-side pushes
    // =========================================================================

    /// Queue a bus telegram toward a standard tunnel client.
    pub(crate) fn push_ldata<R: BusRouter>(&mut self, l: &LData, ctx: &mut Ctx<'_, R>) {
        if self.is_stopping() || self.link != LinkType::TunnelStandard {
            return;
        }
        debug_assert!(!self.want_send_next);
        self.want_send_next = true;
        self.enqueue_ldata(l, CEMIMessageCode::LDataInd);
        self.kick(ctx);
    }

    /// Queue a raw bus frame toward a busmonitor client.
    pub(crate) fn push_busmonitor<R: BusRouter>(&mut self, frame: &[u8], ctx: &mut Ctx<'_, R>) {
        if self.is_stopping() || self.link != LinkType::TunnelBusmonitor {
            return;
        }
        let mut cemi = [0u8; MAX_CEMI_SIZE];
        match busmonitor_to_cemi(self.monitor_no, frame, &mut cemi) {
            Ok(len) => {
                self.monitor_no = self.monitor_no.wrapping_add(1);
                self.enqueue_cemi(&cemi[..len]);
                self.kick(ctx);
            }
            Err(_) => klog!(warn, "channel {}: oversize busmonitor frame dropped", self.channel),
        }
    }

    fn enqueue_ldata(&mut self, l: &LData, code: CEMIMessageCode) {
        let mut cemi = [0u8; MAX_CEMI_SIZE];
        match l.to_cemi(code, &mut cemi) {
            Ok(len) => self.enqueue_cemi(&cemi[..len]),
            Err(_) => klog!(warn, "channel {}: oversize telegram dropped", self.channel),
        }
    }

    fn enqueue_cemi(&mut self, cemi: &[u8]) {
        let mut buf = CemiBuf::new();
        if buf.extend_from_slice(cemi).is_err() {
            klog!(warn, "channel {}: oversize cEMI frame dropped", self.channel);
            return;
        }
        self.outq.push_back(buf);
    }

    /// Start transmitting if nothing is in flight yet.
    fn kick<R: BusRouter>(&mut self, ctx: &mut Ctx<'_, R>) {
        if self.retries == 0 {
            self.trigger_send(ctx);
        }
    }

    // =========================================================================
    // Outbound sending and timers
    // =========================================================================

    /// Send (or resend) the queue head with the current sequence number
    /// and arm the retry timer.
    fn trigger_send<R: BusRouter>(&mut self, ctx: &mut Ctx<'_, R>) {
        let Some(head) = self.outq.front() else {
            return;
        };

        let mut frame = [0u8; MAX_FRAME_SIZE];
        let built = if self.link == LinkType::Config {
            ConfigRequest::new(self.channel, self.sno, head).build(&mut frame)
        } else {
            TunnelingRequest::new(self.channel, self.sno, head).build(&mut frame)
        };
        match built {
            Ok(len) => {
                let _ = ctx.endpoint.enqueue(&frame[..len], self.daddr);
                self.retries += 1;
                self.send_deadline = Some(ctx.now + TUNNELING_REQUEST_TIMEOUT);
            }
            Err(_) => {
                klog!(error, "channel {}: failed to encode session frame", self.channel);
                self.outq.pop_front();
            }
        }
    }

    /// ACKed head: pop it, advance, and keep the pipe moving.
    fn complete_send<R: BusRouter>(&mut self, ctx: &mut Ctx<'_, R>) {
        self.sno = self.sno.wrapping_add(1);
        self.outq.pop_front();
        self.send_deadline = None;
        self.retries = 0;
        // The client is evidently alive if it can ack
        self.reset_heartbeat(ctx.now);

        if !self.outq.is_empty() {
            self.trigger_send(ctx);
        } else if self.want_send_next {
            self.want_send_next = false;
            ctx.router.send_next(self.channel);
        }
    }

    /// Earliest pending deadline, for the event loop.
    pub(crate) fn poll_at(&self) -> Instant {
        match self.send_deadline {
            Some(send) if send < self.heartbeat_deadline => send,
            _ => self.heartbeat_deadline,
        }
    }

    /// Fire expired timers.
    pub(crate) fn handle_timeouts<R: BusRouter>(&mut self, ctx: &mut Ctx<'_, R>) {
        if self.is_stopping() {
            return;
        }

        if self.send_deadline.is_some_and(|at| ctx.now >= at) {
            if self.retries < TUNNELING_MAX_SENDS {
                self.trigger_send(ctx);
            } else {
                klog!(warn, "channel {}: dropped no-ACK frame", self.channel);
                self.outq.pop_front();
                self.terminate(ctx, true);
                return;
            }
        }

        if ctx.now >= self.heartbeat_deadline {
            klog!(info, "channel {}: heartbeat expired", self.channel);
            self.terminate(ctx, true);
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Tear the connection down.
    ///
    /// Deregisters the busmonitor and releases the client address exactly
    /// once, optionally notifies the client, and posts the channel to the
    /// drop queue. Idempotent.
    pub(crate) fn terminate<R: BusRouter>(&mut self, ctx: &mut Ctx<'_, R>, notify_client: bool) {
        if self.is_stopping() {
            return;
        }
        self.state = ConnState::Stopping;
        klog!(debug, "Stop Conn {}", self.channel);

        if self.link == LinkType::TunnelBusmonitor {
            ctx.router.deregister_busmonitor(self.channel);
        }
        self.send_deadline = None;
        self.retries = 0;

        if notify_client {
            // Without a known source address the frame must not be emitted
            if let Some(local) = ctx.endpoint.local() {
                let req = DisconnectRequest::new(self.channel, Hpai::from_endpoint(local), self.nat);
                let mut frame = [0u8; MAX_FRAME_SIZE];
                if let Ok(len) = req.build(&mut frame) {
                    let _ = ctx.endpoint.enqueue(&frame[..len], self.caddr);
                }
            }
        }

        if self.want_send_next {
            self.want_send_next = false;
            ctx.router.send_next(self.channel);
        }
        if let Some(addr) = self.addr.take() {
            ctx.router.release_client_addr(addr);
        }
        ctx.drop_q.push_back(self.channel);
    }

    fn send_tunnel_ack<R: BusRouter>(&mut self, seqno: u8, status: u8, ctx: &mut Ctx<'_, R>) {
        let mut frame = [0u8; MAX_FRAME_SIZE];
        if let Ok(len) = TunnelingAck::new(self.channel, seqno, status).build(&mut frame) {
            let _ = ctx.endpoint.enqueue(&frame[..len], self.daddr);
        }
    }

    fn send_config_ack<R: BusRouter>(&mut self, seqno: u8, status: u8, ctx: &mut Ctx<'_, R>) {
        let mut frame = [0u8; MAX_FRAME_SIZE];
        if let Ok(len) = ConfigAck::new(self.channel, seqno, status).build(&mut frame) {
            let _ = ctx.endpoint.enqueue(&frame[..len], self.daddr);
        }
    }
}
