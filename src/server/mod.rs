//! KNXnet/IP server: dispatcher, connection table and lifecycle.
//!
//! The [`Server`] owns the UDP endpoint queue, the routing driver and the
//! table of client connections. It demultiplexes inbound frames by service
//! type, answers discovery, opens and closes connections, and forwards
//! telegrams between the IP fabric and the bus router.
//!
//! The core is sans-I/O: [`Server::handle_datagram`] and
//! [`Server::handle_timeouts`] mutate state and fill the endpoint's send
//! queue; the async [`serve`] loop (with the `std` feature) moves datagrams
//! between that queue and a real socket. Everything runs on one logical
//! executor, so state transitions are atomic between suspension points.

pub mod config;
pub mod connection;
pub mod routing;

pub use config::{RoutingSection, ServerConfig, TunnelSection};
pub use connection::Connection;
pub use routing::{RoutingDriver, ROUTING_CHANNEL};

use crate::addressing::IndividualAddress;
use crate::error::{KnxError, Result};
use crate::net::endpoint::{Endpoint, RecvFilter};
use crate::net::IpEndpoint;
use crate::protocol::cemi::LData;
use crate::protocol::constants::*;
use crate::protocol::dib::{DeviceDib, ServiceFamiliesDib, ServiceFamily};
use crate::protocol::frame::{Hpai, KnxnetIpFrame};
use crate::protocol::services::*;
use crate::time::{Duration, Instant};

#[cfg(feature = "std")]
use std::{collections::VecDeque, vec::Vec};

#[cfg(not(feature = "std"))]
extern crate alloc;
#[cfg(not(feature = "std"))]
use alloc::{collections::VecDeque, vec::Vec};

/// Kinds of links the server registers with the bus router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkType {
    /// The multicast routing link (channel 0)
    Routing,
    /// Link-layer tunnel client
    TunnelStandard,
    /// Passive busmonitor client
    TunnelBusmonitor,
    /// Device-management client
    Config,
}

/// Feature link stacks the bus router validates during setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackSection {
    /// Per-client tunnel stack
    Tunnel,
    /// Routing stack
    Routing,
}

/// Interface to the bus router, the external owner of the KNX side.
///
/// The router allocates client addresses, receives upward telegrams and
/// pushes downward ones via [`Server::push_ldata`],
/// [`Server::push_busmonitor`] and [`Server::route_ldata`]. Only
/// [`recv_ldata`](Self::recv_ldata) is mandatory; the defaults make a
/// discovery- or routing-only router trivial to implement.
pub trait BusRouter {
    /// The server's own KNX individual address, advertised in discovery.
    fn server_addr(&self) -> IndividualAddress {
        IndividualAddress::UNASSIGNED
    }

    /// Default friendly name when the configuration has none.
    fn server_name(&self) -> &str {
        "knx-gateway"
    }

    /// Whether a client-address pool is configured (tunnelling needs one).
    fn has_client_addrs(&self) -> bool {
        false
    }

    /// Validate that a feature link stack can be instantiated.
    fn check_stack(&self, _section: StackSection) -> bool {
        true
    }

    /// Take one address from the client pool.
    fn allocate_client_addr(&mut self) -> Option<IndividualAddress> {
        None
    }

    /// Return an address to the client pool. Called exactly once per
    /// assigned address, at teardown.
    fn release_client_addr(&mut self, _addr: IndividualAddress) {}

    /// A link was opened under `channel`. Returning `false` rejects it.
    fn link_opened(&mut self, _channel: u8, _link: LinkType, _addr: IndividualAddress) -> bool {
        true
    }

    /// The link under `channel` is gone.
    fn link_closed(&mut self, _channel: u8) {}

    /// Register a virtual busmonitor. Returning `false` rejects the
    /// connection.
    fn register_busmonitor(&mut self, _channel: u8) -> bool {
        true
    }

    /// Deregister a virtual busmonitor. Called exactly once at teardown.
    fn deregister_busmonitor(&mut self, _channel: u8) {}

    /// Deliver a telegram upward (from a tunnel client or the multicast
    /// fabric) into the bus side.
    fn recv_ldata(&mut self, ldata: LData);

    /// Flow control: the link under `channel` accepted its pending
    /// telegram and is ready for the next one.
    fn send_next(&mut self, _channel: u8) {}
}

/// Shared mutable context handed into connection handlers.
///
/// Bundles the split borrows of the server fields a connection may touch,
/// so a connection never holds a reference to the whole server.
pub(crate) struct Ctx<'a, R: BusRouter> {
    pub endpoint: &'a mut Endpoint,
    pub router: &'a mut R,
    pub drop_q: &'a mut VecDeque<u8>,
    pub now: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    New,
    Ready,
    Running,
    Stopped,
}

/// The KNXnet/IP server.
pub struct Server<R: BusRouter> {
    cfg: ServerConfig,
    router: R,
    endpoint: Endpoint,
    mcast: Option<RoutingDriver>,
    connections: Vec<Connection>,
    drop_q: VecDeque<u8>,
    state: ServerState,
    mac_lookup: Option<fn() -> Option<[u8; 6]>>,
    mac_cache: [u8; 6],
    mac_refreshed: Option<Instant>,
}

impl<R: BusRouter> core::fmt::Debug for Server<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Server")
            .field("state", &self.state)
            .field("connections", &self.connections.len())
            .field("queued", &self.endpoint.len())
            .finish_non_exhaustive()
    }
}

impl<R: BusRouter> Server<R> {
    /// Create a server; call [`setup`](Self::setup) before starting.
    pub fn new(cfg: ServerConfig, router: R) -> Self {
        Self {
            cfg,
            router,
            endpoint: Endpoint::new(RecvFilter::AcceptAll),
            mcast: None,
            connections: Vec::new(),
            drop_q: VecDeque::new(),
            state: ServerState::New,
            mac_lookup: None,
            mac_cache: [0; 6],
            mac_refreshed: None,
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.cfg
    }

    /// The bus router.
    pub fn router(&self) -> &R {
        &self.router
    }

    /// The bus router, mutably.
    pub fn router_mut(&mut self) -> &mut R {
        &mut self.router
    }

    /// The endpoint send queue and receive filter.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The endpoint, mutably (the serve loop drains it from here).
    pub fn endpoint_mut(&mut self) -> &mut Endpoint {
        &mut self.endpoint
    }

    /// Install the MAC lookup used for discovery responses. The result is
    /// cached and refreshed at most once per second.
    pub fn set_mac_lookup(&mut self, lookup: fn() -> Option<[u8; 6]>) {
        self.mac_lookup = Some(lookup);
    }

    /// Whether the server is dispatching.
    pub fn is_running(&self) -> bool {
        self.state == ServerState::Running
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Whether a channel is present in the connection table.
    pub fn has_channel(&self, channel: u8) -> bool {
        self.connections.iter().any(|c| c.channel() == channel)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Validate the configuration against the bus router.
    ///
    /// At least one of tunnel/route/discover must be requested; tunnelling
    /// additionally needs client addresses and a checkable tunnel stack,
    /// routing a checkable routing stack.
    pub fn setup(&mut self) -> Result<()> {
        if self.state != ServerState::New {
            return Err(KnxError::invalid_state());
        }

        let tunnel = self.cfg.tunnel_enabled();
        let route = self.cfg.route_enabled();
        if !tunnel && !route && !self.cfg.discover {
            return Err(KnxError::nothing_enabled());
        }

        if tunnel {
            if !self.router.has_client_addrs() {
                return Err(KnxError::no_client_addrs());
            }
            if !self.router.check_stack(StackSection::Tunnel) {
                return Err(KnxError::stack_check_failed());
            }
        }
        if route && !self.router.check_stack(StackSection::Routing) {
            return Err(KnxError::stack_check_failed());
        }

        self.state = ServerState::Ready;
        Ok(())
    }

    /// Begin dispatching.
    ///
    /// `local` is the source endpoint used to populate HPAIs in
    /// unsolicited frames; without it such frames are suppressed. With
    /// routing enabled the multicast link is registered with the router.
    pub fn start(&mut self, local: Option<IpEndpoint>) -> Result<()> {
        if self.state != ServerState::Ready {
            return Err(KnxError::invalid_state());
        }

        if let Some(local) = local {
            self.endpoint.set_local(local);
        }
        // Multicast loopback is enabled on the socket; our own datagrams
        // must not come back around
        self.endpoint.set_filter(RecvFilter::NotSelf);

        if self.cfg.route_enabled() {
            let driver = RoutingDriver::new(self.cfg.multicast_endpoint());
            if !self
                .router
                .link_opened(ROUTING_CHANNEL, LinkType::Routing, IndividualAddress::UNASSIGNED)
            {
                return Err(KnxError::stack_check_failed());
            }
            self.mcast = Some(driver);
        }

        klog!(info, "server opened, port {}", self.cfg.port);
        self.state = ServerState::Running;
        Ok(())
    }

    /// Stop the server: tear all connections down (newest first), drop the
    /// routing link, stop dispatching. Idempotent.
    pub fn stop(&mut self, now: Instant) {
        if self.state != ServerState::Running {
            self.state = ServerState::Stopped;
            return;
        }
        klog!(info, "server closing");

        {
            let Server {
                connections,
                endpoint,
                router,
                drop_q,
                ..
            } = self;
            let mut ctx = Ctx {
                endpoint,
                router,
                drop_q,
                now,
            };
            for conn in connections.iter_mut().rev() {
                conn.terminate(&mut ctx, true);
            }
        }
        self.drain_drops();

        if self.mcast.take().is_some() {
            self.router.link_closed(ROUTING_CHANNEL);
        }
        self.state = ServerState::Stopped;
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Feed one received datagram into the server.
    pub fn handle_datagram(&mut self, data: &[u8], src: IpEndpoint, now: Instant) {
        if self.state != ServerState::Running {
            return;
        }
        if !self.endpoint.accepts(&src) {
            klog!(trace, "dropped datagram from {}", src);
            return;
        }

        let frame = match KnxnetIpFrame::parse(data) {
            Ok(frame) => frame,
            Err(_) => {
                klog!(debug, "unparseable frame from {} ({} bytes)", src, data.len());
                return;
            }
        };
        let body = frame.body();

        match frame.service_type() {
            ServiceType::SearchRequest => self.handle_search(body, src, now),
            ServiceType::DescriptionRequest => self.handle_description(body, src, now),
            ServiceType::ConnectRequest => self.handle_connect(body, src, now),
            ServiceType::ConnectionstateRequest => self.handle_connectionstate(body, src, now),
            ServiceType::DisconnectRequest => self.handle_disconnect(body, src, now),
            ServiceType::TunnellingRequest => self.handle_tunneling_request(body, now),
            ServiceType::TunnellingAck => self.handle_tunneling_ack(body, now),
            ServiceType::DeviceConfigurationRequest => self.handle_config_request(body, now),
            ServiceType::DeviceConfigurationAck => self.handle_config_ack(body, now),
            ServiceType::RoutingIndication => self.handle_routing_indication(body),
            other => klog!(debug, "unexpected service type {:#06x}", other.to_u16()),
        }

        self.drain_drops();
    }

    fn handle_search(&mut self, body: &[u8], src: IpEndpoint, now: Instant) {
        let req = match SearchRequest::parse(body, src) {
            Ok(req) => req,
            Err(_) => {
                klog!(debug, "unparseable SEARCH_REQUEST");
                return;
            }
        };
        klog!(debug, "SEARCH_REQ");
        if !self.cfg.discover {
            return;
        }
        let Some(local) = self.endpoint.local() else {
            return;
        };

        let mut families = ServiceFamiliesDib::default();
        families.push(ServiceFamily::Core);
        if self.cfg.tunnel_enabled() {
            families.push(ServiceFamily::Tunnelling);
        }
        if self.cfg.route_enabled() {
            families.push(ServiceFamily::Routing);
        }

        let rsp = SearchResponse {
            control: Hpai::from_endpoint(local),
            nat: req.nat,
            device: self.device_dib(now),
            families,
        };
        let mut frame = [0u8; MAX_FRAME_SIZE];
        if let Ok(len) = rsp.build(&mut frame) {
            let _ = self.endpoint.enqueue(&frame[..len], req.endpoint.endpoint());
        }
    }

    fn handle_description(&mut self, body: &[u8], src: IpEndpoint, now: Instant) {
        let req = match DescriptionRequest::parse(body, src) {
            Ok(req) => req,
            Err(_) => {
                klog!(debug, "unparseable DESCRIPTION_REQUEST");
                return;
            }
        };
        if !self.cfg.discover {
            return;
        }
        klog!(debug, "DESCRIBE");

        let mut families = ServiceFamiliesDib::default();
        families.push(ServiceFamily::Core);
        families.push(ServiceFamily::DeviceManagement);
        if self.cfg.tunnel_enabled() {
            families.push(ServiceFamily::Tunnelling);
        }
        if self.cfg.route_enabled() {
            families.push(ServiceFamily::Routing);
        }

        let rsp = DescriptionResponse {
            device: self.device_dib(now),
            families,
        };
        let mut frame = [0u8; MAX_FRAME_SIZE];
        if let Ok(len) = rsp.build(&mut frame) {
            let _ = self.endpoint.enqueue(&frame[..len], req.endpoint.endpoint());
        }
    }

    fn device_dib(&mut self, now: Instant) -> DeviceDib {
        let name = match &self.cfg.name {
            Some(name) => DeviceDib::encode_name(name),
            None => DeviceDib::encode_name(self.router.server_name()),
        };
        DeviceDib {
            medium: self.cfg.medium,
            status: 0,
            addr: self.router.server_addr(),
            install_id: 0,
            serial: [1, 2, 3, 4, 5, 6],
            multicast: self.cfg.multicast_address,
            mac: self.refresh_mac(now),
            name,
        }
    }

    fn refresh_mac(&mut self, now: Instant) -> [u8; 6] {
        if let Some(lookup) = self.mac_lookup {
            let stale = self
                .mac_refreshed
                .is_none_or(|at| now.saturating_since(at) >= Duration::from_secs(1));
            if stale {
                if let Some(mac) = lookup() {
                    self.mac_cache = mac;
                }
                self.mac_refreshed = Some(now);
            }
        }
        self.mac_cache
    }

    fn handle_connect(&mut self, body: &[u8], src: IpEndpoint, now: Instant) {
        let req = match ConnectRequest::parse(body, src) {
            Ok(req) => req,
            Err(_) => {
                klog!(debug, "unparseable CONNECTION_REQUEST");
                return;
            }
        };
        // Without a known source address the response HPAI cannot be
        // populated; do not reply at all
        let Some(local) = self.endpoint.local() else {
            return;
        };

        let rsp = match &req.cri {
            Cri::Tunnel { layer } => self.open_tunnel(*layer, &req, local, now),
            Cri::Config => self.open_config(&req, local, now),
            Cri::Other(_) => {
                klog!(debug, "bad CONNECTION_REQ: unsupported CRI");
                ConnectResponse::error(E_CONNECTION_TYPE)
            }
        };
        if !rsp.is_ok() {
            klog!(debug, "CONNECTION_REQ: error {:#04x}", rsp.status);
        }

        let mut frame = [0u8; MAX_FRAME_SIZE];
        if let Ok(len) = rsp.build(&mut frame) {
            let _ = self.endpoint.enqueue(&frame[..len], req.control.endpoint());
        }
    }

    fn open_tunnel(
        &mut self,
        layer: u8,
        req: &ConnectRequest,
        local: IpEndpoint,
        now: Instant,
    ) -> ConnectResponse {
        if !self.cfg.tunnel_enabled() {
            klog!(debug, "Tunnel CONNECTION_REQ, ignored, not tunneling");
            return ConnectResponse::error(E_CONNECTION_TYPE);
        }
        let Some(addr) = self.router.allocate_client_addr() else {
            klog!(debug, "Tunnel CONNECTION_REQ, no free addresses");
            return ConnectResponse::error(E_NO_MORE_CONNECTIONS);
        };

        let link = match layer {
            TUNNEL_LINKLAYER => LinkType::TunnelStandard,
            TUNNEL_BUSMONITOR => LinkType::TunnelBusmonitor,
            other => {
                klog!(debug, "bad CONNECTION_REQ: layer {:#04x}", other);
                self.router.release_client_addr(addr);
                return ConnectResponse::error(E_TUNNELING_LAYER);
            }
        };

        klog!(debug, "Tunnel CONNECTION_REQ with {}", addr);
        match self.add_client(link, Some(addr), req, now) {
            Some(channel) => {
                ConnectResponse::ok(channel, Hpai::from_endpoint(local), Crd::Tunnel(addr), req.nat)
            }
            None => {
                self.router.release_client_addr(addr);
                ConnectResponse::error(E_NO_MORE_CONNECTIONS)
            }
        }
    }

    fn open_config(
        &mut self,
        req: &ConnectRequest,
        local: IpEndpoint,
        now: Instant,
    ) -> ConnectResponse {
        klog!(debug, "CONNECTION_REQ, no addr (mgmt)");
        match self.add_client(LinkType::Config, None, req, now) {
            Some(channel) => {
                ConnectResponse::ok(channel, Hpai::from_endpoint(local), Crd::Config, req.nat)
            }
            None => ConnectResponse::error(E_NO_MORE_CONNECTIONS),
        }
    }

    fn add_client(
        &mut self,
        link: LinkType,
        addr: Option<IndividualAddress>,
        req: &ConnectRequest,
        now: Instant,
    ) -> Option<u8> {
        let channel = self.alloc_channel()?;
        if !self.router.link_opened(
            channel,
            link,
            addr.unwrap_or(IndividualAddress::UNASSIGNED),
        ) {
            return None;
        }
        if link == LinkType::TunnelBusmonitor && !self.router.register_busmonitor(channel) {
            self.router.link_closed(channel);
            return None;
        }

        klog!(debug, "Start Conn {}", channel);
        self.connections.push(Connection::new(
            channel,
            link,
            addr,
            req.data.endpoint(),
            req.control.endpoint(),
            req.nat,
            now,
        ));
        Some(channel)
    }

    /// Lowest unused channel id in 1..=255.
    fn alloc_channel(&self) -> Option<u8> {
        (1..=255u8).find(|id| !self.connections.iter().any(|c| c.channel() == *id))
    }

    fn handle_connectionstate(&mut self, body: &[u8], src: IpEndpoint, now: Instant) {
        let req = match ConnectionStateRequest::parse(body, src) {
            Ok(req) => req,
            Err(_) => {
                klog!(debug, "unparseable CONNECTIONSTATE_REQUEST");
                return;
            }
        };

        let status = match self
            .connections
            .iter_mut()
            .find(|c| c.channel() == req.channel)
        {
            Some(conn) => {
                klog!(debug, "CONNECTIONSTATE_REQUEST on {}", req.channel);
                conn.touch(now);
                E_NO_ERROR
            }
            None => {
                klog!(debug, "Unknown connection {}", req.channel);
                E_CONNECTION_ID
            }
        };

        let mut frame = [0u8; MAX_FRAME_SIZE];
        if let Ok(len) = ConnectionStateResponse::new(req.channel, status).build(&mut frame) {
            let _ = self.endpoint.enqueue(&frame[..len], req.control.endpoint());
        }
    }

    fn handle_disconnect(&mut self, body: &[u8], src: IpEndpoint, now: Instant) {
        let req = match DisconnectRequest::parse(body, src) {
            Ok(req) => req,
            Err(_) => {
                klog!(debug, "unparseable DISCONNECT_REQUEST");
                return;
            }
        };

        let status;
        {
            let Server {
                connections,
                endpoint,
                router,
                drop_q,
                ..
            } = self;
            match connections.iter_mut().find(|c| c.channel() == req.channel) {
                Some(conn) => {
                    klog!(debug, "DISCONNECT_REQUEST on {}", req.channel);
                    let mut ctx = Ctx {
                        endpoint,
                        router,
                        drop_q,
                        now,
                    };
                    conn.terminate(&mut ctx, false);
                    status = E_NO_ERROR;
                }
                None => {
                    klog!(debug, "DISCONNECT_REQUEST on unknown {}", req.channel);
                    status = E_CONNECTION_ID;
                }
            }
        }

        let mut frame = [0u8; MAX_FRAME_SIZE];
        if let Ok(len) = DisconnectResponse::new(req.channel, status).build(&mut frame) {
            let _ = self.endpoint.enqueue(&frame[..len], req.control.endpoint());
        }
    }

    fn handle_tunneling_request(&mut self, body: &[u8], now: Instant) {
        let Ok(TunnelingRequest(req)) = TunnelingRequest::parse(body) else {
            klog!(debug, "unparseable TUNNEL_REQUEST");
            return;
        };

        if self.cfg.tunnel_enabled() {
            let Server {
                connections,
                endpoint,
                router,
                drop_q,
                ..
            } = self;
            if let Some(conn) = connections.iter_mut().find(|c| c.channel() == req.channel) {
                let mut ctx = Ctx {
                    endpoint,
                    router,
                    drop_q,
                    now,
                };
                conn.handle_tunnel_request(req.seqno, req.cemi, &mut ctx);
                return;
            }
        }
        klog!(debug, "TUNNEL_REQ on unknown {}", req.channel);
    }

    fn handle_tunneling_ack(&mut self, body: &[u8], now: Instant) {
        let Ok(TunnelingAck(ack)) = TunnelingAck::parse(body) else {
            klog!(debug, "unparseable TUNNEL_RESPONSE");
            return;
        };

        if self.cfg.tunnel_enabled() {
            let Server {
                connections,
                endpoint,
                router,
                drop_q,
                ..
            } = self;
            if let Some(conn) = connections.iter_mut().find(|c| c.channel() == ack.channel) {
                let mut ctx = Ctx {
                    endpoint,
                    router,
                    drop_q,
                    now,
                };
                conn.handle_tunnel_ack(ack.seqno, ack.status, &mut ctx);
                return;
            }
        }
        klog!(debug, "TUNNEL_ACK on unknown {}", ack.channel);
    }

    fn handle_config_request(&mut self, body: &[u8], now: Instant) {
        let Ok(ConfigRequest(req)) = ConfigRequest::parse(body) else {
            klog!(debug, "unparseable DEVICE_CONFIGURATION_REQUEST");
            return;
        };
        klog!(debug, "CONFIG_REQ on {}", req.channel);

        let Server {
            connections,
            endpoint,
            router,
            drop_q,
            ..
        } = self;
        if let Some(conn) = connections.iter_mut().find(|c| c.channel() == req.channel) {
            let mut ctx = Ctx {
                endpoint,
                router,
                drop_q,
                now,
            };
            conn.handle_config_request(req.seqno, req.cemi, &mut ctx);
        } else {
            klog!(debug, "CONFIG_REQ on unknown {}", req.channel);
        }
    }

    fn handle_config_ack(&mut self, body: &[u8], now: Instant) {
        let Ok(ConfigAck(ack)) = ConfigAck::parse(body) else {
            klog!(debug, "unparseable DEVICE_CONFIGURATION_ACK");
            return;
        };

        let Server {
            connections,
            endpoint,
            router,
            drop_q,
            ..
        } = self;
        if let Some(conn) = connections.iter_mut().find(|c| c.channel() == ack.channel) {
            let mut ctx = Ctx {
                endpoint,
                router,
                drop_q,
                now,
            };
            conn.handle_config_ack(ack.seqno, ack.status, &mut ctx);
        } else {
            klog!(debug, "CONFIG_ACK on unknown channel {}", ack.channel);
        }
    }

    fn handle_routing_indication(&mut self, body: &[u8]) {
        if body.len() < 2 || body[0] != CEMIMessageCode::LDataInd.to_u8() {
            klog!(debug, "unparseable ROUTING_INDICATION");
            return;
        }
        match LData::from_cemi(body) {
            Err(_) => klog!(debug, "unCEMIable ROUTING_INDICATION"),
            Ok(l) => {
                if let Some(mcast) = &self.mcast {
                    mcast.recv_ldata(l, &mut self.router);
                }
            }
        }
    }

    // =========================================================================
    // Bus-side entry points
    // =========================================================================

    /// Deliver a bus telegram to a standard tunnel client.
    pub fn push_ldata(&mut self, channel: u8, l: &LData, now: Instant) -> Result<()> {
        let Server {
            connections,
            endpoint,
            router,
            drop_q,
            ..
        } = self;
        let conn = connections
            .iter_mut()
            .find(|c| c.channel() == channel)
            .ok_or_else(KnxError::unknown_channel)?;
        let mut ctx = Ctx {
            endpoint,
            router,
            drop_q,
            now,
        };
        conn.push_ldata(l, &mut ctx);
        Ok(())
    }

    /// Deliver a raw bus frame to a busmonitor client.
    pub fn push_busmonitor(&mut self, channel: u8, frame: &[u8], now: Instant) -> Result<()> {
        let Server {
            connections,
            endpoint,
            router,
            drop_q,
            ..
        } = self;
        let conn = connections
            .iter_mut()
            .find(|c| c.channel() == channel)
            .ok_or_else(KnxError::unknown_channel)?;
        let mut ctx = Ctx {
            endpoint,
            router,
            drop_q,
            now,
        };
        conn.push_busmonitor(frame, &mut ctx);
        Ok(())
    }

    /// Forward a bus telegram to the multicast fabric as
    /// `ROUTING_INDICATION`.
    pub fn route_ldata(&mut self, l: &LData) -> Result<()> {
        let Some(mcast) = &self.mcast else {
            return Err(KnxError::invalid_state());
        };
        mcast.send_ldata(l, &mut self.endpoint, &mut self.router)
    }

    // =========================================================================
    // Timers and the drop queue
    // =========================================================================

    /// Earliest pending deadline across all connections.
    pub fn poll_at(&self) -> Option<Instant> {
        self.connections
            .iter()
            .filter(|c| !c.is_stopping())
            .map(Connection::poll_at)
            .min()
    }

    /// Fire all expired connection timers.
    pub fn handle_timeouts(&mut self, now: Instant) {
        if self.state != ServerState::Running {
            return;
        }
        {
            let Server {
                connections,
                endpoint,
                router,
                drop_q,
                ..
            } = self;
            let mut ctx = Ctx {
                endpoint,
                router,
                drop_q,
                now,
            };
            for conn in connections.iter_mut() {
                conn.handle_timeouts(&mut ctx);
            }
        }
        self.drain_drops();
    }

    /// Remove terminated connections from the table. The indirection via
    /// the drop queue keeps teardown from mutating the table while it is
    /// being iterated.
    fn drain_drops(&mut self) {
        while let Some(channel) = self.drop_q.pop_front() {
            if let Some(pos) = self
                .connections
                .iter()
                .position(|c| c.channel() == channel)
            {
                self.connections.remove(pos);
                self.router.link_closed(channel);
            }
        }
    }
}

// =============================================================================
// Hosted serve loop
// =============================================================================

#[cfg(feature = "std")]
enum Wake {
    Datagram { len: usize, src: IpEndpoint, extra: bool },
    RecvErr(KnxError),
    Timer,
}

/// Drive a started server over one transport until it stops.
///
/// Single-threaded: receive readiness, the earliest connection deadline
/// and the send queue are multiplexed on one executor. A non-transient
/// receive error or a failed endpoint stops the server and returns the
/// error.
#[cfg(feature = "std")]
pub async fn serve<R, T>(server: &mut Server<R>, transport: &mut T) -> Result<()>
where
    R: BusRouter,
    T: crate::net::transport::AsyncTransport,
{
    serve_inner(server, transport, None::<&mut T>).await
}

/// Like [`serve`], with a second socket dedicated to multicast traffic
/// (the `multi-port` configuration).
#[cfg(feature = "std")]
pub async fn serve_dual<R, T>(
    server: &mut Server<R>,
    unicast: &mut T,
    multicast: &mut T,
) -> Result<()>
where
    R: BusRouter,
    T: crate::net::transport::AsyncTransport,
{
    serve_inner(server, unicast, Some(multicast)).await
}

#[cfg(feature = "std")]
async fn serve_inner<R, T>(
    server: &mut Server<R>,
    main: &mut T,
    mut extra: Option<&mut T>,
) -> Result<()>
where
    R: BusRouter,
    T: crate::net::transport::AsyncTransport,
{
    use crate::net::endpoint::SendOutcome;

    let mut buf = [0u8; MAX_FRAME_SIZE];
    let mut buf2 = [0u8; MAX_FRAME_SIZE];

    loop {
        // Flush the send queue first; one datagram per iteration so a
        // failing head cannot starve dispatch forever
        let mut out = [0u8; MAX_FRAME_SIZE];
        let head = server.endpoint().front().map(|(frame, dst)| {
            out[..frame.len()].copy_from_slice(frame);
            (frame.len(), dst)
        });
        if let Some((len, dst)) = head {
            let target = match &mut extra {
                Some(mcast) if dst.addr.is_multicast() => &mut **mcast,
                _ => &mut *main,
            };
            let outcome = match target.send_to(&out[..len], dst).await {
                Ok(()) => SendOutcome::Sent,
                Err(KnxError::Timeout) => SendOutcome::Transient,
                Err(_) => SendOutcome::Hard,
            };
            server.endpoint_mut().record_send(outcome);
            if server.endpoint().has_failed() {
                klog!(error, "endpoint failed, stopping server");
                server.stop(Instant::now());
                return Err(KnxError::endpoint_failed());
            }
            continue;
        }

        if !server.is_running() {
            return Ok(());
        }

        let wake = {
            let recv_main = async {
                match main.recv_from(&mut buf).await {
                    Ok((len, src)) => Wake::Datagram { len, src, extra: false },
                    Err(err) => Wake::RecvErr(err),
                }
            };
            match (&mut extra, server.poll_at()) {
                (None, None) => recv_main.await,
                (None, Some(at)) => {
                    futures_lite::future::or(recv_main, wait_until(at)).await
                }
                (Some(mcast), deadline) => {
                    let recv_extra = async {
                        match mcast.recv_from(&mut buf2).await {
                            Ok((len, src)) => Wake::Datagram { len, src, extra: true },
                            Err(err) => Wake::RecvErr(err),
                        }
                    };
                    match deadline {
                        None => futures_lite::future::or(recv_main, recv_extra).await,
                        Some(at) => {
                            futures_lite::future::or(
                                recv_main,
                                futures_lite::future::or(recv_extra, wait_until(at)),
                            )
                            .await
                        }
                    }
                }
            }
        };

        let now = Instant::now();
        match wake {
            Wake::Datagram { len, src, extra } => {
                let data = if extra { &buf2[..len] } else { &buf[..len] };
                server.handle_datagram(data, src, now);
            }
            Wake::Timer => server.handle_timeouts(now),
            Wake::RecvErr(KnxError::Timeout) => {}
            Wake::RecvErr(err) => {
                klog!(error, "receive failed: {}, stopping server", err);
                server.stop(now);
                // Best-effort flush of the disconnect notifications
                while let Some((frame, dst)) = server.endpoint_mut().pop() {
                    let _ = main.send_to(&frame, dst).await;
                }
                return Err(err);
            }
        }
    }
}

#[cfg(feature = "std")]
async fn wait_until(at: Instant) -> Wake {
    let delay = at.as_millis().saturating_sub(Instant::now().as_millis());
    async_io::Timer::after(core::time::Duration::from_millis(delay)).await;
    Wake::Timer
}

/// Bind sockets from the configuration and run the server to completion.
///
/// Determines the local source address toward the multicast group, joins
/// the group (on a second socket in `multi-port` mode), installs the MAC
/// lookup and dispatches until the server stops.
#[cfg(feature = "std")]
pub async fn run<R: BusRouter>(server: &mut Server<R>) -> Result<()> {
    use crate::net::transport::AsyncTransport;
    use crate::net::udp::UdpTransport;

    let cfg = server.config().clone();
    let iface = if cfg.interface.is_empty() {
        None
    } else {
        Some(cfg.interface.as_str())
    };

    // In multi-port mode the control socket takes an ephemeral port and
    // the dedicated multicast socket listens on the configured port
    let main_port = if cfg.multi_port { 0 } else { cfg.port };
    let mut main = UdpTransport::bind(main_port, iface).map_err(|_| KnxError::not_bound())?;
    let mut mcast = if cfg.multi_port {
        Some(UdpTransport::bind(cfg.port, iface).map_err(|_| KnxError::not_bound())?)
    } else {
        None
    };

    let group = cfg.multicast_address;
    match &mut mcast {
        Some(socket) => socket.join_multicast(group)?,
        None => main.join_multicast(group)?,
    }

    let local_port = main.port().unwrap_or(cfg.port);
    let local = crate::sourceip::source_address_for(cfg.multicast_endpoint())
        .ok()
        .map(|src| IpEndpoint::new(src.addr, local_port));

    server.set_mac_lookup(crate::net::netif::first_ether_mac);
    server.start(local)?;

    let result = match &mut mcast {
        Some(socket) => serve_dual(server, &mut main, socket).await,
        None => serve(server, &mut main).await,
    };

    match &mut mcast {
        Some(socket) => socket.close(),
        None => main.close(),
    }
    result
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Bus router test double recording every interaction.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingRouter {
        pub pool: Option<u16>,
        pub released: Vec<IndividualAddress>,
        pub monitors: Vec<u8>,
        pub links: Vec<(u8, LinkType)>,
        pub closed: Vec<u8>,
        pub received: Vec<LData>,
        pub send_next_calls: Vec<u8>,
        pub refuse_monitor: bool,
    }

    impl RecordingRouter {
        pub fn with_pool(first: u16) -> Self {
            Self {
                pool: Some(first),
                ..Self::default()
            }
        }
    }

    impl BusRouter for RecordingRouter {
        fn server_addr(&self) -> IndividualAddress {
            IndividualAddress::new(1, 0, 0).unwrap()
        }

        fn server_name(&self) -> &str {
            "test-router"
        }

        fn has_client_addrs(&self) -> bool {
            self.pool.is_some()
        }

        fn allocate_client_addr(&mut self) -> Option<IndividualAddress> {
            let next = self.pool?;
            self.pool = Some(next + 1);
            Some(IndividualAddress::from(next))
        }

        fn release_client_addr(&mut self, addr: IndividualAddress) {
            self.released.push(addr);
        }

        fn link_opened(&mut self, channel: u8, link: LinkType, _addr: IndividualAddress) -> bool {
            self.links.push((channel, link));
            true
        }

        fn link_closed(&mut self, channel: u8) {
            self.closed.push(channel);
        }

        fn register_busmonitor(&mut self, channel: u8) -> bool {
            if self.refuse_monitor {
                return false;
            }
            self.monitors.push(channel);
            true
        }

        fn deregister_busmonitor(&mut self, channel: u8) {
            self.monitors.retain(|&c| c != channel);
        }

        fn recv_ldata(&mut self, ldata: LData) {
            self.received.push(ldata);
        }

        fn send_next(&mut self, channel: u8) {
            self.send_next_calls.push(channel);
        }
    }

    pub(crate) fn tunnel_config() -> ServerConfig {
        ServerConfig {
            discover: true,
            tunnel: Some(TunnelSection::default()),
            ..Default::default()
        }
    }

    fn started(cfg: ServerConfig, router: RecordingRouter) -> Server<RecordingRouter> {
        let mut server = Server::new(cfg, router);
        server.setup().unwrap();
        server
            .start(Some(IpEndpoint::new("fd00::2".parse().unwrap(), 3671)))
            .unwrap();
        server
    }

    #[test]
    fn test_setup_requires_a_feature() {
        let mut server = Server::new(ServerConfig::default(), RecordingRouter::default());
        assert_eq!(server.setup(), Err(KnxError::nothing_enabled()));
    }

    #[test]
    fn test_setup_tunnel_requires_client_addrs() {
        let cfg = ServerConfig {
            tunnel: Some(TunnelSection::default()),
            ..Default::default()
        };
        let mut server = Server::new(cfg, RecordingRouter::default());
        assert_eq!(server.setup(), Err(KnxError::no_client_addrs()));
    }

    #[test]
    fn test_start_requires_setup() {
        let mut server = Server::new(tunnel_config(), RecordingRouter::with_pool(0x1101));
        assert!(server.start(None).is_err());
    }

    #[test]
    fn test_routing_link_registered_on_start() {
        let cfg = ServerConfig {
            router: Some(RoutingSection::default()),
            ..Default::default()
        };
        let mut server = Server::new(cfg, RecordingRouter::default());
        server.setup().unwrap();
        server.start(None).unwrap();
        assert_eq!(
            server.router().links,
            vec![(ROUTING_CHANNEL, LinkType::Routing)]
        );

        server.stop(Instant::ZERO);
        assert_eq!(server.router().closed, vec![ROUTING_CHANNEL]);
        assert!(!server.is_running());
    }

    #[test]
    fn test_channel_allocation_lowest_unused() {
        let mut server = started(tunnel_config(), RecordingRouter::with_pool(0x1101));
        let src = IpEndpoint::new("fe80::c".parse().unwrap(), 5000);
        let now = Instant::ZERO;

        let mut frame = [0u8; MAX_FRAME_SIZE];
        let hpai = Hpai::from_endpoint(src);
        for _ in 0..3 {
            let len = ConnectRequest::new(hpai, hpai, Cri::Tunnel { layer: TUNNEL_LINKLAYER })
                .build(&mut frame)
                .unwrap();
            server.handle_datagram(&frame[..len], src, now);
        }
        assert_eq!(server.connection_count(), 3);
        assert!(server.has_channel(1) && server.has_channel(2) && server.has_channel(3));

        // Closing channel 2 frees it for the next request
        let len = DisconnectRequest::new(2, hpai, false).build(&mut frame).unwrap();
        server.handle_datagram(&frame[..len], src, now);
        assert!(!server.has_channel(2));

        let len = ConnectRequest::new(hpai, hpai, Cri::Tunnel { layer: TUNNEL_LINKLAYER })
            .build(&mut frame)
            .unwrap();
        server.handle_datagram(&frame[..len], src, now);
        assert!(server.has_channel(2));
    }

    #[test]
    fn test_refused_busmonitor_releases_address() {
        let mut router = RecordingRouter::with_pool(0x1101);
        router.refuse_monitor = true;
        let mut server = started(tunnel_config(), router);
        let src = IpEndpoint::new("fe80::c".parse().unwrap(), 5000);
        let hpai = Hpai::from_endpoint(src);

        let mut frame = [0u8; MAX_FRAME_SIZE];
        let len = ConnectRequest::new(hpai, hpai, Cri::Tunnel { layer: TUNNEL_BUSMONITOR })
            .build(&mut frame)
            .unwrap();
        server.handle_datagram(&frame[..len], src, Instant::ZERO);

        assert_eq!(server.connection_count(), 0);
        assert_eq!(server.router().released, vec![IndividualAddress::from(0x1101)]);

        // The reply is the short error form
        let (rsp, _) = server.endpoint_mut().pop().unwrap();
        assert_eq!(rsp[7], E_NO_MORE_CONNECTIONS);
    }

    #[test]
    fn test_mac_cache_refreshes_once_per_second() {
        fn fake_mac() -> Option<[u8; 6]> {
            Some([1, 2, 3, 4, 5, 6])
        }

        let mut server = started(tunnel_config(), RecordingRouter::with_pool(0x1101));
        server.set_mac_lookup(fake_mac);

        let mac = server.refresh_mac(Instant::from_millis(0));
        assert_eq!(mac, [1, 2, 3, 4, 5, 6]);
        let first_stamp = server.mac_refreshed;

        // Within a second the cache is served without a new lookup
        let _ = server.refresh_mac(Instant::from_millis(500));
        assert_eq!(server.mac_refreshed, first_stamp);

        let _ = server.refresh_mac(Instant::from_millis(1000));
        assert_ne!(server.mac_refreshed, first_stamp);
    }

    #[test]
    fn test_stop_is_idempotent_and_reversed() {
        let mut server = started(tunnel_config(), RecordingRouter::with_pool(0x1101));
        let src = IpEndpoint::new("fe80::c".parse().unwrap(), 5000);
        let hpai = Hpai::from_endpoint(src);
        let mut frame = [0u8; MAX_FRAME_SIZE];
        for _ in 0..2 {
            let len = ConnectRequest::new(hpai, hpai, Cri::Tunnel { layer: TUNNEL_LINKLAYER })
                .build(&mut frame)
                .unwrap();
            server.handle_datagram(&frame[..len], src, Instant::ZERO);
        }
        server.endpoint_mut().clear();

        server.stop(Instant::ZERO);
        assert_eq!(server.connection_count(), 0);
        // Newest connection torn down first
        assert_eq!(server.router().closed, vec![2, 1]);
        // Both addresses back in the pool
        assert_eq!(server.router().released.len(), 2);
        // Both clients notified
        let mut notified = 0;
        while let Some((frame, _)) = server.endpoint_mut().pop() {
            if frame[2..4] == [0x02, 0x09] {
                notified += 1;
            }
        }
        assert_eq!(notified, 2);

        server.stop(Instant::ZERO);
        assert_eq!(server.router().closed, vec![2, 1]);
    }
}
