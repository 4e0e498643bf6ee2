#![cfg_attr(all(not(test), not(feature = "std")), no_std)]
#![doc = include_str!("../README.md")]

//! # knx-gateway
//!
//! KNXnet/IP server implementation: an IPv6-native gateway between the IP
//! fabric and an internal KNX link layer.
//!
//! The crate implements the Core, Device Management, Tunnelling and Routing
//! service families of KNXnet/IP. External clients discover the server
//! (`SEARCH`/`DESCRIPTION`), open tunnelling or configuration connections,
//! exchange cEMI telegrams with per-frame acknowledgement and sequence
//! numbering, and receive multicast `ROUTING_INDICATION` traffic.
//!
//! ## Features
//!
//! - Zero-copy KNXnet/IP frame parsing
//! - Per-client connection state machines (tunnel, busmonitor, config)
//! - Bidirectional multicast routing bridge
//! - Sans-I/O core driven by an async UDP adapter (`std` feature)
//!
//! ## Example
//!
//! ```rust,ignore
//! use knx_gateway::server::{run, Server, ServerConfig};
//!
//! let mut server = Server::new(config, router);
//! server.setup()?;
//! futures_lite::future::block_on(run(&mut server))?;
//! ```

// Macro modules (must be declared before use)
#[macro_use]
pub mod logging;
#[macro_use]
pub mod macros;

pub mod addressing;
pub mod error;
pub mod net;
pub mod protocol;
pub mod server;
pub mod time;

#[cfg(feature = "std")]
pub mod sourceip;

// Re-export commonly used types
pub use addressing::{GroupAddress, IndividualAddress};
pub use error::{KnxError, Result};
pub use net::{IpEndpoint, Ipv6Addr};
pub use server::{BusRouter, Server, ServerConfig};
