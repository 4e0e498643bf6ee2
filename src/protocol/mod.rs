//! KNXnet/IP protocol implementation.
//!
//! Modules:
//! - `constants`: Protocol constants, service types, status codes
//! - `frame`: Frame header, zero-copy frame view, HPAI
//! - `dib`: Description Information Blocks for discovery responses
//! - `services`: Service payload encode/decode pairs
//! - `cemi`: Common External Message Interface codec

pub mod cemi;
pub mod constants;
pub mod dib;
pub mod frame;
pub mod services;
