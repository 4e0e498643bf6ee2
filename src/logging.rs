//! Unified logging macro for the gateway.
//!
//! Dispatches to `log::` on hosted targets and to `defmt::` on embedded
//! targets, depending on the active feature flags. With neither backend
//! enabled the arguments are dropped after a no-op evaluation so that
//! format strings stay checked.
//!
//! # Usage
//!
//! ```rust,ignore
//! klog!(info, "server listening on port {}", port);
//! klog!(debug, "TUNNEL_REQ on unknown {}", channel);
//! klog!(warn, "dropped no-ACK frame");
//! ```

/// Unified logging macro - selects log:: or defmt:: based on features.
#[macro_export]
#[cfg(feature = "defmt")]
macro_rules! klog {
    (info, $($arg:tt)*) => { defmt::info!($($arg)*) };
    (debug, $($arg:tt)*) => { defmt::debug!($($arg)*) };
    (warn, $($arg:tt)*) => { defmt::warn!($($arg)*) };
    (error, $($arg:tt)*) => { defmt::error!($($arg)*) };
    (trace, $($arg:tt)*) => { defmt::trace!($($arg)*) };
}

#[macro_export]
#[cfg(all(not(feature = "defmt"), feature = "std"))]
macro_rules! klog {
    (info, $($arg:tt)*) => { log::info!($($arg)*) };
    (debug, $($arg:tt)*) => { log::debug!($($arg)*) };
    (warn, $($arg:tt)*) => { log::warn!($($arg)*) };
    (error, $($arg:tt)*) => { log::error!($($arg)*) };
    (trace, $($arg:tt)*) => { log::trace!($($arg)*) };
}

#[macro_export]
#[cfg(all(not(feature = "defmt"), not(feature = "std")))]
macro_rules! klog {
    ($level:ident, $($arg:tt)*) => {{
        if false {
            let _ = core::format_args!($($arg)*);
        }
    }};
}
