//! Monotonic time types for the sans-I/O core.
//!
//! The connection state machines arm deadlines (retry, heartbeat) without
//! touching an OS clock; callers pass the current [`Instant`] into every
//! event handler. Tests drive time synthetically; the hosted serve loop
//! reads [`Instant::now`].

use core::ops::{Add, AddAssign, Sub};

/// A span of time with millisecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Duration {
    millis: u64,
}

impl Duration {
    /// Create a duration from whole seconds.
    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Self { millis: secs * 1000 }
    }

    /// Create a duration from milliseconds.
    #[inline]
    pub const fn from_millis(millis: u64) -> Self {
        Self { millis }
    }

    /// Duration in milliseconds.
    #[inline]
    pub const fn as_millis(&self) -> u64 {
        self.millis
    }
}

/// A point on a monotonic millisecond clock.
///
/// The epoch is arbitrary; only differences are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Instant {
    millis: u64,
}

impl Instant {
    /// The clock origin. Useful as a starting point in tests.
    pub const ZERO: Self = Self { millis: 0 };

    /// Create an instant from raw milliseconds since the epoch.
    #[inline]
    pub const fn from_millis(millis: u64) -> Self {
        Self { millis }
    }

    /// Milliseconds since the epoch.
    #[inline]
    pub const fn as_millis(&self) -> u64 {
        self.millis
    }

    /// Time elapsed since `earlier`, saturating to zero.
    #[inline]
    pub const fn saturating_since(&self, earlier: Instant) -> Duration {
        Duration {
            millis: self.millis.saturating_sub(earlier.millis),
        }
    }

    /// Current instant on the process-wide monotonic clock.
    #[cfg(feature = "std")]
    pub fn now() -> Self {
        use std::sync::OnceLock;
        use std::time::Instant as StdInstant;

        static BASE: OnceLock<StdInstant> = OnceLock::new();
        let base = *BASE.get_or_init(StdInstant::now);
        Self {
            millis: StdInstant::now().duration_since(base).as_millis() as u64,
        }
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    #[inline]
    fn add(self, rhs: Duration) -> Instant {
        Instant {
            millis: self.millis + rhs.millis,
        }
    }
}

impl AddAssign<Duration> for Instant {
    #[inline]
    fn add_assign(&mut self, rhs: Duration) {
        self.millis += rhs.millis;
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Instant) -> Duration {
        Duration {
            millis: self.millis.saturating_sub(rhs.millis),
        }
    }
}
