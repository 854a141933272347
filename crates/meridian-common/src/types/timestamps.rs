//! Hybrid timestamps.
//!
//! A [`Timestamp`] pairs a physical wall time (nanoseconds since the Unix
//! epoch, as read from a node's physical clock) with a logical counter that
//! orders events sharing the same wall time. Timestamps are totally ordered:
//! wall time first, logical counter second.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::constants::NANOS_PER_MILLI;

/// A hybrid logical timestamp.
///
/// # Example
///
/// ```rust
/// use meridian_common::types::Timestamp;
///
/// let a = Timestamp::new(100, 0);
/// let b = Timestamp::new(100, 1);
/// let c = Timestamp::new(101, 0);
/// assert!(a < b && b < c);
/// ```
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp {
    /// Physical component, nanoseconds since the Unix epoch.
    pub wall_time: u64,
    /// Logical counter for events at the same wall time.
    pub logical: u32,
}

impl Timestamp {
    /// The zero/minimum timestamp.
    pub const ZERO: Self = Self {
        wall_time: 0,
        logical: 0,
    };

    /// The maximum timestamp.
    pub const MAX: Self = Self {
        wall_time: u64::MAX,
        logical: u32::MAX,
    };

    /// Creates a new timestamp.
    #[inline]
    #[must_use]
    pub const fn new(wall_time: u64, logical: u32) -> Self {
        Self { wall_time, logical }
    }

    /// Creates a timestamp at the given number of milliseconds.
    #[inline]
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self::new(millis * NANOS_PER_MILLI, 0)
    }

    /// Returns true if this is the zero timestamp.
    #[inline]
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.wall_time == 0 && self.logical == 0
    }

    /// Returns the next representable timestamp.
    ///
    /// Increments the logical counter; on overflow the wall time moves
    /// forward by one nanosecond instead.
    #[inline]
    #[must_use]
    pub const fn next(&self) -> Self {
        if self.logical == u32::MAX {
            Self::new(self.wall_time.saturating_add(1), 0)
        } else {
            Self::new(self.wall_time, self.logical + 1)
        }
    }

    /// Returns this timestamp moved forward by a duration, keeping the
    /// logical counter.
    #[inline]
    #[must_use]
    pub fn add(&self, duration: Duration) -> Self {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        Self::new(self.wall_time.saturating_add(nanos), self.logical)
    }

    /// Moves this timestamp forward to `other` if `other` is greater.
    /// Returns true if the timestamp changed.
    #[inline]
    pub fn forward(&mut self, other: Timestamp) -> bool {
        if other > *self {
            *self = other;
            true
        } else {
            false
        }
    }

    /// Returns the wall time in whole milliseconds.
    #[inline]
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.wall_time / NANOS_PER_MILLI
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({self})")
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:09},{}",
            self.wall_time / 1_000_000_000,
            self.wall_time % 1_000_000_000,
            self.logical
        )
    }
}
