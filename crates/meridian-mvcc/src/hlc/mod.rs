//! Hybrid Logical Clock (HLC) implementation.
//!
//! HLC provides monotonic timestamps that combine physical time with logical
//! counters. This gives us:
//! - Causality tracking (like Lamport clocks)
//! - Bounded clock skew (tied to physical time)
//! - Total ordering of events across distributed nodes
//!
//! # Algorithm
//!
//! On local event (`now`):
//! 1. if pt > l then l = pt, c = 0
//! 2. else c = c + 1
//!
//! On receive event with timestamp (l_m, c_m):
//! 1. if pt > l and pt > l_m then l = pt, c = 0
//! 2. else if l_m > l then l = l_m, c = c_m + 1
//! 3. else if l > l_m then c = c + 1
//! 4. else c = max(c, c_m) + 1
//!
//! # Trusted and checked updates
//!
//! A node acting as the authority for a key admits a request with
//! [`HybridClock::check_and_update`], which refuses timestamps more than
//! `max_offset` ahead of local physical time. A command that was already
//! admitted elsewhere is replayed with [`HybridClock::update_trusted`],
//! which always succeeds so that every replica incorporates the same
//! timestamps.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use meridian_common::{MeridianError, MeridianResult, Timestamp};
use tracing::warn;

/// A source of physical time, in nanoseconds since the Unix epoch.
pub trait PhysicalClock: Send + Sync + fmt::Debug {
    /// Returns the current physical time.
    fn now_nanos(&self) -> u64;
}

/// Physical clock backed by the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl PhysicalClock for SystemClock {
    fn now_nanos(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos()
            .try_into()
            .unwrap_or(u64::MAX)
    }
}

/// A physical clock that only moves when told to.
///
/// Tests share one `ManualClock` between a [`HybridClock`] and the test
/// body to drive time deterministically.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    /// Creates a manual clock reading `nanos`.
    #[must_use]
    pub const fn new(nanos: u64) -> Self {
        Self {
            nanos: AtomicU64::new(nanos),
        }
    }

    /// Advances the clock by `nanos`.
    pub fn increment(&self, nanos: u64) {
        self.nanos.fetch_add(nanos, AtomicOrdering::AcqRel);
    }

    /// Advances the clock by a duration.
    pub fn advance(&self, by: Duration) {
        self.increment(u64::try_from(by.as_nanos()).unwrap_or(u64::MAX));
    }

    /// Sets the clock to `nanos`.
    pub fn set(&self, nanos: u64) {
        self.nanos.store(nanos, AtomicOrdering::Release);
    }
}

impl PhysicalClock for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.nanos.load(AtomicOrdering::Acquire)
    }
}

/// A Hybrid Logical Clock.
///
/// Thread-safe clock that maintains monotonic timestamps combining
/// physical time with logical counters. Each simulated node owns one and
/// hands out `Arc<HybridClock>` handles; there is no process-wide clock.
pub struct HybridClock {
    /// Source of physical time.
    physical: Arc<dyn PhysicalClock>,
    /// Latest timestamp handed out or observed.
    state: Mutex<Timestamp>,
    /// Maximum tolerated offset in nanoseconds; zero disables checks.
    max_offset_nanos: AtomicU64,
}

impl HybridClock {
    /// Creates a clock reading from `physical`, with the given maximum
    /// offset.
    pub fn new(physical: Arc<dyn PhysicalClock>, max_offset: Duration) -> Self {
        Self {
            physical,
            state: Mutex::new(Timestamp::ZERO),
            max_offset_nanos: AtomicU64::new(duration_nanos(max_offset)),
        }
    }

    /// Creates a clock backed by the system wall clock.
    pub fn system(max_offset: Duration) -> Self {
        Self::new(Arc::new(SystemClock), max_offset)
    }

    /// Returns the current physical time in nanoseconds.
    #[inline]
    pub fn physical_now(&self) -> u64 {
        self.physical.now_nanos()
    }

    /// Returns the configured maximum offset.
    pub fn max_offset(&self) -> Duration {
        Duration::from_nanos(self.max_offset_nanos.load(AtomicOrdering::Acquire))
    }

    /// Changes the maximum offset. Zero disables the offset check.
    pub fn set_max_offset(&self, max_offset: Duration) {
        self.max_offset_nanos
            .store(duration_nanos(max_offset), AtomicOrdering::Release);
    }

    /// Generates a new timestamp for a local event.
    ///
    /// Strictly greater than every timestamp previously returned or
    /// observed by this clock.
    pub fn now(&self) -> Timestamp {
        let mut state = self.state.lock();
        let pt = self.physical.now_nanos();
        if pt > state.wall_time {
            *state = Timestamp::new(pt, 0);
        } else {
            *state = state.next();
        }
        *state
    }

    /// Returns the current timestamp without advancing the clock.
    pub fn peek(&self) -> Timestamp {
        *self.state.lock()
    }

    /// Incorporates a timestamp from a command that has already been
    /// admitted. Never fails, no matter how far ahead `observed` is.
    ///
    /// Returns the clock's new state, which is strictly greater than
    /// `observed`.
    pub fn update_trusted(&self, observed: Timestamp) -> Timestamp {
        let mut state = self.state.lock();
        let pt = self.physical.now_nanos();
        Self::merge(&mut state, pt, observed);
        *state
    }

    /// Incorporates a timestamp from a newly submitted request.
    ///
    /// # Errors
    ///
    /// Returns `ClockOffsetExceeded`, leaving the clock untouched, when
    /// `observed` is more than `max_offset` ahead of physical time.
    pub fn check_and_update(&self, observed: Timestamp) -> MeridianResult<Timestamp> {
        let mut state = self.state.lock();
        let pt = self.physical.now_nanos();
        let max_offset = self.max_offset_nanos.load(AtomicOrdering::Acquire);

        if max_offset > 0 && observed.wall_time > pt.saturating_add(max_offset) {
            warn!(
                ts = %observed,
                physical = pt,
                max_offset_ms = max_offset / 1_000_000,
                "rejecting timestamp beyond max clock offset"
            );
            return Err(MeridianError::ClockOffsetExceeded {
                timestamp: observed,
                physical_ns: pt,
                max_offset_ms: max_offset / 1_000_000,
            });
        }

        Self::merge(&mut state, pt, observed);
        Ok(*state)
    }

    /// The HLC receive rule.
    fn merge(state: &mut Timestamp, pt: u64, observed: Timestamp) {
        if pt > state.wall_time && pt > observed.wall_time {
            *state = Timestamp::new(pt, 0);
        } else if observed.wall_time > state.wall_time {
            *state = observed.next();
        } else if state.wall_time > observed.wall_time {
            *state = state.next();
        } else {
            let logical = state.logical.max(observed.logical);
            *state = Timestamp::new(state.wall_time, logical).next();
        }
    }
}

impl fmt::Debug for HybridClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridClock")
            .field("state", &*self.state.lock())
            .field("max_offset", &self.max_offset())
            .finish()
    }
}

fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = 1_000_000;

    fn manual(start: u64, max_offset_ms: u64) -> (Arc<ManualClock>, HybridClock) {
        let manual = Arc::new(ManualClock::new(start));
        let clock = HybridClock::new(manual.clone(), Duration::from_millis(max_offset_ms));
        (manual, clock)
    }

    #[test]
    fn test_now_monotonic() {
        let clock = HybridClock::system(Duration::from_millis(250));

        let mut prev = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > prev, "HLC must be monotonic");
            prev = next;
        }
    }

    #[test]
    fn test_now_logical_resets() {
        let (manual, clock) = manual(10, 0);

        assert_eq!(clock.now(), Timestamp::new(10, 0));
        assert_eq!(clock.now(), Timestamp::new(10, 1));
        assert_eq!(clock.now(), Timestamp::new(10, 2));

        manual.increment(5);
        assert_eq!(clock.now(), Timestamp::new(15, 0));
    }

    #[test]
    fn test_peek_does_not_advance() {
        let (_manual, clock) = manual(10, 0);
        let ts = clock.now();
        assert_eq!(clock.peek(), ts);
        assert_eq!(clock.peek(), ts);
    }

    #[test]
    fn test_update_trusted_far_future() {
        let (_manual, clock) = manual(MS, 100);
        let future = Timestamp::from_millis(501);

        let updated = clock.update_trusted(future);
        assert!(updated > future);
        assert!(clock.now().wall_time >= future.wall_time);
    }

    #[test]
    fn test_update_from_past() {
        let (_manual, clock) = manual(100 * MS, 100);
        let current = clock.now();

        let updated = clock.update_trusted(Timestamp::from_millis(50));
        assert!(updated > current);
        assert_eq!(updated.wall_time, current.wall_time);
    }

    #[test]
    fn test_update_same_wall_time() {
        let (_manual, clock) = manual(0, 100);
        clock.update_trusted(Timestamp::new(50, 3));
        let updated = clock.update_trusted(Timestamp::new(50, 7));
        assert_eq!(updated, Timestamp::new(50, 8));
    }

    #[test]
    fn test_check_and_update_rejects() {
        let (_manual, clock) = manual(0, 100);
        let before = clock.update_trusted(Timestamp::from_millis(190));

        let result = clock.check_and_update(Timestamp::from_millis(500));
        assert!(matches!(
            result,
            Err(MeridianError::ClockOffsetExceeded { .. })
        ));
        assert_eq!(clock.peek(), before);
    }

    #[test]
    fn test_check_and_update_boundary() {
        let (_manual, clock) = manual(100 * MS, 100);

        assert!(clock.check_and_update(Timestamp::from_millis(200)).is_ok());
        assert!(clock
            .check_and_update(Timestamp::new(200 * MS + 1, 0))
            .is_err());
    }

    #[test]
    fn test_zero_max_offset_disables_check() {
        let (_manual, clock) = manual(0, 0);
        let far = Timestamp::from_millis(60_000);
        assert!(clock.check_and_update(far).unwrap() > far);

        clock.set_max_offset(Duration::from_millis(10));
        assert_eq!(clock.max_offset(), Duration::from_millis(10));
        assert!(clock.check_and_update(Timestamp::from_millis(120_000)).is_err());
    }

    #[test]
    fn test_concurrent_access() {
        use std::collections::HashSet;
        use std::thread;

        let clock = Arc::new(HybridClock::system(Duration::ZERO));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let clock = Arc::clone(&clock);
                thread::spawn(move || (0..1000).map(|_| clock.now()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for ts in handle.join().unwrap() {
                assert!(seen.insert(ts), "duplicate timestamp {ts}");
            }
        }
    }
}
