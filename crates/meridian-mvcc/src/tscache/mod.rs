//! Timestamp cache.
//!
//! Records the latest timestamps at which keys (and key spans) were read
//! and written, so that a later write can be pushed above any read it
//! would otherwise invalidate. Each mark remembers the transaction that
//! set it; when two transactions set the same mark it is shared and no
//! longer attributed to either. A transaction's own marks never push its
//! own writes.
//!
//! Entries older than the configured window, or beyond the entry budget,
//! are folded into a low water mark that constrains every key. Unknown
//! keys are constrained by the low water mark alone.

use std::collections::BTreeMap;

use meridian_common::config::TsCacheConfig;
use meridian_common::{Key, Timestamp, TxnId};
use parking_lot::Mutex;
use tracing::{debug, trace};

/// How many insertions may happen between window sweeps.
const SWEEP_INTERVAL: usize = 1024;

/// A high-water mark and the transaction that set it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Mark {
    ts: Timestamp,
    /// `None` when non-transactional or set by several transactions.
    txn: Option<TxnId>,
}

impl Mark {
    fn record(&mut self, ts: Timestamp, txn: Option<TxnId>) {
        if ts > self.ts {
            self.ts = ts;
            self.txn = txn;
        } else if ts == self.ts && self.txn != txn {
            self.txn = None;
        }
    }

    /// The constraint this mark puts on a write by `writer`.
    fn constraint_for(&self, writer: Option<TxnId>) -> Timestamp {
        match (self.txn, writer) {
            (Some(owner), Some(writer)) if owner == writer => Timestamp::ZERO,
            _ => self.ts,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Entry {
    read: Mark,
    write: Mark,
}

impl Entry {
    fn newest(&self) -> Timestamp {
        self.read.ts.max(self.write.ts)
    }
}

#[derive(Debug)]
struct Span {
    start: Key,
    end: Key,
    read: Mark,
}

impl Span {
    fn contains(&self, key: &Key) -> bool {
        &self.start <= key && key < &self.end
    }
}

#[derive(Debug, Default)]
struct Inner {
    points: BTreeMap<Key, Entry>,
    spans: Vec<Span>,
    low_water: Timestamp,
    /// Newest timestamp ever recorded; eviction is relative to it.
    newest: Timestamp,
    since_sweep: usize,
}

/// Per-range cache of read and write high-water marks.
#[derive(Debug)]
pub struct TimestampCache {
    inner: Mutex<Inner>,
    window_nanos: u64,
    max_entries: usize,
}

impl TimestampCache {
    /// Creates a cache whose low water mark starts at `low_water`.
    pub fn new(config: &TsCacheConfig, low_water: Timestamp) -> Self {
        Self {
            inner: Mutex::new(Inner {
                low_water,
                newest: low_water,
                ..Inner::default()
            }),
            window_nanos: u64::try_from(config.window.as_nanos()).unwrap_or(u64::MAX),
            max_entries: config.max_entries.max(1),
        }
    }

    /// Returns the current low water mark.
    pub fn low_water(&self) -> Timestamp {
        self.inner.lock().low_water
    }

    /// Returns the number of point and span entries held.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.points.len() + inner.spans.len()
    }

    /// Returns true if no entries are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records a read of `key` at `ts`.
    pub fn record_read(&self, key: &Key, ts: Timestamp, txn: Option<TxnId>) {
        let mut inner = self.inner.lock();
        if ts <= inner.low_water {
            return;
        }
        inner
            .points
            .entry(key.clone())
            .or_default()
            .read
            .record(ts, txn);
        self.after_insert(&mut inner, ts);
    }

    /// Records a read of the span `[start, end)` at `ts`.
    pub fn record_read_span(&self, start: &Key, end: &Key, ts: Timestamp, txn: Option<TxnId>) {
        if end <= start {
            return;
        }
        let mut inner = self.inner.lock();
        if ts <= inner.low_water {
            return;
        }
        let existing = inner
            .spans
            .iter()
            .position(|s| &s.start == start && &s.end == end);
        match existing {
            Some(i) => inner.spans[i].read.record(ts, txn),
            None => {
                let mut read = Mark::default();
                read.record(ts, txn);
                inner.spans.push(Span {
                    start: start.clone(),
                    end: end.clone(),
                    read,
                });
            }
        }
        self.after_insert(&mut inner, ts);
    }

    /// Records a write of `key` at `ts`.
    pub fn record_write(&self, key: &Key, ts: Timestamp, txn: Option<TxnId>) {
        let mut inner = self.inner.lock();
        if ts <= inner.low_water {
            return;
        }
        inner
            .points
            .entry(key.clone())
            .or_default()
            .write
            .record(ts, txn);
        self.after_insert(&mut inner, ts);
    }

    /// The minimum timestamp at which `writer` may write `key`: one past
    /// the newest read or write mark that constrains it. `None` when
    /// nothing is known about the key and there is no low water mark.
    pub fn min_write_ts(&self, key: &Key, writer: Option<TxnId>) -> Option<Timestamp> {
        let inner = self.inner.lock();
        let mut max = inner.low_water;

        if let Some(entry) = inner.points.get(key) {
            max = max
                .max(entry.read.constraint_for(writer))
                .max(entry.write.constraint_for(writer));
        }
        for span in inner.spans.iter().filter(|s| s.contains(key)) {
            max = max.max(span.read.constraint_for(writer));
        }

        if max.is_zero() {
            None
        } else {
            Some(max.next())
        }
    }

    fn after_insert(&self, inner: &mut Inner, ts: Timestamp) {
        inner.newest.forward(ts);
        inner.since_sweep += 1;

        let size = inner.points.len() + inner.spans.len();
        if size > self.max_entries {
            self.evict_to_capacity(inner);
        } else if inner.since_sweep >= SWEEP_INTERVAL {
            self.sweep_window(inner);
        }
    }

    /// Folds every entry older than the window into the low water mark.
    fn sweep_window(&self, inner: &mut Inner) {
        inner.since_sweep = 0;
        if inner.newest.wall_time <= self.window_nanos {
            return;
        }
        let cutoff = Timestamp::new(inner.newest.wall_time - self.window_nanos, 0);
        Self::evict_below(inner, cutoff);
    }

    /// Evicts the oldest entries until the cache is back under three
    /// quarters of its budget.
    fn evict_to_capacity(&self, inner: &mut Inner) {
        let mut stamps: Vec<Timestamp> = inner
            .points
            .values()
            .map(Entry::newest)
            .chain(inner.spans.iter().map(|s| s.read.ts))
            .collect();
        stamps.sort_unstable();

        let keep = self.max_entries - self.max_entries / 4;
        let excess = stamps.len().saturating_sub(keep);
        if excess == 0 {
            return;
        }
        // Everything at or below the cutoff goes; ties may evict a little
        // more than strictly needed.
        let cutoff = stamps[excess - 1].next();
        Self::evict_below(inner, cutoff);
    }

    /// Removes every entry strictly below `cutoff`, raising the low water
    /// mark to the newest removed timestamp.
    fn evict_below(inner: &mut Inner, cutoff: Timestamp) {
        let before = inner.points.len() + inner.spans.len();
        let mut low_water = inner.low_water;

        inner.points.retain(|_, entry| {
            let newest = entry.newest();
            if newest < cutoff {
                low_water.forward(newest);
                false
            } else {
                true
            }
        });
        inner.spans.retain(|span| {
            if span.read.ts < cutoff {
                low_water.forward(span.read.ts);
                false
            } else {
                true
            }
        });

        let evicted = before - (inner.points.len() + inner.spans.len());
        if evicted > 0 {
            inner.low_water = low_water;
            debug!(evicted, low_water = %low_water, "timestamp cache evicted entries");
        } else {
            trace!("timestamp cache sweep found nothing to evict");
        }
    }
}
