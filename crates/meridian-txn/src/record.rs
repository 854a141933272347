//! Transaction records.
//!
//! Every transaction on a node has a record holding its authoritative
//! status, timestamp and liveness. Pushers consult and modify the record;
//! the owning coordinator heartbeats it and finalizes it on commit or
//! abort. Each record carries a condition variable signalled on every
//! change so blocked pushers wake as soon as the owner finishes.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use meridian_common::{NodeId, TxnId, TxnMeta, TxnStatus};
use parking_lot::{Condvar, Mutex};

/// Snapshot of a transaction record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnRecord {
    /// Identity, current epoch, priority and timestamp.
    pub meta: TxnMeta,
    /// Current status.
    pub status: TxnStatus,
    /// Physical time (nanoseconds) of the owner's last sign of life.
    pub last_heartbeat: u64,
}

impl TxnRecord {
    /// Returns true if the owner has not heartbeated for longer than
    /// `expiration` as of physical time `now`.
    #[must_use]
    pub fn is_expired(&self, now: u64, expiration: Duration) -> bool {
        let expiration = u64::try_from(expiration.as_nanos()).unwrap_or(u64::MAX);
        now.saturating_sub(self.last_heartbeat) > expiration
    }
}

/// A shared, lockable transaction record.
#[derive(Debug)]
pub struct RecordEntry {
    record: Mutex<TxnRecord>,
    changed: Condvar,
}

impl RecordEntry {
    fn new(record: TxnRecord) -> Self {
        Self {
            record: Mutex::new(record),
            changed: Condvar::new(),
        }
    }

    /// Returns a copy of the record.
    pub fn read(&self) -> TxnRecord {
        *self.record.lock()
    }

    /// Mutates the record under its lock and wakes every waiter.
    pub fn update<R>(&self, f: impl FnOnce(&mut TxnRecord) -> R) -> R {
        let mut record = self.record.lock();
        let result = f(&mut record);
        self.changed.notify_all();
        result
    }

    /// Blocks until the record changes or `timeout` passes, unless it is
    /// already finalized. Returns the record as last seen.
    pub fn wait_change(&self, timeout: Duration) -> TxnRecord {
        let mut record = self.record.lock();
        if !record.status.is_finalized() {
            let _ = self.changed.wait_for(&mut record, timeout);
        }
        *record
    }
}

/// The node-wide table of transaction records.
#[derive(Debug, Default)]
pub struct TxnRegistry {
    records: DashMap<TxnId, Arc<RecordEntry>>,
}

impl TxnRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a pending record for `meta`, heartbeated at `now`.
    pub fn begin(&self, meta: TxnMeta, now: u64) -> Arc<RecordEntry> {
        let entry = Arc::new(RecordEntry::new(TxnRecord {
            meta,
            status: TxnStatus::Pending,
            last_heartbeat: now,
        }));
        self.records.insert(meta.id, Arc::clone(&entry));
        entry
    }

    /// Returns the record for `id`.
    pub fn get(&self, id: TxnId) -> Option<Arc<RecordEntry>> {
        self.records.get(&id).map(|r| Arc::clone(r.value()))
    }

    /// Returns the status of `id`, if known.
    pub fn status(&self, id: TxnId) -> Option<TxnStatus> {
        self.get(id).map(|entry| entry.read().status)
    }

    /// Returns the number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if there are no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Allocates transaction IDs unique to a node.
#[derive(Debug)]
pub struct TxnIdGenerator {
    node: NodeId,
    next: AtomicU64,
}

impl TxnIdGenerator {
    /// Creates a generator for `node`.
    #[must_use]
    pub const fn new(node: NodeId) -> Self {
        Self {
            node,
            next: AtomicU64::new(1),
        }
    }

    /// Allocates the next ID.
    pub fn next_id(&self) -> TxnId {
        TxnId::for_node(self.node, self.next.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::{Priority, Timestamp};
    use std::thread;
    use std::time::Instant;

    fn meta(id: u64) -> TxnMeta {
        TxnMeta::new(TxnId::new(id), Priority::new(1), Timestamp::new(10, 0))
    }

    #[test]
    fn test_begin_and_get() {
        let registry = TxnRegistry::new();
        registry.begin(meta(1), 100);

        let record = registry.get(TxnId::new(1)).unwrap().read();
        assert_eq!(record.status, TxnStatus::Pending);
        assert_eq!(record.last_heartbeat, 100);
        assert_eq!(registry.status(TxnId::new(2)), None);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_expiration() {
        let registry = TxnRegistry::new();
        let entry = registry.begin(meta(1), 1_000);
        let record = entry.read();

        assert!(!record.is_expired(1_500, Duration::from_nanos(500)));
        assert!(record.is_expired(1_501, Duration::from_nanos(500)));
    }

    #[test]
    fn test_wait_returns_when_finalized() {
        let registry = TxnRegistry::new();
        let entry = registry.begin(meta(1), 0);
        entry.update(|r| r.status = TxnStatus::Committed);

        let start = Instant::now();
        let record = entry.wait_change(Duration::from_secs(10));
        assert_eq!(record.status, TxnStatus::Committed);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_update_wakes_waiter() {
        let registry = Arc::new(TxnRegistry::new());
        let entry = registry.begin(meta(1), 0);

        let waiter = {
            let entry = Arc::clone(&entry);
            thread::spawn(move || loop {
                let record = entry.wait_change(Duration::from_millis(50));
                if record.status.is_finalized() {
                    return record.status;
                }
            })
        };
        thread::sleep(Duration::from_millis(20));
        entry.update(|r| r.status = TxnStatus::Aborted);

        assert_eq!(waiter.join().unwrap(), TxnStatus::Aborted);
    }

    #[test]
    fn test_id_generator() {
        let ids = TxnIdGenerator::new(NodeId::new(3));
        let a = ids.next_id();
        let b = ids.next_id();
        assert_ne!(a, b);
        assert!(a.is_valid() && b.is_valid());
    }
}
