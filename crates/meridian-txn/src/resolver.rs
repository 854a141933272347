//! Intent resolution.
//!
//! When a command meets an intent owned by another transaction, the
//! resolver decides what happens to the owner:
//!
//! ```text
//!                 ┌──────────────┐
//!                 │  Encountered │
//!                 └──────┬───────┘
//!        owner finalized │ pusher wins / owner expired │ pusher loses
//!        ┌───────────────┼──────────────┬──────────────┴──────┐
//!        ▼               ▼              ▼                     ▼
//!   ┌──────────┐   ┌──────────┐   ┌──────────┐       ┌────────────────┐
//!   │ Resolved │   │  Pushed  │   │ Aborted  │       │ AwaitingCommit │
//!   └──────────┘   └──────────┘   └──────────┘       └───────┬────────┘
//!                                                            │ owner finalized
//!                                                            ▼
//!                                                       ┌──────────┐
//!                                                       │ Resolved │
//!                                                       └──────────┘
//! ```
//!
//! Readers push the owner's timestamp above their read; writers abort the
//! owner. The pusher wins if its priority is higher; equal priorities go
//! to the lower transaction ID, and a non-transactional pusher counts as
//! the highest ID. An owner whose heartbeat expired is aborted by anyone.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use meridian_common::{
    Intent, MeridianError, MeridianResult, Priority, Timestamp, TxnId, TxnMeta, TxnStatus,
};
use meridian_mvcc::HybridClock;
use tracing::debug;

use crate::gate::CancelToken;
use crate::record::{TxnRecord, TxnRegistry};

/// What a pusher wants done to an intent's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushKind {
    /// Move the owner's timestamp to at least this value (reads).
    Timestamp(Timestamp),
    /// Abort the owner (writes).
    Abort,
}

/// The party trying to get past an intent.
#[derive(Debug, Clone, Copy)]
pub struct Pusher<'a> {
    /// The pusher's transaction, if any.
    pub txn: Option<&'a TxnMeta>,
    /// Priority of the push.
    pub priority: Priority,
    /// Give up with `Timeout` once this instant passes.
    pub deadline: Option<Instant>,
    /// Give up with `Cancelled` once this token fires.
    pub cancel: Option<&'a CancelToken>,
}

impl Pusher<'_> {
    fn id(&self) -> TxnId {
        self.txn.map_or(TxnId::MAX, |t| t.id)
    }

    /// True if this pusher outranks `owner`.
    fn outranks(&self, owner: &TxnMeta) -> bool {
        if self.priority != owner.priority {
            return self.priority > owner.priority;
        }
        self.id() < owner.id
    }
}

/// The states an encountered intent moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionState {
    /// The intent has just been met.
    Encountered,
    /// The owner's timestamp was pushed; it remains pending.
    Pushed,
    /// The owner was aborted.
    Aborted,
    /// The pusher lost and is waiting for the owner to finish.
    AwaitingCommit,
    /// The owner had already finished.
    Resolved,
}

/// Final decision for one intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    /// Terminal state reached.
    pub state: ResolutionState,
    /// The owner's record as of the decision. Resolve the intent with
    /// this metadata.
    pub owner: TxnMeta,
    /// Status to resolve the intent with.
    pub status: TxnStatus,
    /// True if the pusher had to wait on the way.
    pub waited: bool,
}

/// Statistics about intent resolution.
#[derive(Debug, Default)]
pub struct ResolverStats {
    /// Owners whose timestamp was pushed.
    pub pushes: AtomicU64,
    /// Owners aborted.
    pub aborts: AtomicU64,
    /// Pushes that had to wait.
    pub waits: AtomicU64,
    /// Waits that ended in timeout or cancellation.
    pub timeouts: AtomicU64,
}

impl ResolverStats {
    /// Creates new stats.
    pub fn new() -> Self {
        Self::default()
    }

    fn record_push(&self) {
        self.pushes.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record_abort(&self) {
        self.aborts.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record_wait(&self) {
        self.waits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn record_timeout(&self) {
        self.timeouts.fetch_add(1, AtomicOrdering::Relaxed);
    }
}

/// Decides the fate of transactions whose intents are in the way.
#[derive(Debug)]
pub struct IntentResolver {
    registry: Arc<TxnRegistry>,
    clock: Arc<HybridClock>,
    expiration: Duration,
    wait_tick: Duration,
    stats: ResolverStats,
}

impl IntentResolver {
    /// Creates a resolver over `registry`, judging liveness with `clock`.
    pub fn new(
        registry: Arc<TxnRegistry>,
        clock: Arc<HybridClock>,
        expiration: Duration,
        wait_tick: Duration,
    ) -> Self {
        Self {
            registry,
            clock,
            expiration,
            wait_tick,
            stats: ResolverStats::new(),
        }
    }

    /// Returns resolver statistics.
    pub fn stats(&self) -> &ResolverStats {
        &self.stats
    }

    /// Pushes the owner of `intent` until a terminal decision is reached.
    ///
    /// No store or cache state is touched here; the caller resolves the
    /// intent with the returned outcome.
    ///
    /// # Errors
    ///
    /// - `Timeout` / `Cancelled` if the pusher gives up while waiting
    /// - `TransactionAborted` if the pusher's own transaction is aborted
    ///   while it waits
    /// - `TransactionNotFound` if the pusher's transaction has no record
    ///   and would have to wait
    pub fn push(
        &self,
        intent: &Intent,
        pusher: &Pusher<'_>,
        kind: PushKind,
    ) -> MeridianResult<PushOutcome> {
        let owner_id = intent.txn.id;
        let Some(entry) = self.registry.get(owner_id) else {
            // No record means the owner can never commit.
            return Ok(PushOutcome {
                state: ResolutionState::Aborted,
                owner: intent.txn,
                status: TxnStatus::Aborted,
                waited: false,
            });
        };

        let started = Instant::now();
        let mut state = ResolutionState::Encountered;
        loop {
            let now = self.clock.physical_now();
            let decided = entry.update(|record| self.decide(record, pusher, kind, now));
            if let Some((next, record)) = decided {
                let waited = state == ResolutionState::AwaitingCommit;
                debug!(
                    key = %intent.key,
                    owner = %record.meta.id,
                    pusher = %pusher.id(),
                    state = ?next,
                    ts = %record.meta.timestamp,
                    "intent owner resolved"
                );
                return Ok(PushOutcome {
                    state: next,
                    owner: record.meta,
                    status: record.status,
                    waited,
                });
            }

            if state != ResolutionState::AwaitingCommit {
                state = ResolutionState::AwaitingCommit;
                self.stats.record_wait();
                debug!(
                    key = %intent.key,
                    owner = %owner_id,
                    pusher = %pusher.id(),
                    "waiting on higher priority intent owner"
                );
            }
            self.check_waiter(pusher, started)?;
            entry.wait_change(self.wait_tick);
        }
    }

    /// One decision attempt under the owner's record lock. `None` means
    /// the pusher must wait.
    fn decide(
        &self,
        record: &mut TxnRecord,
        pusher: &Pusher<'_>,
        kind: PushKind,
        now: u64,
    ) -> Option<(ResolutionState, TxnRecord)> {
        if record.status.is_finalized() {
            return Some((ResolutionState::Resolved, *record));
        }
        if let PushKind::Timestamp(to) = kind {
            if record.meta.timestamp >= to {
                return Some((ResolutionState::Pushed, *record));
            }
        }

        let expired = record.is_expired(now, self.expiration);
        if !expired && !pusher.outranks(&record.meta) {
            return None;
        }

        match kind {
            PushKind::Timestamp(to) if !expired => {
                record.meta.timestamp.forward(to);
                self.stats.record_push();
                Some((ResolutionState::Pushed, *record))
            }
            _ => {
                record.status = TxnStatus::Aborted;
                self.stats.record_abort();
                Some((ResolutionState::Aborted, *record))
            }
        }
    }

    fn check_waiter(&self, pusher: &Pusher<'_>, started: Instant) -> MeridianResult<()> {
        if let Some(deadline) = pusher.deadline {
            if Instant::now() >= deadline {
                self.stats.record_timeout();
                return Err(MeridianError::Timeout {
                    duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                });
            }
        }
        if pusher.cancel.is_some_and(CancelToken::is_cancelled) {
            self.stats.record_timeout();
            return Err(MeridianError::Cancelled);
        }
        // A waiting transaction needs a record for others to abort it.
        if let Some(txn) = pusher.txn {
            match self.registry.status(txn.id) {
                Some(TxnStatus::Aborted) => {
                    return Err(MeridianError::aborted(
                        txn.id,
                        "aborted while waiting on a conflicting intent",
                    ));
                }
                None => return Err(MeridianError::TransactionNotFound { txn_id: txn.id }),
                Some(_) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::Key;
    use meridian_mvcc::ManualClock;
    use std::thread;

    struct Fixture {
        registry: Arc<TxnRegistry>,
        manual: Arc<ManualClock>,
        resolver: Arc<IntentResolver>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(TxnRegistry::new());
        let manual = Arc::new(ManualClock::new(1_000));
        let clock = Arc::new(HybridClock::new(manual.clone(), Duration::ZERO));
        let resolver = Arc::new(IntentResolver::new(
            Arc::clone(&registry),
            clock,
            Duration::from_secs(1),
            Duration::from_millis(1),
        ));
        Fixture {
            registry,
            manual,
            resolver,
        }
    }

    fn meta(id: u64, priority: i32) -> TxnMeta {
        TxnMeta::new(TxnId::new(id), Priority::new(priority), Timestamp::new(100, 0))
    }

    fn intent_of(owner: &TxnMeta) -> Intent {
        Intent::new(Key::from_str("k"), *owner)
    }

    fn pusher(txn: Option<&TxnMeta>, priority: i32) -> Pusher<'_> {
        Pusher {
            txn,
            priority: Priority::new(priority),
            deadline: None,
            cancel: None,
        }
    }

    #[test]
    fn test_high_priority_read_pushes() {
        let f = fixture();
        let owner = meta(1, 1);
        f.registry.begin(owner, 1_000);

        let to = Timestamp::new(200, 1);
        let outcome = f
            .resolver
            .push(&intent_of(&owner), &pusher(None, 10), PushKind::Timestamp(to))
            .unwrap();
        assert_eq!(outcome.state, ResolutionState::Pushed);
        assert_eq!(outcome.status, TxnStatus::Pending);
        assert_eq!(outcome.owner.timestamp, to);

        let record = f.registry.get(owner.id).unwrap().read();
        assert_eq!(record.meta.timestamp, to);
        assert_eq!(f.resolver.stats().pushes.load(AtomicOrdering::Relaxed), 1);
    }

    #[test]
    fn test_high_priority_write_aborts() {
        let f = fixture();
        let owner = meta(1, 1);
        let other = meta(2, 5);
        f.registry.begin(owner, 1_000);

        let outcome = f
            .resolver
            .push(&intent_of(&owner), &pusher(Some(&other), 5), PushKind::Abort)
            .unwrap();
        assert_eq!(outcome.state, ResolutionState::Aborted);
        assert_eq!(f.registry.status(owner.id), Some(TxnStatus::Aborted));
    }

    #[test]
    fn test_tie_goes_to_lower_id() {
        let low = meta(1, 5);
        let high = meta(2, 5);
        assert!(pusher(Some(&low), 5).outranks(&high));
        assert!(!pusher(Some(&high), 5).outranks(&low));
        assert!(!pusher(None, 5).outranks(&high));
    }

    #[test]
    fn test_finalized_owner_is_resolved() {
        let f = fixture();
        let owner = meta(1, 100);
        f.registry
            .begin(owner, 1_000)
            .update(|r| r.status = TxnStatus::Committed);

        let outcome = f
            .resolver
            .push(&intent_of(&owner), &pusher(None, 1), PushKind::Abort)
            .unwrap();
        assert_eq!(outcome.state, ResolutionState::Resolved);
        assert_eq!(outcome.status, TxnStatus::Committed);
    }

    #[test]
    fn test_unknown_owner_is_aborted() {
        let f = fixture();
        let outcome = f
            .resolver
            .push(&intent_of(&meta(9, 1)), &pusher(None, 1), PushKind::Abort)
            .unwrap();
        assert_eq!(outcome.status, TxnStatus::Aborted);
    }

    #[test]
    fn test_expired_owner_aborted_by_anyone() {
        let f = fixture();
        let owner = meta(1, 100);
        f.registry.begin(owner, 1_000);
        f.manual.advance(Duration::from_secs(2));

        let outcome = f
            .resolver
            .push(
                &intent_of(&owner),
                &pusher(None, 1),
                PushKind::Timestamp(Timestamp::new(500, 0)),
            )
            .unwrap();
        assert_eq!(outcome.state, ResolutionState::Aborted);
    }

    #[test]
    fn test_low_priority_waits_for_commit() {
        let f = fixture();
        let owner = meta(1, 100);
        let entry = f.registry.begin(owner, 1_000);
        let low = meta(2, 1);
        f.registry.begin(low, 1_000);

        let waiter = {
            let resolver = Arc::clone(&f.resolver);
            thread::spawn(move || {
                resolver
                    .push(&intent_of(&owner), &pusher(Some(&low), 1), PushKind::Abort)
                    .unwrap()
            })
        };
        thread::sleep(Duration::from_millis(20));
        entry.update(|r| r.status = TxnStatus::Committed);

        let outcome = waiter.join().unwrap();
        assert_eq!(outcome.state, ResolutionState::Resolved);
        assert_eq!(outcome.status, TxnStatus::Committed);
        assert!(outcome.waited);
        assert_eq!(f.resolver.stats().waits.load(AtomicOrdering::Relaxed), 1);
    }

    #[test]
    fn test_wait_deadline() {
        let f = fixture();
        let owner = meta(1, 100);
        f.registry.begin(owner, 1_000);

        let mut p = pusher(None, 1);
        p.deadline = Some(Instant::now() + Duration::from_millis(10));
        let err = f
            .resolver
            .push(&intent_of(&owner), &p, PushKind::Abort)
            .unwrap_err();
        assert!(matches!(err, MeridianError::Timeout { .. }));
        assert_eq!(f.registry.status(owner.id), Some(TxnStatus::Pending));
    }

    #[test]
    fn test_wait_cancelled() {
        let f = fixture();
        let owner = meta(1, 100);
        f.registry.begin(owner, 1_000);

        let token = CancelToken::new();
        token.cancel();
        let mut p = pusher(None, 1);
        p.cancel = Some(&token);
        let err = f
            .resolver
            .push(&intent_of(&owner), &p, PushKind::Abort)
            .unwrap_err();
        assert!(matches!(err, MeridianError::Cancelled));
    }

    #[test]
    fn test_waiter_without_record() {
        let f = fixture();
        let owner = meta(1, 100);
        f.registry.begin(owner, 1_000);

        let unknown = meta(2, 1);
        let err = f
            .resolver
            .push(&intent_of(&owner), &pusher(Some(&unknown), 1), PushKind::Abort)
            .unwrap_err();
        assert!(matches!(err, MeridianError::TransactionNotFound { txn_id } if txn_id == unknown.id));
        assert_eq!(f.registry.status(owner.id), Some(TxnStatus::Pending));
    }
}
