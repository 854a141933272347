//! Transaction coordination.
//!
//! [`TxnCoordinator::run`] opens a transaction record and calls the body
//! with a [`Txn`] handle. When the body (or the commit that follows it)
//! fails with a retryable conflict, the coordinator bumps the epoch,
//! moves the transaction timestamp to the minimum the conflict demands,
//! and calls the body again:
//!
//! ```text
//!            ┌─────────┐
//!            │  begin  │  epoch 0, ts = clock.now()
//!            └────┬────┘
//!                 ▼
//!            ┌─────────┐  retryable conflict    ┌──────────────┐
//!      ┌────▶│  body   │───────────────────────▶│   restart    │
//!      │     └────┬────┘                        │  epoch += 1  │
//!      │          │ Ok                          └──────┬───────┘
//!      │          ▼                                    │
//!      │     ┌─────────┐  pushed                       │
//!      │     │ commit  │───────────────────────────────┤
//!      │     └────┬────┘                               │
//!      │          ▼                                    │
//!      │     ┌───────────┐                             │
//!      │     │ committed │                             │
//!      │     └───────────┘                             │
//!      └───────────────────────────────────────────────┘
//! ```
//!
//! A transaction aborted by a pusher restarts under a fresh record (new
//! ID, its old intents discarded). Other errors abort the transaction and
//! are returned as is.
//!
//! Intents left by an abandoned epoch are not cleaned up at restart. The
//! next epoch overwrites the ones it writes again, and commit discards
//! any older-epoch intent it finds.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use meridian_common::{
    Key, MeridianError, MeridianResult, Priority, Timestamp, TxnId, TxnMeta, TxnStatus, Value,
};
use tracing::{debug, warn};

use crate::gate::{CancelToken, Command, Request, Response};
use crate::record::RecordEntry;
use crate::store::Store;

/// Per-transaction options.
#[derive(Debug, Clone, Default)]
pub struct TxnOptions {
    /// Conflict priority. Falls back to the node's configured priority,
    /// then to a random one.
    pub user_priority: Option<Priority>,
    /// Longest the whole transaction may spend waiting on other
    /// transactions' intents.
    pub timeout: Option<Duration>,
    /// Restart bound. Falls back to the node configuration.
    pub max_retries: Option<u32>,
    /// Cancels waits on other transactions' intents.
    pub cancel: Option<CancelToken>,
}

impl TxnOptions {
    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.user_priority = Some(priority);
        self
    }

    /// Sets the wait timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the restart bound.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Statistics about coordinated transactions.
#[derive(Debug, Default)]
pub struct TxnStats {
    /// Transactions started.
    pub started: AtomicU64,
    /// Transactions committed.
    pub committed: AtomicU64,
    /// Transactions aborted.
    pub aborted: AtomicU64,
    /// Epoch restarts across all transactions.
    pub restarts: AtomicU64,
}

impl TxnStats {
    /// Creates new stats.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Handle to the running transaction, passed to the body on every epoch.
#[derive(Debug)]
pub struct Txn<'a> {
    store: &'a Store,
    record: Arc<RecordEntry>,
    meta: TxnMeta,
    deadline: Option<Instant>,
    cancel: Option<CancelToken>,
    /// Keys this record may hold intents on, across epochs.
    written: BTreeSet<Key>,
    /// Highest timestamp a write of the current epoch landed at.
    max_write_ts: Timestamp,
    committed: bool,
}

impl<'a> Txn<'a> {
    fn begin(
        store: &'a Store,
        priority: Priority,
        deadline: Option<Instant>,
        cancel: Option<CancelToken>,
    ) -> Self {
        let meta = TxnMeta::new(store.next_txn_id(), priority, store.clock().now());
        let record = store.registry().begin(meta, store.clock().physical_now());
        debug!(txn = %meta.id, priority = %priority, ts = %meta.timestamp, "began transaction");
        Self {
            store,
            record,
            meta,
            deadline,
            cancel,
            written: BTreeSet::new(),
            max_write_ts: Timestamp::ZERO,
            committed: false,
        }
    }

    /// Returns the transaction ID. Changes if the transaction is aborted
    /// by another and restarted.
    pub fn id(&self) -> TxnId {
        self.meta.id
    }

    /// Returns the current epoch.
    pub fn epoch(&self) -> u32 {
        self.meta.epoch
    }

    /// Returns the timestamp this epoch reads and writes at.
    pub fn timestamp(&self) -> Timestamp {
        self.meta.timestamp
    }

    /// Returns the conflict priority.
    pub fn priority(&self) -> Priority {
        self.meta.priority
    }

    /// Returns the transaction metadata sent with every request.
    pub fn meta(&self) -> TxnMeta {
        self.meta
    }

    /// Reads `key`.
    ///
    /// # Errors
    ///
    /// Returns conflict errors; the coordinator retries the retryable
    /// ones when they are propagated out of the body.
    pub fn get(&mut self, key: impl Into<Key>) -> MeridianResult<Option<Value>> {
        self.send(Command::get(key))?.into_value()
    }

    /// Writes `key`.
    ///
    /// # Errors
    ///
    /// Returns conflict errors.
    pub fn put(&mut self, key: impl Into<Key>, value: impl Into<Value>) -> MeridianResult<()> {
        self.send(Command::put(key, value)).map(|_| ())
    }

    /// Deletes `key`.
    ///
    /// # Errors
    ///
    /// Returns conflict errors.
    pub fn delete(&mut self, key: impl Into<Key>) -> MeridianResult<()> {
        self.send(Command::delete(key)).map(|_| ())
    }

    /// Reads up to `max_results` live keys in `[start, end)`; zero means
    /// unlimited.
    ///
    /// # Errors
    ///
    /// Returns conflict errors, or `KeyOutOfRange` if the span crosses a
    /// range boundary.
    pub fn scan(
        &mut self,
        start: impl Into<Key>,
        end: impl Into<Key>,
        max_results: usize,
    ) -> MeridianResult<Vec<(Key, Value)>> {
        self.send(Command::scan(start, end, max_results))?.into_rows()
    }

    /// Adds `delta` to the integer at `key` and returns the new value.
    ///
    /// # Errors
    ///
    /// Returns conflict errors, or `InvalidArgument` if the current value
    /// is not an integer.
    pub fn increment(&mut self, key: impl Into<Key>, delta: i64) -> MeridianResult<i64> {
        self.send(Command::increment(key, delta))?.into_integer()
    }

    /// Writes `key` if its current value equals `expected`.
    ///
    /// # Errors
    ///
    /// Returns `ConditionFailed` if the value differs, or conflict errors.
    pub fn conditional_put(
        &mut self,
        key: impl Into<Key>,
        value: impl Into<Value>,
        expected: Option<Value>,
    ) -> MeridianResult<()> {
        self.send(Command::conditional_put(key, value, expected))
            .map(|_| ())
    }

    /// Commits the transaction and returns its commit timestamp.
    ///
    /// The body may call this explicitly; otherwise the coordinator
    /// commits after the body returns.
    ///
    /// # Errors
    ///
    /// - `TransactionPushed` if the transaction's timestamp moved during
    ///   this epoch; retryable
    /// - `TransactionAborted` if another transaction aborted it
    /// - any error resolving the committed intents; the transaction is
    ///   committed regardless
    pub fn commit(&mut self) -> MeridianResult<Timestamp> {
        if self.committed {
            return Ok(self.meta.timestamp);
        }

        let meta = self.meta;
        let max_write_ts = self.max_write_ts;
        self.record.update(|record| match record.status {
            TxnStatus::Aborted => Err(MeridianError::aborted(
                meta.id,
                "aborted by a conflicting transaction",
            )),
            TxnStatus::Committed => Err(MeridianError::InvalidTransactionState {
                txn_id: meta.id,
                current: record.status.to_string(),
                expected: "pending",
            }),
            TxnStatus::Pending => {
                let mut pushed = record.meta.timestamp;
                pushed.forward(max_write_ts);
                if pushed > meta.timestamp {
                    record.meta.timestamp = pushed;
                    return Err(MeridianError::TransactionPushed {
                        txn_id: meta.id,
                        pushed_ts: pushed,
                    });
                }
                record.status = TxnStatus::Committed;
                record.meta = meta;
                Ok(())
            }
        })?;

        self.committed = true;
        debug!(txn = %meta.id, epoch = meta.epoch, ts = %meta.timestamp, "committed transaction");
        self.resolve_written(meta, TxnStatus::Committed)?;
        Ok(meta.timestamp)
    }

    fn send(&mut self, command: Command) -> MeridianResult<Response> {
        self.heartbeat()?;

        let write_key = (!command.is_read()).then(|| command.key().clone());
        let mut request = Request::new(command).with_txn(self.meta);
        request.header.deadline = self.deadline;
        request.header.cancel.clone_from(&self.cancel);

        let response = self.store.execute(request)?;
        if let Some(key) = write_key {
            self.written.insert(key);
            self.max_write_ts.forward(response.timestamp);
        }
        Ok(response)
    }

    /// Refreshes the record's heartbeat, failing if the transaction can no
    /// longer issue commands.
    fn heartbeat(&self) -> MeridianResult<()> {
        if self.committed {
            return Err(MeridianError::InvalidTransactionState {
                txn_id: self.meta.id,
                current: TxnStatus::Committed.to_string(),
                expected: "pending",
            });
        }
        let now = self.store.clock().physical_now();
        let status = self.record.update(|record| {
            if record.status == TxnStatus::Pending {
                record.last_heartbeat = now;
            }
            record.status
        });
        match status {
            TxnStatus::Pending => Ok(()),
            TxnStatus::Aborted => Err(MeridianError::aborted(
                self.meta.id,
                "aborted by a conflicting transaction",
            )),
            TxnStatus::Committed => Err(MeridianError::InvalidTransactionState {
                txn_id: self.meta.id,
                current: status.to_string(),
                expected: "pending",
            }),
        }
    }

    fn is_aborted(&self) -> bool {
        self.record.read().status == TxnStatus::Aborted
    }

    /// Starts the next epoch under the same record.
    fn restart(&mut self, cause: &MeridianError) {
        let mut ts = self.meta.timestamp;
        if let Some(min) = cause.restart_timestamp() {
            ts.forward(min);
        }
        ts.forward(self.record.read().meta.timestamp);

        self.meta.epoch += 1;
        self.meta.timestamp = ts;
        self.max_write_ts = Timestamp::ZERO;

        let meta = self.meta;
        self.record.update(|record| {
            record.meta.epoch = meta.epoch;
            record.meta.timestamp.forward(meta.timestamp);
        });
        debug!(
            txn = %meta.id,
            epoch = meta.epoch,
            ts = %meta.timestamp,
            cause = %cause,
            "restarting transaction"
        );
    }

    /// Starts the next epoch under a fresh record after the current one
    /// was aborted by another transaction.
    fn restart_aborted(&mut self, cause: &MeridianError) {
        let old = self.meta;
        self.cleanup(old);

        let mut ts = self.store.clock().now();
        ts.forward(old.timestamp);
        self.meta = TxnMeta {
            id: self.store.next_txn_id(),
            epoch: old.epoch + 1,
            priority: old.priority.max(Priority::random()),
            timestamp: ts,
        };
        self.record = self
            .store
            .registry()
            .begin(self.meta, self.store.clock().physical_now());
        self.max_write_ts = Timestamp::ZERO;
        debug!(
            old_txn = %old.id,
            txn = %self.meta.id,
            epoch = self.meta.epoch,
            ts = %ts,
            cause = %cause,
            "restarting aborted transaction"
        );
    }

    /// Marks the record aborted and discards its intents.
    fn abort(&mut self) {
        self.record.update(|record| {
            if record.status == TxnStatus::Pending {
                record.status = TxnStatus::Aborted;
            }
        });
        debug!(txn = %self.meta.id, epoch = self.meta.epoch, "aborted transaction");
        self.cleanup(self.meta);
    }

    /// Best-effort removal of the intents `meta` may hold.
    fn cleanup(&mut self, meta: TxnMeta) {
        if let Err(err) = self.resolve_written(meta, TxnStatus::Aborted) {
            warn!(txn = %meta.id, error = %err, "failed to clean up intents");
        }
        self.written.clear();
    }

    /// Resolves every intent this record may hold. Keeps going past
    /// failures and returns the first one.
    fn resolve_written(&self, meta: TxnMeta, status: TxnStatus) -> MeridianResult<()> {
        let mut first_err = None;
        for key in &self.written {
            let request = Request::new(Command::resolve_intent(key.clone(), meta, status));
            if let Err(err) = self.store.execute(request) {
                warn!(txn = %meta.id, key = %key, status = %status, error = %err, "failed to resolve intent");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Runs transaction bodies against a store, retrying on conflicts.
#[derive(Debug)]
pub struct TxnCoordinator {
    store: Arc<Store>,
    stats: TxnStats,
}

impl TxnCoordinator {
    /// Creates a coordinator over `store`.
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            stats: TxnStats::new(),
        }
    }

    /// Returns the store.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Returns coordinator statistics.
    pub fn stats(&self) -> &TxnStats {
        &self.stats
    }

    /// Runs `body` as a transaction and commits it.
    ///
    /// `body` may run several times, once per epoch; effects of every
    /// epoch but the committed one are discarded. If it returns `Ok`
    /// without committing, the transaction is committed on its behalf.
    ///
    /// # Errors
    ///
    /// - `TransactionAborted` once the restart bound is reached
    /// - any non-retryable error from `body` or the commit, after the
    ///   transaction has been aborted
    /// - errors resolving intents after a successful commit
    pub fn run<T, F>(&self, opts: &TxnOptions, mut body: F) -> MeridianResult<T>
    where
        F: FnMut(&mut Txn<'_>) -> MeridianResult<T>,
    {
        let config = &self.store.config().txn;
        let max_retries = opts.max_retries.unwrap_or(config.max_retries);
        let priority = opts
            .user_priority
            .or(config.user_priority.map(Priority::new))
            .unwrap_or_else(Priority::random);
        let deadline = opts.timeout.map(|timeout| Instant::now() + timeout);

        let mut txn = Txn::begin(&self.store, priority, deadline, opts.cancel.clone());
        self.stats.started.fetch_add(1, AtomicOrdering::Relaxed);

        loop {
            let result = body(&mut txn).and_then(|value| {
                txn.commit()?;
                Ok(value)
            });
            let err = match result {
                Ok(value) => {
                    self.stats.committed.fetch_add(1, AtomicOrdering::Relaxed);
                    return Ok(value);
                }
                Err(err) => err,
            };

            if txn.committed {
                self.stats.committed.fetch_add(1, AtomicOrdering::Relaxed);
                return Err(err);
            }

            let aborted = txn.is_aborted();
            if !aborted && !err.is_retryable() {
                txn.abort();
                self.stats.aborted.fetch_add(1, AtomicOrdering::Relaxed);
                return Err(err);
            }

            if txn.epoch() >= max_retries {
                warn!(
                    txn = %txn.id(),
                    epoch = txn.epoch(),
                    error = %err,
                    "transaction retries exhausted"
                );
                txn.abort();
                self.stats.aborted.fetch_add(1, AtomicOrdering::Relaxed);
                return Err(MeridianError::aborted(
                    txn.id(),
                    format!("retries exhausted after {max_retries} restarts: {err}"),
                ));
            }

            if aborted {
                txn.restart_aborted(&err);
            } else {
                txn.restart(&err);
            }
            self.stats.restarts.fetch_add(1, AtomicOrdering::Relaxed);
        }
    }
}
