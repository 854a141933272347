//! Command execution.
//!
//! A [`Request`] pairs a [`RequestHeader`] (timestamp, transaction, and
//! how long the caller is willing to wait) with one [`Command`]. The
//! [`CommandGate`] applies it to a replica:
//!
//! 1. consult the optional [`CommandFilter`]
//! 2. under the replica's apply lock, push writes above the timestamp
//!    cache, run the command against the versioned store, and record the
//!    access in the cache
//! 3. on conflicting intents, release the lock, push or wait out every
//!    owner, then resolve all the intents at once and go back to 1
//!
//! A request that gives up while waiting leaves the store untouched,
//! though owners it already pushed stay pushed in their records. Every
//! resolution applied is reported in [`Applied::resolved`] so replicas
//! can replay it; a replayed command never pushes anyone itself.
//!
//! Clock admission happens one level up, in the store.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use meridian_common::config::StoreConfig;
use meridian_common::{
    Intent, Key, MeridianError, MeridianResult, Priority, Timestamp, TxnMeta, TxnStatus, Value,
    MAX_INTENT_RESOLUTION_ATTEMPTS,
};
use meridian_mvcc::PutOutcome;
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::resolver::{IntentResolver, PushKind, Pusher};
use crate::store::Replica;

/// The commands a replica can apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Read one key.
    Get {
        /// Key to read.
        key: Key,
    },
    /// Write one key.
    Put {
        /// Key to write.
        key: Key,
        /// New value.
        value: Value,
    },
    /// Write a tombstone.
    Delete {
        /// Key to delete.
        key: Key,
    },
    /// Read the live keys in `[start, end)`.
    Scan {
        /// First key, inclusive.
        start: Key,
        /// Last key, exclusive.
        end: Key,
        /// Maximum rows returned; zero means unlimited.
        max_results: usize,
    },
    /// Add `delta` to an integer value; a missing key counts as zero.
    Increment {
        /// Key holding the counter.
        key: Key,
        /// Amount to add.
        delta: i64,
    },
    /// Write `value` only if the current value equals `expected`.
    ConditionalPut {
        /// Key to write.
        key: Key,
        /// New value.
        value: Value,
        /// Required current value; `None` requires the key to be absent.
        expected: Option<Value>,
    },
    /// Finalize or push an intent on behalf of its owner.
    ResolveIntent {
        /// Key holding the intent.
        key: Key,
        /// Owner metadata to resolve with.
        txn: TxnMeta,
        /// Owner status.
        status: TxnStatus,
    },
}

impl Command {
    /// Creates a `Get`.
    pub fn get(key: impl Into<Key>) -> Self {
        Self::Get { key: key.into() }
    }

    /// Creates a `Put`.
    pub fn put(key: impl Into<Key>, value: impl Into<Value>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Creates a `Delete`.
    pub fn delete(key: impl Into<Key>) -> Self {
        Self::Delete { key: key.into() }
    }

    /// Creates a `Scan`.
    pub fn scan(start: impl Into<Key>, end: impl Into<Key>, max_results: usize) -> Self {
        Self::Scan {
            start: start.into(),
            end: end.into(),
            max_results,
        }
    }

    /// Creates an `Increment`.
    pub fn increment(key: impl Into<Key>, delta: i64) -> Self {
        Self::Increment {
            key: key.into(),
            delta,
        }
    }

    /// Creates a `ConditionalPut`.
    pub fn conditional_put(
        key: impl Into<Key>,
        value: impl Into<Value>,
        expected: Option<Value>,
    ) -> Self {
        Self::ConditionalPut {
            key: key.into(),
            value: value.into(),
            expected,
        }
    }

    /// Creates a `ResolveIntent`.
    pub fn resolve_intent(key: impl Into<Key>, txn: TxnMeta, status: TxnStatus) -> Self {
        Self::ResolveIntent {
            key: key.into(),
            txn,
            status,
        }
    }

    /// The key used to route this command.
    pub fn key(&self) -> &Key {
        match self {
            Self::Get { key }
            | Self::Put { key, .. }
            | Self::Delete { key }
            | Self::Increment { key, .. }
            | Self::ConditionalPut { key, .. }
            | Self::ResolveIntent { key, .. } => key,
            Self::Scan { start, .. } => start,
        }
    }

    /// True for commands that only read.
    pub fn is_read(&self) -> bool {
        matches!(self, Self::Get { .. } | Self::Scan { .. })
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Get { .. } => "get",
            Self::Put { .. } => "put",
            Self::Delete { .. } => "delete",
            Self::Scan { .. } => "scan",
            Self::Increment { .. } => "increment",
            Self::ConditionalPut { .. } => "cput",
            Self::ResolveIntent { .. } => "resolve",
        }
    }
}

/// A cancellation flag shared between a caller and a blocked request.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates an untriggered token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Triggers the token.
    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::Release);
    }

    /// Returns true once triggered.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::Acquire)
    }
}

/// Per-request metadata.
#[derive(Debug, Clone, Default)]
pub struct RequestHeader {
    /// Requested timestamp. Zero asks the store to assign one.
    pub timestamp: Timestamp,
    /// The issuing transaction, if any.
    pub txn: Option<TxnMeta>,
    /// Priority for non-transactional requests. Random when unset.
    pub user_priority: Option<Priority>,
    /// Give up waiting on intents after this instant.
    pub deadline: Option<Instant>,
    /// Give up waiting on intents once triggered.
    pub cancel: Option<CancelToken>,
}

/// A command with its header.
#[derive(Debug, Clone)]
pub struct Request {
    /// Request metadata.
    pub header: RequestHeader,
    /// The command.
    pub command: Command,
}

impl Request {
    /// Creates a non-transactional request with an unassigned timestamp.
    pub fn new(command: Command) -> Self {
        Self {
            header: RequestHeader::default(),
            command,
        }
    }

    /// Sets the timestamp.
    #[must_use]
    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.header.timestamp = timestamp;
        self
    }

    /// Issues the request inside `txn`, at the transaction's timestamp.
    #[must_use]
    pub fn with_txn(mut self, txn: TxnMeta) -> Self {
        self.header.timestamp = txn.timestamp;
        self.header.txn = Some(txn);
        self
    }

    /// Sets the user priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.header.user_priority = Some(priority);
        self
    }

    /// Sets the wait deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.header.deadline = Some(deadline);
        self
    }

    /// Sets the cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.header.cancel = Some(cancel);
        self
    }

    /// The key used to route this request.
    pub fn key(&self) -> &Key {
        self.command.key()
    }

    /// The priority this request pushes with.
    fn push_priority(&self) -> Priority {
        self.header
            .txn
            .map(|t| t.priority)
            .or(self.header.user_priority)
            .unwrap_or_else(Priority::random)
    }
}

/// Command-specific reply payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    /// Result of a `Get`.
    Value(Option<Value>),
    /// Result of a `Scan`.
    Rows(Vec<(Key, Value)>),
    /// Result of a `Put`, `Delete` or `ConditionalPut`.
    Written(PutOutcome),
    /// New value after an `Increment`.
    Integer(i64),
    /// Whether a `ResolveIntent` found the intent.
    Resolved(bool),
}

/// The reply to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Timestamp the command took effect at. For writes this may be above
    /// the requested timestamp if the timestamp cache pushed it.
    pub timestamp: Timestamp,
    /// Payload.
    pub body: ResponseBody,
}

impl Response {
    /// Creates a response.
    pub fn new(timestamp: Timestamp, body: ResponseBody) -> Self {
        Self { timestamp, body }
    }

    /// Extracts a `Get` result.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if this is not a `Get` response.
    pub fn into_value(self) -> MeridianResult<Option<Value>> {
        match self.body {
            ResponseBody::Value(value) => Ok(value),
            other => Err(unexpected_body("value", &other)),
        }
    }

    /// Extracts a `Scan` result.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if this is not a `Scan` response.
    pub fn into_rows(self) -> MeridianResult<Vec<(Key, Value)>> {
        match self.body {
            ResponseBody::Rows(rows) => Ok(rows),
            other => Err(unexpected_body("rows", &other)),
        }
    }

    /// Extracts an `Increment` result.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if this is not an `Increment` response.
    pub fn into_integer(self) -> MeridianResult<i64> {
        match self.body {
            ResponseBody::Integer(n) => Ok(n),
            other => Err(unexpected_body("integer", &other)),
        }
    }
}

fn unexpected_body(wanted: &str, got: &ResponseBody) -> MeridianError {
    MeridianError::internal(format!("expected {wanted} response, got {got:?}"))
}

/// An intent resolution performed while applying a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIntent {
    /// Key holding the intent.
    pub key: Key,
    /// The owner's record as of the decision.
    pub owner: TxnMeta,
    /// Status the intent was resolved with.
    pub status: TxnStatus,
}

impl ResolvedIntent {
    /// The command that replays this resolution.
    pub fn to_command(&self) -> Command {
        Command::resolve_intent(self.key.clone(), self.owner, self.status)
    }
}

/// A command's result together with the intent resolutions applied on
/// its way. The resolutions stand even when the command failed, so a
/// replica must replay them in order before (or instead of) the command.
#[derive(Debug)]
pub struct Applied {
    /// Resolutions, in the order they were applied.
    pub resolved: Vec<ResolvedIntent>,
    /// The command's own result.
    pub result: MeridianResult<Response>,
}

impl Applied {
    pub(crate) fn failed(err: MeridianError) -> Self {
        Self {
            resolved: Vec::new(),
            result: Err(err),
        }
    }
}

/// What a [`CommandFilter`] wants done with a request.
#[derive(Debug, Clone)]
pub enum FilterAction {
    /// Apply the command normally.
    Proceed,
    /// Fail the request with this error without applying it.
    Fail(MeridianError),
    /// Answer with this response without applying the command.
    Reply(Response),
}

/// Interception point consulted before every apply attempt.
///
/// Tests use it to inject failures at exact points in a race, e.g. failing
/// a read on the attempt right after its intent conflict was resolved.
/// Closures `Fn(&Request) -> FilterAction` implement it.
pub trait CommandFilter: Send + Sync {
    /// Inspects a request about to be applied.
    fn filter(&self, request: &Request) -> FilterAction;
}

impl<F> CommandFilter for F
where
    F: Fn(&Request) -> FilterAction + Send + Sync,
{
    fn filter(&self, request: &Request) -> FilterAction {
        self(request)
    }
}

/// Whether a command is being admitted or replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ApplyMode {
    /// First application at the node that admitted it. Writes are pushed
    /// above the timestamp cache.
    Leader,
    /// Replay of an admitted command. Writes land exactly at the command
    /// timestamp and intent owners are never pushed.
    Replicated,
}

/// Applies commands to replicas.
pub struct CommandGate {
    resolver: IntentResolver,
    filter: RwLock<Option<Arc<dyn CommandFilter>>>,
    limits: StoreConfig,
}

impl fmt::Debug for CommandGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandGate")
            .field("resolver", &self.resolver)
            .field("filter", &self.filter.read().is_some())
            .field("limits", &self.limits)
            .finish()
    }
}

impl CommandGate {
    /// Creates a gate resolving conflicts with `resolver`.
    pub fn new(resolver: IntentResolver, limits: StoreConfig) -> Self {
        Self {
            resolver,
            filter: RwLock::new(None),
            limits,
        }
    }

    /// Returns the intent resolver.
    pub fn resolver(&self) -> &IntentResolver {
        &self.resolver
    }

    /// Installs or removes the command filter.
    pub fn set_filter(&self, filter: Option<Arc<dyn CommandFilter>>) {
        *self.filter.write() = filter;
    }

    /// Applies `request` to `replica`. As leader, conflicting intents are
    /// resolved as they come up; a replayed command fails with
    /// `WriteIntent` instead.
    pub(crate) fn apply(&self, replica: &Replica, request: &Request, mode: ApplyMode) -> Applied {
        let mut resolved = Vec::new();
        let result = self.apply_resolving(replica, request, mode, &mut resolved);
        Applied { resolved, result }
    }

    fn apply_resolving(
        &self,
        replica: &Replica,
        request: &Request,
        mode: ApplyMode,
        resolved: &mut Vec<ResolvedIntent>,
    ) -> MeridianResult<Response> {
        self.validate(&request.command)?;
        let priority = request.push_priority();

        for attempt in 1..=MAX_INTENT_RESOLUTION_ATTEMPTS {
            let filter = self.filter.read().clone();
            if let Some(filter) = filter {
                match filter.filter(request) {
                    FilterAction::Proceed => {}
                    FilterAction::Fail(err) => {
                        debug!(
                            command = request.command.name(),
                            key = %request.key(),
                            attempt,
                            error = %err,
                            "command filter failed request"
                        );
                        return Err(err);
                    }
                    FilterAction::Reply(response) => {
                        debug!(
                            command = request.command.name(),
                            key = %request.key(),
                            attempt,
                            "command filter answered request"
                        );
                        return Ok(response);
                    }
                }
            }

            let result = {
                let _apply = replica.lock_apply();
                self.apply_once(replica, request, mode)
            };
            match result {
                Err(MeridianError::WriteIntent { intents }) if mode == ApplyMode::Leader => {
                    let outcomes = self.push_owners(request, priority, &intents)?;
                    let _apply = replica.lock_apply();
                    for resolution in outcomes {
                        replica.versions().resolve_intent(
                            &resolution.key,
                            &resolution.owner,
                            resolution.status,
                        );
                        resolved.push(resolution);
                    }
                }
                other => {
                    trace!(
                        command = request.command.name(),
                        key = %request.key(),
                        ts = %request.header.timestamp,
                        ok = other.is_ok(),
                        "applied command"
                    );
                    return other;
                }
            }
        }

        Err(MeridianError::internal(format!(
            "{} on {} still blocked by intents after {} attempts",
            request.command.name(),
            request.key(),
            MAX_INTENT_RESOLUTION_ATTEMPTS
        )))
    }

    fn validate(&self, command: &Command) -> MeridianResult<()> {
        let check_key = |key: &Key| {
            if key.len() > self.limits.max_key_size {
                Err(MeridianError::KeyTooLarge {
                    size: key.len(),
                    max_size: self.limits.max_key_size,
                })
            } else {
                Ok(())
            }
        };
        let check_value = |value: &Value| {
            if value.len() > self.limits.max_value_size {
                Err(MeridianError::ValueTooLarge {
                    size: value.len(),
                    max_size: self.limits.max_value_size,
                })
            } else {
                Ok(())
            }
        };

        check_key(command.key())?;
        match command {
            Command::Put { value, .. } => check_value(value),
            Command::ConditionalPut {
                value, expected, ..
            } => {
                check_value(value)?;
                expected.as_ref().map_or(Ok(()), check_value)
            }
            Command::Scan { end, .. } => check_key(end),
            _ => Ok(()),
        }
    }

    /// One attempt, under the apply lock.
    fn apply_once(
        &self,
        replica: &Replica,
        request: &Request,
        mode: ApplyMode,
    ) -> MeridianResult<Response> {
        let header = &request.header;
        let txn = header.txn.as_ref();
        let txn_id = txn.map(|t| t.id);
        let ts = header.timestamp;
        let versions = replica.versions();
        let tscache = replica.tscache();

        match &request.command {
            Command::Get { key } => {
                let value = versions.get(key, ts, txn)?;
                tscache.record_read(key, ts, txn_id);
                Ok(Response::new(ts, ResponseBody::Value(value)))
            }
            Command::Scan {
                start,
                end,
                max_results,
            } => {
                let rows = versions.scan(start, end, ts, *max_results, txn)?;
                tscache.record_read_span(start, end, ts, txn_id);
                Ok(Response::new(ts, ResponseBody::Rows(rows)))
            }
            Command::Put { key, value } => {
                let write_ts = Self::write_timestamp(replica, key, header, mode);
                let (ts, outcome) = Self::write(replica, key, Some(value.clone()), write_ts, header)?;
                Ok(Response::new(ts, ResponseBody::Written(outcome)))
            }
            Command::Delete { key } => {
                let write_ts = Self::write_timestamp(replica, key, header, mode);
                let (ts, outcome) = Self::write(replica, key, None, write_ts, header)?;
                Ok(Response::new(ts, ResponseBody::Written(outcome)))
            }
            Command::Increment { key, delta } => {
                let write_ts = Self::write_timestamp(replica, key, header, mode);
                let current = versions
                    .get(key, write_ts, txn)?
                    .map(|v| v.as_i64())
                    .transpose()?
                    .unwrap_or(0);
                let next = current.checked_add(*delta).ok_or_else(|| {
                    MeridianError::invalid_argument(format!(
                        "incrementing {current} by {delta} overflows at key {key}"
                    ))
                })?;
                let (ts, outcome) =
                    Self::write(replica, key, Some(Value::from_i64(next)), write_ts, header)?;
                // An ignored write leaves the value the caller reads back unchanged.
                let value = match outcome {
                    PutOutcome::Written { .. } => next,
                    PutOutcome::Ignored { .. } => current,
                };
                Ok(Response::new(ts, ResponseBody::Integer(value)))
            }
            Command::ConditionalPut {
                key,
                value,
                expected,
            } => {
                let write_ts = Self::write_timestamp(replica, key, header, mode);
                let actual = versions.get(key, write_ts, txn)?;
                if actual != *expected {
                    return Err(MeridianError::ConditionFailed {
                        key: key.clone(),
                        actual,
                    });
                }
                let (ts, outcome) = Self::write(replica, key, Some(value.clone()), write_ts, header)?;
                Ok(Response::new(ts, ResponseBody::Written(outcome)))
            }
            Command::ResolveIntent { key, txn, status } => {
                let found = versions.resolve_intent(key, txn, *status);
                Ok(Response::new(ts, ResponseBody::Resolved(found)))
            }
        }
    }

    /// The timestamp a write must use: the requested one, pushed above
    /// the timestamp cache unless replaying.
    fn write_timestamp(
        replica: &Replica,
        key: &Key,
        header: &RequestHeader,
        mode: ApplyMode,
    ) -> Timestamp {
        let mut ts = header.timestamp;
        if mode == ApplyMode::Leader {
            let writer = header.txn.map(|t| t.id);
            if let Some(min) = replica.tscache().min_write_ts(key, writer) {
                if ts.forward(min) {
                    trace!(key = %key, from = %header.timestamp, to = %ts, "write pushed by timestamp cache");
                }
            }
        }
        ts
    }

    /// Writes at `write_ts` and records the write. Returns the timestamp
    /// to report: the write's, or the requested one if it was ignored.
    fn write(
        replica: &Replica,
        key: &Key,
        value: Option<Value>,
        write_ts: Timestamp,
        header: &RequestHeader,
    ) -> MeridianResult<(Timestamp, PutOutcome)> {
        let txn = header.txn.as_ref();
        let outcome = replica.versions().put(key, value, write_ts, txn)?;
        let reported = match outcome {
            PutOutcome::Written { timestamp } => {
                replica
                    .tscache()
                    .record_write(key, timestamp, txn.map(|t| t.id));
                timestamp
            }
            PutOutcome::Ignored { .. } => header.timestamp,
        };
        Ok((reported, outcome))
    }

    /// Pushes or waits out the owners of `intents`, returning how each
    /// intent must be resolved. Nothing is resolved here, so a pusher
    /// giving up on a later intent leaves earlier ones in place.
    fn push_owners(
        &self,
        request: &Request,
        priority: Priority,
        intents: &[Intent],
    ) -> MeridianResult<Vec<ResolvedIntent>> {
        let header = &request.header;
        let kind = if request.command.is_read() {
            PushKind::Timestamp(header.timestamp.next())
        } else {
            PushKind::Abort
        };
        let pusher = Pusher {
            txn: header.txn.as_ref(),
            priority,
            deadline: header.deadline,
            cancel: header.cancel.as_ref(),
        };

        intents
            .iter()
            .map(|intent| {
                let outcome = self.resolver.push(intent, &pusher, kind)?;
                Ok(ResolvedIntent {
                    key: intent.key.clone(),
                    owner: outcome.owner,
                    status: outcome.status,
                })
            })
            .collect()
    }
}
