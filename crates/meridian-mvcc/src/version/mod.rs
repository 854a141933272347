//! Versioned key storage with write intents.
//!
//! Every key holds an ordered history of committed versions plus at most
//! one provisional intent owned by a transaction. Deletes are stored as
//! tombstone versions so older readers still see the prior value.
//!
//! # Key History Structure
//!
//! ```text
//! Key: "a"
//! ┌──────────────────────────────────────────────┐
//! │ Intent (txn 0x7, epoch 1, ts 200.0,1)        │
//! │ value: "upd"                                 │
//! ├──────────────────────────────────────────────┤
//! │ Version ts 150.0,0   value: <tombstone>      │
//! │ Version ts 100.0,0   value: "init"           │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The store itself performs no conflict resolution: it reports foreign
//! intents in a `WriteIntent` error and leaves it to the caller to push or
//! abort their owners and retry.

use std::collections::BTreeMap;
use std::ops::Bound;

use meridian_common::{
    Intent, Key, MeridianError, MeridianResult, Timestamp, TxnMeta, TxnStatus, Value,
};
use parking_lot::RwLock;
use tracing::trace;

/// A committed version. A `None` value is a deletion tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Commit timestamp.
    pub timestamp: Timestamp,
    /// The value, or `None` for a tombstone.
    pub value: Option<Value>,
}

/// A provisional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteIntent {
    /// Owner metadata. `txn.timestamp` is the intent's timestamp, which
    /// may be ahead of the owner's transaction timestamp.
    pub txn: TxnMeta,
    /// The provisional value, or `None` for a provisional delete.
    pub value: Option<Value>,
}

/// The full state of one key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyHistory {
    /// Committed versions, oldest first.
    pub versions: Vec<Version>,
    /// Outstanding intent, if any.
    pub intent: Option<WriteIntent>,
}

impl KeyHistory {
    /// Latest committed version at or below `ts`.
    fn visible_at(&self, ts: Timestamp) -> Option<&Version> {
        self.versions.iter().rev().find(|v| v.timestamp <= ts)
    }

    fn latest(&self) -> Option<&Version> {
        self.versions.last()
    }

    fn insert_version(&mut self, version: Version) {
        match self
            .versions
            .binary_search_by(|v| v.timestamp.cmp(&version.timestamp))
        {
            Ok(pos) => self.versions[pos] = version,
            Err(pos) => self.versions.insert(pos, version),
        }
    }

    fn is_empty(&self) -> bool {
        self.versions.is_empty() && self.intent.is_none()
    }
}

/// The result of a put that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The value was written at this timestamp.
    Written {
        /// Timestamp of the new version or intent.
        timestamp: Timestamp,
    },
    /// The writer's own intent already sits above the put's timestamp, so
    /// the put changed nothing. The writer still sees success.
    Ignored {
        /// Timestamp of the intent that shadowed the put.
        intent_ts: Timestamp,
    },
}

/// Outcome of a read against one key.
enum ReadOutcome<'a> {
    Value(Option<&'a Value>),
    Conflict(Intent),
}

/// Multi-version storage for one range.
///
/// Keys are kept ordered so scans are range reads. Mutation is expected
/// to be serialized by the caller; the internal lock only protects the
/// map itself.
#[derive(Debug, Default)]
pub struct VersionStore {
    keys: RwLock<BTreeMap<Key, KeyHistory>>,
}

impl VersionStore {
    /// Creates a new empty version store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of keys with any history.
    pub fn key_count(&self) -> usize {
        self.keys.read().len()
    }

    /// Returns the number of outstanding intents.
    pub fn intent_count(&self) -> usize {
        self.keys
            .read()
            .values()
            .filter(|h| h.intent.is_some())
            .count()
    }

    /// Returns the intent at `key`, if any.
    pub fn intent(&self, key: &Key) -> Option<WriteIntent> {
        self.keys.read().get(key).and_then(|h| h.intent.clone())
    }

    /// Returns the timestamp of the latest committed version of `key`.
    pub fn latest_timestamp(&self, key: &Key) -> Option<Timestamp> {
        self.keys
            .read()
            .get(key)
            .and_then(|h| h.latest().map(|v| v.timestamp))
    }

    /// Reads `key` as of `read_ts`.
    ///
    /// A reader sees its own intent when the epochs match, whatever the
    /// timestamps; intents from its earlier epochs are invisible. Foreign
    /// intents above `read_ts` are invisible too.
    ///
    /// # Errors
    ///
    /// Returns `WriteIntent` if a foreign intent at or below `read_ts` is
    /// in the way.
    pub fn get(
        &self,
        key: &Key,
        read_ts: Timestamp,
        txn: Option<&TxnMeta>,
    ) -> MeridianResult<Option<Value>> {
        let keys = self.keys.read();
        let Some(history) = keys.get(key) else {
            return Ok(None);
        };
        match Self::read_history(key, history, read_ts, txn)? {
            ReadOutcome::Value(value) => Ok(value.cloned()),
            ReadOutcome::Conflict(intent) => Err(MeridianError::WriteIntent {
                intents: vec![intent],
            }),
        }
    }

    /// Reads every live key in `[start, end)` as of `read_ts`, in key
    /// order. `max_results` of zero means unlimited.
    ///
    /// # Errors
    ///
    /// Returns `WriteIntent` listing every conflicting intent met before
    /// the result limit was reached.
    pub fn scan(
        &self,
        start: &Key,
        end: &Key,
        read_ts: Timestamp,
        max_results: usize,
        txn: Option<&TxnMeta>,
    ) -> MeridianResult<Vec<(Key, Value)>> {
        if end <= start {
            return Ok(Vec::new());
        }

        let keys = self.keys.read();
        let mut rows = Vec::new();
        let mut conflicts = Vec::new();

        let span = keys.range::<Key, _>((Bound::Included(start), Bound::Excluded(end)));
        for (key, history) in span {
            if max_results > 0 && rows.len() >= max_results {
                break;
            }
            match Self::read_history(key, history, read_ts, txn)? {
                ReadOutcome::Value(Some(value)) => rows.push((key.clone(), value.clone())),
                ReadOutcome::Value(None) => {}
                ReadOutcome::Conflict(intent) => conflicts.push(intent),
            }
        }

        if conflicts.is_empty() {
            Ok(rows)
        } else {
            Err(MeridianError::WriteIntent { intents: conflicts })
        }
    }

    fn read_history<'a>(
        key: &Key,
        history: &'a KeyHistory,
        read_ts: Timestamp,
        txn: Option<&TxnMeta>,
    ) -> MeridianResult<ReadOutcome<'a>> {
        if let Some(intent) = &history.intent {
            match txn {
                Some(meta) if meta.id == intent.txn.id => {
                    if meta.epoch < intent.txn.epoch {
                        return Err(MeridianError::InvalidTransactionState {
                            txn_id: meta.id,
                            current: format!("epoch {}", meta.epoch),
                            expected: "epoch at or above its intent's epoch",
                        });
                    }
                    if meta.epoch == intent.txn.epoch {
                        return Ok(ReadOutcome::Value(intent.value.as_ref()));
                    }
                }
                _ if intent.txn.timestamp <= read_ts => {
                    return Ok(ReadOutcome::Conflict(Intent::new(key.clone(), intent.txn)));
                }
                _ => {}
            }
        }
        Ok(ReadOutcome::Value(
            history.visible_at(read_ts).and_then(|v| v.value.as_ref()),
        ))
    }

    /// Writes `value` (or a tombstone, for `None`) at `ts`.
    ///
    /// With `txn` set the write becomes (or replaces) that transaction's
    /// intent; otherwise it is committed directly. A transactional write
    /// below the transaction's existing intent is ignored and reported as
    /// [`PutOutcome::Ignored`].
    ///
    /// # Errors
    ///
    /// - `WriteIntent` if another transaction holds an intent on the key
    /// - `WriteTooOld` if a committed version at or above `ts` exists
    /// - `InvalidTransactionState` if the writer's epoch is older than
    ///   its own intent's
    pub fn put(
        &self,
        key: &Key,
        value: Option<Value>,
        ts: Timestamp,
        txn: Option<&TxnMeta>,
    ) -> MeridianResult<PutOutcome> {
        let mut keys = self.keys.write();
        let history = keys.entry(key.clone()).or_default();

        if let Some(intent) = &history.intent {
            let own = txn.filter(|meta| meta.id == intent.txn.id);
            let Some(meta) = own else {
                return Err(MeridianError::WriteIntent {
                    intents: vec![Intent::new(key.clone(), intent.txn)],
                });
            };
            if meta.epoch < intent.txn.epoch {
                return Err(MeridianError::InvalidTransactionState {
                    txn_id: meta.id,
                    current: format!("epoch {}", meta.epoch),
                    expected: "epoch at or above its intent's epoch",
                });
            }
            if ts < intent.txn.timestamp {
                trace!(
                    key = %key,
                    ts = %ts,
                    intent_ts = %intent.txn.timestamp,
                    "put below own intent ignored"
                );
                return Ok(PutOutcome::Ignored {
                    intent_ts: intent.txn.timestamp,
                });
            }
        } else if let Some(latest) = history.latest() {
            if latest.timestamp >= ts {
                return Err(MeridianError::WriteTooOld {
                    key: key.clone(),
                    timestamp: ts,
                    actual: latest.timestamp.next(),
                });
            }
        }

        match txn {
            Some(meta) => {
                history.intent = Some(WriteIntent {
                    txn: TxnMeta {
                        timestamp: ts,
                        ..*meta
                    },
                    value,
                });
            }
            None => history.insert_version(Version {
                timestamp: ts,
                value,
            }),
        }
        Ok(PutOutcome::Written { timestamp: ts })
    }

    /// Resolves the intent `meta.id` holds on `key`.
    ///
    /// - `Committed`: the intent becomes a version at `meta.timestamp`,
    ///   unless it was written in an earlier epoch than `meta.epoch`, in
    ///   which case it is discarded
    /// - `Pending`: the intent's timestamp is pushed to `meta.timestamp`
    /// - `Aborted`: the intent is discarded, unless it was written in a
    ///   later epoch than `meta.epoch`
    ///
    /// Returns true if an intent owned by `meta.id` was found. Resolving a
    /// missing or foreign intent is a no-op.
    pub fn resolve_intent(&self, key: &Key, meta: &TxnMeta, status: TxnStatus) -> bool {
        let mut keys = self.keys.write();
        let Some(history) = keys.get_mut(key) else {
            return false;
        };
        let owned = history
            .intent
            .as_ref()
            .is_some_and(|intent| intent.txn.id == meta.id);
        if !owned {
            return false;
        }

        match status {
            TxnStatus::Pending => {
                if let Some(intent) = history.intent.as_mut() {
                    intent.txn.timestamp.forward(meta.timestamp);
                }
            }
            TxnStatus::Committed => {
                if let Some(intent) = history.intent.take() {
                    if intent.txn.epoch == meta.epoch {
                        let mut commit_ts = meta.timestamp;
                        commit_ts.forward(intent.txn.timestamp);
                        history.insert_version(Version {
                            timestamp: commit_ts,
                            value: intent.value,
                        });
                    }
                }
            }
            TxnStatus::Aborted => {
                if history
                    .intent
                    .as_ref()
                    .is_some_and(|intent| intent.txn.epoch <= meta.epoch)
                {
                    history.intent = None;
                }
            }
        }

        if history.is_empty() {
            keys.remove(key);
        }
        trace!(key = %key, txn = %meta.id, status = %status, "resolved intent");
        true
    }

    /// Returns a copy of every key's history, in key order.
    pub fn snapshot(&self) -> BTreeMap<Key, KeyHistory> {
        self.keys.read().clone()
    }
}
