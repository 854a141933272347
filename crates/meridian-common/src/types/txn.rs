//! Transaction metadata carried by requests and intents.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Key, Priority, Timestamp, TxnId};

/// The status of a transaction record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnStatus {
    /// The transaction is in progress; its intents are provisional.
    Pending,
    /// The transaction committed; its intents become permanent versions.
    Committed,
    /// The transaction aborted; its intents are discarded.
    Aborted,
}

impl TxnStatus {
    /// Returns true if the status is terminal.
    #[inline]
    #[must_use]
    pub const fn is_finalized(&self) -> bool {
        matches!(self, TxnStatus::Committed | TxnStatus::Aborted)
    }
}

impl fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnStatus::Pending => write!(f, "PENDING"),
            TxnStatus::Committed => write!(f, "COMMITTED"),
            TxnStatus::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Identity and ordering information of a transaction at one epoch.
///
/// Attached to every request issued inside a transaction and stored on
/// every intent that request leaves behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnMeta {
    /// Transaction ID.
    pub id: TxnId,
    /// Retry epoch; increments on every client-visible restart.
    pub epoch: u32,
    /// Conflict priority, fixed at creation.
    pub priority: Priority,
    /// Provisional commit timestamp. Only ever moves forward.
    pub timestamp: Timestamp,
}

impl TxnMeta {
    /// Creates metadata for a new transaction at epoch zero.
    #[must_use]
    pub const fn new(id: TxnId, priority: Priority, timestamp: Timestamp) -> Self {
        Self {
            id,
            epoch: 0,
            priority,
            timestamp,
        }
    }
}

impl fmt::Display for TxnMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "txn {} epoch={} pri={} ts={}",
            self.id, self.epoch, self.priority, self.timestamp
        )
    }
}

/// A provisional write encountered at a key, identified by its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intent {
    /// Key holding the intent.
    pub key: Key,
    /// Owner of the intent, as recorded when it was written.
    pub txn: TxnMeta,
}

impl Intent {
    /// Creates a new intent reference.
    #[must_use]
    pub const fn new(key: Key, txn: TxnMeta) -> Self {
        Self { key, txn }
    }
}
