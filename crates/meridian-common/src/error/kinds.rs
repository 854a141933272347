//! Error kinds.
//!
//! Conflicts that a transaction can recover from by restarting at a later
//! timestamp are *retryable*; the coordinator converts them into a new
//! epoch. Everything else is surfaced to the caller.

use std::fmt;
use thiserror::Error;

use crate::types::{Intent, Key, RangeId, Timestamp, TxnId, Value};

/// Error codes for categorizing errors.
///
/// These codes can be used for programmatic error handling and
/// are stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // General errors (0x0000 - 0x00FF)
    /// Internal error (bug).
    Internal = 0x0001,
    /// Invalid argument provided.
    InvalidArgument = 0x0003,
    /// Operation timed out.
    Timeout = 0x0004,
    /// Operation was cancelled.
    Cancelled = 0x0005,
    /// Invalid configuration.
    InvalidConfig = 0x0006,

    // Clock errors (0x0100 - 0x01FF)
    /// Request timestamp too far ahead of the local clock.
    ClockOffsetExceeded = 0x0100,

    // Storage errors (0x0200 - 0x02FF)
    /// Write below an existing version or cached read.
    WriteTooOld = 0x0200,
    /// Conflicting write intent.
    WriteIntent = 0x0201,
    /// Conditional put saw an unexpected value.
    ConditionFailed = 0x0202,
    /// Key too large.
    KeyTooLarge = 0x0205,
    /// Value too large.
    ValueTooLarge = 0x0206,

    // Transaction errors (0x0300 - 0x03FF)
    /// Transaction was aborted.
    TransactionAborted = 0x0300,
    /// Transaction timestamp was pushed.
    TransactionPushed = 0x0301,
    /// Transaction not found.
    TransactionNotFound = 0x0304,
    /// Transaction in an unexpected state.
    InvalidTransactionState = 0x0305,

    // Range errors (0x0500 - 0x05FF)
    /// Key is not hosted by the addressed store.
    KeyOutOfRange = 0x0500,
    /// Range not found.
    RangeNotFound = 0x0501,
}

impl ErrorCode {
    /// Returns the numeric code.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the error category name.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match (*self as u16) >> 8 {
            0x00 => "General",
            0x01 => "Clock",
            0x02 => "Storage",
            0x03 => "Transaction",
            0x05 => "Range",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The main error type for Meridian.
///
/// Each variant includes the context needed to decide what to do next;
/// retryable variants carry the minimum timestamp a retry must use.
#[derive(Debug, Clone, Error)]
pub enum MeridianError {
    // ==========================================================================
    // General Errors
    // ==========================================================================
    /// Internal error - this indicates a bug, or a failure injected by a
    /// command filter.
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },

    /// Invalid argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Error message.
        message: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Error message.
        message: String,
    },

    /// Deadline lapsed while blocked on intent resolution.
    #[error("operation timed out after {duration_ms}ms")]
    Timeout {
        /// How long the operation waited, in milliseconds.
        duration_ms: u64,
    },

    /// Operation was cancelled while blocked on intent resolution.
    #[error("operation was cancelled")]
    Cancelled,

    // ==========================================================================
    // Clock Errors
    // ==========================================================================
    /// The request timestamp is further ahead of local physical time than
    /// the configured maximum offset allows.
    #[error(
        "rejecting command with timestamp {timestamp}: ahead of local clock {physical_ns}ns by more than {max_offset_ms}ms"
    )]
    ClockOffsetExceeded {
        /// The rejected timestamp.
        timestamp: Timestamp,
        /// Local physical time when the command arrived.
        physical_ns: u64,
        /// Configured maximum offset.
        max_offset_ms: u64,
    },

    // ==========================================================================
    // Storage Errors
    // ==========================================================================
    /// A write was attempted below an existing committed version.
    #[error("write for key {key} at timestamp {timestamp} too old; wrote at {actual}")]
    WriteTooOld {
        /// Key being written.
        key: Key,
        /// Timestamp the write requested.
        timestamp: Timestamp,
        /// Minimum timestamp the write must use.
        actual: Timestamp,
    },

    /// Intents owned by other transactions block the operation.
    #[error("conflicting intents on {} key(s)", intents.len())]
    WriteIntent {
        /// The conflicting intents.
        intents: Vec<Intent>,
    },

    /// A conditional put found a different value than expected.
    #[error("unexpected value at key {key}: {actual:?}")]
    ConditionFailed {
        /// Key being written.
        key: Key,
        /// The value actually present.
        actual: Option<Value>,
    },

    /// Key is too large.
    #[error("key size {size} exceeds maximum {max_size}")]
    KeyTooLarge {
        /// Actual key size.
        size: usize,
        /// Maximum allowed size.
        max_size: usize,
    },

    /// Value is too large.
    #[error("value size {size} exceeds maximum {max_size}")]
    ValueTooLarge {
        /// Actual value size.
        size: usize,
        /// Maximum allowed size.
        max_size: usize,
    },

    // ==========================================================================
    // Transaction Errors
    // ==========================================================================
    /// Transaction was aborted; terminal for that transaction.
    #[error("transaction {txn_id} aborted: {reason}")]
    TransactionAborted {
        /// The aborted transaction.
        txn_id: TxnId,
        /// Reason for abort.
        reason: String,
    },

    /// The transaction's timestamp was pushed by a conflicting operation;
    /// it must restart at `pushed_ts`.
    #[error("transaction {txn_id} pushed to {pushed_ts}")]
    TransactionPushed {
        /// The pushed transaction.
        txn_id: TxnId,
        /// The timestamp the transaction was pushed to.
        pushed_ts: Timestamp,
    },

    /// Transaction not found.
    #[error("transaction {txn_id} not found")]
    TransactionNotFound {
        /// The missing transaction.
        txn_id: TxnId,
    },

    /// Transaction is not in the state the operation requires.
    #[error("transaction {txn_id} is {current}, expected {expected}")]
    InvalidTransactionState {
        /// The transaction.
        txn_id: TxnId,
        /// Its current status.
        current: String,
        /// The status the operation expected.
        expected: &'static str,
    },

    // ==========================================================================
    // Range Errors
    // ==========================================================================
    /// No hosted range contains the key.
    #[error("key {key} is not hosted by this store")]
    KeyOutOfRange {
        /// The key.
        key: Key,
    },

    /// Range not found.
    #[error("range {range_id} not found")]
    RangeNotFound {
        /// The missing range.
        range_id: RangeId,
    },
}

impl MeridianError {
    /// Returns the error code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Internal { .. } => ErrorCode::Internal,
            Self::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Self::InvalidConfig { .. } => ErrorCode::InvalidConfig,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::ClockOffsetExceeded { .. } => ErrorCode::ClockOffsetExceeded,
            Self::WriteTooOld { .. } => ErrorCode::WriteTooOld,
            Self::WriteIntent { .. } => ErrorCode::WriteIntent,
            Self::ConditionFailed { .. } => ErrorCode::ConditionFailed,
            Self::KeyTooLarge { .. } => ErrorCode::KeyTooLarge,
            Self::ValueTooLarge { .. } => ErrorCode::ValueTooLarge,
            Self::TransactionAborted { .. } => ErrorCode::TransactionAborted,
            Self::TransactionPushed { .. } => ErrorCode::TransactionPushed,
            Self::TransactionNotFound { .. } => ErrorCode::TransactionNotFound,
            Self::InvalidTransactionState { .. } => ErrorCode::InvalidTransactionState,
            Self::KeyOutOfRange { .. } => ErrorCode::KeyOutOfRange,
            Self::RangeNotFound { .. } => ErrorCode::RangeNotFound,
        }
    }

    /// Returns true if a transaction may recover from this error by
    /// restarting with a new epoch.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::WriteTooOld { .. } | Self::TransactionPushed { .. } | Self::WriteIntent { .. }
        )
    }

    /// Returns true if this error represents a conflict between
    /// transactions.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::WriteTooOld { .. }
                | Self::WriteIntent { .. }
                | Self::TransactionPushed { .. }
                | Self::TransactionAborted { .. }
        )
    }

    /// The minimum timestamp a restarted transaction must use, if the
    /// error demands one.
    #[must_use]
    pub fn restart_timestamp(&self) -> Option<Timestamp> {
        match self {
            Self::WriteTooOld { actual, .. } => Some(*actual),
            Self::TransactionPushed { pushed_ts, .. } => Some(*pushed_ts),
            Self::WriteIntent { intents } => {
                intents.iter().map(|i| i.txn.timestamp.next()).max()
            }
            _ => None,
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates a transaction aborted error.
    #[must_use]
    pub fn aborted(txn_id: TxnId, reason: impl Into<String>) -> Self {
        Self::TransactionAborted {
            txn_id,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Priority, TxnMeta};

    #[test]
    fn test_error_code() {
        let err = MeridianError::ClockOffsetExceeded {
            timestamp: Timestamp::from_millis(201),
            physical_ns: 100_000_000,
            max_offset_ms: 100,
        };
        assert_eq!(err.code(), ErrorCode::ClockOffsetExceeded);
        assert_eq!(err.code().category(), "Clock");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = MeridianError::RangeNotFound {
            range_id: RangeId::new(42),
        };
        assert_eq!(err.to_string(), "range r42 not found");
    }

    #[test]
    fn test_retryable() {
        let pushed = MeridianError::TransactionPushed {
            txn_id: TxnId::new(1),
            pushed_ts: Timestamp::new(200, 1),
        };
        assert!(pushed.is_retryable());
        assert_eq!(pushed.restart_timestamp(), Some(Timestamp::new(200, 1)));

        let aborted = MeridianError::aborted(TxnId::new(1), "lost priority");
        assert!(!aborted.is_retryable());
        assert!(aborted.is_conflict());
        assert_eq!(aborted.restart_timestamp(), None);

        assert!(!MeridianError::Cancelled.is_retryable());
    }

    #[test]
    fn test_write_intent_restart_timestamp() {
        let meta = TxnMeta::new(TxnId::new(3), Priority::new(1), Timestamp::new(50, 2));
        let err = MeridianError::WriteIntent {
            intents: vec![Intent::new(Key::from_str("a"), meta)],
        };
        assert_eq!(err.to_string(), "conflicting intents on 1 key(s)");
        assert_eq!(err.restart_timestamp(), Some(Timestamp::new(50, 3)));
    }
}
