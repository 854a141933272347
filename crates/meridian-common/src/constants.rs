//! System-wide constants for Meridian.
//!
//! Defaults used by the configuration structures and the components that
//! fall back to them when no explicit configuration is given.

// =============================================================================
// Clock Constants
// =============================================================================

/// Default maximum clock offset between nodes, in milliseconds.
///
/// A directly submitted command whose timestamp is further ahead of the
/// local physical clock than this is rejected.
pub const DEFAULT_MAX_OFFSET_MS: u64 = 250;

/// Nanoseconds per millisecond.
pub const NANOS_PER_MILLI: u64 = 1_000_000;

// =============================================================================
// Key and Value Limits
// =============================================================================

/// Maximum key size in bytes (16 KB).
pub const MAX_KEY_SIZE: usize = 16 * 1024;

/// Maximum value size in bytes (1 MB).
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

// =============================================================================
// Timestamp Cache Constants
// =============================================================================

/// Default window during which timestamp cache entries are retained (10 s).
pub const DEFAULT_TSCACHE_WINDOW_MS: u64 = 10_000;

/// Default bound on the number of timestamp cache entries.
pub const DEFAULT_TSCACHE_MAX_ENTRIES: usize = 64 * 1024;

// =============================================================================
// Transaction Constants
// =============================================================================

/// Default bound on client-visible transaction restarts.
pub const DEFAULT_MAX_TXN_RETRIES: u32 = 16;

/// Default age after which a silent transaction may be aborted by any pusher.
pub const DEFAULT_TXN_EXPIRATION_MS: u64 = 10_000;

/// Default interval at which blocked operations re-check an intent owner.
pub const DEFAULT_WAIT_TICK_MS: u64 = 10;

/// Number of times the gate re-runs a command after resolving intents
/// before surfacing the conflict to the caller.
pub const MAX_INTENT_RESOLUTION_ATTEMPTS: u32 = 64;
