//! Node configuration structures.
//!
//! These structures define all configurable aspects of a Meridian node.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::constants::{
    DEFAULT_MAX_OFFSET_MS, DEFAULT_MAX_TXN_RETRIES, DEFAULT_TSCACHE_MAX_ENTRIES,
    DEFAULT_TSCACHE_WINDOW_MS, DEFAULT_TXN_EXPIRATION_MS, DEFAULT_WAIT_TICK_MS, MAX_KEY_SIZE,
    MAX_VALUE_SIZE,
};
use crate::error::{MeridianError, MeridianResult};
use crate::types::NodeId;

/// Main node configuration.
///
/// # Example
///
/// ```rust
/// use meridian_common::config::NodeConfig;
/// use std::time::Duration;
///
/// let config = NodeConfig::default();
/// assert_eq!(config.clock.max_offset, Duration::from_millis(250));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Hybrid clock configuration.
    pub clock: ClockConfig,

    /// Timestamp cache configuration.
    pub tscache: TsCacheConfig,

    /// Transaction configuration.
    pub txn: TxnConfig,

    /// Store limits.
    pub store: StoreConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::new(1),
            clock: ClockConfig::default(),
            tscache: TsCacheConfig::default(),
            txn: TxnConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Creates a configuration for the given node.
    #[must_use]
    pub fn with_node_id(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    /// Creates a configuration for tests: short waits, a 100ms offset
    /// bound and no low water seeding.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            node_id: NodeId::new(1),
            clock: ClockConfig {
                max_offset: Duration::from_millis(100),
            },
            tscache: TsCacheConfig {
                seed_low_water: false,
                ..Default::default()
            },
            txn: TxnConfig {
                expiration: Duration::from_secs(2),
                wait_tick: Duration::from_millis(1),
                ..Default::default()
            },
            store: StoreConfig::default(),
        }
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` describing the first violated constraint.
    pub fn validate(&self) -> MeridianResult<()> {
        if !self.node_id.is_valid() {
            return Err(MeridianError::invalid_config("node_id must be non-zero"));
        }
        self.tscache.validate()?;
        self.txn.validate()?;
        self.store.validate()?;
        Ok(())
    }

    /// Loads configuration from a TOML file.
    ///
    /// Missing sections and fields take their default values.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> MeridianResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MeridianError::invalid_config(format!("reading {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the input is not valid configuration.
    pub fn from_toml(content: &str) -> MeridianResult<Self> {
        toml::from_str(content).map_err(|e| MeridianError::invalid_config(e.to_string()))
    }

    /// Saves configuration to a file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the file cannot be written.
    pub fn save(&self, path: &Path) -> MeridianResult<()> {
        let content = self.to_toml()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| MeridianError::invalid_config(e.to_string()))?;
        }

        std::fs::write(path, content).map_err(|e| {
            MeridianError::invalid_config(format!("writing {}: {e}", path.display()))
        })
    }

    /// Converts configuration to a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if serialization fails.
    pub fn to_toml(&self) -> MeridianResult<String> {
        toml::to_string_pretty(self).map_err(|e| MeridianError::invalid_config(e.to_string()))
    }
}

/// Hybrid clock configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Maximum tolerated offset between any two node clocks. Commands
    /// carrying timestamps further than this ahead of local physical time
    /// are rejected. Zero disables the check.
    /// Default: 250ms
    #[serde(with = "humantime_serde")]
    pub max_offset: Duration,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            max_offset: Duration::from_millis(DEFAULT_MAX_OFFSET_MS),
        }
    }
}

/// Timestamp cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TsCacheConfig {
    /// Entries older than this (relative to the newest recorded timestamp)
    /// are folded into the low water mark.
    /// Default: 10s
    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// Maximum number of retained entries before the oldest are folded
    /// into the low water mark.
    /// Default: 65536
    pub max_entries: usize,

    /// Seed the low water mark at `now + max_offset` when a replica is
    /// created, so no write can land below a read that a previous
    /// leaseholder may have served.
    /// Default: true
    pub seed_low_water: bool,
}

impl Default for TsCacheConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(DEFAULT_TSCACHE_WINDOW_MS),
            max_entries: DEFAULT_TSCACHE_MAX_ENTRIES,
            seed_low_water: true,
        }
    }
}

impl TsCacheConfig {
    /// Validates the timestamp cache settings.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for a zero window or capacity.
    pub fn validate(&self) -> MeridianResult<()> {
        if self.window.is_zero() {
            return Err(MeridianError::invalid_config("tscache.window must be non-zero"));
        }
        if self.max_entries == 0 {
            return Err(MeridianError::invalid_config(
                "tscache.max_entries must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Transaction configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxnConfig {
    /// Maximum number of epochs a transaction may run before giving up.
    /// Default: 16
    pub max_retries: u32,

    /// A pending transaction whose last heartbeat is older than this may
    /// be aborted by any conflicting pusher.
    /// Default: 10s
    #[serde(with = "humantime_serde")]
    pub expiration: Duration,

    /// How long a blocked pusher sleeps between checks of the blocking
    /// transaction, deadline and cancellation.
    /// Default: 10ms
    #[serde(with = "humantime_serde")]
    pub wait_tick: Duration,

    /// Fixed priority for new transactions. Random when unset.
    pub user_priority: Option<i32>,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_TXN_RETRIES,
            expiration: Duration::from_millis(DEFAULT_TXN_EXPIRATION_MS),
            wait_tick: Duration::from_millis(DEFAULT_WAIT_TICK_MS),
            user_priority: None,
        }
    }
}

impl TxnConfig {
    /// Validates the transaction settings.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if retries are disabled or the wait tick
    /// does not fit inside the expiration.
    pub fn validate(&self) -> MeridianResult<()> {
        if self.max_retries == 0 {
            return Err(MeridianError::invalid_config("txn.max_retries must be at least 1"));
        }
        if self.wait_tick.is_zero() {
            return Err(MeridianError::invalid_config("txn.wait_tick must be non-zero"));
        }
        if self.expiration <= self.wait_tick {
            return Err(MeridianError::invalid_config(
                "txn.expiration must be greater than txn.wait_tick",
            ));
        }
        Ok(())
    }
}

/// Store limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Maximum key size in bytes.
    /// Default: 16 KB
    pub max_key_size: usize,

    /// Maximum value size in bytes.
    /// Default: 1 MB
    pub max_value_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_key_size: MAX_KEY_SIZE,
            max_value_size: MAX_VALUE_SIZE,
        }
    }
}

impl StoreConfig {
    /// Validates the store limits.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for zero limits.
    pub fn validate(&self) -> MeridianResult<()> {
        if self.max_key_size == 0 || self.max_value_size == 0 {
            return Err(MeridianError::invalid_config(
                "store size limits must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Serde helper for Duration using humantime format.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        s.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
