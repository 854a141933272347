//! A node's store: the ranges it holds and the entry points for
//! admitted and replicated commands.

use std::collections::BTreeMap;
use std::sync::Arc;

use meridian_common::config::{NodeConfig, TsCacheConfig};
use meridian_common::{Key, MeridianError, MeridianResult, NodeId, RangeId, Timestamp, TxnId};
use meridian_mvcc::{HybridClock, TimestampCache, VersionStore};
use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info};

use crate::gate::{Applied, ApplyMode, Command, CommandFilter, CommandGate, Request, Response};
use crate::record::{TxnIdGenerator, TxnRegistry};
use crate::resolver::IntentResolver;

/// The key span `[start_key, end_key)` owned by one range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeDescriptor {
    /// Range identifier.
    pub range_id: RangeId,
    /// First key, inclusive.
    pub start_key: Key,
    /// Last key, exclusive. `None` is unbounded.
    pub end_key: Option<Key>,
}

impl RangeDescriptor {
    /// Creates a descriptor.
    pub fn new(range_id: RangeId, start_key: impl Into<Key>, end_key: Option<Key>) -> Self {
        Self {
            range_id,
            start_key: start_key.into(),
            end_key,
        }
    }

    /// A descriptor covering the whole key space.
    pub fn full(range_id: RangeId) -> Self {
        Self::new(range_id, Key::empty(), None)
    }

    /// Returns true if `key` falls inside the range.
    pub fn contains(&self, key: &Key) -> bool {
        *key >= self.start_key && self.end_key.as_ref().map_or(true, |end| key < end)
    }

    /// Returns true if an exclusive span end at `end` stays inside the
    /// range.
    fn covers_end(&self, end: &Key) -> bool {
        self.end_key.as_ref().map_or(true, |limit| end <= limit)
    }

    fn overlaps(&self, other: &RangeDescriptor) -> bool {
        let below = |start: &Key, end: &Option<Key>| end.as_ref().map_or(true, |e| start < e);
        below(&self.start_key, &other.end_key) && below(&other.start_key, &self.end_key)
    }
}

/// One range's data: its versioned store and timestamp cache.
///
/// Commands apply under the replica's apply lock, one at a time, so every
/// replica of a range sees the same sequence of state changes.
#[derive(Debug)]
pub struct Replica {
    desc: RangeDescriptor,
    versions: VersionStore,
    tscache: TimestampCache,
    apply_lock: Mutex<()>,
}

impl Replica {
    /// Creates an empty replica whose timestamp cache starts at
    /// `low_water`.
    pub fn new(desc: RangeDescriptor, tscache: &TsCacheConfig, low_water: Timestamp) -> Self {
        Self {
            desc,
            versions: VersionStore::new(),
            tscache: TimestampCache::new(tscache, low_water),
            apply_lock: Mutex::new(()),
        }
    }

    /// Returns the range descriptor.
    pub fn descriptor(&self) -> &RangeDescriptor {
        &self.desc
    }

    /// Returns the versioned store.
    pub fn versions(&self) -> &VersionStore {
        &self.versions
    }

    /// Returns the timestamp cache.
    pub fn tscache(&self) -> &TimestampCache {
        &self.tscache
    }

    pub(crate) fn lock_apply(&self) -> MutexGuard<'_, ()> {
        self.apply_lock.lock()
    }
}

/// A node's store.
///
/// Owns the node's replicas and transaction records, and shares the
/// node's clock with everything that needs one.
#[derive(Debug)]
pub struct Store {
    config: NodeConfig,
    clock: Arc<HybridClock>,
    registry: Arc<TxnRegistry>,
    gate: CommandGate,
    replicas: RwLock<BTreeMap<RangeId, Arc<Replica>>>,
    txn_ids: TxnIdGenerator,
}

impl Store {
    /// Creates a store with no ranges.
    ///
    /// The clock's maximum offset is set from `config`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `config` does not validate.
    pub fn new(config: NodeConfig, clock: Arc<HybridClock>) -> MeridianResult<Self> {
        config.validate()?;
        clock.set_max_offset(config.clock.max_offset);

        let registry = Arc::new(TxnRegistry::new());
        let resolver = IntentResolver::new(
            Arc::clone(&registry),
            Arc::clone(&clock),
            config.txn.expiration,
            config.txn.wait_tick,
        );
        let gate = CommandGate::new(resolver, config.store.clone());

        info!(
            node_id = %config.node_id,
            max_offset = ?config.clock.max_offset,
            "store created"
        );
        Ok(Self {
            txn_ids: TxnIdGenerator::new(config.node_id),
            config,
            clock,
            registry,
            gate,
            replicas: RwLock::new(BTreeMap::new()),
        })
    }

    /// Creates a store holding a single range over the whole key space.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `config` does not validate.
    pub fn with_full_range(config: NodeConfig, clock: Arc<HybridClock>) -> MeridianResult<Self> {
        let store = Self::new(config, clock)?;
        store.add_range(RangeDescriptor::full(RangeId::FIRST))?;
        Ok(store)
    }

    /// Adds an empty range.
    ///
    /// With low water seeding enabled the new range's timestamp cache
    /// starts one maximum clock offset past the current time, so no write
    /// can land below a read another node may already have served.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the ID is taken or the span overlaps
    /// an existing range.
    pub fn add_range(&self, desc: RangeDescriptor) -> MeridianResult<Arc<Replica>> {
        let mut replicas = self.replicas.write();
        if replicas.contains_key(&desc.range_id) {
            return Err(MeridianError::invalid_argument(format!(
                "range {} already exists",
                desc.range_id
            )));
        }
        if let Some(existing) = replicas.values().find(|r| r.desc.overlaps(&desc)) {
            return Err(MeridianError::invalid_argument(format!(
                "range {} overlaps range {}",
                desc.range_id, existing.desc.range_id
            )));
        }

        let low_water = if self.config.tscache.seed_low_water {
            self.clock.now().add(self.clock.max_offset())
        } else {
            Timestamp::ZERO
        };
        debug!(range_id = %desc.range_id, low_water = %low_water, "adding range");
        let replica = Arc::new(Replica::new(desc, &self.config.tscache, low_water));
        replicas.insert(replica.desc.range_id, Arc::clone(&replica));
        Ok(replica)
    }

    /// Returns the descriptors of every range, in ID order.
    pub fn ranges(&self) -> Vec<RangeDescriptor> {
        self.replicas.read().values().map(|r| r.desc.clone()).collect()
    }

    /// Returns the replica of `range_id`.
    ///
    /// # Errors
    ///
    /// Returns `RangeNotFound` if the store has no such range.
    pub fn replica(&self, range_id: RangeId) -> MeridianResult<Arc<Replica>> {
        self.replicas
            .read()
            .get(&range_id)
            .cloned()
            .ok_or(MeridianError::RangeNotFound { range_id })
    }

    /// Returns the replica whose span contains `key`.
    ///
    /// # Errors
    ///
    /// Returns `KeyOutOfRange` if no range contains `key`.
    pub fn replica_for_key(&self, key: &Key) -> MeridianResult<Arc<Replica>> {
        self.replicas
            .read()
            .values()
            .find(|r| r.desc.contains(key))
            .cloned()
            .ok_or_else(|| MeridianError::KeyOutOfRange { key: key.clone() })
    }

    fn route(&self, command: &Command) -> MeridianResult<Arc<Replica>> {
        let replica = self.replica_for_key(command.key())?;
        if let Command::Scan { end, .. } = command {
            if !replica.desc.covers_end(end) {
                return Err(MeridianError::KeyOutOfRange { key: end.clone() });
            }
        }
        Ok(replica)
    }

    /// Admits and applies a request.
    ///
    /// A zero timestamp is replaced by `clock.now()`. Any other timestamp
    /// must pass the clock's offset check and is merged into the clock
    /// before the command runs. The clock is then advanced past the
    /// response timestamp, which may exceed the requested one when a
    /// write was pushed.
    ///
    /// # Errors
    ///
    /// - `ClockOffsetExceeded` if the timestamp is too far ahead; nothing
    ///   is applied and the clock is unchanged
    /// - `KeyOutOfRange` if the store does not hold the key
    /// - any error the command itself produces
    pub fn execute(&self, request: Request) -> MeridianResult<Response> {
        self.execute_recorded(request).result
    }

    /// Like [`Store::execute`], but also returns the intent resolutions
    /// the command performed. An ordering layer replays those on every
    /// follower, in order, ahead of the command itself, and still replays
    /// them when the command failed.
    pub fn execute_recorded(&self, mut request: Request) -> Applied {
        if request.header.timestamp.is_zero() {
            request.header.timestamp = self.clock.now();
        } else if let Err(err) = self.clock.check_and_update(request.header.timestamp) {
            return Applied::failed(err);
        }

        let replica = match self.route(&request.command) {
            Ok(replica) => replica,
            Err(err) => return Applied::failed(err),
        };
        let applied = self.gate.apply(&replica, &request, ApplyMode::Leader);
        if let Ok(response) = &applied.result {
            self.clock.update_trusted(response.timestamp);
        }
        applied
    }

    /// Applies a request that was already admitted elsewhere.
    ///
    /// The request's timestamp is trusted: it is merged into the clock
    /// however far ahead it is, and writes land exactly at it. Intent
    /// owners are never pushed here; the admitting node's resolutions
    /// arrive as `ResolveIntent` commands earlier in the stream.
    ///
    /// # Errors
    ///
    /// - `KeyOutOfRange` if the store does not hold the key
    /// - `WriteIntent` if an intent the admitting node resolved was not
    ///   replayed first
    /// - any error the command itself produces
    pub fn apply_replicated(&self, request: &Request) -> MeridianResult<Response> {
        self.clock.update_trusted(request.header.timestamp);
        let replica = self.route(&request.command)?;
        self.gate
            .apply(&replica, request, ApplyMode::Replicated)
            .result
    }

    /// Installs or removes the command filter.
    pub fn set_command_filter(&self, filter: Option<Arc<dyn CommandFilter>>) {
        self.gate.set_filter(filter);
    }

    /// Returns the node ID.
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// Returns the configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Returns the node clock.
    pub fn clock(&self) -> &Arc<HybridClock> {
        &self.clock
    }

    /// Returns the transaction records.
    pub fn registry(&self) -> &Arc<TxnRegistry> {
        &self.registry
    }

    /// Returns the intent resolver.
    pub fn resolver(&self) -> &IntentResolver {
        self.gate.resolver()
    }

    /// Allocates a transaction ID.
    pub fn next_txn_id(&self) -> TxnId {
        self.txn_ids.next_id()
    }
}
