//! A set of nodes hosting replicas of the same range, each with its own
//! manually driven clock.
//!
//! The cluster stands in for the ordering layer: a command is executed on
//! the leader and then replayed, at the leader's reply timestamp, on every
//! follower in the same order.

use std::collections::BTreeMap;
use std::sync::Arc;

use meridian_common::config::NodeConfig;
use meridian_common::{Key, MeridianError, MeridianResult, NodeId, RangeId, Timestamp, Value};
use meridian_mvcc::version::KeyHistory;
use meridian_mvcc::{HybridClock, ManualClock};
use meridian_txn::{Db, Request, Response, Store};
use tracing_subscriber::EnvFilter;

/// Installs a test-friendly tracing subscriber, filtered by `RUST_LOG`.
/// Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One node of a [`TestCluster`].
#[derive(Debug)]
pub struct TestNode {
    /// The node's physical clock.
    pub manual: Arc<ManualClock>,
    /// The node's hybrid clock.
    pub clock: Arc<HybridClock>,
    /// The node's store.
    pub store: Arc<Store>,
}

impl TestNode {
    /// Creates a node whose physical clock reads `start_nanos`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `config` does not validate.
    pub fn new(config: NodeConfig, start_nanos: u64) -> MeridianResult<Self> {
        let manual = Arc::new(ManualClock::new(start_nanos));
        let clock = Arc::new(HybridClock::new(manual.clone(), config.clock.max_offset));
        let store = Arc::new(Store::with_full_range(config, Arc::clone(&clock))?);
        Ok(Self {
            manual,
            clock,
            store,
        })
    }

    /// Returns a client for this node.
    pub fn db(&self) -> Db {
        Db::new(Arc::clone(&self.store))
    }

    /// Reads `key` straight from the node's replica at `ts`, outside any
    /// transaction and without touching the timestamp cache.
    ///
    /// # Errors
    ///
    /// Returns `WriteIntent` if an intent at or below `ts` is in the way.
    pub fn read(&self, key: &Key, ts: Timestamp) -> MeridianResult<Option<Value>> {
        self.store.replica_for_key(key)?.versions().get(key, ts, None)
    }

    /// Returns every key's history in the node's first range.
    ///
    /// # Errors
    ///
    /// Returns `RangeNotFound` if the range is missing.
    pub fn snapshot(&self) -> MeridianResult<BTreeMap<Key, KeyHistory>> {
        Ok(self.store.replica(RangeId::FIRST)?.versions().snapshot())
    }
}

/// Nodes replicating one range. Node 0 is the leader.
#[derive(Debug)]
pub struct TestCluster {
    nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Creates `size` nodes with the testing configuration, every clock
    /// starting at zero.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the configuration does not validate.
    pub fn new(size: u32) -> MeridianResult<Self> {
        Self::with_config(size, &NodeConfig::for_testing(), 0)
    }

    /// Creates `size` nodes sharing `config` (node IDs are assigned from
    /// 1), every physical clock starting at `start_nanos`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the configuration does not validate.
    pub fn with_config(size: u32, config: &NodeConfig, start_nanos: u64) -> MeridianResult<Self> {
        let nodes = (1..=size)
            .map(|id| {
                let config = NodeConfig {
                    node_id: NodeId::new(id),
                    ..config.clone()
                };
                TestNode::new(config, start_nanos)
            })
            .collect::<MeridianResult<Vec<_>>>()?;
        Ok(Self { nodes })
    }

    /// Returns the number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the cluster has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns node `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn node(&self, index: usize) -> &TestNode {
        &self.nodes[index]
    }

    /// Returns the leader.
    ///
    /// # Panics
    ///
    /// Panics if the cluster is empty.
    pub fn leader(&self) -> &TestNode {
        &self.nodes[0]
    }

    /// Returns every node.
    pub fn nodes(&self) -> &[TestNode] {
        &self.nodes
    }

    /// Executes `request` on the leader, then replays on every follower
    /// the intent resolutions the leader performed, followed by the
    /// command itself at the leader's reply timestamp.
    ///
    /// # Errors
    ///
    /// Returns the leader's error, in which case only the resolutions are
    /// replayed, or the first follower error.
    pub fn execute_replicated(&self, request: Request) -> MeridianResult<Response> {
        let Some((leader, followers)) = self.nodes.split_first() else {
            return Err(MeridianError::internal("cluster has no nodes"));
        };
        let applied = leader.store.execute_recorded(request.clone());

        for follower in followers {
            for resolution in &applied.resolved {
                follower
                    .store
                    .apply_replicated(&Request::new(resolution.to_command()))?;
            }
        }
        let response = applied.result?;

        let replay = request.at(response.timestamp);
        for follower in followers {
            follower.store.apply_replicated(&replay)?;
        }
        Ok(response)
    }

    /// Reads `key` at `ts` on every node.
    ///
    /// # Errors
    ///
    /// Returns the first node's read error.
    pub fn read_all(&self, key: &Key, ts: Timestamp) -> MeridianResult<Vec<Option<Value>>> {
        self.nodes.iter().map(|node| node.read(key, ts)).collect()
    }
}
