//! # meridian-txn
//!
//! Transaction layer for Meridian.
//!
//! This crate turns the clock, versioned store and timestamp cache from
//! `meridian-mvcc` into a transactional key-value service:
//!
//! - **Transaction records**: node-wide table of transaction status,
//!   timestamp and liveness, with waiters notified on every change.
//!
//! - **Intent resolution**: conflicting intents are pushed or aborted by
//!   priority; losers wait for the owner to finish.
//!
//! - **Command execution**: each command is admitted against the node
//!   clock, routed to its range, filtered, applied against the timestamp
//!   cache and versioned store, and retried past resolved intents.
//!
//! - **Coordination**: a bounded retry loop that re-runs a transaction
//!   body with a higher epoch whenever a conflict pushes it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Db / TxnCoordinator                                         │
//! │          │ Request                                           │
//! │          ▼                                                   │
//! │  Store ── HybridClock (check_and_update / update_trusted)    │
//! │    │                                                         │
//! │    ├── CommandGate ── CommandFilter (optional)               │
//! │    │       │                                                 │
//! │    │       ├── Replica: TimestampCache + VersionStore        │
//! │    │       └── IntentResolver ── TxnRegistry                 │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```rust
//! use meridian_common::config::NodeConfig;
//! use meridian_mvcc::HybridClock;
//! use meridian_txn::{Db, Store};
//! use std::sync::Arc;
//!
//! let config = NodeConfig::for_testing();
//! let clock = Arc::new(HybridClock::system(config.clock.max_offset));
//! let store = Arc::new(Store::with_full_range(config, clock).unwrap());
//! let db = Db::new(store);
//!
//! db.put("a", "1").unwrap();
//! let value = db
//!     .txn(|txn| {
//!         txn.put("b", "2")?;
//!         txn.get("a")
//!     })
//!     .unwrap();
//! assert_eq!(value.unwrap().as_bytes(), b"1");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Single-shot and transactional client facade.
pub mod client;

/// Transaction retry loop and handle.
pub mod coordinator;

/// Commands, requests, responses and the execution pipeline.
pub mod gate;

/// Transaction records.
pub mod record;

/// Conflict resolution between transactions.
pub mod resolver;

/// Node store and range replicas.
pub mod store;

pub use client::Db;
pub use coordinator::{Txn, TxnCoordinator, TxnOptions, TxnStats};
pub use gate::{
    Applied, CancelToken, Command, CommandFilter, CommandGate, FilterAction, Request,
    RequestHeader, ResolvedIntent, Response, ResponseBody,
};
pub use record::{RecordEntry, TxnIdGenerator, TxnRecord, TxnRegistry};
pub use resolver::{
    IntentResolver, PushKind, PushOutcome, Pusher, ResolutionState, ResolverStats,
};
pub use store::{RangeDescriptor, Replica, Store};
