//! Configuration for Meridian.
//!
//! This module provides configuration structures for the clock, timestamp
//! cache, transaction and store components of a node.

mod node;

pub use node::{ClockConfig, NodeConfig, StoreConfig, TsCacheConfig, TxnConfig};
