//! # meridian-test
//!
//! Integration tests for Meridian.
//!
//! This crate contains:
//! - A multi-node [`TestCluster`] whose nodes run on manual clocks
//! - Seeded workload generators for replay and invariant tests
//! - Scenario tests under `tests/`

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Multi-node test context.
pub mod cluster;

/// Workload generators.
pub mod workload;

pub use cluster::{init_tracing, TestCluster, TestNode};
pub use workload::{Workload, WorkloadConfig};
