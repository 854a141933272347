//! # meridian-mvcc
//!
//! Multi-version concurrency control for Meridian.
//!
//! This crate implements:
//! - Hybrid Logical Clock (HLC) with trusted and checked updates
//! - Versioned key storage with provisional write intents
//! - The timestamp cache that pushes writes above served reads

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Hybrid Logical Clock
pub mod hlc;

/// Versioned storage with intents
pub mod version;

/// Read/write timestamp cache
pub mod tscache;

pub use hlc::{HybridClock, ManualClock, PhysicalClock, SystemClock};
pub use tscache::TimestampCache;
pub use version::{PutOutcome, VersionStore};
