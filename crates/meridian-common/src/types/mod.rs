//! Type definitions for Meridian.
//!
//! This module contains the core type definitions shared across crates.

mod ids;
mod keys;
mod timestamps;
mod txn;

pub use ids::{NodeId, Priority, RangeId, TxnId};
pub use keys::{Key, Value};
pub use timestamps::Timestamp;
pub use txn::{Intent, TxnMeta, TxnStatus};
