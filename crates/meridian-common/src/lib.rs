//! # meridian-common
//!
//! Common types, errors, and configuration for Meridian.
//!
//! This crate provides the foundational types shared by the clock, the
//! versioned store and the transaction layer:
//!
//! - **Types**: identifiers (`TxnId`, `NodeId`, `RangeId`, `Priority`),
//!   keys and values, hybrid timestamps, and transaction metadata
//! - **Errors**: unified error handling with `MeridianError`
//! - **Config**: node configuration structures
//! - **Constants**: system-wide defaults and limits
//!
//! ## Example
//!
//! ```rust
//! use meridian_common::types::{Key, Timestamp, TxnId, Value};
//! use meridian_common::error::MeridianResult;
//!
//! fn example() -> MeridianResult<()> {
//!     let txn = TxnId::new(1);
//!     let key = Key::from_str("a");
//!     let value = Value::from_str("init");
//!     let ts = Timestamp::new(100, 0);
//!     assert!(ts < ts.next());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

// Re-export commonly used items at the crate root
pub use constants::*;
pub use error::{MeridianError, MeridianResult};
pub use types::{
    Intent, Key, NodeId, Priority, RangeId, Timestamp, TxnId, TxnMeta, TxnStatus, Value,
};
