//! Meridian Performance Benchmarks
//!
//! This crate contains benchmarks for the consistency core:
//! - Hybrid logical clock
//! - Timestamp cache
//! - Single-shot and transactional operations against a store
//!
//! Run benchmarks with:
//! ```bash
//! cargo bench -p meridian-bench
//! ```

pub mod utils;
