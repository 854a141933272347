//! Error handling for Meridian.
//!
//! This module provides a unified error type and result alias used
//! across all Meridian components.

mod kinds;

pub use kinds::{ErrorCode, MeridianError};

/// Result type alias for Meridian operations.
pub type MeridianResult<T> = std::result::Result<T, MeridianError>;
