//! Keys and values.
//!
//! Both wrap `Bytes`, so cloning one out of the store never copies the
//! payload. They dereference to `[u8]`.

use bytes::Bytes;
use std::fmt;
use std::ops::Deref;

use crate::error::{MeridianError, MeridianResult};

/// A key in the versioned store, ordered by its bytes.
///
/// ```rust
/// use meridian_common::types::Key;
///
/// let key = Key::from_str("user/");
/// assert!(key < key.next());
/// assert_eq!(key.prefix_end().as_bytes(), b"user0");
/// ```
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Key(Bytes);

impl Key {
    /// The smallest key.
    #[must_use]
    pub const fn empty() -> Self {
        Self(Bytes::new())
    }

    /// Creates a key from a string.
    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }

    /// Returns the key's bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The smallest key strictly greater than this one.
    #[must_use]
    pub fn next(&self) -> Self {
        let mut bytes = self.0.to_vec();
        bytes.push(0x00);
        Self(bytes.into())
    }

    /// The first key that does not start with this one, so that
    /// `[k, k.prefix_end())` holds exactly the keys prefixed by `k`.
    /// A key of only `0xFF` bytes has no such bound and yields `next()`.
    #[must_use]
    pub fn prefix_end(&self) -> Self {
        let mut bytes = self.0.to_vec();
        while let Some(last) = bytes.pop() {
            if last < 0xFF {
                bytes.push(last + 1);
                return Self(bytes.into());
            }
        }
        self.next()
    }
}

impl Deref for Key {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({self})")
    }
}

/// Printable keys show as quoted strings, others as (truncated) hex.
impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Ok(s) = std::str::from_utf8(&self.0) {
            return write!(f, "{s:?}");
        }
        for byte in self.0.iter().take(32) {
            write!(f, "{byte:02x}")?;
        }
        if self.0.len() > 32 {
            f.write_str("...")?;
        }
        Ok(())
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self::from_str(s)
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self(s.into_bytes().into())
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes.into())
    }
}

/// A value stored under a key.
///
/// `Increment` stores its counters as 8-byte big-endian `i64`.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Value(Bytes);

impl Value {
    /// Creates a value from a string.
    #[must_use]
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }

    /// Creates a value from owned bytes.
    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self(bytes.into())
    }

    /// Encodes an integer.
    #[must_use]
    pub fn from_i64(v: i64) -> Self {
        Self(Bytes::copy_from_slice(&v.to_be_bytes()))
    }

    /// Decodes an integer written by [`Value::from_i64`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the value is not exactly eight bytes.
    pub fn as_i64(&self) -> MeridianResult<i64> {
        let bytes: [u8; 8] = self.0.as_ref().try_into().map_err(|_| {
            MeridianError::invalid_argument(format!(
                "value of {} bytes is not an integer",
                self.0.len()
            ))
        })?;
        Ok(i64::from_be_bytes(bytes))
    }

    /// Returns the value's bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Deref for Value {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "Value({s:?})"),
            Err(_) => write!(f, "Value({} bytes)", self.0.len()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::from_str(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_vec(bytes)
    }
}
