//! Cache key derivation
//!
//! Maps a remote object URI to a fixed-width, filesystem-safe name.
//! The key is the first 128 bits of the SHA-256 digest of the URI bytes,
//! hex-encoded (32 lowercase characters), so its length never depends on
//! the URI and distinct URIs do not alias in practice.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};

/// Number of digest bytes kept in a key.
const KEY_BYTES: usize = 16;

/// Fixed-width cache key for a remote object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Length of the hex form of a key.
    pub const HEX_LEN: usize = KEY_BYTES * 2;

    /// Derive the key for a URI.
    pub fn derive(uri: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(uri.as_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..KEY_BYTES]))
    }

    /// The key as used in file names.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error returned when a file name is not a valid key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("not a cache key: {0:?}")]
pub struct InvalidKey(pub String);

impl FromStr for CacheKey {
    type Err = InvalidKey;

    /// Parse a key back from a file name (as found under `files/` or `meta/`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = s.len() == Self::HEX_LEN
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(InvalidKey(s.to_string()))
        }
    }
}
