//! Cache configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the object cache.
///
/// Built once per session and handed to [`CacheStore`](crate::CacheStore) by
/// value; the store never mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether caching is active at all
    pub enabled: bool,
    /// Explicit cache root (highest precedence when set)
    pub cache_root: Option<PathBuf>,
    /// Maximum total size of cached blobs in bytes (0 = unlimited)
    pub max_size_bytes: u64,
    /// Entry lifetime in seconds (0 = never expires)
    pub ttl_seconds: u32,
    /// Reject cached copies whose integrity token differs from the source's
    pub validate_integrity_token: bool,
    /// How long to wait for a per-key lock, in milliseconds
    pub lock_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_root: None,
            max_size_bytes: 10 * 1024 * 1024 * 1024, // 10 GB
            ttl_seconds: 7 * 24 * 60 * 60,           // 7 days
            validate_integrity_token: false,
            lock_timeout_ms: 30_000,
        }
    }
}

impl CacheConfig {
    /// A configuration that turns the cache off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Use an explicit cache root.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cache_root = Some(root.into());
        self
    }

    /// Lock timeout as a [`Duration`].
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// TTL as a [`chrono::Duration`], or `None` when entries never expire.
    pub fn ttl(&self) -> Option<chrono::Duration> {
        if self.ttl_seconds == 0 {
            None
        } else {
            Some(chrono::Duration::seconds(i64::from(self.ttl_seconds)))
        }
    }
}
