//! On-disk object cache for s3-netcdf
//!
//! Maps remote object URIs to validated local copies:
//! - Keys are truncated SHA-256 digests of the URI (fixed width, filesystem safe)
//! - Layout: `<root>/files/<key>` blobs, `<root>/meta/<key>.meta` metadata
//! - Metadata presence is the commit marker; partial entries are misses
//! - Eviction: TTL first, then least-recently-validated until under budget
//!
//! ## Locking
//!
//! Writers of a key hold an advisory lock under `<root>/locks/`, and blobs
//! reach `files/` through an atomic rename, so several processes may share
//! one cache root.

mod config;
mod key;
mod layout;
mod lock;
mod meta;
mod store;

pub use config::CacheConfig;
pub use key::{CacheKey, InvalidKey};
pub use layout::{
    ensure_layout, resolve_root, resolve_root_with, DirectoryLayout, LayoutError, APP_NAME,
    CACHE_DIR_ENV,
};
pub use lock::{KeyLock, LockError, LockResult};
pub use meta::{CacheEntry, ParseError};
pub use store::{
    CacheLookup, CacheStats, CacheStore, EvictionReport, MissReason, StoreError, StoreResult,
};
