//! s3-netcdf local object cache
//!
//! Gives consumers that need a real, seekable local file access to objects
//! in a remote store:
//! - [`s3nc_store`]: the on-disk cache (keys, layout, metadata, eviction)
//! - [`handles`]: bounded tracking of scratch files by resource id
//! - [`scratch`]: RAM-backed or durable scratch directory selection
//! - [`session`]: the open/close life cycle over fetch and format collaborators

pub mod config;
pub mod handles;
pub mod scratch;
pub mod session;

pub use config::{ConfigError, LoadedConfig, SessionConfig};
pub use handles::{HandleError, HandleRecord, HandleRegistry, HandleResult, ReleaseOutcome};
pub use s3nc_store::{
    CacheConfig, CacheEntry, CacheKey, CacheLookup, CacheStats, CacheStore, DirectoryLayout,
    EvictionReport, MissReason, StoreError, StoreResult,
};
pub use scratch::TempLocationSelector;
pub use session::{BoxError, ObjectFetcher, OpenMode, Session, SessionError, StructuredFormat};
