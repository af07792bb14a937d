//! Session configuration
//!
//! Implements the layered configuration merge:
//! 1. Built-in defaults
//! 2. Host config (`~/.config/s3-netcdf/config.toml`)
//! 3. Environment overrides
//! 4. CLI flags
//!
//! The result is an owned [`SessionConfig`] threaded explicitly into the
//! cache store, handle registry and scratch selector.

mod defaults;
mod load;
mod merge;

pub use defaults::{HandleSettings, ScratchSettings, SessionConfig, DEFAULT_MAX_OPEN, MAX_OPEN_LIMIT};
pub use load::{default_config_path, ConfigError, ConfigOrigin, ConfigSource, LoadedConfig};
pub use merge::{deep_merge, merge_layers, set_path};
