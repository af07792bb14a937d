//! Built-in defaults (layer 1)

use std::path::PathBuf;

use s3nc_store::CacheConfig;
use serde::{Deserialize, Serialize};

/// Default cap on simultaneously open scratch files.
pub const DEFAULT_MAX_OPEN: usize = 64;

/// Upper bound accepted for `handles.max_open`.
pub const MAX_OPEN_LIMIT: usize = 65_536;

/// Handle registry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandleSettings {
    /// Maximum simultaneously registered scratch files
    pub max_open: usize,
}

impl Default for HandleSettings {
    fn default() -> Self {
        Self {
            max_open: DEFAULT_MAX_OPEN,
        }
    }
}

/// Scratch directory settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScratchSettings {
    /// RAM-backed candidates, tried in order
    pub ram_dirs: Vec<PathBuf>,
    /// Durable fallback; the system temp dir when unset
    pub fallback_dir: Option<PathBuf>,
}

impl Default for ScratchSettings {
    fn default() -> Self {
        let ram_dirs = if cfg!(target_os = "linux") {
            vec![PathBuf::from("/dev/shm")]
        } else {
            Vec::new()
        };
        Self {
            ram_dirs,
            fallback_dir: None,
        }
    }
}

/// Everything a session needs, fixed at session start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub cache: CacheConfig,
    pub handles: HandleSettings,
    pub scratch: ScratchSettings,
}

impl SessionConfig {
    /// Defaults as a JSON value for merging.
    pub fn defaults_value() -> serde_json::Value {
        // Serializing plain data structs cannot fail.
        serde_json::to_value(Self::default()).unwrap_or(serde_json::Value::Null)
    }
}
