//! On-disk cache layout
//!
//! Resolves the cache root and owns the directory structure under it:
//!
//! ```text
//! <root>/files/<key>        cached blob, same bytes as the source object
//! <root>/meta/<key>.meta    key=value metadata; its presence commits the entry
//! <root>/tmp/               staging area for atomic renames into files/ and meta/
//! <root>/locks/<key>.lock   per-key advisory locks
//! ```
//!
//! ## Root precedence
//!
//! 1. Explicit `cache_root` in [`CacheConfig`]
//! 2. `S3_NETCDF_CACHE_DIR`
//! 3. `$XDG_CACHE_HOME/s3-netcdf`
//! 4. `$HOME/.cache/s3-netcdf`
//! 5. `/tmp/s3-netcdf-cache`

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::CacheConfig;
use crate::key::CacheKey;

/// Application name used in derived cache paths.
pub const APP_NAME: &str = "s3-netcdf";

/// Environment variable overriding the cache root.
pub const CACHE_DIR_ENV: &str = "S3_NETCDF_CACHE_DIR";

/// Suffix of metadata files.
pub const META_SUFFIX: &str = ".meta";

/// Errors from preparing the cache directories.
#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("cannot create cache directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("cache path is not a directory: {0}")]
    NotADirectory(PathBuf),
}

/// Directory structure of one cache root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryLayout {
    root: PathBuf,
}

impl DirectoryLayout {
    const FILES_DIR: &'static str = "files";
    const META_DIR: &'static str = "meta";
    const TMP_DIR: &'static str = "tmp";
    const LOCKS_DIR: &'static str = "locks";

    /// Wrap an already-resolved root. Does not touch the filesystem.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the root for `config` from the process environment.
    pub fn resolve(config: &CacheConfig) -> Self {
        Self::new(resolve_root(config.cache_root.as_deref()))
    }

    /// Create the root and all subdirectories. Succeeds if they already exist.
    pub fn ensure(&self) -> Result<(), LayoutError> {
        ensure_layout(&self.root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files_dir(&self) -> PathBuf {
        self.root.join(Self::FILES_DIR)
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.root.join(Self::META_DIR)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join(Self::TMP_DIR)
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join(Self::LOCKS_DIR)
    }

    /// `<root>/files/<key>`
    pub fn blob_path(&self, key: &CacheKey) -> PathBuf {
        self.files_dir().join(key.as_str())
    }

    /// `<root>/meta/<key>.meta`
    pub fn meta_path(&self, key: &CacheKey) -> PathBuf {
        self.meta_dir().join(format!("{}{}", key, META_SUFFIX))
    }

    /// `<root>/locks/<key>.lock`
    pub fn lock_path(&self, key: &CacheKey) -> PathBuf {
        self.locks_dir().join(format!("{}.lock", key))
    }

    /// A unique staging path under `tmp/` for `key`.
    pub fn staging_path(&self, key: &CacheKey, kind: &str) -> PathBuf {
        self.tmp_dir()
            .join(format!("{}.{}.{}", key, kind, uuid::Uuid::new_v4().simple()))
    }
}

/// Resolve the cache root using the process environment.
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    resolve_root_with(explicit, |name| std::env::var_os(name).map(PathBuf::from))
}

/// Resolve the cache root with an injectable environment lookup.
///
/// Empty variables are treated as unset.
pub fn resolve_root_with<F>(explicit: Option<&Path>, env: F) -> PathBuf
where
    F: Fn(&str) -> Option<PathBuf>,
{
    let var = |name: &str| env(name).filter(|p| !p.as_os_str().is_empty());

    if let Some(path) = explicit.filter(|p| !p.as_os_str().is_empty()) {
        return path.to_path_buf();
    }
    if let Some(path) = var(CACHE_DIR_ENV) {
        return path;
    }
    if let Some(xdg) = var("XDG_CACHE_HOME") {
        return xdg.join(APP_NAME);
    }
    if let Some(home) = var("HOME").or_else(dirs::home_dir) {
        return home.join(".cache").join(APP_NAME);
    }
    PathBuf::from(format!("/tmp/{}-cache", APP_NAME))
}

/// Create `root`, `root/files`, `root/meta` (and the internal `tmp`/`locks`
/// directories) idempotently.
pub fn ensure_layout(root: &Path) -> Result<(), LayoutError> {
    let layout = DirectoryLayout::new(root);
    for dir in [
        layout.root.clone(),
        layout.files_dir(),
        layout.meta_dir(),
        layout.tmp_dir(),
        layout.locks_dir(),
    ] {
        if let Err(source) = fs::create_dir_all(&dir) {
            // create_dir_all fails on an existing non-directory with a
            // generic error; report that case precisely.
            if dir.exists() && !dir.is_dir() {
                return Err(LayoutError::NotADirectory(dir));
            }
            return Err(LayoutError::CreateDir { path: dir, source });
        }
        if !dir.is_dir() {
            return Err(LayoutError::NotADirectory(dir));
        }
    }
    Ok(())
}
