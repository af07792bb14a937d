//! Open/close orchestration
//!
//! Ties the cache store, scratch selector and handle registry around the
//! two external collaborators:
//! - [`ObjectFetcher`]: downloads a whole object by URI
//! - [`StructuredFormat`]: opens a local path and returns a typed handle
//!
//! `open`: cache hit -> open the cached blob in place (read mode); miss ->
//! fetch, write a scratch file, admit it into the cache, open the scratch
//! file. `close`: close the handle, then release its scratch file.
//!
//! A failing or disabled cache never fails an open; it only costs a fetch.

use std::error::Error as StdError;
use std::fmt::Display;
use std::fs;
use std::hash::Hash;
use std::io;
use std::path::{Path, PathBuf};

use s3nc_store::{CacheLookup, CacheStore};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::handles::{HandleError, HandleRegistry, ReleaseOutcome};
use crate::scratch::TempLocationSelector;

/// Boxed error from a collaborator.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Downloads remote objects.
pub trait ObjectFetcher {
    /// Fetch the full object at `uri`.
    fn fetch(&self, uri: &str) -> Result<Vec<u8>, BoxError>;

    /// The object's current integrity token (e.g. ETag), if the source can
    /// provide one cheaply. Used only when token validation is enabled.
    fn integrity_token(&self, _uri: &str) -> Option<String> {
        None
    }
}

/// How a structured file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    #[default]
    Read,
    Write,
}

/// The structured file-format library.
pub trait StructuredFormat {
    /// Open file handle
    type Handle;
    /// Identifier the library uses for an open handle
    type Id: Eq + Hash + Clone + Display;

    fn open(&self, path: &Path, mode: OpenMode) -> Result<Self::Handle, BoxError>;

    fn close(&self, handle: Self::Handle) -> Result<(), BoxError>;

    fn resource_id(&self, handle: &Self::Handle) -> Self::Id;
}

/// Errors from [`Session::open`] and [`Session::close`].
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to fetch {uri}: {source}")]
    Fetch { uri: String, source: BoxError },

    #[error("failed to write scratch copy of {uri}: {source}")]
    Scratch { uri: String, source: io::Error },

    #[error("failed to open {path}: {source}")]
    Open { path: PathBuf, source: BoxError },

    #[error("failed to close resource {id}: {source}")]
    Close { id: String, source: BoxError },

    #[error(transparent)]
    Handle(#[from] HandleError),
}

/// One session's view of remote objects as local files.
pub struct Session<F, S>
where
    S: StructuredFormat,
{
    store: CacheStore,
    registry: HandleRegistry<S::Id>,
    scratch: TempLocationSelector,
    fetcher: F,
    format: S,
}

impl<F, S> Session<F, S>
where
    F: ObjectFetcher,
    S: StructuredFormat,
{
    /// Build a session. The cache is initialized here; an unusable cache
    /// root is logged and the session runs uncached.
    pub fn new(config: &SessionConfig, fetcher: F, format: S) -> Self {
        Self::with_parts(
            CacheStore::open(config.cache.clone()),
            HandleRegistry::new(config.handles.max_open),
            TempLocationSelector::from_settings(&config.scratch),
            fetcher,
            format,
        )
    }

    pub fn with_parts(
        store: CacheStore,
        registry: HandleRegistry<S::Id>,
        scratch: TempLocationSelector,
        fetcher: F,
        format: S,
    ) -> Self {
        Self {
            store,
            registry,
            scratch,
            fetcher,
            format,
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn registry(&self) -> &HandleRegistry<S::Id> {
        &self.registry
    }

    pub fn scratch(&self) -> &TempLocationSelector {
        &self.scratch
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn format(&self) -> &S {
        &self.format
    }

    /// Open the object at `uri` as a local structured file.
    pub fn open(&self, uri: &str, mode: OpenMode) -> Result<S::Handle, SessionError> {
        let token = if self.store.is_active() && self.store.config().validate_integrity_token {
            self.fetcher.integrity_token(uri)
        } else {
            None
        };

        match self.store.lookup(uri, token.as_deref()) {
            CacheLookup::Hit { path, .. } if mode == OpenMode::Read => {
                debug!(uri, path = %path.display(), "opening cached copy");
                return self.open_registered(&path, mode, true);
            }
            CacheLookup::Hit { path, .. } => {
                // Writers get a private copy; the cached blob stays pristine.
                let scratch = self.copy_to_scratch(uri, &path)?;
                return self.open_registered(&scratch, mode, false);
            }
            CacheLookup::Miss(reason) => {
                debug!(uri, ?reason, "fetching object");
            }
        }

        let bytes = self.fetcher.fetch(uri).map_err(|source| SessionError::Fetch {
            uri: uri.to_string(),
            source,
        })?;

        let scratch = self
            .scratch
            .write_file(uri, &bytes)
            .map_err(|source| SessionError::Scratch {
                uri: uri.to_string(),
                source,
            })?;
        drop(bytes);

        if let Err(e) = self.store.put(uri, &scratch, token.as_deref()) {
            warn!(uri, error = %e, "could not admit object into cache");
        }

        self.open_registered(&scratch, mode, false)
    }

    /// Close `handle` and release its scratch file.
    ///
    /// Returns the release outcome; [`ReleaseOutcome::Unmanaged`] means the
    /// handle was not opened through this session.
    pub fn close(&self, handle: S::Handle) -> Result<ReleaseOutcome, SessionError> {
        let id = self.format.resource_id(&handle);
        let closed = self.format.close(handle);

        // Release even if the library failed to close, so the scratch file
        // is not leaked.
        let released = self.registry.release(&id);

        if let Err(source) = closed {
            if let Err(e) = released {
                warn!(id = %id, error = %e, "scratch cleanup failed after close error");
            }
            return Err(SessionError::Close {
                id: id.to_string(),
                source,
            });
        }

        Ok(released?)
    }

    fn open_registered(
        &self,
        path: &Path,
        mode: OpenMode,
        owns_cache_copy: bool,
    ) -> Result<S::Handle, SessionError> {
        let discard = || {
            if !owns_cache_copy {
                let _ = fs::remove_file(path);
            }
        };

        let handle = match self.format.open(path, mode) {
            Ok(handle) => handle,
            Err(source) => {
                discard();
                return Err(SessionError::Open {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let id = self.format.resource_id(&handle);
        if let Err(e) = self.registry.acquire(id, path, owns_cache_copy) {
            if let Err(close_err) = self.format.close(handle) {
                warn!(path = %path.display(), error = %close_err, "close after failed registration");
            }
            discard();
            return Err(e.into());
        }

        Ok(handle)
    }

    fn copy_to_scratch(&self, uri: &str, cached: &Path) -> Result<PathBuf, SessionError> {
        let scratch_err = |source| SessionError::Scratch {
            uri: uri.to_string(),
            source,
        };
        let (path, file) = self.scratch.create_file(uri).map_err(scratch_err)?;
        drop(file);
        if let Err(e) = fs::copy(cached, &path) {
            let _ = fs::remove_file(&path);
            return Err(scratch_err(e));
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use s3nc_store::CacheConfig;
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[derive(Default)]
    struct MapFetcher {
        objects: HashMap<String, Vec<u8>>,
        fetches: Cell<usize>,
    }

    impl ObjectFetcher for MapFetcher {
        fn fetch(&self, uri: &str) -> Result<Vec<u8>, BoxError> {
            self.fetches.set(self.fetches.get() + 1);
            self.objects
                .get(uri)
                .cloned()
                .ok_or_else(|| format!("no such object: {}", uri).into())
        }
    }

    /// Handles are (id, path); ids count up from 1.
    #[derive(Default)]
    struct FakeFormat {
        next: Cell<u32>,
        opened: RefCell<Vec<(PathBuf, OpenMode)>>,
    }

    impl StructuredFormat for FakeFormat {
        type Handle = (u32, PathBuf);
        type Id = u32;

        fn open(&self, path: &Path, mode: OpenMode) -> Result<Self::Handle, BoxError> {
            if !path.exists() {
                return Err("missing file".into());
            }
            self.next.set(self.next.get() + 1);
            self.opened.borrow_mut().push((path.to_path_buf(), mode));
            Ok((self.next.get(), path.to_path_buf()))
        }

        fn close(&self, _handle: Self::Handle) -> Result<(), BoxError> {
            Ok(())
        }

        fn resource_id(&self, handle: &Self::Handle) -> u32 {
            handle.0
        }
    }

    fn session(temp_dir: &TempDir, cache: CacheConfig) -> Session<MapFetcher, FakeFormat> {
        let mut config = SessionConfig::default();
        config.cache = cache.with_root(temp_dir.path().join("cache"));
        config.scratch.ram_dirs = Vec::new();
        config.scratch.fallback_dir = Some(temp_dir.path().join("scratch"));
        fs::create_dir_all(temp_dir.path().join("scratch")).unwrap();

        let mut fetcher = MapFetcher::default();
        fetcher
            .objects
            .insert("s3://b/x.nc".to_string(), b"CDF\x01 x".to_vec());
        Session::new(&config, fetcher, FakeFormat::default())
    }

    #[test]
    fn test_miss_then_hit_reuses_cache() {
        let temp_dir = TempDir::new().unwrap();
        let session = session(&temp_dir, CacheConfig::default());

        let first = session.open("s3://b/x.nc", OpenMode::Read).unwrap();
        assert_eq!(session.fetcher.fetches.get(), 1);
        assert_eq!(fs::read(&first.1).unwrap(), b"CDF\x01 x");
        // The scratch copy is not the cache blob
        assert!(first.1.starts_with(temp_dir.path().join("scratch")));

        let scratch_path = first.1.clone();
        assert!(matches!(session.close(first).unwrap(), ReleaseOutcome::Deleted(_)));
        assert!(!scratch_path.exists());

        let second = session.open("s3://b/x.nc", OpenMode::Read).unwrap();
        assert_eq!(session.fetcher.fetches.get(), 1, "second open is served from cache");
        assert!(second.1.starts_with(temp_dir.path().join("cache").join("files")));

        let blob = second.1.clone();
        assert!(matches!(session.close(second).unwrap(), ReleaseOutcome::Retained(_)));
        assert!(blob.exists(), "cache blob outlives the handle");
    }

    #[test]
    fn test_write_mode_hit_gets_private_copy() {
        let temp_dir = TempDir::new().unwrap();
        let session = session(&temp_dir, CacheConfig::default());
        let h = session.open("s3://b/x.nc", OpenMode::Read).unwrap();
        session.close(h).unwrap();

        let h = session.open("s3://b/x.nc", OpenMode::Write).unwrap();

        assert_eq!(session.fetcher.fetches.get(), 1);
        assert!(h.1.starts_with(temp_dir.path().join("scratch")));
        assert_eq!(fs::read(&h.1).unwrap(), b"CDF\x01 x");
        assert_eq!(session.format.opened.borrow().last().unwrap().1, OpenMode::Write);
        session.close(h).unwrap();
    }

    #[test]
    fn test_disabled_cache_still_opens() {
        let temp_dir = TempDir::new().unwrap();
        let session = session(&temp_dir, CacheConfig::disabled());

        for _ in 0..2 {
            let h = session.open("s3://b/x.nc", OpenMode::Read).unwrap();
            session.close(h).unwrap();
        }

        assert_eq!(session.fetcher.fetches.get(), 2);
        assert!(!temp_dir.path().join("cache").exists());
    }

    #[test]
    fn test_fetch_error_surfaces() {
        let temp_dir = TempDir::new().unwrap();
        let session = session(&temp_dir, CacheConfig::default());

        let err = session.open("s3://b/missing.nc", OpenMode::Read).unwrap_err();
        assert!(matches!(err, SessionError::Fetch { .. }));
        assert_eq!(session.registry.active_count(), 0);
    }

    #[test]
    fn test_close_of_foreign_handle_is_unmanaged() {
        let temp_dir = TempDir::new().unwrap();
        let session = session(&temp_dir, CacheConfig::default());

        let outcome = session.close((42, PathBuf::from("/elsewhere.nc"))).unwrap();
        assert_eq!(outcome, ReleaseOutcome::Unmanaged);
    }
}
