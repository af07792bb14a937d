//! Cache store: lookup, admission, eviction and reset
//!
//! An entry is committed by the presence of its metadata file. Blobs are
//! staged under `tmp/` and renamed into `files/` before metadata is written,
//! so a crash mid-put leaves at worst an orphan blob, which lookups treat as
//! a miss and eviction reclaims.
//!
//! Any inconsistency found for a single key (metadata without blob, blob
//! without metadata, undecodable metadata, size mismatch) is reported as a
//! miss and cleaned up best-effort; it never surfaces as an error.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::key::CacheKey;
use crate::layout::{DirectoryLayout, LayoutError, META_SUFFIX};
use crate::lock::{KeyLock, LockError};
use crate::meta::CacheEntry;

/// Store result type
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache directory unusable: {0}")]
    Config(#[from] LayoutError),

    #[error("failed to copy {source_path} into the cache for {uri}: {source}")]
    CopyFailed {
        uri: String,
        source_path: PathBuf,
        source: io::Error,
    },

    #[error("failed to write cache metadata for {uri}: {source}")]
    MetadataWriteFailed { uri: String, source: io::Error },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Why a lookup did not produce a usable copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MissReason {
    /// Caching is off or the cache root could not be prepared
    Disabled,
    /// Nothing stored for this URI
    NotCached,
    /// Entry is older than the configured TTL
    Expired,
    /// Stored integrity token differs from the caller's
    IntegrityMismatch,
    /// Partial or unreadable entry
    Corrupt,
}

/// Outcome of [`CacheStore::lookup`].
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit { path: PathBuf, entry: CacheEntry },
    Miss(MissReason),
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit { .. })
    }

    /// Local path of the cached blob on a hit.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Hit { path, .. } => Some(path),
            Self::Miss(_) => None,
        }
    }
}

/// What an eviction pass did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvictionReport {
    /// Metadata records examined
    pub scanned: usize,
    /// Entries removed for exceeding the TTL
    pub expired: usize,
    /// Entries removed to get under the size budget
    pub evicted_lru: usize,
    /// Partial or undecodable entries removed
    pub corrupt_removed: usize,
    /// Blobs without metadata and stale staging files removed
    pub orphans_removed: usize,
    /// Entries left alone because another writer held their lock
    pub skipped_locked: usize,
    /// Bytes freed
    pub bytes_reclaimed: u64,
    /// Entries remaining afterwards
    pub remaining_entries: usize,
    /// Bytes remaining afterwards
    pub remaining_bytes: u64,
    /// Non-fatal errors encountered
    pub errors: Vec<String>,
}

/// Summary of cache contents.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub root: Option<PathBuf>,
    pub enabled: bool,
    pub entries: usize,
    pub total_bytes: u64,
    pub max_size_bytes: u64,
}

/// Disk cache mapping remote object URIs to local blobs.
#[derive(Debug)]
pub struct CacheStore {
    config: CacheConfig,
    /// Prepared layout; `None` while disabled, uninitialized or degraded
    layout: Option<DirectoryLayout>,
}

impl CacheStore {
    /// Staging files older than this are considered abandoned.
    const STAGING_GRACE: Duration = Duration::from_secs(3600);

    /// Create a store without touching the filesystem. Call [`init`](Self::init)
    /// before use; until then every lookup misses.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            layout: None,
        }
    }

    /// Create and initialize a store. An unusable cache root is logged and
    /// the store degrades to disabled behaviour.
    pub fn open(config: CacheConfig) -> Self {
        let mut store = Self::new(config);
        if let Err(e) = store.init() {
            warn!(error = %e, "object cache disabled for this session");
        }
        store
    }

    /// Resolve and prepare the cache root. Idempotent.
    ///
    /// On failure the store stays usable but behaves as disabled.
    pub fn init(&mut self) -> StoreResult<()> {
        if !self.config.enabled {
            self.layout = None;
            return Ok(());
        }

        let layout = DirectoryLayout::resolve(&self.config);
        match layout.ensure() {
            Ok(()) => {
                debug!(root = %layout.root().display(), "object cache ready");
                self.layout = Some(layout);
                Ok(())
            }
            Err(e) => {
                self.layout = None;
                Err(e.into())
            }
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Whether lookups and puts reach the disk.
    pub fn is_active(&self) -> bool {
        self.layout.is_some()
    }

    /// The prepared cache root, if active.
    pub fn root(&self) -> Option<&Path> {
        self.layout.as_ref().map(DirectoryLayout::root)
    }

    /// Look up a URI, optionally checking the source's current integrity token.
    pub fn lookup(&self, uri: &str, integrity_token: Option<&str>) -> CacheLookup {
        self.lookup_at(uri, integrity_token, Utc::now())
    }

    /// [`lookup`](Self::lookup) against an explicit clock.
    pub fn lookup_at(
        &self,
        uri: &str,
        integrity_token: Option<&str>,
        now: DateTime<Utc>,
    ) -> CacheLookup {
        let Some(layout) = self.layout.as_ref() else {
            return CacheLookup::Miss(MissReason::Disabled);
        };

        let key = CacheKey::derive(uri);
        let blob_path = layout.blob_path(&key);
        let meta_path = layout.meta_path(&key);

        let meta_bytes = match fs::read(&meta_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if blob_path.exists() {
                    self.discard_dangling(layout, &key, "blob without metadata");
                    return CacheLookup::Miss(MissReason::Corrupt);
                }
                debug!(uri, %key, "cache miss");
                return CacheLookup::Miss(MissReason::NotCached);
            }
            Err(e) => {
                warn!(uri, %key, error = %e, "unreadable cache metadata");
                return CacheLookup::Miss(MissReason::Corrupt);
            }
        };

        let mut entry = match CacheEntry::decode(&meta_bytes) {
            Ok(entry) if entry.key == key => entry,
            Ok(entry) => {
                warn!(uri, %key, stored_uri = %entry.source_uri, "metadata belongs to another key");
                self.discard_dangling(layout, &key, "foreign metadata");
                return CacheLookup::Miss(MissReason::Corrupt);
            }
            Err(e) => {
                warn!(uri, %key, error = %e, "corrupt cache metadata");
                self.discard_dangling(layout, &key, "undecodable metadata");
                return CacheLookup::Miss(MissReason::Corrupt);
            }
        };

        match fs::metadata(&blob_path) {
            Ok(meta) if meta.is_file() && meta.len() == entry.size_bytes => {}
            Ok(meta) => {
                warn!(uri, %key, expected = entry.size_bytes, actual = meta.len(), "cached blob size mismatch");
                self.discard_dangling(layout, &key, "blob size mismatch");
                return CacheLookup::Miss(MissReason::Corrupt);
            }
            Err(_) => {
                self.discard_dangling(layout, &key, "metadata without blob");
                return CacheLookup::Miss(MissReason::Corrupt);
            }
        }

        // A concurrent put uncommits the metadata before renaming its blob,
        // so an unchanged record here means the blob we sized is its own.
        if !still_committed(&meta_path, &entry) {
            debug!(uri, %key, "entry replaced during lookup");
            return CacheLookup::Miss(MissReason::NotCached);
        }

        if entry.is_expired(self.config.ttl(), now) {
            debug!(uri, %key, cached_at = %entry.cached_at, "cache entry expired");
            return CacheLookup::Miss(MissReason::Expired);
        }

        if self.config.validate_integrity_token {
            if let Some(expected) = integrity_token {
                if entry.integrity_token.as_deref() != Some(expected) {
                    debug!(
                        uri,
                        %key,
                        stored = entry.integrity_token.as_deref().unwrap_or(""),
                        expected,
                        "integrity token mismatch"
                    );
                    return CacheLookup::Miss(MissReason::IntegrityMismatch);
                }
            }
        }

        self.touch(layout, &mut entry, now);
        debug!(uri, %key, size = entry.size_bytes, "cache hit");

        CacheLookup::Hit {
            path: blob_path,
            entry,
        }
    }

    /// Admit a copy of `source` under `uri`. No-op when inactive.
    pub fn put(&self, uri: &str, source: &Path, integrity_token: Option<&str>) -> StoreResult<()> {
        self.put_at(uri, source, integrity_token, Utc::now())
    }

    /// [`put`](Self::put) against an explicit clock.
    pub fn put_at(
        &self,
        uri: &str,
        source: &Path,
        integrity_token: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let Some(layout) = self.layout.as_ref() else {
            return Ok(());
        };

        let key = CacheKey::derive(uri);
        let _lock = KeyLock::acquire(&layout.lock_path(&key), self.config.lock_timeout())?;

        let copy_failed = |source_err| StoreError::CopyFailed {
            uri: uri.to_string(),
            source_path: source.to_path_buf(),
            source: source_err,
        };

        let staging = layout.staging_path(&key, "blob");
        if let Err(e) = copy_durable(source, &staging) {
            let _ = fs::remove_file(&staging);
            return Err(copy_failed(e));
        }

        // Uncommit any previous entry before its blob is replaced, so no
        // reader pairs old metadata with the new blob.
        let meta_path = layout.meta_path(&key);
        if let Err(e) = remove_if_exists(&meta_path) {
            let _ = fs::remove_file(&staging);
            return Err(StoreError::io(&meta_path, e));
        }

        let blob_path = layout.blob_path(&key);
        if let Err(e) = fs::rename(&staging, &blob_path) {
            let _ = fs::remove_file(&staging);
            return Err(copy_failed(e));
        }

        let size_bytes = fs::metadata(&blob_path).map_err(copy_failed)?.len();
        let entry = CacheEntry::new(uri, size_bytes, integrity_token, now);

        if let Err(e) = write_meta(layout, &entry) {
            let _ = fs::remove_file(&blob_path);
            return Err(StoreError::MetadataWriteFailed {
                uri: uri.to_string(),
                source: e,
            });
        }

        debug!(uri, %key, size = size_bytes, "admitted into cache");
        Ok(())
    }

    /// Remove the entry for `uri`. Returns whether anything was removed.
    pub fn remove(&self, uri: &str) -> StoreResult<bool> {
        let Some(layout) = self.layout.as_ref() else {
            return Ok(false);
        };

        let key = CacheKey::derive(uri);
        let _lock = KeyLock::acquire(&layout.lock_path(&key), self.config.lock_timeout())?;

        let meta_path = layout.meta_path(&key);
        let blob_path = layout.blob_path(&key);
        let had_meta = remove_if_exists(&meta_path).map_err(|e| StoreError::io(&meta_path, e))?;
        let had_blob = remove_if_exists(&blob_path).map_err(|e| StoreError::io(&blob_path, e))?;

        Ok(had_meta || had_blob)
    }

    /// Empty `files/` and `meta/` (and abandoned staging files).
    ///
    /// Succeeds on an already-empty cache; a no-op when inactive.
    pub fn clear(&self) -> StoreResult<()> {
        let Some(layout) = self.layout.as_ref() else {
            return Ok(());
        };

        let mut removed = 0usize;
        for dir in [layout.meta_dir(), layout.files_dir(), layout.tmp_dir()] {
            removed += empty_dir(&dir)?;
        }
        layout.ensure()?;

        info!(root = %layout.root().display(), removed, "cache cleared");
        Ok(())
    }

    /// All committed, decodable entries.
    pub fn entries(&self) -> StoreResult<Vec<CacheEntry>> {
        let Some(layout) = self.layout.as_ref() else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for (key, path) in list_keys(&layout.meta_dir(), Some(META_SUFFIX))? {
            let entry = fs::read(&path)
                .ok()
                .and_then(|bytes| CacheEntry::decode(&bytes).ok())
                .filter(|entry| entry.key == key);
            entries.extend(entry);
        }
        Ok(entries)
    }

    /// Count and total size of committed entries.
    pub fn stats(&self) -> StoreResult<CacheStats> {
        let entries = self.entries()?;
        Ok(CacheStats {
            root: self.root().map(Path::to_path_buf),
            enabled: self.is_active(),
            entries: entries.len(),
            total_bytes: entries.iter().map(|e| e.size_bytes).sum(),
            max_size_bytes: self.config.max_size_bytes,
        })
    }

    /// Reclaim space: housekeeping, then TTL, then least-recently-validated
    /// first until the cache fits in `max_size_bytes`.
    pub fn evict(&self) -> StoreResult<EvictionReport> {
        self.evict_at(Utc::now())
    }

    /// [`evict`](Self::evict) against an explicit clock.
    pub fn evict_at(&self, now: DateTime<Utc>) -> StoreResult<EvictionReport> {
        let mut report = EvictionReport::default();
        let Some(layout) = self.layout.as_ref() else {
            return Ok(report);
        };

        let mut live = self.collect_live(layout, &mut report)?;
        self.reclaim_orphans(layout, &mut report)?;

        // TTL first
        if let Some(ttl) = self.config.ttl() {
            let mut kept = Vec::with_capacity(live.len());
            for entry in live {
                if entry.is_expired(Some(ttl), now) {
                    if self.evict_entry(layout, &entry, &mut report) {
                        report.expired += 1;
                        continue;
                    }
                }
                kept.push(entry);
            }
            live = kept;
        }

        // Then least-recently-validated first
        live.sort_by(|a, b| {
            a.last_validated_at
                .cmp(&b.last_validated_at)
                .then_with(|| a.key.cmp(&b.key))
        });
        let mut total: u64 = live.iter().map(|e| e.size_bytes).sum();
        let mut remaining = Vec::with_capacity(live.len());

        for entry in live {
            let over_budget = self.config.max_size_bytes > 0 && total > self.config.max_size_bytes;
            if over_budget && self.evict_entry(layout, &entry, &mut report) {
                report.evicted_lru += 1;
                total = total.saturating_sub(entry.size_bytes);
                continue;
            }
            remaining.push(entry);
        }

        report.remaining_entries = remaining.len();
        report.remaining_bytes = total;

        info!(
            root = %layout.root().display(),
            expired = report.expired,
            evicted = report.evicted_lru,
            corrupt = report.corrupt_removed,
            orphans = report.orphans_removed,
            reclaimed = report.bytes_reclaimed,
            remaining = report.remaining_bytes,
            "eviction pass finished"
        );
        Ok(report)
    }

    /// Refresh `last_validated` after a hit. Skipped if a writer holds the key.
    fn touch(&self, layout: &DirectoryLayout, entry: &mut CacheEntry, now: DateTime<Utc>) {
        let lock = match KeyLock::try_acquire(&layout.lock_path(&entry.key)) {
            Ok(Some(lock)) => lock,
            Ok(None) => return,
            Err(e) => {
                warn!(key = %entry.key, error = %e, "cannot lock entry to record access");
                return;
            }
        };

        // Only refresh the record we validated; a concurrent put may have
        // replaced it in the meantime.
        let current = fs::read(layout.meta_path(&entry.key))
            .ok()
            .and_then(|bytes| CacheEntry::decode(&bytes).ok());
        if current.as_ref() != Some(&*entry) {
            return;
        }

        let mut updated = entry.clone();
        updated.last_validated_at = now;
        match write_meta(layout, &updated) {
            Ok(()) => *entry = updated,
            Err(e) => warn!(key = %entry.key, error = %e, "failed to record cache access"),
        }
        drop(lock);
    }

    /// Best-effort removal of a partial entry. Leaves the slot alone if a
    /// writer holds it or it became consistent in the meantime.
    fn discard_dangling(&self, layout: &DirectoryLayout, key: &CacheKey, why: &str) -> bool {
        let Ok(Some(_lock)) = KeyLock::try_acquire(&layout.lock_path(key)) else {
            return false;
        };

        let meta_path = layout.meta_path(key);
        let blob_path = layout.blob_path(key);
        if is_consistent(key, &meta_path, &blob_path) {
            return false;
        }

        let _ = remove_if_exists(&meta_path);
        let _ = remove_if_exists(&blob_path);
        warn!(%key, reason = why, "removed partial cache entry");
        true
    }

    /// Scan `meta/`, keeping consistent entries and reclaiming broken ones.
    fn collect_live(
        &self,
        layout: &DirectoryLayout,
        report: &mut EvictionReport,
    ) -> StoreResult<Vec<CacheEntry>> {
        let mut live = Vec::new();

        for (key, meta_path) in list_keys(&layout.meta_dir(), Some(META_SUFFIX))? {
            report.scanned += 1;
            let blob_path = layout.blob_path(&key);

            let entry = fs::read(&meta_path)
                .ok()
                .and_then(|bytes| CacheEntry::decode(&bytes).ok())
                .filter(|entry| entry.key == key)
                .filter(|entry| file_len(&blob_path) == Some(entry.size_bytes));

            match entry {
                Some(entry) => live.push(entry),
                None => {
                    let blob_bytes = file_len(&blob_path).unwrap_or(0);
                    if self.discard_dangling(layout, &key, "found during eviction") {
                        report.corrupt_removed += 1;
                        report.bytes_reclaimed += blob_bytes;
                    } else if !is_consistent(&key, &meta_path, &blob_path) {
                        report.skipped_locked += 1;
                    }
                }
            }
        }

        Ok(live)
    }

    /// Remove blobs that never got metadata and abandoned staging files.
    fn reclaim_orphans(&self, layout: &DirectoryLayout, report: &mut EvictionReport) -> StoreResult<()> {
        for (key, blob_path) in list_keys(&layout.files_dir(), None)? {
            if layout.meta_path(&key).exists() {
                continue;
            }
            let bytes = file_len(&blob_path).unwrap_or(0);
            if self.discard_dangling(layout, &key, "orphan blob") {
                report.orphans_removed += 1;
                report.bytes_reclaimed += bytes;
            }
        }

        let tmp_dir = layout.tmp_dir();
        let read = match fs::read_dir(&tmp_dir) {
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StoreError::io(&tmp_dir, e)),
        };
        let now = SystemTime::now();
        for dirent in read.flatten() {
            let Ok(meta) = dirent.metadata() else { continue };
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if meta.is_file() && age > Self::STAGING_GRACE {
                match fs::remove_file(dirent.path()) {
                    Ok(()) => {
                        report.orphans_removed += 1;
                        report.bytes_reclaimed += meta.len();
                    }
                    Err(e) => report
                        .errors
                        .push(format!("failed to remove {}: {}", dirent.path().display(), e)),
                }
            }
        }
        Ok(())
    }

    /// Remove one committed entry if its lock is free and it is unchanged.
    fn evict_entry(&self, layout: &DirectoryLayout, entry: &CacheEntry, report: &mut EvictionReport) -> bool {
        let lock = match KeyLock::try_acquire(&layout.lock_path(&entry.key)) {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                report.skipped_locked += 1;
                return false;
            }
            Err(e) => {
                report.errors.push(e.to_string());
                return false;
            }
        };

        let meta_path = layout.meta_path(&entry.key);
        let blob_path = layout.blob_path(&entry.key);

        let unchanged = fs::read(&meta_path)
            .ok()
            .and_then(|bytes| CacheEntry::decode(&bytes).ok())
            .is_some_and(|current| current.cached_at == entry.cached_at);
        if !unchanged {
            report.skipped_locked += 1;
            return false;
        }

        // Metadata first: the entry is uncommitted before its blob goes.
        if let Err(e) = remove_if_exists(&meta_path) {
            report
                .errors
                .push(format!("failed to remove {}: {}", meta_path.display(), e));
            return false;
        }
        if let Err(e) = remove_if_exists(&blob_path) {
            report
                .errors
                .push(format!("failed to remove {}: {}", blob_path.display(), e));
        }
        drop(lock);

        debug!(key = %entry.key, uri = %entry.source_uri, size = entry.size_bytes, "evicted");
        report.bytes_reclaimed += entry.size_bytes;
        true
    }
}

/// Copy `source` to `dest` and flush it to stable storage.
fn copy_durable(source: &Path, dest: &Path) -> io::Result<()> {
    fs::copy(source, dest)?;
    File::open(dest)?.sync_all()
}

/// Write metadata through a staging file and rename it into place.
fn write_meta(layout: &DirectoryLayout, entry: &CacheEntry) -> io::Result<()> {
    let staging = layout.staging_path(&entry.key, "meta");
    let result = (|| {
        let mut file = File::create(&staging)?;
        file.write_all(entry.encode().as_bytes())?;
        file.sync_all()?;
        fs::rename(&staging, layout.meta_path(&entry.key))
    })();
    if result.is_err() {
        let _ = fs::remove_file(&staging);
    }
    result
}

fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn file_len(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().filter(|m| m.is_file()).map(|m| m.len())
}

/// The metadata at `meta_path` still describes the same admission as
/// `entry`. Access-time refreshes do not count as a change.
fn still_committed(meta_path: &Path, entry: &CacheEntry) -> bool {
    fs::read(meta_path)
        .ok()
        .and_then(|bytes| CacheEntry::decode(&bytes).ok())
        .is_some_and(|current| {
            current.key == entry.key
                && current.size_bytes == entry.size_bytes
                && current.cached_at == entry.cached_at
                && current.integrity_token == entry.integrity_token
        })
}

/// Metadata decodes, belongs to `key`, and its blob has the recorded size.
fn is_consistent(key: &CacheKey, meta_path: &Path, blob_path: &Path) -> bool {
    fs::read(meta_path)
        .ok()
        .and_then(|bytes| CacheEntry::decode(&bytes).ok())
        .is_some_and(|entry| &entry.key == key && file_len(blob_path) == Some(entry.size_bytes))
}

/// List `(key, path)` for file names in `dir` that parse as keys, after
/// stripping `suffix`. Other files are ignored.
fn list_keys(dir: &Path, suffix: Option<&str>) -> StoreResult<Vec<(CacheKey, PathBuf)>> {
    let read = match fs::read_dir(dir) {
        Ok(read) => read,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(dir, e)),
    };

    let mut keys = Vec::new();
    for dirent in read {
        let dirent = dirent.map_err(|e| StoreError::io(dir, e))?;
        let name = dirent.file_name();
        let Some(name) = name.to_str() else { continue };
        let stem = match suffix {
            Some(suffix) => match name.strip_suffix(suffix) {
                Some(stem) => stem,
                None => continue,
            },
            None => name,
        };
        if let Ok(key) = stem.parse::<CacheKey>() {
            keys.push((key, dirent.path()));
        }
    }
    Ok(keys)
}

/// Remove everything inside `dir`, returning how many entries went.
fn empty_dir(dir: &Path) -> StoreResult<usize> {
    let read = match fs::read_dir(dir) {
        Ok(read) => read,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(StoreError::io(dir, e)),
    };

    let mut removed = 0;
    for dirent in read {
        let dirent = dirent.map_err(|e| StoreError::io(dir, e))?;
        let path = dirent.path();
        let is_dir = dirent.file_type().map(|t| t.is_dir()).unwrap_or(false);
        let result = if is_dir {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(&path, e)),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_790_000_000 + secs, 0).unwrap()
    }

    fn make_store(temp_dir: &TempDir, config: CacheConfig) -> CacheStore {
        let mut store = CacheStore::new(config.with_root(temp_dir.path().join("cache")));
        store.init().unwrap();
        store
    }

    fn source_file(temp_dir: &TempDir, name: &str, len: usize) -> PathBuf {
        let path = temp_dir.path().join(name);
        fs::write(&path, vec![b'x'; len]).unwrap();
        path
    }

    fn layout(store: &CacheStore) -> DirectoryLayout {
        DirectoryLayout::new(store.root().unwrap())
    }

    #[test]
    fn test_put_then_lookup_hits_with_same_bytes() {
        let temp_dir = TempDir::new().unwrap();
        let store = make_store(&temp_dir, CacheConfig::default());
        let src = temp_dir.path().join("a.nc");
        fs::write(&src, b"CDF\x01 payload").unwrap();

        store.put("s3://b/x.nc", &src, None).unwrap();
        let lookup = store.lookup("s3://b/x.nc", None);

        let CacheLookup::Hit { path, entry } = lookup else {
            panic!("expected hit, got {:?}", lookup);
        };
        assert_eq!(fs::read(&path).unwrap(), b"CDF\x01 payload");
        assert_eq!(entry.size_bytes, 13);
        assert_eq!(entry.source_uri, "s3://b/x.nc");
        // Source is copied, never moved
        assert!(src.exists());
    }

    #[test]
    fn test_replaced_record_is_not_current() {
        let temp_dir = TempDir::new().unwrap();
        let store = make_store(&temp_dir, CacheConfig::default());
        let src = source_file(&temp_dir, "a.nc", 8);
        store.put_at("s3://b/x.nc", &src, Some("v1"), at(0)).unwrap();

        let layout = layout(&store);
        let key = CacheKey::derive("s3://b/x.nc");
        let meta_path = layout.meta_path(&key);
        let entry = CacheEntry::decode(&fs::read(&meta_path).unwrap()).unwrap();
        assert!(still_committed(&meta_path, &entry));

        // A hit refreshing last_validated is the same admission
        let mut touched = entry.clone();
        touched.last_validated_at = at(30);
        write_meta(&layout, &touched).unwrap();
        assert!(still_committed(&meta_path, &entry));

        // Same-size replacement by another writer is not
        store.put_at("s3://b/x.nc", &src, Some("v2"), at(60)).unwrap();
        assert!(!still_committed(&meta_path, &entry));

        // Nor is an uncommitted slot
        fs::remove_file(&meta_path).unwrap();
        assert!(!still_committed(&meta_path, &entry));
    }

    #[test]
    fn test_lookup_unknown_is_miss() {
        let temp_dir = TempDir::new().unwrap();
        let store = make_store(&temp_dir, CacheConfig::default());

        assert_eq!(
            store.lookup("s3://b/never.nc", None),
            CacheLookup::Miss(MissReason::NotCached)
        );
    }

    #[test]
    fn test_disabled_store_is_inert() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("cache");
        let mut store = CacheStore::new(CacheConfig::disabled().with_root(&root));
        store.init().unwrap();
        let src = source_file(&temp_dir, "a.nc", 10);

        store.put("s3://b/x.nc", &src, None).unwrap();

        assert!(!root.exists());
        assert_eq!(
            store.lookup("s3://b/x.nc", None),
            CacheLookup::Miss(MissReason::Disabled)
        );
        assert_eq!(store.evict().unwrap(), EvictionReport::default());
        store.clear().unwrap();
    }

    #[test]
    fn test_uninitialized_store_misses() {
        let temp_dir = TempDir::new().unwrap();
        let store = CacheStore::new(CacheConfig::default().with_root(temp_dir.path()));
        assert!(!store.is_active());
        assert_eq!(
            store.lookup("s3://b/x.nc", None),
            CacheLookup::Miss(MissReason::Disabled)
        );
    }

    #[test]
    fn test_unusable_root_degrades() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("blocker");
        fs::write(&blocker, "file, not dir").unwrap();

        let mut store = CacheStore::new(CacheConfig::default().with_root(blocker.join("cache")));
        assert!(matches!(store.init(), Err(StoreError::Config(_))));
        assert!(!store.is_active());

        let src = source_file(&temp_dir, "a.nc", 4);
        store.put("s3://b/x.nc", &src, None).unwrap();
        assert_eq!(
            store.lookup("s3://b/x.nc", None),
            CacheLookup::Miss(MissReason::Disabled)
        );
    }

    #[test]
    fn test_init_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let mut store = make_store(&temp_dir, CacheConfig::default());
        let src = source_file(&temp_dir, "a.nc", 4);
        store.put("s3://b/x.nc", &src, None).unwrap();

        store.init().unwrap();

        assert!(store.lookup("s3://b/x.nc", None).is_hit());
    }

    #[test]
    fn test_ttl_expiry_forces_miss() {
        let temp_dir = TempDir::new().unwrap();
        let config = CacheConfig {
            ttl_seconds: 60,
            ..CacheConfig::default()
        };
        let store = make_store(&temp_dir, config);
        let src = source_file(&temp_dir, "a.nc", 4);

        store.put_at("s3://b/x.nc", &src, None, at(0)).unwrap();

        assert!(store.lookup_at("s3://b/x.nc", None, at(60)).is_hit());
        assert_eq!(
            store.lookup_at("s3://b/x.nc", None, at(61)),
            CacheLookup::Miss(MissReason::Expired)
        );
    }

    #[test]
    fn test_integrity_token_mismatch_forces_miss() {
        let temp_dir = TempDir::new().unwrap();
        let config = CacheConfig {
            validate_integrity_token: true,
            ..CacheConfig::default()
        };
        let store = make_store(&temp_dir, config);
        let src = source_file(&temp_dir, "a.nc", 4);

        store.put("s3://b/x.nc", &src, Some("etag-1")).unwrap();

        assert!(store.lookup("s3://b/x.nc", Some("etag-1")).is_hit());
        assert!(store.lookup("s3://b/x.nc", None).is_hit());
        assert_eq!(
            store.lookup("s3://b/x.nc", Some("etag-2")),
            CacheLookup::Miss(MissReason::IntegrityMismatch)
        );
    }

    #[test]
    fn test_integrity_token_ignored_when_validation_off() {
        let temp_dir = TempDir::new().unwrap();
        let store = make_store(&temp_dir, CacheConfig::default());
        let src = source_file(&temp_dir, "a.nc", 4);

        store.put("s3://b/x.nc", &src, Some("etag-1")).unwrap();

        assert!(store.lookup("s3://b/x.nc", Some("etag-2")).is_hit());
    }

    #[test]
    fn test_hit_refreshes_last_validated() {
        let temp_dir = TempDir::new().unwrap();
        let store = make_store(&temp_dir, CacheConfig::default());
        let src = source_file(&temp_dir, "a.nc", 4);
        store.put_at("s3://b/x.nc", &src, None, at(0)).unwrap();

        let CacheLookup::Hit { entry, .. } = store.lookup_at("s3://b/x.nc", None, at(30)) else {
            panic!("expected hit");
        };
        assert_eq!(entry.cached_at, at(0));
        assert_eq!(entry.last_validated_at, at(30));

        let stored = store.entries().unwrap();
        assert_eq!(stored[0].last_validated_at, at(30));
    }

    #[test]
    fn test_metadata_without_blob_is_miss_and_cleaned() {
        let temp_dir = TempDir::new().unwrap();
        let store = make_store(&temp_dir, CacheConfig::default());
        let src = source_file(&temp_dir, "a.nc", 4);
        store.put("s3://b/x.nc", &src, None).unwrap();

        let key = CacheKey::derive("s3://b/x.nc");
        fs::remove_file(layout(&store).blob_path(&key)).unwrap();

        assert_eq!(
            store.lookup("s3://b/x.nc", None),
            CacheLookup::Miss(MissReason::Corrupt)
        );
        assert!(!layout(&store).meta_path(&key).exists());
    }

    #[test]
    fn test_blob_without_metadata_is_miss_and_cleaned() {
        let temp_dir = TempDir::new().unwrap();
        let store = make_store(&temp_dir, CacheConfig::default());
        let key = CacheKey::derive("s3://b/x.nc");
        fs::write(layout(&store).blob_path(&key), b"half-written").unwrap();

        assert_eq!(
            store.lookup("s3://b/x.nc", None),
            CacheLookup::Miss(MissReason::Corrupt)
        );
        assert!(!layout(&store).blob_path(&key).exists());
    }

    #[test]
    fn test_undecodable_metadata_is_miss() {
        let temp_dir = TempDir::new().unwrap();
        let store = make_store(&temp_dir, CacheConfig::default());
        let src = source_file(&temp_dir, "a.nc", 4);
        store.put("s3://b/x.nc", &src, None).unwrap();

        let key = CacheKey::derive("s3://b/x.nc");
        fs::write(layout(&store).meta_path(&key), "size=4\n").unwrap();

        assert_eq!(
            store.lookup("s3://b/x.nc", None),
            CacheLookup::Miss(MissReason::Corrupt)
        );

        // The slot is reusable afterwards
        store.put("s3://b/x.nc", &src, None).unwrap();
        assert!(store.lookup("s3://b/x.nc", None).is_hit());
    }

    #[test]
    fn test_size_mismatch_is_miss() {
        let temp_dir = TempDir::new().unwrap();
        let store = make_store(&temp_dir, CacheConfig::default());
        let src = source_file(&temp_dir, "a.nc", 4);
        store.put("s3://b/x.nc", &src, None).unwrap();

        let key = CacheKey::derive("s3://b/x.nc");
        fs::write(layout(&store).blob_path(&key), b"truncated? no, longer").unwrap();

        assert_eq!(
            store.lookup("s3://b/x.nc", None),
            CacheLookup::Miss(MissReason::Corrupt)
        );
    }

    #[test]
    fn test_put_replaces_previous_entry() {
        let temp_dir = TempDir::new().unwrap();
        let store = make_store(&temp_dir, CacheConfig::default());
        let first = source_file(&temp_dir, "a.nc", 4);
        let second = source_file(&temp_dir, "b.nc", 9);

        store.put("s3://b/x.nc", &first, Some("v1")).unwrap();
        store.put("s3://b/x.nc", &second, Some("v2")).unwrap();

        let CacheLookup::Hit { path, entry } = store.lookup("s3://b/x.nc", None) else {
            panic!("expected hit");
        };
        assert_eq!(fs::read(path).unwrap().len(), 9);
        assert_eq!(entry.integrity_token.as_deref(), Some("v2"));
        assert_eq!(store.stats().unwrap().entries, 1);
    }

    #[test]
    fn test_put_missing_source_fails_and_leaves_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let store = make_store(&temp_dir, CacheConfig::default());

        let err = store
            .put("s3://b/x.nc", &temp_dir.path().join("absent.nc"), None)
            .unwrap_err();

        assert!(matches!(err, StoreError::CopyFailed { .. }));
        assert_eq!(fs::read_dir(layout(&store).files_dir()).unwrap().count(), 0);
        assert_eq!(fs::read_dir(layout(&store).tmp_dir()).unwrap().count(), 0);
        assert!(!store.lookup("s3://b/x.nc", None).is_hit());
    }

    #[test]
    fn test_remove() {
        let temp_dir = TempDir::new().unwrap();
        let store = make_store(&temp_dir, CacheConfig::default());
        let src = source_file(&temp_dir, "a.nc", 4);
        store.put("s3://b/x.nc", &src, None).unwrap();

        assert!(store.remove("s3://b/x.nc").unwrap());
        assert!(!store.remove("s3://b/x.nc").unwrap());
        assert!(!store.lookup("s3://b/x.nc", None).is_hit());
    }

    #[test]
    fn test_clear_empties_directories() {
        let temp_dir = TempDir::new().unwrap();
        let store = make_store(&temp_dir, CacheConfig::default());
        let a = source_file(&temp_dir, "a.nc", 4);
        let b = source_file(&temp_dir, "b.nc", 5);
        store.put("s3://b/x.nc", &a, None).unwrap();
        store.put("s3://b/y.nc", &b, None).unwrap();

        store.clear().unwrap();

        assert_eq!(store.lookup("s3://b/x.nc", None), CacheLookup::Miss(MissReason::NotCached));
        assert_eq!(store.lookup("s3://b/y.nc", None), CacheLookup::Miss(MissReason::NotCached));
        assert_eq!(fs::read_dir(layout(&store).files_dir()).unwrap().count(), 0);
        assert_eq!(fs::read_dir(layout(&store).meta_dir()).unwrap().count(), 0);

        // Clearing an empty cache is fine
        store.clear().unwrap();
    }

    #[test]
    fn test_evict_ttl_first() {
        let temp_dir = TempDir::new().unwrap();
        let config = CacheConfig {
            ttl_seconds: 100,
            max_size_bytes: 0,
            ..CacheConfig::default()
        };
        let store = make_store(&temp_dir, config);
        let src = source_file(&temp_dir, "a.nc", 10);

        store.put_at("s3://b/old.nc", &src, None, at(0)).unwrap();
        store.put_at("s3://b/new.nc", &src, None, at(150)).unwrap();

        let report = store.evict_at(at(200)).unwrap();

        assert_eq!(report.scanned, 2);
        assert_eq!(report.expired, 1);
        assert_eq!(report.evicted_lru, 0);
        assert_eq!(report.bytes_reclaimed, 10);
        assert_eq!(report.remaining_entries, 1);
        assert!(!store.lookup_at("s3://b/old.nc", None, at(200)).is_hit());
        assert!(store.lookup_at("s3://b/new.nc", None, at(200)).is_hit());
    }

    #[test]
    fn test_evict_lru_by_last_validated() {
        let temp_dir = TempDir::new().unwrap();
        let config = CacheConfig {
            ttl_seconds: 0,
            max_size_bytes: 25,
            ..CacheConfig::default()
        };
        let store = make_store(&temp_dir, config);
        let src = source_file(&temp_dir, "a.nc", 10);

        store.put_at("s3://b/a.nc", &src, None, at(0)).unwrap();
        store.put_at("s3://b/b.nc", &src, None, at(1)).unwrap();
        store.put_at("s3://b/c.nc", &src, None, at(2)).unwrap();
        // a is the oldest admission but the most recently used
        assert!(store.lookup_at("s3://b/a.nc", None, at(10)).is_hit());

        let report = store.evict_at(at(20)).unwrap();

        assert_eq!(report.evicted_lru, 1);
        assert_eq!(report.remaining_bytes, 20);
        assert!(store.lookup_at("s3://b/a.nc", None, at(21)).is_hit());
        assert!(!store.lookup_at("s3://b/b.nc", None, at(21)).is_hit());
        assert!(store.lookup_at("s3://b/c.nc", None, at(21)).is_hit());
    }

    #[test]
    fn test_evict_under_budget_keeps_everything() {
        let temp_dir = TempDir::new().unwrap();
        let config = CacheConfig {
            max_size_bytes: 1000,
            ..CacheConfig::default()
        };
        let store = make_store(&temp_dir, config);
        let src = source_file(&temp_dir, "a.nc", 10);
        store.put("s3://b/a.nc", &src, None).unwrap();

        let report = store.evict().unwrap();

        assert_eq!(report.evicted_lru + report.expired, 0);
        assert_eq!(report.remaining_entries, 1);
    }

    #[test]
    fn test_evict_reclaims_orphans_and_corrupt() {
        let temp_dir = TempDir::new().unwrap();
        let store = make_store(&temp_dir, CacheConfig::default());
        let l = layout(&store);

        let orphan = CacheKey::derive("s3://b/orphan.nc");
        fs::write(l.blob_path(&orphan), b"12345").unwrap();

        let broken = CacheKey::derive("s3://b/broken.nc");
        fs::write(l.meta_path(&broken), "not metadata at all\n").unwrap();

        // Unrelated files are left alone
        fs::write(l.files_dir().join("README"), b"keep").unwrap();

        let report = store.evict().unwrap();

        assert_eq!(report.orphans_removed, 1);
        assert_eq!(report.corrupt_removed, 1);
        assert!(!l.blob_path(&orphan).exists());
        assert!(!l.meta_path(&broken).exists());
        assert!(l.files_dir().join("README").exists());
    }

    #[test]
    #[cfg(unix)]
    fn test_evict_skips_locked_entries() {
        let temp_dir = TempDir::new().unwrap();
        let config = CacheConfig {
            max_size_bytes: 5,
            ..CacheConfig::default()
        };
        let store = make_store(&temp_dir, config);
        let src = source_file(&temp_dir, "a.nc", 10);
        store.put("s3://b/a.nc", &src, None).unwrap();

        let key = CacheKey::derive("s3://b/a.nc");
        let held = KeyLock::acquire(&layout(&store).lock_path(&key), Duration::from_secs(1)).unwrap();

        let report = store.evict().unwrap();
        assert_eq!(report.skipped_locked, 1);
        assert_eq!(report.evicted_lru, 0);
        drop(held);

        let report = store.evict().unwrap();
        assert_eq!(report.evicted_lru, 1);
        assert_eq!(report.remaining_bytes, 0);
    }

    #[test]
    fn test_stats() {
        let temp_dir = TempDir::new().unwrap();
        let store = make_store(&temp_dir, CacheConfig::default());
        let a = source_file(&temp_dir, "a.nc", 4);
        let b = source_file(&temp_dir, "b.nc", 6);
        store.put("s3://b/x.nc", &a, None).unwrap();
        store.put("s3://b/y.nc", &b, None).unwrap();

        let stats = store.stats().unwrap();
        assert!(stats.enabled);
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.total_bytes, 10);
        assert_eq!(stats.root.as_deref(), store.root());
    }
}
