//! Scratch-file ownership tracking
//!
//! Every scratch file materialized for a remote object is registered
//! against the resource id the format library hands back from `open`.
//! Releasing the id deletes the file exactly once, unless the file is the
//! cache's own blob, which only eviction or a clear may remove.
//!
//! The table is bounded: registering beyond `capacity` active records is
//! an error, capping the scratch files a process can hold at once.
//!
//! Released ids are remembered (up to `capacity` of them) so a defensive
//! second close is a quiet no-op instead of an "unmanaged" warning.

use std::collections::{HashMap, VecDeque};
use std::fmt::Display;
use std::fs;
use std::hash::Hash;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, warn};

/// Handle registry result type
pub type HandleResult<T> = Result<T, HandleError>;

/// Errors from the handle registry.
#[derive(Debug, Error)]
pub enum HandleError {
    #[error("too many open files: all {capacity} handle slots are in use")]
    Exhausted { capacity: usize },

    #[error("resource id {0} is already registered")]
    DuplicateId(String),

    #[error("failed to remove scratch file {path}: {source}")]
    Cleanup { path: PathBuf, source: io::Error },
}

/// What [`HandleRegistry::release`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Scratch file deleted
    Deleted(PathBuf),
    /// File belongs to the cache and was left in place
    Retained(PathBuf),
    /// Id was released before; nothing to do
    AlreadyReleased,
    /// Id was never registered; the caller should clean up on its own
    Unmanaged,
}

/// One registered scratch file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleRecord<K> {
    pub resource_id: K,
    pub temp_path: PathBuf,
    /// `temp_path` is the cache's own blob and must survive release
    pub owns_cache_copy: bool,
    pub active: bool,
}

#[derive(Debug)]
struct Table<K> {
    records: HashMap<K, HandleRecord<K>>,
    active: usize,
    /// Released ids, oldest first
    released: VecDeque<K>,
}

/// Bounded, thread-safe map from resource id to scratch file.
#[derive(Debug)]
pub struct HandleRegistry<K = String>
where
    K: Eq + Hash + Clone + Display,
{
    capacity: usize,
    table: Mutex<Table<K>>,
}

impl<K> HandleRegistry<K>
where
    K: Eq + Hash + Clone + Display,
{
    /// Create a registry allowing `capacity` simultaneously active records.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            table: Mutex::new(Table {
                records: HashMap::new(),
                active: 0,
                released: VecDeque::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of active records.
    pub fn active_count(&self) -> usize {
        self.lock().active
    }

    /// Register `temp_path` under `resource_id`.
    pub fn acquire(
        &self,
        resource_id: K,
        temp_path: impl Into<PathBuf>,
        owns_cache_copy: bool,
    ) -> HandleResult<()> {
        let mut table = self.lock();

        match table.records.get(&resource_id).map(|r| r.active) {
            Some(true) => return Err(HandleError::DuplicateId(resource_id.to_string())),
            Some(false) => table.released.retain(|id| id != &resource_id),
            None => {}
        }
        if table.active >= self.capacity {
            return Err(HandleError::Exhausted {
                capacity: self.capacity,
            });
        }

        let record = HandleRecord {
            resource_id: resource_id.clone(),
            temp_path: temp_path.into(),
            owns_cache_copy,
            active: true,
        };
        debug!(id = %resource_id, path = %record.temp_path.display(), owns_cache_copy, "handle registered");
        table.records.insert(resource_id, record);
        table.active += 1;
        Ok(())
    }

    /// The active record for `resource_id`, if any.
    pub fn get(&self, resource_id: &K) -> Option<HandleRecord<K>> {
        self.lock()
            .records
            .get(resource_id)
            .filter(|r| r.active)
            .cloned()
    }

    /// Scratch path registered for `resource_id`, if active.
    pub fn path_of(&self, resource_id: &K) -> Option<PathBuf> {
        self.get(resource_id).map(|r| r.temp_path)
    }

    /// Release `resource_id`, deleting its scratch file unless the cache owns it.
    ///
    /// The record is deactivated before the file is touched, so concurrent
    /// releases of one id delete at most once. If the delete fails the
    /// record is reinstated and a later release retries it.
    pub fn release(&self, resource_id: &K) -> HandleResult<ReleaseOutcome> {
        let (path, owns_cache_copy) = {
            let mut table = self.lock();
            let Some(record) = table.records.get_mut(resource_id) else {
                warn!(id = %resource_id, "release of unmanaged resource");
                return Ok(ReleaseOutcome::Unmanaged);
            };
            if !record.active {
                return Ok(ReleaseOutcome::AlreadyReleased);
            }
            record.active = false;
            let released = (record.temp_path.clone(), record.owns_cache_copy);
            table.active -= 1;
            table.released.retain(|id| id != resource_id);
            table.released.push_back(resource_id.clone());
            self.prune(&mut table);
            released
        };

        if owns_cache_copy {
            debug!(id = %resource_id, path = %path.display(), "released cache-owned file");
            return Ok(ReleaseOutcome::Retained(path));
        }

        if let Err(e) = remove_scratch(&path) {
            self.reinstate(resource_id, &path);
            return Err(e);
        }
        debug!(id = %resource_id, path = %path.display(), "released and removed scratch file");
        Ok(ReleaseOutcome::Deleted(path))
    }

    /// Release every active record. Returns how many were released; cleanup
    /// failures are logged and those records stay active.
    pub fn release_all(&self) -> usize {
        let ids: Vec<K> = self
            .lock()
            .records
            .values()
            .filter(|r| r.active)
            .map(|r| r.resource_id.clone())
            .collect();

        let mut released = 0;
        for id in ids {
            match self.release(&id) {
                Ok(ReleaseOutcome::Deleted(_) | ReleaseOutcome::Retained(_)) => released += 1,
                Ok(_) => {}
                Err(e) => {
                    warn!(id = %id, error = %e, "scratch cleanup failed");
                }
            }
        }
        released
    }

    /// Make a record whose scratch file could not be deleted active again,
    /// so a later release (or drop) retries the delete.
    fn reinstate(&self, resource_id: &K, path: &Path) {
        let mut table = self.lock();
        let table = &mut *table;
        match table.records.get_mut(resource_id) {
            Some(record) if !record.active && record.temp_path == path => {
                record.active = true;
                table.active += 1;
                table.released.retain(|id| id != resource_id);
            }
            _ => warn!(id = %resource_id, path = %path.display(), "id reused before failed cleanup could be retried"),
        }
    }

    /// Forget the oldest released ids beyond `capacity` of them.
    fn prune(&self, table: &mut Table<K>) {
        while table.released.len() > self.capacity {
            let Some(id) = table.released.pop_front() else {
                break;
            };
            if table.records.get(&id).is_some_and(|r| !r.active) {
                table.records.remove(&id);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table<K>> {
        // Table updates never leave it half-modified, so a poisoned lock
        // still guards consistent data.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K> Drop for HandleRegistry<K>
where
    K: Eq + Hash + Clone + Display,
{
    fn drop(&mut self) {
        let released = self.release_all();
        if released > 0 {
            debug!(released, "handle registry dropped with open scratch files");
        }
    }
}

/// Delete a scratch file; an already-missing file counts as removed.
fn remove_scratch(path: &Path) -> HandleResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(HandleError::Cleanup {
            path: path.to_path_buf(),
            source,
        }),
    }
}
