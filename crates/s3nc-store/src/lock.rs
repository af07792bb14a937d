//! Per-key advisory locks
//!
//! Writers of a cache slot (put, cleanup of a dangling half, eviction,
//! removal) hold `<root>/locks/<key>.lock` so that processes sharing one
//! cache root never interleave a blob rename with another process's
//! metadata write. Readers do not lock: blob and metadata only ever appear
//! through atomic renames.
//!
//! The lock is released when the guard is dropped.
//!
//! On unix this is `flock`, which the kernel drops with the process. Other
//! platforms fall back to an exclusive-create lock file; one left behind by
//! a crashed process is broken once it is older than [`KeyLock::STALE_AFTER`].

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

/// Lock result type
pub type LockResult<T> = Result<T, LockError>;

/// Errors from lock operations
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock timeout after {timeout:?}: {path}")]
    Timeout { path: PathBuf, timeout: Duration },

    #[error("I/O error on lock {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

/// Exclusive advisory lock on one cache key.
#[derive(Debug)]
pub struct KeyLock {
    lock_path: PathBuf,
    lock_file: File,
}

impl KeyLock {
    /// Age after which an exclusive-create lock file is presumed abandoned.
    pub const STALE_AFTER: Duration = Duration::from_secs(600);

    /// Acquire the lock file at `lock_path`, waiting up to `timeout`.
    ///
    /// Creates the parent directory and lock file if they don't exist.
    pub fn acquire(lock_path: &Path, timeout: Duration) -> LockResult<Self> {
        let io_err = |source| LockError::Io {
            path: lock_path.to_path_buf(),
            source,
        };

        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let start = Instant::now();
        let poll_interval = Duration::from_millis(10);
        let mut warned = false;

        loop {
            match Self::try_acquire_exclusive(lock_path) {
                Ok(file) => {
                    if warned {
                        debug!(
                            lock = %lock_path.display(),
                            waited_ms = start.elapsed().as_millis() as u64,
                            "lock acquired after contention"
                        );
                    }
                    return Ok(Self {
                        lock_path: lock_path.to_path_buf(),
                        lock_file: file,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !warned && start.elapsed() > Duration::from_millis(500) {
                        warn!(lock = %lock_path.display(), "lock contention, waiting");
                        warned = true;
                    }
                }
                Err(e) => return Err(io_err(e)),
            }

            if start.elapsed() >= timeout {
                return Err(LockError::Timeout {
                    path: lock_path.to_path_buf(),
                    timeout,
                });
            }

            std::thread::sleep(poll_interval);
        }
    }

    /// Try once without waiting. `Ok(None)` means someone else holds it.
    pub fn try_acquire(lock_path: &Path) -> LockResult<Option<Self>> {
        match Self::acquire(lock_path, Duration::ZERO) {
            Ok(lock) => Ok(Some(lock)),
            Err(LockError::Timeout { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[cfg(unix)]
    fn try_acquire_exclusive(lock_path: &Path) -> io::Result<File> {
        use std::os::unix::fs::OpenOptionsExt;
        use std::os::unix::io::AsRawFd;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(lock_path)?;

        // SAFETY: fd is owned by `file`, which outlives this call.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };

        if result == 0 {
            Ok(file)
        } else {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
            } else {
                Err(err)
            }
        }
    }

    #[cfg(not(unix))]
    fn try_acquire_exclusive(lock_path: &Path) -> io::Result<File> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)
        {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if is_stale(lock_path, Self::STALE_AFTER) {
                    warn!(lock = %lock_path.display(), "breaking stale lock file");
                    let _ = fs::remove_file(lock_path);
                    return OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .open(lock_path)
                        .map_err(|e| match e.kind() {
                            io::ErrorKind::AlreadyExists => {
                                io::Error::new(io::ErrorKind::WouldBlock, "lock held")
                            }
                            _ => e,
                        });
                }
                Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
            }
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: the descriptor is still open; closing the file would
            // release it anyway.
            unsafe {
                libc::flock(self.lock_file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}

/// Whether the file at `path` was last modified more than `max_age` ago.
#[cfg(any(not(unix), test))]
fn is_stale(path: &Path, max_age: Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > max_age)
}
