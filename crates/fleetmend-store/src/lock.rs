//! Named exclusive locks over `flock(2)`.
//!
//! A lock is the file `<dir>/<sanitized name>.lock`. The lock is held by an
//! open file description, so it is released when the [`LockGuard`] drops
//! (early return, `?`, panic unwind) or when the process dies. Locks are
//! not reentrant: acquiring a name already held, even from the same task,
//! waits for the first guard.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fleetmend_core::fsutil::sanitize_component;
use fs2::FileExt;
use tracing::{debug, trace};

use crate::error::{StoreError, StoreResult};

const DEFAULT_POLL: Duration = Duration::from_millis(50);

/// Hands out named locks rooted at one directory.
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    poll: Duration,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            poll: DEFAULT_POLL,
        }
    }

    /// Interval between `try_lock` attempts while waiting.
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", sanitize_component(name)))
    }

    /// Try once; `None` when someone else holds it.
    pub fn try_acquire(&self, name: &str) -> StoreResult<Option<LockGuard>> {
        let path = self.path_for(name);
        let file = open_lock_file(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                trace!(lock = %name, "lock acquired");
                Ok(Some(LockGuard {
                    file,
                    name: name.to_string(),
                }))
            }
            Err(e) if is_contended(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Wait for the lock, up to `timeout` when given.
    pub async fn acquire(&self, name: &str, timeout: Option<Duration>) -> StoreResult<LockGuard> {
        let started = Instant::now();
        loop {
            if let Some(guard) = self.try_acquire(name)? {
                return Ok(guard);
            }
            if let Some(limit) = timeout {
                if started.elapsed() >= limit {
                    debug!(lock = %name, ?limit, "lock wait timed out");
                    return Err(StoreError::LockTimeout {
                        name: name.to_string(),
                        timeout: limit,
                    });
                }
            }
            tokio::time::sleep(self.poll).await;
        }
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Holds a named lock until dropped.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    name: String,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Closing the descriptor releases the lock too; unlock explicitly so
        // release does not depend on descriptor lifetime.
        let _ = FileExt::unlock(&self.file);
        trace!(lock = %self.name, "lock released");
    }
}
