//! Per-repository advisory lock
//!
//! Operations that mutate shared repository state take an exclusive
//! `flock` on `<lock_dir>/<sr_uuid>`. The lock is released when the guard
//! is dropped.

use crate::error::{Error, Result};
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Held exclusive lock on one repository
pub struct RepositoryLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl RepositoryLock {
    /// Block until the lock for `sr_uuid` is ours
    pub async fn acquire(lock_dir: &Path, sr_uuid: &str) -> Result<Self> {
        let path = lock_dir.join(sr_uuid);
        let lock_dir = lock_dir.to_path_buf();
        let target = path.clone();

        let lock = tokio::task::spawn_blocking(move || -> Result<Flock<File>> {
            std::fs::create_dir_all(&lock_dir).map_err(|e| Error::Lock {
                path: lock_dir.display().to_string(),
                reason: e.to_string(),
            })?;
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&target)
                .map_err(|e| Error::Lock {
                    path: target.display().to_string(),
                    reason: e.to_string(),
                })?;
            Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| Error::Lock {
                path: target.display().to_string(),
                reason: errno.to_string(),
            })
        })
        .await
        .map_err(|e| Error::Internal(format!("lock task failed: {}", e)))??;

        debug!("Acquired repository lock {}", path.display());
        Ok(Self { _lock: lock, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RepositoryLock {
    fn drop(&mut self) {
        debug!("Releasing repository lock {}", self.path.display());
    }
}

/// Try to take the lock without blocking; `None` if someone else holds it
pub fn try_acquire(lock_dir: &Path, sr_uuid: &str) -> Result<Option<RepositoryLock>> {
    let path = lock_dir.join(sr_uuid);
    std::fs::create_dir_all(lock_dir)?;
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)?;

    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => Ok(Some(RepositoryLock { _lock: lock, path })),
        Err((_, nix::errno::Errno::EWOULDBLOCK)) => {
            warn!("Repository lock {} is held elsewhere", path.display());
            Ok(None)
        }
        Err((_, errno)) => Err(Error::Lock {
            path: path.display().to_string(),
            reason: errno.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let dir = TempDir::new().unwrap();

        let held = RepositoryLock::acquire(dir.path(), "sr-1").await.unwrap();
        assert!(held.path().ends_with("sr-1"));
        assert!(try_acquire(dir.path(), "sr-1").unwrap().is_none());

        // Other repositories are unaffected
        assert!(try_acquire(dir.path(), "sr-2").unwrap().is_some());

        drop(held);
        assert!(try_acquire(dir.path(), "sr-1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_lock_creates_directory() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("locks").join("sm");
        let lock = RepositoryLock::acquire(&nested, "sr-1").await.unwrap();
        assert!(nested.join("sr-1").exists());
        drop(lock);
    }
}
