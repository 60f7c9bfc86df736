//! State-File Control Plane
//!
//! Persists each repository as `<state_dir>/<sr_uuid>.json`. Every
//! read-modify-write runs under an exclusive `flock` on a sidecar
//! `<sr_uuid>.json.lock`, so several processes on one host (or hosts
//! sharing the directory) see a consistent counter. Writes go to a
//! temporary file that is renamed into place.

use super::RepositoryRecord;
use crate::domain::ports::{ControlPlane, DiskRecord, RepositoryStats};
use crate::error::{Error, Result};
use async_trait::async_trait;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Control plane backed by JSON files in a state directory
pub struct StateFileControlPlane {
    state_dir: PathBuf,
    host: String,
}

impl StateFileControlPlane {
    pub fn new(state_dir: impl Into<PathBuf>, host: impl Into<String>) -> Self {
        Self {
            state_dir: state_dir.into(),
            host: host.into(),
        }
    }

    fn record_path(&self, sr_uuid: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", sr_uuid))
    }

    /// Run `f` on the record under the file lock, writing it back if `f`
    /// succeeds and `write` is set
    async fn locked<T, F>(&self, sr_uuid: &str, write: bool, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut RepositoryRecord) -> Result<T> + Send + 'static,
    {
        let path = self.record_path(sr_uuid);
        let state_dir = self.state_dir.clone();
        let sr_uuid = sr_uuid.to_string();

        tokio::task::spawn_blocking(move || -> Result<T> {
            std::fs::create_dir_all(&state_dir)?;
            let _lock = lock_file(&path)?;

            let mut record =
                read_record(&path)?.unwrap_or_else(|| RepositoryRecord::new(&sr_uuid));
            let out = f(&mut record)?;
            if write {
                write_record(&path, &record)?;
            }
            Ok(out)
        })
        .await
        .map_err(|e| Error::ControlPlane(format!("state file task failed: {}", e)))?
    }

    async fn read<T, F>(&self, sr_uuid: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut RepositoryRecord) -> Result<T> + Send + 'static,
    {
        self.locked(sr_uuid, false, f).await
    }

    async fn modify<T, F>(&self, sr_uuid: &str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut RepositoryRecord) -> Result<T> + Send + 'static,
    {
        self.locked(sr_uuid, true, f).await
    }
}

fn lock_file(path: &Path) -> Result<Flock<File>> {
    let lock_path = path.with_extension("json.lock");
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;
    Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| Error::Lock {
        path: lock_path.display().to_string(),
        reason: errno.to_string(),
    })
}

fn read_record(path: &Path) -> Result<Option<RepositoryRecord>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_record(path: &Path, record: &RepositoryRecord) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
    std::fs::rename(&tmp, path)?;
    debug!("Wrote state file {}", path.display());
    Ok(())
}

#[async_trait]
impl ControlPlane for StateFileControlPlane {
    async fn current_host(&self) -> Result<String> {
        Ok(self.host.clone())
    }

    async fn virtual_allocation(&self, sr_uuid: &str) -> Result<u64> {
        self.read(sr_uuid, |r| Ok(r.virtual_allocation)).await
    }

    async fn compare_and_set_virtual_allocation(
        &self,
        sr_uuid: &str,
        expected: u64,
        new: u64,
    ) -> Result<bool> {
        self.modify(sr_uuid, move |r| Ok(r.compare_and_set(expected, new)))
            .await
    }

    async fn publish_stats(&self, sr_uuid: &str, stats: &RepositoryStats) -> Result<()> {
        let stats = *stats;
        self.modify(sr_uuid, move |r| {
            r.publish(&stats);
            Ok(())
        })
        .await
    }

    async fn introduce_disk(&self, record: DiskRecord) -> Result<()> {
        let sr_uuid = record.sr_uuid.clone();
        self.modify(&sr_uuid, move |r| r.introduce(record)).await
    }

    async fn update_disk(&self, record: &DiskRecord) -> Result<()> {
        let record = record.clone();
        let sr_uuid = record.sr_uuid.clone();
        self.modify(&sr_uuid, move |r| r.update(&record)).await
    }

    async fn forget_disk(&self, sr_uuid: &str, uuid: &str) -> Result<()> {
        let uuid = uuid.to_string();
        self.modify(sr_uuid, move |r| {
            r.disks.remove(&uuid);
            r.touch();
            Ok(())
        })
        .await
    }

    async fn get_disk(&self, sr_uuid: &str, uuid: &str) -> Result<Option<DiskRecord>> {
        let uuid = uuid.to_string();
        self.read(sr_uuid, move |r| Ok(r.disks.get(&uuid).cloned()))
            .await
    }

    async fn list_disks(&self, sr_uuid: &str) -> Result<Vec<DiskRecord>> {
        self.read(sr_uuid, |r| Ok(r.disks.values().cloned().collect()))
            .await
    }

    async fn disk_config_get(
        &self,
        sr_uuid: &str,
        uuid: &str,
        key: &str,
    ) -> Result<Option<String>> {
        let (uuid, key) = (uuid.to_string(), key.to_string());
        self.read(sr_uuid, move |r| {
            Ok(r.disks.get(&uuid).and_then(|d| d.config.get(&key).cloned()))
        })
        .await
    }

    async fn disk_config_set(
        &self,
        sr_uuid: &str,
        uuid: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let (uuid, key, value) = (uuid.to_string(), key.to_string(), value.to_string());
        self.modify(sr_uuid, move |r| {
            r.disk_mut(&uuid)?.config.insert(key, value);
            r.touch();
            Ok(())
        })
        .await
    }

    async fn disk_config_remove(&self, sr_uuid: &str, uuid: &str, key: &str) -> Result<()> {
        let (uuid, key) = (uuid.to_string(), key.to_string());
        self.modify(sr_uuid, move |r| {
            if let Some(disk) = r.disks.get_mut(&uuid) {
                disk.config.remove(&key);
            }
            r.touch();
            Ok(())
        })
        .await
    }

    async fn repository_config_set(&self, sr_uuid: &str, key: &str, value: &str) -> Result<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.modify(sr_uuid, move |r| {
            r.config.insert(key, value);
            r.touch();
            Ok(())
        })
        .await
    }

    async fn device_claimed_by_other(&self, sr_uuid: &str, device: &str) -> Result<bool> {
        let pattern = self.state_dir.join("*.json");
        let pattern = pattern.to_string_lossy().into_owned();
        let (sr_uuid, device) = (sr_uuid.to_string(), device.to_string());

        tokio::task::spawn_blocking(move || -> Result<bool> {
            let paths = glob::glob(&pattern)
                .map_err(|e| Error::ControlPlane(format!("bad state pattern: {}", e)))?;
            for path in paths.flatten() {
                match read_record(&path) {
                    Ok(Some(record)) if record.sr_uuid != sr_uuid && record.claims(&device) => {
                        return Ok(true)
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Skipping unreadable state file {}: {}", path.display(), e),
                }
            }
            Ok(false)
        })
        .await
        .map_err(|e| Error::ControlPlane(format!("state scan task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::CLAIMED_DEVICE_KEY;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_records_persist_across_instances() {
        let dir = TempDir::new().unwrap();
        let cp = StateFileControlPlane::new(dir.path(), "host-1");

        cp.introduce_disk(DiskRecord::new("sr", "d1", 1024)).await.unwrap();
        cp.disk_config_set("sr", "d1", "host_host-1", "/dev/rbd3")
            .await
            .unwrap();
        assert!(cp.compare_and_set_virtual_allocation("sr", 0, 1024).await.unwrap());
        assert!(dir.path().join("sr.json").exists());

        let reopened = StateFileControlPlane::new(dir.path(), "host-1");
        assert_eq!(reopened.virtual_allocation("sr").await.unwrap(), 1024);
        let disk = reopened.get_disk("sr", "d1").await.unwrap().unwrap();
        assert_eq!(disk.size, 1024);
        assert_eq!(disk.config.get("host_host-1").map(String::as_str), Some("/dev/rbd3"));
    }

    #[tokio::test]
    async fn test_absent_repository_reads_defaults() {
        let dir = TempDir::new().unwrap();
        let cp = StateFileControlPlane::new(dir.path(), "host-1");
        assert_eq!(cp.virtual_allocation("nothing").await.unwrap(), 0);
        assert!(cp.list_disks("nothing").await.unwrap().is_empty());
        assert!(!dir.path().join("nothing.json").exists());
    }

    #[tokio::test]
    async fn test_device_claim_scan() {
        let dir = TempDir::new().unwrap();
        let cp = StateFileControlPlane::new(dir.path(), "host-1");
        cp.repository_config_set("sr-a", CLAIMED_DEVICE_KEY, "/dev/rbd0")
            .await
            .unwrap();

        assert!(cp.device_claimed_by_other("sr-b", "/dev/rbd0").await.unwrap());
        assert!(!cp.device_claimed_by_other("sr-a", "/dev/rbd0").await.unwrap());
    }

    #[tokio::test]
    async fn test_publish_stats_leaves_allocation() {
        let dir = TempDir::new().unwrap();
        let cp = StateFileControlPlane::new(dir.path(), "host-1");
        assert!(cp
            .compare_and_set_virtual_allocation("sr", 0, 30)
            .await
            .unwrap());

        let stats = RepositoryStats {
            physical_size: 100,
            physical_utilisation: 40,
            virtual_allocation: 10,
        };
        cp.publish_stats("sr", &stats).await.unwrap();
        assert_eq!(cp.virtual_allocation("sr").await.unwrap(), 30);

        // The counter on disk is unchanged as well
        let reopened = StateFileControlPlane::new(dir.path(), "host-1");
        assert_eq!(reopened.virtual_allocation("sr").await.unwrap(), 30);
    }
}
