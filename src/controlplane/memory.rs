//! In-Memory Control Plane
//!
//! Keeps repository records in process memory. Besides backing tests, it
//! can simulate other hosts racing on the allocation counter and inject
//! failures into individual calls.

use super::RepositoryRecord;
use crate::domain::ports::{ControlPlane, DiskRecord, RepositoryStats};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use tracing::debug;

/// Control plane kept entirely in memory
pub struct MemoryControlPlane {
    host: String,
    repositories: RwLock<BTreeMap<String, RepositoryRecord>>,
    /// Calls whose next invocation fails
    faults: Mutex<Vec<String>>,
    /// Allocation writes by "other hosts", applied just before the next CAS
    interference: Mutex<Vec<(String, i64)>>,
}

impl MemoryControlPlane {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            repositories: RwLock::new(BTreeMap::new()),
            faults: Mutex::new(Vec::new()),
            interference: Mutex::new(Vec::new()),
        }
    }

    /// Make the next call of `operation` fail (e.g. `"virtual_allocation"`)
    pub fn fail_next(&self, operation: &str) {
        self.faults.lock().push(operation.to_string());
    }

    /// Have another host change the counter right before the next CAS
    pub fn interfere_next_cas(&self, sr_uuid: &str, delta: i64) {
        self.interference.lock().push((sr_uuid.to_string(), delta));
    }

    /// Change the counter directly, as another host would
    pub fn adjust_allocation(&self, sr_uuid: &str, delta: i64) {
        let mut repos = self.repositories.write();
        let record = repos
            .entry(sr_uuid.to_string())
            .or_insert_with(|| RepositoryRecord::new(sr_uuid));
        record.virtual_allocation = apply_delta(record.virtual_allocation, delta);
    }

    /// Snapshot of a repository record
    pub fn record(&self, sr_uuid: &str) -> Option<RepositoryRecord> {
        self.repositories.read().get(sr_uuid).cloned()
    }

    /// Published statistics of a repository
    pub fn stats(&self, sr_uuid: &str) -> Option<RepositoryStats> {
        self.record(sr_uuid).map(|r| r.stats())
    }

    fn check_fault(&self, operation: &str) -> Result<()> {
        let mut faults = self.faults.lock();
        if let Some(pos) = faults.iter().position(|f| f == operation) {
            faults.remove(pos);
            return Err(Error::ControlPlane(format!(
                "injected failure in {}",
                operation
            )));
        }
        Ok(())
    }

    fn with_record<T>(
        &self,
        sr_uuid: &str,
        f: impl FnOnce(&mut RepositoryRecord) -> Result<T>,
    ) -> Result<T> {
        let mut repos = self.repositories.write();
        let record = repos
            .entry(sr_uuid.to_string())
            .or_insert_with(|| RepositoryRecord::new(sr_uuid));
        f(record)
    }
}

fn apply_delta(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta as u64)
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

#[async_trait]
impl ControlPlane for MemoryControlPlane {
    async fn current_host(&self) -> Result<String> {
        self.check_fault("current_host")?;
        Ok(self.host.clone())
    }

    async fn virtual_allocation(&self, sr_uuid: &str) -> Result<u64> {
        self.check_fault("virtual_allocation")?;
        Ok(self
            .repositories
            .read()
            .get(sr_uuid)
            .map(|r| r.virtual_allocation)
            .unwrap_or(0))
    }

    async fn compare_and_set_virtual_allocation(
        &self,
        sr_uuid: &str,
        expected: u64,
        new: u64,
    ) -> Result<bool> {
        self.check_fault("compare_and_set_virtual_allocation")?;

        let pending = {
            let mut interference = self.interference.lock();
            interference
                .iter()
                .position(|(sr, _)| sr == sr_uuid)
                .map(|pos| interference.remove(pos))
        };
        if let Some((_, delta)) = pending {
            debug!("Simulating concurrent allocation change of {} on {}", delta, sr_uuid);
            self.adjust_allocation(sr_uuid, delta);
        }

        self.with_record(sr_uuid, |r| Ok(r.compare_and_set(expected, new)))
    }

    async fn publish_stats(&self, sr_uuid: &str, stats: &RepositoryStats) -> Result<()> {
        self.check_fault("publish_stats")?;
        self.with_record(sr_uuid, |r| {
            r.publish(stats);
            Ok(())
        })
    }

    async fn introduce_disk(&self, record: DiskRecord) -> Result<()> {
        self.check_fault("introduce_disk")?;
        let sr_uuid = record.sr_uuid.clone();
        self.with_record(&sr_uuid, |r| r.introduce(record))
    }

    async fn update_disk(&self, record: &DiskRecord) -> Result<()> {
        self.check_fault("update_disk")?;
        self.with_record(&record.sr_uuid, |r| r.update(record))
    }

    async fn forget_disk(&self, sr_uuid: &str, uuid: &str) -> Result<()> {
        self.check_fault("forget_disk")?;
        self.with_record(sr_uuid, |r| {
            r.disks.remove(uuid);
            r.touch();
            Ok(())
        })
    }

    async fn get_disk(&self, sr_uuid: &str, uuid: &str) -> Result<Option<DiskRecord>> {
        Ok(self
            .repositories
            .read()
            .get(sr_uuid)
            .and_then(|r| r.disks.get(uuid).cloned()))
    }

    async fn list_disks(&self, sr_uuid: &str) -> Result<Vec<DiskRecord>> {
        self.check_fault("list_disks")?;
        Ok(self
            .repositories
            .read()
            .get(sr_uuid)
            .map(|r| r.disks.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn disk_config_get(
        &self,
        sr_uuid: &str,
        uuid: &str,
        key: &str,
    ) -> Result<Option<String>> {
        Ok(self
            .repositories
            .read()
            .get(sr_uuid)
            .and_then(|r| r.disks.get(uuid))
            .and_then(|d| d.config.get(key).cloned()))
    }

    async fn disk_config_set(
        &self,
        sr_uuid: &str,
        uuid: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        self.check_fault("disk_config_set")?;
        self.with_record(sr_uuid, |r| {
            r.disk_mut(uuid)?
                .config
                .insert(key.to_string(), value.to_string());
            r.touch();
            Ok(())
        })
    }

    async fn disk_config_remove(&self, sr_uuid: &str, uuid: &str, key: &str) -> Result<()> {
        self.with_record(sr_uuid, |r| {
            if let Some(disk) = r.disks.get_mut(uuid) {
                disk.config.remove(key);
            }
            r.touch();
            Ok(())
        })
    }

    async fn repository_config_set(&self, sr_uuid: &str, key: &str, value: &str) -> Result<()> {
        self.with_record(sr_uuid, |r| {
            r.config.insert(key.to_string(), value.to_string());
            r.touch();
            Ok(())
        })
    }

    async fn device_claimed_by_other(&self, sr_uuid: &str, device: &str) -> Result<bool> {
        Ok(self
            .repositories
            .read()
            .values()
            .any(|r| r.sr_uuid != sr_uuid && r.claims(device)))
    }
}
