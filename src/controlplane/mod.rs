//! Control Plane Adapters
//!
//! Implementations of [`ControlPlane`](crate::domain::ports::ControlPlane):
//! - MemoryControlPlane: in-process records, with contention and fault hooks
//! - StateFileControlPlane: one JSON document per repository on disk

pub mod memory;
pub mod state_file;

pub use memory::MemoryControlPlane;
pub use state_file::StateFileControlPlane;

use crate::domain::ports::{DiskRecord, RepositoryStats};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Repository-level side-table key recording the claimed block device
pub const CLAIMED_DEVICE_KEY: &str = "device";

// =============================================================================
// Repository Record
// =============================================================================

/// Everything the control plane persists about one repository
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRecord {
    pub sr_uuid: String,
    pub virtual_allocation: u64,
    pub physical_size: u64,
    pub physical_utilisation: u64,
    /// Repository-level side table
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub disks: BTreeMap<String, DiskRecord>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl RepositoryRecord {
    pub fn new(sr_uuid: impl Into<String>) -> Self {
        Self {
            sr_uuid: sr_uuid.into(),
            ..Default::default()
        }
    }

    pub fn stats(&self) -> RepositoryStats {
        RepositoryStats {
            physical_size: self.physical_size,
            physical_utilisation: self.physical_utilisation,
            virtual_allocation: self.virtual_allocation,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Some(Utc::now());
    }

    fn publish(&mut self, stats: &RepositoryStats) {
        self.physical_size = stats.physical_size;
        self.physical_utilisation = stats.physical_utilisation;
        self.touch();
    }

    fn compare_and_set(&mut self, expected: u64, new: u64) -> bool {
        if self.virtual_allocation != expected {
            return false;
        }
        self.virtual_allocation = new;
        self.touch();
        true
    }

    fn introduce(&mut self, record: DiskRecord) -> Result<()> {
        if self.disks.contains_key(&record.uuid) {
            return Err(Error::ControlPlane(format!(
                "VDI {} already exists in {}",
                record.uuid, self.sr_uuid
            )));
        }
        self.disks.insert(record.uuid.clone(), record);
        self.touch();
        Ok(())
    }

    fn update(&mut self, record: &DiskRecord) -> Result<()> {
        let slot = self
            .disks
            .get_mut(&record.uuid)
            .ok_or_else(|| Error::VolumeNotFound {
                uuid: record.uuid.clone(),
            })?;
        *slot = record.clone();
        self.touch();
        Ok(())
    }

    fn disk_mut(&mut self, uuid: &str) -> Result<&mut DiskRecord> {
        self.disks.get_mut(uuid).ok_or_else(|| Error::VolumeNotFound {
            uuid: uuid.to_string(),
        })
    }

    fn claims(&self, device: &str) -> bool {
        self.config.get(CLAIMED_DEVICE_KEY).map(String::as_str) == Some(device)
    }
}
