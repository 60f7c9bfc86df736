//! Domain Ports - Core trait definitions for the repository driver
//!
//! These traits define the boundaries between the lifecycle engine and the
//! external systems it keeps consistent: the cluster tool surface, the
//! virtualization control plane, and the generic volume-group engine.
//! Adapters implement these traits to provide concrete functionality.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

// =============================================================================
// Cluster Types
// =============================================================================

/// Clone parent of an image, as reported by a long listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentSpec {
    pub pool: String,
    pub image: String,
    pub snapshot: String,
}

/// One row of a long image listing: an image, or a snapshot of one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageEntry {
    /// Image name
    pub image: String,
    /// Snapshot name when this row is a snapshot
    pub snapshot: Option<String>,
    /// Provisioned size in bytes
    pub size: u64,
    /// Snapshot protection flag (always false for images)
    pub protected: bool,
    /// Clone parent, for images cloned from a snapshot
    pub parent: Option<ParentSpec>,
}

/// One snapshot of an image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub id: u64,
    pub name: String,
    pub size: u64,
    pub protected: bool,
}

/// One kernel mapping on the local host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappedDevice {
    pub pool: String,
    /// Image name
    pub name: String,
    /// Snapshot name, if a snapshot is mapped
    pub snap: Option<String>,
    /// Device node, e.g. `/dev/rbd0`
    pub device: String,
}

impl MappedDevice {
    /// Check whether this mapping is of the given image/snapshot in `pool`
    pub fn is_of(&self, pool: &str, image: &str, snap: Option<&str>) -> bool {
        self.pool == pool && self.name == image && self.snap.as_deref() == snap
    }
}

/// Byte quota of a pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolQuota {
    /// Zero when no byte quota is set
    pub quota_max_bytes: u64,
    pub current_num_bytes: u64,
}

/// Per-pool usage figures from the cluster usage report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolUsage {
    /// Policy-aware free bytes
    pub max_avail: u64,
    /// Logical bytes stored, when reported
    pub stored: Option<u64>,
    /// Raw bytes used, including replication
    pub bytes_used: Option<u64>,
}

// =============================================================================
// Cluster Client Port
// =============================================================================

/// Port for the cluster's block-device tool surface
///
/// A client is bound to one pool and one set of credentials. Image
/// arguments are bare image names within that pool.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Pool this client operates on
    fn pool(&self) -> &str;

    /// Cluster health summary
    async fn health(&self) -> Result<String>;

    /// Verify the pool exists and is accessible
    async fn pool_stats(&self) -> Result<()>;

    /// Long listing of every image and snapshot in the pool
    async fn list_images(&self) -> Result<Vec<ImageEntry>>;

    /// Snapshots of one image
    async fn list_snapshots(&self, image: &str) -> Result<Vec<SnapshotEntry>>;

    /// Images cloned from `image@snapshot`
    async fn list_children(&self, image: &str, snapshot: &str) -> Result<Vec<String>>;

    /// Pool byte quota
    async fn pool_quota(&self) -> Result<PoolQuota>;

    /// Pool usage from the cluster-wide report
    async fn pool_usage(&self) -> Result<PoolUsage>;

    /// Create an image with the conservative feature set (layering only)
    async fn create_image(&self, image: &str, size_mb: u64) -> Result<()>;

    /// Remove an image
    async fn remove_image(&self, image: &str) -> Result<()>;

    /// Resize an image
    async fn resize_image(&self, image: &str, size_mb: u64) -> Result<()>;

    /// Map `image` or `image@snapshot` on this host, returning the device node
    async fn map(&self, spec: &str) -> Result<String>;

    /// Unmap a device node on this host
    async fn unmap(&self, device: &str) -> Result<()>;

    /// Current kernel mappings on this host
    async fn show_mapped(&self) -> Result<Vec<MappedDevice>>;

    async fn snap_create(&self, image: &str, snapshot: &str) -> Result<()>;

    async fn snap_protect(&self, image: &str, snapshot: &str) -> Result<()>;

    async fn snap_unprotect(&self, image: &str, snapshot: &str) -> Result<()>;

    async fn snap_remove(&self, image: &str, snapshot: &str) -> Result<()>;

    /// Create a writable child image from a protected snapshot
    async fn clone_image(&self, image: &str, snapshot: &str, dest: &str) -> Result<()>;

    /// Check whether a device node exists on this host
    async fn device_present(&self, device: &str) -> bool {
        tokio::fs::try_exists(device).await.unwrap_or(false)
    }
}

// =============================================================================
// Control Plane Types
// =============================================================================

/// Capacity figures published for a repository
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryStats {
    pub physical_size: u64,
    pub physical_utilisation: u64,
    pub virtual_allocation: u64,
}

impl RepositoryStats {
    pub fn free(&self) -> u64 {
        self.physical_size.saturating_sub(self.physical_utilisation)
    }
}

/// The control plane's persistent record of one disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskRecord {
    pub uuid: String,
    pub sr_uuid: String,
    /// Logical size in bytes
    pub size: u64,
    /// Physical utilisation in bytes
    pub utilisation: u64,
    pub read_only: bool,
    pub is_snapshot: bool,
    /// UUID of the disk this one is a snapshot of
    pub snapshot_of: Option<String>,
    pub snapshot_time: Option<DateTime<Utc>>,
    /// Control-plane logical attach state
    pub attached: bool,
    /// Per-disk key/value side table
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl DiskRecord {
    /// A fresh, detached, writable disk record
    pub fn new(sr_uuid: impl Into<String>, uuid: impl Into<String>, size: u64) -> Self {
        Self {
            uuid: uuid.into(),
            sr_uuid: sr_uuid.into(),
            size,
            utilisation: 0,
            read_only: false,
            is_snapshot: false,
            snapshot_of: None,
            snapshot_time: None,
            attached: false,
            config: BTreeMap::new(),
        }
    }
}

// =============================================================================
// Control Plane Port
// =============================================================================

/// Port for the virtualization control plane's persistent object database
///
/// Reads of a repository the control plane has never seen return defaults;
/// records come into existence on first write.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Identity of the host this process runs on
    async fn current_host(&self) -> Result<String>;

    /// Current virtual allocation counter of a repository
    async fn virtual_allocation(&self, sr_uuid: &str) -> Result<u64>;

    /// Set the counter to `new` only if it still equals `expected`
    async fn compare_and_set_virtual_allocation(
        &self,
        sr_uuid: &str,
        expected: u64,
        new: u64,
    ) -> Result<bool>;

    /// Publish physical capacity figures to the repository record
    ///
    /// The virtual allocation is left alone; it only moves through
    /// `compare_and_set_virtual_allocation`.
    async fn publish_stats(&self, sr_uuid: &str, stats: &RepositoryStats) -> Result<()>;

    /// Register a new disk
    async fn introduce_disk(&self, record: DiskRecord) -> Result<()>;

    /// Replace an existing disk record (side table included)
    async fn update_disk(&self, record: &DiskRecord) -> Result<()>;

    /// Remove a disk record
    async fn forget_disk(&self, sr_uuid: &str, uuid: &str) -> Result<()>;

    async fn get_disk(&self, sr_uuid: &str, uuid: &str) -> Result<Option<DiskRecord>>;

    async fn list_disks(&self, sr_uuid: &str) -> Result<Vec<DiskRecord>>;

    async fn disk_config_get(&self, sr_uuid: &str, uuid: &str, key: &str)
        -> Result<Option<String>>;

    async fn disk_config_set(&self, sr_uuid: &str, uuid: &str, key: &str, value: &str)
        -> Result<()>;

    async fn disk_config_remove(&self, sr_uuid: &str, uuid: &str, key: &str) -> Result<()>;

    /// Set a key in the repository-level side table
    async fn repository_config_set(&self, sr_uuid: &str, key: &str, value: &str) -> Result<()>;

    /// Check whether some other repository on this host claims `device`
    async fn device_claimed_by_other(&self, sr_uuid: &str, device: &str) -> Result<bool>;
}

// =============================================================================
// Volume Group Port
// =============================================================================

/// LVM configuration scope a command runs in
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LvmScope {
    /// Value for `LVM_SYSTEM_DIR`; `None` uses the host default
    pub system_dir: Option<PathBuf>,
}

/// Everything a volume-group operation needs to know
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VgContext {
    pub vg_name: String,
    /// Physical volume backing the group
    pub device: String,
    pub scope: LvmScope,
}

/// One logical volume inside a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalVolumeInfo {
    pub name: String,
    pub size: u64,
    pub active: bool,
}

/// A volume group found on a device during probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeGroupProbe {
    pub vg_name: String,
    pub device: String,
    pub size: u64,
    pub free: u64,
}

/// Port for the generic volume-group lifecycle
#[async_trait]
pub trait VolumeGroupLifecycle: Send + Sync {
    async fn exists(&self, ctx: &VgContext) -> Result<bool>;

    /// Create the group on `ctx.device`
    async fn create(&self, ctx: &VgContext) -> Result<()>;

    /// Destroy the group and its logical volumes
    async fn remove(&self, ctx: &VgContext) -> Result<()>;

    async fn activate(&self, ctx: &VgContext) -> Result<()>;

    async fn deactivate(&self, ctx: &VgContext) -> Result<()>;

    /// Export the group so no host considers it in use
    async fn export(&self, ctx: &VgContext) -> Result<()>;

    async fn list_logical_volumes(&self, ctx: &VgContext) -> Result<Vec<LogicalVolumeInfo>>;

    /// Grow the physical volume to the device size, returning the group size
    async fn refresh_size(&self, ctx: &VgContext) -> Result<u64>;

    /// Volume groups present on `ctx.device`
    async fn probe(&self, ctx: &VgContext) -> Result<Vec<VolumeGroupProbe>>;

    /// Activate one logical volume, returning its device path
    async fn activate_lv(&self, ctx: &VgContext, lv_name: &str) -> Result<String>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ClusterClientRef = Arc<dyn ClusterClient>;
pub type ControlPlaneRef = Arc<dyn ControlPlane>;
pub type VolumeGroupLifecycleRef = Arc<dyn VolumeGroupLifecycle>;
