//! Volume Lifecycle
//!
//! A [`Volume`] is the repository's view of one disk. A [`Vdi`] is a
//! handle binding a volume UUID to its repository; every disk operation
//! goes through it and runs under the repository lock.

use super::mapping::{host_key, MappingChange};
use super::{mib_ceil, Repository, MIB};
use crate::config::DeviceConfig;
use crate::domain::ports::DiskRecord;
use crate::error::{Error, Result};
use crate::naming::{is_canonical_uuid, ClusterName};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Side-table key marking a protected snapshot
pub const PROTECTED_KEY: &str = "rbd_protected";

/// Side-table key naming the snapshot a clone was created from
pub const CLONE_OF_KEY: &str = "rbd_clone_of";

/// Command tag of a resume configuration
pub const ATTACH_FROM_CONFIG: &str = "vdi_attach_from_config";

// =============================================================================
// Volume
// =============================================================================

/// One virtual disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub uuid: String,
    /// Logical size in bytes
    pub size: u64,
    /// Physical utilisation in bytes
    pub utilisation: u64,
    pub read_only: bool,
    pub is_snapshot: bool,
    /// Parent volume of a snapshot; may be unknown until repaired
    pub snapshot_of: Option<String>,
    pub snapshot_time: Option<DateTime<Utc>>,
    /// Cluster-side protection of a snapshot
    pub protected: bool,
    /// Snapshot volume a clone was created from
    pub clone_of: Option<String>,
    /// Kernel device currently attached on this host
    pub mapped: bool,
    /// Device path on this host
    pub mapped_path: Option<String>,
    /// Control-plane attach state
    pub attached: bool,
}

impl Volume {
    /// A writable image volume
    pub fn image(uuid: impl Into<String>, size: u64) -> Self {
        Self {
            uuid: uuid.into(),
            size,
            utilisation: 0,
            read_only: false,
            is_snapshot: false,
            snapshot_of: None,
            snapshot_time: None,
            protected: false,
            clone_of: None,
            mapped: false,
            mapped_path: None,
            attached: false,
        }
    }

    /// A read-only snapshot volume of `parent`
    pub fn snapshot(uuid: impl Into<String>, parent: impl Into<String>, size: u64) -> Self {
        Self {
            read_only: true,
            is_snapshot: true,
            snapshot_of: Some(parent.into()),
            ..Self::image(uuid, size)
        }
    }

    /// Cluster name, unless this is a snapshot whose parent is unknown
    pub fn cluster_name(&self) -> Option<ClusterName> {
        if self.is_snapshot {
            self.snapshot_of.as_ref().map(|parent| ClusterName::Snapshot {
                parent: parent.clone(),
                uuid: self.uuid.clone(),
            })
        } else {
            Some(ClusterName::Image {
                uuid: self.uuid.clone(),
            })
        }
    }

    /// Rebuild from a control-plane record as seen from `host`
    pub fn from_record(record: &DiskRecord, host: &str) -> Self {
        let mapped_path = record.config.get(&host_key(host)).cloned();
        Self {
            uuid: record.uuid.clone(),
            size: record.size,
            utilisation: record.utilisation,
            read_only: record.read_only,
            is_snapshot: record.is_snapshot,
            snapshot_of: record.snapshot_of.clone(),
            snapshot_time: record.snapshot_time,
            protected: record.config.get(PROTECTED_KEY).map(String::as_str) == Some("true"),
            clone_of: record.config.get(CLONE_OF_KEY).cloned(),
            mapped: mapped_path.is_some(),
            mapped_path,
            attached: record.attached,
        }
    }

    /// A fresh control-plane record for this volume
    pub fn to_record(&self, sr_uuid: &str) -> DiskRecord {
        let mut record = DiskRecord::new(sr_uuid, self.uuid.clone(), self.size);
        self.write_to(&mut record);
        record
    }

    /// Copy this volume's fields into an existing record, leaving unrelated
    /// side-table entries (other hosts' paths) alone
    pub fn write_to(&self, record: &mut DiskRecord) {
        record.size = self.size;
        record.utilisation = self.utilisation;
        record.read_only = self.read_only;
        record.is_snapshot = self.is_snapshot;
        record.snapshot_of = self.snapshot_of.clone();
        record.snapshot_time = self.snapshot_time;
        record.attached = self.attached;

        if self.protected {
            record.config.insert(PROTECTED_KEY.into(), "true".into());
        } else {
            record.config.remove(PROTECTED_KEY);
        }
        match &self.clone_of {
            Some(parent) => {
                record.config.insert(CLONE_OF_KEY.into(), parent.clone());
            }
            None => {
                record.config.remove(CLONE_OF_KEY);
            }
        }
    }
}

// =============================================================================
// Resume Configuration
// =============================================================================

/// Everything needed to re-attach a disk without the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeConfig {
    pub device_config: DeviceConfig,
    pub sr_uuid: String,
    pub vdi_uuid: String,
    pub command: String,
}

impl ResumeConfig {
    pub fn parse(json: &str) -> Result<Self> {
        let config: ResumeConfig = serde_json::from_str(json)?;
        if config.command != ATTACH_FROM_CONFIG {
            return Err(Error::ConfigParameterInvalid {
                parameter: "command".into(),
                reason: format!("expected {}, got {}", ATTACH_FROM_CONFIG, config.command),
            });
        }
        Ok(config)
    }
}

// =============================================================================
// Lifecycle Operations
// =============================================================================

impl Repository {
    pub(crate) async fn create_volume_locked(&self, uuid: &str, size: u64) -> Result<Volume> {
        if !is_canonical_uuid(uuid) {
            return Err(Error::InvalidName {
                name: uuid.to_string(),
            });
        }
        let image = self.namespace().image_name(uuid);

        if self.control.get_disk(&self.sr_uuid, uuid).await?.is_some() {
            return Err(Error::CreateFailed {
                image,
                reason: format!("VDI {} already exists", uuid),
            });
        }
        match self.cluster.list_snapshots(&image).await {
            Ok(_) => {
                return Err(Error::CreateFailed {
                    image,
                    reason: "image already exists in the pool".into(),
                })
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        self.check_free_space(size).await?;

        let size_mb = mib_ceil(size);
        info!("Creating VDI {} ({} MiB) as {}", uuid, size_mb, image);

        if let Err(e) = self.cluster.create_image(&image, size_mb).await {
            self.remove_partial_image(&image).await;
            return Err(e);
        }

        let volume = Volume::image(uuid, size_mb * MIB);
        if let Err(e) = self
            .control
            .introduce_disk(volume.to_record(&self.sr_uuid))
            .await
        {
            self.remove_partial_image(&image).await;
            return Err(e);
        }

        self.store_volume(volume.clone()).await;
        self.account(volume.size as i64).await;
        Ok(volume)
    }

    /// Best-effort removal of an image left behind by a failed operation
    pub(crate) async fn remove_partial_image(&self, image: &str) {
        match self.cluster.remove_image(image).await {
            Ok(()) => info!("Removed partially created image {}", image),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!("Failed to remove partially created image {}: {}", image, e),
        }
    }

    pub(crate) async fn delete_volume_locked(&self, uuid: &str) -> Result<()> {
        let mut volume = self.load_volume(uuid).await?;

        if volume.attached {
            return Err(Error::VolumeInUse {
                volume: uuid.to_string(),
                reason: "VDI is attached".into(),
            });
        }

        let mapped = self.cluster.show_mapped().await?;
        self.reconcile_mapping(&mut volume, &mapped).await?;
        if let Some(device) = volume.mapped_path.take() {
            info!("Unmapping stale mapping {} of {} before delete", device, uuid);
            self.unmap_quietly(&device).await;
            if let Err(e) = self.clear_host_path(uuid).await {
                warn!("Failed to clear device path of {}: {}", uuid, e);
            }
            volume.mapped = false;
        }

        match volume.cluster_name() {
            Some(ClusterName::Image { uuid: image_uuid }) => {
                self.remove_image_checked(&image_uuid).await?
            }
            Some(ClusterName::Snapshot { parent, uuid: snap }) => {
                self.remove_snapshot(&parent, &snap).await?
            }
            None => info!("Snapshot {} has no known parent, treating as gone", uuid),
        }

        self.control.forget_disk(&self.sr_uuid, uuid).await?;
        self.forget_volume(uuid).await;
        self.account(-(volume.size as i64)).await;
        info!("Deleted VDI {}", uuid);
        Ok(())
    }

    /// Remove an image unless it has snapshots; a missing image is fine
    async fn remove_image_checked(&self, uuid: &str) -> Result<()> {
        let image = self.namespace().image_name(uuid);

        match self.cluster.list_snapshots(&image).await {
            Ok(snaps) if !snaps.is_empty() => {
                let names: Vec<&str> = snaps.iter().map(|s| s.name.as_str()).collect();
                return Err(Error::HasSnapshots {
                    volume: uuid.to_string(),
                    reason: names.join(", "),
                });
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        match self.cluster.remove_image(&image).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                info!("Image {} already gone, cleaning up record", image);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn attach_volume_locked(&self, uuid: &str) -> Result<String> {
        let (mut volume, _) = self.verify_mapping_locked(uuid).await?;

        let device = match (volume.mapped, volume.mapped_path.clone()) {
            (true, Some(path)) => {
                debug!("VDI {} already mapped at {}", uuid, path);
                path
            }
            _ => {
                let name = self.require_name(&volume)?;
                let device = self.map_and_wait(&self.namespace().render(&name)).await?;
                if let Err(e) = self.record_host_path(uuid, &device).await {
                    self.unmap_quietly(&device).await;
                    return Err(e);
                }
                volume.mapped = true;
                volume.mapped_path = Some(device.clone());
                device
            }
        };

        volume.attached = true;
        self.persist_volume(&volume).await?;
        self.store_volume(volume).await;
        info!("Attached VDI {} at {}", uuid, device);
        Ok(device)
    }

    /// Unmap the volume on this host and clear its attach flag
    ///
    /// A mapping this host holds but never recorded is adopted from the
    /// host's own mapping table first, so detach also releases it.
    pub(crate) async fn detach_volume_locked(&self, uuid: &str) -> Result<()> {
        let (mut volume, change) = self.verify_mapping_locked(uuid).await?;

        match volume.mapped_path.take() {
            Some(device) => {
                self.unmap_quietly(&device).await;
                self.clear_host_path(uuid).await?;
                info!("Detached VDI {} from {}", uuid, device);
            }
            None if matches!(change, MappingChange::Cleared { .. }) => {
                info!("VDI {} was already unmapped out of band", uuid);
            }
            None => debug!("VDI {} has no device path on this host", uuid),
        }

        volume.mapped = false;
        if volume.attached {
            volume.attached = false;
            self.persist_volume(&volume).await?;
        }
        self.store_volume(volume).await;
        Ok(())
    }

    pub(crate) async fn resize_volume_locked(&self, uuid: &str, new_size: u64) -> Result<Volume> {
        let mut volume = self.load_volume(uuid).await?;

        if volume.is_snapshot {
            return Err(Error::Unsupported {
                operation: "resize".into(),
                target: format!("snapshot {}", uuid),
            });
        }
        if new_size < volume.size {
            return Err(Error::ShrinkRejected {
                volume: uuid.to_string(),
                current: volume.size,
                requested: new_size,
            });
        }
        if new_size == volume.size {
            debug!("VDI {} already has size {}", uuid, new_size);
            return Ok(volume);
        }

        let size_mb = mib_ceil(new_size);
        let image = self.namespace().image_name(uuid);
        self.cluster.resize_image(&image, size_mb).await?;

        let old_size = volume.size;
        volume.size = size_mb * MIB;
        self.persist_volume(&volume).await?;
        self.store_volume(volume.clone()).await;
        self.account(volume.size as i64 - old_size as i64).await;
        info!("Resized VDI {} from {} to {} bytes", uuid, old_size, volume.size);
        Ok(volume)
    }

    pub(crate) async fn activate_volume_locked(&self, uuid: &str) -> Result<String> {
        let (mut volume, _) = self.verify_mapping_locked(uuid).await?;
        if let (true, Some(path)) = (volume.mapped, volume.mapped_path.clone()) {
            return Ok(path);
        }

        let name = self.require_name(&volume)?;
        let device = self.map_and_wait(&self.namespace().render(&name)).await?;
        if let Err(e) = self.record_host_path(uuid, &device).await {
            self.unmap_quietly(&device).await;
            return Err(e);
        }
        volume.mapped = true;
        volume.mapped_path = Some(device.clone());
        self.store_volume(volume).await;
        info!("Activated VDI {} at {}", uuid, device);
        Ok(device)
    }

    pub(crate) async fn deactivate_volume_locked(&self, uuid: &str) -> Result<()> {
        let (mut volume, _) = self.verify_mapping_locked(uuid).await?;
        if volume.attached {
            debug!("VDI {} is still attached, leaving it mapped", uuid);
            return Ok(());
        }

        if let Some(device) = volume.mapped_path.take() {
            self.unmap_quietly(&device).await;
            self.clear_host_path(uuid).await?;
            info!("Deactivated VDI {}", uuid);
        }
        volume.mapped = false;
        self.store_volume(volume).await;
        Ok(())
    }

    pub(crate) async fn generate_config_locked(&self, uuid: &str) -> Result<String> {
        let volume = self.load_volume(uuid).await?;
        let config = ResumeConfig {
            device_config: self.config.to_device_config(),
            sr_uuid: self.sr_uuid.clone(),
            vdi_uuid: volume.uuid,
            command: ATTACH_FROM_CONFIG.to_string(),
        };
        Ok(serde_json::to_string(&config)?)
    }

    /// Map a disk for resume, without requiring a control-plane record
    pub(crate) async fn attach_from_config_locked(&self, uuid: &str) -> Result<String> {
        let image = self.namespace().image_name(uuid);
        let mapped = self.cluster.show_mapped().await?;
        if let Some(existing) = mapped
            .iter()
            .find(|m| m.is_of(self.cluster.pool(), &image, None))
        {
            debug!("VDI {} already mapped at {}", uuid, existing.device);
            return Ok(existing.device.clone());
        }

        let device = self.map_and_wait(&image).await?;
        match self.record_host_path(uuid, &device).await {
            Ok(()) => {}
            Err(Error::VolumeNotFound { .. }) => {
                debug!("No record for {} during resume attach", uuid)
            }
            Err(e) => warn!("Failed to record device path of {}: {}", uuid, e),
        }
        info!("Attached VDI {} from config at {}", uuid, device);
        Ok(device)
    }

    fn require_name(&self, volume: &Volume) -> Result<ClusterName> {
        volume
            .cluster_name()
            .ok_or_else(|| Error::ImageNotFound {
                name: self.namespace().snapshot_name(&volume.uuid),
            })
    }
}

// =============================================================================
// VDI Handle
// =============================================================================

/// A disk of a repository, addressed by UUID
pub struct Vdi<'a> {
    repo: &'a Repository,
    uuid: String,
}

impl<'a> Vdi<'a> {
    pub(crate) fn new(repo: &'a Repository, uuid: impl Into<String>) -> Self {
        Self {
            repo,
            uuid: uuid.into(),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Create the backing image and register the disk
    pub async fn create(&self, size: u64) -> Result<Volume> {
        let _lock = self.repo.lock().await?;
        self.repo.create_volume_locked(&self.uuid, size).await
    }

    pub async fn delete(&self) -> Result<()> {
        let _lock = self.repo.lock().await?;
        self.repo.delete_volume_locked(&self.uuid).await
    }

    /// Map on this host and mark attached, returning the device path
    pub async fn attach(&self) -> Result<String> {
        let _lock = self.repo.lock().await?;
        self.repo.attach_volume_locked(&self.uuid).await
    }

    pub async fn detach(&self) -> Result<()> {
        let _lock = self.repo.lock().await?;
        self.repo.detach_volume_locked(&self.uuid).await
    }

    /// Grow the disk; shrinking is rejected
    pub async fn resize(&self, new_size: u64) -> Result<Volume> {
        let _lock = self.repo.lock().await?;
        self.repo.resize_volume_locked(&self.uuid, new_size).await
    }

    /// Take a protected, read-only snapshot
    pub async fn snapshot(&self) -> Result<Volume> {
        let _lock = self.repo.lock().await?;
        self.repo.snapshot_volume_locked(&self.uuid).await
    }

    /// Create a writable copy
    pub async fn clone_volume(&self) -> Result<Volume> {
        let _lock = self.repo.lock().await?;
        self.repo.clone_volume_locked(&self.uuid).await
    }

    /// Make sure the disk is mapped on this host
    pub async fn activate(&self) -> Result<String> {
        let _lock = self.repo.lock().await?;
        self.repo.activate_volume_locked(&self.uuid).await
    }

    /// Unmap, unless the control plane still has the disk attached
    pub async fn deactivate(&self) -> Result<()> {
        let _lock = self.repo.lock().await?;
        self.repo.deactivate_volume_locked(&self.uuid).await
    }

    /// Reconcile tracked mapping state with the host's mapping table
    pub async fn verify_mapping(&self) -> Result<MappingChange> {
        let _lock = self.repo.lock().await?;
        let (_, change) = self.repo.verify_mapping_locked(&self.uuid).await?;
        Ok(change)
    }

    /// Serialise what `attach_from_config` needs to re-attach this disk
    pub async fn generate_config(&self) -> Result<String> {
        self.repo.generate_config_locked(&self.uuid).await
    }

    pub async fn attach_from_config(&self) -> Result<String> {
        let _lock = self.repo.lock().await?;
        self.repo.attach_from_config_locked(&self.uuid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{ClusterClient, ControlPlane};
    use crate::repository::testing::{repository, UUID_A};
    use assert_matches::assert_matches;

    const GIB: u64 = 1024 * MIB;

    #[test]
    fn test_record_round_trip_keeps_other_hosts() {
        let mut volume = Volume::snapshot("s", "a", GIB);
        volume.protected = true;

        let mut record = volume.to_record("sr");
        record.config.insert(host_key("h2"), "/dev/rbd9".into());
        record.config.insert(host_key("h1"), "/dev/rbd1".into());

        let loaded = Volume::from_record(&record, "h1");
        assert!(loaded.protected);
        assert_eq!(loaded.snapshot_of.as_deref(), Some("a"));
        assert_eq!(loaded.mapped_path.as_deref(), Some("/dev/rbd1"));

        let mut unprotected = loaded.clone();
        unprotected.protected = false;
        unprotected.write_to(&mut record);
        assert!(!record.config.contains_key(PROTECTED_KEY));
        assert_eq!(record.config.get(&host_key("h2")).map(String::as_str), Some("/dev/rbd9"));
    }

    #[tokio::test]
    async fn test_create_then_scan_reports_size() {
        let (repo, sim, _cp, _dir) = repository().await;
        repo.vdi(UUID_A).create(10 * GIB).await.unwrap();
        assert_eq!(sim.image_size(&format!("vdi-{}", UUID_A)).await, Some(10 * GIB));

        repo.scan().await.unwrap();
        let volume = repo.volume(UUID_A).await.unwrap();
        assert_eq!(volume.size, 10 * GIB);
        assert_eq!(volume.utilisation, 0);
        assert_eq!(repo.stats().await.virtual_allocation, 10 * GIB);
    }

    #[tokio::test]
    async fn test_create_failure_removes_partial_image() {
        let (repo, sim, cp, _dir) = repository().await;
        cp.fail_next("introduce_disk");
        assert!(repo.vdi(UUID_A).create(GIB).await.is_err());
        assert!(!sim.has_image(&format!("vdi-{}", UUID_A)).await);
        assert!(repo.volume(UUID_A).await.is_none());
    }

    #[tokio::test]
    async fn test_create_rejects_bad_uuid_and_overcommit() {
        let (repo, sim, _cp, _dir) = repository().await;
        assert_matches!(
            repo.vdi("not-a-uuid").create(GIB).await,
            Err(Error::InvalidName { .. })
        );

        sim.set_quota(crate::domain::ports::PoolQuota {
            quota_max_bytes: GIB,
            current_num_bytes: 0,
        })
        .await;
        assert_matches!(
            repo.vdi(UUID_A).create(2 * GIB).await,
            Err(Error::InsufficientCapacity { ref limit, .. }) if limit == "quota"
        );
    }

    #[tokio::test]
    async fn test_resize_is_monotonic() {
        let (repo, sim, _cp, _dir) = repository().await;
        let vdi = repo.vdi(UUID_A);
        vdi.create(2 * GIB).await.unwrap();

        assert_matches!(vdi.resize(GIB).await, Err(Error::ShrinkRejected { .. }));
        assert_eq!(repo.volume(UUID_A).await.unwrap().size, 2 * GIB);

        assert_eq!(vdi.resize(2 * GIB).await.unwrap().size, 2 * GIB);

        vdi.resize(3 * GIB).await.unwrap();
        assert_eq!(sim.image_size(&format!("vdi-{}", UUID_A)).await, Some(3 * GIB));
        assert_eq!(repo.stats().await.virtual_allocation, 3 * GIB);
    }

    #[tokio::test]
    async fn test_attach_is_idempotent_and_detach_clears_path() {
        let (repo, sim, cp, _dir) = repository().await;
        let vdi = repo.vdi(UUID_A);
        vdi.create(GIB).await.unwrap();

        let device = vdi.attach().await.unwrap();
        assert_eq!(vdi.attach().await.unwrap(), device);
        assert_eq!(sim.mapping_count().await, 1);
        assert_eq!(
            cp.disk_config_get("sr-1", UUID_A, "host_host-1").await.unwrap(),
            Some(device.clone())
        );

        vdi.detach().await.unwrap();
        assert_eq!(sim.mapping_count().await, 0);
        assert_eq!(cp.disk_config_get("sr-1", UUID_A, "host_host-1").await.unwrap(), None);
        assert!(!cp.get_disk("sr-1", UUID_A).await.unwrap().unwrap().attached);

        // Detaching a detached disk is a no-op
        vdi.detach().await.unwrap();
    }

    #[tokio::test]
    async fn test_detach_releases_untracked_mapping() {
        let (repo, sim, cp, _dir) = repository().await;
        let vdi = repo.vdi(UUID_A);
        vdi.create(GIB).await.unwrap();

        // Mapped on this host without going through attach
        let device = sim.map(&format!("vdi-{}", UUID_A)).await.unwrap();
        assert!(sim.device_present(&device).await);

        vdi.detach().await.unwrap();
        assert_eq!(sim.mapping_count().await, 0);
        assert!(!repo.volume(UUID_A).await.unwrap().mapped);
        assert_eq!(cp.disk_config_get("sr-1", UUID_A, "host_host-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_attached_is_conflict() {
        let (repo, _sim, _cp, _dir) = repository().await;
        let vdi = repo.vdi(UUID_A);
        vdi.create(GIB).await.unwrap();
        vdi.attach().await.unwrap();

        let err = vdi.delete().await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_delete_when_image_already_gone() {
        let (repo, sim, cp, _dir) = repository().await;
        let vdi = repo.vdi(UUID_A);
        vdi.create(GIB).await.unwrap();

        sim.purge_image(&format!("vdi-{}", UUID_A)).await;
        vdi.delete().await.unwrap();
        assert!(cp.get_disk("sr-1", UUID_A).await.unwrap().is_none());
        assert_eq!(repo.stats().await.virtual_allocation, 0);
    }

    #[tokio::test]
    async fn test_delete_unmaps_stale_mapping() {
        let (repo, sim, _cp, _dir) = repository().await;
        let vdi = repo.vdi(UUID_A);
        vdi.create(GIB).await.unwrap();
        vdi.activate().await.unwrap();
        assert_eq!(sim.mapping_count().await, 1);

        vdi.delete().await.unwrap();
        assert_eq!(sim.mapping_count().await, 0);
    }

    #[tokio::test]
    async fn test_delete_with_remote_watcher_is_conflict() {
        let (repo, sim, _cp, _dir) = repository().await;
        let vdi = repo.vdi(UUID_A);
        vdi.create(GIB).await.unwrap();
        sim.add_remote_watcher(&format!("vdi-{}", UUID_A)).await;

        assert_matches!(vdi.delete().await, Err(Error::VolumeInUse { .. }));
    }

    #[tokio::test]
    async fn test_deactivate_respects_attach_flag() {
        let (repo, sim, _cp, _dir) = repository().await;
        let vdi = repo.vdi(UUID_A);
        vdi.create(GIB).await.unwrap();

        vdi.attach().await.unwrap();
        vdi.deactivate().await.unwrap();
        assert_eq!(sim.mapping_count().await, 1);

        vdi.detach().await.unwrap();
        let device = vdi.activate().await.unwrap();
        assert!(sim.device_present(&device).await);
        vdi.deactivate().await.unwrap();
        assert_eq!(sim.mapping_count().await, 0);
    }

    #[tokio::test]
    async fn test_generate_config_and_resume() {
        let (repo, sim, _cp, _dir) = repository().await;
        let vdi = repo.vdi(UUID_A);
        vdi.create(GIB).await.unwrap();

        let json = vdi.generate_config().await.unwrap();
        let resume = ResumeConfig::parse(&json).unwrap();
        assert_eq!(resume.vdi_uuid, UUID_A);
        assert_eq!(resume.sr_uuid, "sr-1");
        assert_eq!(resume.device_config.get("pool").map(String::as_str), Some("rbd"));

        let device = vdi.attach_from_config().await.unwrap();
        assert_eq!(vdi.attach_from_config().await.unwrap(), device);
        assert_eq!(sim.mapping_count().await, 1);

        assert!(ResumeConfig::parse(r#"{"device_config":{},"sr_uuid":"s","vdi_uuid":"v","command":"other"}"#).is_err());
    }
}
