//! LVM over RBD
//!
//! A layered repository: one RBD image is mapped on every host and carries
//! a single volume group whose logical volumes are the disks. The image is
//! shared read/write across hosts; the volume group is what the disk
//! lifecycle operates on.
//!
//! With `protected` set, deleting the repository only deactivates and
//! exports the group and leaves the image and its data intact.

use crate::config::{EngineConfig, LayeredConfig};
use crate::controlplane::CLAIMED_DEVICE_KEY;
use crate::domain::ports::{
    ClusterClient, ClusterClientRef, ControlPlaneRef, LogicalVolumeInfo, LvmScope,
    RepositoryStats, VgContext, VolumeGroupLifecycleRef, VolumeGroupProbe,
};
use crate::error::{Error, Result};
use crate::lock::RepositoryLock;
use crate::repository::mapping::map_and_wait;
use crate::repository::volume::ATTACH_FROM_CONFIG;
use crate::repository::ResumeConfig;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Volume group name prefix shared with the host's LVM-based repositories
pub const VG_PREFIX: &str = "VG_XenStorage-";

/// Logical volume name prefix of a VHD disk
pub const LV_PREFIX: &str = "VHD-";

/// Repository config key holding the device serial
pub const SERIAL_KEY: &str = "serial";

/// Repository config key enabling VHD-format disks
pub const USE_VHD_KEY: &str = "use_vhd";

pub fn vg_name(sr_uuid: &str) -> String {
    format!("{}{}", VG_PREFIX, sr_uuid)
}

pub fn lv_name(vdi_uuid: &str) -> String {
    format!("{}{}", LV_PREFIX, vdi_uuid)
}

/// Synthetic serial standing in for a SCSI serial number
pub fn rbd_serial(pool: &str, image: &str) -> String {
    format!("RBD:{}:{}", pool, image)
}

/// What a layered scan found
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayeredScanReport {
    pub vg_name: String,
    pub device: String,
    pub size: u64,
    pub logical_volumes: Vec<LogicalVolumeInfo>,
}

/// Volume group on a single shared RBD image
pub struct LvmOverRbd {
    sr_uuid: String,
    config: LayeredConfig,
    engine: EngineConfig,
    cluster: ClusterClientRef,
    control: ControlPlaneRef,
    vg: VolumeGroupLifecycleRef,
    device: Mutex<Option<String>>,
}

impl LvmOverRbd {
    /// Bind to a repository, picking up an existing mapping of the image
    pub async fn load(
        sr_uuid: impl Into<String>,
        config: LayeredConfig,
        engine: EngineConfig,
        cluster: ClusterClientRef,
        control: ControlPlaneRef,
        vg: VolumeGroupLifecycleRef,
    ) -> Self {
        let repo = Self {
            sr_uuid: sr_uuid.into(),
            config,
            engine,
            cluster,
            control,
            vg,
            device: Mutex::new(None),
        };
        match find_mapped(repo.cluster.as_ref(), &repo.config.image).await {
            Ok(Some(device)) => {
                debug!("{} is mapped at {}", repo.config.image_spec(), device);
                *repo.device.lock().await = Some(device);
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to look up mapping of {}: {}", repo.config.image_spec(), e),
        }
        repo
    }

    pub fn sr_uuid(&self) -> &str {
        &self.sr_uuid
    }

    pub fn vg_name(&self) -> String {
        vg_name(&self.sr_uuid)
    }

    /// Device the backing image is mapped at on this host, if known
    pub async fn device(&self) -> Option<String> {
        self.device.lock().await.clone()
    }

    async fn lock(&self) -> Result<RepositoryLock> {
        RepositoryLock::acquire(&self.engine.lock_dir, &self.sr_uuid).await
    }

    fn context(&self, device: &str) -> VgContext {
        VgContext {
            vg_name: self.vg_name(),
            device: device.to_string(),
            scope: LvmScope::default(),
        }
    }

    /// The tracked device, or whatever the mapping table says now
    async fn resolve_device(&self) -> Result<Option<String>> {
        let mut device = self.device.lock().await;
        if device.is_none() {
            *device = find_mapped(self.cluster.as_ref(), &self.config.image).await?;
        }
        Ok(device.clone())
    }

    /// Map the backing image unless it already is
    async fn ensure_mapped(&self) -> Result<String> {
        if let Some(existing) = find_mapped(self.cluster.as_ref(), &self.config.image).await? {
            debug!("{} already mapped at {}", self.config.image_spec(), existing);
            *self.device.lock().await = Some(existing.clone());
            return Ok(existing);
        }

        let device = map_and_wait(self.cluster.as_ref(), &self.config.image, self.engine.device_wait)
            .await
            .map_err(|e| Error::PoolUnavailable {
                pool: self.config.connection.pool.clone(),
                reason: format!("failed to map RBD image {}: {}", self.config.image_spec(), e),
            })?;
        info!("Mapped {} at {}", self.config.image_spec(), device);
        *self.device.lock().await = Some(device.clone());
        Ok(device)
    }

    /// Unmap the backing image, logging failures
    async fn unmap(&self) {
        let device = match self.resolve_device().await {
            Ok(Some(device)) => device,
            Ok(None) => {
                debug!("{} is not mapped", self.config.image_spec());
                return;
            }
            Err(e) => {
                warn!("Cannot resolve device of {}: {}", self.config.image_spec(), e);
                return;
            }
        };
        match self.cluster.unmap(&device).await {
            Ok(()) => {
                info!("Unmapped {}", device);
                *self.device.lock().await = None;
            }
            Err(e) => warn!("Failed to unmap {}: {}", device, e),
        }
    }

    async fn remove_image(&self) -> Result<()> {
        if self.config.protected {
            info!("{} is protected, leaving it in place", self.config.image_spec());
            return Ok(());
        }
        match self.cluster.remove_image(&self.config.image).await {
            Ok(()) => {
                info!("Removed {}", self.config.image_spec());
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Repository Operations
    // =========================================================================

    /// Create the backing image and build the volume group on it
    pub async fn create(&self) -> Result<()> {
        let _lock = self.lock().await?;
        let size_mb = self.config.required_size_mb()?;
        info!(
            "Creating layered repository {} on {} ({} MiB)",
            self.sr_uuid,
            self.config.image_spec(),
            size_mb
        );

        self.cluster.create_image(&self.config.image, size_mb).await?;

        if let Err(e) = self.build_volume_group().await {
            self.unmap().await;
            if let Err(cleanup) = self.remove_image().await {
                warn!("Failed to remove {} after failed create: {}", self.config.image_spec(), cleanup);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn build_volume_group(&self) -> Result<()> {
        let device = self.ensure_mapped().await?;
        let ctx = self.context(&device);

        if self.vg.exists(&ctx).await? {
            return Err(Error::RepositoryExists { name: ctx.vg_name });
        }
        if self
            .control
            .device_claimed_by_other(&self.sr_uuid, &device)
            .await?
        {
            return Err(Error::DeviceInUse { device });
        }

        self.vg.create(&ctx).await?;

        let serial = rbd_serial(&self.config.connection.pool, &self.config.image);
        self.control
            .repository_config_set(&self.sr_uuid, SERIAL_KEY, &serial)
            .await?;
        self.control
            .repository_config_set(&self.sr_uuid, CLAIMED_DEVICE_KEY, &device)
            .await?;
        self.control
            .repository_config_set(&self.sr_uuid, USE_VHD_KEY, "true")
            .await?;
        info!("Created volume group {} on {} ({})", ctx.vg_name, device, serial);
        Ok(())
    }

    /// Destroy the volume group and image, or only let go of a protected one
    pub async fn delete(&self) -> Result<()> {
        let _lock = self.lock().await?;
        let device = find_mapped(self.cluster.as_ref(), &self.config.image).await?;

        if self.config.protected {
            if let Some(device) = device {
                *self.device.lock().await = Some(device.clone());
                let ctx = self.context(&device);
                let released = match self.vg.deactivate(&ctx).await {
                    Ok(()) => self.vg.export(&ctx).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = released {
                    warn!("Failed to cleanly release volume group {}: {}", ctx.vg_name, e);
                }
                self.unmap().await;
            }
            info!("{} is protected, skipping deletion", self.config.image_spec());
            return Ok(());
        }

        if let Some(device) = device {
            *self.device.lock().await = Some(device.clone());
            self.vg.remove(&self.context(&device)).await?;
            self.unmap().await;
        }
        self.remove_image().await
    }

    /// Map the image and activate the volume group
    pub async fn attach(&self) -> Result<()> {
        let _lock = self.lock().await?;
        let result = async {
            let device = self.ensure_mapped().await?;
            self.vg.activate(&self.context(&device)).await
        }
        .await;

        if let Err(e) = result {
            self.unmap().await;
            return Err(Error::PoolUnavailable {
                pool: self.config.connection.pool.clone(),
                reason: e.to_string(),
            });
        }
        info!("Attached layered repository {}", self.sr_uuid);
        Ok(())
    }

    /// Deactivate the volume group, then unmap whatever happens
    pub async fn detach(&self) -> Result<()> {
        let _lock = self.lock().await?;
        let result = match self.resolve_device().await? {
            Some(device) => self.vg.deactivate(&self.context(&device)).await,
            None => Ok(()),
        };
        self.unmap().await;
        result
    }

    /// Swap the shared allocation counter to the group's allocated total
    async fn store_allocation(&self, allocated: u64) -> Result<()> {
        let current = self.control.virtual_allocation(&self.sr_uuid).await?;
        if current == allocated {
            return Ok(());
        }
        if !self
            .control
            .compare_and_set_virtual_allocation(&self.sr_uuid, current, allocated)
            .await?
        {
            return Err(Error::AllocationContention {
                repository: self.sr_uuid.clone(),
                attempts: 1,
            });
        }
        debug!("Virtual allocation of {}: {} -> {}", self.sr_uuid, current, allocated);
        Ok(())
    }

    /// List the group's logical volumes and publish its size
    pub async fn scan(&self) -> Result<LayeredScanReport> {
        let _lock = self.lock().await?;
        let device = self.resolve_device().await?.ok_or_else(|| Error::Lvm {
            command: "scan".into(),
            target: self.vg_name(),
            reason: format!("{} is not mapped on this host", self.config.image_spec()),
        })?;
        let ctx = self.context(&device);

        let logical_volumes = self.vg.list_logical_volumes(&ctx).await?;
        let size = self.vg.refresh_size(&ctx).await?;
        let allocated: u64 = logical_volumes.iter().map(|lv| lv.size).sum();

        let stats = RepositoryStats {
            physical_size: size,
            physical_utilisation: allocated,
            virtual_allocation: allocated,
        };
        if let Err(e) = self.control.publish_stats(&self.sr_uuid, &stats).await {
            warn!("Failed to publish stats for {}: {}", self.sr_uuid, e);
        }
        if let Err(e) = self.store_allocation(allocated).await {
            warn!("Failed to store allocation for {}: {}", self.sr_uuid, e);
        }

        Ok(LayeredScanReport {
            vg_name: ctx.vg_name,
            device,
            size,
            logical_volumes,
        })
    }

    /// Look for volume groups on the image, mapping it only for the probe
    pub async fn probe(
        cluster: &dyn ClusterClient,
        config: &LayeredConfig,
        engine: &EngineConfig,
        vg: &VolumeGroupLifecycleRef,
    ) -> Result<Vec<VolumeGroupProbe>> {
        let existing = find_mapped(cluster, &config.image).await?;
        let device = match &existing {
            Some(device) => device.clone(),
            None => map_and_wait(cluster, &config.image, engine.device_wait).await?,
        };

        let ctx = VgContext {
            vg_name: String::new(),
            device: device.clone(),
            scope: LvmScope::default(),
        };
        let result = vg.probe(&ctx).await;

        if existing.is_none() {
            if let Err(e) = cluster.unmap(&device).await {
                warn!("Failed to unmap {} after probe: {}", device, e);
            }
        }
        result.map_err(|e| Error::PoolUnavailable {
            pool: config.connection.pool.clone(),
            reason: e.to_string(),
        })
    }

    /// Grow the group to the image size; `None` when the image is not mapped
    pub async fn refresh_size(&self) -> Result<Option<u64>> {
        match self.resolve_device().await? {
            Some(device) => Ok(Some(self.vg.refresh_size(&self.context(&device)).await?)),
            None => {
                warn!("{} is not mapped, cannot refresh size", self.config.image_spec());
                Ok(None)
            }
        }
    }

    // =========================================================================
    // Disk Resume
    // =========================================================================

    /// Resume configuration for a disk; refused while the image is unmapped
    pub async fn generate_config(&self, vdi_uuid: &str) -> Result<String> {
        if self.resolve_device().await?.is_none() {
            return Err(Error::MapFailed {
                image: self.config.image_spec(),
                reason: format!("RBD device not mapped, cannot generate config for {}", vdi_uuid),
            });
        }
        let config = ResumeConfig {
            device_config: self.config.to_device_config(),
            sr_uuid: self.sr_uuid.clone(),
            vdi_uuid: vdi_uuid.to_string(),
            command: ATTACH_FROM_CONFIG.to_string(),
        };
        Ok(serde_json::to_string(&config)?)
    }

    /// Map the image if needed and activate the disk's logical volume
    pub async fn attach_from_config(&self, vdi_uuid: &str) -> Result<String> {
        let _lock = self.lock().await?;
        let result = async {
            let device = self.ensure_mapped().await?;
            self.vg.activate_lv(&self.context(&device), &lv_name(vdi_uuid)).await
        }
        .await;
        result.map_err(|e| Error::PoolUnavailable {
            pool: self.config.connection.pool.clone(),
            reason: format!("unable to attach VDI {}: {}", vdi_uuid, e),
        })
    }
}

/// Device the image is mapped at on this host
async fn find_mapped(cluster: &dyn ClusterClient, image: &str) -> Result<Option<String>> {
    let mapped = cluster.show_mapped().await?;
    Ok(mapped
        .into_iter()
        .find(|m| m.is_of(cluster.pool(), image, None))
        .map(|m| m.device))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::SimCluster;
    use crate::config::DeviceConfig;
    use crate::controlplane::MemoryControlPlane;
    use crate::domain::ports::ControlPlane;
    use crate::lvm::{MemoryVolumeGroups, RbdScopedVolumeGroup};
    use crate::repository::MIB;
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use tempfile::TempDir;

    const SR: &str = "sr-lvm";

    struct Fixture {
        repo: LvmOverRbd,
        sim: Arc<SimCluster>,
        cp: Arc<MemoryControlPlane>,
        vgs: Arc<RbdScopedVolumeGroup<MemoryVolumeGroups>>,
        _dir: TempDir,
    }

    async fn fixture(protected: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let sim = Arc::new(SimCluster::new("rbd"));
        let cp = Arc::new(MemoryControlPlane::new("host-1"));
        let vgs = Arc::new(RbdScopedVolumeGroup::new(
            MemoryVolumeGroups::new(),
            dir.path().join("lvmorbd"),
        ));

        let mut dconf = DeviceConfig::new();
        dconf.insert("pool".into(), "rbd".into());
        dconf.insert("rbd_image".into(), "shared".into());
        dconf.insert("size".into(), "10G".into());
        dconf.insert("protected".into(), protected.to_string());
        let config = LayeredConfig::parse(&dconf).unwrap();

        let repo = LvmOverRbd::load(
            SR,
            config,
            EngineConfig::with_lock_dir(dir.path()),
            sim.clone(),
            cp.clone(),
            vgs.clone(),
        )
        .await;
        Fixture {
            repo,
            sim,
            cp,
            vgs,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_create_builds_group_and_records_serial() {
        let f = fixture(true).await;
        f.repo.create().await.unwrap();

        assert_eq!(f.sim.image_size("shared").await, Some(10 * 1024 * MIB));
        assert!(f.vgs.inner().has_group(&vg_name(SR)).await);
        let record = f.cp.record(SR).unwrap();
        assert_eq!(record.config.get(SERIAL_KEY).map(String::as_str), Some("RBD:rbd:shared"));
        assert_eq!(record.config.get(USE_VHD_KEY).map(String::as_str), Some("true"));
        assert!(f.repo.device().await.is_some());
    }

    #[tokio::test]
    async fn test_create_requires_size() {
        let f = fixture(true).await;
        let mut dconf = DeviceConfig::new();
        dconf.insert("pool".into(), "rbd".into());
        dconf.insert("rbd_image".into(), "other".into());
        let config = LayeredConfig::parse(&dconf).unwrap();
        let repo = LvmOverRbd::load(
            "sr-x",
            config,
            EngineConfig::with_lock_dir(f._dir.path()),
            f.sim.clone(),
            f.cp.clone(),
            f.vgs.clone(),
        )
        .await;

        assert_matches!(repo.create().await, Err(Error::ConfigParameterMissing { .. }));
        assert!(!f.sim.has_image("other").await);
    }

    #[tokio::test]
    async fn test_create_rejects_claimed_device() {
        let f = fixture(false).await;
        f.cp
            .repository_config_set("sr-other", CLAIMED_DEVICE_KEY, "/dev/rbd0")
            .await
            .unwrap();

        assert_matches!(f.repo.create().await, Err(Error::DeviceInUse { .. }));
        // Unprotected: the failed create cleans up the image and mapping
        assert!(!f.sim.has_image("shared").await);
        assert_eq!(f.sim.mapping_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_create_keeps_protected_image() {
        let f = fixture(true).await;
        f.vgs.inner().fail_next("vgcreate").await;

        assert!(f.repo.create().await.is_err());
        assert!(f.sim.has_image("shared").await);
        assert_eq!(f.sim.mapping_count().await, 0);
    }

    #[tokio::test]
    async fn test_protected_delete_exports_and_keeps_image() {
        let f = fixture(true).await;
        f.repo.create().await.unwrap();
        f.repo.delete().await.unwrap();

        assert!(f.sim.has_image("shared").await);
        assert_eq!(f.vgs.inner().is_exported(&vg_name(SR)).await, Some(true));
        assert_eq!(f.sim.mapping_count().await, 0);
    }

    #[tokio::test]
    async fn test_unprotected_delete_destroys_everything() {
        let f = fixture(false).await;
        f.repo.create().await.unwrap();
        f.repo.delete().await.unwrap();

        assert!(!f.sim.has_image("shared").await);
        assert!(!f.vgs.inner().has_group(&vg_name(SR)).await);
        assert_eq!(f.sim.mapping_count().await, 0);
    }

    #[tokio::test]
    async fn test_attach_detach_cycle() {
        let f = fixture(true).await;
        f.repo.create().await.unwrap();
        f.repo.detach().await.unwrap();
        assert_eq!(f.vgs.inner().is_active(&vg_name(SR)).await, Some(false));
        assert_eq!(f.sim.mapping_count().await, 0);

        f.repo.attach().await.unwrap();
        assert_eq!(f.vgs.inner().is_active(&vg_name(SR)).await, Some(true));
        assert_eq!(f.sim.mapping_count().await, 1);
    }

    #[tokio::test]
    async fn test_failed_attach_unmaps() {
        let f = fixture(true).await;
        f.repo.create().await.unwrap();
        f.repo.detach().await.unwrap();

        f.vgs.inner().fail_next("vgchange").await;
        let err = f.repo.attach().await.unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Unavailable);
        assert_eq!(f.sim.mapping_count().await, 0);
    }

    #[tokio::test]
    async fn test_probe_leaves_mapping_as_found() {
        let f = fixture(true).await;
        f.repo.create().await.unwrap();
        let vg: VolumeGroupLifecycleRef = f.vgs.clone();
        let engine = EngineConfig::with_lock_dir(f._dir.path());

        let probes = LvmOverRbd::probe(f.sim.as_ref(), &f.repo.config, &engine, &vg)
            .await
            .unwrap();
        assert_eq!(probes.len(), 1);
        assert_eq!(f.sim.mapping_count().await, 1);

        f.repo.detach().await.unwrap();
        LvmOverRbd::probe(f.sim.as_ref(), &f.repo.config, &engine, &vg)
            .await
            .unwrap();
        assert_eq!(f.sim.mapping_count().await, 0);
    }

    #[tokio::test]
    async fn test_scan_and_resume() {
        let f = fixture(true).await;
        f.repo.create().await.unwrap();
        let uuid = "3f2504e0-4f89-11d3-9a0c-0305e82c3301";
        f.vgs
            .inner()
            .add_logical_volume(&vg_name(SR), &lv_name(uuid), 1024)
            .await
            .unwrap();

        let report = f.repo.scan().await.unwrap();
        assert_eq!(report.logical_volumes.len(), 1);
        assert_eq!(f.cp.stats(SR).unwrap().virtual_allocation, 1024);

        let json = f.repo.generate_config(uuid).await.unwrap();
        let resume = ResumeConfig::parse(&json).unwrap();
        assert_eq!(resume.device_config.get("rbd_image").map(String::as_str), Some("shared"));

        let path = f.repo.attach_from_config(uuid).await.unwrap();
        assert_eq!(path, format!("/dev/{}/{}", vg_name(SR), lv_name(uuid)));
    }

    #[tokio::test]
    async fn test_unmapped_repository() {
        let f = fixture(true).await;
        f.repo.create().await.unwrap();
        f.repo.detach().await.unwrap();

        assert_eq!(f.repo.refresh_size().await.unwrap(), None);
        assert!(f.repo.generate_config("x").await.is_err());
        assert!(f.repo.scan().await.is_err());
    }
}
