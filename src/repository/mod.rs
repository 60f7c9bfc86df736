//! Storage Repository
//!
//! A [`Repository`] is one pool namespace as seen by the control plane. It
//! owns the live volume set and drives every lifecycle operation through
//! the cluster and control-plane ports. Mutating operations hold the
//! repository lock for their whole duration.

pub mod capacity;
pub mod mapping;
pub mod scan;
pub mod snapshot;
pub mod volume;

pub use capacity::{physical_capacity, CapacityLimit, PhysicalCapacity};
pub use mapping::{host_key, MappingChange};
pub use scan::ScanReport;
pub use volume::{ResumeConfig, Vdi, Volume};

use crate::config::{EngineConfig, RepositoryConfig};
use crate::domain::ports::{
    ClusterClient, ClusterClientRef, ControlPlaneRef, RepositoryStats,
};
use crate::error::{Error, Result};
use crate::lock::RepositoryLock;
use crate::naming::{ClusterName, Namespace};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// One mebibyte; image sizes are whole MiB
pub const MIB: u64 = 1024 * 1024;

/// Bytes rounded up to whole MiB, at least one
pub(crate) fn mib_ceil(bytes: u64) -> u64 {
    bytes.div_ceil(MIB).max(1)
}

/// Result of probing a pool for repository contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub pool: String,
    pub prefix: String,
    /// Volume UUIDs visible in the namespace
    pub volumes: Vec<String>,
    pub physical_size: u64,
    pub physical_utilisation: u64,
}

#[derive(Debug, Default)]
struct RepositoryState {
    volumes: BTreeMap<String, Volume>,
    stats: RepositoryStats,
    allocation_loaded: bool,
}

/// RBD-backed storage repository
pub struct Repository {
    sr_uuid: String,
    config: RepositoryConfig,
    engine: EngineConfig,
    cluster: ClusterClientRef,
    control: ControlPlaneRef,
    state: RwLock<RepositoryState>,
}

impl Repository {
    pub fn new(
        sr_uuid: impl Into<String>,
        config: RepositoryConfig,
        engine: EngineConfig,
        cluster: ClusterClientRef,
        control: ControlPlaneRef,
    ) -> Self {
        Self {
            sr_uuid: sr_uuid.into(),
            config,
            engine,
            cluster,
            control,
            state: RwLock::new(RepositoryState::default()),
        }
    }

    pub fn sr_uuid(&self) -> &str {
        &self.sr_uuid
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn namespace(&self) -> &Namespace {
        &self.config.namespace
    }

    pub fn engine(&self) -> &EngineConfig {
        &self.engine
    }

    pub fn cluster(&self) -> &ClusterClientRef {
        &self.cluster
    }

    pub fn control(&self) -> &ControlPlaneRef {
        &self.control
    }

    /// Handle on one disk of this repository
    pub fn vdi(&self, uuid: impl Into<String>) -> Vdi<'_> {
        Vdi::new(self, uuid)
    }

    /// Take the repository lock
    pub async fn lock(&self) -> Result<RepositoryLock> {
        RepositoryLock::acquire(&self.engine.lock_dir, &self.sr_uuid).await
    }

    /// Snapshot of the live volume set
    pub async fn volumes(&self) -> Vec<Volume> {
        self.state.read().await.volumes.values().cloned().collect()
    }

    pub async fn volume(&self, uuid: &str) -> Option<Volume> {
        self.state.read().await.volumes.get(uuid).cloned()
    }

    /// Last published statistics
    pub async fn stats(&self) -> RepositoryStats {
        self.state.read().await.stats
    }

    // =========================================================================
    // Repository Operations
    // =========================================================================

    /// Report what a pool namespace holds without touching the control plane
    pub async fn probe(cluster: &dyn ClusterClient, namespace: &Namespace) -> Result<ProbeReport> {
        check_connectivity(cluster).await?;
        let entries = cluster.list_images().await?;
        let volumes = scan::volumes_from_listing(namespace, cluster.pool(), &entries)
            .into_keys()
            .collect();
        let capacity = physical_capacity(cluster).await?;

        Ok(ProbeReport {
            pool: cluster.pool().to_string(),
            prefix: namespace.prefix().to_string(),
            volumes,
            physical_size: capacity.total,
            physical_utilisation: capacity.used,
        })
    }

    /// Set up a new repository on an existing pool
    pub async fn create(&self) -> Result<RepositoryStats> {
        let _lock = self.lock().await?;
        check_connectivity(self.cluster.as_ref()).await?;
        self.cluster.pool_stats().await?;

        self.set_allocation(0).await?;
        let stats = self.refresh_stats_locked().await?;
        info!(
            "Created repository {} on pool {} (namespace {})",
            self.sr_uuid,
            self.cluster.pool(),
            self.namespace()
        );
        Ok(stats)
    }

    /// Delete every volume of the repository; the pool itself stays
    ///
    /// Volumes are retried in passes so that clones go before their
    /// snapshots and snapshots before their bases. Whatever cannot be
    /// deleted is logged and left behind.
    pub async fn delete(&self) -> Result<()> {
        let _lock = self.lock().await?;
        self.scan_locked().await?;

        let mut remaining = self.volumes().await;
        remaining.sort_by_key(|v| match (v.clone_of.is_some(), v.is_snapshot) {
            (true, _) => 0,
            (false, true) => 1,
            (false, false) => 2,
        });

        loop {
            let before = remaining.len();
            let mut failed = Vec::new();
            for volume in remaining {
                if let Err(e) = self.delete_volume_locked(&volume.uuid).await {
                    failed.push((volume, e));
                }
            }
            if failed.is_empty() {
                break;
            }
            if failed.len() == before {
                for (volume, e) in &failed {
                    warn!("Leaving VDI {} behind: {}", volume.uuid, e);
                }
                break;
            }
            remaining = failed.into_iter().map(|(v, _)| v).collect();
        }

        info!("Deleted repository {}", self.sr_uuid);
        Ok(())
    }

    /// Bring the repository online on this host
    pub async fn attach(&self) -> Result<ScanReport> {
        let _lock = self.lock().await?;
        check_connectivity(self.cluster.as_ref()).await?;
        self.scan_locked().await
    }

    /// Detach every volume this host still has mapped
    pub async fn detach(&self) -> Result<()> {
        let _lock = self.lock().await?;
        for volume in self.volumes().await {
            if !volume.mapped && !volume.attached {
                continue;
            }
            if let Err(e) = self.detach_volume_locked(&volume.uuid).await {
                warn!("Failed to detach VDI {}: {}", volume.uuid, e);
            }
        }
        info!("Detached repository {}", self.sr_uuid);
        Ok(())
    }

    pub async fn scan(&self) -> Result<ScanReport> {
        let _lock = self.lock().await?;
        self.scan_locked().await
    }

    /// Refresh and publish capacity figures
    pub async fn stat(&self) -> Result<RepositoryStats> {
        let _lock = self.lock().await?;
        self.refresh_stats_locked().await
    }

    pub async fn update(&self) -> Result<RepositoryStats> {
        self.stat().await
    }

    // =========================================================================
    // Volume Bookkeeping
    // =========================================================================

    /// Image and optional snapshot name a cluster name maps to
    pub(crate) fn split_name(&self, name: &ClusterName) -> (String, Option<String>) {
        match name {
            ClusterName::Image { uuid } => (self.namespace().image_name(uuid), None),
            ClusterName::Snapshot { parent, uuid } => (
                self.namespace().image_name(parent),
                Some(self.namespace().snapshot_name(uuid)),
            ),
        }
    }

    /// Load a volume from its control-plane record, repairing a lost
    /// snapshot parent on the way
    pub(crate) async fn load_volume(&self, uuid: &str) -> Result<Volume> {
        let mut volume = match self.control.get_disk(&self.sr_uuid, uuid).await? {
            Some(record) => {
                let host = self.control.current_host().await?;
                Volume::from_record(&record, &host)
            }
            None => self
                .volume(uuid)
                .await
                .ok_or_else(|| Error::VolumeNotFound {
                    uuid: uuid.to_string(),
                })?,
        };

        if volume.is_snapshot && volume.snapshot_of.is_none() {
            match self.repair_snapshot_parent(uuid).await {
                Ok(Some(parent)) => {
                    info!("Repaired parent of snapshot {}: {}", uuid, parent);
                    volume.snapshot_of = Some(parent);
                    if let Err(e) = self.persist_volume(&volume).await {
                        warn!("Failed to store repaired parent of {}: {}", uuid, e);
                    }
                }
                Ok(None) => warn!("No parent found for snapshot {}", uuid),
                Err(e) => warn!("Cannot look up parent of snapshot {}: {}", uuid, e),
            }
        }
        Ok(volume)
    }

    pub(crate) async fn store_volume(&self, volume: Volume) {
        self.state
            .write()
            .await
            .volumes
            .insert(volume.uuid.clone(), volume);
    }

    pub(crate) async fn forget_volume(&self, uuid: &str) {
        self.state.write().await.volumes.remove(uuid);
    }

    /// Write a volume's fields to its record, creating it if missing
    pub(crate) async fn persist_volume(&self, volume: &Volume) -> Result<()> {
        match self.control.get_disk(&self.sr_uuid, &volume.uuid).await? {
            Some(mut record) => {
                volume.write_to(&mut record);
                self.control.update_disk(&record).await
            }
            None => {
                self.control
                    .introduce_disk(volume.to_record(&self.sr_uuid))
                    .await
            }
        }
    }
}

/// Cluster reachable and pool listable
pub async fn check_connectivity(cluster: &dyn ClusterClient) -> Result<()> {
    cluster.health().await?;
    cluster
        .list_images()
        .await
        .map_err(|e| match e {
            Error::ClusterUnavailable { .. } => e,
            other => Error::PoolUnavailable {
                pool: cluster.pool().to_string(),
                reason: other.to_string(),
            },
        })?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::cluster::SimCluster;
    use crate::config::DeviceConfig;
    use crate::controlplane::MemoryControlPlane;
    use std::sync::Arc;
    use tempfile::TempDir;

    pub const UUID_A: &str = "3f2504e0-4f89-11d3-9a0c-0305e82c3301";
    pub const UUID_B: &str = "7d444840-9dc0-11d1-b245-5ffdce74fad2";
    pub const UUID_C: &str = "e902893a-9d22-3c7e-a7b8-d6e313b71d9f";

    /// A repository "sr-1" on pool "rbd", seen from "host-1"
    pub async fn repository() -> (Repository, Arc<SimCluster>, Arc<MemoryControlPlane>, TempDir) {
        let dir = TempDir::new().unwrap();
        let sim = Arc::new(SimCluster::new("rbd"));
        let cp = Arc::new(MemoryControlPlane::new("host-1"));

        let mut dconf = DeviceConfig::new();
        dconf.insert("pool".into(), "rbd".into());
        let config = RepositoryConfig::parse(&dconf).unwrap();

        let repo = Repository::new(
            "sr-1",
            config,
            EngineConfig::with_lock_dir(dir.path()),
            sim.clone(),
            cp.clone(),
        );
        (repo, sim, cp, dir)
    }
}
