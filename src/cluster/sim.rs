//! Simulated Cluster
//!
//! An in-memory pool that behaves like the `rbd` tool surface: images,
//! snapshots with protection, clone parentage, watchers and local kernel
//! mappings. It supports out-of-band mutation and fault injection so the
//! reconciliation and compensation paths can be exercised without a
//! cluster.

use crate::domain::ports::{
    ClusterClient, ImageEntry, MappedDevice, ParentSpec, PoolQuota, PoolUsage, SnapshotEntry,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;
use tracing::debug;

const MIB: u64 = 1024 * 1024;

/// Free space reported by a fresh simulated pool
pub const DEFAULT_SIM_CAPACITY: u64 = 1024 * 1024 * MIB;

// =============================================================================
// Simulated State
// =============================================================================

#[derive(Debug, Clone)]
struct SimSnapshot {
    id: u64,
    size: u64,
    protected: bool,
}

#[derive(Debug, Clone)]
struct SimImage {
    size: u64,
    parent: Option<ParentSpec>,
    snapshots: BTreeMap<String, SimSnapshot>,
}

#[derive(Debug)]
struct SimState {
    images: BTreeMap<String, SimImage>,
    /// Local kernel mappings keyed by device node
    mappings: BTreeMap<String, MappedDevice>,
    /// Images watched by some other host
    remote_watchers: BTreeSet<String>,
    next_device: u32,
    next_snap_id: u64,
    quota: PoolQuota,
    usage: PoolUsage,
    reachable: bool,
    /// Operations whose next invocation fails
    faults: Vec<String>,
}

// =============================================================================
// Simulated Cluster
// =============================================================================

/// In-memory stand-in for one Ceph pool seen from one host
pub struct SimCluster {
    pool: String,
    state: RwLock<SimState>,
}

impl SimCluster {
    /// Create an empty, reachable pool with no quota
    pub fn new(pool: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            state: RwLock::new(SimState {
                images: BTreeMap::new(),
                mappings: BTreeMap::new(),
                remote_watchers: BTreeSet::new(),
                next_device: 0,
                next_snap_id: 1,
                quota: PoolQuota::default(),
                usage: PoolUsage {
                    max_avail: DEFAULT_SIM_CAPACITY,
                    stored: Some(0),
                    bytes_used: Some(0),
                },
                reachable: true,
                faults: Vec::new(),
            }),
        }
    }

    /// Make the next call of `operation` fail (e.g. `"snap protect"`)
    pub async fn fail_next(&self, operation: &str) {
        self.state.write().await.faults.push(operation.to_string());
    }

    pub async fn set_reachable(&self, reachable: bool) {
        self.state.write().await.reachable = reachable;
    }

    pub async fn set_quota(&self, quota: PoolQuota) {
        self.state.write().await.quota = quota;
    }

    pub async fn set_usage(&self, usage: PoolUsage) {
        self.state.write().await.usage = usage;
    }

    /// Pretend another host has `image` open
    pub async fn add_remote_watcher(&self, image: &str) {
        self.state.write().await.remote_watchers.insert(image.to_string());
    }

    pub async fn remove_remote_watcher(&self, image: &str) {
        self.state.write().await.remote_watchers.remove(image);
    }

    /// Unmap a device behind the driver's back
    pub async fn drop_mapping(&self, device: &str) {
        self.state.write().await.mappings.remove(device);
    }

    /// Move a mapping to a different device node behind the driver's back
    pub async fn move_mapping(&self, device: &str, new_device: &str) {
        let mut state = self.state.write().await;
        if let Some(mut mapping) = state.mappings.remove(device) {
            mapping.device = new_device.to_string();
            state.mappings.insert(new_device.to_string(), mapping);
        }
    }

    /// Create an image behind the driver's back
    pub async fn inject_image(&self, image: &str, size: u64) {
        self.state.write().await.images.insert(
            image.to_string(),
            SimImage {
                size,
                parent: None,
                snapshots: BTreeMap::new(),
            },
        );
    }

    /// Remove an image behind the driver's back, snapshots and all
    pub async fn purge_image(&self, image: &str) {
        self.state.write().await.images.remove(image);
    }

    pub async fn image_size(&self, image: &str) -> Option<u64> {
        self.state.read().await.images.get(image).map(|i| i.size)
    }

    pub async fn has_image(&self, image: &str) -> bool {
        self.state.read().await.images.contains_key(image)
    }

    /// Protection flag of a snapshot, `None` if it does not exist
    pub async fn snapshot_protected(&self, image: &str, snapshot: &str) -> Option<bool> {
        let state = self.state.read().await;
        state
            .images
            .get(image)
            .and_then(|i| i.snapshots.get(snapshot))
            .map(|s| s.protected)
    }

    pub async fn mapping_count(&self) -> usize {
        self.state.read().await.mappings.len()
    }

    fn take_fault(state: &mut SimState, operation: &str, target: &str) -> Result<()> {
        if let Some(pos) = state.faults.iter().position(|f| f == operation) {
            state.faults.remove(pos);
            debug!("Injected failure for {} on {}", operation, target);
            return Err(Error::CommandFailed {
                command: format!("rbd {}", operation),
                target: target.to_string(),
                stderr: "injected failure".into(),
            });
        }
        Ok(())
    }

    fn check_reachable(state: &SimState) -> Result<()> {
        if state.reachable {
            Ok(())
        } else {
            Err(Error::ClusterUnavailable {
                reason: "error connecting to the cluster".into(),
            })
        }
    }

    fn children_of(&self, state: &SimState, image: &str, snapshot: &str) -> Vec<String> {
        state
            .images
            .iter()
            .filter(|(_, i)| {
                i.parent.as_ref().is_some_and(|p| {
                    p.pool == self.pool && p.image == image && p.snapshot == snapshot
                })
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn snapshot_mut<'a>(
        state: &'a mut SimState,
        image: &str,
        snapshot: &str,
    ) -> Result<&'a mut SimSnapshot> {
        state
            .images
            .get_mut(image)
            .and_then(|i| i.snapshots.get_mut(snapshot))
            .ok_or_else(|| Error::ImageNotFound {
                name: format!("{}@{}", image, snapshot),
            })
    }
}

#[async_trait]
impl ClusterClient for SimCluster {
    fn pool(&self) -> &str {
        &self.pool
    }

    async fn health(&self) -> Result<String> {
        let mut state = self.state.write().await;
        Self::check_reachable(&state)?;
        Self::take_fault(&mut state, "health", "cluster")?;
        Ok("HEALTH_OK".into())
    }

    async fn pool_stats(&self) -> Result<()> {
        let state = self.state.read().await;
        if !state.reachable {
            return Err(Error::PoolUnavailable {
                pool: self.pool.clone(),
                reason: "error connecting to the cluster".into(),
            });
        }
        Ok(())
    }

    async fn list_images(&self) -> Result<Vec<ImageEntry>> {
        let mut state = self.state.write().await;
        Self::check_reachable(&state)?;
        Self::take_fault(&mut state, "ls", &self.pool)?;

        let mut entries = Vec::new();
        for (name, image) in &state.images {
            entries.push(ImageEntry {
                image: name.clone(),
                snapshot: None,
                size: image.size,
                protected: false,
                parent: image.parent.clone(),
            });
            for (snap, s) in &image.snapshots {
                entries.push(ImageEntry {
                    image: name.clone(),
                    snapshot: Some(snap.clone()),
                    size: s.size,
                    protected: s.protected,
                    parent: None,
                });
            }
        }
        Ok(entries)
    }

    async fn list_snapshots(&self, image: &str) -> Result<Vec<SnapshotEntry>> {
        let state = self.state.read().await;
        Self::check_reachable(&state)?;
        let image_state = state.images.get(image).ok_or_else(|| Error::ImageNotFound {
            name: image.to_string(),
        })?;
        Ok(image_state
            .snapshots
            .iter()
            .map(|(name, s)| SnapshotEntry {
                id: s.id,
                name: name.clone(),
                size: s.size,
                protected: s.protected,
            })
            .collect())
    }

    async fn list_children(&self, image: &str, snapshot: &str) -> Result<Vec<String>> {
        let state = self.state.read().await;
        Self::check_reachable(&state)?;
        Ok(self.children_of(&state, image, snapshot))
    }

    async fn pool_quota(&self) -> Result<PoolQuota> {
        let mut state = self.state.write().await;
        Self::check_reachable(&state)?;
        Self::take_fault(&mut state, "get-quota", &self.pool)?;
        Ok(state.quota)
    }

    async fn pool_usage(&self) -> Result<PoolUsage> {
        let mut state = self.state.write().await;
        Self::check_reachable(&state)?;
        Self::take_fault(&mut state, "df", &self.pool)?;
        Ok(state.usage)
    }

    async fn create_image(&self, image: &str, size_mb: u64) -> Result<()> {
        let mut state = self.state.write().await;
        Self::check_reachable(&state)?;
        Self::take_fault(&mut state, "create", image)?;

        if state.images.contains_key(image) {
            return Err(Error::CreateFailed {
                image: image.to_string(),
                reason: "rbd: create error: (17) File exists".into(),
            });
        }
        state.images.insert(
            image.to_string(),
            SimImage {
                size: size_mb * MIB,
                parent: None,
                snapshots: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        let mut state = self.state.write().await;
        Self::check_reachable(&state)?;
        Self::take_fault(&mut state, "rm", image)?;

        let image_state = state.images.get(image).ok_or_else(|| Error::ImageNotFound {
            name: image.to_string(),
        })?;
        if !image_state.snapshots.is_empty() {
            return Err(Error::HasSnapshots {
                volume: image.to_string(),
                reason: "image has snapshots - not removing".into(),
            });
        }
        let locally_mapped = state
            .mappings
            .values()
            .any(|m| m.name == image && m.pool == self.pool);
        if locally_mapped || state.remote_watchers.contains(image) {
            return Err(Error::VolumeInUse {
                volume: image.to_string(),
                reason: "still mapped on one or more hosts: image still has watchers".into(),
            });
        }

        state.images.remove(image);
        Ok(())
    }

    async fn resize_image(&self, image: &str, size_mb: u64) -> Result<()> {
        let mut state = self.state.write().await;
        Self::check_reachable(&state)?;
        Self::take_fault(&mut state, "resize", image)?;

        let image_state = state
            .images
            .get_mut(image)
            .ok_or_else(|| Error::ImageNotFound {
                name: image.to_string(),
            })?;
        image_state.size = size_mb * MIB;
        Ok(())
    }

    async fn map(&self, name: &str) -> Result<String> {
        let mut state = self.state.write().await;
        Self::check_reachable(&state)?;
        if let Err(e) = Self::take_fault(&mut state, "map", name) {
            return Err(Error::MapFailed {
                image: name.to_string(),
                reason: e.to_string(),
            });
        }

        let (image, snap) = match name.split_once('@') {
            Some((image, snap)) => (image, Some(snap)),
            None => (name, None),
        };
        let exists = state
            .images
            .get(image)
            .is_some_and(|i| snap.map_or(true, |s| i.snapshots.contains_key(s)));
        if !exists {
            return Err(Error::MapFailed {
                image: name.to_string(),
                reason: "rbd: error opening image: (2) No such file or directory".into(),
            });
        }

        let device = format!("/dev/rbd{}", state.next_device);
        state.next_device += 1;
        state.mappings.insert(
            device.clone(),
            MappedDevice {
                pool: self.pool.clone(),
                name: image.to_string(),
                snap: snap.map(str::to_string),
                device: device.clone(),
            },
        );
        Ok(device)
    }

    async fn unmap(&self, device: &str) -> Result<()> {
        let mut state = self.state.write().await;
        Self::take_fault(&mut state, "unmap", device)?;

        if state.mappings.remove(device).is_none() {
            return Err(Error::CommandFailed {
                command: "rbd unmap".into(),
                target: device.to_string(),
                stderr: format!("rbd: {} is not an rbd device", device),
            });
        }
        Ok(())
    }

    async fn show_mapped(&self) -> Result<Vec<MappedDevice>> {
        let mut state = self.state.write().await;
        Self::take_fault(&mut state, "showmapped", "local mappings")?;
        Ok(state.mappings.values().cloned().collect())
    }

    async fn snap_create(&self, image: &str, snapshot: &str) -> Result<()> {
        let mut state = self.state.write().await;
        Self::check_reachable(&state)?;
        Self::take_fault(&mut state, "snap create", image)?;

        let id = state.next_snap_id;
        let image_state = state
            .images
            .get_mut(image)
            .ok_or_else(|| Error::ImageNotFound {
                name: image.to_string(),
            })?;
        if image_state.snapshots.contains_key(snapshot) {
            return Err(Error::SnapshotFailed {
                image: image.to_string(),
                reason: format!("snapshot {} already exists", snapshot),
            });
        }
        let size = image_state.size;
        image_state.snapshots.insert(
            snapshot.to_string(),
            SimSnapshot {
                id,
                size,
                protected: false,
            },
        );
        state.next_snap_id += 1;
        Ok(())
    }

    async fn snap_protect(&self, image: &str, snapshot: &str) -> Result<()> {
        let mut state = self.state.write().await;
        Self::check_reachable(&state)?;
        Self::take_fault(&mut state, "snap protect", image)?;
        Self::snapshot_mut(&mut state, image, snapshot)?.protected = true;
        Ok(())
    }

    async fn snap_unprotect(&self, image: &str, snapshot: &str) -> Result<()> {
        let mut state = self.state.write().await;
        Self::check_reachable(&state)?;
        Self::take_fault(&mut state, "snap unprotect", image)?;

        let children = self.children_of(&state, image, snapshot);
        if !children.is_empty() {
            return Err(Error::HasChildren {
                snapshot: format!("{}@{}", image, snapshot),
                reason: format!("cannot unprotect: children {}", children.join(", ")),
            });
        }
        Self::snapshot_mut(&mut state, image, snapshot)?.protected = false;
        Ok(())
    }

    async fn snap_remove(&self, image: &str, snapshot: &str) -> Result<()> {
        let mut state = self.state.write().await;
        Self::check_reachable(&state)?;
        Self::take_fault(&mut state, "snap rm", image)?;

        if Self::snapshot_mut(&mut state, image, snapshot)?.protected {
            return Err(Error::SnapshotProtected {
                snapshot: format!("{}@{}", image, snapshot),
            });
        }
        if let Some(image_state) = state.images.get_mut(image) {
            image_state.snapshots.remove(snapshot);
        }
        Ok(())
    }

    async fn clone_image(&self, image: &str, snapshot: &str, dest: &str) -> Result<()> {
        let mut state = self.state.write().await;
        Self::check_reachable(&state)?;
        Self::take_fault(&mut state, "clone", dest)?;

        let source = Self::snapshot_mut(&mut state, image, snapshot)?;
        if !source.protected {
            return Err(Error::CommandFailed {
                command: "rbd clone".into(),
                target: dest.to_string(),
                stderr: "rbd: clone error: (22) Invalid argument: parent snapshot must be protected"
                    .into(),
            });
        }
        let size = source.size;
        if state.images.contains_key(dest) {
            return Err(Error::CreateFailed {
                image: dest.to_string(),
                reason: "rbd: clone error: (17) File exists".into(),
            });
        }

        state.images.insert(
            dest.to_string(),
            SimImage {
                size,
                parent: Some(ParentSpec {
                    pool: self.pool.clone(),
                    image: image.to_string(),
                    snapshot: snapshot.to_string(),
                }),
                snapshots: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn device_present(&self, device: &str) -> bool {
        self.state.read().await.mappings.contains_key(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_create_map_remove() {
        let sim = SimCluster::new("rbd");
        sim.create_image("vdi-a", 10).await.unwrap();
        assert_eq!(sim.image_size("vdi-a").await, Some(10 * MIB));

        let dev = sim.map("vdi-a").await.unwrap();
        assert!(sim.device_present(&dev).await);
        assert_matches!(sim.remove_image("vdi-a").await, Err(Error::VolumeInUse { .. }));

        sim.unmap(&dev).await.unwrap();
        sim.remove_image("vdi-a").await.unwrap();
        assert_matches!(
            sim.remove_image("vdi-a").await,
            Err(Error::ImageNotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_snapshot_protection_and_children() {
        let sim = SimCluster::new("rbd");
        sim.create_image("vdi-a", 10).await.unwrap();
        sim.snap_create("vdi-a", "snap-s").await.unwrap();

        // Clone requires protection
        assert!(sim.clone_image("vdi-a", "snap-s", "vdi-b").await.is_err());
        sim.snap_protect("vdi-a", "snap-s").await.unwrap();
        sim.clone_image("vdi-a", "snap-s", "vdi-b").await.unwrap();

        assert_eq!(
            sim.list_children("vdi-a", "snap-s").await.unwrap(),
            vec!["vdi-b".to_string()]
        );
        assert_matches!(
            sim.snap_unprotect("vdi-a", "snap-s").await,
            Err(Error::HasChildren { .. })
        );
        assert_matches!(
            sim.snap_remove("vdi-a", "snap-s").await,
            Err(Error::SnapshotProtected { .. })
        );
        assert_matches!(
            sim.remove_image("vdi-a").await,
            Err(Error::HasSnapshots { .. })
        );

        sim.remove_image("vdi-b").await.unwrap();
        sim.snap_unprotect("vdi-a", "snap-s").await.unwrap();
        sim.snap_remove("vdi-a", "snap-s").await.unwrap();
        sim.remove_image("vdi-a").await.unwrap();
    }

    #[tokio::test]
    async fn test_fault_injection_is_one_shot() {
        let sim = SimCluster::new("rbd");
        sim.fail_next("create").await;
        assert_matches!(
            sim.create_image("vdi-a", 1).await,
            Err(Error::CommandFailed { .. })
        );
        sim.create_image("vdi-a", 1).await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_cluster() {
        let sim = SimCluster::new("rbd");
        sim.set_reachable(false).await;
        assert_matches!(sim.health().await, Err(Error::ClusterUnavailable { .. }));
        assert_matches!(sim.pool_stats().await, Err(Error::PoolUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_listing_includes_snapshots() {
        let sim = SimCluster::new("rbd");
        sim.create_image("vdi-a", 4).await.unwrap();
        sim.snap_create("vdi-a", "snap-s").await.unwrap();
        sim.snap_protect("vdi-a", "snap-s").await.unwrap();

        let entries = sim.list_images().await.unwrap();
        assert_eq!(entries.len(), 2);
        let snap = entries.iter().find(|e| e.snapshot.is_some()).unwrap();
        assert!(snap.protected);
        assert_eq!(snap.size, 4 * MIB);
    }
}
