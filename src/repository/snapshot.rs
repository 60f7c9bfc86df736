//! Snapshot and Clone Protocol
//!
//! Snapshots are cluster snapshots of a volume's image, protected as soon
//! as they exist so that they can serve as clone parents. A clone of a
//! writable volume goes through an intermediate snapshot which stays
//! visible as its own read-only volume; a clone of a snapshot is made
//! directly from it.

use super::volume::Volume;
use super::Repository;
use crate::error::{Error, Result};
use crate::naming::{new_volume_uuid, ClusterName};
use chrono::Utc;
use tracing::{info, warn};

impl Repository {
    pub(crate) async fn snapshot_volume_locked(&self, uuid: &str) -> Result<Volume> {
        let parent = self.load_volume(uuid).await?;
        if parent.is_snapshot {
            return Err(Error::Unsupported {
                operation: "snapshot".into(),
                target: format!("snapshot {}", uuid),
            });
        }
        self.take_snapshot(&parent, &new_volume_uuid()).await
    }

    /// Create, protect and register a snapshot of `parent`
    async fn take_snapshot(&self, parent: &Volume, snap_uuid: &str) -> Result<Volume> {
        let image = self.namespace().image_name(&parent.uuid);
        let snap = self.namespace().snapshot_name(snap_uuid);
        info!("Snapshotting VDI {} as {}@{}", parent.uuid, image, snap);

        self.cluster.snap_create(&image, &snap).await?;
        if let Err(e) = self.cluster.snap_protect(&image, &snap).await {
            self.discard_snapshot(&image, &snap, false).await;
            return Err(e);
        }

        let mut volume = Volume::snapshot(snap_uuid, parent.uuid.clone(), parent.size);
        volume.protected = true;
        volume.snapshot_time = Some(Utc::now());

        if let Err(e) = self
            .control
            .introduce_disk(volume.to_record(&self.sr_uuid))
            .await
        {
            self.discard_snapshot(&image, &snap, true).await;
            return Err(e);
        }

        self.store_volume(volume.clone()).await;
        self.account(volume.size as i64).await;
        Ok(volume)
    }

    /// Best-effort removal of a snapshot left behind by a failed operation
    async fn discard_snapshot(&self, image: &str, snap: &str, protected: bool) {
        if protected {
            if let Err(e) = self.cluster.snap_unprotect(image, snap).await {
                warn!("Failed to unprotect {}@{} during cleanup: {}", image, snap, e);
            }
        }
        if let Err(e) = self.cluster.snap_remove(image, snap).await {
            warn!("Failed to remove {}@{} during cleanup: {}", image, snap, e);
        }
    }

    /// Unprotect and remove a snapshot; a snapshot that is already gone is
    /// not an error
    pub(crate) async fn remove_snapshot(&self, parent: &str, uuid: &str) -> Result<()> {
        let image = self.namespace().image_name(parent);
        let snap = self.namespace().snapshot_name(uuid);

        let entries = match self.cluster.list_snapshots(&image).await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => {
                info!("Parent image {} of snapshot {} is gone", image, uuid);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let Some(entry) = entries.iter().find(|s| s.name == snap) else {
            info!("Snapshot {}@{} already gone", image, snap);
            return Ok(());
        };

        if entry.protected {
            self.cluster.snap_unprotect(&image, &snap).await?;
        }

        match self.cluster.snap_remove(&image, &snap).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                if entry.protected {
                    if let Err(re) = self.cluster.snap_protect(&image, &snap).await {
                        warn!("Failed to re-protect {}@{}: {}", image, snap, re);
                    }
                }
                Err(e)
            }
        }
    }

    pub(crate) async fn clone_volume_locked(&self, uuid: &str) -> Result<Volume> {
        let source = self.load_volume(uuid).await?;

        let (mut snapshot, created) = if source.is_snapshot {
            (source, false)
        } else {
            (self.take_snapshot(&source, &new_volume_uuid()).await?, true)
        };

        match self.clone_from_snapshot(&mut snapshot).await {
            Ok(volume) => Ok(volume),
            Err(e) => {
                if created {
                    self.compensate_snapshot(&snapshot).await;
                }
                Err(e)
            }
        }
    }

    async fn clone_from_snapshot(&self, snapshot: &mut Volume) -> Result<Volume> {
        let Some(ClusterName::Snapshot { parent, uuid: snap_uuid }) =
            snapshot.cluster_name()
        else {
            return Err(Error::ImageNotFound {
                name: self.namespace().snapshot_name(&snapshot.uuid),
            });
        };
        let image = self.namespace().image_name(&parent);
        let snap = self.namespace().snapshot_name(&snap_uuid);

        if !snapshot.protected {
            self.cluster.snap_protect(&image, &snap).await?;
            snapshot.protected = true;
            self.persist_volume(snapshot).await?;
            self.store_volume(snapshot.clone()).await;
        }

        let clone_uuid = new_volume_uuid();
        let dest = self.namespace().image_name(&clone_uuid);
        info!("Cloning {}@{} into {}", image, snap, dest);

        if let Err(e) = self.cluster.clone_image(&image, &snap, &dest).await {
            self.remove_partial_image(&dest).await;
            return Err(e);
        }

        let mut volume = Volume::image(clone_uuid, snapshot.size);
        volume.clone_of = Some(snapshot.uuid.clone());
        if let Err(e) = self
            .control
            .introduce_disk(volume.to_record(&self.sr_uuid))
            .await
        {
            self.remove_partial_image(&dest).await;
            return Err(e);
        }

        self.store_volume(volume.clone()).await;
        self.account(volume.size as i64).await;
        Ok(volume)
    }

    /// Undo a snapshot taken by a clone that then failed
    async fn compensate_snapshot(&self, snapshot: &Volume) {
        if let Some(parent) = &snapshot.snapshot_of {
            if let Err(e) = self.remove_snapshot(parent, &snapshot.uuid).await {
                warn!("Failed to remove intermediate snapshot {}: {}", snapshot.uuid, e);
                return;
            }
        }
        if let Err(e) = self.control.forget_disk(&self.sr_uuid, &snapshot.uuid).await {
            warn!("Failed to forget intermediate snapshot {}: {}", snapshot.uuid, e);
        }
        self.forget_volume(&snapshot.uuid).await;
        self.account(-(snapshot.size as i64)).await;
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::ports::{ClusterClient, ControlPlane};
    use crate::error::Error;
    use crate::repository::testing::{repository, UUID_A};
    use crate::repository::MIB;
    use assert_matches::assert_matches;

    const GIB: u64 = 1024 * MIB;

    #[tokio::test]
    async fn test_snapshot_is_protected_and_readonly() {
        let (repo, sim, cp, _dir) = repository().await;
        repo.vdi(UUID_A).create(GIB).await.unwrap();

        let snap = repo.vdi(UUID_A).snapshot().await.unwrap();
        assert!(snap.read_only && snap.is_snapshot && snap.protected);
        assert_eq!(snap.snapshot_of.as_deref(), Some(UUID_A));
        assert!(snap.snapshot_time.is_some());

        let image = format!("vdi-{}", UUID_A);
        let name = format!("snap-{}", snap.uuid);
        assert_eq!(sim.snapshot_protected(&image, &name).await, Some(true));
        assert!(cp.get_disk("sr-1", &snap.uuid).await.unwrap().is_some());
        assert_eq!(repo.stats().await.virtual_allocation, 2 * GIB);
    }

    #[tokio::test]
    async fn test_snapshot_of_snapshot_unsupported() {
        let (repo, _sim, _cp, _dir) = repository().await;
        repo.vdi(UUID_A).create(GIB).await.unwrap();
        let snap = repo.vdi(UUID_A).snapshot().await.unwrap();
        assert_matches!(
            repo.vdi(&snap.uuid).snapshot().await,
            Err(Error::Unsupported { .. })
        );
    }

    #[tokio::test]
    async fn test_protect_failure_removes_snapshot() {
        let (repo, sim, _cp, _dir) = repository().await;
        repo.vdi(UUID_A).create(GIB).await.unwrap();
        sim.fail_next("snap protect").await;

        assert!(repo.vdi(UUID_A).snapshot().await.is_err());
        let snaps = sim.list_snapshots(&format!("vdi-{}", UUID_A)).await.unwrap();
        assert!(snaps.is_empty());
        assert_eq!(repo.volumes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_clone_of_volume_keeps_intermediate_snapshot() {
        let (repo, sim, _cp, _dir) = repository().await;
        repo.vdi(UUID_A).create(GIB).await.unwrap();

        let clone = repo.vdi(UUID_A).clone_volume().await.unwrap();
        let snap_uuid = clone.clone_of.clone().unwrap();
        let snap = repo.volume(&snap_uuid).await.unwrap();
        assert!(snap.is_snapshot);
        assert_eq!(snap.snapshot_of.as_deref(), Some(UUID_A));
        assert!(sim.has_image(&format!("vdi-{}", clone.uuid)).await);
        assert_eq!(repo.volumes().await.len(), 3);
    }

    #[tokio::test]
    async fn test_clone_of_snapshot_is_direct() {
        let (repo, _sim, _cp, _dir) = repository().await;
        repo.vdi(UUID_A).create(GIB).await.unwrap();
        let snap = repo.vdi(UUID_A).snapshot().await.unwrap();

        let clone = repo.vdi(&snap.uuid).clone_volume().await.unwrap();
        assert_eq!(clone.clone_of.as_deref(), Some(snap.uuid.as_str()));
        assert_eq!(repo.volumes().await.len(), 3);
    }

    #[tokio::test]
    async fn test_failed_clone_compensates_intermediate_snapshot() {
        let (repo, sim, _cp, _dir) = repository().await;
        repo.vdi(UUID_A).create(GIB).await.unwrap();
        sim.fail_next("clone").await;

        assert!(repo.vdi(UUID_A).clone_volume().await.is_err());
        let snaps = sim.list_snapshots(&format!("vdi-{}", UUID_A)).await.unwrap();
        assert!(snaps.is_empty());
        assert_eq!(repo.volumes().await.len(), 1);
        assert_eq!(repo.stats().await.virtual_allocation, GIB);
    }

    #[tokio::test]
    async fn test_snapshot_with_children_cannot_be_deleted() {
        let (repo, sim, _cp, _dir) = repository().await;
        repo.vdi(UUID_A).create(GIB).await.unwrap();
        let clone = repo.vdi(UUID_A).clone_volume().await.unwrap();
        let snap_uuid = clone.clone_of.clone().unwrap();

        let err = repo.vdi(&snap_uuid).delete().await.unwrap_err();
        assert_matches!(err, Error::HasChildren { .. });
        let name = format!("snap-{}", snap_uuid);
        assert_eq!(
            sim.snapshot_protected(&format!("vdi-{}", UUID_A), &name).await,
            Some(true)
        );

        // Once the clone is gone the snapshot goes, then the base
        repo.vdi(&clone.uuid).delete().await.unwrap();
        repo.vdi(&snap_uuid).delete().await.unwrap();
        repo.vdi(UUID_A).delete().await.unwrap();
        assert!(repo.volumes().await.is_empty());
        assert_eq!(repo.stats().await.virtual_allocation, 0);
    }

    #[tokio::test]
    async fn test_base_with_snapshots_cannot_be_deleted() {
        let (repo, _sim, _cp, _dir) = repository().await;
        repo.vdi(UUID_A).create(GIB).await.unwrap();
        repo.vdi(UUID_A).snapshot().await.unwrap();

        assert_matches!(
            repo.vdi(UUID_A).delete().await,
            Err(Error::HasSnapshots { .. })
        );
    }
}
