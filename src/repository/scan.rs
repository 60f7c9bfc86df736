//! Repository Scan
//!
//! Rebuilds the volume set from the pool listing, merges it with the
//! control plane's records and recomputes the virtual allocation.

use super::volume::Volume;
use super::Repository;
use crate::domain::ports::{DiskRecord, ImageEntry};
use crate::error::Result;
use crate::naming::Namespace;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// What a scan changed in the control plane
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Volumes found in the pool with no record yet
    pub introduced: Vec<String>,
    /// Records brought in line with the pool
    pub updated: Vec<String>,
    /// Records whose image vanished
    pub forgotten: Vec<String>,
    /// Total volumes after the scan
    pub volumes: usize,
    pub virtual_allocation: u64,
}

/// Turn pool listing rows into volumes of this namespace
pub fn volumes_from_listing(
    namespace: &Namespace,
    pool: &str,
    entries: &[ImageEntry],
) -> BTreeMap<String, Volume> {
    let mut volumes = BTreeMap::new();

    for entry in entries {
        let Some(image_uuid) = namespace.parse_image_name(&entry.image) else {
            continue;
        };

        let volume = match &entry.snapshot {
            None => {
                let mut volume = Volume::image(image_uuid, entry.size);
                volume.clone_of = entry
                    .parent
                    .as_ref()
                    .filter(|p| p.pool == pool && namespace.parse_image_name(&p.image).is_some())
                    .and_then(|p| namespace.parse_snapshot_name(&p.snapshot));
                volume
            }
            Some(snap) => {
                let Some(snap_uuid) = namespace.parse_snapshot_name(snap) else {
                    continue;
                };
                let mut volume = Volume::snapshot(snap_uuid, image_uuid, entry.size);
                volume.protected = entry.protected;
                volume
            }
        };
        volumes.insert(volume.uuid.clone(), volume);
    }

    volumes
}

/// Merge what the pool says into what the control plane remembers
///
/// The pool is authoritative for size, kind, parentage and protection;
/// the record keeps attach state, snapshot time and host paths.
fn merge(found: &Volume, record: &DiskRecord, host: &str) -> Volume {
    let mut merged = Volume::from_record(record, host);
    merged.size = found.size;
    merged.is_snapshot = found.is_snapshot;
    merged.read_only = found.read_only || record.read_only;
    if found.snapshot_of.is_some() {
        merged.snapshot_of = found.snapshot_of.clone();
    }
    merged.protected = found.protected;
    if found.clone_of.is_some() {
        merged.clone_of = found.clone_of.clone();
    }
    merged
}

impl Repository {
    pub(crate) async fn scan_locked(&self) -> Result<ScanReport> {
        let entries = self.cluster.list_images().await?;
        let found = volumes_from_listing(self.namespace(), self.cluster.pool(), &entries);
        let host = self.control.current_host().await?;

        let mut records: BTreeMap<String, DiskRecord> = self
            .control
            .list_disks(&self.sr_uuid)
            .await?
            .into_iter()
            .map(|r| (r.uuid.clone(), r))
            .collect();

        let mut report = ScanReport::default();
        let mut volumes = BTreeMap::new();

        for (uuid, volume) in found {
            match records.remove(&uuid) {
                Some(mut record) => {
                    let merged = merge(&volume, &record, &host);
                    if merged != Volume::from_record(&record, &host) {
                        merged.write_to(&mut record);
                        self.control.update_disk(&record).await?;
                        report.updated.push(uuid.clone());
                    }
                    volumes.insert(uuid, merged);
                }
                None => {
                    debug!("Introducing {} found in pool {}", uuid, self.cluster.pool());
                    self.control
                        .introduce_disk(volume.to_record(&self.sr_uuid))
                        .await?;
                    report.introduced.push(uuid.clone());
                    volumes.insert(uuid, volume);
                }
            }
        }

        for (uuid, record) in records {
            if record.attached {
                warn!("Image of attached VDI {} is missing, keeping its record", uuid);
                volumes.insert(uuid, Volume::from_record(&record, &host));
                continue;
            }
            info!("Forgetting VDI {}, its image is gone", uuid);
            self.control.forget_disk(&self.sr_uuid, &uuid).await?;
            report.forgotten.push(uuid);
        }

        match self.cluster.show_mapped().await {
            Ok(mapped) => {
                for volume in volumes.values_mut() {
                    self.reconcile_mapping(volume, &mapped).await?;
                }
            }
            Err(e) => warn!("Cannot read mapping table, skipping reconciliation: {}", e),
        }

        let total: u64 = volumes.values().map(|v| v.size).sum();
        if let Err(e) = self.set_allocation(total).await {
            warn!("Failed to store virtual allocation of {}: {}", self.sr_uuid, e);
        }

        report.volumes = volumes.len();
        self.state.write().await.volumes = volumes;

        let stats = self.refresh_stats_locked().await?;
        report.virtual_allocation = stats.virtual_allocation;

        info!(
            "Scanned {}: {} volumes, {} introduced, {} updated, {} forgotten",
            self.sr_uuid,
            report.volumes,
            report.introduced.len(),
            report.updated.len(),
            report.forgotten.len()
        );
        Ok(report)
    }

    /// Find the parent of a snapshot whose record lost it
    pub(crate) async fn repair_snapshot_parent(&self, uuid: &str) -> Result<Option<String>> {
        let snap = self.namespace().snapshot_name(uuid);
        let entries = self.cluster.list_images().await?;
        Ok(entries
            .iter()
            .filter(|e| e.snapshot.as_deref() == Some(snap.as_str()))
            .find_map(|e| self.namespace().parse_image_name(&e.image)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{ControlPlane, ParentSpec};
    use crate::repository::testing::{repository, UUID_A, UUID_B, UUID_C};
    use crate::repository::MIB;

    const GIB: u64 = 1024 * MIB;

    fn row(image: &str, snapshot: Option<&str>, size: u64) -> ImageEntry {
        ImageEntry {
            image: image.into(),
            snapshot: snapshot.map(str::to_string),
            size,
            protected: snapshot.is_some(),
            parent: None,
        }
    }

    #[test]
    fn test_listing_filters_foreign_names() {
        let ns = Namespace::new("").unwrap();
        let mut clone = row(&format!("vdi-{}", UUID_B), None, 10);
        clone.parent = Some(ParentSpec {
            pool: "rbd".into(),
            image: format!("vdi-{}", UUID_A),
            snapshot: format!("snap-{}", UUID_C),
        });
        let entries = vec![
            row(&format!("vdi-{}", UUID_A), None, 10),
            row(&format!("vdi-{}", UUID_A), Some(&format!("snap-{}", UUID_C)), 10),
            row(&format!("vdi-{}", UUID_A), Some("manual"), 10),
            row("someone-elses-image", None, 10),
            clone,
        ];

        let volumes = volumes_from_listing(&ns, "rbd", &entries);
        assert_eq!(volumes.len(), 3);
        let snap = &volumes[UUID_C];
        assert!(snap.is_snapshot && snap.protected);
        assert_eq!(snap.snapshot_of.as_deref(), Some(UUID_A));
        assert_eq!(volumes[UUID_B].clone_of.as_deref(), Some(UUID_C));
    }

    #[tokio::test]
    async fn test_scan_introduces_and_forgets() {
        let (repo, sim, cp, _dir) = repository().await;
        sim.inject_image(&format!("vdi-{}", UUID_A), GIB).await;
        sim.inject_image("not-ours", GIB).await;

        let report = repo.scan().await.unwrap();
        assert_eq!(report.introduced, vec![UUID_A.to_string()]);
        assert_eq!(report.virtual_allocation, GIB);
        assert!(cp.get_disk("sr-1", UUID_A).await.unwrap().is_some());

        sim.purge_image(&format!("vdi-{}", UUID_A)).await;
        let report = repo.scan().await.unwrap();
        assert_eq!(report.forgotten, vec![UUID_A.to_string()]);
        assert_eq!(report.virtual_allocation, 0);
        assert!(repo.volumes().await.is_empty());
    }

    #[tokio::test]
    async fn test_scan_picks_up_out_of_band_resize() {
        let (repo, sim, _cp, _dir) = repository().await;
        repo.vdi(UUID_A).create(GIB).await.unwrap();
        sim.inject_image(&format!("vdi-{}", UUID_A), 2 * GIB).await;

        let report = repo.scan().await.unwrap();
        assert_eq!(report.updated, vec![UUID_A.to_string()]);
        assert_eq!(repo.volume(UUID_A).await.unwrap().size, 2 * GIB);
    }

    #[tokio::test]
    async fn test_scan_clears_vanished_mapping() {
        let (repo, sim, cp, _dir) = repository().await;
        let vdi = repo.vdi(UUID_A);
        vdi.create(GIB).await.unwrap();
        let device = vdi.activate().await.unwrap();

        sim.drop_mapping(&device).await;
        repo.scan().await.unwrap();
        assert!(!repo.volume(UUID_A).await.unwrap().mapped);
        assert_eq!(
            cp.disk_config_get("sr-1", UUID_A, "host_host-1").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_scan_recomputes_drifted_allocation() {
        let (repo, _sim, cp, _dir) = repository().await;
        repo.vdi(UUID_A).create(GIB).await.unwrap();
        cp.adjust_allocation("sr-1", 5 * GIB as i64);

        let report = repo.scan().await.unwrap();
        assert_eq!(report.virtual_allocation, GIB);
        assert_eq!(cp.virtual_allocation("sr-1").await.unwrap(), GIB);
    }
}
