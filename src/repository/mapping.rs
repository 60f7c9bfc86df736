//! Device Mapping Tracker
//!
//! Which kernel device a volume is mapped to is local, advisory state: it
//! is cached on the volume and persisted under a host-qualified side-table
//! key, but the host's live mapping table is the truth. Reconciliation runs
//! before anything that depends on it (attach, detach, delete, activate)
//! and during scan.

use super::volume::Volume;
use super::Repository;
use crate::domain::ports::{ClusterClient, MappedDevice};
use crate::error::{Error, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Side-table key holding the device path a host mapped a volume to
pub fn host_key(host: &str) -> String {
    format!("host_{}", host)
}

/// Outcome of reconciling a volume against the live mapping table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingChange {
    /// Tracked state already matched
    Unchanged,
    /// Untracked volume found mapped; the path was adopted
    Adopted { device: String },
    /// The kernel moved the mapping to a different node
    Migrated { from: String, to: String },
    /// The tracked mapping is gone
    Cleared { device: String },
}

/// Reconcile one volume's mapping fields against the host's mapping table
///
/// `image`/`snap` are the cluster names the volume maps as.
pub fn reconcile(
    volume: &mut Volume,
    pool: &str,
    image: &str,
    snap: Option<&str>,
    mapped: &[MappedDevice],
) -> MappingChange {
    let matches: Vec<&MappedDevice> = mapped
        .iter()
        .filter(|m| m.is_of(pool, image, snap))
        .collect();

    match volume.mapped_path.clone() {
        Some(tracked) => {
            if matches.iter().any(|m| m.device == tracked) {
                volume.mapped = true;
                MappingChange::Unchanged
            } else if let Some(current) = matches.first() {
                volume.mapped = true;
                volume.mapped_path = Some(current.device.clone());
                MappingChange::Migrated {
                    from: tracked,
                    to: current.device.clone(),
                }
            } else {
                volume.mapped = false;
                volume.mapped_path = None;
                MappingChange::Cleared { device: tracked }
            }
        }
        None => match matches.first() {
            Some(current) => {
                volume.mapped = true;
                volume.mapped_path = Some(current.device.clone());
                MappingChange::Adopted {
                    device: current.device.clone(),
                }
            }
            None => {
                volume.mapped = false;
                MappingChange::Unchanged
            }
        },
    }
}

/// Map `name` and wait up to `wait` for its device node
///
/// A device that never shows up is unmapped again before failing.
pub async fn map_and_wait(cluster: &dyn ClusterClient, name: &str, wait: Duration) -> Result<String> {
    let device = cluster.map(name).await?;

    let mut backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(100))
        .with_max_interval(Duration::from_secs(2))
        .with_max_elapsed_time(Some(wait))
        .build();

    while !cluster.device_present(&device).await {
        match backoff.next_backoff() {
            Some(delay) => tokio::time::sleep(delay).await,
            None => {
                warn!("Device {} for {} never appeared, unmapping", device, name);
                if let Err(e) = cluster.unmap(&device).await {
                    warn!("Failed to unmap {}: {}", device, e);
                }
                return Err(Error::MapFailed {
                    image: name.to_string(),
                    reason: format!("device {} did not appear within {:?}", device, wait),
                });
            }
        }
    }

    debug!("Device {} for {} is present", device, name);
    Ok(device)
}

impl Repository {
    /// Reconcile a loaded volume and persist whatever changed
    pub(crate) async fn reconcile_mapping(
        &self,
        volume: &mut Volume,
        mapped: &[MappedDevice],
    ) -> Result<MappingChange> {
        let Some(name) = volume.cluster_name() else {
            volume.mapped = false;
            return Ok(MappingChange::Unchanged);
        };
        let (image, snap) = self.split_name(&name);

        let change = reconcile(volume, self.cluster.pool(), &image, snap.as_deref(), mapped);
        let host = self.control.current_host().await?;
        let key = host_key(&host);

        match &change {
            MappingChange::Unchanged => {}
            MappingChange::Adopted { device } | MappingChange::Migrated { to: device, .. } => {
                info!("Tracking {} at {} on host {} ({:?})", volume.uuid, device, host, change);
                self.persist_side_entry(&volume.uuid, &key, Some(device.as_str()))
                    .await;
            }
            MappingChange::Cleared { device } => {
                info!("{} is no longer mapped at {} on host {}", volume.uuid, device, host);
                self.persist_side_entry(&volume.uuid, &key, None).await;
            }
        }

        if volume.attached != volume.mapped {
            debug!(
                "{} attach flag ({}) and mapping ({}) diverge on host {}",
                volume.uuid, volume.attached, volume.mapped, host
            );
        }
        Ok(change)
    }

    /// Load a volume, reconcile it against the live table and store it
    pub(crate) async fn verify_mapping_locked(&self, uuid: &str) -> Result<(Volume, MappingChange)> {
        let mut volume = self.load_volume(uuid).await?;
        let mapped = self.cluster.show_mapped().await?;
        let change = self.reconcile_mapping(&mut volume, &mapped).await?;
        self.store_volume(volume.clone()).await;
        Ok((volume, change))
    }

    /// Write or remove one side-table entry, tolerating a missing record
    async fn persist_side_entry(&self, uuid: &str, key: &str, value: Option<&str>) {
        let result = match value {
            Some(v) => self.control.disk_config_set(&self.sr_uuid, uuid, key, v).await,
            None => self.control.disk_config_remove(&self.sr_uuid, uuid, key).await,
        };
        match result {
            Ok(()) => {}
            Err(Error::VolumeNotFound { .. }) => {
                debug!("No control-plane record for {}, {} not persisted", uuid, key)
            }
            Err(e) => warn!("Failed to persist {} for {}: {}", key, uuid, e),
        }
    }

    /// Record this host's device path for a volume
    pub(crate) async fn record_host_path(&self, uuid: &str, device: &str) -> Result<()> {
        let host = self.control.current_host().await?;
        self.control
            .disk_config_set(&self.sr_uuid, uuid, &host_key(&host), device)
            .await
    }

    /// Forget this host's device path for a volume
    pub(crate) async fn clear_host_path(&self, uuid: &str) -> Result<()> {
        let host = self.control.current_host().await?;
        self.control
            .disk_config_remove(&self.sr_uuid, uuid, &host_key(&host))
            .await
    }

    /// Map `name` and wait for the device node to show up
    pub(crate) async fn map_and_wait(&self, name: &str) -> Result<String> {
        map_and_wait(self.cluster.as_ref(), name, self.engine.device_wait).await
    }

    /// Unmap a device, logging instead of failing
    pub(crate) async fn unmap_quietly(&self, device: &str) {
        if let Err(e) = self.cluster.unmap(device).await {
            warn!("Failed to unmap {} (it may already be gone): {}", device, e);
        }
    }
}
