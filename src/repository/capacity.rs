//! Capacity Accounting
//!
//! Physical figures always come from the cluster: the pool's byte quota
//! when one is set, otherwise the pool's policy-aware free space plus what
//! it stores. The virtual allocation is a counter owned by the control
//! plane; it is read once and then moved by signed deltas, each applied as
//! a compare-and-set against the live value so that concurrent hosts do
//! not lose each other's updates.

use super::Repository;
use crate::domain::ports::{ClusterClient, PoolQuota, PoolUsage, RepositoryStats};
use crate::error::{Error, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

// =============================================================================
// Physical Capacity
// =============================================================================

/// Which ceiling the physical figures describe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityLimit {
    /// Administrator-set pool quota
    Quota,
    /// What the cluster can still place in the pool
    Cluster,
}

impl fmt::Display for CapacityLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapacityLimit::Quota => write!(f, "quota"),
            CapacityLimit::Cluster => write!(f, "cluster"),
        }
    }
}

/// Physical size and utilisation of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalCapacity {
    pub total: u64,
    pub used: u64,
    pub limit: CapacityLimit,
}

impl PhysicalCapacity {
    pub fn free(&self) -> u64 {
        self.total.saturating_sub(self.used)
    }

    /// Capacity from a quota report, if a positive byte quota is set
    pub fn from_quota(quota: &PoolQuota) -> Option<Self> {
        (quota.quota_max_bytes > 0).then(|| {
            Self {
                total: quota.quota_max_bytes,
                used: quota.current_num_bytes,
                limit: CapacityLimit::Quota,
            }
            .clamped()
        })
    }

    /// Capacity from the cluster usage report
    pub fn from_usage(usage: &PoolUsage) -> Self {
        let used = usage.stored.or(usage.bytes_used).unwrap_or(0);
        Self {
            total: usage.max_avail.saturating_add(used),
            used,
            limit: CapacityLimit::Cluster,
        }
        .clamped()
    }

    /// A zero-sized repository is reported as one byte with nothing used
    fn clamped(self) -> Self {
        if self.total == 0 {
            Self {
                total: 1,
                used: 0,
                ..self
            }
        } else {
            self
        }
    }
}

/// Query the pool, preferring its quota over cluster-wide figures
pub async fn physical_capacity(cluster: &dyn ClusterClient) -> Result<PhysicalCapacity> {
    match cluster.pool_quota().await {
        Ok(quota) => {
            if let Some(capacity) = PhysicalCapacity::from_quota(&quota) {
                debug!(
                    "Pool {} quota: {} of {} bytes used",
                    cluster.pool(),
                    capacity.used,
                    capacity.total
                );
                return Ok(capacity);
            }
        }
        Err(e) => debug!("No quota information for pool {}: {}", cluster.pool(), e),
    }

    let usage = cluster.pool_usage().await?;
    Ok(PhysicalCapacity::from_usage(&usage))
}

fn apply_delta(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta as u64)
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

// =============================================================================
// Repository Accounting
// =============================================================================

impl Repository {
    /// Refresh physical figures from the cluster and publish them
    ///
    /// The allocation counter is only read here, never written.
    pub(crate) async fn refresh_stats_locked(&self) -> Result<RepositoryStats> {
        let capacity = physical_capacity(self.cluster.as_ref()).await?;

        let loaded = self.state.read().await.allocation_loaded;
        if !loaded {
            match self.control.virtual_allocation(&self.sr_uuid).await {
                Ok(allocation) => {
                    let mut state = self.state.write().await;
                    state.stats.virtual_allocation = allocation;
                    state.allocation_loaded = true;
                }
                // Stays unloaded so the next refresh tries again
                Err(e) => warn!(
                    "Cannot read virtual allocation of {}: {}",
                    self.sr_uuid, e
                ),
            }
        }

        let stats = {
            let mut state = self.state.write().await;
            state.stats.physical_size = capacity.total;
            state.stats.physical_utilisation = capacity.used;
            state.stats
        };

        self.control.publish_stats(&self.sr_uuid, &stats).await?;
        debug!(
            "Published stats for {}: size={} utilisation={} allocation={}",
            self.sr_uuid, stats.physical_size, stats.physical_utilisation, stats.virtual_allocation
        );
        Ok(stats)
    }

    /// Apply a signed change to the virtual allocation
    pub(crate) async fn update_allocation(&self, delta: i64) -> Result<u64> {
        self.swap_allocation(|current| apply_delta(current, delta))
            .await
    }

    /// Overwrite the virtual allocation with a freshly computed total
    pub(crate) async fn set_allocation(&self, total: u64) -> Result<u64> {
        self.swap_allocation(|_| total).await
    }

    /// Move the counter from its live value to `next(live)`
    ///
    /// The control plane's counter is authoritative. Between our read and
    /// the compare-and-set another host may write; the CAS then fails and
    /// we retry with backoff. A failed read is retried the same way. If no
    /// attempt could read the counter it is left as it is and only a
    /// previously loaded local total moves, drifting from other hosts'
    /// view until the next scan.
    async fn swap_allocation(&self, next: impl Fn(u64) -> u64) -> Result<u64> {
        let attempts = self.engine.allocation_attempts.max(1);
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(20))
            .with_max_interval(Duration::from_millis(500))
            .with_max_elapsed_time(None)
            .build();
        let mut read_error = None;

        for attempt in 1..=attempts {
            match self.control.virtual_allocation(&self.sr_uuid).await {
                Ok(current) => {
                    read_error = None;
                    let new = next(current);
                    let swapped = new == current
                        || self
                            .control
                            .compare_and_set_virtual_allocation(&self.sr_uuid, current, new)
                            .await?;
                    if swapped {
                        let mut state = self.state.write().await;
                        state.stats.virtual_allocation = new;
                        state.allocation_loaded = true;
                        debug!("Virtual allocation of {}: {} -> {}", self.sr_uuid, current, new);
                        return Ok(new);
                    }
                    debug!(
                        "Virtual allocation of {} changed under us (attempt {}/{})",
                        self.sr_uuid, attempt, attempts
                    );
                }
                Err(e) => {
                    debug!(
                        "Cannot read virtual allocation of {} (attempt {}/{}): {}",
                        self.sr_uuid, attempt, attempts, e
                    );
                    read_error = Some(e);
                }
            }

            if attempt < attempts {
                if let Some(wait) = backoff.next_backoff() {
                    tokio::time::sleep(wait).await;
                }
            }
        }

        if let Some(e) = read_error {
            let mut state = self.state.write().await;
            if state.allocation_loaded {
                state.stats.virtual_allocation = next(state.stats.virtual_allocation);
                warn!(
                    "Virtual allocation of {} unreadable, local total now {}",
                    self.sr_uuid, state.stats.virtual_allocation
                );
            }
            return Err(e);
        }

        Err(Error::AllocationContention {
            repository: self.sr_uuid.clone(),
            attempts,
        })
    }

    /// Apply a delta and publish, logging instead of failing: the
    /// operation that caused the delta has already happened, and the next
    /// scan recomputes the total.
    pub(crate) async fn account(&self, delta: i64) {
        if let Err(e) = self.update_allocation(delta).await {
            warn!("Failed to apply allocation delta {} to {}: {}", delta, self.sr_uuid, e);
        }
        if let Err(e) = self.refresh_stats_locked().await {
            warn!("Failed to publish stats for {}: {}", self.sr_uuid, e);
        }
    }

    /// Fail early when the pool clearly cannot hold `size` more bytes
    pub(crate) async fn check_free_space(&self, size: u64) -> Result<()> {
        let capacity = match physical_capacity(self.cluster.as_ref()).await {
            Ok(c) => c,
            Err(e) => {
                warn!("Skipping free-space check for {}: {}", self.sr_uuid, e);
                return Ok(());
            }
        };

        let free = capacity.free();
        if free > 0 && size > free {
            return Err(Error::InsufficientCapacity {
                requested: size,
                available: free,
                limit: capacity.limit.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::SimCluster;
    use crate::domain::ports::ControlPlane;
    use crate::repository::testing::{repository, UUID_A};
    use crate::repository::MIB;
    use assert_matches::assert_matches;

    const GIB: u64 = 1024 * MIB;

    #[test]
    fn test_quota_capacity() {
        let capacity = PhysicalCapacity::from_quota(&PoolQuota {
            quota_max_bytes: 100,
            current_num_bytes: 40,
        })
        .unwrap();
        assert_eq!((capacity.total, capacity.used, capacity.free()), (100, 40, 60));
        assert_eq!(capacity.limit, CapacityLimit::Quota);

        assert!(PhysicalCapacity::from_quota(&PoolQuota::default()).is_none());
    }

    #[test]
    fn test_usage_capacity() {
        let capacity = PhysicalCapacity::from_usage(&PoolUsage {
            max_avail: 60,
            stored: Some(40),
            bytes_used: Some(120),
        });
        assert_eq!((capacity.total, capacity.used, capacity.free()), (100, 40, 60));

        // Raw usage stands in when stored bytes are not reported
        let raw = PhysicalCapacity::from_usage(&PoolUsage {
            max_avail: 60,
            stored: None,
            bytes_used: Some(120),
        });
        assert_eq!((raw.total, raw.used), (180, 120));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let capacity = PhysicalCapacity::from_usage(&PoolUsage::default());
        assert_eq!((capacity.total, capacity.used), (1, 0));
    }

    #[tokio::test]
    async fn test_quota_preferred_over_usage() {
        let sim = SimCluster::new("rbd");
        sim.set_usage(PoolUsage {
            max_avail: 1000,
            stored: Some(0),
            bytes_used: None,
        })
        .await;
        assert_eq!(physical_capacity(&sim).await.unwrap().total, 1000);

        sim.set_quota(PoolQuota {
            quota_max_bytes: 100,
            current_num_bytes: 40,
        })
        .await;
        let capacity = physical_capacity(&sim).await.unwrap();
        assert_eq!((capacity.total, capacity.used), (100, 40));

        // A failing quota query falls back to the usage report
        sim.fail_next("get-quota").await;
        assert_eq!(physical_capacity(&sim).await.unwrap().total, 1000);
    }

    #[test]
    fn test_apply_delta_saturates() {
        assert_eq!(apply_delta(10, -20), 0);
        assert_eq!(apply_delta(10, 5), 15);
    }

    #[tokio::test]
    async fn test_allocation_keeps_concurrent_writer() {
        let (repo, _sim, cp, _dir) = repository().await;
        cp.interfere_next_cas("sr-1", (5 * GIB) as i64);

        repo.vdi(UUID_A).create(GIB).await.unwrap();
        assert_eq!(cp.virtual_allocation("sr-1").await.unwrap(), 6 * GIB);
        assert_eq!(repo.stats().await.virtual_allocation, 6 * GIB);
    }

    #[tokio::test]
    async fn test_allocation_gives_up_under_contention() {
        let (repo, _sim, cp, _dir) = repository().await;
        for _ in 0..5 {
            cp.interfere_next_cas("sr-1", GIB as i64);
        }

        assert_matches!(
            repo.update_allocation(GIB as i64).await,
            Err(Error::AllocationContention { attempts: 5, .. })
        );
        // Only the other writer's changes landed
        assert_eq!(cp.virtual_allocation("sr-1").await.unwrap(), 5 * GIB);
    }

    #[tokio::test]
    async fn test_allocation_retries_failed_read() {
        let (repo, _sim, cp, _dir) = repository().await;
        cp.adjust_allocation("sr-1", (10 * GIB) as i64);
        cp.fail_next("virtual_allocation");

        repo.vdi(UUID_A).create(GIB).await.unwrap();
        assert_eq!(cp.virtual_allocation("sr-1").await.unwrap(), 11 * GIB);
    }

    #[tokio::test]
    async fn test_unreadable_allocation_is_not_overwritten() {
        let (repo, _sim, cp, _dir) = repository().await;
        cp.adjust_allocation("sr-1", (10 * GIB) as i64);
        for _ in 0..5 {
            cp.fail_next("virtual_allocation");
        }

        assert_matches!(
            repo.update_allocation(GIB as i64).await,
            Err(Error::ControlPlane(_))
        );
        assert_eq!(cp.virtual_allocation("sr-1").await.unwrap(), 10 * GIB);

        // Publishing stats loads the live counter and leaves it as it was
        let stats = repo.stat().await.unwrap();
        assert_eq!(stats.virtual_allocation, 10 * GIB);
        assert_eq!(cp.virtual_allocation("sr-1").await.unwrap(), 10 * GIB);
    }

    #[tokio::test]
    async fn test_unreadable_allocation_moves_loaded_total_locally() {
        let (repo, _sim, cp, _dir) = repository().await;
        repo.vdi(UUID_A).create(GIB).await.unwrap();
        for _ in 0..5 {
            cp.fail_next("virtual_allocation");
        }

        assert!(repo.update_allocation(GIB as i64).await.is_err());
        assert_eq!(repo.stats().await.virtual_allocation, 2 * GIB);
        assert_eq!(cp.virtual_allocation("sr-1").await.unwrap(), GIB);
    }
}
