//! In-memory volume groups
//!
//! Mirrors the LVM rules the layered repository depends on: a group must
//! be deactivated before it can be exported, an exported group cannot be
//! activated, and logical volumes only exist inside a group.

use crate::domain::ports::{
    LogicalVolumeInfo, LvmScope, VgContext, VolumeGroupLifecycle, VolumeGroupProbe,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct MemGroup {
    device: String,
    size: u64,
    active: bool,
    exported: bool,
    lvs: BTreeMap<String, LogicalVolumeInfo>,
}

#[derive(Debug, Default)]
struct MemState {
    groups: BTreeMap<String, MemGroup>,
    device_sizes: BTreeMap<String, u64>,
    last_scope: LvmScope,
    faults: Vec<String>,
}

/// Volume-group engine keeping everything in memory
#[derive(Default)]
pub struct MemoryVolumeGroups {
    state: RwLock<MemState>,
}

impl MemoryVolumeGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `operation` fail
    pub async fn fail_next(&self, operation: &str) {
        self.state.write().await.faults.push(operation.to_string());
    }

    /// Size a group created on `device` will report
    pub async fn set_device_size(&self, device: &str, size: u64) {
        self.state
            .write()
            .await
            .device_sizes
            .insert(device.to_string(), size);
    }

    pub async fn add_logical_volume(&self, vg_name: &str, lv_name: &str, size: u64) -> Result<()> {
        let mut state = self.state.write().await;
        let group = Self::group_mut(&mut state, "lvcreate", vg_name)?;
        let active = group.active;
        group.lvs.insert(
            lv_name.to_string(),
            LogicalVolumeInfo {
                name: lv_name.to_string(),
                size,
                active,
            },
        );
        Ok(())
    }

    pub async fn has_group(&self, vg_name: &str) -> bool {
        self.state.read().await.groups.contains_key(vg_name)
    }

    pub async fn is_active(&self, vg_name: &str) -> Option<bool> {
        self.state.read().await.groups.get(vg_name).map(|g| g.active)
    }

    pub async fn is_exported(&self, vg_name: &str) -> Option<bool> {
        self.state.read().await.groups.get(vg_name).map(|g| g.exported)
    }

    /// Scope the most recent call ran in
    pub async fn last_scope(&self) -> LvmScope {
        self.state.read().await.last_scope.clone()
    }

    /// Record the call's scope and consume a pending fault for it
    async fn enter(&self, operation: &str, ctx: &VgContext) -> Result<tokio::sync::RwLockWriteGuard<'_, MemState>> {
        let mut state = self.state.write().await;
        state.last_scope = ctx.scope.clone();
        if let Some(pos) = state.faults.iter().position(|f| f == operation) {
            state.faults.remove(pos);
            return Err(failure(operation, &ctx.vg_name, "injected failure"));
        }
        Ok(state)
    }

    fn group_mut<'a>(state: &'a mut MemState, operation: &str, vg_name: &str) -> Result<&'a mut MemGroup> {
        state
            .groups
            .get_mut(vg_name)
            .ok_or_else(|| failure(operation, vg_name, &format!("Volume group \"{}\" not found", vg_name)))
    }
}

fn failure(command: &str, target: &str, reason: &str) -> Error {
    Error::Lvm {
        command: command.to_string(),
        target: target.to_string(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl VolumeGroupLifecycle for MemoryVolumeGroups {
    async fn exists(&self, ctx: &VgContext) -> Result<bool> {
        let state = self.enter("vgs", ctx).await?;
        Ok(state.groups.contains_key(&ctx.vg_name))
    }

    async fn create(&self, ctx: &VgContext) -> Result<()> {
        let mut state = self.enter("vgcreate", ctx).await?;
        if state.groups.contains_key(&ctx.vg_name) {
            return Err(failure(
                "vgcreate",
                &ctx.vg_name,
                &format!("A volume group called {} already exists", ctx.vg_name),
            ));
        }
        let size = state.device_sizes.get(&ctx.device).copied().unwrap_or(0);
        state.groups.insert(
            ctx.vg_name.clone(),
            MemGroup {
                device: ctx.device.clone(),
                size,
                active: true,
                exported: false,
                lvs: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn remove(&self, ctx: &VgContext) -> Result<()> {
        let mut state = self.enter("vgremove", ctx).await?;
        Self::group_mut(&mut state, "vgremove", &ctx.vg_name)?;
        state.groups.remove(&ctx.vg_name);
        Ok(())
    }

    async fn activate(&self, ctx: &VgContext) -> Result<()> {
        let mut state = self.enter("vgchange", ctx).await?;
        let group = Self::group_mut(&mut state, "vgchange", &ctx.vg_name)?;
        if group.exported {
            return Err(failure("vgchange", &ctx.vg_name, "Volume group is exported"));
        }
        group.active = true;
        group.lvs.values_mut().for_each(|lv| lv.active = true);
        Ok(())
    }

    async fn deactivate(&self, ctx: &VgContext) -> Result<()> {
        let mut state = self.enter("vgchange", ctx).await?;
        let group = Self::group_mut(&mut state, "vgchange", &ctx.vg_name)?;
        group.active = false;
        group.lvs.values_mut().for_each(|lv| lv.active = false);
        Ok(())
    }

    async fn export(&self, ctx: &VgContext) -> Result<()> {
        let mut state = self.enter("vgexport", ctx).await?;
        let group = Self::group_mut(&mut state, "vgexport", &ctx.vg_name)?;
        if group.active {
            return Err(failure(
                "vgexport",
                &ctx.vg_name,
                "Volume group has active logical volumes",
            ));
        }
        group.exported = true;
        Ok(())
    }

    async fn list_logical_volumes(&self, ctx: &VgContext) -> Result<Vec<LogicalVolumeInfo>> {
        let mut state = self.enter("lvs", ctx).await?;
        let group = Self::group_mut(&mut state, "lvs", &ctx.vg_name)?;
        Ok(group.lvs.values().cloned().collect())
    }

    async fn refresh_size(&self, ctx: &VgContext) -> Result<u64> {
        let mut state = self.enter("pvresize", ctx).await?;
        let device_size = state.device_sizes.get(&ctx.device).copied();
        let group = Self::group_mut(&mut state, "pvresize", &ctx.vg_name)?;
        if let Some(size) = device_size {
            group.size = group.size.max(size);
        }
        Ok(group.size)
    }

    async fn probe(&self, ctx: &VgContext) -> Result<Vec<VolumeGroupProbe>> {
        let state = self.enter("pvs", ctx).await?;
        Ok(state
            .groups
            .iter()
            .filter(|(_, g)| g.device == ctx.device)
            .map(|(name, g)| VolumeGroupProbe {
                vg_name: name.clone(),
                device: g.device.clone(),
                size: g.size,
                free: g.size.saturating_sub(g.lvs.values().map(|lv| lv.size).sum()),
            })
            .collect())
    }

    async fn activate_lv(&self, ctx: &VgContext, lv_name: &str) -> Result<String> {
        let mut state = self.enter("lvchange", ctx).await?;
        let group = Self::group_mut(&mut state, "lvchange", &ctx.vg_name)?;
        if group.exported {
            return Err(failure("lvchange", &ctx.vg_name, "Volume group is exported"));
        }
        let lv = group.lvs.get_mut(lv_name).ok_or_else(|| {
            failure(
                "lvchange",
                &ctx.vg_name,
                &format!("Failed to find logical volume \"{}/{}\"", ctx.vg_name, lv_name),
            )
        })?;
        lv.active = true;
        Ok(format!("/dev/{}/{}", ctx.vg_name, lv_name))
    }
}
