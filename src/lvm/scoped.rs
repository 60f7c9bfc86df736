//! RBD-scoped volume groups
//!
//! The host's default LVM configuration deliberately ignores RBD devices,
//! so that guest-owned LVM inside mapped images never leaks into the
//! host. Volume groups that live on an RBD image are therefore handled
//! with a dedicated configuration directory matching only RBD devices.
//! [`RbdScopedVolumeGroup`] wraps any engine and runs every call in that
//! scope.

use crate::domain::ports::{
    LogicalVolumeInfo, LvmScope, VgContext, VolumeGroupLifecycle, VolumeGroupProbe,
};
use crate::error::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Engine decorator injecting the RBD LVM configuration scope
pub struct RbdScopedVolumeGroup<E> {
    inner: E,
    conf_dir: PathBuf,
}

impl<E: VolumeGroupLifecycle> RbdScopedVolumeGroup<E> {
    pub fn new(inner: E, conf_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            conf_dir: conf_dir.into(),
        }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    pub fn conf_dir(&self) -> &Path {
        &self.conf_dir
    }

    /// The caller's context with the dedicated scope, when installed
    fn scoped(&self, ctx: &VgContext) -> VgContext {
        let scope = if self.conf_dir.is_dir() {
            debug!("Using RBD LVM configuration from {}", self.conf_dir.display());
            LvmScope {
                system_dir: Some(self.conf_dir.clone()),
            }
        } else {
            warn!(
                "RBD LVM configuration not found at {}, using the host default",
                self.conf_dir.display()
            );
            ctx.scope.clone()
        };
        VgContext {
            scope,
            ..ctx.clone()
        }
    }
}

#[async_trait]
impl<E: VolumeGroupLifecycle> VolumeGroupLifecycle for RbdScopedVolumeGroup<E> {
    async fn exists(&self, ctx: &VgContext) -> Result<bool> {
        self.inner.exists(&self.scoped(ctx)).await
    }

    async fn create(&self, ctx: &VgContext) -> Result<()> {
        self.inner.create(&self.scoped(ctx)).await
    }

    async fn remove(&self, ctx: &VgContext) -> Result<()> {
        self.inner.remove(&self.scoped(ctx)).await
    }

    async fn activate(&self, ctx: &VgContext) -> Result<()> {
        self.inner.activate(&self.scoped(ctx)).await
    }

    async fn deactivate(&self, ctx: &VgContext) -> Result<()> {
        self.inner.deactivate(&self.scoped(ctx)).await
    }

    async fn export(&self, ctx: &VgContext) -> Result<()> {
        self.inner.export(&self.scoped(ctx)).await
    }

    async fn list_logical_volumes(&self, ctx: &VgContext) -> Result<Vec<LogicalVolumeInfo>> {
        self.inner.list_logical_volumes(&self.scoped(ctx)).await
    }

    async fn refresh_size(&self, ctx: &VgContext) -> Result<u64> {
        self.inner.refresh_size(&self.scoped(ctx)).await
    }

    async fn probe(&self, ctx: &VgContext) -> Result<Vec<VolumeGroupProbe>> {
        self.inner.probe(&self.scoped(ctx)).await
    }

    async fn activate_lv(&self, ctx: &VgContext, lv_name: &str) -> Result<String> {
        self.inner.activate_lv(&self.scoped(ctx), lv_name).await
    }
}
