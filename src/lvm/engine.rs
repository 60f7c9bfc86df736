//! LVM Command Engine
//!
//! Implements the volume-group lifecycle with the stock LVM tools. Reports
//! are requested as JSON with byte units so that nothing has to be scraped
//! from column output.

use crate::domain::ports::{LogicalVolumeInfo, VgContext, VolumeGroupLifecycle, VolumeGroupProbe};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

/// Metadata area reserved on the physical volume
const METADATA_SIZE: &str = "10M";

// =============================================================================
// Report Parsing
// =============================================================================

#[derive(Debug, Deserialize)]
struct Report<T> {
    report: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct LvSection {
    #[serde(default)]
    lv: Vec<RawLv>,
}

#[derive(Debug, Deserialize)]
struct RawLv {
    lv_name: String,
    lv_size: String,
    #[serde(default)]
    lv_active: String,
}

#[derive(Debug, Deserialize)]
struct PvSection {
    #[serde(default)]
    pv: Vec<RawPv>,
}

#[derive(Debug, Deserialize)]
struct RawPv {
    pv_name: String,
    #[serde(default)]
    vg_name: String,
    pv_size: String,
    pv_free: String,
}

fn bytes(command: &str, raw: &str) -> Result<u64> {
    raw.trim().parse().map_err(|_| Error::OutputParse {
        command: command.to_string(),
        reason: format!("not a byte count: {:?}", raw),
    })
}

/// Parse `lvs --reportformat json` output
pub fn parse_lvs(stdout: &str) -> Result<Vec<LogicalVolumeInfo>> {
    let report: Report<LvSection> = serde_json::from_str(stdout)?;
    report
        .report
        .into_iter()
        .flat_map(|section| section.lv)
        .map(|lv| {
            Ok(LogicalVolumeInfo {
                size: bytes("lvs", &lv.lv_size)?,
                active: lv.lv_active.trim() == "active",
                name: lv.lv_name,
            })
        })
        .collect()
}

/// Parse `pvs --reportformat json` output, keeping only PVs in a group
pub fn parse_pvs(stdout: &str) -> Result<Vec<VolumeGroupProbe>> {
    let report: Report<PvSection> = serde_json::from_str(stdout)?;
    report
        .report
        .into_iter()
        .flat_map(|section| section.pv)
        .filter(|pv| !pv.vg_name.is_empty())
        .map(|pv| {
            Ok(VolumeGroupProbe {
                size: bytes("pvs", &pv.pv_size)?,
                free: bytes("pvs", &pv.pv_free)?,
                vg_name: pv.vg_name,
                device: pv.pv_name,
            })
        })
        .collect()
}

fn is_missing_vg(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("not found") || lower.contains("does not exist")
}

// =============================================================================
// LVM Engine
// =============================================================================

/// Volume-group lifecycle backed by the LVM command-line tools
pub struct LvmEngine {
    /// Directory holding `vgcreate`, `lvs` and friends
    sbin: String,
}

impl LvmEngine {
    pub fn new() -> Self {
        Self::with_sbin("/sbin")
    }

    pub fn with_sbin(sbin: impl Into<String>) -> Self {
        Self { sbin: sbin.into() }
    }

    async fn lvm(&self, ctx: &VgContext, tool: &str, args: &[&str]) -> Result<String> {
        let binary = format!("{}/{}", self.sbin, tool);
        let mut command = Command::new(&binary);
        command.args(args);
        if let Some(dir) = &ctx.scope.system_dir {
            command.env("LVM_SYSTEM_DIR", dir);
        }

        debug!("Running {} {:?} (scope {:?})", tool, args, ctx.scope.system_dir);
        let output = command.output().await.map_err(|e| Error::CommandSpawn {
            command: tool.to_string(),
            reason: e.to_string(),
        })?;

        if !output.status.success() {
            return Err(Error::Lvm {
                command: tool.to_string(),
                target: ctx.vg_name.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for LvmEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VolumeGroupLifecycle for LvmEngine {
    async fn exists(&self, ctx: &VgContext) -> Result<bool> {
        match self.lvm(ctx, "vgs", &["--noheadings", &ctx.vg_name]).await {
            Ok(_) => Ok(true),
            Err(Error::Lvm { reason, .. }) if is_missing_vg(&reason) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create(&self, ctx: &VgContext) -> Result<()> {
        // A network block device has no medium identity to check, so the
        // physical volume is forced rather than inspected.
        self.lvm(
            ctx,
            "pvcreate",
            &["-ff", "-y", "--metadatasize", METADATA_SIZE, &ctx.device],
        )
        .await?;
        self.lvm(
            ctx,
            "vgcreate",
            &["--metadatasize", METADATA_SIZE, &ctx.vg_name, &ctx.device],
        )
        .await?;
        info!("Created volume group {} on {}", ctx.vg_name, ctx.device);
        Ok(())
    }

    async fn remove(&self, ctx: &VgContext) -> Result<()> {
        self.lvm(ctx, "vgremove", &["-f", &ctx.vg_name]).await?;
        self.lvm(ctx, "pvremove", &["-ff", "-y", &ctx.device]).await?;
        info!("Removed volume group {}", ctx.vg_name);
        Ok(())
    }

    async fn activate(&self, ctx: &VgContext) -> Result<()> {
        self.lvm(ctx, "vgchange", &["-a", "y", &ctx.vg_name]).await?;
        Ok(())
    }

    async fn deactivate(&self, ctx: &VgContext) -> Result<()> {
        self.lvm(ctx, "vgchange", &["-a", "n", &ctx.vg_name]).await?;
        Ok(())
    }

    async fn export(&self, ctx: &VgContext) -> Result<()> {
        self.lvm(ctx, "vgexport", &[&ctx.vg_name]).await?;
        Ok(())
    }

    async fn list_logical_volumes(&self, ctx: &VgContext) -> Result<Vec<LogicalVolumeInfo>> {
        let out = self
            .lvm(
                ctx,
                "lvs",
                &[
                    "--reportformat",
                    "json",
                    "--units",
                    "b",
                    "--nosuffix",
                    "-o",
                    "lv_name,lv_size,lv_active",
                    &ctx.vg_name,
                ],
            )
            .await?;
        parse_lvs(&out)
    }

    async fn refresh_size(&self, ctx: &VgContext) -> Result<u64> {
        self.lvm(ctx, "pvresize", &[&ctx.device]).await?;
        let out = self
            .lvm(
                ctx,
                "vgs",
                &["--noheadings", "--units", "b", "--nosuffix", "-o", "vg_size", &ctx.vg_name],
            )
            .await?;
        bytes("vgs", &out)
    }

    async fn probe(&self, ctx: &VgContext) -> Result<Vec<VolumeGroupProbe>> {
        let out = self
            .lvm(
                ctx,
                "pvs",
                &[
                    "--reportformat",
                    "json",
                    "--units",
                    "b",
                    "--nosuffix",
                    "-o",
                    "pv_name,vg_name,pv_size,pv_free",
                    &ctx.device,
                ],
            )
            .await?;
        parse_pvs(&out)
    }

    async fn activate_lv(&self, ctx: &VgContext, lv_name: &str) -> Result<String> {
        let path = format!("{}/{}", ctx.vg_name, lv_name);
        self.lvm(ctx, "lvchange", &["-a", "y", &path]).await?;
        Ok(format!("/dev/{}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lvs() {
        let out = r#"{
            "report": [{
                "lv": [
                    {"lv_name": "VHD-a", "lv_size": "1073741824", "lv_active": "active"},
                    {"lv_name": "MGT", "lv_size": "4194304", "lv_active": ""}
                ]
            }]
        }"#;
        let lvs = parse_lvs(out).unwrap();
        assert_eq!(lvs.len(), 2);
        assert_eq!(lvs[0].size, 1 << 30);
        assert!(lvs[0].active);
        assert!(!lvs[1].active);
    }

    #[test]
    fn test_parse_pvs_skips_orphans() {
        let out = r#"{
            "report": [{
                "pv": [
                    {"pv_name": "/dev/rbd0", "vg_name": "VG_XenStorage-x", "pv_size": "100", "pv_free": "40"},
                    {"pv_name": "/dev/rbd1", "vg_name": "", "pv_size": "100", "pv_free": "100"}
                ]
            }]
        }"#;
        let pvs = parse_pvs(out).unwrap();
        assert_eq!(pvs.len(), 1);
        assert_eq!(pvs[0].device, "/dev/rbd0");
        assert_eq!((pvs[0].size, pvs[0].free), (100, 40));
    }

    #[test]
    fn test_bad_size_is_parse_error() {
        let out = r#"{"report": [{"lv": [{"lv_name": "x", "lv_size": "1.5g"}]}]}"#;
        assert!(matches!(parse_lvs(out), Err(Error::OutputParse { .. })));
    }

    #[test]
    fn test_missing_vg_detection() {
        assert!(is_missing_vg("  Volume group \"VG_x\" not found"));
        assert!(!is_missing_vg("  Device /dev/rbd0 excluded by a filter."));
    }
}
