//! RBD Command-Line Adapter
//!
//! Drives a Ceph cluster through the `rbd` and `ceph` tools. Every command
//! gets the connection's authentication arguments, JSON output is parsed
//! into the port types, and tool failures are classified from stderr.

use crate::config::{ClusterConnection, EngineConfig};
use crate::domain::ports::{
    ClusterClient, ImageEntry, MappedDevice, ParentSpec, PoolQuota, PoolUsage, SnapshotEntry,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info};

// =============================================================================
// Tool Output Structures
// =============================================================================

/// One row of `rbd ls -l --format json`
#[derive(Debug, Deserialize)]
struct RawListing {
    image: String,
    #[serde(default)]
    size: u64,
    snapshot: Option<String>,
    #[serde(default)]
    protected: Option<Value>,
    parent: Option<RawParent>,
}

#[derive(Debug, Deserialize)]
struct RawParent {
    pool: String,
    image: String,
    snapshot: String,
}

/// One row of `rbd snap ls --format json`
#[derive(Debug, Deserialize)]
struct RawSnapshot {
    #[serde(default)]
    id: u64,
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    protected: Option<Value>,
}

/// `ceph osd pool get-quota --format json`
#[derive(Debug, Deserialize)]
struct RawQuota {
    #[serde(default)]
    quota_max_bytes: u64,
    #[serde(default)]
    current_num_bytes: u64,
}

/// One mapping from `rbd showmapped --format json`
#[derive(Debug, Deserialize)]
struct RawMapping {
    pool: String,
    name: String,
    #[serde(default)]
    snap: Option<String>,
    device: String,
}

// =============================================================================
// Output Parsing
// =============================================================================

/// Older releases print booleans as strings
fn truthy(value: &Option<Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn output_error(command: &str, e: impl std::fmt::Display) -> Error {
    Error::OutputParse {
        command: command.to_string(),
        reason: e.to_string(),
    }
}

/// Parse a long image listing
pub fn parse_long_listing(stdout: &str) -> Result<Vec<ImageEntry>> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let rows: Vec<RawListing> =
        serde_json::from_str(stdout).map_err(|e| output_error("rbd ls -l", e))?;

    Ok(rows
        .into_iter()
        .map(|row| ImageEntry {
            protected: row.snapshot.is_some() && truthy(&row.protected),
            image: row.image,
            snapshot: row.snapshot,
            size: row.size,
            parent: row.parent.map(|p| ParentSpec {
                pool: p.pool,
                image: p.image,
                snapshot: p.snapshot,
            }),
        })
        .collect())
}

/// Parse a snapshot listing
pub fn parse_snapshots(stdout: &str) -> Result<Vec<SnapshotEntry>> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let rows: Vec<RawSnapshot> =
        serde_json::from_str(stdout).map_err(|e| output_error("rbd snap ls", e))?;

    Ok(rows
        .into_iter()
        .map(|row| SnapshotEntry {
            protected: truthy(&row.protected),
            id: row.id,
            name: row.name,
            size: row.size,
        })
        .collect())
}

/// Parse `rbd children`; entries are either `pool/image` strings or objects
pub fn parse_children(stdout: &str) -> Result<Vec<String>> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let rows: Vec<Value> =
        serde_json::from_str(stdout).map_err(|e| output_error("rbd children", e))?;

    Ok(rows
        .iter()
        .filter_map(|row| match row {
            Value::String(spec) => spec.rsplit('/').next().map(str::to_string),
            Value::Object(obj) => obj.get("image").and_then(Value::as_str).map(str::to_string),
            _ => None,
        })
        .collect())
}

/// Parse the pool quota report
pub fn parse_quota(stdout: &str) -> Result<PoolQuota> {
    let raw: RawQuota =
        serde_json::from_str(stdout).map_err(|e| output_error("ceph osd pool get-quota", e))?;
    Ok(PoolQuota {
        quota_max_bytes: raw.quota_max_bytes,
        current_num_bytes: raw.current_num_bytes,
    })
}

/// Pick one pool's figures out of `ceph df detail`
pub fn parse_usage(stdout: &str, pool: &str) -> Result<PoolUsage> {
    let report: Value =
        serde_json::from_str(stdout).map_err(|e| output_error("ceph df detail", e))?;

    let stats = report["pools"]
        .as_array()
        .and_then(|pools| pools.iter().find(|p| p["name"].as_str() == Some(pool)))
        .map(|p| &p["stats"])
        .ok_or_else(|| Error::PoolNotReported {
            pool: pool.to_string(),
        })?;

    Ok(PoolUsage {
        max_avail: stats["max_avail"].as_u64().unwrap_or(0),
        stored: stats["stored"].as_u64(),
        bytes_used: stats["bytes_used"].as_u64(),
    })
}

/// Parse `rbd showmapped`; newer releases print a list, older ones a map
/// keyed by device id. A snapshot of `-` means the image head.
pub fn parse_showmapped(stdout: &str) -> Result<Vec<MappedDevice>> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let report: Value =
        serde_json::from_str(stdout).map_err(|e| output_error("rbd showmapped", e))?;

    let rows: Vec<Value> = match report {
        Value::Array(rows) => rows,
        Value::Object(map) => map.into_iter().map(|(_, v)| v).collect(),
        _ => Vec::new(),
    };

    rows.into_iter()
        .map(|row| {
            let raw: RawMapping =
                serde_json::from_value(row).map_err(|e| output_error("rbd showmapped", e))?;
            Ok(MappedDevice {
                pool: raw.pool,
                name: raw.name,
                snap: raw.snap.filter(|s| !s.is_empty() && s != "-"),
                device: raw.device,
            })
        })
        .collect()
}

// =============================================================================
// Failure Classification
// =============================================================================

/// Turn a failed tool invocation into a classified error
pub fn classify_failure(command: &str, target: &str, stderr: &str) -> Error {
    let text = stderr.trim();
    let lower = text.to_lowercase();

    if lower.contains("no such file") || reports_errno(&lower, 2) || lower.contains("enoent") {
        Error::ImageNotFound {
            name: target.to_string(),
        }
    } else if lower.contains("watchers") {
        Error::VolumeInUse {
            volume: target.to_string(),
            reason: format!("still mapped on one or more hosts: {}", text),
        }
    } else if lower.contains("has snapshots") {
        Error::HasSnapshots {
            volume: target.to_string(),
            reason: text.to_string(),
        }
    } else if command.contains("unprotect")
        && (lower.contains("child") || lower.contains("ebusy") || lower.contains("busy"))
    {
        Error::HasChildren {
            snapshot: target.to_string(),
            reason: text.to_string(),
        }
    } else if lower.contains("is protected") {
        Error::SnapshotProtected {
            snapshot: target.to_string(),
        }
    } else if lower.contains("error connecting to the cluster")
        || lower.contains("timed out")
        || lower.contains("monclient")
    {
        Error::ClusterUnavailable {
            reason: text.to_string(),
        }
    } else {
        Error::CommandFailed {
            command: command.to_string(),
            target: target.to_string(),
            stderr: text.to_string(),
        }
    }
}

/// Whether the text carries rbd's `(<errno>) <message>` tag for `errno`
fn reports_errno(text: &str, errno: i32) -> bool {
    let tag = format!("({}) ", errno);
    text.starts_with(&tag) || text.contains(&format!(": {}", tag))
}

/// Re-wrap an unclassified command failure into an operation-specific one
fn unclassified_into(err: Error, wrap: impl FnOnce(String) -> Error) -> Error {
    match err {
        Error::CommandFailed { stderr, .. } => wrap(stderr),
        other => other,
    }
}

// =============================================================================
// RBD CLI Adapter
// =============================================================================

/// Cluster client backed by the `rbd` and `ceph` binaries
pub struct RbdCli {
    connection: ClusterConnection,
    rbd_binary: String,
    ceph_binary: String,
}

impl RbdCli {
    /// Create a client for one pool
    pub fn new(connection: ClusterConnection, engine: &EngineConfig) -> Self {
        Self {
            connection,
            rbd_binary: engine.rbd_binary.clone(),
            ceph_binary: engine.ceph_binary.clone(),
        }
    }

    /// `pool/image` spec for an image or `image@snap` name
    fn spec(&self, name: &str) -> String {
        format!("{}/{}", self.connection.pool, name)
    }

    async fn run(&self, binary: &str, args: &[&str], target: &str) -> Result<String> {
        let auth = self.connection.auth_args();
        let subcommand: Vec<&str> = args.iter().take(2).copied().collect();
        let command = format!("{} {}", binary, subcommand.join(" "));

        debug!("Running {} {:?} for {}", binary, args, target);

        let output = Command::new(binary)
            .args(args)
            .args(&auth)
            .output()
            .await
            .map_err(|e| Error::CommandSpawn {
                command: command.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&command, target, &stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn rbd(&self, args: &[&str], target: &str) -> Result<String> {
        self.run(&self.rbd_binary, args, target).await
    }

    async fn ceph(&self, args: &[&str], target: &str) -> Result<String> {
        self.run(&self.ceph_binary, args, target).await
    }
}

#[async_trait]
impl ClusterClient for RbdCli {
    fn pool(&self) -> &str {
        &self.connection.pool
    }

    async fn health(&self) -> Result<String> {
        let out = self
            .ceph(&["health"], "cluster")
            .await
            .map_err(|e| Error::ClusterUnavailable {
                reason: e.to_string(),
            })?;
        Ok(out.trim().to_string())
    }

    async fn pool_stats(&self) -> Result<()> {
        let pool = &self.connection.pool;
        self.ceph(&["osd", "pool", "stats", pool, "--format", "json"], pool)
            .await
            .map_err(|e| Error::PoolUnavailable {
                pool: pool.clone(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn list_images(&self) -> Result<Vec<ImageEntry>> {
        let pool = &self.connection.pool;
        let out = self
            .rbd(&["ls", "-l", "--format", "json", pool], pool)
            .await
            .map_err(|e| Error::PoolUnavailable {
                pool: pool.clone(),
                reason: e.to_string(),
            })?;
        parse_long_listing(&out)
    }

    async fn list_snapshots(&self, image: &str) -> Result<Vec<SnapshotEntry>> {
        let spec = self.spec(image);
        let out = self
            .rbd(&["snap", "ls", "--format", "json", &spec], image)
            .await?;
        parse_snapshots(&out)
    }

    async fn list_children(&self, image: &str, snapshot: &str) -> Result<Vec<String>> {
        let spec = self.spec(&format!("{}@{}", image, snapshot));
        let out = self
            .rbd(&["children", "--format", "json", &spec], &spec)
            .await?;
        parse_children(&out)
    }

    async fn pool_quota(&self) -> Result<PoolQuota> {
        let pool = &self.connection.pool;
        let out = self
            .ceph(&["osd", "pool", "get-quota", pool, "--format", "json"], pool)
            .await?;
        parse_quota(&out)
    }

    async fn pool_usage(&self) -> Result<PoolUsage> {
        let pool = &self.connection.pool;
        let out = self
            .ceph(&["df", "detail", "-f", "json"], pool)
            .await
            .map_err(|e| Error::PoolUnavailable {
                pool: pool.clone(),
                reason: e.to_string(),
            })?;
        parse_usage(&out, pool)
    }

    async fn create_image(&self, image: &str, size_mb: u64) -> Result<()> {
        let spec = self.spec(image);
        let size = size_mb.to_string();
        info!("Creating RBD image {} ({} MiB)", spec, size_mb);

        self.rbd(
            &[
                "create",
                "--size",
                &size,
                "--image-format",
                "2",
                "--image-feature",
                "layering",
                &spec,
            ],
            image,
        )
        .await
        .map_err(|e| {
            unclassified_into(e, |reason| Error::CreateFailed {
                image: image.to_string(),
                reason,
            })
        })?;
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        let spec = self.spec(image);
        info!("Removing RBD image {}", spec);

        self.rbd(&["rm", &spec], image).await.map_err(|e| {
            unclassified_into(e, |reason| Error::DeleteFailed {
                image: image.to_string(),
                reason,
            })
        })?;
        Ok(())
    }

    async fn resize_image(&self, image: &str, size_mb: u64) -> Result<()> {
        let spec = self.spec(image);
        let size = size_mb.to_string();
        info!("Resizing RBD image {} to {} MiB", spec, size_mb);

        self.rbd(&["resize", "--size", &size, &spec], image)
            .await
            .map_err(|e| {
                unclassified_into(e, |reason| Error::ResizeFailed {
                    image: image.to_string(),
                    reason,
                })
            })?;
        Ok(())
    }

    async fn map(&self, name: &str) -> Result<String> {
        let spec = self.spec(name);
        let out = self
            .rbd(&["map", &spec], name)
            .await
            .map_err(|e| match e {
                Error::CommandFailed { stderr, .. } => Error::MapFailed {
                    image: name.to_string(),
                    reason: stderr,
                },
                other => other,
            })?;

        let device = out.trim().to_string();
        if device.is_empty() {
            return Err(Error::MapFailed {
                image: name.to_string(),
                reason: "rbd map printed no device".into(),
            });
        }
        info!("Mapped {} to {}", spec, device);
        Ok(device)
    }

    async fn unmap(&self, device: &str) -> Result<()> {
        self.rbd(&["unmap", device], device).await?;
        info!("Unmapped {}", device);
        Ok(())
    }

    async fn show_mapped(&self) -> Result<Vec<MappedDevice>> {
        let out = self
            .rbd(&["showmapped", "--format", "json"], "local mappings")
            .await?;
        parse_showmapped(&out)
    }

    async fn snap_create(&self, image: &str, snapshot: &str) -> Result<()> {
        let spec = self.spec(&format!("{}@{}", image, snapshot));
        self.rbd(&["snap", "create", &spec], &spec)
            .await
            .map_err(|e| {
                unclassified_into(e, |reason| Error::SnapshotFailed {
                    image: image.to_string(),
                    reason,
                })
            })?;
        Ok(())
    }

    async fn snap_protect(&self, image: &str, snapshot: &str) -> Result<()> {
        let spec = self.spec(&format!("{}@{}", image, snapshot));
        self.rbd(&["snap", "protect", &spec], &spec).await?;
        Ok(())
    }

    async fn snap_unprotect(&self, image: &str, snapshot: &str) -> Result<()> {
        let spec = self.spec(&format!("{}@{}", image, snapshot));
        self.rbd(&["snap", "unprotect", &spec], &spec).await?;
        Ok(())
    }

    async fn snap_remove(&self, image: &str, snapshot: &str) -> Result<()> {
        let spec = self.spec(&format!("{}@{}", image, snapshot));
        self.rbd(&["snap", "rm", &spec], &spec).await?;
        Ok(())
    }

    async fn clone_image(&self, image: &str, snapshot: &str, dest: &str) -> Result<()> {
        let source = self.spec(&format!("{}@{}", image, snapshot));
        let target = self.spec(dest);
        info!("Cloning {} to {}", source, target);

        self.rbd(
            &["clone", "--image-feature", "layering", &source, &target],
            dest,
        )
        .await
        .map_err(|e| {
            unclassified_into(e, |reason| Error::CreateFailed {
                image: dest.to_string(),
                reason,
            })
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_long_listing() {
        let out = r#"[
            {"image":"vdi-a","size":10737418240,"format":2},
            {"image":"vdi-a","snapshot":"snap-s","size":10737418240,"format":2,"protected":"true"},
            {"image":"vdi-b","size":10737418240,"format":2,
             "parent":{"pool":"rbd","image":"vdi-a","snapshot":"snap-s"}}
        ]"#;
        let entries = parse_long_listing(out).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(!entries[0].protected);
        assert_eq!(entries[1].snapshot.as_deref(), Some("snap-s"));
        assert!(entries[1].protected);
        let parent = entries[2].parent.as_ref().unwrap();
        assert_eq!(parent.image, "vdi-a");
        assert_eq!(parent.snapshot, "snap-s");

        assert!(parse_long_listing("  \n").unwrap().is_empty());
        assert!(parse_long_listing("not json").is_err());
    }

    #[test]
    fn test_parse_snapshots_bool_forms() {
        let out = r#"[
            {"id":4,"name":"snap-1","size":1048576,"protected":"false"},
            {"id":5,"name":"snap-2","size":1048576,"protected":true}
        ]"#;
        let snaps = parse_snapshots(out).unwrap();
        assert!(!snaps[0].protected);
        assert!(snaps[1].protected);
        assert_eq!(snaps[1].id, 5);
    }

    #[test]
    fn test_parse_children_forms() {
        assert_eq!(
            parse_children(r#"["rbd/vdi-b"]"#).unwrap(),
            vec!["vdi-b".to_string()]
        );
        assert_eq!(
            parse_children(r#"[{"pool":"rbd","pool_namespace":"","image":"vdi-c"}]"#).unwrap(),
            vec!["vdi-c".to_string()]
        );
    }

    #[test]
    fn test_parse_quota_and_usage() {
        let quota = parse_quota(
            r#"{"pool_name":"rbd","quota_max_objects":0,"quota_max_bytes":100,"current_num_bytes":40}"#,
        )
        .unwrap();
        assert_eq!(quota.quota_max_bytes, 100);
        assert_eq!(quota.current_num_bytes, 40);

        let df = r#"{"stats":{},"pools":[
            {"name":"other","id":1,"stats":{"stored":1,"max_avail":2}},
            {"name":"rbd","id":2,"stats":{"stored":40,"bytes_used":120,"max_avail":60}}
        ]}"#;
        let usage = parse_usage(df, "rbd").unwrap();
        assert_eq!(usage.max_avail, 60);
        assert_eq!(usage.stored, Some(40));
        assert_eq!(usage.bytes_used, Some(120));

        assert_matches!(parse_usage(df, "missing"), Err(Error::PoolNotReported { .. }));
    }

    #[test]
    fn test_parse_showmapped_forms() {
        let list = r#"[{"id":"0","pool":"rbd","namespace":"","name":"vdi-a","snap":"-","device":"/dev/rbd0"}]"#;
        let mapped = parse_showmapped(list).unwrap();
        assert_eq!(mapped[0].device, "/dev/rbd0");
        assert_eq!(mapped[0].snap, None);

        let map = r#"{"1":{"pool":"rbd","name":"vdi-a","snap":"snap-s","device":"/dev/rbd1"}}"#;
        let mapped = parse_showmapped(map).unwrap();
        assert_eq!(mapped[0].snap.as_deref(), Some("snap-s"));
    }

    #[test]
    fn test_classify_failure() {
        assert_matches!(
            classify_failure("rbd rm", "vdi-a", "rbd: error opening image vdi-a: (2) No such file or directory"),
            Error::ImageNotFound { .. }
        );
        assert_matches!(
            classify_failure("rbd rm", "vdi-a", "rbd: error: image still has watchers"),
            Error::VolumeInUse { .. }
        );
        assert_matches!(
            classify_failure("rbd rm", "vdi-a", "rbd: image has snapshots - not removing"),
            Error::HasSnapshots { .. }
        );
        assert_matches!(
            classify_failure("rbd snap", "vdi-a@snap-s", "rbd: unprotecting snap failed: (16) Device or resource busy"),
            Error::CommandFailed { .. }
        );
        assert_matches!(
            classify_failure("rbd snap unprotect", "vdi-a@snap-s", "(16) Device or resource busy"),
            Error::HasChildren { .. }
        );
        assert_matches!(
            classify_failure("ceph health", "cluster", "error connecting to the cluster"),
            Error::ClusterUnavailable { .. }
        );
    }

    #[test]
    fn test_not_found_needs_errno_tag() {
        assert_matches!(
            classify_failure("rbd map", "vdi-a", "rbd: sysfs write failed: (2) "),
            Error::ImageNotFound { .. }
        );
        assert_matches!(
            classify_failure("rbd info", "vdi-a", "(2) "),
            Error::ImageNotFound { .. }
        );
        // A "(2)" that is not an errno tag does not mean the image is gone
        assert_matches!(
            classify_failure(
                "rbd map",
                "vdi-a",
                "rbd: map failed: (22) Invalid argument, retried (2) times"
            ),
            Error::CommandFailed { .. }
        );
        assert_matches!(
            classify_failure("rbd create", "vdi-a", "pool rbd-(2) is full"),
            Error::CommandFailed { .. }
        );
    }

    #[test]
    fn test_unclassified_into_keeps_classified_errors() {
        let wrapped = unclassified_into(
            Error::CommandFailed {
                command: "rbd create".into(),
                target: "vdi-a".into(),
                stderr: "boom".into(),
            },
            |reason| Error::CreateFailed {
                image: "vdi-a".into(),
                reason,
            },
        );
        assert_matches!(wrapped, Error::CreateFailed { reason, .. } if reason == "boom");

        let kept = unclassified_into(
            Error::ImageNotFound {
                name: "vdi-a".into(),
            },
            |reason| Error::Internal(reason),
        );
        assert_matches!(kept, Error::ImageNotFound { .. });
    }
}
