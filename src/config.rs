//! Repository Configuration
//!
//! The device-config handed over at repository creation is a loose
//! key/value map. It is turned into typed configuration once, at load time,
//! so that no operation has to probe for optional keys later.

use crate::error::{Error, Result};
use crate::naming::Namespace;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Defaults
// =============================================================================

/// Default Ceph configuration file
pub const DEFAULT_CEPH_CONF: &str = "/etc/ceph/ceph.conf";

/// Default Ceph client name
pub const DEFAULT_CEPH_USER: &str = "admin";

/// Dedicated LVM configuration directory for RBD-backed volume groups
pub const DEFAULT_LVM_CONF_DIR: &str = "/etc/lvm/lvmorbd";

/// Raw device-config as received from the host framework
pub type DeviceConfig = BTreeMap<String, String>;

// =============================================================================
// Cluster Connection
// =============================================================================

/// Parameters shared by every `rbd`/`ceph` invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConnection {
    /// Pool holding the repository's images
    pub pool: String,
    /// Ceph configuration file
    pub conf: PathBuf,
    /// Ceph client name (without `client.`)
    pub user: String,
    /// Keyring path, if not the default one
    pub keyring: Option<PathBuf>,
    /// Monitor addresses
    pub mon_hosts: Vec<String>,
}

impl ClusterConnection {
    /// Connection with defaults for everything but the pool
    pub fn for_pool(pool: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            conf: PathBuf::from(DEFAULT_CEPH_CONF),
            user: DEFAULT_CEPH_USER.to_string(),
            keyring: None,
            mon_hosts: Vec::new(),
        }
    }

    /// Authentication and connection arguments common to `rbd` and `ceph`
    pub fn auth_args(&self) -> Vec<String> {
        let mut args = vec![
            "-c".to_string(),
            self.conf.display().to_string(),
            "--id".to_string(),
            self.user.clone(),
        ];

        if let Some(keyring) = &self.keyring {
            args.push("--keyring".to_string());
            args.push(keyring.display().to_string());
        }

        if !self.mon_hosts.is_empty() {
            args.push("-m".to_string());
            args.push(self.mon_hosts.join(","));
        }

        args
    }
}

// =============================================================================
// Repository Configuration
// =============================================================================

/// Validated configuration of an RBD repository
#[derive(Debug, Clone)]
pub struct RepositoryConfig {
    pub connection: ClusterConnection,
    /// Image name namespace within the pool
    pub namespace: Namespace,
}

impl RepositoryConfig {
    /// Build from a device-config map, checking that the config file exists
    pub fn from_device_config(dconf: &DeviceConfig) -> Result<Self> {
        let config = Self::parse(dconf)?;
        if !config.connection.conf.exists() {
            return Err(Error::ConfigFileNotFound {
                path: config.connection.conf.display().to_string(),
            });
        }
        Ok(config)
    }

    /// Build from a device-config map without touching the filesystem
    pub fn parse(dconf: &DeviceConfig) -> Result<Self> {
        require(dconf, &["pool"])?;

        let pool = non_empty(dconf, "pool")?.to_string();
        let conf = lookup(dconf, &["conf", "ceph_conf"])
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CEPH_CONF));
        let user = lookup(dconf, &["user", "ceph_user"])
            .unwrap_or(DEFAULT_CEPH_USER)
            .to_string();
        let keyring = lookup(dconf, &["keyring"]).map(PathBuf::from);
        let mon_hosts = lookup(dconf, &["mon_host"])
            .map(|hosts| {
                hosts
                    .split(',')
                    .map(str::trim)
                    .filter(|h| !h.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let namespace = Namespace::new(lookup(dconf, &["prefix"]).unwrap_or(""))?;

        Ok(Self {
            connection: ClusterConnection {
                pool,
                conf,
                user,
                keyring,
                mon_hosts,
            },
            namespace,
        })
    }

    pub fn pool(&self) -> &str {
        &self.connection.pool
    }

    /// Render back into device-config form, e.g. for a resume config
    pub fn to_device_config(&self) -> DeviceConfig {
        let conn = &self.connection;
        let mut dconf = DeviceConfig::new();
        dconf.insert("pool".into(), conn.pool.clone());
        dconf.insert("conf".into(), conn.conf.display().to_string());
        dconf.insert("user".into(), conn.user.clone());
        if let Some(keyring) = &conn.keyring {
            dconf.insert("keyring".into(), keyring.display().to_string());
        }
        if !conn.mon_hosts.is_empty() {
            dconf.insert("mon_host".into(), conn.mon_hosts.join(","));
        }
        if !self.namespace.prefix().is_empty() {
            dconf.insert("prefix".into(), self.namespace.prefix().to_string());
        }
        dconf
    }
}

// =============================================================================
// Layered (LVM over RBD) Configuration
// =============================================================================

/// Validated configuration of a volume group living inside one RBD image
#[derive(Debug, Clone)]
pub struct LayeredConfig {
    pub connection: ClusterConnection,
    /// Backing image name within the pool
    pub image: String,
    /// Requested backing image size in MiB (only needed for create)
    pub size_mb: Option<u64>,
    /// When set, deleting the repository leaves the backing image intact
    pub protected: bool,
}

impl LayeredConfig {
    pub fn parse(dconf: &DeviceConfig) -> Result<Self> {
        require(dconf, &["pool", "rbd_image"])?;

        let base = RepositoryConfig::parse(dconf)?;
        let image = non_empty(dconf, "rbd_image")?.to_string();
        let size_mb = match dconf.get("size") {
            Some(raw) => Some(parse_size_mb(raw).map_err(|e| Error::ConfigParameterInvalid {
                parameter: "size".into(),
                reason: format!("{}. Use formats like: 1024, 10G, 2T, 500M", e),
            })?),
            None => None,
        };
        let protected = match dconf.get("protected") {
            Some(raw) => parse_bool("protected", raw)?,
            None => true,
        };

        Ok(Self {
            connection: base.connection,
            image,
            size_mb,
            protected,
        })
    }

    /// `pool/image` spec of the backing image
    pub fn image_spec(&self) -> String {
        format!("{}/{}", self.connection.pool, self.image)
    }

    /// Render back into device-config form
    pub fn to_device_config(&self) -> DeviceConfig {
        let mut dconf = RepositoryConfig {
            connection: self.connection.clone(),
            namespace: Namespace::default(),
        }
        .to_device_config();
        dconf.insert("rbd_image".into(), self.image.clone());
        if let Some(size_mb) = self.size_mb {
            dconf.insert("size".into(), format!("{}M", size_mb));
        }
        dconf.insert("protected".into(), self.protected.to_string());
        dconf
    }

    /// Size required by create
    pub fn required_size_mb(&self) -> Result<u64> {
        self.size_mb.ok_or_else(|| Error::ConfigParameterMissing {
            parameters: "size (RBD image size, e.g., 10G, 2T, 1024M)".into(),
        })
    }
}

/// Parse a size with an optional K/M/G/T unit (and optional trailing `B`)
/// into MiB. A bare number is taken as MiB.
pub fn parse_size_mb(raw: &str) -> Result<u64> {
    use regex::Regex;
    use std::sync::LazyLock;

    static SIZE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^(\d+(?:\.\d+)?)\s*([KMGT]?)B?$").expect("static size pattern is valid")
    });

    let normalized = raw.trim().to_uppercase();
    if normalized.is_empty() {
        return Err(Error::SizeParse("size cannot be empty".into()));
    }

    let caps = SIZE_RE
        .captures(&normalized)
        .ok_or_else(|| Error::SizeParse(format!("invalid size format {:?}", raw)))?;
    let number: f64 = caps[1]
        .parse()
        .map_err(|_| Error::SizeParse(format!("invalid number in {:?}", raw)))?;

    let mb = match &caps[2] {
        "" | "M" => number,
        "K" => number / 1024.0,
        "G" => number * 1024.0,
        "T" => number * 1024.0 * 1024.0,
        unit => return Err(Error::SizeParse(format!("unsupported unit {}", unit))),
    };

    Ok(mb as u64)
}

fn parse_bool(parameter: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(Error::ConfigParameterInvalid {
            parameter: parameter.to_string(),
            reason: format!("expected true or false, got {:?}", raw),
        }),
    }
}

fn require(dconf: &DeviceConfig, keys: &[&str]) -> Result<()> {
    let missing: Vec<&str> = keys
        .iter()
        .copied()
        .filter(|k| !dconf.contains_key(*k))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::ConfigParameterMissing {
            parameters: missing.join(", "),
        })
    }
}

fn non_empty<'a>(dconf: &'a DeviceConfig, key: &str) -> Result<&'a str> {
    match dconf.get(key).map(|v| v.trim()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(Error::ConfigParameterInvalid {
            parameter: key.to_string(),
            reason: "must not be empty".into(),
        }),
    }
}

fn lookup<'a>(dconf: &'a DeviceConfig, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| dconf.get(*k))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
}

// =============================================================================
// Engine Configuration
// =============================================================================

/// Host-side tunables, independent of any one repository
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// `rbd` binary
    pub rbd_binary: String,
    /// `ceph` binary
    pub ceph_binary: String,
    /// How long to wait for a mapped device node to appear
    pub device_wait: Duration,
    /// Directory holding per-repository lock files
    pub lock_dir: PathBuf,
    /// Dedicated LVM configuration directory for layered repositories
    pub lvm_conf_dir: PathBuf,
    /// Attempts at the virtual-allocation compare-and-set before giving up
    pub allocation_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rbd_binary: "rbd".to_string(),
            ceph_binary: "ceph".to_string(),
            device_wait: Duration::from_secs(30),
            lock_dir: PathBuf::from("/var/lock/sm"),
            lvm_conf_dir: PathBuf::from(DEFAULT_LVM_CONF_DIR),
            allocation_attempts: 5,
        }
    }
}

impl EngineConfig {
    /// Engine config rooted in a scratch directory
    pub fn with_lock_dir(lock_dir: impl AsRef<Path>) -> Self {
        Self {
            lock_dir: lock_dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn dconf(pairs: &[(&str, &str)]) -> DeviceConfig {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = RepositoryConfig::parse(&dconf(&[("pool", "rbd")])).unwrap();
        assert_eq!(config.pool(), "rbd");
        assert_eq!(config.connection.conf, PathBuf::from(DEFAULT_CEPH_CONF));
        assert_eq!(config.connection.user, "admin");
        assert!(config.connection.keyring.is_none());
        assert!(config.connection.mon_hosts.is_empty());
        assert_eq!(config.namespace.prefix(), "");
    }

    #[test]
    fn test_missing_pool() {
        let err = RepositoryConfig::parse(&dconf(&[("user", "x")])).unwrap_err();
        assert_matches!(err, Error::ConfigParameterMissing { ref parameters } if parameters == "pool");
    }

    #[test]
    fn test_aliases_and_monitors() {
        let config = RepositoryConfig::parse(&dconf(&[
            ("pool", "vms"),
            ("ceph_conf", "/tmp/ceph.conf"),
            ("ceph_user", "xen"),
            ("mon_host", "10.0.0.1:6789, 10.0.0.2:6789,"),
            ("prefix", "sr7-"),
        ]))
        .unwrap();
        assert_eq!(config.connection.conf, PathBuf::from("/tmp/ceph.conf"));
        assert_eq!(config.connection.user, "xen");
        assert_eq!(
            config.connection.mon_hosts,
            vec!["10.0.0.1:6789".to_string(), "10.0.0.2:6789".to_string()]
        );
        assert_eq!(config.namespace.prefix(), "sr7-");

        let args = config.connection.auth_args();
        assert!(args.contains(&"-m".to_string()));
        assert!(args.contains(&"10.0.0.1:6789,10.0.0.2:6789".to_string()));
    }

    #[test]
    fn test_device_config_rendering() {
        let config = RepositoryConfig::parse(&dconf(&[
            ("pool", "vms"),
            ("keyring", "/etc/ceph/xen.keyring"),
            ("prefix", "a."),
        ]))
        .unwrap();
        let rendered = config.to_device_config();
        assert_eq!(rendered.get("keyring").map(String::as_str), Some("/etc/ceph/xen.keyring"));

        let reparsed = RepositoryConfig::parse(&rendered).unwrap();
        assert_eq!(reparsed.connection, config.connection);
        assert_eq!(reparsed.namespace, config.namespace);
    }

    #[test]
    fn test_missing_conf_file() {
        let err = RepositoryConfig::from_device_config(&dconf(&[
            ("pool", "rbd"),
            ("conf", "/nonexistent/ceph.conf"),
        ]))
        .unwrap_err();
        assert_matches!(err, Error::ConfigFileNotFound { .. });
    }

    #[test]
    fn test_parse_size_mb() {
        assert_eq!(parse_size_mb("1024").unwrap(), 1024);
        assert_eq!(parse_size_mb("500M").unwrap(), 500);
        assert_eq!(parse_size_mb("10G").unwrap(), 10240);
        assert_eq!(parse_size_mb("10gb").unwrap(), 10240);
        assert_eq!(parse_size_mb("2T").unwrap(), 2_097_152);
        assert_eq!(parse_size_mb("2048K").unwrap(), 2);
        assert_eq!(parse_size_mb("1.5G").unwrap(), 1536);
        assert!(parse_size_mb("").is_err());
        assert!(parse_size_mb("10P").is_err());
        assert!(parse_size_mb("G10").is_err());
    }

    #[test]
    fn test_layered_config() {
        let config = LayeredConfig::parse(&dconf(&[
            ("pool", "rbd"),
            ("rbd_image", "lvm-shared"),
            ("size", "10G"),
        ]))
        .unwrap();
        assert!(config.protected);
        assert_eq!(config.size_mb, Some(10240));
        assert_eq!(config.image_spec(), "rbd/lvm-shared");

        let config = LayeredConfig::parse(&dconf(&[
            ("pool", "rbd"),
            ("rbd_image", "lvm-shared"),
            ("protected", "False"),
        ]))
        .unwrap();
        assert!(!config.protected);
        assert_matches!(
            config.required_size_mb(),
            Err(Error::ConfigParameterMissing { .. })
        );

        let err = LayeredConfig::parse(&dconf(&[("pool", "rbd")])).unwrap_err();
        assert_matches!(err, Error::ConfigParameterMissing { ref parameters } if parameters == "rbd_image");

        let err = LayeredConfig::parse(&dconf(&[
            ("pool", "rbd"),
            ("rbd_image", "x"),
            ("size", "lots"),
        ]))
        .unwrap_err();
        assert_matches!(err, Error::ConfigParameterInvalid { .. });
    }
}
