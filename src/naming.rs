//! Volume Identity & Naming
//!
//! Deterministic translation between control-plane UUIDs and cluster
//! image/snapshot names. A repository owns a namespace prefix; every name it
//! manages is `prefix + "vdi-" + uuid` (images) or `prefix + "snap-" + uuid`
//! (snapshots). Anything else in the pool is invisible to the repository,
//! which is how several repositories share one pool.

use crate::error::{Error, Result};
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// Image name prefix, after the namespace prefix
pub const IMAGE_PREFIX: &str = "vdi-";

/// Snapshot name prefix, after the namespace prefix
pub const SNAPSHOT_PREFIX: &str = "snap-";

static UUID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
        .expect("static UUID pattern is valid")
});

static PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.\-]*$").expect("static prefix pattern is valid"));

/// Check a string against the canonical 8-4-4-4-12 hex UUID grammar
pub fn is_canonical_uuid(s: &str) -> bool {
    UUID_RE.is_match(s)
}

/// Generate a fresh UUID for a new volume
pub fn new_volume_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

// =============================================================================
// Cluster Names
// =============================================================================

/// A parsed cluster-side name that belongs to a repository namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClusterName {
    /// A standalone (or cloned) image
    Image { uuid: String },
    /// A snapshot of an image, addressed as `image@snapshot`
    Snapshot { parent: String, uuid: String },
}

impl ClusterName {
    /// UUID of the volume this name stands for
    pub fn uuid(&self) -> &str {
        match self {
            ClusterName::Image { uuid } | ClusterName::Snapshot { uuid, .. } => uuid,
        }
    }

    pub fn is_snapshot(&self) -> bool {
        matches!(self, ClusterName::Snapshot { .. })
    }
}

// =============================================================================
// Namespace
// =============================================================================

/// Name translation for one repository
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Namespace {
    prefix: String,
}

impl Namespace {
    /// Create a namespace, rejecting prefixes that cannot appear in image names
    pub fn new(prefix: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        if !PREFIX_RE.is_match(&prefix) {
            return Err(Error::ConfigParameterInvalid {
                parameter: "prefix".into(),
                reason: format!("{:?} may only contain letters, digits, '_', '.' and '-'", prefix),
            });
        }
        Ok(Self { prefix })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Cluster image name for a volume UUID
    pub fn image_name(&self, uuid: &str) -> String {
        format!("{}{}{}", self.prefix, IMAGE_PREFIX, uuid)
    }

    /// Cluster snapshot name (the part after `@`) for a snapshot UUID
    pub fn snapshot_name(&self, uuid: &str) -> String {
        format!("{}{}{}", self.prefix, SNAPSHOT_PREFIX, uuid)
    }

    /// Full `image@snapshot` spec for a snapshot of `parent`
    pub fn snapshot_spec(&self, parent: &str, uuid: &str) -> String {
        format!("{}@{}", self.image_name(parent), self.snapshot_name(uuid))
    }

    /// Cluster name for a parsed name
    pub fn render(&self, name: &ClusterName) -> String {
        match name {
            ClusterName::Image { uuid } => self.image_name(uuid),
            ClusterName::Snapshot { parent, uuid } => self.snapshot_spec(parent, uuid),
        }
    }

    /// Recover the volume UUID from an image name
    pub fn parse_image_name(&self, name: &str) -> Option<String> {
        Self::strip(name, &self.prefix, IMAGE_PREFIX)
    }

    /// Recover the snapshot UUID from a snapshot name
    pub fn parse_snapshot_name(&self, name: &str) -> Option<String> {
        Self::strip(name, &self.prefix, SNAPSHOT_PREFIX)
    }

    /// Parse an image name with an optional snapshot part
    ///
    /// Returns `None` for anything outside this namespace.
    pub fn parse(&self, image: &str, snapshot: Option<&str>) -> Option<ClusterName> {
        let parent = self.parse_image_name(image)?;
        match snapshot {
            None => Some(ClusterName::Image { uuid: parent }),
            Some(snap) => {
                let uuid = self.parse_snapshot_name(snap)?;
                Some(ClusterName::Snapshot { parent, uuid })
            }
        }
    }

    /// Parse an `image` or `image@snapshot` spec
    pub fn parse_spec(&self, spec: &str) -> Option<ClusterName> {
        match spec.split_once('@') {
            Some((image, snap)) => self.parse(image, Some(snap)),
            None => self.parse(spec, None),
        }
    }

    /// Like [`Namespace::parse_spec`], but an error for foreign names
    pub fn require_spec(&self, spec: &str) -> Result<ClusterName> {
        self.parse_spec(spec).ok_or_else(|| Error::InvalidName {
            name: spec.to_string(),
        })
    }

    fn strip(name: &str, prefix: &str, kind: &str) -> Option<String> {
        let uuid = name.strip_prefix(prefix)?.strip_prefix(kind)?;
        is_canonical_uuid(uuid).then(|| uuid.to_string())
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.prefix.is_empty() {
            write!(f, "<default>")
        } else {
            write!(f, "{}", self.prefix)
        }
    }
}
