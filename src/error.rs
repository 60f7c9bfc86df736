//! Error types for the RBD storage repository driver
//!
//! Provides structured error types for the volume lifecycle, the cluster and
//! control-plane ports, and the layered volume-group variant. Every fatal
//! variant carries the offending identifier and, where a tool was involved,
//! the tool's own error text.

use thiserror::Error;

/// Unified error type for the driver
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("device-config is missing the following parameters: {parameters}")]
    ConfigParameterMissing { parameters: String },

    #[error("Invalid configuration parameter {parameter}: {reason}")]
    ConfigParameterInvalid { parameter: String, reason: String },

    #[error("Ceph config file not found: {path}")]
    ConfigFileNotFound { path: String },

    // =========================================================================
    // Cluster Errors
    // =========================================================================
    #[error("Cannot connect to Ceph cluster: {reason}")]
    ClusterUnavailable { reason: String },

    #[error("Cannot access Ceph pool {pool}: {reason}")]
    PoolUnavailable { pool: String, reason: String },

    #[error("Failed to map RBD image {image}: {reason}")]
    MapFailed { image: String, reason: String },

    #[error("Failed to execute {command}: {reason}")]
    CommandSpawn { command: String, reason: String },

    #[error("{command} failed for {target}: {stderr}")]
    CommandFailed {
        command: String,
        target: String,
        stderr: String,
    },

    #[error("Failed to create RBD image {image}: {reason}")]
    CreateFailed { image: String, reason: String },

    #[error("Failed to delete RBD image {image}: {reason}")]
    DeleteFailed { image: String, reason: String },

    #[error("Failed to snapshot RBD image {image}: {reason}")]
    SnapshotFailed { image: String, reason: String },

    #[error("Failed to resize RBD image {image}: {reason}")]
    ResizeFailed { image: String, reason: String },

    // =========================================================================
    // Conflict Errors
    // =========================================================================
    #[error("VDI {volume} is in use: {reason}")]
    VolumeInUse { volume: String, reason: String },

    #[error("VDI {volume} has snapshots, cannot delete: {reason}")]
    HasSnapshots { volume: String, reason: String },

    #[error("Snapshot {snapshot} has clone children: {reason}")]
    HasChildren { snapshot: String, reason: String },

    #[error("Snapshot {snapshot} is protected")]
    SnapshotProtected { snapshot: String },

    #[error("Volume group {name} already exists")]
    RepositoryExists { name: String },

    #[error("Device {device} is already in use by another repository")]
    DeviceInUse { device: String },

    // =========================================================================
    // Not Found Errors
    // =========================================================================
    #[error("RBD image not found: {name}")]
    ImageNotFound { name: String },

    #[error("VDI not found: {uuid}")]
    VolumeNotFound { uuid: String },

    #[error("Pool {pool} not found in cluster usage report")]
    PoolNotReported { pool: String },

    // =========================================================================
    // Rejected Requests
    // =========================================================================
    #[error("Cannot shrink VDI {volume} from {current} to {requested} bytes")]
    ShrinkRejected {
        volume: String,
        current: u64,
        requested: u64,
    },

    #[error("Invalid volume name: {name}")]
    InvalidName { name: String },

    #[error("VDI size {requested} bytes exceeds pool {limit} free space {available} bytes")]
    InsufficientCapacity {
        requested: u64,
        available: u64,
        limit: String,
    },

    #[error("Operation {operation} is not supported for {target}")]
    Unsupported { operation: String, target: String },

    // =========================================================================
    // Control Plane Errors
    // =========================================================================
    #[error("Control plane error: {0}")]
    ControlPlane(String),

    #[error("Virtual allocation of {repository} changed concurrently {attempts} times")]
    AllocationContention { repository: String, attempts: u32 },

    #[error("Cannot lock {path}: {reason}")]
    Lock { path: String, reason: String },

    // =========================================================================
    // Volume Group Errors
    // =========================================================================
    #[error("LVM command {command} failed on {target}: {reason}")]
    Lvm {
        command: String,
        target: String,
        reason: String,
    },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Size parse error: {0}")]
    SizeParse(String),

    #[error("Tool output parse error for {command}: {reason}")]
    OutputParse { command: String, reason: String },

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Broad class of an error, deciding what the caller should do about it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad or missing parameter; fix the configuration
    Configuration,
    /// Cluster, pool or device unreachable; the operation failed outright
    Unavailable,
    /// Something still uses the object; shut down the consumer first
    Conflict,
    /// The object is gone
    NotFound,
    /// The request itself is not acceptable
    Rejected,
    /// Bug or unexpected state
    Internal,
}

impl Error {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::ConfigParameterMissing { .. }
            | Error::ConfigParameterInvalid { .. }
            | Error::ConfigFileNotFound { .. }
            | Error::SizeParse(_)
            | Error::YamlParse(_) => ErrorClass::Configuration,

            Error::VolumeInUse { .. }
            | Error::HasSnapshots { .. }
            | Error::HasChildren { .. }
            | Error::SnapshotProtected { .. }
            | Error::RepositoryExists { .. }
            | Error::DeviceInUse { .. } => ErrorClass::Conflict,

            Error::ImageNotFound { .. }
            | Error::VolumeNotFound { .. }
            | Error::PoolNotReported { .. } => ErrorClass::NotFound,

            Error::ShrinkRejected { .. }
            | Error::InvalidName { .. }
            | Error::InsufficientCapacity { .. }
            | Error::Unsupported { .. } => ErrorClass::Rejected,

            Error::Internal(_) | Error::OutputParse { .. } | Error::JsonParse(_) => {
                ErrorClass::Internal
            }

            _ => ErrorClass::Unavailable,
        }
    }

    /// Check if this error means something still uses the object
    pub fn is_conflict(&self) -> bool {
        self.class() == ErrorClass::Conflict
    }

    /// Check if this error means the object no longer exists
    pub fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }

    /// Check if retrying later without changing anything could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ClusterUnavailable { .. }
                | Error::PoolUnavailable { .. }
                | Error::AllocationContention { .. }
                | Error::Lock { .. }
        )
    }
}

/// Result type alias for the driver
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let err = Error::HasSnapshots {
            volume: "vdi-1".into(),
            reason: "2 snapshots".into(),
        };
        assert_eq!(err.class(), ErrorClass::Conflict);
        assert!(err.is_conflict());

        let err = Error::ConfigParameterMissing {
            parameters: "pool".into(),
        };
        assert_eq!(err.class(), ErrorClass::Configuration);

        let err = Error::ImageNotFound {
            name: "vdi-1".into(),
        };
        assert!(err.is_not_found());

        let err = Error::MapFailed {
            image: "vdi-1".into(),
            reason: "timeout".into(),
        };
        assert_eq!(err.class(), ErrorClass::Unavailable);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::ClusterUnavailable {
            reason: "monclient: hunting".into(),
        };
        assert!(transient.is_retryable());

        let conflict = Error::VolumeInUse {
            volume: "vdi-1".into(),
            reason: "attached".into(),
        };
        assert!(!conflict.is_retryable());
    }

    #[test]
    fn test_error_message_carries_identifier() {
        let err = Error::CommandFailed {
            command: "rbd rm".into(),
            target: "vdi-abc".into(),
            stderr: "rbd: error: image still has watchers".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("vdi-abc"));
        assert!(msg.contains("watchers"));
    }
}
