//! RBD Storage Repository
//!
//! Control-plane driver exposing Ceph RBD pools as storage repositories of
//! virtual disks. The driver keeps three independently changing views in
//! step: the control plane's disk records, the cluster's image and
//! snapshot graph, and each host's kernel device mappings.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                 Repository / Vdi lifecycle operations                │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐ ┌────────────┐ ┌────────────┐ ┌──────────────────┐   │
//! │  │  Naming    │ │  Capacity  │ │  Mapping   │ │ Snapshot / Clone │   │
//! │  │            │ │ Accountant │ │  Tracker   │ │    Protocol      │   │
//! │  └────────────┘ └────────────┘ └────────────┘ └──────────────────┘   │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                              Ports                                   │
//! │  ┌────────────────────┐ ┌────────────────────┐ ┌──────────────────┐  │
//! │  │   ClusterClient    │ │    ControlPlane    │ │ VolumeGroup-     │  │
//! │  │ (rbd/ceph, sim)    │ │ (state file, mem)  │ │ Lifecycle (LVM)  │  │
//! │  └────────────────────┘ └────────────────────┘ └──────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`repository`]: repository and disk lifecycle, capacity, mappings
//! - [`lvm`]: the LVM-over-RBD layered repository
//! - [`cluster`]: `rbd`/`ceph` command client and an in-memory pool
//! - [`controlplane`]: control-plane record stores
//! - [`naming`]: UUID to image/snapshot name translation
//! - [`domain`]: port traits and shared types
//! - [`error`]: error types and classification

pub mod cluster;
pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod lock;
pub mod lvm;
pub mod naming;
pub mod repository;

// Re-export commonly used types
pub use cluster::{RbdCli, SimCluster};

pub use config::{ClusterConnection, DeviceConfig, EngineConfig, LayeredConfig, RepositoryConfig};

pub use controlplane::{MemoryControlPlane, StateFileControlPlane};

pub use domain::ports::{
    ClusterClient, ControlPlane, DiskRecord, MappedDevice, RepositoryStats, VolumeGroupLifecycle,
};

pub use error::{Error, ErrorClass, Result};

pub use lvm::{LvmEngine, LvmOverRbd, MemoryVolumeGroups, RbdScopedVolumeGroup};

pub use naming::{ClusterName, Namespace};

pub use repository::{MappingChange, ProbeReport, Repository, ResumeConfig, ScanReport, Vdi, Volume};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
