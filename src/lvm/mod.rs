//! LVM-over-RBD layering
//!
//! A generic volume-group engine, a decorator that scopes it to RBD
//! devices, and the layered repository built on both.

pub mod engine;
pub mod memory;
pub mod repository;
pub mod scoped;

pub use engine::LvmEngine;
pub use memory::MemoryVolumeGroups;
pub use repository::{LayeredScanReport, LvmOverRbd};
pub use scoped::RbdScopedVolumeGroup;
