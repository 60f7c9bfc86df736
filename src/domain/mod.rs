//! Domain ports
//!
//! The cluster, the control plane and the volume-group engine are all
//! reached through the traits in [`ports`]; the repository logic never
//! names a concrete adapter.

pub mod ports;

pub use ports::*;
