//! Cluster Client Adapters
//!
//! Implementations of [`ClusterClient`](crate::domain::ports::ClusterClient):
//! - RbdCli: the real `rbd`/`ceph` tools
//! - SimCluster: an in-memory pool for tests and dry runs

pub mod rbd;
pub mod sim;

pub use rbd::RbdCli;
pub use sim::SimCluster;
