//! Mirrors the Deployments, StatefulSets and Nodes of a cluster to a remote reporting endpoint:
//! one full snapshot at registration, then a stream of change events.

pub mod agent;
pub mod cluster;
pub mod config;
pub mod filter;
pub mod model;
pub mod router;
pub mod sink;
pub mod snapshot;
pub mod supervisor;
pub mod utils;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;

pub use agent::RelayAgent;
pub use cluster::{ClusterApi, KubeClusterApi};
pub use config::RelayConfig;
pub use sink::{HttpReportingSink, ReportingSink};
