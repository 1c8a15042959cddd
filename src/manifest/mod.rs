//! Cluster manifests
//!
//! A YAML file declaring the roles of a cluster, read by the `ensemble` binary
//! and turned into a [`ClusterBuilder`](crate::cluster::ClusterBuilder).

pub mod config;
pub mod parser;

pub use config::{ManifestConfig, RoleConfig};
pub use parser::ManifestParser;
