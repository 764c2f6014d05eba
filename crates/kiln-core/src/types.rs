//! Shared naming helpers and the fixed instance hardware template.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Role a compute instance plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    ControlPlane,
    Worker,
}

impl NodeRole {
    /// Role keyword passed to the k3s installer (`server` or `agent`).
    pub fn installer_keyword(self) -> &'static str {
        match self {
            NodeRole::ControlPlane => "server",
            NodeRole::Worker => "agent",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::ControlPlane => f.write_str("control plane"),
            NodeRole::Worker => f.write_str("worker"),
        }
    }
}

/// Hardware template every cluster node is created from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceTemplate {
    pub cpus: u32,
    /// Memory in MiB.
    pub memory_mb: u64,
    /// Root disk size in GiB.
    pub disk_gb: u64,
    pub base_image: String,
    pub nic_model: String,
    pub side_channels: Vec<String>,
}

impl Default for InstanceTemplate {
    fn default() -> Self {
        Self {
            cpus: 2,
            memory_mb: 2048,
            disk_gb: 50,
            base_image: "debian:12".to_string(),
            nic_model: "virtio".to_string(),
            side_channels: vec!["sf-agent".to_string()],
        }
    }
}

/// Fully-qualified cluster name, `{name}.{namespace}`.
///
/// Used for kubeconfig entries so clusters from different namespaces never
/// collide in the operator's local configuration.
pub fn qualified_name(name: &str, namespace: &str) -> String {
    format!("{name}.{namespace}")
}

/// Deterministic instance name for the given cluster and serial.
pub fn node_name(cluster: &str, serial: u64) -> String {
    format!("k3s-{cluster}-node-{serial:03}")
}

/// Name of the private network allocated for a cluster.
pub fn network_name(cluster: &str) -> String {
    format!("k3s-{cluster}-node")
}
