//! Domain types for the kiln state store.
//!
//! A [`ClusterRecord`] is the aggregate root for one provisioned cluster and
//! is stored as a single JSON document per `(namespace, name)`. Records
//! written before `format_version` existed are upgraded on read by
//! [`ClusterRecord::from_value`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{StateError, StateResult};

/// Current on-disk format of [`ClusterRecord`].
pub const RECORD_FORMAT_VERSION: u32 = 1;

/// The only cluster type kiln manages.
pub const CLUSTER_TYPE: &str = "k3s";

/// Unique identifier of a compute instance.
pub type InstanceId = String;

// ── Cluster record ────────────────────────────────────────────────

/// Persisted lifecycle state of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterState {
    #[default]
    Initial,
    Created,
    Deleted,
}

/// Position in the provisioning state machine, derived from which record
/// fields are populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionPhase {
    New,
    NetworkReady,
    NodesBooted,
    ControlPlaneReady,
    WorkersJoined,
    LbConfigured,
    StorageReady,
    Created,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterRecord {
    pub format_version: u32,
    pub name: String,
    pub namespace: String,
    #[serde(rename = "type")]
    pub cluster_type: String,

    /// Resolved k3s version the cluster was installed with.
    #[serde(default)]
    pub software_version: Option<String>,
    /// Every version this cluster has run, oldest first.
    #[serde(default)]
    pub version_history: Vec<String>,
    /// Version of kiln that created the record.
    #[serde(default)]
    pub tool_version: Option<String>,

    #[serde(default)]
    pub state: ClusterState,

    /// Next serial used to name a node. Never decreases.
    pub node_serial: u64,
    #[serde(default)]
    pub node_network: Option<String>,
    /// First entry is the primary control-plane node.
    #[serde(default)]
    pub control_plane_nodes: Vec<InstanceId>,
    #[serde(default)]
    pub worker_nodes: Vec<InstanceId>,

    #[serde(default)]
    pub server_token: Option<String>,
    #[serde(default)]
    pub node_token: Option<String>,

    #[serde(default)]
    pub api_address_inner: Option<String>,
    #[serde(default)]
    pub api_address_floating: Option<String>,
    /// Floating addresses handed to the load-balancer pool. Append-only.
    #[serde(default)]
    pub routed_addresses: Vec<String>,

    #[serde(default)]
    pub kubeconfig: Option<String>,
    #[serde(default)]
    pub ssh_key: Option<String>,
    /// Storage layer version, once installed.
    #[serde(default)]
    pub storage_version: Option<String>,
}

impl ClusterRecord {
    /// A freshly initialised record with empty topology.
    pub fn new(
        name: &str,
        namespace: &str,
        software_version: &str,
        node_serial: u64,
        node_network: &str,
    ) -> Self {
        Self {
            format_version: RECORD_FORMAT_VERSION,
            name: name.to_string(),
            namespace: namespace.to_string(),
            cluster_type: CLUSTER_TYPE.to_string(),
            software_version: Some(software_version.to_string()),
            version_history: vec![software_version.to_string()],
            tool_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            state: ClusterState::Initial,
            node_serial,
            node_network: Some(node_network.to_string()),
            control_plane_nodes: Vec::new(),
            worker_nodes: Vec::new(),
            server_token: None,
            node_token: None,
            api_address_inner: None,
            api_address_floating: None,
            routed_addresses: Vec::new(),
            kubeconfig: None,
            ssh_key: None,
            storage_version: None,
        }
    }

    /// The node whose tokens and addresses are authoritative.
    pub fn primary_control_plane(&self) -> Option<&str> {
        self.control_plane_nodes.first().map(String::as_str)
    }

    /// Every distinct instance referenced by either role list, in order.
    pub fn all_nodes(&self) -> Vec<InstanceId> {
        let mut seen = Vec::with_capacity(self.control_plane_nodes.len() + self.worker_nodes.len());
        for id in self.control_plane_nodes.iter().chain(&self.worker_nodes) {
            if !seen.contains(id) {
                seen.push(id.clone());
            }
        }
        seen
    }

    /// Drop everything that describes live infrastructure except the
    /// network and routed addresses, which teardown releases afterwards.
    pub fn clear_topology(&mut self) {
        self.control_plane_nodes.clear();
        self.worker_nodes.clear();
        self.api_address_inner = None;
        self.api_address_floating = None;
        self.software_version = None;
        self.kubeconfig = None;
        self.server_token = None;
        self.node_token = None;
        self.storage_version = None;
    }

    pub fn phase(&self) -> ProvisionPhase {
        match self.state {
            ClusterState::Deleted => return ProvisionPhase::Deleted,
            ClusterState::Created => return ProvisionPhase::Created,
            ClusterState::Initial => {}
        }
        if self.storage_version.is_some() {
            ProvisionPhase::StorageReady
        } else if !self.routed_addresses.is_empty() {
            ProvisionPhase::LbConfigured
        } else if self.kubeconfig.is_some() {
            ProvisionPhase::WorkersJoined
        } else if self.server_token.is_some() && self.node_token.is_some() {
            ProvisionPhase::ControlPlaneReady
        } else if self.api_address_inner.is_some() {
            ProvisionPhase::NodesBooted
        } else if self.node_network.is_some() {
            ProvisionPhase::NetworkReady
        } else {
            ProvisionPhase::New
        }
    }

    /// Decode a stored document, upgrading older layouts first.
    pub fn from_value(value: Value) -> StateResult<Self> {
        let value = migrate_record(value)?;
        serde_json::from_value(value).map_err(|e| StateError::Deserialize(e.to_string()))
    }

    pub fn to_value(&self) -> StateResult<Value> {
        serde_json::to_value(self).map_err(|e| StateError::Serialize(e.to_string()))
    }
}

/// Upgrade a stored record document to [`RECORD_FORMAT_VERSION`].
fn migrate_record(mut value: Value) -> StateResult<Value> {
    let Some(doc) = value.as_object_mut() else {
        return Err(StateError::Deserialize(
            "cluster record is not an object".to_string(),
        ));
    };

    let version = doc
        .get("format_version")
        .and_then(Value::as_u64)
        .unwrap_or(0);

    if version == 0 {
        debug!("upgrading unversioned cluster record");
        for (old, new) in [
            ("k3s_version", "software_version"),
            ("k3s_version_history", "version_history"),
            ("plugin_version", "tool_version"),
        ] {
            if let Some(v) = doc.remove(old) {
                doc.entry(new.to_string()).or_insert(v);
            }
        }
        // Teardown used to leave an empty list where the network id was.
        if doc.get("node_network").is_some_and(|v| !v.is_string()) {
            doc.insert("node_network".to_string(), Value::Null);
        }
        for list in [
            "version_history",
            "control_plane_nodes",
            "worker_nodes",
            "routed_addresses",
        ] {
            if doc.get(list).is_none_or(Value::is_null) {
                doc.insert(list.to_string(), Value::Array(Vec::new()));
            }
        }
        doc.entry("node_serial".to_string()).or_insert(Value::from(1u64));
        doc.entry("type".to_string())
            .or_insert(Value::from(CLUSTER_TYPE));
        doc.insert(
            "format_version".to_string(),
            Value::from(RECORD_FORMAT_VERSION),
        );
    } else if version > u64::from(RECORD_FORMAT_VERSION) {
        return Err(StateError::Deserialize(format!(
            "cluster record format {version} is newer than supported {RECORD_FORMAT_VERSION}"
        )));
    }

    Ok(value)
}

// ── Version cache ─────────────────────────────────────────────────

/// Cached release listing for one release family in one namespace.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VersionCache {
    /// Unix timestamp (seconds) of the last refresh. Zero means never.
    pub updated: u64,
    /// Channel (or tag) → version (or tarball URL).
    #[serde(default)]
    pub releases: BTreeMap<String, String>,
    /// Highest stable version, for families resolved by ordering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest: Option<String>,
}

impl VersionCache {
    /// Decode a stored cache, falling back to an empty (stale) cache when
    /// the document is absent or malformed.
    pub fn from_stored(value: Option<Value>) -> Self {
        let Some(value) = value else {
            return Self::default();
        };
        let Some(doc) = value.as_object() else {
            debug!("version cache format invalid, clobbering");
            return Self::default();
        };

        // Older writers stored a float timestamp.
        let updated = doc
            .get("updated")
            .and_then(|u| u.as_u64().or_else(|| u.as_f64().map(|f| f as u64)))
            .unwrap_or(0);
        let releases = doc
            .get("releases")
            .and_then(|r| serde_json::from_value(r.clone()).ok())
            .unwrap_or_default();
        let latest = doc.get("latest").and_then(Value::as_str).map(str::to_string);

        Self {
            updated,
            releases,
            latest,
        }
    }

    pub fn is_stale(&self, now: u64, ttl_secs: u64) -> bool {
        now.saturating_sub(self.updated) > ttl_secs
    }
}
