//! ClusterStore — cluster record persistence over namespace metadata.
//!
//! Provides typed get/put/delete of [`ClusterRecord`]s, the per-namespace
//! cluster name index, and the serial ledger that keeps node names unique
//! across teardown and rebuild of the same cluster name.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::metadata::MetadataStore;
use crate::types::{ClusterRecord, VersionCache};

/// Metadata item holding the list of cluster names in a namespace.
pub const CLUSTER_INDEX_KEY: &str = "orchestrated_k3s_clusters";

/// Metadata item holding next node serials of removed clusters.
pub const SERIAL_LEDGER_KEY: &str = "orchestrated_k3s_cluster_serials";

/// Metadata item name for a single cluster record.
pub fn record_key(name: &str) -> String {
    format!("orchestrated_k3s_cluster_{name}")
}

/// Cluster state persistence. Cheap to clone; clones share the
/// registration lock.
#[derive(Clone)]
pub struct ClusterStore {
    metadata: Arc<dyn MetadataStore>,
    /// Serialises check-then-register within this process.
    registration: Arc<Mutex<()>>,
}

impl ClusterStore {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self {
            metadata,
            registration: Arc::new(Mutex::new(())),
        }
    }

    /// The underlying metadata store, for other namespace-scoped items.
    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    // ── Records ────────────────────────────────────────────────────

    pub async fn get(&self, namespace: &str, name: &str) -> StateResult<Option<ClusterRecord>> {
        match self.metadata.get_item(namespace, &record_key(name)).await? {
            Some(value) => Ok(Some(ClusterRecord::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Like [`get`](Self::get) but absent records are an error.
    pub async fn require(&self, namespace: &str, name: &str) -> StateResult<ClusterRecord> {
        self.get(namespace, name)
            .await?
            .ok_or_else(|| StateError::NotFound(format!("cluster {name} in namespace {namespace}")))
    }

    /// Full overwrite of the record stored under the record's own
    /// namespace and name.
    pub async fn put(&self, record: &ClusterRecord) -> StateResult<()> {
        let value = record.to_value()?;
        self.metadata
            .set_item(&record.namespace, &record_key(&record.name), &value)
            .await?;
        debug!(cluster = %record.name, namespace = %record.namespace, "cluster record stored");
        Ok(())
    }

    pub async fn delete(&self, namespace: &str, name: &str) -> StateResult<()> {
        self.metadata
            .delete_item(namespace, &record_key(name))
            .await?;
        debug!(cluster = %name, %namespace, "cluster record deleted");
        Ok(())
    }

    // ── Name index ─────────────────────────────────────────────────

    pub async fn list_names(&self, namespace: &str) -> StateResult<Vec<String>> {
        let value = self.metadata.get_item(namespace, CLUSTER_INDEX_KEY).await?;
        decode_index(value)
    }

    /// Reserve `name` in the namespace index.
    ///
    /// Fails with [`StateError::NameTaken`] when the name is already indexed
    /// or a record already exists for it; the two are checked together
    /// because they must never disagree.
    pub async fn register_name(&self, namespace: &str, name: &str) -> StateResult<()> {
        let _guard = self.registration.lock().await;

        let mut names = self.list_names(namespace).await?;
        let has_record = self
            .metadata
            .get_item(namespace, &record_key(name))
            .await?
            .is_some();
        if has_record || names.iter().any(|n| n == name) {
            return Err(StateError::NameTaken {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }

        names.push(name.to_string());
        self.metadata
            .set_item(namespace, CLUSTER_INDEX_KEY, &Value::from(names))
            .await?;
        info!(cluster = %name, %namespace, "cluster name registered");
        Ok(())
    }

    /// Remove `name` from the index, deleting the index item once empty.
    pub async fn unregister_name(&self, namespace: &str, name: &str) -> StateResult<()> {
        let _guard = self.registration.lock().await;

        let mut names = self.list_names(namespace).await?;
        names.retain(|n| n != name);
        if names.is_empty() {
            self.metadata
                .delete_item(namespace, CLUSTER_INDEX_KEY)
                .await?;
        } else {
            self.metadata
                .set_item(namespace, CLUSTER_INDEX_KEY, &Value::from(names))
                .await?;
        }
        debug!(cluster = %name, %namespace, "cluster name unregistered");
        Ok(())
    }

    // ── Serial ledger ──────────────────────────────────────────────

    /// First node serial a new cluster with this name should use.
    pub async fn next_serial(&self, namespace: &str, name: &str) -> StateResult<u64> {
        let ledger = self.ledger(namespace).await?;
        Ok(ledger.get(name).copied().unwrap_or(1).max(1))
    }

    /// Remember where a removed cluster's serials stopped.
    pub async fn retire_serial(&self, namespace: &str, name: &str, next: u64) -> StateResult<()> {
        let mut ledger = self.ledger(namespace).await?;
        let entry = ledger.entry(name.to_string()).or_insert(next);
        *entry = (*entry).max(next);
        let value =
            serde_json::to_value(&ledger).map_err(|e| StateError::Serialize(e.to_string()))?;
        self.metadata
            .set_item(namespace, SERIAL_LEDGER_KEY, &value)
            .await
    }

    async fn ledger(&self, namespace: &str) -> StateResult<BTreeMap<String, u64>> {
        match self.metadata.get_item(namespace, SERIAL_LEDGER_KEY).await? {
            Some(value) => {
                serde_json::from_value(value).map_err(|e| StateError::Deserialize(e.to_string()))
            }
            None => Ok(BTreeMap::new()),
        }
    }

    // ── Version caches ─────────────────────────────────────────────

    pub async fn get_version_cache(&self, namespace: &str, key: &str) -> StateResult<VersionCache> {
        let value = self.metadata.get_item(namespace, key).await?;
        Ok(VersionCache::from_stored(value))
    }

    pub async fn put_version_cache(
        &self,
        namespace: &str,
        key: &str,
        cache: &VersionCache,
    ) -> StateResult<()> {
        let value =
            serde_json::to_value(cache).map_err(|e| StateError::Serialize(e.to_string()))?;
        self.metadata.set_item(namespace, key, &value).await
    }
}

fn decode_index(value: Option<Value>) -> StateResult<Vec<String>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(value) => {
            serde_json::from_value(value).map_err(|e| StateError::Deserialize(e.to_string()))
        }
    }
}
