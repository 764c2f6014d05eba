//! Namespace metadata — the flat key/value space cluster state lives in.
//!
//! The remote API exposes per-namespace metadata items; [`RedbMetadataStore`]
//! provides the same contract on a local redb database for offline use and
//! for tests.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableDatabase};
use serde_json::Value;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::{item_key, METADATA};

/// A namespace-scoped key/value store with per-item overwrite semantics.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Fetch a single item, `None` when absent.
    async fn get_item(&self, namespace: &str, key: &str) -> StateResult<Option<Value>>;

    /// Create or fully overwrite an item.
    async fn set_item(&self, namespace: &str, key: &str, value: &Value) -> StateResult<()>;

    /// Remove an item. Removing an absent item is not an error.
    async fn delete_item(&self, namespace: &str, key: &str) -> StateResult<()>;
}

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Local metadata store backed by redb.
#[derive(Clone)]
pub struct RedbMetadataStore {
    db: Arc<Database>,
}

impl RedbMetadataStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(map_err!(Open))?;
        }
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "metadata store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory metadata store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(METADATA).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn read(&self, key: &str) -> StateResult<Option<Value>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(METADATA).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: Value =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn write(&self, key: &str, value: &Value) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(METADATA).map_err(map_err!(Table))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(METADATA).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }
}

#[async_trait]
impl MetadataStore for RedbMetadataStore {
    async fn get_item(&self, namespace: &str, key: &str) -> StateResult<Option<Value>> {
        self.read(&item_key(namespace, key))
    }

    async fn set_item(&self, namespace: &str, key: &str, value: &Value) -> StateResult<()> {
        let key = item_key(namespace, key);
        self.write(&key, value)?;
        debug!(%key, "metadata item stored");
        Ok(())
    }

    async fn delete_item(&self, namespace: &str, key: &str) -> StateResult<()> {
        let key = item_key(namespace, key);
        let existed = self.remove(&key)?;
        debug!(%key, existed, "metadata item deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn item_put_and_get() {
        let store = RedbMetadataStore::open_in_memory().unwrap();
        store
            .set_item("team1", "answer", &json!({"value": 42}))
            .await
            .unwrap();

        let got = store.get_item("team1", "answer").await.unwrap();
        assert_eq!(got, Some(json!({"value": 42})));
    }

    #[tokio::test]
    async fn items_are_namespace_scoped() {
        let store = RedbMetadataStore::open_in_memory().unwrap();
        store.set_item("team1", "k", &json!(1)).await.unwrap();

        assert!(store.get_item("team2", "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_overwrites_rather_than_merges() {
        let store = RedbMetadataStore::open_in_memory().unwrap();
        store
            .set_item("ns", "k", &json!({"a": 1, "b": 2}))
            .await
            .unwrap();
        store.set_item("ns", "k", &json!({"a": 3})).await.unwrap();

        assert_eq!(
            store.get_item("ns", "k").await.unwrap(),
            Some(json!({"a": 3}))
        );
    }

    #[tokio::test]
    async fn delete_absent_item_is_ok() {
        let store = RedbMetadataStore::open_in_memory().unwrap();
        store.delete_item("ns", "missing").await.unwrap();
        store.set_item("ns", "k", &json!(true)).await.unwrap();
        store.delete_item("ns", "k").await.unwrap();
        assert!(store.get_item("ns", "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("state.redb");

        {
            let store = RedbMetadataStore::open(&db_path).unwrap();
            store.set_item("prod", "k", &json!("v")).await.unwrap();
        }

        let store = RedbMetadataStore::open(&db_path).unwrap();
        assert_eq!(
            store.get_item("prod", "k").await.unwrap(),
            Some(json!("v"))
        );
    }
}
