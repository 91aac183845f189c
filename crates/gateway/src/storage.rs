//! Per-actor key/value persistence.
//!
//! Every actor owns one storage namespace and is its only writer. The
//! `Storage` trait is the seam for a durable backend; the shipped
//! implementation is in-memory.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use taskgate_common::ids::{ServerId, TaskId};
use taskgate_common::types::TaskStatus;
use taskgate_common::Result;

/// Abstract key/value store partitioned by actor namespace.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, ns: &str, key: &str) -> Result<Option<Value>>;

    async fn put(&self, ns: &str, key: &str, value: Value) -> Result<()>;

    /// Write several keys atomically.
    async fn put_many(&self, ns: &str, entries: Vec<(String, Value)>) -> Result<()>;

    async fn delete(&self, ns: &str, key: &str) -> Result<()>;

    /// Drop the whole namespace.
    async fn clear(&self, ns: &str) -> Result<()>;

    async fn keys(&self, ns: &str) -> Result<Vec<String>>;
}

/// In-memory storage backend.
#[derive(Default)]
pub struct MemoryStorage {
    spaces: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, ns: &str, key: &str) -> Result<Option<Value>> {
        let spaces = self.spaces.read().await;
        Ok(spaces.get(ns).and_then(|space| space.get(key)).cloned())
    }

    async fn put(&self, ns: &str, key: &str, value: Value) -> Result<()> {
        let mut spaces = self.spaces.write().await;
        spaces
            .entry(ns.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn put_many(&self, ns: &str, entries: Vec<(String, Value)>) -> Result<()> {
        let mut spaces = self.spaces.write().await;
        let space = spaces.entry(ns.to_string()).or_default();
        for (key, value) in entries {
            space.insert(key, value);
        }
        Ok(())
    }

    async fn delete(&self, ns: &str, key: &str) -> Result<()> {
        let mut spaces = self.spaces.write().await;
        if let Some(space) = spaces.get_mut(ns) {
            space.remove(key);
        }
        Ok(())
    }

    async fn clear(&self, ns: &str) -> Result<()> {
        let mut spaces = self.spaces.write().await;
        spaces.remove(ns);
        Ok(())
    }

    async fn keys(&self, ns: &str) -> Result<Vec<String>> {
        let spaces = self.spaces.read().await;
        Ok(spaces
            .get(ns)
            .map(|space| space.keys().cloned().collect())
            .unwrap_or_default())
    }
}

/// A storage view pinned to one actor's namespace.
#[derive(Clone)]
pub struct StorageHandle {
    namespace: String,
    backend: Arc<dyn Storage>,
}

impl StorageHandle {
    pub fn new(backend: Arc<dyn Storage>, kind: &str, name: &str) -> Self {
        Self {
            namespace: format!("{}/{}", kind, name),
            backend,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.backend.get(&self.namespace, key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.backend.put(&self.namespace, key, value).await
    }

    /// Serialize and write several keys in one transaction.
    pub async fn put_many(&self, entries: Vec<(String, Value)>) -> Result<()> {
        self.backend.put_many(&self.namespace, entries).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.backend.delete(&self.namespace, key).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.backend.clear(&self.namespace).await
    }
}

/// One row of the external task table.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRow {
    pub id: TaskId,
    pub status: TaskStatus,
    pub request: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<ServerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Write-only tabular sink of task rows, kept for external query tooling.
/// The gateway never reads it back.
#[async_trait]
pub trait TaskTable: Send + Sync {
    async fn upsert(&self, row: TaskRow) -> Result<()>;
}

/// In-memory task table.
#[derive(Default)]
pub struct MemoryTaskTable {
    rows: RwLock<BTreeMap<String, TaskRow>>,
}

impl MemoryTaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/inspection helper: number of rows currently held.
    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl TaskTable for MemoryTaskTable {
    async fn upsert(&self, row: TaskRow) -> Result<()> {
        let mut rows = self.rows.write().await;
        rows.insert(row.id.to_string(), row);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn namespaces_are_isolated() {
        let backend: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let a = StorageHandle::new(Arc::clone(&backend), "task", "a");
        let b = StorageHandle::new(Arc::clone(&backend), "task", "b");

        a.put("status", &"PENDING").await.unwrap();
        assert_eq!(
            a.get::<String>("status").await.unwrap().as_deref(),
            Some("PENDING")
        );
        assert!(b.get::<String>("status").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_drops_only_own_namespace() {
        let backend: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let a = StorageHandle::new(Arc::clone(&backend), "server", "s1");
        let b = StorageHandle::new(Arc::clone(&backend), "server", "s2");

        a.put("healthScore", &100u8).await.unwrap();
        b.put("healthScore", &40u8).await.unwrap();
        a.clear().await.unwrap();

        assert!(a.get::<u8>("healthScore").await.unwrap().is_none());
        assert_eq!(b.get::<u8>("healthScore").await.unwrap(), Some(40));
    }

    #[tokio::test]
    async fn put_many_writes_all_keys() {
        let backend: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let handle = StorageHandle::new(backend, "stats", "2024-01-06");

        handle
            .put_many(vec![
                ("stats".into(), json!({"totalTasks": 3})),
                ("events-1".into(), json!([{"kind": "start"}])),
            ])
            .await
            .unwrap();

        assert!(handle.get::<Value>("stats").await.unwrap().is_some());
        assert!(handle.get::<Value>("events-1").await.unwrap().is_some());
    }
}
