//! In-process `KvStore` implementation.
//!
//! Strongly consistent on a single key by construction: every operation
//! takes the single `RwLock` guard for its whole duration, so a read-modify-
//! write sequence performed by a caller (read, mutate in memory, write back)
//! is safe exactly as spec §4.1 requires, as long as callers don't assume
//! cross-key atomicity — which the State Store contract never promises.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::KvStore;
use crate::error::Result;

#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        let data = self.data.read().await;
        Ok(data.get(collection).and_then(|c| c.get(key)).cloned())
    }

    async fn put(&self, collection: &str, key: &str, value: Value) -> Result<()> {
        let mut data = self.data.write().await;
        data.entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<()> {
        let mut data = self.data.write().await;
        if let Some(c) = data.get_mut(collection) {
            c.remove(key);
        }
        Ok(())
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        let data = self.data.read().await;
        Ok(data
            .get(collection)
            .map(|c| c.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let store = MemoryStore::new();
        store.put("vms", "i-1", json!({"status": "running"})).await.unwrap();
        let v = store.get("vms", "i-1").await.unwrap();
        assert_eq!(v, Some(json!({"status": "running"})));
    }

    #[tokio::test]
    async fn missing_key_is_none() {
        let store = MemoryStore::new();
        assert_eq!(store.get("vms", "nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemoryStore::new();
        store.delete("vms", "nope").await.unwrap();
        store.put("vms", "i-1", json!(1)).await.unwrap();
        store.delete("vms", "i-1").await.unwrap();
        store.delete("vms", "i-1").await.unwrap();
        assert_eq!(store.get("vms", "i-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_scopes_by_collection() {
        let store = MemoryStore::new();
        store.put("vms", "i-1", json!(1)).await.unwrap();
        store.put("candidates", "a@b.com", json!(2)).await.unwrap();
        let vms = store.list("vms").await.unwrap();
        assert_eq!(vms.len(), 1);
        assert_eq!(vms[0].0, "i-1");
    }
}
