//! Cache memory: windowed behavior over an external key-value store.
//!
//! The store is reached through the [`KeyValueStore`] seam; concrete
//! cache drivers (Redis, Memcached, provider KV services) are external
//! collaborators.  Entries serialize as a JSON array under the key
//! `userId/conversationId`, so every tenant pair owns a distinct cache
//! key.  An in-process map implementation backs tests and single-node use.

use crate::omnillm::error::AiError;
use crate::omnillm::memory::{Memory, MemoryConfig, MemoryEntry, TenantScope};
use crate::omnillm::message::Role;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Minimal contract a cache driver must satisfy.
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the value at `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>, AiError>;
    /// Write `value` at `key`, replacing any existing value.
    async fn put(&self, key: &str, value: String) -> Result<(), AiError>;
    /// Remove `key`.
    async fn delete(&self, key: &str) -> Result<(), AiError>;
}

/// In-process [`KeyValueStore`] used as the default backend and in tests.
#[derive(Default)]
pub struct InMemoryKeyValueStore {
    entries: RwLock<HashMap<String, String>>,
}

impl InMemoryKeyValueStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, AiError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<(), AiError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AiError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

/// Windowed memory persisted in a key-value store.
pub struct CacheMemory {
    store: Arc<dyn KeyValueStore>,
    capacity: usize,
    scope: TenantScope,
    metadata: RwLock<Map<String, Value>>,
}

impl CacheMemory {
    /// Build from factory config; a missing `kv_store` falls back to an
    /// in-process map.
    pub fn from_config(config: &MemoryConfig) -> Self {
        CacheMemory {
            store: config
                .kv_store
                .clone()
                .unwrap_or_else(|| Arc::new(InMemoryKeyValueStore::new())),
            capacity: config.window(),
            scope: config.scope.clone(),
            metadata: RwLock::new(Map::new()),
        }
    }

    /// Cache key for this memory's tenant pair.
    fn cache_key(&self) -> String {
        format!(
            "{}/{}",
            self.scope.user_id.as_deref().unwrap_or("default"),
            self.scope.conversation_id.as_deref().unwrap_or("default")
        )
    }

    async fn load(&self) -> Result<Vec<MemoryEntry>, AiError> {
        match self.store.get(&self.cache_key()).await? {
            Some(serialized) => serde_json::from_str(&serialized)
                .map_err(|e| AiError::Protocol(format!("corrupt cache memory entry: {}", e))),
            None => Ok(Vec::new()),
        }
    }

    async fn save(&self, entries: &[MemoryEntry]) -> Result<(), AiError> {
        let serialized = serde_json::to_string(entries)
            .map_err(|e| AiError::Protocol(format!("cache memory encode failed: {}", e)))?;
        self.store.put(&self.cache_key(), serialized).await
    }
}

#[async_trait::async_trait]
impl Memory for CacheMemory {
    fn kind(&self) -> &str {
        "cache"
    }

    fn scope(&self) -> &TenantScope {
        &self.scope
    }

    async fn add(&self, mut entry: MemoryEntry) -> Result<(), AiError> {
        self.scope.stamp(&mut entry.metadata);
        let mut entries = self.load().await?;
        entries.push(entry);
        // Same eviction as windowed: oldest non-system first.
        while entries.len() > self.capacity {
            match entries.iter().position(|e| e.role != Role::System) {
                Some(index) => {
                    entries.remove(index);
                }
                None => break,
            }
        }
        self.save(&entries).await
    }

    async fn get_all(&self) -> Result<Vec<MemoryEntry>, AiError> {
        Ok(self
            .load()
            .await?
            .into_iter()
            .filter(|e| self.scope.matches(&e.metadata))
            .collect())
    }

    async fn clear(&self) -> Result<(), AiError> {
        self.store.delete(&self.cache_key()).await
    }

    async fn get_metadata(&self, key: &str) -> Option<Value> {
        self.metadata.read().await.get(key).cloned()
    }

    async fn set_metadata(&self, key: &str, value: Value) {
        self.metadata.write().await.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tenant_pairs_use_distinct_cache_keys() {
        let store: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());
        let mem_a = CacheMemory::from_config(&MemoryConfig {
            kv_store: Some(store.clone()),
            scope: TenantScope::new("a", "c"),
            ..Default::default()
        });
        let mem_b = CacheMemory::from_config(&MemoryConfig {
            kv_store: Some(store.clone()),
            scope: TenantScope::new("b", "c"),
            ..Default::default()
        });

        mem_a.add(MemoryEntry::new(Role::User, "blue")).await.unwrap();
        mem_b.add(MemoryEntry::new(Role::User, "red")).await.unwrap();

        assert_eq!(mem_a.get_all().await.unwrap()[0].content, "blue");
        assert_eq!(mem_b.get_all().await.unwrap()[0].content, "red");
        assert!(store.get("a/c").await.unwrap().is_some());
        assert!(store.get("b/c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn eviction_applies_in_cache_too() {
        let mem = CacheMemory::from_config(&MemoryConfig {
            window_size: 2,
            ..Default::default()
        });
        for i in 0..3 {
            mem.add(MemoryEntry::new(Role::User, format!("m{}", i)))
                .await
                .unwrap();
        }
        let contents: Vec<String> = mem
            .get_all()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.content)
            .collect();
        assert_eq!(contents, vec!["m1", "m2"]);
    }
}
