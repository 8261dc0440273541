//! Windowed memory: an in-process ring buffer of the last N messages.
//!
//! Eviction is FIFO over non-system entries; a stored `system` message
//! survives trimming so the conversation never loses its priming.  Two
//! scoped instances can share one backing store (see
//! [`WindowedMemory::with_store`]); eviction counts and removes only the
//! instance's own tenant entries.

use crate::omnillm::error::AiError;
use crate::omnillm::memory::{Memory, MemoryEntry, TenantScope};
use crate::omnillm::message::Role;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared backing store type for windowed-style memories.
pub type SharedStore = Arc<RwLock<Vec<MemoryEntry>>>;

/// In-process ring buffer memory.
pub struct WindowedMemory {
    store: SharedStore,
    capacity: usize,
    scope: TenantScope,
    metadata: RwLock<Map<String, Value>>,
}

impl WindowedMemory {
    /// A memory retaining the last `capacity` messages for `scope`.
    pub fn new(capacity: usize, scope: TenantScope) -> Self {
        Self::with_store(Arc::new(RwLock::new(Vec::new())), capacity, scope)
    }

    /// A memory over an existing backing store.
    ///
    /// Multiple scoped instances sharing the store stay isolated: each
    /// sees and evicts only its own tenant's entries.
    pub fn with_store(store: SharedStore, capacity: usize, scope: TenantScope) -> Self {
        WindowedMemory {
            store,
            capacity,
            scope,
            metadata: RwLock::new(Map::new()),
        }
    }

    /// Borrow the backing store for sharing with another instance.
    pub fn store(&self) -> SharedStore {
        self.store.clone()
    }

    /// Trim this scope's entries down to capacity, oldest non-system first.
    fn trim(entries: &mut Vec<MemoryEntry>, scope: &TenantScope, capacity: usize) {
        loop {
            let visible = entries.iter().filter(|e| scope.matches(&e.metadata)).count();
            if visible <= capacity {
                return;
            }
            let oldest_non_system = entries
                .iter()
                .position(|e| scope.matches(&e.metadata) && e.role != Role::System);
            match oldest_non_system {
                Some(index) => {
                    entries.remove(index);
                }
                // Nothing but system entries left; cannot trim further.
                None => return,
            }
        }
    }
}

#[async_trait::async_trait]
impl Memory for WindowedMemory {
    fn kind(&self) -> &str {
        "windowed"
    }

    fn scope(&self) -> &TenantScope {
        &self.scope
    }

    async fn add(&self, mut entry: MemoryEntry) -> Result<(), AiError> {
        self.scope.stamp(&mut entry.metadata);
        let mut entries = self.store.write().await;
        entries.push(entry);
        Self::trim(&mut entries, &self.scope, self.capacity);
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<MemoryEntry>, AiError> {
        let entries = self.store.read().await;
        Ok(entries
            .iter()
            .filter(|e| self.scope.matches(&e.metadata))
            .cloned()
            .collect())
    }

    async fn clear(&self) -> Result<(), AiError> {
        let mut entries = self.store.write().await;
        entries.retain(|e| !self.scope.matches(&e.metadata));
        Ok(())
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
    async fn evicts_oldest_non_system_at_capacity() {
        let mem = WindowedMemory::new(2, TenantScope::default());
        mem.add(MemoryEntry::new(Role::System, "sys")).await.unwrap();
        mem.add(MemoryEntry::new(Role::User, "one")).await.unwrap();
        mem.add(MemoryEntry::new(Role::User, "two")).await.unwrap();

        // Capacity 2 with a system entry: "one" is evicted, "sys" survives.
        let all = mem.get_all().await.unwrap();
        let contents: Vec<&str> = all.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["sys", "two"]);
    }

    #[tokio::test]
    async fn shared_store_keeps_tenants_isolated() {
        let store: SharedStore = Arc::new(RwLock::new(Vec::new()));
        let mem_a = WindowedMemory::with_store(store.clone(), 10, TenantScope::new("a", "c"));
        let mem_b = WindowedMemory::with_store(store.clone(), 10, TenantScope::new("b", "c"));

        mem_a
            .add(MemoryEntry::new(Role::User, "color=blue"))
            .await
            .unwrap();
        mem_b
            .add(MemoryEntry::new(Role::User, "color=red"))
            .await
            .unwrap();

        let a: Vec<String> = mem_a
            .get_all()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.content)
            .collect();
        let b: Vec<String> = mem_b
            .get_all()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.content)
            .collect();
        assert_eq!(a, vec!["color=blue"]);
        assert_eq!(b, vec!["color=red"]);

        // clear() is tenant-local too.
        mem_a.clear().await.unwrap();
        assert!(mem_a.get_all().await.unwrap().is_empty());
        assert_eq!(mem_b.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn export_import_round_trips() {
        let mem = WindowedMemory::new(10, TenantScope::default());
        mem.add(MemoryEntry::new(Role::User, "hello")).await.unwrap();
        mem.add(MemoryEntry::new(Role::Assistant, "hi")).await.unwrap();

        let dump = mem.export().await.unwrap();
        let restored = WindowedMemory::new(10, TenantScope::default());
        restored.import(dump).await.unwrap();

        assert_eq!(mem.get_all().await.unwrap(), restored.get_all().await.unwrap());
    }

    #[tokio::test]
    async fn retrieve_returns_most_recent() {
        let mem = WindowedMemory::new(10, TenantScope::default());
        for i in 0..5 {
            mem.add(MemoryEntry::new(Role::User, format!("m{}", i)))
                .await
                .unwrap();
        }
        let recent = mem.retrieve("ignored", 2).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
    }
}
