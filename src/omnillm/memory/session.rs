//! Session memory: windowed storage scoped to a web session key.
//!
//! A process-level session store maps each session key to a shared backing
//! store; two `session` memories created with the same key see the same
//! conversation, different keys are fully separate.  Behavior is otherwise
//! identical to [`WindowedMemory`](crate::omnillm::memory::windowed::WindowedMemory).

use crate::omnillm::memory::windowed::{SharedStore, WindowedMemory};
use crate::omnillm::memory::{Memory, MemoryConfig};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::RwLock as AsyncRwLock;

lazy_static! {
    static ref SESSION_STORES: RwLock<HashMap<String, SharedStore>> = RwLock::new(HashMap::new());
    static ref FALLBACK_KEY: Mutex<u64> = Mutex::new(0);
}

/// Build (or rebind to) the session store for the config's session key.
pub fn session_memory(config: &MemoryConfig) -> Arc<dyn Memory> {
    let key = config.session_key.clone().unwrap_or_else(|| {
        // No key supplied: mint a process-unique one so the memory is
        // private rather than accidentally shared.
        let mut counter = FALLBACK_KEY.lock().expect("session key counter poisoned");
        *counter += 1;
        format!("anonymous-session-{}", counter)
    });
    let store = {
        let mut stores = SESSION_STORES.write().expect("session store lock poisoned");
        stores
            .entry(key)
            .or_insert_with(|| Arc::new(AsyncRwLock::new(Vec::new())))
            .clone()
    };
    Arc::new(SessionMemory {
        inner: WindowedMemory::with_store(store, config.window(), config.scope.clone()),
    })
}

/// Windowed memory bound to a process-level session store.
struct SessionMemory {
    inner: WindowedMemory,
}

#[async_trait::async_trait]
impl Memory for SessionMemory {
    fn kind(&self) -> &str {
        "session"
    }

    fn scope(&self) -> &crate::omnillm::memory::TenantScope {
        self.inner.scope()
    }

    async fn add(
        &self,
        entry: crate::omnillm::memory::MemoryEntry,
    ) -> Result<(), crate::omnillm::error::AiError> {
        self.inner.add(entry).await
    }

    async fn get_all(
        &self,
    ) -> Result<Vec<crate::omnillm::memory::MemoryEntry>, crate::omnillm::error::AiError> {
        self.inner.get_all().await
    }

    async fn clear(&self) -> Result<(), crate::omnillm::error::AiError> {
        self.inner.clear().await
    }

    async fn get_metadata(&self, key: &str) -> Option<serde_json::Value> {
        self.inner.get_metadata(key).await
    }

    async fn set_metadata(&self, key: &str, value: serde_json::Value) {
        self.inner.set_metadata(key, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::omnillm::memory::{MemoryEntry, TenantScope};
    use crate::omnillm::message::Role;

    #[tokio::test]
    async fn same_session_key_shares_history() {
        let config = MemoryConfig {
            session_key: Some("sess-42".into()),
            scope: TenantScope::default(),
            ..Default::default()
        };
        let first = session_memory(&config);
        let second = session_memory(&config);

        first
            .add(MemoryEntry::new(Role::User, "remember me"))
            .await
            .unwrap();
        assert_eq!(second.get_all().await.unwrap().len(), 1);

        let other = session_memory(&MemoryConfig {
            session_key: Some("sess-43".into()),
            ..Default::default()
        });
        assert!(other.get_all().await.unwrap().is_empty());
    }
}
