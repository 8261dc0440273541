//! Hybrid memory: recent conversation plus semantic recall.
//!
//! `retrieve(query)` returns the `recent_limit` most-recent messages from
//! the recent half, followed by `semantic_limit` vector hits from the
//! vector half, deduplicated by id, the recent set in temporal order, the
//! semantic hits in relevance order.  Writes go to both halves.

use crate::omnillm::error::AiError;
use crate::omnillm::memory::vector::VectorMemory;
use crate::omnillm::memory::windowed::WindowedMemory;
use crate::omnillm::memory::{Memory, MemoryConfig, MemoryEntry, TenantScope};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

const DEFAULT_RECENT_LIMIT: usize = 10;
const DEFAULT_SEMANTIC_LIMIT: usize = 5;

/// Composite of a recent-window memory and a vector memory.
pub struct HybridMemory {
    recent: Arc<dyn Memory>,
    vector: Arc<dyn VectorMemory>,
    recent_limit: usize,
    semantic_limit: usize,
    scope: TenantScope,
}

impl HybridMemory {
    /// Build from factory config.  `hybrid_vector` is required;
    /// `hybrid_recent` defaults to a fresh windowed memory in the same
    /// scope.
    pub fn from_config(config: &MemoryConfig) -> Result<Self, AiError> {
        let vector = config.hybrid_vector.clone().ok_or_else(|| {
            AiError::ConfigMissing("hybrid memory requires config.hybrid_vector".into())
        })?;
        let recent = config.hybrid_recent.clone().unwrap_or_else(|| {
            Arc::new(WindowedMemory::new(config.window(), config.scope.clone()))
        });
        Ok(HybridMemory {
            recent,
            vector,
            recent_limit: if config.recent_limit == 0 {
                DEFAULT_RECENT_LIMIT
            } else {
                config.recent_limit
            },
            semantic_limit: if config.semantic_limit == 0 {
                DEFAULT_SEMANTIC_LIMIT
            } else {
                config.semantic_limit
            },
            scope: config.scope.clone(),
        })
    }

    /// Build from explicit halves.
    pub fn new(
        recent: Arc<dyn Memory>,
        vector: Arc<dyn VectorMemory>,
        recent_limit: usize,
        semantic_limit: usize,
        scope: TenantScope,
    ) -> Self {
        HybridMemory {
            recent,
            vector,
            recent_limit,
            semantic_limit,
            scope,
        }
    }
}

fn entry_id(entry: &MemoryEntry) -> Option<String> {
    entry
        .metadata
        .get("id")
        .and_then(|id| id.as_str())
        .map(String::from)
}

#[async_trait::async_trait]
impl Memory for HybridMemory {
    fn kind(&self) -> &str {
        "hybrid"
    }

    fn scope(&self) -> &TenantScope {
        &self.scope
    }

    async fn add(&self, mut entry: MemoryEntry) -> Result<(), AiError> {
        self.scope.stamp(&mut entry.metadata);
        // A shared id keys deduplication between the two halves.
        if entry_id(&entry).is_none() {
            entry.metadata.insert(
                "id".into(),
                Value::String(uuid::Uuid::new_v4().to_string()),
            );
        }
        self.recent.add(entry.clone()).await?;
        let id = entry_id(&entry).unwrap_or_default();
        self.vector
            .store(&id, &entry.content, entry.metadata, None)
            .await
    }

    async fn get_all(&self) -> Result<Vec<MemoryEntry>, AiError> {
        self.recent.get_all().await
    }

    async fn clear(&self) -> Result<(), AiError> {
        self.recent.clear().await?;
        self.vector.clear().await
    }

    async fn get_metadata(&self, key: &str) -> Option<Value> {
        self.recent.get_metadata(key).await
    }

    async fn set_metadata(&self, key: &str, value: Value) {
        self.recent.set_metadata(key, value).await
    }

    async fn retrieve(&self, query: &str, _limit: usize) -> Result<Vec<MemoryEntry>, AiError> {
        let recent = self.recent.retrieve(query, self.recent_limit).await?;
        let mut seen: HashSet<String> = recent.iter().filter_map(entry_id).collect();

        let hits = self
            .vector
            .search(query, self.semantic_limit, None, None)
            .await?;

        let mut combined = recent;
        for hit in hits {
            if seen.insert(hit.record.id.clone()) {
                combined.push(crate::omnillm::memory::vector::record_to_entry(hit.record));
            }
        }
        Ok(combined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::omnillm::memory::vector::test_support::box_memory;
    use crate::omnillm::message::Role;

    #[tokio::test]
    async fn retrieve_dedupes_and_orders_recent_first() {
        let vector = Arc::new(box_memory(TenantScope::default()));
        let hybrid = HybridMemory::new(
            Arc::new(WindowedMemory::new(20, TenantScope::default())),
            vector,
            2,
            3,
            TenantScope::default(),
        );

        for text in ["alpha fact", "beta fact", "gamma fact"] {
            hybrid
                .add(MemoryEntry::new(Role::User, text))
                .await
                .unwrap();
        }

        let results = hybrid.retrieve("gamma fact", 10).await.unwrap();
        // Recent window first (beta, gamma), then any semantic hit not
        // already present (alpha).
        assert_eq!(results[0].content, "beta fact");
        assert_eq!(results[1].content, "gamma fact");
        let ids: Vec<Option<String>> = results.iter().map(entry_id).collect();
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(ids.len(), unique.len());
    }

    #[tokio::test]
    async fn writes_reach_both_halves() {
        let vector = Arc::new(box_memory(TenantScope::default()));
        let hybrid = HybridMemory::new(
            Arc::new(WindowedMemory::new(20, TenantScope::default())),
            vector.clone(),
            5,
            5,
            TenantScope::default(),
        );
        hybrid
            .add(MemoryEntry::new(Role::User, "stored everywhere"))
            .await
            .unwrap();

        assert_eq!(hybrid.get_all().await.unwrap().len(), 1);
        let hits = vector.search("stored everywhere", 1, None, None).await.unwrap();
        assert_eq!(hits.len(), 1);
    }
}
