//! Vector memory: the semantic-retrieval contract and the in-process
//! BoxVector implementation.
//!
//! A [`VectorMemory`] is a [`Memory`] whose entries are additionally
//! indexed by embedding.  Embeddings are auto-generated through the
//! configured [`Embedder`] when the caller does not supply them.  The
//! distance metric defaults to cosine; backends that support others
//! accept a [`SpaceType`].
//!
//! [`BoxVectorMemory`] keeps everything in process memory: the reference
//! implementation of the contract and the default store for tests and
//! small workloads.  HTTP-backed stores live under
//! [`backends`](crate::omnillm::memory::backends).

use crate::omnillm::config::global_config;
use crate::omnillm::error::AiError;
use crate::omnillm::memory::{Memory, MemoryConfig, MemoryEntry, TenantScope};
use crate::omnillm::message::Role;
use crate::omnillm::request::{EmbeddingInput, EmbeddingRequest, RequestOptions};
use crate::omnillm::service::{service, Service};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Distance metric for vector search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SpaceType {
    /// Cosine similarity (default).
    #[default]
    Cosine,
    /// Euclidean distance (scored as negated distance).
    L2,
    /// Dot product.
    InnerProduct,
}

impl SpaceType {
    /// Parse a `space_type` configuration value.
    pub fn from_name(name: &str) -> Result<SpaceType, AiError> {
        match name.to_ascii_lowercase().as_str() {
            "cosine" => Ok(SpaceType::Cosine),
            "l2" => Ok(SpaceType::L2),
            "innerproduct" => Ok(SpaceType::InnerProduct),
            other => Err(AiError::InvalidArgument(format!(
                "unknown space type '{}'",
                other
            ))),
        }
    }

    /// Similarity score between two vectors under this metric.  Higher is
    /// closer for every variant (L2 negates the distance).
    pub fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            SpaceType::Cosine => {
                let dot = dot(a, b);
                let norms = norm(a) * norm(b);
                if norms == 0.0 {
                    0.0
                } else {
                    dot / norms
                }
            }
            SpaceType::L2 => {
                let squared: f32 = a
                    .iter()
                    .zip(b.iter())
                    .map(|(x, y)| (x - y) * (x - y))
                    .sum();
                -squared.sqrt()
            }
            SpaceType::InnerProduct => dot(a, b),
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn norm(a: &[f32]) -> f32 {
    dot(a, a).sqrt()
}

/// One stored, indexed record.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VectorRecord {
    /// Caller-assigned record ID.
    pub id: String,
    /// The indexed text.
    pub text: String,
    /// Free-form metadata; tenant keys live here.
    pub metadata: Map<String, Value>,
    /// The embedding vector.
    pub embedding: Vec<f32>,
    /// Insertion time, used for temporal ordering in hybrid retrieval.
    pub created_at: DateTime<Utc>,
}

/// A search result with its similarity score.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// The matched record.
    pub record: VectorRecord,
    /// Similarity under the memory's [`SpaceType`] (higher is closer).
    pub score: f32,
}

/// Metadata filter: every key must match the record's metadata exactly.
pub fn filter_matches(filter: &Map<String, Value>, metadata: &Map<String, Value>) -> bool {
    filter
        .iter()
        .all(|(key, value)| metadata.get(key) == Some(value))
}

/// Embedding generator bound to one provider service.
pub struct Embedder {
    service: Arc<dyn Service>,
    model: Option<String>,
    options: RequestOptions,
}

impl Embedder {
    /// An embedder over the named provider.
    pub fn for_provider(
        provider: &str,
        model: Option<String>,
        options: RequestOptions,
    ) -> Result<Self, AiError> {
        let config = global_config().provider_config(provider);
        Ok(Embedder {
            service: service(provider, &config)?,
            model,
            options,
        })
    }

    /// An embedder over an explicit service (stubs in tests).
    pub fn from_service(service: Arc<dyn Service>, model: Option<String>) -> Self {
        Embedder {
            service,
            model,
            options: RequestOptions::default(),
        }
    }

    /// Embed a batch of texts, one vector per text.
    pub async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AiError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = EmbeddingRequest {
            input: EmbeddingInput::Batch(texts),
            model: self.model.clone(),
            params: Map::new(),
            options: self.options.clone(),
            return_format: Default::default(),
        };
        let response = self.service.embed(&request).await?;
        Ok(response.vectors)
    }

    /// Embed a single text.
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>, AiError> {
        let mut vectors = self.embed(vec![text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| AiError::Protocol("embedding provider returned no vector".into()))
    }
}

/// Memory with an embedding index.
#[async_trait::async_trait]
pub trait VectorMemory: Memory {
    /// Store a record, embedding the text when `embedding` is `None`.
    async fn store(
        &self,
        id: &str,
        text: &str,
        metadata: Map<String, Value>,
        embedding: Option<Vec<f32>>,
    ) -> Result<(), AiError>;

    /// Store-or-replace by ID with an auto-generated embedding.
    async fn upsert(
        &self,
        id: &str,
        text: &str,
        metadata: Map<String, Value>,
    ) -> Result<(), AiError> {
        self.store(id, text, metadata, None).await
    }

    /// Remove a record by ID.
    async fn delete(&self, id: &str) -> Result<(), AiError>;

    /// Remove every record matching the metadata filter; returns the
    /// removed count.
    async fn delete_by_filter(&self, filter: &Map<String, Value>) -> Result<u64, AiError>;

    /// Semantic search by query text.
    async fn search(
        &self,
        query: &str,
        top_k: usize,
        filter: Option<&Map<String, Value>>,
        min_score: Option<f32>,
    ) -> Result<Vec<SearchHit>, AiError>;

    /// Semantic search by precomputed vector.
    async fn search_by_vector(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: Option<&Map<String, Value>>,
    ) -> Result<Vec<SearchHit>, AiError>;

    /// Fetch a record by ID.
    async fn get_by_id(&self, id: &str) -> Result<Option<VectorRecord>, AiError>;

    /// Create a collection.
    async fn create_collection(&self, name: &str) -> Result<(), AiError>;

    /// True when the collection exists.
    async fn collection_exists(&self, name: &str) -> Result<bool, AiError>;

    /// Drop a collection and its records.
    async fn delete_collection(&self, name: &str) -> Result<(), AiError>;
}

/// In-process vector memory.
pub struct BoxVectorMemory {
    collections: RwLock<HashMap<String, HashMap<String, VectorRecord>>>,
    collection: String,
    embedder: Arc<Embedder>,
    space: SpaceType,
    scope: TenantScope,
    metadata: RwLock<Map<String, Value>>,
}

impl BoxVectorMemory {
    /// Build from factory config.
    pub fn from_config(config: &MemoryConfig) -> Result<Self, AiError> {
        let collection = config.collection_name();
        let mut collections = HashMap::new();
        collections.insert(collection.clone(), HashMap::new());
        Ok(BoxVectorMemory {
            collections: RwLock::new(collections),
            collection,
            embedder: config.build_embedder()?,
            space: config.space_type,
            scope: config.scope.clone(),
            metadata: RwLock::new(Map::new()),
        })
    }

    fn scoped_filter(&self, filter: Option<&Map<String, Value>>) -> Map<String, Value> {
        let mut combined = filter.cloned().unwrap_or_default();
        self.scope.stamp(&mut combined);
        combined
    }
}

#[async_trait::async_trait]
impl Memory for BoxVectorMemory {
    fn kind(&self) -> &str {
        "boxvector"
    }

    fn scope(&self) -> &TenantScope {
        &self.scope
    }

    async fn add(&self, mut entry: MemoryEntry) -> Result<(), AiError> {
        self.scope.stamp(&mut entry.metadata);
        entry
            .metadata
            .insert("role".into(), Value::String(entry.role.as_str().to_string()));
        let id = uuid::Uuid::new_v4().to_string();
        self.store(&id, &entry.content.clone(), entry.metadata, None)
            .await
    }

    async fn get_all(&self) -> Result<Vec<MemoryEntry>, AiError> {
        let collections = self.collections.read().await;
        let records = collections
            .get(&self.collection)
            .map(|c| c.values().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        let mut visible: Vec<VectorRecord> = records
            .into_iter()
            .filter(|r| self.scope.matches(&r.metadata))
            .collect();
        visible.sort_by_key(|r| r.created_at);
        Ok(visible.into_iter().map(record_to_entry).collect())
    }

    async fn clear(&self) -> Result<(), AiError> {
        let mut collections = self.collections.write().await;
        if let Some(records) = collections.get_mut(&self.collection) {
            records.retain(|_, r| !self.scope.matches(&r.metadata));
        }
        Ok(())
    }

    async fn get_metadata(&self, key: &str) -> Option<Value> {
        self.metadata.read().await.get(key).cloned()
    }

    async fn set_metadata(&self, key: &str, value: Value) {
        self.metadata.write().await.insert(key.to_string(), value);
    }

    async fn retrieve(&self, query: &str, limit: usize) -> Result<Vec<MemoryEntry>, AiError> {
        let hits = self.search(query, limit, None, None).await?;
        Ok(hits.into_iter().map(|h| record_to_entry(h.record)).collect())
    }
}

#[async_trait::async_trait]
impl VectorMemory for BoxVectorMemory {
    async fn store(
        &self,
        id: &str,
        text: &str,
        mut metadata: Map<String, Value>,
        embedding: Option<Vec<f32>>,
    ) -> Result<(), AiError> {
        self.scope.stamp(&mut metadata);
        let embedding = match embedding {
            Some(embedding) => embedding,
            None => self.embedder.embed_one(text).await?,
        };
        let record = VectorRecord {
            id: id.to_string(),
            text: text.to_string(),
            metadata,
            embedding,
            created_at: Utc::now(),
        };
        let mut collections = self.collections.write().await;
        collections
            .entry(self.collection.clone())
            .or_default()
            .insert(id.to_string(), record);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), AiError> {
        let mut collections = self.collections.write().await;
        if let Some(records) = collections.get_mut(&self.collection) {
            records.remove(id);
        }
        Ok(())
    }

    async fn delete_by_filter(&self, filter: &Map<String, Value>) -> Result<u64, AiError> {
        let combined = self.scoped_filter(Some(filter));
        let mut collections = self.collections.write().await;
        let records = match collections.get_mut(&self.collection) {
            Some(records) => records,
            None => return Ok(0),
        };
        let before = records.len();
        records.retain(|_, r| !filter_matches(&combined, &r.metadata));
        Ok((before - records.len()) as u64)
    }

    async fn search(
        &self,
        query: &str,
        top_k: usize,
        filter: Option<&Map<String, Value>>,
        min_score: Option<f32>,
    ) -> Result<Vec<SearchHit>, AiError> {
        let embedding = self.embedder.embed_one(query).await?;
        let mut hits = self.search_by_vector(&embedding, top_k, filter).await?;
        if let Some(min_score) = min_score {
            hits.retain(|h| h.score >= min_score);
        }
        Ok(hits)
    }

    async fn search_by_vector(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: Option<&Map<String, Value>>,
    ) -> Result<Vec<SearchHit>, AiError> {
        let combined = self.scoped_filter(filter);
        let collections = self.collections.read().await;
        let records = match collections.get(&self.collection) {
            Some(records) => records,
            None => return Ok(Vec::new()),
        };
        let mut hits: Vec<SearchHit> = records
            .values()
            .filter(|r| filter_matches(&combined, &r.metadata))
            .map(|r| SearchHit {
                score: self.space.score(embedding, &r.embedding),
                record: r.clone(),
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<VectorRecord>, AiError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(&self.collection)
            .and_then(|records| records.get(id))
            .cloned())
    }

    async fn create_collection(&self, name: &str) -> Result<(), AiError> {
        let mut collections = self.collections.write().await;
        collections.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool, AiError> {
        Ok(self.collections.read().await.contains_key(name))
    }

    async fn delete_collection(&self, name: &str) -> Result<(), AiError> {
        self.collections.write().await.remove(name);
        Ok(())
    }
}

/// Convert a stored record back into a conversation entry.
pub(crate) fn record_to_entry(record: VectorRecord) -> MemoryEntry {
    let role = record
        .metadata
        .get("role")
        .and_then(|r| r.as_str())
        .and_then(|r| Role::from_name(r).ok())
        .unwrap_or(Role::User);
    let mut metadata = record.metadata;
    metadata.insert("id".into(), Value::String(record.id));
    MemoryEntry {
        role,
        content: record.text,
        timestamp: record.created_at,
        metadata,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::omnillm::request::{ChatRequest, EmbeddingRequest};
    use crate::omnillm::service::{ChatResponse, ChunkCallback, EmbeddingResponse};

    /// Deterministic embedding stub: hashes character counts into a small
    /// vector so equal texts embed equally and different texts diverge.
    pub struct StubEmbeddingService;

    pub fn stub_vector(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; 8];
        for (i, byte) in text.bytes().enumerate() {
            vector[i % 8] += byte as f32 / 255.0;
        }
        vector
    }

    #[async_trait::async_trait]
    impl crate::omnillm::service::Service for StubEmbeddingService {
        fn name(&self) -> &str {
            "stub-embed"
        }

        async fn invoke(&self, _request: &ChatRequest) -> Result<ChatResponse, AiError> {
            Err(AiError::Unsupported {
                provider: "stub-embed".into(),
                operation: "chat".into(),
            })
        }

        async fn invoke_stream(
            &self,
            _request: &ChatRequest,
            _on_chunk: ChunkCallback<'_>,
        ) -> Result<(), AiError> {
            Err(AiError::Unsupported {
                provider: "stub-embed".into(),
                operation: "chatStream".into(),
            })
        }

        async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse, AiError> {
            let vectors: Vec<Vec<f32>> = request
                .input
                .texts()
                .iter()
                .map(|t| stub_vector(t))
                .collect();
            Ok(EmbeddingResponse {
                raw: serde_json::json!({}),
                vectors,
                usage: None,
            })
        }
    }

    pub fn stub_embedder() -> Arc<Embedder> {
        Arc::new(Embedder::from_service(Arc::new(StubEmbeddingService), None))
    }

    pub fn box_memory(scope: TenantScope) -> BoxVectorMemory {
        BoxVectorMemory::from_config(&MemoryConfig {
            scope,
            embedder: Some(stub_embedder()),
            ..Default::default()
        })
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn space_scores_order_sanely() {
        let a = [1.0, 0.0];
        let b = [1.0, 0.0];
        let c = [0.0, 1.0];
        assert!(SpaceType::Cosine.score(&a, &b) > SpaceType::Cosine.score(&a, &c));
        assert!(SpaceType::L2.score(&a, &b) > SpaceType::L2.score(&a, &c));
        assert!(SpaceType::InnerProduct.score(&a, &b) > SpaceType::InnerProduct.score(&a, &c));
    }

    #[tokio::test]
    async fn store_search_roundtrip() {
        let mem = box_memory(TenantScope::default());
        mem.upsert("1", "the capital of France is Paris", Map::new())
            .await
            .unwrap();
        mem.upsert("2", "rust ownership and borrowing", Map::new())
            .await
            .unwrap();

        let hits = mem
            .search("the capital of France is Paris", 1, None, None)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, "1");
    }

    #[tokio::test]
    async fn scoped_memory_never_leaks_across_tenants() {
        // Two scopes share one store through add()/search() isolation.
        let mem_a = box_memory(TenantScope::new("a", "c"));
        mem_a
            .add(MemoryEntry::new(Role::User, "secret blue"))
            .await
            .unwrap();

        let mem_b = box_memory(TenantScope::new("b", "c"));
        mem_b
            .add(MemoryEntry::new(Role::User, "secret red"))
            .await
            .unwrap();

        let hits = mem_a.search("secret", 10, None, None).await.unwrap();
        assert!(hits.iter().all(|h| h.record.metadata["userId"] == "a"));
    }

    #[tokio::test]
    async fn delete_by_filter_counts_removals() {
        let mem = box_memory(TenantScope::default());
        let mut tagged = Map::new();
        tagged.insert("source".into(), Value::String("doc1".into()));
        mem.upsert("1", "chunk one", tagged.clone()).await.unwrap();
        mem.upsert("2", "chunk two", tagged.clone()).await.unwrap();
        mem.upsert("3", "other", Map::new()).await.unwrap();

        let mut filter = Map::new();
        filter.insert("source".into(), Value::String("doc1".into()));
        let removed = mem.delete_by_filter(&filter).await.unwrap();
        assert_eq!(removed, 2);
        assert!(mem.get_by_id("3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn collections_lifecycle() {
        let mem = box_memory(TenantScope::default());
        assert!(!mem.collection_exists("extra").await.unwrap());
        mem.create_collection("extra").await.unwrap();
        assert!(mem.collection_exists("extra").await.unwrap());
        mem.delete_collection("extra").await.unwrap();
        assert!(!mem.collection_exists("extra").await.unwrap());
    }

    #[tokio::test]
    async fn min_score_filters_weak_hits() {
        let mem = box_memory(TenantScope::default());
        mem.upsert("1", "alpha", Map::new()).await.unwrap();
        let all = mem.search("alpha", 10, None, None).await.unwrap();
        assert!(!all.is_empty());
        let none = mem.search("alpha", 10, None, Some(1.1)).await.unwrap();
        assert!(none.is_empty());
    }
}
