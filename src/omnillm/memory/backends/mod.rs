//! HTTP-backed vector stores.
//!
//! Each backend file maps the [`VectorBackend`] seam onto one store's REST
//! API (ChromaDB, Qdrant, Pinecone, Weaviate, Milvus, OpenSearch,
//! TypeSense); [`HttpVectorMemory`] implements the full
//! [`Memory`]/[`VectorMemory`] contract once on top of that seam, so a new
//! backend is its file plus a [`http_vector_memory`] registry entry.
//!
//! Tenant isolation is enforced twice: the scope keys are merged into the
//! backend-side filter where the store supports filtering, and results are
//! re-filtered client-side so a backend with weaker filter semantics still
//! cannot leak entries.

pub mod chroma;
pub mod milvus;
pub mod opensearch;
pub mod pinecone;
pub mod qdrant;
pub mod typesense;
pub mod weaviate;

use crate::omnillm::error::AiError;
use crate::omnillm::memory::vector::{
    filter_matches, record_to_entry, Embedder, SearchHit, SpaceType, VectorMemory, VectorRecord,
};
use crate::omnillm::memory::{Memory, MemoryConfig, MemoryEntry, TenantScope};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::RwLock;

/// REST mapping for one vector store.
///
/// Implementations translate these operations to the store's wire API and
/// nothing else; scoping, embedding, and entry conversion live in
/// [`HttpVectorMemory`].
#[async_trait::async_trait]
pub trait VectorBackend: Send + Sync {
    /// Backend name (`"chroma"`, `"qdrant"`, ...).
    fn name(&self) -> &str;

    /// Insert-or-replace one record.
    async fn upsert(&self, collection: &str, record: &VectorRecord) -> Result<(), AiError>;

    /// Remove a record by ID.
    async fn delete(&self, collection: &str, id: &str) -> Result<(), AiError>;

    /// Nearest-neighbor query.  `filter` keys must match record metadata.
    async fn query(
        &self,
        collection: &str,
        embedding: &[f32],
        top_k: usize,
        filter: &Map<String, Value>,
    ) -> Result<Vec<SearchHit>, AiError>;

    /// Fetch one record by ID.
    async fn fetch(&self, collection: &str, id: &str) -> Result<Option<VectorRecord>, AiError>;

    /// List up to `limit` records matching `filter`, oldest first where the
    /// store exposes ordering.
    async fn list(
        &self,
        collection: &str,
        filter: &Map<String, Value>,
        limit: usize,
    ) -> Result<Vec<VectorRecord>, AiError>;

    /// Create a collection/index for vectors of the given dimension.
    async fn create_collection(
        &self,
        name: &str,
        dimensions: usize,
        space: SpaceType,
    ) -> Result<(), AiError>;

    /// True when the collection exists.
    async fn collection_exists(&self, name: &str) -> Result<bool, AiError>;

    /// Drop a collection and its records.
    async fn delete_collection(&self, name: &str) -> Result<(), AiError>;
}

/// Ceiling on records pulled for `get_all`/filtered deletes against HTTP
/// stores.
const LIST_LIMIT: usize = 10_000;

/// The [`Memory`]/[`VectorMemory`] contract over a [`VectorBackend`].
pub struct HttpVectorMemory {
    backend: Arc<dyn VectorBackend>,
    collection: String,
    embedder: Arc<Embedder>,
    space: SpaceType,
    scope: TenantScope,
    metadata: RwLock<Map<String, Value>>,
}

impl std::fmt::Debug for HttpVectorMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpVectorMemory")
            .field("collection", &self.collection)
            .field("space", &self.space)
            .finish_non_exhaustive()
    }
}

impl HttpVectorMemory {
    /// Wrap a backend with scoping and embedding.
    pub fn new(
        backend: Arc<dyn VectorBackend>,
        collection: String,
        embedder: Arc<Embedder>,
        space: SpaceType,
        scope: TenantScope,
    ) -> Self {
        HttpVectorMemory {
            backend,
            collection,
            embedder,
            space,
            scope,
            metadata: RwLock::new(Map::new()),
        }
    }

    fn scoped_filter(&self, filter: Option<&Map<String, Value>>) -> Map<String, Value> {
        let mut combined = filter.cloned().unwrap_or_default();
        self.scope.stamp(&mut combined);
        combined
    }
}

#[async_trait::async_trait]
impl Memory for HttpVectorMemory {
    fn kind(&self) -> &str {
        self.backend.name()
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
        let filter = self.scoped_filter(None);
        let mut records = self
            .backend
            .list(&self.collection, &filter, LIST_LIMIT)
            .await?;
        records.retain(|r| self.scope.matches(&r.metadata));
        records.sort_by_key(|r| r.created_at);
        Ok(records.into_iter().map(record_to_entry).collect())
    }

    async fn clear(&self) -> Result<(), AiError> {
        // delete_by_filter stamps the tenant scope itself.
        self.delete_by_filter(&Map::new()).await?;
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
impl VectorMemory for HttpVectorMemory {
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
        if !self.backend.collection_exists(&self.collection).await? {
            self.backend
                .create_collection(&self.collection, embedding.len(), self.space)
                .await?;
        }
        let record = VectorRecord {
            id: id.to_string(),
            text: text.to_string(),
            metadata,
            embedding,
            created_at: chrono::Utc::now(),
        };
        self.backend.upsert(&self.collection, &record).await
    }

    async fn delete(&self, id: &str) -> Result<(), AiError> {
        self.backend.delete(&self.collection, id).await
    }

    async fn delete_by_filter(&self, filter: &Map<String, Value>) -> Result<u64, AiError> {
        let combined = self.scoped_filter(Some(filter));
        let records = self
            .backend
            .list(&self.collection, &combined, LIST_LIMIT)
            .await?;
        let mut removed = 0u64;
        for record in records {
            if filter_matches(&combined, &record.metadata) {
                self.backend.delete(&self.collection, &record.id).await?;
                removed += 1;
            }
        }
        Ok(removed)
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
        let mut hits = self
            .backend
            .query(&self.collection, embedding, top_k, &combined)
            .await?;
        // Backend filters vary in strength; re-check client-side.
        hits.retain(|h| filter_matches(&combined, &h.record.metadata));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<VectorRecord>, AiError> {
        self.backend.fetch(&self.collection, id).await
    }

    async fn create_collection(&self, name: &str) -> Result<(), AiError> {
        // Dimension is unknown before the first embedding; probe with one.
        let probe = self.embedder.embed_one("dimension probe").await?;
        self.backend
            .create_collection(name, probe.len(), self.space)
            .await
    }

    async fn collection_exists(&self, name: &str) -> Result<bool, AiError> {
        self.backend.collection_exists(name).await
    }

    async fn delete_collection(&self, name: &str) -> Result<(), AiError> {
        self.backend.delete_collection(name).await
    }
}

/// Build the HTTP vector memory for a backend kind.
pub fn http_vector_memory(kind: &str, config: &MemoryConfig) -> Result<HttpVectorMemory, AiError> {
    let base_url = config.base_url.clone().ok_or_else(|| {
        AiError::ConfigMissing(format!("{} memory requires config.base_url", kind))
    })?;
    let api_key = config.api_key.clone();
    let backend: Arc<dyn VectorBackend> = match kind {
        "chroma" => Arc::new(chroma::ChromaBackend::new(base_url, api_key)),
        "qdrant" => Arc::new(qdrant::QdrantBackend::new(base_url, api_key)),
        "pinecone" => Arc::new(pinecone::PineconeBackend::new(base_url, api_key)),
        "weaviate" => Arc::new(weaviate::WeaviateBackend::new(base_url, api_key)),
        "milvus" => Arc::new(milvus::MilvusBackend::new(base_url, api_key)),
        "opensearch" => Arc::new(opensearch::OpenSearchBackend::new(base_url, api_key)),
        "typesense" => Arc::new(typesense::TypesenseBackend::new(base_url, api_key)),
        other => {
            return Err(AiError::InvalidArgument(format!(
                "unknown vector backend '{}'",
                other
            )))
        }
    };
    Ok(HttpVectorMemory::new(
        backend,
        config.collection_name(),
        config.build_embedder()?,
        config.space_type,
        config.scope.clone(),
    ))
}

/// Shared helper: send a JSON request and decode the JSON response,
/// classifying HTTP failures through the provider error taxonomy.
pub(crate) async fn send_json(
    builder: reqwest::RequestBuilder,
    backend: &str,
) -> Result<Value, AiError> {
    let response = builder
        .send()
        .await
        .map_err(|e| AiError::Protocol(format!("{} request failed: {}", backend, e)))?;
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| AiError::Protocol(format!("{} response read failed: {}", backend, e)))?;
    if !status.is_success() {
        return Err(AiError::Provider {
            status: status.as_u16(),
            message: format!("{}: {}", backend, text),
        });
    }
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text)
        .map_err(|e| AiError::Protocol(format!("{} returned non-JSON body: {}", backend, e)))
}

/// Shared helper: metadata map → flat JSON object for stores that persist
/// payloads verbatim.
pub(crate) fn metadata_value(record: &VectorRecord) -> Value {
    Value::Object(record.metadata.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_requires_base_url() {
        let err = http_vector_memory("qdrant", &MemoryConfig::default()).unwrap_err();
        assert!(matches!(err, AiError::ConfigMissing(_)));
    }
}
