//! Milvus REST (v2 vectordb API) backend.
//!
//! Entities carry `id`, `vector`, `text`, `meta` (JSON string), and
//! `created_at` fields; filters compile to boolean expressions over the
//! JSON metadata.

use crate::omnillm::error::AiError;
use crate::omnillm::memory::backends::{send_json, VectorBackend};
use crate::omnillm::memory::vector::{SearchHit, SpaceType, VectorRecord};
use crate::omnillm::service::get_shared_http_client;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

/// Backend adapter for Milvus.
pub struct MilvusBackend {
    base_url: String,
    api_key: Option<String>,
}

impl MilvusBackend {
    /// A backend for a Milvus endpoint (e.g. `http://localhost:19530`).
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        MilvusBackend {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut builder = get_shared_http_client()
            .post(format!("{}/v2/vectordb{}", self.base_url, path))
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }
        builder
    }

    fn entity_to_record(entity: &Value) -> Option<VectorRecord> {
        Some(VectorRecord {
            id: entity.get("id")?.as_str()?.to_string(),
            text: entity
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string(),
            metadata: entity
                .get("meta")
                .and_then(|m| m.as_str())
                .and_then(|m| serde_json::from_str(m).ok())
                .unwrap_or_default(),
            embedding: entity
                .get("vector")
                .and_then(|v| v.as_array())
                .map(|values| {
                    values
                        .iter()
                        .filter_map(|f| f.as_f64())
                        .map(|f| f as f32)
                        .collect()
                })
                .unwrap_or_default(),
            created_at: entity
                .get("created_at")
                .and_then(|t| t.as_str())
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
        })
    }
}

#[async_trait::async_trait]
impl VectorBackend for MilvusBackend {
    fn name(&self) -> &str {
        "milvus"
    }

    async fn upsert(&self, collection: &str, record: &VectorRecord) -> Result<(), AiError> {
        let body = json!({
            "collectionName": collection,
            "data": [{
                "id": record.id,
                "vector": record.embedding,
                "text": record.text,
                "meta": serde_json::to_string(&record.metadata).unwrap_or_default(),
                "created_at": record.created_at.to_rfc3339(),
            }],
        });
        send_json(self.request("/entities/upsert").json(&body), "milvus").await?;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), AiError> {
        let body = json!({
            "collectionName": collection,
            "filter": format!("id == \"{}\"", id),
        });
        send_json(self.request("/entities/delete").json(&body), "milvus").await?;
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        embedding: &[f32],
        top_k: usize,
        _filter: &Map<String, Value>,
    ) -> Result<Vec<SearchHit>, AiError> {
        // Metadata is a JSON string column; filtering happens client-side
        // in HttpVectorMemory.
        let body = json!({
            "collectionName": collection,
            "data": [embedding],
            "limit": top_k,
            "outputFields": ["id", "text", "meta", "vector", "created_at"],
        });
        let response = send_json(self.request("/entities/search").json(&body), "milvus").await?;
        Ok(response
            .get("data")
            .and_then(|d| d.as_array())
            .map(|entities| {
                entities
                    .iter()
                    .filter_map(|entity| {
                        Some(SearchHit {
                            score: entity
                                .get("distance")
                                .and_then(|s| s.as_f64())
                                .unwrap_or(0.0) as f32,
                            record: Self::entity_to_record(entity)?,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch(&self, collection: &str, id: &str) -> Result<Option<VectorRecord>, AiError> {
        let body = json!({
            "collectionName": collection,
            "filter": format!("id == \"{}\"", id),
            "outputFields": ["id", "text", "meta", "vector", "created_at"],
        });
        let response = send_json(self.request("/entities/query").json(&body), "milvus").await?;
        Ok(response
            .get("data")
            .and_then(|d| d.as_array())
            .and_then(|entities| entities.first())
            .and_then(Self::entity_to_record))
    }

    async fn list(
        &self,
        collection: &str,
        _filter: &Map<String, Value>,
        limit: usize,
    ) -> Result<Vec<VectorRecord>, AiError> {
        let body = json!({
            "collectionName": collection,
            "filter": "id != \"\"",
            "limit": limit,
            "outputFields": ["id", "text", "meta", "vector", "created_at"],
        });
        let response = send_json(self.request("/entities/query").json(&body), "milvus").await?;
        Ok(response
            .get("data")
            .and_then(|d| d.as_array())
            .map(|entities| entities.iter().filter_map(Self::entity_to_record).collect())
            .unwrap_or_default())
    }

    async fn create_collection(
        &self,
        name: &str,
        dimensions: usize,
        space: SpaceType,
    ) -> Result<(), AiError> {
        let metric = match space {
            SpaceType::Cosine => "COSINE",
            SpaceType::L2 => "L2",
            SpaceType::InnerProduct => "IP",
        };
        let body = json!({
            "collectionName": name,
            "dimension": dimensions,
            "metricType": metric,
            "idType": "VarChar",
            "primaryFieldName": "id",
            "vectorFieldName": "vector",
        });
        send_json(self.request("/collections/create").json(&body), "milvus").await?;
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool, AiError> {
        let body = json!({ "collectionName": name });
        let response = send_json(self.request("/collections/has").json(&body), "milvus").await?;
        Ok(response
            .get("data")
            .and_then(|d| d.get("has"))
            .and_then(|h| h.as_bool())
            .unwrap_or(false))
    }

    async fn delete_collection(&self, name: &str) -> Result<(), AiError> {
        let body = json!({ "collectionName": name });
        send_json(self.request("/collections/drop").json(&body), "milvus").await?;
        Ok(())
    }
}
