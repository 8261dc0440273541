//! TypeSense backend.
//!
//! Documents carry `text`, `embedding`, `meta` (JSON string), and
//! `created_at`; search uses `vector_query` through `multi_search`.

use crate::omnillm::error::AiError;
use crate::omnillm::memory::backends::{send_json, VectorBackend};
use crate::omnillm::memory::vector::{SearchHit, SpaceType, VectorRecord};
use crate::omnillm::service::get_shared_http_client;
use chrono::{TimeZone, Utc};
use serde_json::{json, Map, Value};

/// Backend adapter for TypeSense.
pub struct TypesenseBackend {
    base_url: String,
    api_key: Option<String>,
}

impl TypesenseBackend {
    /// A backend for a TypeSense endpoint (e.g. `http://localhost:8108`).
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        TypesenseBackend {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder =
            get_shared_http_client().request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.header("X-TYPESENSE-API-KEY", key.clone());
        }
        builder
    }

    fn doc_to_record(document: &Value) -> Option<VectorRecord> {
        Some(VectorRecord {
            id: document.get("id")?.as_str()?.to_string(),
            text: document
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string(),
            metadata: document
                .get("meta")
                .and_then(|m| m.as_str())
                .and_then(|m| serde_json::from_str(m).ok())
                .unwrap_or_default(),
            embedding: document
                .get("embedding")
                .and_then(|v| v.as_array())
                .map(|values| {
                    values
                        .iter()
                        .filter_map(|f| f.as_f64())
                        .map(|f| f as f32)
                        .collect()
                })
                .unwrap_or_default(),
            created_at: document
                .get("created_at")
                .and_then(|t| t.as_i64())
                .and_then(|t| Utc.timestamp_opt(t, 0).single())
                .unwrap_or_else(Utc::now),
        })
    }
}

#[async_trait::async_trait]
impl VectorBackend for TypesenseBackend {
    fn name(&self) -> &str {
        "typesense"
    }

    async fn upsert(&self, collection: &str, record: &VectorRecord) -> Result<(), AiError> {
        let body = json!({
            "id": record.id,
            "text": record.text,
            "meta": serde_json::to_string(&record.metadata).unwrap_or_default(),
            "embedding": record.embedding,
            "created_at": record.created_at.timestamp(),
        });
        send_json(
            self.request(
                reqwest::Method::POST,
                &format!("/collections/{}/documents?action=upsert", collection),
            )
            .json(&body),
            "typesense",
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), AiError> {
        match send_json(
            self.request(
                reqwest::Method::DELETE,
                &format!("/collections/{}/documents/{}", collection, id),
            ),
            "typesense",
        )
        .await
        {
            Ok(_) => Ok(()),
            Err(AiError::Provider { status: 404, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn query(
        &self,
        collection: &str,
        embedding: &[f32],
        top_k: usize,
        _filter: &Map<String, Value>,
    ) -> Result<Vec<SearchHit>, AiError> {
        // Metadata is a JSON string field here; HttpVectorMemory filters
        // client-side.
        let vector = embedding
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let body = json!({"searches": [{
            "collection": collection,
            "q": "*",
            "vector_query": format!("embedding:([{}], k:{})", vector, top_k),
            "per_page": top_k,
        }]});
        let response = send_json(
            self.request(reqwest::Method::POST, "/multi_search").json(&body),
            "typesense",
        )
        .await?;
        Ok(response
            .get("results")
            .and_then(|r| r.get(0))
            .and_then(|r| r.get("hits"))
            .and_then(|h| h.as_array())
            .map(|hits| {
                hits.iter()
                    .filter_map(|hit| {
                        let document = hit.get("document")?;
                        let distance = hit
                            .get("vector_distance")
                            .and_then(|d| d.as_f64())
                            .unwrap_or(0.0) as f32;
                        Some(SearchHit {
                            // TypeSense reports cosine distance.
                            score: 1.0 - distance,
                            record: Self::doc_to_record(document)?,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch(&self, collection: &str, id: &str) -> Result<Option<VectorRecord>, AiError> {
        match send_json(
            self.request(
                reqwest::Method::GET,
                &format!("/collections/{}/documents/{}", collection, id),
            ),
            "typesense",
        )
        .await
        {
            Ok(document) => Ok(Self::doc_to_record(&document)),
            Err(AiError::Provider { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list(
        &self,
        collection: &str,
        _filter: &Map<String, Value>,
        limit: usize,
    ) -> Result<Vec<VectorRecord>, AiError> {
        let response = send_json(
            self.request(
                reqwest::Method::GET,
                &format!(
                    "/collections/{}/documents/search?q=*&query_by=text&per_page={}",
                    collection,
                    limit.min(250)
                ),
            ),
            "typesense",
        )
        .await?;
        Ok(response
            .get("hits")
            .and_then(|h| h.as_array())
            .map(|hits| {
                hits.iter()
                    .filter_map(|hit| hit.get("document"))
                    .filter_map(Self::doc_to_record)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_collection(
        &self,
        name: &str,
        dimensions: usize,
        _space: SpaceType,
    ) -> Result<(), AiError> {
        // TypeSense vector search is cosine-only.
        let body = json!({
            "name": name,
            "fields": [
                {"name": "text", "type": "string"},
                {"name": "meta", "type": "string"},
                {"name": "embedding", "type": "float[]", "num_dim": dimensions},
                {"name": "created_at", "type": "int64"},
            ],
        });
        match send_json(
            self.request(reqwest::Method::POST, "/collections").json(&body),
            "typesense",
        )
        .await
        {
            Ok(_) => Ok(()),
            Err(AiError::Provider { status: 409, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn collection_exists(&self, name: &str) -> Result<bool, AiError> {
        match send_json(
            self.request(reqwest::Method::GET, &format!("/collections/{}", name)),
            "typesense",
        )
        .await
        {
            Ok(_) => Ok(true),
            Err(AiError::Provider { status: 404, .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn delete_collection(&self, name: &str) -> Result<(), AiError> {
        match send_json(
            self.request(reqwest::Method::DELETE, &format!("/collections/{}", name)),
            "typesense",
        )
        .await
        {
            Ok(_) => Ok(()),
            Err(AiError::Provider { status: 404, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
