//! ChromaDB REST backend.
//!
//! Chroma addresses collections by UUID; the adapter resolves names
//! through `GET /api/v1/collections/{name}` and caches the mapping.
//! Record metadata rides in `metadatas`, text in `documents`.

use crate::omnillm::error::AiError;
use crate::omnillm::memory::backends::{send_json, VectorBackend};
use crate::omnillm::memory::vector::{SearchHit, SpaceType, VectorRecord};
use crate::omnillm::service::get_shared_http_client;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Backend adapter for ChromaDB.
pub struct ChromaBackend {
    base_url: String,
    api_key: Option<String>,
    collection_ids: RwLock<HashMap<String, String>>,
}

impl ChromaBackend {
    /// A backend for a Chroma endpoint (e.g. `http://localhost:8000`).
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        ChromaBackend {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            collection_ids: RwLock::new(HashMap::new()),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder =
            get_shared_http_client().request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }
        builder
    }

    async fn collection_id(&self, name: &str) -> Result<String, AiError> {
        if let Some(id) = self.collection_ids.read().await.get(name) {
            return Ok(id.clone());
        }
        let response = send_json(
            self.request(
                reqwest::Method::GET,
                &format!("/api/v1/collections/{}", name),
            ),
            "chroma",
        )
        .await?;
        let id = response
            .get("id")
            .and_then(|i| i.as_str())
            .ok_or_else(|| AiError::Protocol("chroma collection response missing id".into()))?
            .to_string();
        self.collection_ids
            .write()
            .await
            .insert(name.to_string(), id.clone());
        Ok(id)
    }

    fn rows_to_records(response: &Value) -> Vec<VectorRecord> {
        let ids = response.get("ids").and_then(|i| i.as_array());
        let documents = response.get("documents").and_then(|d| d.as_array());
        let metadatas = response.get("metadatas").and_then(|m| m.as_array());
        let embeddings = response.get("embeddings").and_then(|e| e.as_array());
        let ids = match ids {
            Some(ids) => ids,
            None => return Vec::new(),
        };
        ids.iter()
            .enumerate()
            .filter_map(|(i, id)| {
                let metadata = metadatas
                    .and_then(|m| m.get(i))
                    .and_then(|m| m.as_object())
                    .cloned()
                    .unwrap_or_default();
                Some(VectorRecord {
                    id: id.as_str()?.to_string(),
                    text: documents
                        .and_then(|d| d.get(i))
                        .and_then(|d| d.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    created_at: metadata
                        .get("created_at")
                        .and_then(|t| t.as_str())
                        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(Utc::now),
                    embedding: embeddings
                        .and_then(|e| e.get(i))
                        .and_then(|e| e.as_array())
                        .map(|values| {
                            values
                                .iter()
                                .filter_map(|f| f.as_f64())
                                .map(|f| f as f32)
                                .collect()
                        })
                        .unwrap_or_default(),
                    metadata,
                })
            })
            .collect()
    }

    fn where_clause(filter: &Map<String, Value>) -> Option<Value> {
        if filter.is_empty() {
            return None;
        }
        if filter.len() == 1 {
            let (key, value) = filter.iter().next().unwrap();
            return Some(json!({ key: value }));
        }
        let clauses: Vec<Value> = filter.iter().map(|(k, v)| json!({ k: v })).collect();
        Some(json!({ "$and": clauses }))
    }
}

#[async_trait::async_trait]
impl VectorBackend for ChromaBackend {
    fn name(&self) -> &str {
        "chroma"
    }

    async fn upsert(&self, collection: &str, record: &VectorRecord) -> Result<(), AiError> {
        let id = self.collection_id(collection).await?;
        let mut metadata = record.metadata.clone();
        metadata.insert(
            "created_at".into(),
            Value::String(record.created_at.to_rfc3339()),
        );
        let body = json!({
            "ids": [record.id],
            "embeddings": [record.embedding],
            "documents": [record.text],
            "metadatas": [metadata],
        });
        send_json(
            self.request(
                reqwest::Method::POST,
                &format!("/api/v1/collections/{}/upsert", id),
            )
            .json(&body),
            "chroma",
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), AiError> {
        let collection_id = self.collection_id(collection).await?;
        send_json(
            self.request(
                reqwest::Method::POST,
                &format!("/api/v1/collections/{}/delete", collection_id),
            )
            .json(&json!({"ids": [id]})),
            "chroma",
        )
        .await?;
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        embedding: &[f32],
        top_k: usize,
        filter: &Map<String, Value>,
    ) -> Result<Vec<SearchHit>, AiError> {
        let id = self.collection_id(collection).await?;
        let mut body = json!({
            "query_embeddings": [embedding],
            "n_results": top_k,
            "include": ["documents", "metadatas", "embeddings", "distances"],
        });
        if let Some(where_clause) = Self::where_clause(filter) {
            body["where"] = where_clause;
        }
        let response = send_json(
            self.request(
                reqwest::Method::POST,
                &format!("/api/v1/collections/{}/query", id),
            )
            .json(&body),
            "chroma",
        )
        .await?;

        // Query responses nest per-query arrays one level deeper.
        let flattened = json!({
            "ids": response.get("ids").and_then(|v| v.get(0)).cloned().unwrap_or(Value::Null),
            "documents": response.get("documents").and_then(|v| v.get(0)).cloned().unwrap_or(Value::Null),
            "metadatas": response.get("metadatas").and_then(|v| v.get(0)).cloned().unwrap_or(Value::Null),
            "embeddings": response.get("embeddings").and_then(|v| v.get(0)).cloned().unwrap_or(Value::Null),
        });
        let distances: Vec<f32> = response
            .get("distances")
            .and_then(|v| v.get(0))
            .and_then(|d| d.as_array())
            .map(|values| {
                values
                    .iter()
                    .filter_map(|f| f.as_f64())
                    .map(|f| f as f32)
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self::rows_to_records(&flattened)
            .into_iter()
            .enumerate()
            .map(|(i, record)| SearchHit {
                // Chroma reports distance; flip to a similarity-style score.
                score: 1.0 - distances.get(i).copied().unwrap_or(0.0),
                record,
            })
            .collect())
    }

    async fn fetch(&self, collection: &str, id: &str) -> Result<Option<VectorRecord>, AiError> {
        let collection_id = self.collection_id(collection).await?;
        let response = send_json(
            self.request(
                reqwest::Method::POST,
                &format!("/api/v1/collections/{}/get", collection_id),
            )
            .json(&json!({"ids": [id], "include": ["documents", "metadatas", "embeddings"]})),
            "chroma",
        )
        .await?;
        Ok(Self::rows_to_records(&response).into_iter().next())
    }

    async fn list(
        &self,
        collection: &str,
        filter: &Map<String, Value>,
        limit: usize,
    ) -> Result<Vec<VectorRecord>, AiError> {
        let collection_id = self.collection_id(collection).await?;
        let mut body = json!({
            "limit": limit,
            "include": ["documents", "metadatas", "embeddings"],
        });
        if let Some(where_clause) = Self::where_clause(filter) {
            body["where"] = where_clause;
        }
        let response = send_json(
            self.request(
                reqwest::Method::POST,
                &format!("/api/v1/collections/{}/get", collection_id),
            )
            .json(&body),
            "chroma",
        )
        .await?;
        Ok(Self::rows_to_records(&response))
    }

    async fn create_collection(
        &self,
        name: &str,
        _dimensions: usize,
        space: SpaceType,
    ) -> Result<(), AiError> {
        let space_name = match space {
            SpaceType::Cosine => "cosine",
            SpaceType::L2 => "l2",
            SpaceType::InnerProduct => "ip",
        };
        let body = json!({
            "name": name,
            "metadata": {"hnsw:space": space_name},
            "get_or_create": true,
        });
        let response = send_json(
            self.request(reqwest::Method::POST, "/api/v1/collections").json(&body),
            "chroma",
        )
        .await?;
        if let Some(id) = response.get("id").and_then(|i| i.as_str()) {
            self.collection_ids
                .write()
                .await
                .insert(name.to_string(), id.to_string());
        }
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool, AiError> {
        match self.collection_id(name).await {
            Ok(_) => Ok(true),
            Err(AiError::Provider { status: 404, .. }) | Err(AiError::Provider { status: 500, .. }) => {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn delete_collection(&self, name: &str) -> Result<(), AiError> {
        send_json(
            self.request(
                reqwest::Method::DELETE,
                &format!("/api/v1/collections/{}", name),
            ),
            "chroma",
        )
        .await?;
        self.collection_ids.write().await.remove(name);
        Ok(())
    }
}
