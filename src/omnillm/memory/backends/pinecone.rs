//! Pinecone REST backend.
//!
//! The base URL is the index host; collections map onto namespaces within
//! the index (Pinecone indexes are provisioned out-of-band, so
//! `create_collection` is a no-op and `collection_exists` reports whether
//! the namespace holds vectors).  Text rides in metadata under `_text`.

use crate::omnillm::error::AiError;
use crate::omnillm::memory::backends::{send_json, VectorBackend};
use crate::omnillm::memory::vector::{SearchHit, SpaceType, VectorRecord};
use crate::omnillm::service::get_shared_http_client;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

/// Backend adapter for Pinecone.
pub struct PineconeBackend {
    base_url: String,
    api_key: Option<String>,
}

impl PineconeBackend {
    /// A backend for a Pinecone index host.
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        PineconeBackend {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder =
            get_shared_http_client().request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.header("Api-Key", key.clone());
        }
        builder
    }

    fn match_to_record(item: &Value) -> Option<VectorRecord> {
        let metadata_raw = item
            .get("metadata")
            .and_then(|m| m.as_object())
            .cloned()
            .unwrap_or_default();
        let text = metadata_raw
            .get("_text")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();
        let created_at = metadata_raw
            .get("_created_at")
            .and_then(|t| t.as_str())
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let metadata: Map<String, Value> = metadata_raw
            .into_iter()
            .filter(|(key, _)| !key.starts_with('_'))
            .collect();
        Some(VectorRecord {
            id: item.get("id")?.as_str()?.to_string(),
            text,
            metadata,
            embedding: item
                .get("values")
                .and_then(|v| v.as_array())
                .map(|values| {
                    values
                        .iter()
                        .filter_map(|f| f.as_f64())
                        .map(|f| f as f32)
                        .collect()
                })
                .unwrap_or_default(),
            created_at,
        })
    }

    fn filter_clause(filter: &Map<String, Value>) -> Option<Value> {
        if filter.is_empty() {
            return None;
        }
        let clauses: Map<String, Value> = filter
            .iter()
            .map(|(key, value)| (key.clone(), json!({ "$eq": value })))
            .collect();
        Some(Value::Object(clauses))
    }
}

#[async_trait::async_trait]
impl VectorBackend for PineconeBackend {
    fn name(&self) -> &str {
        "pinecone"
    }

    async fn upsert(&self, collection: &str, record: &VectorRecord) -> Result<(), AiError> {
        let mut metadata = record.metadata.clone();
        metadata.insert("_text".into(), Value::String(record.text.clone()));
        metadata.insert(
            "_created_at".into(),
            Value::String(record.created_at.to_rfc3339()),
        );
        let body = json!({
            "vectors": [{"id": record.id, "values": record.embedding, "metadata": metadata}],
            "namespace": collection,
        });
        send_json(
            self.request(reqwest::Method::POST, "/vectors/upsert").json(&body),
            "pinecone",
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), AiError> {
        let body = json!({"ids": [id], "namespace": collection});
        send_json(
            self.request(reqwest::Method::POST, "/vectors/delete").json(&body),
            "pinecone",
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
        let mut body = json!({
            "vector": embedding,
            "topK": top_k,
            "namespace": collection,
            "includeMetadata": true,
            "includeValues": true,
        });
        if let Some(clause) = Self::filter_clause(filter) {
            body["filter"] = clause;
        }
        let response = send_json(
            self.request(reqwest::Method::POST, "/query").json(&body),
            "pinecone",
        )
        .await?;
        Ok(response
            .get("matches")
            .and_then(|m| m.as_array())
            .map(|matches| {
                matches
                    .iter()
                    .filter_map(|item| {
                        Some(SearchHit {
                            score: item.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0)
                                as f32,
                            record: Self::match_to_record(item)?,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch(&self, collection: &str, id: &str) -> Result<Option<VectorRecord>, AiError> {
        let response = send_json(
            self.request(
                reqwest::Method::GET,
                &format!(
                    "/vectors/fetch?ids={}&namespace={}",
                    urlencoding::encode(id),
                    urlencoding::encode(collection)
                ),
            ),
            "pinecone",
        )
        .await?;
        Ok(response
            .get("vectors")
            .and_then(|v| v.get(id))
            .and_then(Self::match_to_record))
    }

    async fn list(
        &self,
        collection: &str,
        filter: &Map<String, Value>,
        limit: usize,
    ) -> Result<Vec<VectorRecord>, AiError> {
        // Pinecone has no scan-with-payload; approximate with a zero-vector
        // query, which ranks arbitrarily but returns payloads.
        let stats = send_json(
            self.request(reqwest::Method::POST, "/describe_index_stats").json(&json!({})),
            "pinecone",
        )
        .await?;
        let dimension = stats
            .get("dimension")
            .and_then(|d| d.as_u64())
            .unwrap_or(0) as usize;
        if dimension == 0 {
            return Ok(Vec::new());
        }
        let zero = vec![0.0f32; dimension];
        let hits = self.query(collection, &zero, limit, filter).await?;
        Ok(hits.into_iter().map(|h| h.record).collect())
    }

    async fn create_collection(
        &self,
        _name: &str,
        _dimensions: usize,
        _space: SpaceType,
    ) -> Result<(), AiError> {
        // Namespaces materialize on first upsert; index provisioning is
        // done through the Pinecone control plane, not this data-plane URL.
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool, AiError> {
        let stats = send_json(
            self.request(reqwest::Method::POST, "/describe_index_stats").json(&json!({})),
            "pinecone",
        )
        .await?;
        Ok(stats
            .get("namespaces")
            .and_then(|n| n.as_object())
            .map(|namespaces| namespaces.contains_key(name))
            .unwrap_or(false))
    }

    async fn delete_collection(&self, name: &str) -> Result<(), AiError> {
        let body = json!({"deleteAll": true, "namespace": name});
        send_json(
            self.request(reqwest::Method::POST, "/vectors/delete").json(&body),
            "pinecone",
        )
        .await?;
        Ok(())
    }
}
