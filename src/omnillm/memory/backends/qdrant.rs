//! Qdrant REST backend.
//!
//! Points carry the text and metadata in their payload under `text` /
//! `meta`; filters translate to `must` match clauses on `meta.*` keys.

use crate::omnillm::error::AiError;
use crate::omnillm::memory::backends::{metadata_value, send_json, VectorBackend};
use crate::omnillm::memory::vector::{SearchHit, SpaceType, VectorRecord};
use crate::omnillm::service::get_shared_http_client;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

/// Backend adapter for Qdrant.
pub struct QdrantBackend {
    base_url: String,
    api_key: Option<String>,
}

impl QdrantBackend {
    /// A backend for a Qdrant endpoint (e.g. `http://localhost:6333`).
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        QdrantBackend {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = get_shared_http_client().request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.header("api-key", key.clone());
        }
        builder
    }

    fn filter_clause(filter: &Map<String, Value>) -> Value {
        let must: Vec<Value> = filter
            .iter()
            .map(|(key, value)| json!({"key": format!("meta.{}", key), "match": {"value": value}}))
            .collect();
        json!({ "must": must })
    }

    fn point_to_record(point: &Value) -> Option<VectorRecord> {
        let payload = point.get("payload")?;
        Some(VectorRecord {
            id: point.get("id").map(value_id_to_string)?,
            text: payload
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string(),
            metadata: payload
                .get("meta")
                .and_then(|m| m.as_object())
                .cloned()
                .unwrap_or_default(),
            embedding: point
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
            created_at: payload
                .get("created_at")
                .and_then(|t| t.as_str())
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
        })
    }
}

/// Qdrant point IDs may be numeric or UUID strings.
fn value_id_to_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait::async_trait]
impl VectorBackend for QdrantBackend {
    fn name(&self) -> &str {
        "qdrant"
    }

    async fn upsert(&self, collection: &str, record: &VectorRecord) -> Result<(), AiError> {
        let body = json!({"points": [{
            "id": record.id,
            "vector": record.embedding,
            "payload": {
                "text": record.text,
                "meta": metadata_value(record),
                "created_at": record.created_at.to_rfc3339(),
            },
        }]});
        send_json(
            self.request(
                reqwest::Method::PUT,
                &format!("/collections/{}/points?wait=true", collection),
            )
            .json(&body),
            "qdrant",
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), AiError> {
        let body = json!({"points": [id]});
        send_json(
            self.request(
                reqwest::Method::POST,
                &format!("/collections/{}/points/delete?wait=true", collection),
            )
            .json(&body),
            "qdrant",
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
            "limit": top_k,
            "with_payload": true,
            "with_vector": true,
        });
        if !filter.is_empty() {
            body["filter"] = Self::filter_clause(filter);
        }
        let response = send_json(
            self.request(
                reqwest::Method::POST,
                &format!("/collections/{}/points/search", collection),
            )
            .json(&body),
            "qdrant",
        )
        .await?;
        Ok(response
            .get("result")
            .and_then(|r| r.as_array())
            .map(|hits| {
                hits.iter()
                    .filter_map(|hit| {
                        Some(SearchHit {
                            score: hit.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0) as f32,
                            record: Self::point_to_record(hit)?,
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
                &format!("/collections/{}/points/{}", collection, id),
            ),
            "qdrant",
        )
        .await;
        match response {
            Ok(value) => Ok(value.get("result").and_then(Self::point_to_record)),
            Err(AiError::Provider { status: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list(
        &self,
        collection: &str,
        filter: &Map<String, Value>,
        limit: usize,
    ) -> Result<Vec<VectorRecord>, AiError> {
        let mut body = json!({
            "limit": limit,
            "with_payload": true,
            "with_vector": true,
        });
        if !filter.is_empty() {
            body["filter"] = Self::filter_clause(filter);
        }
        let response = send_json(
            self.request(
                reqwest::Method::POST,
                &format!("/collections/{}/points/scroll", collection),
            )
            .json(&body),
            "qdrant",
        )
        .await?;
        Ok(response
            .get("result")
            .and_then(|r| r.get("points"))
            .and_then(|p| p.as_array())
            .map(|points| points.iter().filter_map(Self::point_to_record).collect())
            .unwrap_or_default())
    }

    async fn create_collection(
        &self,
        name: &str,
        dimensions: usize,
        space: SpaceType,
    ) -> Result<(), AiError> {
        let distance = match space {
            SpaceType::Cosine => "Cosine",
            SpaceType::L2 => "Euclid",
            SpaceType::InnerProduct => "Dot",
        };
        let body = json!({"vectors": {"size": dimensions, "distance": distance}});
        send_json(
            self.request(reqwest::Method::PUT, &format!("/collections/{}", name)).json(&body),
            "qdrant",
        )
        .await?;
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool, AiError> {
        match send_json(
            self.request(reqwest::Method::GET, &format!("/collections/{}", name)),
            "qdrant",
        )
        .await
        {
            Ok(_) => Ok(true),
            Err(AiError::Provider { status: 404, .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn delete_collection(&self, name: &str) -> Result<(), AiError> {
        send_json(
            self.request(reqwest::Method::DELETE, &format!("/collections/{}", name)),
            "qdrant",
        )
        .await?;
        Ok(())
    }
}
