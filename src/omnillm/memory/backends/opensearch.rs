//! OpenSearch k-NN backend.
//!
//! Collections map to indices with a `knn_vector` field; metadata keys are
//! flattened into documents so term filters work server-side.

use crate::omnillm::error::AiError;
use crate::omnillm::memory::backends::{send_json, VectorBackend};
use crate::omnillm::memory::vector::{SearchHit, SpaceType, VectorRecord};
use crate::omnillm::service::get_shared_http_client;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

/// Backend adapter for OpenSearch.
pub struct OpenSearchBackend {
    base_url: String,
    api_key: Option<String>,
}

impl OpenSearchBackend {
    /// A backend for an OpenSearch endpoint (e.g. `http://localhost:9200`).
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        OpenSearchBackend {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder =
            get_shared_http_client().request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Basic {}", key));
        }
        builder
    }

    fn doc_to_record(id: &str, source: &Value) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            text: source
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string(),
            metadata: source
                .get("meta")
                .and_then(|m| m.as_object())
                .cloned()
                .unwrap_or_default(),
            embedding: source
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
            created_at: source
                .get("created_at")
                .and_then(|t| t.as_str())
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
        }
    }

    fn term_filters(filter: &Map<String, Value>) -> Vec<Value> {
        filter
            .iter()
            .map(|(key, value)| json!({"term": {format!("meta.{}.keyword", key): value}}))
            .collect()
    }

    fn hits_to_records(response: &Value) -> Vec<(VectorRecord, f32)> {
        response
            .get("hits")
            .and_then(|h| h.get("hits"))
            .and_then(|h| h.as_array())
            .map(|hits| {
                hits.iter()
                    .filter_map(|hit| {
                        let id = hit.get("_id")?.as_str()?;
                        let source = hit.get("_source")?;
                        let score = hit.get("_score").and_then(|s| s.as_f64()).unwrap_or(0.0);
                        Some((Self::doc_to_record(id, source), score as f32))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl VectorBackend for OpenSearchBackend {
    fn name(&self) -> &str {
        "opensearch"
    }

    async fn upsert(&self, collection: &str, record: &VectorRecord) -> Result<(), AiError> {
        let body = json!({
            "text": record.text,
            "meta": record.metadata,
            "embedding": record.embedding,
            "created_at": record.created_at.to_rfc3339(),
        });
        send_json(
            self.request(
                reqwest::Method::PUT,
                &format!("/{}/_doc/{}?refresh=true", collection, record.id),
            )
            .json(&body),
            "opensearch",
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), AiError> {
        match send_json(
            self.request(
                reqwest::Method::DELETE,
                &format!("/{}/_doc/{}?refresh=true", collection, id),
            ),
            "opensearch",
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
        filter: &Map<String, Value>,
    ) -> Result<Vec<SearchHit>, AiError> {
        let knn = json!({"knn": {"embedding": {"vector": embedding, "k": top_k}}});
        let query = if filter.is_empty() {
            knn
        } else {
            json!({"bool": {"must": [knn], "filter": Self::term_filters(filter)}})
        };
        let body = json!({"size": top_k, "query": query});
        let response = send_json(
            self.request(reqwest::Method::POST, &format!("/{}/_search", collection)).json(&body),
            "opensearch",
        )
        .await?;
        Ok(Self::hits_to_records(&response)
            .into_iter()
            .map(|(record, score)| SearchHit { record, score })
            .collect())
    }

    async fn fetch(&self, collection: &str, id: &str) -> Result<Option<VectorRecord>, AiError> {
        match send_json(
            self.request(reqwest::Method::GET, &format!("/{}/_doc/{}", collection, id)),
            "opensearch",
        )
        .await
        {
            Ok(doc) => Ok(doc
                .get("_source")
                .map(|source| Self::doc_to_record(id, source))),
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
        let query = if filter.is_empty() {
            json!({"match_all": {}})
        } else {
            json!({"bool": {"filter": Self::term_filters(filter)}})
        };
        let body = json!({"size": limit, "query": query});
        let response = send_json(
            self.request(reqwest::Method::POST, &format!("/{}/_search", collection)).json(&body),
            "opensearch",
        )
        .await?;
        Ok(Self::hits_to_records(&response)
            .into_iter()
            .map(|(record, _)| record)
            .collect())
    }

    async fn create_collection(
        &self,
        name: &str,
        dimensions: usize,
        space: SpaceType,
    ) -> Result<(), AiError> {
        let space_type = match space {
            SpaceType::Cosine => "cosinesimil",
            SpaceType::L2 => "l2",
            SpaceType::InnerProduct => "innerproduct",
        };
        let body = json!({
            "settings": {"index": {"knn": true}},
            "mappings": {"properties": {
                "embedding": {
                    "type": "knn_vector",
                    "dimension": dimensions,
                    "method": {"name": "hnsw", "space_type": space_type, "engine": "lucene"},
                },
                "text": {"type": "text"},
                "created_at": {"type": "date"},
            }},
        });
        match send_json(
            self.request(reqwest::Method::PUT, &format!("/{}", name)).json(&body),
            "opensearch",
        )
        .await
        {
            Ok(_) => Ok(()),
            // resource_already_exists_exception
            Err(AiError::Provider { status: 400, message }) if message.contains("exists") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn collection_exists(&self, name: &str) -> Result<bool, AiError> {
        let response = self
            .request(reqwest::Method::HEAD, &format!("/{}", name))
            .send()
            .await
            .map_err(|e| AiError::Protocol(format!("opensearch request failed: {}", e)))?;
        Ok(response.status().is_success())
    }

    async fn delete_collection(&self, name: &str) -> Result<(), AiError> {
        match send_json(
            self.request(reqwest::Method::DELETE, &format!("/{}", name)),
            "opensearch",
        )
        .await
        {
            Ok(_) => Ok(()),
            Err(AiError::Provider { status: 404, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
