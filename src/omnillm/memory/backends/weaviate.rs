//! Weaviate REST backend.
//!
//! Objects live in a class per collection (name capitalized to satisfy
//! Weaviate's schema rules) with `text` and `meta` properties; queries go
//! through GraphQL `nearVector`.

use crate::omnillm::error::AiError;
use crate::omnillm::memory::backends::{send_json, VectorBackend};
use crate::omnillm::memory::vector::{SearchHit, SpaceType, VectorRecord};
use crate::omnillm::service::get_shared_http_client;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

/// Backend adapter for Weaviate.
pub struct WeaviateBackend {
    base_url: String,
    api_key: Option<String>,
}

impl WeaviateBackend {
    /// A backend for a Weaviate endpoint (e.g. `http://localhost:8080`).
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        WeaviateBackend {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
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

    /// Weaviate class names must start uppercase.
    fn class_name(collection: &str) -> String {
        let mut chars = collection.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
            None => "Omnillm".to_string(),
        }
    }

    fn object_to_record(object: &Value) -> Option<VectorRecord> {
        let properties = object.get("properties")?;
        let metadata: Map<String, Value> = properties
            .get("meta")
            .and_then(|m| m.as_str())
            .and_then(|m| serde_json::from_str(m).ok())
            .unwrap_or_default();
        Some(VectorRecord {
            id: object.get("id")?.as_str()?.to_string(),
            text: properties
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string(),
            created_at: properties
                .get("createdAt")
                .and_then(|t| t.as_str())
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
            embedding: object
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
            metadata,
        })
    }
}

#[async_trait::async_trait]
impl VectorBackend for WeaviateBackend {
    fn name(&self) -> &str {
        "weaviate"
    }

    async fn upsert(&self, collection: &str, record: &VectorRecord) -> Result<(), AiError> {
        let class = Self::class_name(collection);
        let body = json!({
            "class": class,
            "id": record.id,
            "vector": record.embedding,
            "properties": {
                "text": record.text,
                "meta": serde_json::to_string(&record.metadata).unwrap_or_default(),
                "createdAt": record.created_at.to_rfc3339(),
            },
        });
        match send_json(
            self.request(reqwest::Method::POST, "/v1/objects").json(&body),
            "weaviate",
        )
        .await
        {
            Ok(_) => Ok(()),
            // Duplicate ID: replace the existing object.
            Err(AiError::Provider { status: 422, .. }) => {
                send_json(
                    self.request(
                        reqwest::Method::PUT,
                        &format!("/v1/objects/{}/{}", class, record.id),
                    )
                    .json(&body),
                    "weaviate",
                )
                .await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), AiError> {
        let class = Self::class_name(collection);
        match send_json(
            self.request(
                reqwest::Method::DELETE,
                &format!("/v1/objects/{}/{}", class, id),
            ),
            "weaviate",
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
        // Filtering happens client-side in HttpVectorMemory: the metadata
        // is one serialized property here, invisible to `where` clauses.
        let class = Self::class_name(collection);
        let vector = embedding
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let graphql = format!(
            "{{ Get {{ {} (nearVector: {{vector: [{}]}}, limit: {}) \
             {{ text meta createdAt _additional {{ id vector certainty }} }} }} }}",
            class, vector, top_k
        );
        let response = send_json(
            self.request(reqwest::Method::POST, "/v1/graphql").json(&json!({"query": graphql})),
            "weaviate",
        )
        .await?;
        let objects = response
            .get("data")
            .and_then(|d| d.get("Get"))
            .and_then(|g| g.get(&class))
            .and_then(|c| c.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(objects
            .iter()
            .filter_map(|object| {
                let additional = object.get("_additional")?;
                // Reshape the GraphQL row into the REST object layout.
                let as_rest = json!({
                    "id": additional.get("id"),
                    "vector": additional.get("vector"),
                    "properties": {
                        "text": object.get("text"),
                        "meta": object.get("meta"),
                        "createdAt": object.get("createdAt"),
                    },
                });
                Some(SearchHit {
                    score: additional
                        .get("certainty")
                        .and_then(|c| c.as_f64())
                        .unwrap_or(0.0) as f32,
                    record: Self::object_to_record(&as_rest)?,
                })
            })
            .collect())
    }

    async fn fetch(&self, collection: &str, id: &str) -> Result<Option<VectorRecord>, AiError> {
        let class = Self::class_name(collection);
        match send_json(
            self.request(
                reqwest::Method::GET,
                &format!("/v1/objects/{}/{}?include=vector", class, id),
            ),
            "weaviate",
        )
        .await
        {
            Ok(object) => Ok(Self::object_to_record(&object)),
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
        let class = Self::class_name(collection);
        let response = send_json(
            self.request(
                reqwest::Method::GET,
                &format!("/v1/objects?class={}&limit={}&include=vector", class, limit),
            ),
            "weaviate",
        )
        .await?;
        Ok(response
            .get("objects")
            .and_then(|o| o.as_array())
            .map(|objects| objects.iter().filter_map(Self::object_to_record).collect())
            .unwrap_or_default())
    }

    async fn create_collection(
        &self,
        name: &str,
        _dimensions: usize,
        space: SpaceType,
    ) -> Result<(), AiError> {
        let distance = match space {
            SpaceType::Cosine => "cosine",
            SpaceType::L2 => "l2-squared",
            SpaceType::InnerProduct => "dot",
        };
        let body = json!({
            "class": Self::class_name(name),
            "vectorizer": "none",
            "vectorIndexConfig": {"distance": distance},
            "properties": [
                {"name": "text", "dataType": ["text"]},
                {"name": "meta", "dataType": ["text"]},
                {"name": "createdAt", "dataType": ["text"]},
            ],
        });
        match send_json(
            self.request(reqwest::Method::POST, "/v1/schema").json(&body),
            "weaviate",
        )
        .await
        {
            Ok(_) => Ok(()),
            // Already exists.
            Err(AiError::Provider { status: 422, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn collection_exists(&self, name: &str) -> Result<bool, AiError> {
        match send_json(
            self.request(
                reqwest::Method::GET,
                &format!("/v1/schema/{}", Self::class_name(name)),
            ),
            "weaviate",
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
            self.request(
                reqwest::Method::DELETE,
                &format!("/v1/schema/{}", Self::class_name(name)),
            ),
            "weaviate",
        )
        .await?;
        Ok(())
    }
}
