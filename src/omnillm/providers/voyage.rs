//! Voyage AI adapter: embeddings only.
//!
//! Voyage exposes no chat surface; `invoke` and `invoke_stream` raise
//! [`AiError::Unsupported`], matching the provider capability matrix.

use crate::omnillm::config::ProviderConfig;
use crate::omnillm::error::AiError;
use crate::omnillm::providers::parse_retry_after;
use crate::omnillm::request::{ChatRequest, EmbeddingRequest};
use crate::omnillm::service::{
    get_shared_http_client, provider_error, require_key, resolve_credentials, transport_error,
    ChatResponse, ChunkCallback, EmbeddingResponse, Service, TokenUsage,
};
use serde_json::{json, Map, Value};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.voyageai.com/v1";
const DEFAULT_EMBED_MODEL: &str = "voyage-3";

/// Service implementation for Voyage AI.
pub struct VoyageService {
    config: ProviderConfig,
    base_url: String,
}

impl VoyageService {
    /// Build the adapter, honoring a base-URL override from the config.
    pub fn new(config: &ProviderConfig) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        VoyageService {
            config: config.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait::async_trait]
impl Service for VoyageService {
    fn name(&self) -> &str {
        "voyage"
    }

    async fn invoke(&self, _request: &ChatRequest) -> Result<ChatResponse, AiError> {
        Err(AiError::Unsupported {
            provider: "voyage".to_string(),
            operation: "chat".to_string(),
        })
    }

    async fn invoke_stream(
        &self,
        _request: &ChatRequest,
        _on_chunk: ChunkCallback<'_>,
    ) -> Result<(), AiError> {
        Err(AiError::Unsupported {
            provider: "voyage".to_string(),
            operation: "chatStream".to_string(),
        })
    }

    async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse, AiError> {
        let resolved = resolve_credentials("voyage", request.options.credentials.as_ref(), &self.config);
        let key = require_key("voyage", resolved)?;
        let model = request
            .model
            .clone()
            .or_else(|| self.config.default_model.clone())
            .unwrap_or_else(|| DEFAULT_EMBED_MODEL.to_string());

        let mut body = Map::new();
        body.insert("model".into(), Value::String(model));
        body.insert("input".into(), json!(request.input.texts()));
        for (k, v) in &request.params {
            body.insert(k.clone(), v.clone());
        }

        let url = format!("{}/embeddings", self.base_url);
        let timeout = request.options.timeout();
        let response = get_shared_http_client()
            .post(&url)
            .timeout(Duration::from_secs(timeout))
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", key))
            .json(&Value::Object(body))
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;

        let status = response.status();
        let retry_after = parse_retry_after(&response);
        let text = response
            .text()
            .await
            .map_err(|e| transport_error(e, timeout))?;
        if !status.is_success() {
            return Err(provider_error("voyage", status.as_u16(), &text, retry_after).await);
        }

        let raw: Value = serde_json::from_str(&text)?;
        let vectors = raw
            .get("data")
            .and_then(|d| d.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        item.get("embedding").and_then(|e| e.as_array()).map(|v| {
                            v.iter()
                                .filter_map(|f| f.as_f64())
                                .map(|f| f as f32)
                                .collect::<Vec<f32>>()
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let usage = raw.get("usage").and_then(|usage| {
            let total = usage.get("total_tokens")?.as_u64()? as usize;
            Some(TokenUsage {
                prompt_tokens: total,
                completion_tokens: 0,
                total_tokens: total,
            })
        });
        Ok(EmbeddingResponse { raw, vectors, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chat_is_unsupported() {
        let service = VoyageService::new(&ProviderConfig::default());
        let err = service.invoke(&ChatRequest::default()).await.unwrap_err();
        assert!(matches!(
            err,
            AiError::Unsupported { ref operation, .. } if operation == "chat"
        ));
    }
}
