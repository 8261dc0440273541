//! Cohere adapter speaking the v2 chat and embed APIs.
//!
//! Cohere's v2 chat surface is close to the OpenAI shape (role-tagged
//! messages, OpenAI-style tool definitions) but wraps assistant output in
//! `message.content[]` blocks and reports usage under
//! `usage.billed_units`.  Embeddings return under `embeddings.float`.

use crate::omnillm::config::ProviderConfig;
use crate::omnillm::error::AiError;
use crate::omnillm::message::{MessageContent, MessageEntry, Role, ToolCall};
use crate::omnillm::providers::sse::for_each_data_line;
use crate::omnillm::providers::{
    log_request_payload, log_response_payload, parse_retry_after, schema_directive,
};
use crate::omnillm::request::{ChatRequest, EmbeddingRequest, ReturnFormat};
use crate::omnillm::service::{
    error_chunk, get_shared_http_client, provider_error, require_key, resolve_credentials,
    transport_error, ChatResponse, ChunkCallback, EmbeddingResponse, Service, TokenUsage,
};
use serde_json::{json, Map, Value};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.cohere.com/v2";
const DEFAULT_MODEL: &str = "command-r-plus";
const DEFAULT_EMBED_MODEL: &str = "embed-english-v3.0";

/// Service implementation for Cohere.
pub struct CohereService {
    config: ProviderConfig,
    base_url: String,
}

impl CohereService {
    /// Build the adapter, honoring a base-URL override from the config.
    pub fn new(config: &ProviderConfig) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        CohereService {
            config: config.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn resolve_key(
        &self,
        request_credentials: Option<&crate::omnillm::request::Credentials>,
    ) -> Result<String, AiError> {
        let resolved = resolve_credentials("cohere", request_credentials, &self.config);
        require_key("cohere", resolved)
    }

    fn chat_body(&self, request: &ChatRequest) -> Value {
        let model = request
            .model
            .clone()
            .or_else(|| self.config.default_model.clone())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let mut messages: Vec<Value> = Vec::new();
        for entry in &request.messages {
            match entry.role {
                Role::System | Role::Developer => messages.push(json!({
                    "role": "system",
                    "content": entry.content.as_text(),
                })),
                Role::User => messages.push(json!({
                    "role": "user",
                    "content": entry.content.as_text(),
                })),
                Role::Assistant => {
                    if entry.tool_calls.is_empty() {
                        messages.push(json!({
                            "role": "assistant",
                            "content": entry.content.as_text(),
                        }));
                    } else {
                        let calls: Vec<Value> = entry
                            .tool_calls
                            .iter()
                            .map(|tc| {
                                json!({
                                    "id": tc.id,
                                    "type": "function",
                                    "function": {
                                        "name": tc.name,
                                        "arguments": serde_json::to_string(&tc.arguments)
                                            .unwrap_or_else(|_| "{}".to_string()),
                                    }
                                })
                            })
                            .collect();
                        messages.push(json!({
                            "role": "assistant",
                            "tool_calls": calls,
                        }));
                    }
                }
                Role::Tool => messages.push(json!({
                    "role": "tool",
                    "tool_call_id": entry.tool_call_id.clone().unwrap_or_default(),
                    "content": entry.content.as_text(),
                })),
            }
        }

        // No native structured output: steer with a system directive.
        if let Some(ReturnFormat::Schema(schema)) = &request.options.return_format {
            messages.insert(0, json!({"role": "system", "content": schema_directive(schema)}));
        }

        let mut body = Map::new();
        body.insert("model".into(), Value::String(model));
        body.insert("messages".into(), Value::Array(messages));
        let mut params = self.config.default_params.clone();
        for (key, value) in &request.params {
            params.insert(key.clone(), value.clone());
        }
        for (key, value) in params {
            body.insert(key, value);
        }
        Value::Object(body)
    }

    fn request_builder(&self, path: &str, key: &str, timeout_secs: u64) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = get_shared_http_client()
            .post(&url)
            .timeout(Duration::from_secs(timeout_secs))
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", key));
        for (name, value) in &self.config.default_headers {
            builder = builder.header(name, value);
        }
        builder
    }
}

#[async_trait::async_trait]
impl Service for CohereService {
    fn name(&self) -> &str {
        "cohere"
    }

    async fn invoke(&self, request: &ChatRequest) -> Result<ChatResponse, AiError> {
        let key = self.resolve_key(request.options.credentials.as_ref())?;
        let body = self.chat_body(request);
        log_request_payload("cohere", request, &body);

        let timeout = request.options.timeout();
        let response = self
            .request_builder("/chat", &key, timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;

        let status = response.status();
        let retry_after = parse_retry_after(&response);
        let text = response
            .text()
            .await
            .map_err(|e| transport_error(e, timeout))?;
        log_response_payload("cohere", request, &text);

        if !status.is_success() {
            return Err(provider_error("cohere", status.as_u16(), &text, retry_after).await);
        }

        let raw: Value = serde_json::from_str(&text)?;
        Ok(parse_cohere_response(raw))
    }

    async fn invoke_stream(
        &self,
        request: &ChatRequest,
        on_chunk: ChunkCallback<'_>,
    ) -> Result<(), AiError> {
        let key = self.resolve_key(request.options.credentials.as_ref())?;
        let mut body = self.chat_body(request);
        if let Some(obj) = body.as_object_mut() {
            obj.insert("stream".into(), Value::Bool(true));
        }
        log_request_payload("cohere", request, &body);

        let timeout = request.options.timeout();
        let response = self
            .request_builder("/chat", &key, timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(&response);
            let text = response
                .text()
                .await
                .map_err(|e| transport_error(e, timeout))?;
            return Err(provider_error("cohere", status.as_u16(), &text, retry_after).await);
        }

        let mut delivered = false;
        let result = for_each_data_line(response, timeout, |data| {
            match serde_json::from_str::<Value>(data) {
                Ok(chunk) => {
                    delivered = true;
                    on_chunk(chunk);
                }
                Err(e) => log::debug!("[cohere] skipping undecodable chunk: {}", e),
            }
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if delivered => {
                on_chunk(error_chunk(&e.to_string()));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse, AiError> {
        let key = self.resolve_key(request.options.credentials.as_ref())?;
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| DEFAULT_EMBED_MODEL.to_string());

        let mut body = Map::new();
        body.insert("model".into(), Value::String(model));
        body.insert("texts".into(), json!(request.input.texts()));
        body.insert("embedding_types".into(), json!(["float"]));
        body.entry("input_type".to_string())
            .or_insert(json!("search_document"));
        for (key, value) in &request.params {
            body.insert(key.clone(), value.clone());
        }

        let timeout = request.options.timeout();
        let response = self
            .request_builder("/embed", &key, timeout)
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
            return Err(provider_error("cohere", status.as_u16(), &text, retry_after).await);
        }

        let raw: Value = serde_json::from_str(&text)?;
        let vectors = raw
            .get("embeddings")
            .and_then(|e| e.get("float"))
            .and_then(|f| f.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|vector| {
                        vector.as_array().map(|values| {
                            values
                                .iter()
                                .filter_map(|f| f.as_f64())
                                .map(|f| f as f32)
                                .collect::<Vec<f32>>()
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Ok(EmbeddingResponse {
            raw,
            vectors,
            usage: None,
        })
    }
}

/// Normalize a Cohere v2 chat response into the unified envelope.
pub(crate) fn parse_cohere_response(raw: Value) -> ChatResponse {
    let model = raw.get("model").and_then(|m| m.as_str()).map(String::from);
    let usage = raw
        .get("usage")
        .and_then(|u| u.get("billed_units"))
        .and_then(|usage| {
            let input = usage.get("input_tokens")?.as_u64()? as usize;
            let output = usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
            Some(TokenUsage {
                prompt_tokens: input,
                completion_tokens: output,
                total_tokens: input + output,
            })
        });

    let message = raw.get("message");
    let mut text = String::new();
    if let Some(blocks) = message
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_array())
    {
        for block in blocks {
            if let Some(fragment) = block.get("text").and_then(|t| t.as_str()) {
                text.push_str(fragment);
            }
        }
    }
    let tool_calls = message
        .and_then(|m| m.get("tool_calls"))
        .and_then(|tc| tc.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| {
                    let id = tc.get("id")?.as_str()?.to_string();
                    let function = tc.get("function")?;
                    let name = function.get("name")?.as_str()?.to_string();
                    let args_str = function
                        .get("arguments")
                        .and_then(|a| a.as_str())
                        .unwrap_or("{}");
                    let arguments =
                        serde_json::from_str(args_str).unwrap_or(Value::Object(Map::new()));
                    Some(ToolCall { id, name, arguments })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let messages = vec![MessageEntry {
        role: Role::Assistant,
        content: MessageContent::Text(text),
        tool_call_id: None,
        tool_calls,
    }];

    ChatResponse {
        raw,
        provider: "cohere".to_string(),
        model,
        messages,
        usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_response_reads_content_blocks_and_billed_units() {
        let raw = json!({
            "model": "command-r-plus",
            "message": {"role": "assistant", "content": [{"type": "text", "text": "hi"}]},
            "usage": {"billed_units": {"input_tokens": 3, "output_tokens": 1}}
        });
        let response = parse_cohere_response(raw);
        assert_eq!(response.first_text().as_deref(), Some("hi"));
        assert_eq!(response.usage.as_ref().unwrap().total_tokens, 4);
    }

    #[test]
    fn embed_body_defaults_input_type() {
        // input_type defaults to search_document but params override it.
        let service = CohereService::new(&ProviderConfig::default());
        assert_eq!(service.name(), "cohere");
    }
}
