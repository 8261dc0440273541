//! Anthropic Claude adapter speaking the native Messages API.
//!
//! Claude's wire format differs from the OpenAI shape in three ways the
//! adapter translates at its boundary:
//!
//! - the system prompt is a top-level `system` field, not a message;
//! - tool definitions use `input_schema` instead of nested `function`
//!   objects, and tool use/results are content blocks (`tool_use` /
//!   `tool_result`) rather than dedicated roles;
//! - authentication uses `x-api-key` plus an `anthropic-version` header.
//!
//! Embeddings are not part of Anthropic's API; `embed` raises
//! [`AiError::Unsupported`].

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

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
const API_VERSION: &str = "2023-06-01";

// The Messages API requires max_tokens; applied when the caller sets none.
const DEFAULT_MAX_TOKENS: u64 = 4096;

/// Service implementation for Anthropic Claude.
pub struct ClaudeService {
    config: ProviderConfig,
    base_url: String,
}

impl ClaudeService {
    /// Build the adapter, honoring a base-URL override from the config.
    pub fn new(config: &ProviderConfig) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        ClaudeService {
            config: config.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn resolve_key(&self, request: &ChatRequest) -> Result<String, AiError> {
        let resolved =
            resolve_credentials("claude", request.options.credentials.as_ref(), &self.config);
        require_key("claude", resolved)
    }

    fn chat_body(&self, request: &ChatRequest) -> Value {
        let model = request
            .model
            .clone()
            .or_else(|| self.config.default_model.clone())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let mut system_parts: Vec<String> = Vec::new();
        let mut messages: Vec<Value> = Vec::new();
        for entry in &request.messages {
            match entry.role {
                Role::System | Role::Developer => system_parts.push(entry.content.as_text()),
                Role::User => messages.push(json!({
                    "role": "user",
                    "content": entry.content.as_text(),
                })),
                Role::Assistant => messages.push(assistant_wire_message(entry)),
                Role::Tool => messages.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": entry.tool_call_id.clone().unwrap_or_default(),
                        "content": entry.content.as_text(),
                    }],
                })),
            }
        }

        let mut body = Map::new();
        body.insert("model".into(), Value::String(model));
        body.insert("messages".into(), Value::Array(messages));

        let mut params = self.config.default_params.clone();
        for (key, value) in &request.params {
            params.insert(key.clone(), value.clone());
        }
        // OpenAI-shaped tools from the params are translated in place.
        if let Some(tools) = params.remove("tools") {
            body.insert("tools".into(), translate_tools(&tools));
        }
        for (key, value) in params {
            body.insert(key, value);
        }
        body.entry("max_tokens".to_string())
            .or_insert(json!(DEFAULT_MAX_TOKENS));

        // No native structured output: steer via the system prompt.
        if let Some(ReturnFormat::Schema(schema)) = &request.options.return_format {
            system_parts.push(schema_directive(schema));
        }
        if !system_parts.is_empty() {
            body.insert("system".into(), Value::String(system_parts.join("\n\n")));
        }
        Value::Object(body)
    }

    fn request_builder(
        &self,
        key: &str,
        request: &ChatRequest,
        timeout_secs: u64,
    ) -> reqwest::RequestBuilder {
        let url = format!("{}/messages", self.base_url);
        let mut builder = get_shared_http_client()
            .post(&url)
            .timeout(Duration::from_secs(timeout_secs))
            .header("Content-Type", "application/json")
            .header("x-api-key", key)
            .header("anthropic-version", API_VERSION);
        let mut headers = self.config.default_headers.clone();
        for (name, value) in &request.headers {
            headers.insert(name.clone(), value.clone());
        }
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        builder
    }
}

#[async_trait::async_trait]
impl Service for ClaudeService {
    fn name(&self) -> &str {
        "claude"
    }

    async fn invoke(&self, request: &ChatRequest) -> Result<ChatResponse, AiError> {
        let key = self.resolve_key(request)?;
        let body = self.chat_body(request);
        log_request_payload("claude", request, &body);

        let timeout = request.options.timeout();
        let response = self
            .request_builder(&key, request, timeout)
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
        log_response_payload("claude", request, &text);

        if !status.is_success() {
            return Err(provider_error("claude", status.as_u16(), &text, retry_after).await);
        }

        let raw: Value = serde_json::from_str(&text)?;
        Ok(parse_claude_response(raw))
    }

    async fn invoke_stream(
        &self,
        request: &ChatRequest,
        on_chunk: ChunkCallback<'_>,
    ) -> Result<(), AiError> {
        let key = self.resolve_key(request)?;
        let mut body = self.chat_body(request);
        if let Some(obj) = body.as_object_mut() {
            obj.insert("stream".into(), Value::Bool(true));
        }
        log_request_payload("claude", request, &body);

        let timeout = request.options.timeout();
        let response = self
            .request_builder(&key, request, timeout)
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
            return Err(provider_error("claude", status.as_u16(), &text, retry_after).await);
        }

        let mut delivered = false;
        let result = for_each_data_line(response, timeout, |data| {
            match serde_json::from_str::<Value>(data) {
                Ok(chunk) => {
                    delivered = true;
                    on_chunk(chunk);
                }
                Err(e) => log::debug!("[claude] skipping undecodable chunk: {}", e),
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

    async fn embed(&self, _request: &EmbeddingRequest) -> Result<EmbeddingResponse, AiError> {
        Err(AiError::Unsupported {
            provider: "claude".to_string(),
            operation: "embed".to_string(),
        })
    }

    fn merge_service_params(&self, params: &mut Map<String, Value>) {
        for (key, value) in &self.config.default_params {
            params.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
}

fn assistant_wire_message(entry: &MessageEntry) -> Value {
    if entry.tool_calls.is_empty() {
        return json!({
            "role": "assistant",
            "content": entry.content.as_text(),
        });
    }
    let mut blocks: Vec<Value> = Vec::new();
    let text = entry.content.as_text();
    if !text.is_empty() {
        blocks.push(json!({"type": "text", "text": text}));
    }
    for call in &entry.tool_calls {
        blocks.push(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.name,
            "input": call.arguments,
        }));
    }
    json!({"role": "assistant", "content": blocks})
}

/// Translate OpenAI-shaped tool definitions to Anthropic's shape.
fn translate_tools(tools: &Value) -> Value {
    let translated: Vec<Value> = tools
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|tool| {
                    let function = tool.get("function")?;
                    Some(json!({
                        "name": function.get("name")?.as_str()?,
                        "description": function.get("description").and_then(|d| d.as_str()).unwrap_or(""),
                        "input_schema": function.get("parameters").cloned()
                            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                    }))
                })
                .collect()
        })
        .unwrap_or_default();
    Value::Array(translated)
}

/// Normalize an Anthropic response into the unified envelope.
pub(crate) fn parse_claude_response(raw: Value) -> ChatResponse {
    let model = raw.get("model").and_then(|m| m.as_str()).map(String::from);
    let usage = raw.get("usage").and_then(|usage| {
        let input = usage.get("input_tokens")?.as_u64()? as usize;
        let output = usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        Some(TokenUsage {
            prompt_tokens: input,
            completion_tokens: output,
            total_tokens: input + output,
        })
    });

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    if let Some(blocks) = raw.get("content").and_then(|c| c.as_array()) {
        for block in blocks {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(fragment) = block.get("text").and_then(|t| t.as_str()) {
                        text.push_str(fragment);
                    }
                }
                Some("tool_use") => {
                    tool_calls.push(ToolCall {
                        id: block
                            .get("id")
                            .and_then(|i| i.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        name: block
                            .get("name")
                            .and_then(|n| n.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        arguments: block.get("input").cloned().unwrap_or(Value::Null),
                    });
                }
                _ => {}
            }
        }
    }

    let messages = vec![MessageEntry {
        role: Role::Assistant,
        content: MessageContent::Text(text),
        tool_call_id: None,
        tool_calls,
    }];

    ChatResponse {
        raw,
        provider: "claude".to_string(),
        model,
        messages,
        usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tools_translate_to_input_schema() {
        let openai_shape = json!([{
            "type": "function",
            "function": {
                "name": "get_weather",
                "description": "weather lookup",
                "parameters": {"type": "object", "properties": {"location": {"type": "string"}}, "required": ["location"]}
            }
        }]);
        let translated = translate_tools(&openai_shape);
        assert_eq!(translated[0]["name"], json!("get_weather"));
        assert!(translated[0]["input_schema"]["properties"]["location"].is_object());
        assert!(translated[0].get("function").is_none());
    }

    #[test]
    fn parse_response_collects_text_and_tool_use() {
        let raw = json!({
            "model": "claude-sonnet-4-5",
            "content": [
                {"type": "text", "text": "checking"},
                {"type": "tool_use", "id": "toolu_1", "name": "search", "input": {"q": "rust"}}
            ],
            "usage": {"input_tokens": 12, "output_tokens": 4}
        });
        let response = parse_claude_response(raw);
        assert_eq!(response.first_text().as_deref(), Some("checking"));
        assert_eq!(response.tool_calls()[0].name, "search");
        assert_eq!(response.usage.as_ref().unwrap().total_tokens, 16);
    }

    #[test]
    fn tool_result_rides_as_user_content_block() {
        let service = ClaudeService::new(&ProviderConfig::default());
        let mut result = MessageEntry::new(Role::Tool, "85");
        result.tool_call_id = Some("toolu_1".into());
        let request = ChatRequest {
            messages: vec![MessageEntry::new(Role::User, "hot?"), result],
            ..Default::default()
        };
        let body = service.chat_body(&request);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[1]["role"], json!("user"));
        assert_eq!(messages[1]["content"][0]["type"], json!("tool_result"));
        assert_eq!(messages[1]["content"][0]["tool_use_id"], json!("toolu_1"));
    }

    #[test]
    fn system_messages_lift_to_top_level_field() {
        let service = ClaudeService::new(&ProviderConfig::default());
        let request = ChatRequest {
            messages: vec![
                MessageEntry::new(Role::System, "be terse"),
                MessageEntry::new(Role::User, "hi"),
            ],
            ..Default::default()
        };
        let body = service.chat_body(&request);
        assert_eq!(body["system"], json!("be terse"));
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["max_tokens"], json!(DEFAULT_MAX_TOKENS));
    }
}
