//! Google Gemini adapter speaking the Generative Language API.
//!
//! Gemini structures conversations as `contents[].parts[]` with roles
//! `user`/`model`, lifts the system prompt into `systemInstruction`, and
//! models tool calling as `functionDeclarations` going out and
//! `functionCall`/`functionResponse` parts coming back.  The adapter
//! translates all of that to and from the unified shape.  Gemini assigns
//! no IDs to function calls, so the adapter synthesizes `name-index` IDs
//! for correlation.
//!
//! Embeddings go through `batchEmbedContents`.

use crate::omnillm::config::ProviderConfig;
use crate::omnillm::error::AiError;
use crate::omnillm::message::{MessageContent, MessageEntry, Role, ToolCall};
use crate::omnillm::providers::sse::for_each_data_line;
use crate::omnillm::providers::{log_request_payload, log_response_payload, parse_retry_after};
use crate::omnillm::request::{ChatRequest, EmbeddingRequest, ReturnFormat};
use crate::omnillm::service::{
    error_chunk, get_shared_http_client, provider_error, require_key, resolve_credentials,
    transport_error, ChatResponse, ChunkCallback, EmbeddingResponse, Service, TokenUsage,
};
use serde_json::{json, Map, Value};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-2.0-flash";
const DEFAULT_EMBED_MODEL: &str = "text-embedding-004";

/// Service implementation for Google Gemini.
pub struct GeminiService {
    config: ProviderConfig,
    base_url: String,
}

impl GeminiService {
    /// Build the adapter, honoring a base-URL override from the config.
    pub fn new(config: &ProviderConfig) -> Self {
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        GeminiService {
            config: config.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn model_for(&self, request_model: &Option<String>) -> String {
        request_model
            .clone()
            .or_else(|| self.config.default_model.clone())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }

    fn chat_body(&self, request: &ChatRequest) -> Value {
        let mut system_parts: Vec<String> = Vec::new();
        let mut contents: Vec<Value> = Vec::new();
        for entry in &request.messages {
            match entry.role {
                Role::System | Role::Developer => system_parts.push(entry.content.as_text()),
                Role::User => contents.push(json!({
                    "role": "user",
                    "parts": [{"text": entry.content.as_text()}],
                })),
                Role::Assistant => contents.push(model_wire_content(entry)),
                Role::Tool => {
                    // functionResponse correlates by name: the synthesized
                    // call ID is `name-index`, so the name is its prefix.
                    let name = entry
                        .tool_call_id
                        .as_deref()
                        .map(|id| id.rsplit_once('-').map(|(n, _)| n).unwrap_or(id))
                        .unwrap_or_default();
                    contents.push(json!({
                        "role": "user",
                        "parts": [{"functionResponse": {
                            "name": name,
                            "response": {"result": entry.content.as_text()},
                        }}],
                    }));
                }
            }
        }

        let mut body = Map::new();
        body.insert("contents".into(), Value::Array(contents));
        if !system_parts.is_empty() {
            body.insert(
                "systemInstruction".into(),
                json!({"parts": [{"text": system_parts.join("\n\n")}]}),
            );
        }

        let mut params = self.config.default_params.clone();
        for (key, value) in &request.params {
            params.insert(key.clone(), value.clone());
        }
        if let Some(tools) = params.remove("tools") {
            body.insert(
                "tools".into(),
                json!([{"functionDeclarations": translate_tools(&tools)}]),
            );
        }

        // Well-known OpenAI-style params map onto generationConfig.
        let mut generation = Map::new();
        if let Some(temperature) = params.remove("temperature") {
            generation.insert("temperature".into(), temperature);
        }
        if let Some(max_tokens) = params.remove("max_tokens") {
            generation.insert("maxOutputTokens".into(), max_tokens);
        }
        if let Some(top_p) = params.remove("top_p") {
            generation.insert("topP".into(), top_p);
        }
        if let Some(ReturnFormat::Schema(schema)) = &request.options.return_format {
            generation.insert("responseMimeType".into(), json!("application/json"));
            generation.insert("responseSchema".into(), schema.to_json_schema());
        }
        if !generation.is_empty() {
            body.insert("generationConfig".into(), Value::Object(generation));
        }
        for (key, value) in params {
            body.insert(key, value);
        }
        for (key, value) in &request.options.provider_options {
            body.insert(key.clone(), value.clone());
        }
        Value::Object(body)
    }

    fn request_builder(
        &self,
        url: &str,
        key: &str,
        request_headers: &std::collections::HashMap<String, String>,
        timeout_secs: u64,
    ) -> reqwest::RequestBuilder {
        let mut builder = get_shared_http_client()
            .post(url)
            .timeout(Duration::from_secs(timeout_secs))
            .header("Content-Type", "application/json")
            .header("x-goog-api-key", key);
        let mut headers = self.config.default_headers.clone();
        for (name, value) in request_headers {
            headers.insert(name.clone(), value.clone());
        }
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        builder
    }

    fn resolve_key(
        &self,
        request_credentials: Option<&crate::omnillm::request::Credentials>,
    ) -> Result<String, AiError> {
        let resolved = resolve_credentials("gemini", request_credentials, &self.config);
        require_key("gemini", resolved)
    }
}

#[async_trait::async_trait]
impl Service for GeminiService {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn invoke(&self, request: &ChatRequest) -> Result<ChatResponse, AiError> {
        let key = self.resolve_key(request.options.credentials.as_ref())?;
        let model = self.model_for(&request.model);
        let body = self.chat_body(request);
        log_request_payload("gemini", request, &body);

        let url = format!("{}/models/{}:generateContent", self.base_url, model);
        let timeout = request.options.timeout();
        let response = self
            .request_builder(&url, &key, &request.headers, timeout)
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
        log_response_payload("gemini", request, &text);

        if !status.is_success() {
            return Err(provider_error("gemini", status.as_u16(), &text, retry_after).await);
        }

        let raw: Value = serde_json::from_str(&text)?;
        Ok(parse_gemini_response(model, raw))
    }

    async fn invoke_stream(
        &self,
        request: &ChatRequest,
        on_chunk: ChunkCallback<'_>,
    ) -> Result<(), AiError> {
        let key = self.resolve_key(request.options.credentials.as_ref())?;
        let model = self.model_for(&request.model);
        let body = self.chat_body(request);
        log_request_payload("gemini", request, &body);

        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, model
        );
        let timeout = request.options.timeout();
        let response = self
            .request_builder(&url, &key, &request.headers, timeout)
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
            return Err(provider_error("gemini", status.as_u16(), &text, retry_after).await);
        }

        let mut delivered = false;
        let result = for_each_data_line(response, timeout, |data| {
            match serde_json::from_str::<Value>(data) {
                Ok(chunk) => {
                    delivered = true;
                    on_chunk(chunk);
                }
                Err(e) => log::debug!("[gemini] skipping undecodable chunk: {}", e),
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

        let requests: Vec<Value> = request
            .input
            .texts()
            .iter()
            .map(|text| {
                json!({
                    "model": format!("models/{}", model),
                    "content": {"parts": [{"text": text}]},
                })
            })
            .collect();
        let body = json!({ "requests": requests });

        let url = format!("{}/models/{}:batchEmbedContents", self.base_url, model);
        let timeout = request.options.timeout();
        let response = self
            .request_builder(&url, &key, &std::collections::HashMap::new(), timeout)
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
        if !status.is_success() {
            return Err(provider_error("gemini", status.as_u16(), &text, retry_after).await);
        }

        let raw: Value = serde_json::from_str(&text)?;
        let vectors = raw
            .get("embeddings")
            .and_then(|e| e.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        item.get("values").and_then(|v| v.as_array()).map(|values| {
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

    fn merge_service_params(&self, params: &mut Map<String, Value>) {
        for (key, value) in &self.config.default_params {
            params.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
}

fn model_wire_content(entry: &MessageEntry) -> Value {
    let mut parts: Vec<Value> = Vec::new();
    let text = entry.content.as_text();
    if !text.is_empty() {
        parts.push(json!({"text": text}));
    }
    for call in &entry.tool_calls {
        parts.push(json!({"functionCall": {
            "name": call.name,
            "args": call.arguments,
        }}));
    }
    if parts.is_empty() {
        parts.push(json!({"text": ""}));
    }
    json!({"role": "model", "parts": parts})
}

/// Translate OpenAI-shaped tool definitions into `functionDeclarations`.
fn translate_tools(tools: &Value) -> Vec<Value> {
    tools
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|tool| {
                    let function = tool.get("function")?;
                    let mut parameters = function
                        .get("parameters")
                        .cloned()
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}}));
                    // Gemini rejects fields that are not part of its
                    // OpenAPI-subset schema dialect.
                    if let Some(obj) = parameters.as_object_mut() {
                        obj.remove("additionalProperties");
                    }
                    Some(json!({
                        "name": function.get("name")?.as_str()?,
                        "description": function.get("description").and_then(|d| d.as_str()).unwrap_or(""),
                        "parameters": parameters,
                    }))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Normalize a Gemini response into the unified envelope.
pub(crate) fn parse_gemini_response(model: String, raw: Value) -> ChatResponse {
    let usage = raw.get("usageMetadata").and_then(|usage| {
        let prompt = usage.get("promptTokenCount")?.as_u64()? as usize;
        let completion = usage
            .get("candidatesTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
        Some(TokenUsage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        })
    });

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    if let Some(parts) = raw
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
    {
        for (index, part) in parts.iter().enumerate() {
            if let Some(fragment) = part.get("text").and_then(|t| t.as_str()) {
                text.push_str(fragment);
            }
            if let Some(call) = part.get("functionCall") {
                let name = call
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or_default()
                    .to_string();
                tool_calls.push(ToolCall {
                    // Gemini assigns no call IDs; synthesize name-index.
                    id: format!("{}-{}", name, index),
                    name,
                    arguments: call.get("args").cloned().unwrap_or(Value::Null),
                });
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
        provider: "gemini".to_string(),
        model: Some(model),
        messages,
        usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_body_builds_contents_and_system_instruction() {
        let service = GeminiService::new(&ProviderConfig::default());
        let request = ChatRequest {
            messages: vec![
                MessageEntry::new(Role::System, "be terse"),
                MessageEntry::new(Role::User, "hello"),
            ],
            ..Default::default()
        };
        let body = service.chat_body(&request);
        assert_eq!(
            body["systemInstruction"]["parts"][0]["text"],
            json!("be terse")
        );
        assert_eq!(body["contents"][0]["role"], json!("user"));
    }

    #[test]
    fn max_tokens_maps_to_generation_config() {
        let service = GeminiService::new(&ProviderConfig::default());
        let mut params = Map::new();
        params.insert("max_tokens".into(), json!(256));
        params.insert("temperature".into(), json!(0.1));
        let request = ChatRequest {
            messages: vec![MessageEntry::new(Role::User, "hi")],
            params,
            ..Default::default()
        };
        let body = service.chat_body(&request);
        assert_eq!(body["generationConfig"]["maxOutputTokens"], json!(256));
        assert_eq!(body["generationConfig"]["temperature"], json!(0.1));
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn function_call_round_trip() {
        let raw = json!({
            "candidates": [{"content": {"role": "model", "parts": [
                {"functionCall": {"name": "get_weather", "args": {"location": "Lisbon"}}}
            ]}}],
            "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 2}
        });
        let response = parse_gemini_response("gemini-2.0-flash".into(), raw);
        let call = &response.tool_calls()[0];
        assert_eq!(call.name, "get_weather");
        assert_eq!(call.id, "get_weather-0");

        // The tool result rides back as a functionResponse part keyed by name.
        let service = GeminiService::new(&ProviderConfig::default());
        let mut result = MessageEntry::new(Role::Tool, "sunny");
        result.tool_call_id = Some(call.id.clone());
        let request = ChatRequest {
            messages: vec![result],
            ..Default::default()
        };
        let body = service.chat_body(&request);
        assert_eq!(
            body["contents"][0]["parts"][0]["functionResponse"]["name"],
            json!("get_weather")
        );
    }

    #[test]
    fn tool_declarations_drop_additional_properties() {
        let tools = json!([{
            "type": "function",
            "function": {
                "name": "t",
                "parameters": {"type": "object", "properties": {}, "additionalProperties": false}
            }
        }]);
        let declarations = translate_tools(&tools);
        assert!(declarations[0]["parameters"].get("additionalProperties").is_none());
    }
}
