//! Adapter for providers exposing an OpenAI-compatible HTTP surface.
//!
//! One implementation covers OpenAI itself plus every vendor that mirrors
//! its Chat Completions wire format: xAI Grok, Groq, DeepSeek, Mistral,
//! OpenRouter, Perplexity, Ollama, and HuggingFace.  The providers differ
//! only by base URL, default models, key requirements, and capability
//! flags, captured in a [`ProviderProfile`].
//!
//! # Message serialisation
//!
//! | [`Role`] variant | Wire representation |
//! |---|---|
//! | `System` | `{"role":"system","content":"..."}` |
//! | `Developer` | `{"role":"developer",...}` on OpenAI, `system` elsewhere |
//! | `User` | `{"role":"user","content":"..."}` |
//! | `Assistant` with tool_calls | `{"role":"assistant","content":null,"tool_calls":[...]}` |
//! | `Assistant` without | `{"role":"assistant","content":"..."}` |
//! | `Tool` | `{"role":"tool","tool_call_id":"<id>","content":"..."}` |

use crate::omnillm::config::ProviderConfig;
use crate::omnillm::error::AiError;
use crate::omnillm::message::{ContentPart, MessageContent, MessageEntry, Role, ToolCall};
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
use std::collections::HashMap;
use std::time::Duration;

/// Static description of one OpenAI-compatible provider.
#[derive(Debug, Clone)]
pub struct ProviderProfile {
    /// Registry name.
    pub name: &'static str,
    /// Base URL ending before `/chat/completions`.
    pub base_url: &'static str,
    /// Model used when the request names none.
    pub default_model: &'static str,
    /// Embedding model used when the request names none.
    pub default_embed_model: Option<&'static str>,
    /// Providers without an embedding surface raise `Unsupported`.
    pub supports_embeddings: bool,
    /// Local engines (Ollama) run without a key.
    pub requires_key: bool,
    /// Only OpenAI knows the `developer` role; others get `system`.
    pub developer_role: bool,
    /// Native structured output (`response_format: json_schema`).
    pub native_structured_output: bool,
}

/// Look up the profile for a provider name.
pub fn profile_for(name: &str) -> ProviderProfile {
    let table: &[ProviderProfile] = &[
        ProviderProfile {
            name: "openai",
            base_url: "https://api.openai.com/v1",
            default_model: "gpt-4o-mini",
            default_embed_model: Some("text-embedding-3-small"),
            supports_embeddings: true,
            requires_key: true,
            developer_role: true,
            native_structured_output: true,
        },
        ProviderProfile {
            name: "grok",
            base_url: "https://api.x.ai/v1",
            default_model: "grok-2-latest",
            default_embed_model: None,
            supports_embeddings: false,
            requires_key: true,
            developer_role: false,
            native_structured_output: false,
        },
        ProviderProfile {
            name: "groq",
            base_url: "https://api.groq.com/openai/v1",
            default_model: "llama-3.3-70b-versatile",
            default_embed_model: None,
            supports_embeddings: false,
            requires_key: true,
            developer_role: false,
            native_structured_output: false,
        },
        ProviderProfile {
            name: "deepseek",
            base_url: "https://api.deepseek.com/v1",
            default_model: "deepseek-chat",
            default_embed_model: None,
            supports_embeddings: false,
            requires_key: true,
            developer_role: false,
            native_structured_output: false,
        },
        ProviderProfile {
            name: "mistral",
            base_url: "https://api.mistral.ai/v1",
            default_model: "mistral-small-latest",
            default_embed_model: Some("mistral-embed"),
            supports_embeddings: true,
            requires_key: true,
            developer_role: false,
            native_structured_output: false,
        },
        ProviderProfile {
            name: "openrouter",
            base_url: "https://openrouter.ai/api/v1",
            default_model: "openrouter/auto",
            default_embed_model: None,
            supports_embeddings: false,
            requires_key: true,
            developer_role: false,
            native_structured_output: false,
        },
        ProviderProfile {
            name: "perplexity",
            base_url: "https://api.perplexity.ai",
            default_model: "sonar",
            default_embed_model: None,
            // The capability matrix is ambiguous; the tests assert
            // embeddings are unsupported, so the tests win.
            supports_embeddings: false,
            requires_key: true,
            developer_role: false,
            native_structured_output: false,
        },
        ProviderProfile {
            name: "ollama",
            base_url: "http://localhost:11434/v1",
            default_model: "llama3.2",
            default_embed_model: Some("nomic-embed-text"),
            supports_embeddings: true,
            requires_key: false,
            developer_role: false,
            native_structured_output: false,
        },
        ProviderProfile {
            name: "huggingface",
            base_url: "https://router.huggingface.co/v1",
            default_model: "meta-llama/Llama-3.3-70B-Instruct",
            default_embed_model: None,
            supports_embeddings: false,
            requires_key: true,
            developer_role: false,
            native_structured_output: false,
        },
    ];
    table
        .iter()
        .find(|p| p.name == name)
        .cloned()
        .unwrap_or(ProviderProfile {
            name: "openai",
            base_url: "https://api.openai.com/v1",
            default_model: "gpt-4o-mini",
            default_embed_model: Some("text-embedding-3-small"),
            supports_embeddings: true,
            requires_key: true,
            developer_role: true,
            native_structured_output: true,
        })
}

/// Service implementation shared by the OpenAI-compatible family.
pub struct OpenAiCompatService {
    profile: ProviderProfile,
    config: ProviderConfig,
    base_url: String,
}

impl OpenAiCompatService {
    /// Build the adapter for a family member, merging provider defaults
    /// from the config block.
    pub fn new(provider: &str, config: &ProviderConfig) -> Self {
        let profile = profile_for(provider);
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| profile.base_url.to_string());
        OpenAiCompatService {
            profile,
            config: config.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn resolve_key(&self, request_credentials: Option<&crate::omnillm::request::Credentials>) -> Result<Option<String>, AiError> {
        let resolved = resolve_credentials(self.profile.name, request_credentials, &self.config);
        if self.profile.requires_key {
            require_key(self.profile.name, resolved).map(Some)
        } else {
            Ok(resolved.and_then(|c| c.as_key().map(|k| k.to_string())))
        }
    }

    fn chat_body(&self, request: &ChatRequest) -> Value {
        let model = request
            .model
            .clone()
            .or_else(|| self.config.default_model.clone())
            .unwrap_or_else(|| self.profile.default_model.to_string());

        let wire_messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| wire_message(m, self.profile.developer_role))
            .collect();

        let mut body = Map::new();
        body.insert("model".into(), Value::String(model));
        body.insert("messages".into(), Value::Array(wire_messages));

        let mut params = self.config.default_params.clone();
        for (key, value) in &request.params {
            params.insert(key.clone(), value.clone());
        }
        for (key, value) in params {
            body.insert(key, value);
        }

        // Structured output: native json_schema on OpenAI, a directive +
        // json_object elsewhere.
        if let Some(ReturnFormat::Schema(schema)) = &request.options.return_format {
            if self.profile.native_structured_output {
                body.insert(
                    "response_format".into(),
                    json!({
                        "type": "json_schema",
                        "json_schema": {
                            "name": schema.name,
                            "schema": schema.to_json_schema(),
                            "strict": true,
                        }
                    }),
                );
            } else {
                body.insert("response_format".into(), json!({"type": "json_object"}));
                if let Some(Value::Array(messages)) = body.get_mut("messages") {
                    messages.insert(
                        0,
                        json!({"role": "system", "content": schema_directive(schema)}),
                    );
                }
            }
        }
        Value::Object(body)
    }

    fn request_builder(
        &self,
        path: &str,
        key: Option<&str>,
        request_headers: &HashMap<String, String>,
        timeout_secs: u64,
    ) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = get_shared_http_client()
            .post(&url)
            .timeout(Duration::from_secs(timeout_secs))
            .header("Content-Type", "application/json");
        if let Some(key) = key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }
        let mut headers = self.config.default_headers.clone();
        for (name, value) in request_headers {
            headers.insert(name.clone(), value.clone());
        }
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        builder
    }
}

#[async_trait::async_trait]
impl Service for OpenAiCompatService {
    fn name(&self) -> &str {
        self.profile.name
    }

    async fn invoke(&self, request: &ChatRequest) -> Result<ChatResponse, AiError> {
        let key = self.resolve_key(request.options.credentials.as_ref())?;
        let body = self.chat_body(request);
        log_request_payload(self.profile.name, request, &body);

        let timeout = request.options.timeout();
        let response = self
            .request_builder("/chat/completions", key.as_deref(), &request.headers, timeout)
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
        log_response_payload(self.profile.name, request, &text);

        if !status.is_success() {
            return Err(provider_error(self.profile.name, status.as_u16(), &text, retry_after).await);
        }

        let raw: Value = serde_json::from_str(&text)?;
        Ok(parse_chat_response(self.profile.name, raw))
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
        log_request_payload(self.profile.name, request, &body);

        let timeout = request.options.timeout();
        let response = self
            .request_builder("/chat/completions", key.as_deref(), &request.headers, timeout)
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
            return Err(provider_error(self.profile.name, status.as_u16(), &text, retry_after).await);
        }

        let mut delivered = false;
        let result = for_each_data_line(response, timeout, |data| {
            if data == "[DONE]" {
                return;
            }
            match serde_json::from_str::<Value>(data) {
                Ok(chunk) => {
                    delivered = true;
                    on_chunk(chunk);
                }
                Err(e) => {
                    log::debug!("[{}] skipping undecodable chunk: {}", self.profile.name, e)
                }
            }
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            // After the first chunk, failures close the stream with a
            // terminal error chunk instead of raising.
            Err(e) if delivered => {
                on_chunk(error_chunk(&e.to_string()));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse, AiError> {
        if !self.profile.supports_embeddings {
            return Err(AiError::Unsupported {
                provider: self.profile.name.to_string(),
                operation: "embed".to_string(),
            });
        }
        let key = self.resolve_key(request.options.credentials.as_ref())?;
        let model = request
            .model
            .clone()
            .or_else(|| self.profile.default_embed_model.map(|m| m.to_string()))
            .ok_or_else(|| {
                AiError::ConfigMissing(format!(
                    "no embedding model configured for '{}'",
                    self.profile.name
                ))
            })?;

        let mut body = Map::new();
        body.insert("model".into(), Value::String(model));
        body.insert("input".into(), json!(request.input.texts()));
        for (k, v) in &request.params {
            body.insert(k.clone(), v.clone());
        }

        let timeout = request.options.timeout();
        let response = self
            .request_builder("/embeddings", key.as_deref(), &HashMap::new(), timeout)
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
            return Err(provider_error(self.profile.name, status.as_u16(), &text, retry_after).await);
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
        let usage = raw.get("usage").and_then(TokenUsage::from_openai_usage);
        Ok(EmbeddingResponse { raw, vectors, usage })
    }

    fn merge_service_params(&self, params: &mut Map<String, Value>) {
        for (key, value) in &self.config.default_params {
            params.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    fn merge_service_headers(&self, headers: &mut HashMap<String, String>) {
        for (key, value) in &self.config.default_headers {
            headers.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
}

/// Serialise one unified entry to the OpenAI wire shape.
fn wire_message(entry: &MessageEntry, developer_role: bool) -> Value {
    let role = match entry.role {
        Role::System => "system",
        Role::Developer => {
            if developer_role {
                "developer"
            } else {
                "system"
            }
        }
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    match entry.role {
        Role::Assistant if !entry.tool_calls.is_empty() => {
            let tool_calls: Vec<Value> = entry
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
            json!({
                "role": role,
                "content": Value::Null,
                "tool_calls": tool_calls,
            })
        }
        Role::Tool => json!({
            "role": role,
            "tool_call_id": entry.tool_call_id.clone().unwrap_or_default(),
            "content": entry.content.as_text(),
        }),
        _ => json!({
            "role": role,
            "content": wire_content(&entry.content),
        }),
    }
}

/// Serialise message content: plain text stays a string, multi-part
/// content becomes the OpenAI content-part array.
fn wire_content(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(text) => Value::String(text.clone()),
        MessageContent::Parts(parts) => Value::Array(
            parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => json!({"type": "text", "text": text}),
                    ContentPart::ImageUrl { url } => {
                        json!({"type": "image_url", "image_url": {"url": url}})
                    }
                    ContentPart::Audio { data, format } => {
                        json!({"type": "input_audio", "input_audio": {"data": data, "format": format}})
                    }
                    ContentPart::Document { data, media_type } => {
                        json!({"type": "file", "file": {"file_data": data, "media_type": media_type}})
                    }
                })
                .collect(),
        ),
    }
}

/// Normalize an OpenAI-shaped chat response into the unified envelope.
pub(crate) fn parse_chat_response(provider: &str, raw: Value) -> ChatResponse {
    let model = raw.get("model").and_then(|m| m.as_str()).map(String::from);
    let usage = raw.get("usage").and_then(TokenUsage::from_openai_usage);
    let messages = raw
        .get("choices")
        .and_then(|c| c.as_array())
        .map(|choices| {
            choices
                .iter()
                .filter_map(|choice| choice.get("message"))
                .map(parse_choice_message)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    ChatResponse {
        raw,
        provider: provider.to_string(),
        model,
        messages,
        usage,
    }
}

fn parse_choice_message(message: &Value) -> MessageEntry {
    let content = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string();
    let tool_calls = message
        .get("tool_calls")
        .and_then(|tc| tc.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|tc| {
                    let id = tc.get("id")?.as_str()?.to_string();
                    let function = tc.get("function")?;
                    let name = function.get("name")?.as_str()?.to_string();
                    let args_str = function.get("arguments").and_then(|a| a.as_str()).unwrap_or("{}");
                    let arguments: Value =
                        serde_json::from_str(args_str).unwrap_or(Value::Object(Map::new()));
                    Some(ToolCall { id, name, arguments })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    MessageEntry {
        role: Role::Assistant,
        content: MessageContent::Text(content),
        tool_call_id: None,
        tool_calls,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_message_serialises_tool_roundtrip() {
        let assistant = MessageEntry {
            role: Role::Assistant,
            content: MessageContent::Text(String::new()),
            tool_call_id: None,
            tool_calls: vec![ToolCall {
                id: "call_1".into(),
                name: "get_weather".into(),
                arguments: json!({"location": "Kansas City"}),
            }],
        };
        let wire = wire_message(&assistant, true);
        assert_eq!(wire["content"], Value::Null);
        assert_eq!(wire["tool_calls"][0]["function"]["name"], json!("get_weather"));

        let mut result = MessageEntry::new(Role::Tool, "85");
        result.tool_call_id = Some("call_1".into());
        let wire = wire_message(&result, true);
        assert_eq!(wire["role"], json!("tool"));
        assert_eq!(wire["tool_call_id"], json!("call_1"));
    }

    #[test]
    fn developer_role_downgrades_when_unsupported() {
        let entry = MessageEntry::new(Role::Developer, "be careful");
        assert_eq!(wire_message(&entry, true)["role"], json!("developer"));
        assert_eq!(wire_message(&entry, false)["role"], json!("system"));
    }

    #[test]
    fn parse_chat_response_extracts_tool_calls_and_usage() {
        let raw = json!({
            "model": "gpt-4o-mini",
            "choices": [{"message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{
                    "id": "call_9",
                    "type": "function",
                    "function": {"name": "search", "arguments": "{\"q\": \"rust\"}"}
                }]
            }}],
            "usage": {"prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10}
        });
        let response = parse_chat_response("openai", raw);
        assert!(response.has_tool_calls());
        assert_eq!(response.tool_calls()[0].arguments["q"], json!("rust"));
        assert_eq!(response.usage.as_ref().unwrap().total_tokens, 10);
    }

    #[test]
    fn profile_capabilities_match_the_matrix() {
        assert!(profile_for("openai").supports_embeddings);
        assert!(!profile_for("perplexity").supports_embeddings);
        assert!(!profile_for("ollama").requires_key);
    }
}
