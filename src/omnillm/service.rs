//! Shared primitives for provider-agnostic LLM services.
//!
//! Applications typically interact with OmniLLM through the [`Service`]
//! trait and the lightweight data types defined in this module.  The trait
//! abstracts over concrete vendor implementations while the supporting
//! structs describe normalized responses, streaming callbacks, and token
//! accounting.
//!
//! Services are process-wide singletons: [`service`] returns the same
//! instance for the same `(provider, config)` pair, where the config part
//! of the key is a SHA-256 digest of the canonical config fields.
//!
//! # Basic request/response
//!
//! ```rust,no_run
//! use omnillm::omnillm::service::service;
//! use omnillm::omnillm::config::ProviderConfig;
//! use omnillm::{ChatMessage, ChatRequest};
//!
//! # async fn run() -> Result<(), omnillm::AiError> {
//! let svc = service("openai", &ProviderConfig::default())?;
//! let request = ChatRequest::from_message(ChatMessage::new().user("Who are you?"));
//! let response = svc.invoke(&request).await?;
//! println!("{}", response.first_text().unwrap_or_default());
//! # Ok(())
//! # }
//! ```

use crate::omnillm::config::ProviderConfig;
use crate::omnillm::error::AiError;
use crate::omnillm::event::{emit, AiEvent};
use crate::omnillm::message::{MessageEntry, ToolCall};
use crate::omnillm::request::{
    ChatRequest, Credentials, EmbeddingRequest, EmbeddingReturnFormat, ReturnFormat,
};
use crate::omnillm::structured::populate;
use lazy_static::lazy_static;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

/// How many tokens were spent on prompt vs. completion?
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TokenUsage {
    /// Number of prompt/input tokens billed by the provider.
    pub prompt_tokens: usize,
    /// Number of generated/output tokens billed by the provider.
    pub completion_tokens: usize,
    /// Convenience total equal to `prompt_tokens + completion_tokens`.
    pub total_tokens: usize,
}

impl TokenUsage {
    /// Sum two usage reports.
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }

    /// Parse an OpenAI-style `usage` object (`prompt_tokens` /
    /// `completion_tokens`), which several providers emit verbatim.
    pub fn from_openai_usage(usage: &Value) -> Option<TokenUsage> {
        let prompt = usage.get("prompt_tokens")?.as_u64()? as usize;
        let completion = usage
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
        Some(TokenUsage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
        })
    }
}

/// Normalized chat response envelope.
///
/// `raw` carries the provider response exactly as received (the
/// `ReturnFormat::Raw` value).  `messages` carries the assistant messages in
/// the unified shape so return-format transformation does not need to know
/// provider wire formats.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Provider response as-is.
    pub raw: Value,
    /// Provider that produced the response.
    pub provider: String,
    /// Model that answered, when the provider reports it.
    pub model: Option<String>,
    /// Assistant messages in the unified shape, in choice order.
    pub messages: Vec<MessageEntry>,
    /// Token accounting, when the provider reports it.
    pub usage: Option<TokenUsage>,
}

impl ChatResponse {
    /// Content text of the first assistant message.
    pub fn first_text(&self) -> Option<String> {
        self.messages.first().map(|m| m.content.as_text())
    }

    /// Tool calls requested by the first assistant message.
    pub fn tool_calls(&self) -> &[ToolCall] {
        self.messages
            .first()
            .map(|m| m.tool_calls.as_slice())
            .unwrap_or(&[])
    }

    /// True when the model requested at least one tool call.
    pub fn has_tool_calls(&self) -> bool {
        self.messages.iter().any(|m| !m.tool_calls.is_empty())
    }
}

/// Normalized embedding response envelope.
#[derive(Debug, Clone)]
pub struct EmbeddingResponse {
    /// Provider response as-is.
    pub raw: Value,
    /// One vector per input, in input order.
    pub vectors: Vec<Vec<f32>>,
    /// Token accounting, when the provider reports it.
    pub usage: Option<TokenUsage>,
}

impl EmbeddingResponse {
    /// Apply the embedding return format.
    pub fn into_format(self, format: EmbeddingReturnFormat) -> Value {
        match format {
            EmbeddingReturnFormat::Raw => self.raw,
            EmbeddingReturnFormat::Embeddings => serde_json::to_value(&self.vectors)
                .unwrap_or(Value::Array(Vec::new())),
            EmbeddingReturnFormat::First => self
                .vectors
                .into_iter()
                .next()
                .map(|v| serde_json::to_value(v).unwrap_or(Value::Array(Vec::new())))
                .unwrap_or(Value::Array(Vec::new())),
        }
    }
}

/// Callback receiving provider-native streaming chunks.
///
/// One call per decoded SSE/event-stream fragment.  The chunk shape is
/// provider-native by design; [`extract_delta_text`] recognizes the common
/// shapes when only the text delta matters.  The callback runs on the task
/// decoding the stream, so long-running work blocks further chunks.
pub type ChunkCallback<'a> = &'a mut (dyn FnMut(Value) + Send);

/// Trait-driven abstraction for a concrete LLM provider.
///
/// A [`Service`] instance translates unified requests into the provider's
/// wire format and returns responses in the [`ChatResponse`] envelope.  All
/// implementations must be thread-safe (`Send + Sync`) so they can be
/// shared between async tasks; per-call state lives in the request.
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    /// Registry name of the provider (e.g. `"openai"`).
    fn name(&self) -> &str;

    /// Send a full request/response style chat completion.
    ///
    /// When the provider returns tool calls, the response is returned
    /// unchanged; the agent loop (or `chat` with tools) detects them and
    /// dispatches.
    async fn invoke(&self, request: &ChatRequest) -> Result<ChatResponse, AiError>;

    /// Stream a chat completion, delivering provider-native chunks.
    ///
    /// Errors after the first chunk are delivered as a terminal chunk
    /// carrying an `error` field, then the stream closes.
    async fn invoke_stream(
        &self,
        request: &ChatRequest,
        on_chunk: ChunkCallback<'_>,
    ) -> Result<(), AiError>;

    /// Generate embeddings.
    ///
    /// Providers without an embedding surface fail with
    /// [`AiError::Unsupported`].
    async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse, AiError>;

    /// Layer provider-wide default params under the request's params.
    fn merge_service_params(&self, _params: &mut serde_json::Map<String, Value>) {}

    /// Layer provider-wide default headers under the request's headers.
    fn merge_service_headers(&self, _headers: &mut HashMap<String, String>) {}
}

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    ///
    /// A single client keeps TLS sessions and DNS lookups warm, which
    /// matters when many concurrent requests hit upstream providers.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };

    static ref SERVICES: RwLock<HashMap<String, Arc<dyn Service>>> = RwLock::new(HashMap::new());

    static ref CUSTOM_SERVICES: RwLock<HashMap<String, Arc<dyn Service>>> =
        RwLock::new(HashMap::new());
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Resolve (or construct) the process-wide service for a provider.
///
/// The registry key is `(provider, sha256(canonical config))`, so two calls
/// with the same provider and config return the same instance, while a
/// different API key or base URL yields a distinct one.  Custom services
/// registered via [`register_service`] take precedence over the built-in
/// adapters.
pub fn service(provider: &str, config: &ProviderConfig) -> Result<Arc<dyn Service>, AiError> {
    if let Ok(guard) = CUSTOM_SERVICES.read() {
        if let Some(custom) = guard.get(provider) {
            return Ok(custom.clone());
        }
    }
    let key = format!("{}:{}", provider, config_hash(provider, config));
    if let Ok(guard) = SERVICES.read() {
        if let Some(existing) = guard.get(&key) {
            return Ok(existing.clone());
        }
    }
    let built = crate::omnillm::providers::build_service(provider, config)?;
    let mut guard = SERVICES
        .write()
        .map_err(|_| AiError::ConfigMissing("service registry lock poisoned".into()))?;
    // Another task may have built it while we were constructing.
    let entry = guard.entry(key).or_insert(built);
    Ok(entry.clone())
}

/// Register a custom [`Service`] under a provider name.
///
/// Subsequent [`service`] lookups for that name return this instance,
/// shadowing any built-in adapter.  This is the extension point for
/// out-of-tree providers (and for stubbed providers in tests).
pub fn register_service(provider: &str, custom: Arc<dyn Service>) {
    if let Ok(mut guard) = CUSTOM_SERVICES.write() {
        guard.insert(provider.to_string(), custom);
    }
}

fn config_hash(provider: &str, config: &ProviderConfig) -> String {
    let mut hasher = Sha256::new();
    hasher.update(provider.as_bytes());
    if let Some(creds) = &config.credentials {
        match creds {
            Credentials::Key(key) => hasher.update(key.as_bytes()),
            Credentials::Aws {
                access_key_id,
                secret_access_key,
                session_token,
                region,
            } => {
                hasher.update(access_key_id.as_bytes());
                hasher.update(secret_access_key.as_bytes());
                if let Some(token) = session_token {
                    hasher.update(token.as_bytes());
                }
                hasher.update(region.as_bytes());
            }
        }
    }
    if let Some(base_url) = &config.base_url {
        hasher.update(base_url.as_bytes());
    }
    if let Some(model) = &config.default_model {
        hasher.update(model.as_bytes());
    }
    hasher.update(serde_json::to_string(&config.default_params).unwrap_or_default());
    hex::encode(hasher.finalize())
}

/// Environment variable carrying the convention API key for a provider.
pub fn convention_env_var(provider: &str) -> String {
    format!("{}_API_KEY", provider.to_ascii_uppercase())
}

/// Resolve credentials for a call, in order: request options → provider
/// config block → `<PROVIDER>_API_KEY` environment variable → empty.
///
/// Bedrock resolves an AWS credential struct instead (see
/// [`resolve_aws_credentials`]).  Providers that require a key call
/// [`require_key`] on the result at invoke time.
pub fn resolve_credentials(
    provider: &str,
    request_credentials: Option<&Credentials>,
    config: &ProviderConfig,
) -> Option<Credentials> {
    if let Some(creds) = request_credentials {
        return Some(creds.clone());
    }
    if let Some(creds) = &config.credentials {
        return Some(creds.clone());
    }
    std::env::var(convention_env_var(provider))
        .ok()
        .filter(|v| !v.is_empty())
        .map(Credentials::Key)
}

/// Resolve AWS credentials for Bedrock from request options, config, or the
/// `AWS_*` environment variables.
pub fn resolve_aws_credentials(
    request_credentials: Option<&Credentials>,
    config: &ProviderConfig,
) -> Result<Credentials, AiError> {
    for candidate in [request_credentials, config.credentials.as_ref()]
        .into_iter()
        .flatten()
    {
        if matches!(candidate, Credentials::Aws { .. }) {
            return Ok(candidate.clone());
        }
    }
    let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").ok().filter(|v| !v.is_empty());
    let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
        .ok()
        .filter(|v| !v.is_empty());
    match (access_key_id, secret_access_key) {
        (Some(access_key_id), Some(secret_access_key)) => Ok(Credentials::Aws {
            access_key_id,
            secret_access_key,
            session_token: std::env::var("AWS_SESSION_TOKEN").ok().filter(|v| !v.is_empty()),
            region: std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
        }),
        _ => Err(AiError::ConfigMissing(
            "no AWS credentials resolvable for bedrock (set AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY)"
                .into(),
        )),
    }
}

/// Extract the plain key from resolved credentials, failing with
/// [`AiError::ConfigMissing`] when none is available.
pub fn require_key(provider: &str, credentials: Option<Credentials>) -> Result<String, AiError> {
    match credentials {
        Some(Credentials::Key(key)) if !key.is_empty() => Ok(key),
        _ => Err(AiError::ConfigMissing(format!(
            "no API key resolvable for provider '{}' (set {} or pass options.credentials)",
            provider,
            convention_env_var(provider)
        ))),
    }
}

/// Classify a non-success provider response and emit the rate-limit event
/// when applicable.  `retry_after` comes from the `Retry-After` header.
pub async fn provider_error(
    provider: &str,
    status: u16,
    body: &str,
    retry_after: Option<u64>,
) -> AiError {
    if status == 429 {
        emit(AiEvent::RateLimitHit {
            provider: provider.to_string(),
            status_code: status,
            retry_after,
        })
        .await;
        return AiError::RateLimited {
            provider: provider.to_string(),
            retry_after,
        };
    }
    match serde_json::from_str::<Value>(body) {
        Ok(decoded) => {
            let message = decoded
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .or_else(|| decoded.get("message").and_then(|m| m.as_str()))
                .unwrap_or(body)
                .to_string();
            AiError::Provider { status, message }
        }
        Err(_) => AiError::Protocol(format!("HTTP {} with non-JSON body: {}", status, body)),
    }
}

/// Map a transport-level failure to the error taxonomy, attaching the
/// configured deadline to timeouts.
pub fn transport_error(err: reqwest::Error, timeout_secs: u64) -> AiError {
    if err.is_timeout() {
        AiError::Timeout {
            seconds: timeout_secs,
        }
    } else {
        AiError::from(err)
    }
}

/// Apply a [`ReturnFormat`] to a normalized response.
///
/// | Format | Output |
/// |---|---|
/// | `Single` | string content of the first assistant message |
/// | `All` | array of assistant messages (unified shape) |
/// | `Raw` | the provider response as-is |
/// | `Json` | first content parsed as JSON |
/// | `Xml` | first content parsed as XML |
/// | `Schema(s)` | first content parsed as JSON, then populated into `s` |
///
/// Responses carrying tool calls are not transformed by the chat surface;
/// callers check [`ChatResponse::has_tool_calls`] first.
pub fn transform_response(response: &ChatResponse, format: &ReturnFormat) -> Result<Value, AiError> {
    match format {
        ReturnFormat::Single => Ok(Value::String(response.first_text().unwrap_or_default())),
        ReturnFormat::All => serde_json::to_value(&response.messages)
            .map_err(|e| AiError::Protocol(format!("message serialization failed: {}", e))),
        ReturnFormat::Raw => Ok(response.raw.clone()),
        ReturnFormat::Json => {
            let text = response.first_text().unwrap_or_default();
            serde_json::from_str(strip_code_fences(&text))
                .map_err(|e| AiError::Protocol(format!("response is not valid JSON: {}", e)))
        }
        ReturnFormat::Xml => {
            let text = response.first_text().unwrap_or_default();
            xml_to_value(&text)
        }
        ReturnFormat::Schema(schema) => {
            let text = response.first_text().unwrap_or_default();
            let parsed: Value = serde_json::from_str(strip_code_fences(&text))
                .map_err(|e| AiError::SchemaViolation(format!("response is not valid JSON: {}", e)))?;
            populate(schema, &parsed)
        }
    }
}

/// Strip a surrounding Markdown code fence, which models add around JSON
/// despite instructions.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```xml"))
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

/// Parse an XML document into a JSON value.
///
/// Elements become objects keyed by child tag (repeated tags collect into
/// arrays), attributes are stored under `@name`, and text-only elements
/// become strings.
pub fn xml_to_value(text: &str) -> Result<Value, AiError> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let source = strip_code_fences(text);
    let mut reader = Reader::from_str(source);
    reader.config_mut().trim_text(true);

    // Stack of (tag, object-under-construction, text accumulator).
    let mut stack: Vec<(String, serde_json::Map<String, Value>, String)> = Vec::new();
    let mut root: Option<(String, Value)> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                let tag = String::from_utf8_lossy(start.name().as_ref()).to_string();
                let mut object = serde_json::Map::new();
                for attr in start.attributes().flatten() {
                    let key = format!("@{}", String::from_utf8_lossy(attr.key.as_ref()));
                    let value = String::from_utf8_lossy(&attr.value).to_string();
                    object.insert(key, Value::String(value));
                }
                stack.push((tag, object, String::new()));
            }
            Ok(Event::Text(text)) => {
                if let Some((_, _, accumulator)) = stack.last_mut() {
                    accumulator.push_str(&text.unescape().map_err(|e| {
                        AiError::Protocol(format!("XML text decode failed: {}", e))
                    })?);
                }
            }
            Ok(Event::End(_)) => {
                let (tag, object, text) = stack.pop().ok_or_else(|| {
                    AiError::Protocol("unbalanced XML end tag".into())
                })?;
                let value = if object.is_empty() && !text.is_empty() {
                    Value::String(text)
                } else {
                    let mut object = object;
                    if !text.is_empty() {
                        object.insert("#text".into(), Value::String(text));
                    }
                    Value::Object(object)
                };
                match stack.last_mut() {
                    Some((_, parent, _)) => insert_xml_child(parent, tag, value),
                    None => root = Some((tag, value)),
                }
            }
            Ok(Event::Empty(start)) => {
                let tag = String::from_utf8_lossy(start.name().as_ref()).to_string();
                let mut object = serde_json::Map::new();
                for attr in start.attributes().flatten() {
                    let key = format!("@{}", String::from_utf8_lossy(attr.key.as_ref()));
                    let value = String::from_utf8_lossy(&attr.value).to_string();
                    object.insert(key, Value::String(value));
                }
                let value = Value::Object(object);
                match stack.last_mut() {
                    Some((_, parent, _)) => insert_xml_child(parent, tag, value),
                    None => root = Some((tag, value)),
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(AiError::Protocol(format!("XML parse failed: {}", e))),
        }
    }

    match root {
        Some((tag, value)) => {
            let mut wrapper = serde_json::Map::new();
            wrapper.insert(tag, value);
            Ok(Value::Object(wrapper))
        }
        None => Err(AiError::Protocol("response contains no XML element".into())),
    }
}

fn insert_xml_child(parent: &mut serde_json::Map<String, Value>, tag: String, value: Value) {
    match parent.get_mut(&tag) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            parent.insert(tag, value);
        }
    }
}

/// Extract the text delta from a provider-native streaming chunk.
///
/// Chunk shapes are deliberately not unified; this helper detects the
/// OpenAI (`choices[].delta.content`), Claude (`delta.text`), and Gemini
/// (`candidates[].content.parts[].text`) shapes for consumers that only
/// want the text.
pub fn extract_delta_text(chunk: &Value) -> Option<String> {
    if let Some(text) = chunk
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
    {
        return Some(text.to_string());
    }
    if let Some(text) = chunk
        .get("delta")
        .and_then(|d| d.get("text"))
        .and_then(|t| t.as_str())
    {
        return Some(text.to_string());
    }
    chunk
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.get(0))
        .and_then(|p| p.get("text"))
        .and_then(|t| t.as_str())
        .map(|s| s.to_string())
}

/// Terminal chunk delivered when a stream fails after the first chunk.
pub fn error_chunk(message: &str) -> Value {
    serde_json::json!({ "error": message })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::omnillm::message::{MessageContent, Role};
    use serde_json::json;

    fn response_with_text(text: &str) -> ChatResponse {
        ChatResponse {
            raw: json!({"choices": [{"message": {"role": "assistant", "content": text}}]}),
            provider: "stub".into(),
            model: Some("stub-1".into()),
            messages: vec![MessageEntry::new(Role::Assistant, text)],
            usage: None,
        }
    }

    #[test]
    fn single_all_raw_agree() {
        let response = response_with_text("hello");
        let single = transform_response(&response, &ReturnFormat::Single).unwrap();
        let all = transform_response(&response, &ReturnFormat::All).unwrap();
        let raw = transform_response(&response, &ReturnFormat::Raw).unwrap();
        assert_eq!(single, json!("hello"));
        assert_eq!(all[0]["content"], json!("hello"));
        assert_eq!(raw["choices"][0]["message"]["content"], json!("hello"));
    }

    #[test]
    fn json_format_rejects_invalid_json() {
        let response = response_with_text("this is prose, not JSON");
        let err = transform_response(&response, &ReturnFormat::Json).unwrap_err();
        assert!(matches!(err, AiError::Protocol(_)));
    }

    #[test]
    fn json_format_strips_code_fences() {
        let response = response_with_text("```json\n{\"a\": 1}\n```");
        let value = transform_response(&response, &ReturnFormat::Json).unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn xml_format_parses_elements_attributes_and_repeats() {
        let response = response_with_text(
            "<order id=\"7\"><item>apple</item><item>pear</item><note/></order>",
        );
        let value = transform_response(&response, &ReturnFormat::Xml).unwrap();
        assert_eq!(value["order"]["@id"], json!("7"));
        assert_eq!(value["order"]["item"], json!(["apple", "pear"]));
    }

    #[test]
    fn delta_extraction_detects_all_shapes() {
        let openai = json!({"choices": [{"delta": {"content": "a"}}]});
        let claude = json!({"type": "content_block_delta", "delta": {"text": "b"}});
        let gemini = json!({"candidates": [{"content": {"parts": [{"text": "c"}]}}]});
        assert_eq!(extract_delta_text(&openai).as_deref(), Some("a"));
        assert_eq!(extract_delta_text(&claude).as_deref(), Some("b"));
        assert_eq!(extract_delta_text(&gemini).as_deref(), Some("c"));
        assert_eq!(extract_delta_text(&json!({"other": true})), None);
    }

    #[test]
    fn usage_parsing_and_accumulation() {
        let usage = TokenUsage::from_openai_usage(&json!({
            "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15
        }))
        .unwrap();
        let mut total = TokenUsage::default();
        total.accumulate(&usage);
        total.accumulate(&usage);
        assert_eq!(total.total_tokens, 30);
    }

    #[test]
    fn convention_env_var_uppercases_provider() {
        assert_eq!(convention_env_var("deepseek"), "DEEPSEEK_API_KEY");
    }

    #[tokio::test]
    async fn provider_error_classifies_rate_limit() {
        let err = provider_error("openai", 429, "{}", Some(12)).await;
        assert!(matches!(
            err,
            AiError::RateLimited {
                retry_after: Some(12),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn provider_error_extracts_message() {
        let body = "{\"error\": {\"message\": \"model overloaded\"}}";
        let err = provider_error("openai", 503, body, None).await;
        match err {
            AiError::Provider { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "model overloaded");
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
