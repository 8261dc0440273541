//! Request envelopes for chat and embedding calls.
//!
//! A [`ChatRequest`] bundles everything a provider adapter needs: messages,
//! model, per-call params, options, and headers.  Requests are created per
//! call, mutated only during their own assembly phase, and dropped at
//! response emission.  Merging helpers implement the layering rule used
//! throughout the crate: provider-wide defaults first, per-call overrides
//! win.

use crate::omnillm::event::TenantContext;
use crate::omnillm::message::{ChatMessage, MessageEntry};
use crate::omnillm::structured::StructSchema;
use std::collections::HashMap;

/// Post-processing selector applied to provider responses.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ReturnFormat {
    /// Content string of the first assistant choice.
    #[default]
    Single,
    /// Array of assistant messages.
    All,
    /// Provider response as-is.
    Raw,
    /// Content parsed as JSON; invalid JSON is an error.
    Json,
    /// Content parsed as XML.
    Xml,
    /// Content populated into a structured-output schema.
    Schema(StructSchema),
}

/// Credential material for a provider call.
///
/// Most providers take a bearer-style API key; Bedrock substitutes an AWS
/// credential set signed per-request with SigV4.
#[derive(Debug, Clone, PartialEq)]
pub enum Credentials {
    /// A plain API key.
    Key(String),
    /// AWS credentials for Bedrock.
    Aws {
        /// IAM access key ID.
        access_key_id: String,
        /// IAM secret access key.
        secret_access_key: String,
        /// STS session token for temporary credentials.
        session_token: Option<String>,
        /// AWS region of the Bedrock runtime endpoint.
        region: String,
    },
}

impl Credentials {
    /// The plain key, when this is a `Key` credential.
    pub fn as_key(&self) -> Option<&str> {
        match self {
            Credentials::Key(key) => Some(key.as_str()),
            Credentials::Aws { .. } => None,
        }
    }
}

/// Per-call options carried alongside the params map.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Provider to route to; falls back to the module default.
    pub provider: Option<String>,
    /// Explicit credentials; first entry in the key-resolution order.
    pub credentials: Option<Credentials>,
    /// Response post-processing selector.
    pub return_format: Option<ReturnFormat>,
    /// HTTP deadline in seconds; defaults to [`DEFAULT_TIMEOUT_SECS`].
    pub timeout_secs: Option<u64>,
    /// Log the outgoing request via the `log` facade.
    pub log_request: bool,
    /// Echo the outgoing request to stdout.
    pub log_request_to_console: bool,
    /// Log the raw response via the `log` facade.
    pub log_response: bool,
    /// Echo the raw response to stdout.
    pub log_response_to_console: bool,
    /// Free-form tenant identifier.
    pub tenant_id: Option<String>,
    /// Owning user for multi-tenant memory scoping.
    pub user_id: Option<String>,
    /// Conversation within the user's scope.
    pub conversation_id: Option<String>,
    /// Caller-supplied metadata echoed into events and audit spans.
    pub usage_metadata: serde_json::Map<String, serde_json::Value>,
    /// Provider-specific pass-through options (e.g. Gemini safety settings).
    pub provider_options: serde_json::Map<String, serde_json::Value>,
}

/// Default request deadline, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

impl RequestOptions {
    /// The effective deadline for this call.
    pub fn timeout(&self) -> u64 {
        self.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)
    }

    /// Tenant metadata for event payloads.
    pub fn tenant(&self) -> TenantContext {
        TenantContext {
            user_id: self.user_id.clone(),
            conversation_id: self.conversation_id.clone(),
            tenant_id: self.tenant_id.clone(),
        }
    }

    /// Layer `override_opts` over `self`: any field set on the override
    /// replaces the base value; maps are merged key-wise with the override
    /// winning.
    pub fn merged_with(&self, override_opts: &RequestOptions) -> RequestOptions {
        let mut merged = self.clone();
        if override_opts.provider.is_some() {
            merged.provider = override_opts.provider.clone();
        }
        if override_opts.credentials.is_some() {
            merged.credentials = override_opts.credentials.clone();
        }
        if override_opts.return_format.is_some() {
            merged.return_format = override_opts.return_format.clone();
        }
        if override_opts.timeout_secs.is_some() {
            merged.timeout_secs = override_opts.timeout_secs;
        }
        merged.log_request |= override_opts.log_request;
        merged.log_request_to_console |= override_opts.log_request_to_console;
        merged.log_response |= override_opts.log_response;
        merged.log_response_to_console |= override_opts.log_response_to_console;
        if override_opts.tenant_id.is_some() {
            merged.tenant_id = override_opts.tenant_id.clone();
        }
        if override_opts.user_id.is_some() {
            merged.user_id = override_opts.user_id.clone();
        }
        if override_opts.conversation_id.is_some() {
            merged.conversation_id = override_opts.conversation_id.clone();
        }
        for (key, value) in &override_opts.usage_metadata {
            merged.usage_metadata.insert(key.clone(), value.clone());
        }
        for (key, value) in &override_opts.provider_options {
            merged.provider_options.insert(key.clone(), value.clone());
        }
        merged
    }
}

/// A fully assembled chat call.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Messages to send, in order.
    pub messages: Vec<MessageEntry>,
    /// Model identifier; the adapter substitutes its default when absent.
    pub model: Option<String>,
    /// Raw model parameters (temperature, max_tokens, tools, seed, ...).
    pub params: serde_json::Map<String, serde_json::Value>,
    /// Per-call options.
    pub options: RequestOptions,
    /// Extra HTTP headers for this call.
    pub headers: HashMap<String, String>,
    /// The original builder the messages came from, kept for traceability.
    pub source: Option<ChatMessage>,
}

impl ChatRequest {
    /// Build a request from a rendered [`ChatMessage`].
    pub fn from_message(message: ChatMessage) -> Self {
        let rendered = message.render();
        ChatRequest {
            messages: rendered.entries().to_vec(),
            source: Some(message),
            ..Default::default()
        }
    }

    /// Set the model identifier.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Merge a params map into the request; existing keys are overwritten.
    pub fn with_params(mut self, params: serde_json::Map<String, serde_json::Value>) -> Self {
        merge_params(&mut self.params, &params);
        self
    }

    /// Replace the request options.
    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    /// Merge a header map into the request; existing keys are overwritten.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        merge_headers(&mut self.headers, &headers);
        self
    }

    /// The effective return format (default [`ReturnFormat::Single`]).
    pub fn return_format(&self) -> ReturnFormat {
        self.options.return_format.clone().unwrap_or_default()
    }
}

/// Layer `overrides` into `base`; override entries win.
pub fn merge_params(
    base: &mut serde_json::Map<String, serde_json::Value>,
    overrides: &serde_json::Map<String, serde_json::Value>,
) {
    for (key, value) in overrides {
        base.insert(key.clone(), value.clone());
    }
}

/// Layer `overrides` into `base`; override entries win.
pub fn merge_headers(base: &mut HashMap<String, String>, overrides: &HashMap<String, String>) {
    for (key, value) in overrides {
        base.insert(key.clone(), value.clone());
    }
}

/// Input for an embedding call: one string or a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum EmbeddingInput {
    /// A single text.
    Single(String),
    /// A batch of texts embedded in one call.
    Batch(Vec<String>),
}

impl EmbeddingInput {
    /// View the input as a slice of texts.
    pub fn texts(&self) -> Vec<&str> {
        match self {
            EmbeddingInput::Single(text) => vec![text.as_str()],
            EmbeddingInput::Batch(texts) => texts.iter().map(|t| t.as_str()).collect(),
        }
    }

    /// Number of texts in the input.
    pub fn len(&self) -> usize {
        match self {
            EmbeddingInput::Single(_) => 1,
            EmbeddingInput::Batch(texts) => texts.len(),
        }
    }

    /// True for an empty batch.
    pub fn is_empty(&self) -> bool {
        matches!(self, EmbeddingInput::Batch(texts) if texts.is_empty())
    }
}

impl From<&str> for EmbeddingInput {
    fn from(value: &str) -> Self {
        EmbeddingInput::Single(value.to_string())
    }
}

impl From<String> for EmbeddingInput {
    fn from(value: String) -> Self {
        EmbeddingInput::Single(value)
    }
}

impl From<Vec<String>> for EmbeddingInput {
    fn from(value: Vec<String>) -> Self {
        EmbeddingInput::Batch(value)
    }
}

/// Post-processing selector for embedding responses.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum EmbeddingReturnFormat {
    /// Provider response as-is.
    Raw,
    /// The vectors: one `Vec<f32>` per input.
    #[default]
    Embeddings,
    /// The first vector only.
    First,
}

/// A fully assembled embedding call.
#[derive(Debug, Clone)]
pub struct EmbeddingRequest {
    /// Text(s) to embed.
    pub input: EmbeddingInput,
    /// Model identifier; the adapter substitutes its default when absent.
    pub model: Option<String>,
    /// Raw model parameters (`input_type`, `dimensions`, ...).
    pub params: serde_json::Map<String, serde_json::Value>,
    /// Provider routing and credentials, shared with chat options.
    pub options: RequestOptions,
    /// Response post-processing selector.
    pub return_format: EmbeddingReturnFormat,
}

impl EmbeddingRequest {
    /// Build a request for the given input with default options.
    pub fn new(input: impl Into<EmbeddingInput>) -> Self {
        EmbeddingRequest {
            input: input.into(),
            model: None,
            params: serde_json::Map::new(),
            options: RequestOptions::default(),
            return_format: EmbeddingReturnFormat::default(),
        }
    }

    /// Set the model identifier.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Replace the request options.
    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn options_layering_override_wins() {
        let base = RequestOptions {
            provider: Some("openai".into()),
            timeout_secs: Some(10),
            ..Default::default()
        };
        let overrides = RequestOptions {
            provider: Some("claude".into()),
            user_id: Some("u1".into()),
            ..Default::default()
        };
        let merged = base.merged_with(&overrides);
        assert_eq!(merged.provider.as_deref(), Some("claude"));
        assert_eq!(merged.timeout_secs, Some(10));
        assert_eq!(merged.user_id.as_deref(), Some("u1"));
    }

    #[test]
    fn params_merge_overwrites_existing_keys() {
        let mut base = serde_json::Map::new();
        base.insert("temperature".into(), json!(0.2));
        base.insert("seed".into(), json!(7));
        let mut overrides = serde_json::Map::new();
        overrides.insert("temperature".into(), json!(0.9));
        merge_params(&mut base, &overrides);
        assert_eq!(base["temperature"], json!(0.9));
        assert_eq!(base["seed"], json!(7));
    }

    #[test]
    fn request_from_message_renders_bindings() {
        let msg = crate::omnillm::message::ChatMessage::new()
            .user("hi ${name}")
            .bind([("name", "there")]);
        let request = ChatRequest::from_message(msg);
        assert_eq!(request.messages[0].content.as_text(), "hi there");
        assert!(request.source.is_some());
    }

    #[test]
    fn default_timeout_is_thirty_seconds() {
        assert_eq!(RequestOptions::default().timeout(), 30);
    }
}
