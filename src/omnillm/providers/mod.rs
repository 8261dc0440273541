//! Provider adapters.
//!
//! Each provider lives in its own file implementing the
//! [`Service`](crate::omnillm::service::Service) trait, plus an entry in
//! [`build_service`].  New providers do not require changes outside their
//! file and the registry entry.
//!
//! The OpenAI-compatible family (OpenAI, Grok, Groq, DeepSeek, Mistral,
//! OpenRouter, Perplexity, Ollama, HuggingFace) shares one adapter
//! parameterized by a [`openai_compat::ProviderProfile`]; Claude, Gemini,
//! Bedrock, Cohere, and Voyage each speak their native wire format.

pub mod bedrock;
pub mod claude;
pub mod cohere;
pub mod gemini;
pub mod openai_compat;
pub mod sse;
pub mod voyage;

use crate::omnillm::config::ProviderConfig;
use crate::omnillm::error::AiError;
use crate::omnillm::request::ChatRequest;
use crate::omnillm::service::Service;
use std::sync::Arc;

/// Construct the adapter for a provider name.
///
/// This is the provider registry: every routable name appears here, and
/// nowhere else outside the provider's own file.
pub fn build_service(
    provider: &str,
    config: &ProviderConfig,
) -> Result<Arc<dyn Service>, AiError> {
    match provider {
        "openai" | "grok" | "groq" | "deepseek" | "mistral" | "openrouter" | "perplexity"
        | "ollama" | "huggingface" => Ok(Arc::new(openai_compat::OpenAiCompatService::new(
            provider, config,
        ))),
        "claude" | "anthropic" => Ok(Arc::new(claude::ClaudeService::new(config))),
        "gemini" => Ok(Arc::new(gemini::GeminiService::new(config))),
        "bedrock" => Ok(Arc::new(bedrock::BedrockService::new(config))),
        "cohere" => Ok(Arc::new(cohere::CohereService::new(config))),
        "voyage" => Ok(Arc::new(voyage::VoyageService::new(config))),
        other => Err(AiError::InvalidArgument(format!(
            "unknown provider '{}'",
            other
        ))),
    }
}

/// Log an outgoing request body according to the request's logging options.
pub(crate) fn log_request_payload(provider: &str, request: &ChatRequest, body: &serde_json::Value) {
    if request.options.log_request && log::log_enabled!(log::Level::Info) {
        log::info!("[{}] request: {}", provider, body);
    }
    if request.options.log_request_to_console {
        println!("[{}] request: {}", provider, body);
    }
}

/// Log a raw response body according to the request's logging options.
pub(crate) fn log_response_payload(provider: &str, request: &ChatRequest, body: &str) {
    if request.options.log_response && log::log_enabled!(log::Level::Info) {
        log::info!("[{}] response: {}", provider, body);
    }
    if request.options.log_response_to_console {
        println!("[{}] response: {}", provider, body);
    }
}

/// System directive appended for providers without native structured
/// output.  Instructs the model to answer with JSON conforming to the
/// schema, nothing else.
pub(crate) fn schema_directive(schema: &crate::omnillm::structured::StructSchema) -> String {
    format!(
        "Respond ONLY with a JSON {} conforming to this JSON schema, with no surrounding prose or code fences:\n{}",
        if schema.many { "array" } else { "object" },
        schema.to_json_schema()
    )
}

/// Parse a `Retry-After` header value into seconds.
pub(crate) fn parse_retry_after(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}
