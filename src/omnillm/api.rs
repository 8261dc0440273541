//! Top-level operations: one-shot chat, streaming, async variants, and
//! embeddings.
//!
//! These functions wire the module configuration, provider dispatch,
//! events, and return-format transformation together so callers get the
//! one-line surface:
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), omnillm::AiError> {
//! let answer = omnillm::chat("What is the capital of Portugal?").await?;
//! # Ok(())
//! # }
//! ```
//!
//! Lifecycle events (`ChatRequested`/`ChatCompleted`, embed equivalents,
//! rate-limit hits, errors) are emitted on the global bus for every call.

use crate::omnillm::config::global_config;
use crate::omnillm::error::AiError;
use crate::omnillm::event::{emit, AiEvent};
use crate::omnillm::message::{ChatMessage, MessageContent, MessageEntry, Role};
use crate::omnillm::request::{merge_params, ChatRequest, EmbeddingRequest, RequestOptions};
use crate::omnillm::service::{service, transform_response, ChunkCallback, Service};
use crate::omnillm::tool::ToolRegistry;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Anything chat accepts as input.
pub enum ChatInput {
    /// A single `user` message.
    Text(String),
    /// A full conversation builder (bindings are rendered).
    Message(ChatMessage),
    /// Pre-built entries.
    Entries(Vec<MessageEntry>),
}

impl From<&str> for ChatInput {
    fn from(value: &str) -> Self {
        ChatInput::Text(value.to_string())
    }
}

impl From<String> for ChatInput {
    fn from(value: String) -> Self {
        ChatInput::Text(value)
    }
}

impl From<ChatMessage> for ChatInput {
    fn from(value: ChatMessage) -> Self {
        ChatInput::Message(value)
    }
}

impl From<Vec<MessageEntry>> for ChatInput {
    fn from(value: Vec<MessageEntry>) -> Self {
        ChatInput::Entries(value)
    }
}

impl ChatInput {
    fn into_entries(self) -> Vec<MessageEntry> {
        match self {
            ChatInput::Text(text) => vec![MessageEntry::new(Role::User, text)],
            ChatInput::Message(message) => message.render().into_entries(),
            ChatInput::Entries(entries) => entries,
        }
    }
}

/// Assemble the request: module defaults seeded first, call values win.
fn assemble_request(
    input: ChatInput,
    params: Map<String, Value>,
    options: RequestOptions,
    headers: HashMap<String, String>,
) -> ChatRequest {
    let module = global_config();
    let mut effective_params = module.default_params.clone();
    merge_params(&mut effective_params, &params);

    let mut base_options = RequestOptions {
        provider: Some(module.provider.clone()),
        credentials: module.credentials.clone(),
        return_format: Some(module.return_format.clone()),
        timeout_secs: Some(module.timeout_secs),
        log_request: module.log_request,
        log_request_to_console: module.log_request_to_console,
        log_response: module.log_response,
        log_response_to_console: module.log_response_to_console,
        ..Default::default()
    };
    base_options = base_options.merged_with(&options);

    ChatRequest {
        messages: input.into_entries(),
        model: None,
        params: effective_params,
        options: base_options,
        headers,
        source: None,
    }
}

fn resolve_service(request: &ChatRequest) -> Result<Arc<dyn Service>, AiError> {
    let module = global_config();
    let provider = request
        .options
        .provider
        .clone()
        .unwrap_or(module.provider.clone());
    service(&provider, &module.provider_config(&provider))
}

/// One-shot chat with default params, options, and headers.
///
/// The result follows the configured return format (default `single`, so a
/// plain string value).
pub async fn chat(input: impl Into<ChatInput>) -> Result<Value, AiError> {
    chat_with(input, Map::new(), RequestOptions::default(), HashMap::new()).await
}

/// One-shot chat with explicit params, options, and headers.
pub async fn chat_with(
    input: impl Into<ChatInput>,
    params: Map<String, Value>,
    options: RequestOptions,
    headers: HashMap<String, String>,
) -> Result<Value, AiError> {
    let request = assemble_request(input.into(), params, options, headers);
    let svc = resolve_service(&request)?;
    let response = invoke_with_events(&svc, &request).await?;
    let format = request.return_format();
    transform_response(&response, &format)
}

/// One-shot chat that dispatches tool calls before answering.
///
/// When the model requests tools, each call is executed against `tools`,
/// the results are appended as `tool` messages, and the model is invoked
/// again, up to `max_iterations` rounds.  Unknown tools and tool failures
/// become error-text results rather than aborting.
pub async fn chat_with_tools(
    input: impl Into<ChatInput>,
    tools: &ToolRegistry,
    params: Map<String, Value>,
    options: RequestOptions,
    max_iterations: usize,
) -> Result<Value, AiError> {
    let mut request = assemble_request(input.into(), params, options, HashMap::new());
    let schemas = tools.schemas();
    if !schemas.is_empty() {
        request.params.insert("tools".into(), Value::Array(schemas));
    }
    let svc = resolve_service(&request)?;

    let mut iterations = 0usize;
    loop {
        iterations += 1;
        let response = invoke_with_events(&svc, &request).await?;
        let tool_calls = response.tool_calls().to_vec();
        if tool_calls.is_empty() || iterations >= max_iterations.max(1) {
            let format = request.return_format();
            return transform_response(&response, &format);
        }

        let assistant_text = response.first_text().unwrap_or_default();
        request.messages.push(MessageEntry {
            role: Role::Assistant,
            content: MessageContent::Text(assistant_text),
            tool_call_id: None,
            tool_calls: tool_calls.clone(),
        });
        for call in &tool_calls {
            let arguments = call.arguments.as_object().cloned().unwrap_or_default();
            let started = Instant::now();
            emit(AiEvent::ToolExecutionStarted {
                agent: None,
                tool: call.name.clone(),
                arguments: call.arguments.clone(),
            })
            .await;
            let outcome = tools.execute(&call.name, arguments).await;
            let (text, success, error) = match outcome {
                Ok(text) => (text, true, None),
                Err(e) => (format!("Error: {}", e), false, Some(e.to_string())),
            };
            emit(AiEvent::ToolExecutionCompleted {
                agent: None,
                tool: call.name.clone(),
                success,
                error,
                duration_ms: started.elapsed().as_millis() as u64,
            })
            .await;
            let mut entry = MessageEntry::new(Role::Tool, text);
            entry.tool_call_id = Some(call.id.clone());
            request.messages.push(entry);
        }
    }
}

async fn invoke_with_events(
    svc: &Arc<dyn Service>,
    request: &ChatRequest,
) -> Result<crate::omnillm::service::ChatResponse, AiError> {
    emit(AiEvent::ChatRequested {
        provider: svc.name().to_string(),
        model: request.model.clone(),
        message_count: request.messages.len(),
        tenant: request.options.tenant(),
    })
    .await;
    let started = Instant::now();
    match svc.invoke(request).await {
        Ok(response) => {
            emit(AiEvent::ChatCompleted {
                provider: svc.name().to_string(),
                model: response.model.clone(),
                usage: response.usage.clone(),
                duration_ms: started.elapsed().as_millis() as u64,
                tenant: request.options.tenant(),
            })
            .await;
            Ok(response)
        }
        Err(e) => {
            emit(AiEvent::ErrorRaised {
                operation: "chat".into(),
                message: e.to_string(),
            })
            .await;
            Err(e)
        }
    }
}

/// Streaming chat: provider-native chunks are delivered through
/// `on_chunk`; the function resolves when the stream closes.
pub async fn chat_stream(
    input: impl Into<ChatInput>,
    on_chunk: ChunkCallback<'_>,
    params: Map<String, Value>,
    options: RequestOptions,
    headers: HashMap<String, String>,
) -> Result<(), AiError> {
    let request = assemble_request(input.into(), params, options, headers);
    let svc = resolve_service(&request)?;
    emit(AiEvent::ChatRequested {
        provider: svc.name().to_string(),
        model: request.model.clone(),
        message_count: request.messages.len(),
        tenant: request.options.tenant(),
    })
    .await;
    let started = Instant::now();
    let result = svc.invoke_stream(&request, on_chunk).await;
    match &result {
        Ok(()) => {
            emit(AiEvent::ChatCompleted {
                provider: svc.name().to_string(),
                model: request.model.clone(),
                usage: None,
                duration_ms: started.elapsed().as_millis() as u64,
                tenant: request.options.tenant(),
            })
            .await;
        }
        Err(e) => {
            emit(AiEvent::ErrorRaised {
                operation: "chatStream".into(),
                message: e.to_string(),
            })
            .await;
        }
    }
    result
}

/// Asynchronous chat: the synchronous path wrapped in a spawned task.
pub fn chat_async(
    input: impl Into<ChatInput>,
    params: Map<String, Value>,
    options: RequestOptions,
    headers: HashMap<String, String>,
) -> tokio::task::JoinHandle<Result<Value, AiError>> {
    let input = input.into();
    tokio::spawn(async move { chat_with(input, params, options, headers).await })
}

/// Generate embeddings with default options.
///
/// The default return format yields the vectors: one array for a single
/// input, an array of arrays for a batch.
pub async fn embed(
    input: impl Into<crate::omnillm::request::EmbeddingInput>,
) -> Result<Value, AiError> {
    embed_with(EmbeddingRequest::new(input)).await
}

/// Generate embeddings from a fully specified request.
pub async fn embed_with(request: EmbeddingRequest) -> Result<Value, AiError> {
    let module = global_config();
    let provider = request
        .options
        .provider
        .clone()
        .unwrap_or(module.provider.clone());
    let svc = service(&provider, &module.provider_config(&provider))?;

    emit(AiEvent::EmbedRequested {
        provider: svc.name().to_string(),
        input_count: request.input.len(),
    })
    .await;
    let started = Instant::now();
    match svc.embed(&request).await {
        Ok(response) => {
            emit(AiEvent::EmbedCompleted {
                provider: svc.name().to_string(),
                vector_count: response.vectors.len(),
                duration_ms: started.elapsed().as_millis() as u64,
            })
            .await;
            let single = matches!(
                request.input,
                crate::omnillm::request::EmbeddingInput::Single(_)
            );
            let format = request.return_format;
            let value = response.into_format(format);
            // A single input with the default format unwraps to one vector.
            match (single, format, value) {
                (
                    true,
                    crate::omnillm::request::EmbeddingReturnFormat::Embeddings,
                    Value::Array(mut vectors),
                ) => Ok(vectors.pop().unwrap_or(Value::Array(Vec::new()))),
                (_, _, value) => Ok(value),
            }
        }
        Err(e) => {
            emit(AiEvent::ErrorRaised {
                operation: "embed".into(),
                message: e.to_string(),
            })
            .await;
            Err(e)
        }
    }
}

