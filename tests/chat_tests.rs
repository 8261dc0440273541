use async_trait::async_trait;
use omnillm::omnillm::message::MessageEntry;
use omnillm::omnillm::request::{EmbeddingRequest, RequestOptions, ReturnFormat};
use omnillm::omnillm::service::{
    register_service, ChatResponse, ChunkCallback, EmbeddingResponse, Service,
};
use omnillm::{AiError, ChatRequest, Role};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

// Stub provider for chat-level tests: always answers with a fixed,
// OpenAI-shaped response.  Each test registers its own provider name so
// concurrently running tests never share a stub.
struct StubService {
    name: String,
    reply: String,
}

#[async_trait]
impl Service for StubService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, _request: &ChatRequest) -> Result<ChatResponse, AiError> {
        let raw = json!({
            "choices": [{"message": {"role": "assistant", "content": self.reply}}],
            "usage": {"prompt_tokens": 4, "completion_tokens": 6, "total_tokens": 10},
        });
        Ok(ChatResponse {
            raw: raw.clone(),
            provider: self.name.clone(),
            model: Some("stub-1".into()),
            messages: vec![MessageEntry::new(Role::Assistant, self.reply.clone())],
            usage: None,
        })
    }

    async fn invoke_stream(
        &self,
        _request: &ChatRequest,
        on_chunk: ChunkCallback<'_>,
    ) -> Result<(), AiError> {
        for word in self.reply.split_inclusive(' ') {
            on_chunk(json!({"choices": [{"delta": {"content": word}}]}));
        }
        on_chunk(json!({"choices": [{"delta": {}, "finish_reason": "stop"}]}));
        Ok(())
    }

    async fn embed(&self, _request: &EmbeddingRequest) -> Result<EmbeddingResponse, AiError> {
        Err(AiError::Unsupported {
            provider: self.name.clone(),
            operation: "embed".into(),
        })
    }
}

fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn stub_options(name: &str) -> RequestOptions {
    RequestOptions {
        provider: Some(name.to_string()),
        ..Default::default()
    }
}

fn install_stub(name: &str, reply: &str) -> RequestOptions {
    init_test_logging();
    register_service(
        name,
        Arc::new(StubService {
            name: name.to_string(),
            reply: reply.to_string(),
        }),
    );
    stub_options(name)
}

#[tokio::test]
async fn simple_chat_returns_single_content() {
    let options = install_stub("stub-simple", "BoxLang is a JVM language.");
    let answer = omnillm::omnillm::api::chat_with(
        "What is BoxLang?",
        Map::new(),
        options,
        HashMap::new(),
    )
    .await
    .unwrap();
    assert_eq!(answer, json!("BoxLang is a JVM language."));
}

#[tokio::test]
async fn return_formats_agree_on_the_same_response() {
    let options = install_stub("stub-formats", "BoxLang is a JVM language.");

    let mut single_options = options.clone();
    single_options.return_format = Some(ReturnFormat::Single);
    let single = omnillm::omnillm::api::chat_with(
        "q",
        Map::new(),
        single_options,
        HashMap::new(),
    )
    .await
    .unwrap();

    let mut all_options = options.clone();
    all_options.return_format = Some(ReturnFormat::All);
    let all = omnillm::omnillm::api::chat_with("q", Map::new(), all_options, HashMap::new())
        .await
        .unwrap();

    let mut raw_options = options.clone();
    raw_options.return_format = Some(ReturnFormat::Raw);
    let raw = omnillm::omnillm::api::chat_with("q", Map::new(), raw_options, HashMap::new())
        .await
        .unwrap();

    // single == all.last().content == raw.choices[0].message.content
    let all_last = all.as_array().unwrap().last().unwrap();
    assert_eq!(single, all_last["content"]);
    assert_eq!(single, raw["choices"][0]["message"]["content"]);
}

#[tokio::test]
async fn chat_accepts_message_builders_and_renders_bindings() {
    let options = install_stub("stub-builder", "ok");
    let message = omnillm::ChatMessage::new()
        .system("You answer tersely.")
        .user("Describe ${thing}.")
        .bind([("thing", "Rust")]);
    let answer =
        omnillm::omnillm::api::chat_with(message, Map::new(), options, HashMap::new())
            .await
            .unwrap();
    assert_eq!(answer, json!("ok"));
}

#[tokio::test]
async fn chat_stream_delivers_chunks_in_order() {
    let options = install_stub("stub-stream", "streamed words arrive in order");
    let mut collected = String::new();
    let mut on_chunk = |chunk: Value| {
        if let Some(delta) = omnillm::omnillm::service::extract_delta_text(&chunk) {
            collected.push_str(&delta);
        }
    };
    omnillm::omnillm::api::chat_stream("go", &mut on_chunk, Map::new(), options, HashMap::new())
        .await
        .unwrap();
    assert_eq!(collected, "streamed words arrive in order");
}

#[tokio::test]
async fn chat_async_resolves_to_the_same_result() {
    let options = install_stub("stub-async", "async answer");
    let handle =
        omnillm::omnillm::api::chat_async("q".to_string(), Map::new(), options, HashMap::new());
    let answer = handle.await.unwrap().unwrap();
    assert_eq!(answer, json!("async answer"));
}

#[tokio::test]
async fn json_return_format_parses_and_rejects() {
    let mut options = install_stub("stub-json-good", "{\"a\": 1}");
    options.return_format = Some(ReturnFormat::Json);
    let parsed =
        omnillm::omnillm::api::chat_with("q", Map::new(), options, HashMap::new())
            .await
            .unwrap();
    assert_eq!(parsed, json!({"a": 1}));

    let mut options = install_stub("stub-json-bad", "not json at all");
    options.return_format = Some(ReturnFormat::Json);
    let err = omnillm::omnillm::api::chat_with("q", Map::new(), options, HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AiError::Protocol(_)));
}

#[tokio::test]
async fn unknown_provider_is_invalid_argument() {
    let mut options = RequestOptions::default();
    options.provider = Some("definitely-not-a-provider".into());
    let err = omnillm::omnillm::api::chat_with("q", Map::new(), options, HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AiError::InvalidArgument(_)));
}

// The chat surface dispatches tool calls itself when tools are provided.
struct ToolCallingStub;

#[async_trait]
impl Service for ToolCallingStub {
    fn name(&self) -> &str {
        "stub-tools"
    }

    async fn invoke(&self, request: &ChatRequest) -> Result<ChatResponse, AiError> {
        // First round: no tool message yet → request the tool.  Second
        // round: answer from the tool result.
        let tool_result = request
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .map(|m| m.content.as_text());
        match tool_result {
            None => Ok(ChatResponse {
                raw: json!({}),
                provider: "stub-tools".into(),
                model: None,
                messages: vec![MessageEntry {
                    role: Role::Assistant,
                    content: omnillm::omnillm::message::MessageContent::Text(String::new()),
                    tool_call_id: None,
                    tool_calls: vec![omnillm::omnillm::message::ToolCall {
                        id: "call_1".into(),
                        name: "lookup".into(),
                        arguments: json!({"key": "answer"}),
                    }],
                }],
                usage: None,
            }),
            Some(result) => Ok(ChatResponse {
                raw: json!({"choices": [{"message": {"role": "assistant", "content": format!("lookup said {}", result)}}]}),
                provider: "stub-tools".into(),
                model: None,
                messages: vec![MessageEntry::new(
                    Role::Assistant,
                    format!("lookup said {}", result),
                )],
                usage: None,
            }),
        }
    }

    async fn invoke_stream(
        &self,
        _request: &ChatRequest,
        _on_chunk: ChunkCallback<'_>,
    ) -> Result<(), AiError> {
        Ok(())
    }

    async fn embed(&self, _request: &EmbeddingRequest) -> Result<EmbeddingResponse, AiError> {
        Err(AiError::Unsupported {
            provider: "stub-tools".into(),
            operation: "embed".into(),
        })
    }
}

#[tokio::test]
async fn chat_with_tools_runs_the_dispatch_loop() {
    register_service("stub-tools", Arc::new(ToolCallingStub));
    let mut tools = omnillm::ToolRegistry::new();
    tools.register(
        omnillm::Tool::new("lookup", "Looks up a value")
            .arg("key")
            .with_callable(|args| async move {
                assert_eq!(args["key"], json!("answer"));
                Ok(json!("42"))
            }),
    );

    let options = RequestOptions {
        provider: Some("stub-tools".into()),
        ..Default::default()
    };
    let answer =
        omnillm::omnillm::api::chat_with_tools("q", &tools, Map::new(), options, 5)
            .await
            .unwrap();
    assert_eq!(answer, json!("lookup said 42"));
}
