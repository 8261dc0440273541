use async_trait::async_trait;
use omnillm::omnillm::message::MessageEntry;
use omnillm::omnillm::request::{EmbeddingRequest, RequestOptions};
use omnillm::omnillm::runnable::{Model, Sequence, Transform};
use omnillm::omnillm::service::{
    register_service, ChatResponse, ChunkCallback, EmbeddingResponse, Service,
};
use omnillm::{AiError, ChatMessage, ChatRequest, Role};
use serde_json::{json, Map, Value};
use std::sync::Arc;

// Echo stub: replies with the last user message, uppercased.
struct UppercaseModel;

#[async_trait]
impl Service for UppercaseModel {
    fn name(&self) -> &str {
        "stub-upper"
    }

    async fn invoke(&self, request: &ChatRequest) -> Result<ChatResponse, AiError> {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_text())
            .unwrap_or_default();
        let reply = last_user.to_uppercase();
        Ok(ChatResponse {
            raw: json!({"choices": [{"message": {"role": "assistant", "content": reply}}]}),
            provider: "stub-upper".into(),
            model: None,
            messages: vec![MessageEntry::new(Role::Assistant, reply)],
            usage: None,
        })
    }

    async fn invoke_stream(
        &self,
        request: &ChatRequest,
        on_chunk: ChunkCallback<'_>,
    ) -> Result<(), AiError> {
        let response = self.invoke(request).await?;
        let text = response.first_text().unwrap_or_default();
        for ch in text.chars() {
            on_chunk(json!({"choices": [{"delta": {"content": ch.to_string()}}]}));
        }
        Ok(())
    }

    async fn embed(&self, _request: &EmbeddingRequest) -> Result<EmbeddingResponse, AiError> {
        Err(AiError::Unsupported {
            provider: "stub-upper".into(),
            operation: "embed".into(),
        })
    }
}

fn install() {
    let _ = env_logger::builder().is_test(true).try_init();
    register_service("stub-upper", Arc::new(UppercaseModel));
}

#[tokio::test]
async fn message_model_transform_pipeline() {
    install();
    let pipeline = Sequence::of(ChatMessage::new().user("greet ${name}"))
        .to(Model::new("stub-upper").single_message())
        .to(Transform::new("exclaim", |value: Value| {
            Ok(json!(format!("{}!", value.as_str().unwrap_or_default())))
        }));

    let result = pipeline.run(json!({"name": "world"})).await.unwrap();
    assert_eq!(result, json!("GREET WORLD!"));
}

#[tokio::test]
async fn base_pipeline_unchanged_when_extended() {
    install();
    let base = Sequence::of(ChatMessage::new().user("hi"))
        .to(Model::new("stub-upper").single_message());
    let extended = base.to(Transform::new("wrap", |value: Value| {
        Ok(json!(format!("[{}]", value.as_str().unwrap_or_default())))
    }));

    assert_eq!(base.steps().len(), 2);
    assert_eq!(extended.steps().len(), 3);

    assert_eq!(base.run(Value::Null).await.unwrap(), json!("HI"));
    assert_eq!(extended.run(Value::Null).await.unwrap(), json!("[HI]"));
}

#[tokio::test]
async fn runtime_options_override_sequence_and_step() {
    install();
    // The step selects raw; the runtime options select single.
    let pipeline = Sequence::of(Model::new("stub-upper").raw_response());
    let runtime = RequestOptions {
        return_format: Some(omnillm::ReturnFormat::Single),
        ..Default::default()
    };
    let result = pipeline
        .run_with(json!("hello"), &Map::new(), &runtime)
        .await
        .unwrap();
    assert_eq!(result, json!("HELLO"));
}

#[tokio::test]
async fn pipeline_default_return_format_is_raw() {
    install();
    let pipeline = Sequence::of(Model::new("stub-upper"));
    let result = pipeline.run(json!("hello")).await.unwrap();
    assert_eq!(result["choices"][0]["message"]["content"], json!("HELLO"));
}

#[tokio::test]
async fn stream_reaches_the_final_model_step() {
    install();
    let pipeline = Sequence::of(ChatMessage::new().user("ab")).to(Model::new("stub-upper"));
    let mut collected = String::new();
    let mut on_chunk = |chunk: Value| {
        if let Some(delta) = omnillm::omnillm::service::extract_delta_text(&chunk) {
            collected.push_str(&delta);
        }
    };
    pipeline.stream(&mut on_chunk, Value::Null).await.unwrap();
    assert_eq!(collected, "AB");
}

#[tokio::test]
async fn transforms_ignore_but_propagate_options() {
    install();
    let pipeline = Sequence::of(Transform::new("passthrough", Ok))
        .to(Model::new("stub-upper").single_message());
    // Options travel through the transform down to the model untouched.
    let result = pipeline
        .run_with(json!("pass"), &Map::new(), &RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(result, json!("PASS"));
}
