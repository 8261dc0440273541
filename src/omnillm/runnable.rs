//! Composable, immutable, streaming-aware execution pipelines.
//!
//! Every pipeline node implements [`Runnable`]: it can be run to
//! completion, streamed, and composed with [`to`](Sequence::to) into a
//! [`Sequence`].  Sequences are immutable: `to`, `with_name`,
//! `with_params`, and `with_options` all return a **new** sequence with a
//! copied step list, so extending a base pipeline two different ways never
//! aliases state.
//!
//! Values flowing between steps are `serde_json::Value`s.  A string input
//! to a model step becomes a `user` message; a `{"messages": [...]}`
//! object (what [`MessageNode`] produces) carries a full conversation.
//!
//! # Example
//!
//! ```rust,no_run
//! use omnillm::omnillm::runnable::{Model, Sequence, Transform};
//! use omnillm::ChatMessage;
//! use serde_json::{json, Value};
//!
//! # async fn run() -> Result<(), omnillm::AiError> {
//! let pipeline = Sequence::of(ChatMessage::new().user("Summarize: ${text}"))
//!     .to(Model::new("openai").single_message())
//!     .to(Transform::new("uppercase", |value| {
//!         Ok(json!(value.as_str().unwrap_or_default().to_uppercase()))
//!     }));
//!
//! let result = pipeline.run(json!({"text": "Rust is fast."})).await?;
//! # Ok(())
//! # }
//! ```

use crate::omnillm::config::global_config;
use crate::omnillm::error::AiError;
use crate::omnillm::message::{ChatMessage, MessageEntry, Role};
use crate::omnillm::request::{
    merge_params, ChatRequest, RequestOptions, ReturnFormat,
};
use crate::omnillm::service::{service, transform_response, ChunkCallback};
use crate::omnillm::structured::StructSchema;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// A node in a pipeline.
///
/// `run` executes to completion; `stream` delivers provider-native chunks
/// through the callback and resolves to the final value.  Nodes without a
/// streaming path inherit the default `stream`, which runs to completion
/// and emits the result as a single chunk.
#[async_trait::async_trait]
pub trait Runnable: Send + Sync {
    /// Execute the node.  `params` and `options` layer over the node's own
    /// stored values, runtime winning.
    async fn run(
        &self,
        input: Value,
        params: &Map<String, Value>,
        options: &RequestOptions,
    ) -> Result<Value, AiError>;

    /// Execute the node, streaming chunks through `on_chunk`.
    async fn stream(
        &self,
        on_chunk: ChunkCallback<'_>,
        input: Value,
        params: &Map<String, Value>,
        options: &RequestOptions,
    ) -> Result<Value, AiError> {
        let result = self.run(input, params, options).await?;
        on_chunk(result.clone());
        Ok(result)
    }

    /// Display name of the node.
    fn name(&self) -> &str {
        "runnable"
    }
}

/// An immutable, ordered pipeline of runnables.
#[derive(Clone)]
pub struct Sequence {
    steps: Vec<Arc<dyn Runnable>>,
    name: String,
    params: Map<String, Value>,
    options: RequestOptions,
}

impl Default for Sequence {
    fn default() -> Self {
        Sequence::new()
    }
}

impl Sequence {
    /// An empty sequence (identity pipeline).
    pub fn new() -> Self {
        Sequence {
            steps: Vec::new(),
            name: "sequence".to_string(),
            params: Map::new(),
            options: RequestOptions::default(),
        }
    }

    /// A sequence holding one step.
    pub fn of(step: impl Runnable + 'static) -> Self {
        Sequence::new().to(step)
    }

    /// Return a new sequence containing `self`'s steps followed by `next`.
    /// Neither operand is mutated.
    pub fn to(&self, next: impl Runnable + 'static) -> Sequence {
        let mut steps = self.steps.clone();
        steps.push(Arc::new(next));
        Sequence {
            steps,
            name: self.name.clone(),
            params: self.params.clone(),
            options: self.options.clone(),
        }
    }

    /// Return a renamed copy.
    pub fn with_name(&self, name: impl Into<String>) -> Sequence {
        let mut copy = self.clone();
        copy.name = name.into();
        copy
    }

    /// Return a copy with `params` merged over the stored params.
    pub fn with_params(&self, params: Map<String, Value>) -> Sequence {
        let mut copy = self.clone();
        merge_params(&mut copy.params, &params);
        copy
    }

    /// Return a copy with the given options layered over the stored ones.
    pub fn with_options(&self, options: RequestOptions) -> Sequence {
        let mut copy = self.clone();
        copy.options = copy.options.merged_with(&options);
        copy
    }

    /// Borrow the step list.
    pub fn steps(&self) -> &[Arc<dyn Runnable>] {
        &self.steps
    }

    /// Display name.
    pub fn get_name(&self) -> &str {
        &self.name
    }

    /// Sugar: select the structured-output return format downstream.
    pub fn structured_output(&self, schema: StructSchema) -> Sequence {
        self.with_return_format(ReturnFormat::Schema(schema))
    }

    /// Sugar: parse the final model output as JSON.
    pub fn as_json(&self) -> Sequence {
        self.with_return_format(ReturnFormat::Json)
    }

    /// Sugar: parse the final model output as XML.
    pub fn as_xml(&self) -> Sequence {
        self.with_return_format(ReturnFormat::Xml)
    }

    /// Sugar: reduce the final model output to the first message's content.
    pub fn single_message(&self) -> Sequence {
        self.with_return_format(ReturnFormat::Single)
    }

    /// Sugar: keep all assistant messages.
    pub fn all_messages(&self) -> Sequence {
        self.with_return_format(ReturnFormat::All)
    }

    /// Sugar: keep the provider response as-is.
    pub fn raw_response(&self) -> Sequence {
        self.with_return_format(ReturnFormat::Raw)
    }

    fn with_return_format(&self, format: ReturnFormat) -> Sequence {
        let mut copy = self.clone();
        copy.options.return_format = Some(format);
        copy
    }

    /// Run the pipeline: fold the steps left-to-right, each step's output
    /// becoming the next step's input.
    pub async fn run(&self, input: Value) -> Result<Value, AiError> {
        self.run_with(input, &Map::new(), &RequestOptions::default())
            .await
    }

    /// Run with runtime params/options.  Runtime values override the
    /// sequence's stored values, which override per-step values.
    pub async fn run_with(
        &self,
        input: Value,
        params: &Map<String, Value>,
        options: &RequestOptions,
    ) -> Result<Value, AiError> {
        let mut effective_params = self.params.clone();
        merge_params(&mut effective_params, params);
        let effective_options = self.options.merged_with(options);

        let mut value = input;
        for step in &self.steps {
            value = step.run(value, &effective_params, &effective_options).await?;
        }
        Ok(value)
    }

    /// Stream the pipeline: upstream steps run to completion, the final
    /// step streams its chunks through `on_chunk`.
    pub async fn stream(
        &self,
        on_chunk: ChunkCallback<'_>,
        input: Value,
    ) -> Result<Value, AiError> {
        self.stream_with(on_chunk, input, &Map::new(), &RequestOptions::default())
            .await
    }

    /// Stream with runtime params/options.
    pub async fn stream_with(
        &self,
        on_chunk: ChunkCallback<'_>,
        input: Value,
        params: &Map<String, Value>,
        options: &RequestOptions,
    ) -> Result<Value, AiError> {
        let mut effective_params = self.params.clone();
        merge_params(&mut effective_params, params);
        let effective_options = self.options.merged_with(options);

        let mut value = input;
        let step_count = self.steps.len();
        for (index, step) in self.steps.iter().enumerate() {
            if index + 1 == step_count {
                return step
                    .stream(on_chunk, value, &effective_params, &effective_options)
                    .await;
            }
            value = step.run(value, &effective_params, &effective_options).await?;
        }
        Ok(value)
    }
}

#[async_trait::async_trait]
impl Runnable for Sequence {
    async fn run(
        &self,
        input: Value,
        params: &Map<String, Value>,
        options: &RequestOptions,
    ) -> Result<Value, AiError> {
        self.run_with(input, params, options).await
    }

    async fn stream(
        &self,
        on_chunk: ChunkCallback<'_>,
        input: Value,
        params: &Map<String, Value>,
        options: &RequestOptions,
    ) -> Result<Value, AiError> {
        self.stream_with(on_chunk, input, params, options).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A message-template node: renders its [`ChatMessage`] with bindings from
/// the input and emits `{"messages": [...]}` for a downstream model.
///
/// An object input provides bindings (values are stringified); a string
/// input is appended as an extra `user` message.
pub struct MessageNode {
    message: ChatMessage,
}

impl MessageNode {
    /// Wrap a [`ChatMessage`] as a pipeline node.
    pub fn new(message: ChatMessage) -> Self {
        MessageNode { message }
    }
}

#[async_trait::async_trait]
impl Runnable for MessageNode {
    async fn run(
        &self,
        input: Value,
        _params: &Map<String, Value>,
        _options: &RequestOptions,
    ) -> Result<Value, AiError> {
        let mut bindings: HashMap<String, String> = HashMap::new();
        let mut extra_user: Option<String> = None;
        match &input {
            Value::Object(map) => {
                for (key, value) in map {
                    let text = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    bindings.insert(key.clone(), text);
                }
            }
            Value::String(text) => extra_user = Some(text.clone()),
            Value::Null => {}
            other => extra_user = Some(other.to_string()),
        }
        let mut rendered = self.message.format(&bindings);
        if let Some(text) = extra_user {
            rendered = rendered.user(text);
        }
        let entries = rendered.into_entries();
        Ok(serde_json::json!({ "messages": entries }))
    }

    fn name(&self) -> &str {
        "message"
    }
}

#[async_trait::async_trait]
impl Runnable for ChatMessage {
    /// A bare [`ChatMessage`] participates in pipelines as a message node.
    async fn run(
        &self,
        input: Value,
        params: &Map<String, Value>,
        options: &RequestOptions,
    ) -> Result<Value, AiError> {
        MessageNode::new(self.clone()).run(input, params, options).await
    }

    fn name(&self) -> &str {
        "message"
    }
}

/// A model node: wraps a provider service for use in pipelines.
///
/// The pipeline default return format is `Raw`; the sugar methods select
/// other formats.
#[derive(Clone)]
pub struct Model {
    provider: String,
    model: Option<String>,
    params: Map<String, Value>,
    options: RequestOptions,
}

impl Model {
    /// A model node for the given provider.
    pub fn new(provider: impl Into<String>) -> Self {
        Model {
            provider: provider.into(),
            model: None,
            params: Map::new(),
            options: RequestOptions::default(),
        }
    }

    /// Select a model identifier.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Merge params stored on the node.
    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        merge_params(&mut self.params, &params);
        self
    }

    /// Layer options stored on the node.
    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = self.options.merged_with(&options);
        self
    }

    /// Sugar: structured-output return format.
    pub fn structured_output(mut self, schema: StructSchema) -> Self {
        self.options.return_format = Some(ReturnFormat::Schema(schema));
        self
    }

    /// Sugar: parse output as JSON.
    pub fn as_json(mut self) -> Self {
        self.options.return_format = Some(ReturnFormat::Json);
        self
    }

    /// Sugar: parse output as XML.
    pub fn as_xml(mut self) -> Self {
        self.options.return_format = Some(ReturnFormat::Xml);
        self
    }

    /// Sugar: first message content only.
    pub fn single_message(mut self) -> Self {
        self.options.return_format = Some(ReturnFormat::Single);
        self
    }

    /// Sugar: all assistant messages.
    pub fn all_messages(mut self) -> Self {
        self.options.return_format = Some(ReturnFormat::All);
        self
    }

    /// Sugar: raw provider response.
    pub fn raw_response(mut self) -> Self {
        self.options.return_format = Some(ReturnFormat::Raw);
        self
    }

    fn build_request(
        &self,
        input: Value,
        params: &Map<String, Value>,
        options: &RequestOptions,
    ) -> Result<ChatRequest, AiError> {
        let messages = input_to_messages(input)?;
        let mut effective_params = self.params.clone();
        merge_params(&mut effective_params, params);
        let effective_options = self.options.merged_with(options);
        Ok(ChatRequest {
            messages,
            model: self.model.clone(),
            params: effective_params,
            options: effective_options,
            headers: HashMap::new(),
            source: None,
        })
    }
}

#[async_trait::async_trait]
impl Runnable for Model {
    async fn run(
        &self,
        input: Value,
        params: &Map<String, Value>,
        options: &RequestOptions,
    ) -> Result<Value, AiError> {
        let request = self.build_request(input, params, options)?;
        let config = global_config().provider_config(&self.provider);
        let svc = service(&self.provider, &config)?;
        let response = svc.invoke(&request).await?;
        // Pipelines default to the raw response.
        let format = request
            .options
            .return_format
            .clone()
            .unwrap_or(ReturnFormat::Raw);
        transform_response(&response, &format)
    }

    async fn stream(
        &self,
        on_chunk: ChunkCallback<'_>,
        input: Value,
        params: &Map<String, Value>,
        options: &RequestOptions,
    ) -> Result<Value, AiError> {
        let request = self.build_request(input, params, options)?;
        let config = global_config().provider_config(&self.provider);
        let svc = service(&self.provider, &config)?;
        svc.invoke_stream(&request, on_chunk).await?;
        Ok(Value::Null)
    }

    fn name(&self) -> &str {
        &self.provider
    }
}

/// A pure-function node over the previous output.
///
/// Transforms accept but ignore `options`; they still propagate unchanged
/// to downstream steps (the sequence owns option flow).
pub struct Transform {
    name: String,
    function: Arc<dyn Fn(Value) -> Result<Value, AiError> + Send + Sync>,
}

impl Transform {
    /// A transform node applying `function` to its input.
    pub fn new<F>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn(Value) -> Result<Value, AiError> + Send + Sync + 'static,
    {
        Transform {
            name: name.into(),
            function: Arc::new(function),
        }
    }
}

#[async_trait::async_trait]
impl Runnable for Transform {
    async fn run(
        &self,
        input: Value,
        _params: &Map<String, Value>,
        _options: &RequestOptions,
    ) -> Result<Value, AiError> {
        (self.function)(input)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Interpret a pipeline value as a message list.
///
/// Accepted shapes: `{"messages": [...]}` (unified entries), a bare array
/// of entries, or a string (a single `user` message).
pub(crate) fn input_to_messages(input: Value) -> Result<Vec<MessageEntry>, AiError> {
    match input {
        Value::String(text) => Ok(vec![MessageEntry::new(Role::User, text)]),
        Value::Object(ref map) if map.contains_key("messages") => {
            serde_json::from_value(map["messages"].clone()).map_err(|e| {
                AiError::InvalidArgument(format!("malformed messages array: {}", e))
            })
        }
        Value::Array(_) => serde_json::from_value(input)
            .map_err(|e| AiError::InvalidArgument(format!("malformed messages array: {}", e))),
        other => Err(AiError::InvalidArgument(format!(
            "model step expects a string, messages array, or {{\"messages\": ...}}, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn sequence_is_immutable_under_to() {
        let base = Sequence::of(Transform::new("double", |v| {
            Ok(json!(v.as_i64().unwrap_or(0) * 2))
        }));
        let extended = base.to(Transform::new("inc", |v| {
            Ok(json!(v.as_i64().unwrap_or(0) + 1))
        }));

        assert_eq!(base.steps().len(), 1);
        assert_eq!(extended.steps().len(), 2);

        assert_eq!(base.run(json!(3)).await.unwrap(), json!(6));
        assert_eq!(extended.run(json!(3)).await.unwrap(), json!(7));
    }

    #[tokio::test]
    async fn sequence_folds_left_to_right() {
        let pipeline = Sequence::new()
            .to(Transform::new("a", |v| {
                Ok(json!(format!("{}a", v.as_str().unwrap_or(""))))
            }))
            .to(Transform::new("b", |v| {
                Ok(json!(format!("{}b", v.as_str().unwrap_or(""))))
            }));
        assert_eq!(pipeline.run(json!("x")).await.unwrap(), json!("xab"));
    }

    #[tokio::test]
    async fn stream_streams_only_the_final_step() {
        let pipeline = Sequence::new()
            .to(Transform::new("first", |_| Ok(json!("intermediate"))))
            .to(Transform::new("last", |v| {
                Ok(json!(format!("final:{}", v.as_str().unwrap_or(""))))
            }));
        let mut chunks = Vec::new();
        let mut on_chunk = |chunk: Value| chunks.push(chunk);
        let result = pipeline.stream(&mut on_chunk, json!("in")).await.unwrap();
        assert_eq!(result, json!("final:intermediate"));
        // The default stream impl emits the final value once.
        assert_eq!(chunks, vec![json!("final:intermediate")]);
    }

    #[tokio::test]
    async fn message_node_binds_object_input() {
        let node = MessageNode::new(ChatMessage::new().user("Hello ${name}"));
        let out = node
            .run(json!({"name": "World"}), &Map::new(), &RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(out["messages"][0]["content"], json!("Hello World"));
    }

    #[tokio::test]
    async fn message_node_appends_string_input_as_user() {
        let node = MessageNode::new(ChatMessage::new().system("sys"));
        let out = node
            .run(json!("question"), &Map::new(), &RequestOptions::default())
            .await
            .unwrap();
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1]["role"], json!("user"));
    }

    #[test]
    fn input_to_messages_accepts_known_shapes() {
        assert_eq!(input_to_messages(json!("hi")).unwrap()[0].role, Role::User);
        let wrapped = json!({"messages": [{"role": "assistant", "content": "ok"}]});
        assert_eq!(
            input_to_messages(wrapped).unwrap()[0].role,
            Role::Assistant
        );
        assert!(input_to_messages(json!(42)).is_err());
    }

    #[test]
    fn with_params_and_options_return_new_instances() {
        let base = Sequence::new();
        let mut params = Map::new();
        params.insert("temperature".into(), json!(0.5));
        let configured = base.with_params(params).with_name("tuned");
        assert_eq!(base.get_name(), "sequence");
        assert_eq!(configured.get_name(), "tuned");
    }
}
