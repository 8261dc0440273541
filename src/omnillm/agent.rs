//! Agent system.
//!
//! An [`Agent`] couples instructions, a model, tools, memories, and
//! sub-agents into an iterative reasoning loop: invoke the model, execute
//! any tool calls it requests, feed the results back, and repeat until the
//! model answers without tools or the iteration bound is hit.
//!
//! Per run the loop moves through
//! `Init → Prepare → Invoke → Inspect → ToolDispatch → Update →
//! (Invoke | Finalize)`:
//!
//! - **Init** appends the input as a `user` message to every attached
//!   memory, scoped by `(user_id, conversation_id)`, and emits
//!   [`AiEvent::AgentRunStarted`].
//! - **Prepare** builds the request:
//!   `system(instructions) ++ memory.retrieve(input) ++ input`.
//! - **Inspect** routes tool-call responses to **ToolDispatch**, where
//!   tools resolve in the agent's registry, then in sub-agent registries.
//!   Unknown tools produce an error-text tool message and the loop
//!   continues.
//! - **Finalize** persists the final assistant message, emits
//!   [`AiEvent::AgentRunCompleted`], and returns content per the options'
//!   return format (default `single`).
//!
//! Sub-agents are exposed as ordinary tools whose callable runs the
//! sub-agent.
//!
//! # Example
//!
//! ```rust,no_run
//! use omnillm::{Agent, Tool};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), omnillm::AiError> {
//! let agent = Agent::new("weather-bot")
//!     .with_instructions("Answer with only the warmer city name, nothing else.")
//!     .with_provider("openai")
//!     .with_tool(
//!         Tool::new("get_weather", "Temperature for a city")
//!             .arg("location")
//!             .with_callable(|args| async move {
//!                 Ok(json!(args["location"].as_str().unwrap_or("").len().to_string()))
//!             }),
//!     );
//!
//! let response = agent.run("How hot is it in Kansas City?").await?;
//! println!("{}", response.content);
//! # Ok(())
//! # }
//! ```

use crate::omnillm::config::global_config;
use crate::omnillm::error::AiError;
use crate::omnillm::event::{emit, AiEvent, EventHandler};
use crate::omnillm::memory::{Memory, MemoryEntry, TenantScope};
use crate::omnillm::message::{MessageContent, MessageEntry, Role, ToolCall};
use crate::omnillm::request::{merge_params, ChatRequest, RequestOptions, ReturnFormat};
use crate::omnillm::runnable::Runnable;
use crate::omnillm::service::{service, ChatResponse, ChunkCallback, Service, TokenUsage};
use crate::omnillm::tool::{Tool, ToolRegistry};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Default bound on model invocations per run.
pub const DEFAULT_MAX_ITERATIONS: usize = 5;

/// How many memory entries Prepare pulls per attached memory.
const MEMORY_RETRIEVAL_LIMIT: usize = 10;

/// Final result of an agent run.
#[derive(Debug, Clone)]
pub struct AgentResponse {
    /// Final assistant text.
    pub content: String,
    /// The value after return-format transformation (equals `content` for
    /// the default `single` format).
    pub value: Value,
    /// Cumulative token usage across every model invocation in this run.
    pub usage: Option<TokenUsage>,
    /// Number of model invocations performed.
    pub iterations: usize,
}

/// An autonomous agent with tools, memory, and an iterative tool-use loop.
pub struct Agent {
    /// Agent name, also the tool name when exposed as a sub-agent.
    pub name: String,
    /// Human-readable description, surfaced when exposed as a sub-agent.
    pub description: String,
    instructions: String,
    provider: Option<String>,
    model: Option<String>,
    model_service: Option<Arc<dyn Service>>,
    tools: ToolRegistry,
    memories: Vec<Arc<dyn Memory>>,
    sub_agents: Vec<Arc<Agent>>,
    params: Map<String, Value>,
    options: RequestOptions,
    max_iterations: usize,
    event_handler: Option<Arc<dyn EventHandler>>,
    turns: AtomicUsize,
}

impl Agent {
    /// Create an agent with defaults: no tools, no memory, module default
    /// provider, iteration bound of [`DEFAULT_MAX_ITERATIONS`].
    pub fn new(name: impl Into<String>) -> Self {
        Agent {
            name: name.into(),
            description: String::new(),
            instructions: String::new(),
            provider: None,
            model: None,
            model_service: None,
            tools: ToolRegistry::new(),
            memories: Vec::new(),
            sub_agents: Vec::new(),
            params: Map::new(),
            options: RequestOptions::default(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            event_handler: None,
            turns: AtomicUsize::new(0),
        }
    }

    /// Attach a description (used when this agent is a sub-agent tool).
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the system instructions.
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    /// Route invocations to a provider by name.
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Select a model identifier.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Attach an explicit service (stubs in tests, pre-built providers).
    pub fn with_model_service(mut self, service: Arc<dyn Service>) -> Self {
        self.model_service = Some(service);
        self
    }

    /// Register one tool.
    pub fn with_tool(mut self, tool: Tool) -> Self {
        self.tools.register(tool);
        self
    }

    /// Replace the tool registry.
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// Attach a memory.  Multiple memories all receive writes; all
    /// contribute retrieved context.
    pub fn with_memory(mut self, memory: Arc<dyn Memory>) -> Self {
        self.memories.push(memory);
        self
    }

    /// Expose another agent as a tool of this one.
    pub fn with_sub_agent(mut self, sub_agent: Agent) -> Self {
        self.sub_agents.push(Arc::new(sub_agent));
        self
    }

    /// Merge model params (temperature, max_tokens, ...).
    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        merge_params(&mut self.params, &params);
        self
    }

    /// Layer request options (tenancy, return format, timeout, ...).
    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = self.options.merged_with(&options);
        self
    }

    /// Override the iteration bound.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Attach an event handler receiving this agent's events in addition
    /// to the global bus.
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Number of completed `run`/`stream` calls.
    pub fn turn_count(&self) -> usize {
        self.turns.load(Ordering::SeqCst)
    }

    /// Messages currently visible in the agent's first memory.
    ///
    /// Memories are shared with the caller by design; this is the
    /// convenience accessor for the common single-memory case.
    pub async fn memory_messages(&self) -> Result<Vec<MemoryEntry>, AiError> {
        match self.memories.first() {
            Some(memory) => memory.get_all().await,
            None => Ok(Vec::new()),
        }
    }

    async fn emit_event(&self, event: AiEvent) {
        if let Some(handler) = &self.event_handler {
            handler.on_event(&event).await;
        }
        emit(event).await;
    }

    fn resolve_service(&self) -> Result<Arc<dyn Service>, AiError> {
        if let Some(svc) = &self.model_service {
            return Ok(svc.clone());
        }
        let module = global_config();
        let provider = self
            .provider
            .clone()
            .or_else(|| self.options.provider.clone())
            .unwrap_or(module.provider.clone());
        service(&provider, &module.provider_config(&provider))
    }

    /// Resolve a tool by name: own registry first, then sub-agent
    /// registries, then sub-agents themselves (exposed as tools).
    fn resolve_tool(&self, name: &str) -> Option<Arc<Tool>> {
        if let Some(tool) = self.tools.get(name) {
            return Some(tool);
        }
        for sub_agent in &self.sub_agents {
            if let Some(tool) = sub_agent.tools.get(name) {
                return Some(tool);
            }
        }
        self.sub_agents
            .iter()
            .find(|a| a.name == name)
            .map(|sub_agent| Arc::new(sub_agent_tool(sub_agent.clone())))
    }

    fn tool_schemas(&self) -> Vec<Value> {
        let mut schemas = self.tools.schemas();
        for sub_agent in &self.sub_agents {
            schemas.push(sub_agent_tool_schema(sub_agent));
        }
        schemas
    }

    async fn persist(&self, entry: &MemoryEntry) {
        for memory in &self.memories {
            if let Err(e) = memory.add(entry.clone()).await {
                log::error!("agent '{}': memory write failed: {}", self.name, e);
            }
        }
    }

    /// Prepare-phase context: retrieved memory entries as message entries,
    /// minus the trailing duplicate of the input (Init just persisted it).
    async fn retrieved_context(&self, input: &str) -> Vec<MessageEntry> {
        let mut context = Vec::new();
        for memory in &self.memories {
            match memory.retrieve(input, MEMORY_RETRIEVAL_LIMIT).await {
                Ok(entries) => context.extend(entries),
                Err(e) => {
                    log::error!("agent '{}': memory retrieval failed: {}", self.name, e)
                }
            }
        }
        if let Some(last) = context.last() {
            if last.role == Role::User && last.content == input {
                context.pop();
            }
        }
        context
            .into_iter()
            .map(|entry| MessageEntry::new(entry.role, entry.content))
            .collect()
    }

    fn scope(&self) -> TenantScope {
        TenantScope::from_options(&self.options)
    }

    fn entry_for(&self, role: Role, content: &str) -> MemoryEntry {
        let mut entry = MemoryEntry::new(role, content);
        self.scope().stamp(&mut entry.metadata);
        entry
    }

    fn build_request(&self, messages: Vec<MessageEntry>) -> ChatRequest {
        let mut params = self.params.clone();
        let schemas = self.tool_schemas();
        if !schemas.is_empty() {
            params.insert("tools".into(), Value::Array(schemas));
        }
        ChatRequest {
            messages,
            model: self.model.clone(),
            params,
            options: self.options.clone(),
            headers: Default::default(),
            source: None,
        }
    }

    /// Run the agent to completion.
    pub async fn run(&self, input: &str) -> Result<AgentResponse, AiError> {
        let outcome = self.run_loop(input, None).await?;
        Ok(outcome)
    }

    /// Run the agent, streaming output.
    ///
    /// Intermediate turns signal tool activity through structured chunks
    /// carrying a `toolCalls` field (plus any text the assistant produced
    /// alongside).  The final turn's content is delivered through the same
    /// callback as OpenAI-shaped delta chunks.
    pub async fn stream(
        &self,
        on_chunk: ChunkCallback<'_>,
        input: &str,
    ) -> Result<AgentResponse, AiError> {
        self.run_loop(input, Some(on_chunk)).await
    }

    async fn run_loop(
        &self,
        input: &str,
        mut on_chunk: Option<ChunkCallback<'_>>,
    ) -> Result<AgentResponse, AiError> {
        // ── Init ─────────────────────────────────────────────────────────
        self.turns.fetch_add(1, Ordering::SeqCst);
        let preview: String = input.chars().take(120).collect();
        self.emit_event(AiEvent::AgentRunStarted {
            agent: self.name.clone(),
            input_preview: preview,
            tenant: self.options.tenant(),
        })
        .await;
        self.persist(&self.entry_for(Role::User, input)).await;

        // ── Prepare ──────────────────────────────────────────────────────
        let mut messages: Vec<MessageEntry> = Vec::new();
        if !self.instructions.is_empty() {
            messages.push(MessageEntry::new(Role::System, self.instructions.clone()));
        }
        messages.extend(self.retrieved_context(input).await);
        messages.push(MessageEntry::new(Role::User, input));

        let svc = self.resolve_service()?;
        let mut total_usage: Option<TokenUsage> = None;
        let mut iterations = 0usize;

        let response: ChatResponse = loop {
            // ── Invoke ───────────────────────────────────────────────────
            iterations += 1;
            let request = self.build_request(messages.clone());
            let response = match svc.invoke(&request).await {
                Ok(response) => response,
                Err(e) => {
                    self.emit_event(AiEvent::ErrorRaised {
                        operation: "agent.run".into(),
                        message: e.to_string(),
                    })
                    .await;
                    return Err(e);
                }
            };
            if let Some(usage) = &response.usage {
                total_usage
                    .get_or_insert_with(TokenUsage::default)
                    .accumulate(usage);
            }

            // ── Inspect ──────────────────────────────────────────────────
            let tool_calls = response.tool_calls().to_vec();
            if tool_calls.is_empty() {
                break response;
            }

            if iterations >= self.max_iterations {
                self.emit_event(AiEvent::AgentIterationLimit {
                    agent: self.name.clone(),
                    limit: self.max_iterations,
                })
                .await;
                break response;
            }

            // Signal tool activity to streaming consumers.
            let assistant_text = response.first_text().unwrap_or_default();
            if let Some(on_chunk) = on_chunk.as_deref_mut() {
                on_chunk(json!({
                    "content": assistant_text,
                    "toolCalls": tool_calls,
                }));
            }

            // ── ToolDispatch + Update ────────────────────────────────────
            let assistant_entry = MessageEntry {
                role: Role::Assistant,
                content: MessageContent::Text(assistant_text.clone()),
                tool_call_id: None,
                tool_calls: tool_calls.clone(),
            };
            messages.push(assistant_entry);
            self.persist(&self.entry_for(Role::Assistant, &assistant_text))
                .await;

            for call in &tool_calls {
                let result_text = self.dispatch_tool(call).await;
                let mut result_entry = MessageEntry::new(Role::Tool, result_text.clone());
                result_entry.tool_call_id = Some(call.id.clone());
                messages.push(result_entry);
                self.persist(&self.entry_for(Role::Tool, &result_text)).await;
            }
        };

        // ── Finalize ─────────────────────────────────────────────────────
        let content = response.first_text().unwrap_or_default();
        self.persist(&self.entry_for(Role::Assistant, &content)).await;

        if let Some(on_chunk) = on_chunk.as_deref_mut() {
            on_chunk(json!({"choices": [{"delta": {"content": content}}]}));
            on_chunk(json!({"choices": [{"delta": {}, "finish_reason": "stop"}]}));
        }

        self.emit_event(AiEvent::AgentRunCompleted {
            agent: self.name.clone(),
            iterations,
            usage: total_usage.clone(),
            tenant: self.options.tenant(),
        })
        .await;

        let format = self
            .options
            .return_format
            .clone()
            .unwrap_or(ReturnFormat::Single);
        let value = crate::omnillm::service::transform_response(&response, &format)?;
        Ok(AgentResponse {
            content,
            value,
            usage: total_usage,
            iterations,
        })
    }

    /// Execute one tool call, never failing the loop: unknown tools and
    /// tool errors become error-text results the model can react to.
    async fn dispatch_tool(&self, call: &ToolCall) -> String {
        self.emit_event(AiEvent::ToolExecutionStarted {
            agent: Some(self.name.clone()),
            tool: call.name.clone(),
            arguments: call.arguments.clone(),
        })
        .await;
        let started = Instant::now();

        let arguments = call
            .arguments
            .as_object()
            .cloned()
            .unwrap_or_default();
        let outcome = match self.resolve_tool(&call.name) {
            Some(tool) => tool.invoke(arguments).await,
            None => Err(AiError::ToolNotFound(call.name.clone())),
        };

        let (result_text, success, error) = match outcome {
            Ok(text) => (text, true, None),
            Err(e) => {
                let message = e.to_string();
                (format!("Error: {}", message), false, Some(message))
            }
        };

        self.emit_event(AiEvent::ToolExecutionCompleted {
            agent: Some(self.name.clone()),
            tool: call.name.clone(),
            success,
            error,
            duration_ms: started.elapsed().as_millis() as u64,
        })
        .await;
        result_text
    }
}

/// Wrap a sub-agent as a tool whose callable runs it.
fn sub_agent_tool(sub_agent: Arc<Agent>) -> Tool {
    let description = if sub_agent.description.is_empty() {
        format!("Delegate a task to the '{}' agent", sub_agent.name)
    } else {
        sub_agent.description.clone()
    };
    let runner = sub_agent.clone();
    Tool::new(sub_agent.name.clone(), description)
        .arg("input")
        .describe_arg("input", "The task or question to hand to the agent")
        .with_callable(move |args| {
            let runner = runner.clone();
            async move {
                let input = args
                    .get("input")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let response = runner.run(&input).await?;
                Ok(Value::String(response.content))
            }
        })
}

fn sub_agent_tool_schema(sub_agent: &Arc<Agent>) -> Value {
    sub_agent_tool(sub_agent.clone()).get_schema()
}

#[async_trait::async_trait]
impl Runnable for Agent {
    async fn run(
        &self,
        input: Value,
        _params: &Map<String, Value>,
        _options: &RequestOptions,
    ) -> Result<Value, AiError> {
        let text = match input {
            Value::String(text) => text,
            other => other.to_string(),
        };
        let response = Agent::run(self, &text).await?;
        Ok(response.value)
    }

    async fn stream(
        &self,
        on_chunk: ChunkCallback<'_>,
        input: Value,
        _params: &Map<String, Value>,
        _options: &RequestOptions,
    ) -> Result<Value, AiError> {
        let text = match input {
            Value::String(text) => text,
            other => other.to_string(),
        };
        let response = Agent::stream(self, on_chunk, &text).await?;
        Ok(response.value)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::omnillm::request::EmbeddingRequest;
    use crate::omnillm::service::EmbeddingResponse;
    use std::sync::Mutex;

    /// Scripted service: returns each canned response in order.
    pub struct ScriptedService {
        responses: Mutex<Vec<ChatResponse>>,
    }

    impl ScriptedService {
        pub fn new(mut responses: Vec<ChatResponse>) -> Self {
            responses.reverse();
            ScriptedService {
                responses: Mutex::new(responses),
            }
        }
    }

    pub fn text_response(text: &str) -> ChatResponse {
        ChatResponse {
            raw: json!({"choices": [{"message": {"role": "assistant", "content": text}}]}),
            provider: "stub".into(),
            model: None,
            messages: vec![MessageEntry::new(Role::Assistant, text)],
            usage: Some(TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
        }
    }

    pub fn tool_call_response(name: &str, arguments: Value) -> ChatResponse {
        let call = ToolCall {
            id: format!("call_{}", name),
            name: name.to_string(),
            arguments,
        };
        ChatResponse {
            raw: json!({}),
            provider: "stub".into(),
            model: None,
            messages: vec![MessageEntry {
                role: Role::Assistant,
                content: MessageContent::Text(String::new()),
                tool_call_id: None,
                tool_calls: vec![call],
            }],
            usage: None,
        }
    }

    #[async_trait::async_trait]
    impl Service for ScriptedService {
        fn name(&self) -> &str {
            "stub"
        }

        async fn invoke(&self, _request: &ChatRequest) -> Result<ChatResponse, AiError> {
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| AiError::Protocol("scripted service exhausted".into()))
        }

        async fn invoke_stream(
            &self,
            request: &ChatRequest,
            on_chunk: ChunkCallback<'_>,
        ) -> Result<(), AiError> {
            let response = self.invoke(request).await?;
            on_chunk(json!({"choices": [{"delta": {"content": response.first_text()}}]}));
            Ok(())
        }

        async fn embed(&self, _request: &EmbeddingRequest) -> Result<EmbeddingResponse, AiError> {
            Err(AiError::Unsupported {
                provider: "stub".into(),
                operation: "embed".into(),
            })
        }
    }

    #[tokio::test]
    async fn plain_answer_terminates_in_one_iteration() {
        let agent = Agent::new("simple")
            .with_model_service(Arc::new(ScriptedService::new(vec![text_response("done")])));
        let response = agent.run("hello").await.unwrap();
        assert_eq!(response.content, "done");
        assert_eq!(response.iterations, 1);
        assert_eq!(response.usage.as_ref().unwrap().total_tokens, 15);
    }

    #[tokio::test]
    async fn unknown_tool_does_not_abort_the_loop() {
        let agent = Agent::new("resilient").with_model_service(Arc::new(ScriptedService::new(
            vec![
                tool_call_response("no_such_tool", json!({"x": 1})),
                text_response("recovered"),
            ],
        )));
        let response = agent.run("go").await.unwrap();
        assert_eq!(response.content, "recovered");
        assert_eq!(response.iterations, 2);
    }

    #[tokio::test]
    async fn max_iterations_one_skips_tool_follow_up() {
        let executed = Arc::new(Mutex::new(false));
        let flag = executed.clone();
        let agent = Agent::new("bounded")
            .with_max_iterations(1)
            .with_tool(
                Tool::new("touch", "sets a flag").with_callable(move |_| {
                    let flag = flag.clone();
                    async move {
                        *flag.lock().unwrap() = true;
                        Ok(json!("touched"))
                    }
                }),
            )
            .with_model_service(Arc::new(ScriptedService::new(vec![
                tool_call_response("touch", json!({})),
                text_response("never reached"),
            ])));

        let response = agent.run("go").await.unwrap();
        // Terminates after one turn with whatever the last message was.
        assert_eq!(response.iterations, 1);
        assert!(!*executed.lock().unwrap());
    }

    #[tokio::test]
    async fn sub_agent_runs_as_tool() {
        let inner = Agent::new("researcher")
            .with_description("Looks things up")
            .with_model_service(Arc::new(ScriptedService::new(vec![text_response(
                "42",
            )])));
        let outer = Agent::new("orchestrator")
            .with_sub_agent(inner)
            .with_model_service(Arc::new(ScriptedService::new(vec![
                tool_call_response("researcher", json!({"input": "meaning of life"})),
                text_response("the answer is 42"),
            ])));

        let response = outer.run("find the answer").await.unwrap();
        assert_eq!(response.content, "the answer is 42");
    }

    #[tokio::test]
    async fn stream_signals_tool_calls_then_text() {
        let agent = Agent::new("streamer")
            .with_tool(
                Tool::new("echo", "echoes")
                    .arg("text")
                    .with_callable(|args| async move { Ok(args["text"].clone()) }),
            )
            .with_model_service(Arc::new(ScriptedService::new(vec![
                tool_call_response("echo", json!({"text": "ping"})),
                text_response("pong"),
            ])));

        let mut chunks = Vec::new();
        let mut on_chunk = |chunk: Value| chunks.push(chunk);
        let response = agent.stream(&mut on_chunk, "go").await.unwrap();

        assert_eq!(response.content, "pong");
        assert!(chunks[0].get("toolCalls").is_some());
        assert_eq!(
            chunks[1]["choices"][0]["delta"]["content"],
            json!("pong")
        );
    }
}
