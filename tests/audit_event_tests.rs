use async_trait::async_trait;
use omnillm::omnillm::audit::{
    AuditContext, AuditInterceptor, AuditQuery, AuditStore, MemoryAuditStore, SpanType,
};
use omnillm::omnillm::config::AuditSettings;
use omnillm::omnillm::event::{AiEvent, EventBus, EventHandler};
use omnillm::omnillm::message::MessageEntry;
use omnillm::omnillm::request::EmbeddingRequest;
use omnillm::omnillm::service::{ChatResponse, ChunkCallback, EmbeddingResponse, Service};
use omnillm::{Agent, AiError, ChatRequest, Role};
use serde_json::json;
use std::sync::{Arc, Mutex};

struct Recorder {
    events: Mutex<Vec<String>>,
}

#[async_trait]
impl EventHandler for Recorder {
    async fn on_event(&self, event: &AiEvent) {
        let label = match event {
            AiEvent::AgentRunStarted { .. } => "agent.started",
            AiEvent::AgentRunCompleted { .. } => "agent.completed",
            AiEvent::ToolExecutionStarted { .. } => "tool.started",
            AiEvent::ToolExecutionCompleted { .. } => "tool.completed",
            _ => return,
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}

struct OneToolModel {
    asked: Mutex<bool>,
}

#[async_trait]
impl Service for OneToolModel {
    fn name(&self) -> &str {
        "audit-stub"
    }

    async fn invoke(&self, _request: &ChatRequest) -> Result<ChatResponse, AiError> {
        let mut asked = self.asked.lock().unwrap();
        if !*asked {
            *asked = true;
            return Ok(ChatResponse {
                raw: json!({}),
                provider: "audit-stub".into(),
                model: None,
                messages: vec![MessageEntry {
                    role: Role::Assistant,
                    content: omnillm::omnillm::message::MessageContent::Text(String::new()),
                    tool_call_id: None,
                    tool_calls: vec![omnillm::omnillm::message::ToolCall {
                        id: "call_1".into(),
                        name: "noop".into(),
                        arguments: json!({}),
                    }],
                }],
                usage: None,
            });
        }
        Ok(ChatResponse {
            raw: json!({}),
            provider: "audit-stub".into(),
            model: None,
            messages: vec![MessageEntry::new(Role::Assistant, "done")],
            usage: None,
        })
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
            provider: "audit-stub".into(),
            operation: "embed".into(),
        })
    }
}

fn one_tool_agent(handler: Arc<dyn EventHandler>) -> Agent {
    let _ = env_logger::builder().is_test(true).try_init();
    Agent::new("audited")
        .with_event_handler(handler)
        .with_tool(
            omnillm::Tool::new("noop", "does nothing")
                .with_callable(|_| async move { Ok(json!("ok")) }),
        )
        .with_model_service(Arc::new(OneToolModel {
            asked: Mutex::new(false),
        }))
}

#[tokio::test]
async fn before_events_precede_after_events() {
    let recorder = Arc::new(Recorder {
        events: Mutex::new(Vec::new()),
    });
    let agent = one_tool_agent(recorder.clone());
    agent.run("go").await.unwrap();

    let events = recorder.events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            "agent.started",
            "tool.started",
            "tool.completed",
            "agent.completed",
        ]
    );
}

#[tokio::test]
async fn interceptor_builds_spans_from_agent_activity() {
    let store = Arc::new(MemoryAuditStore::default());
    let context = Arc::new(AuditContext::new(
        AuditSettings {
            enabled: Some(true),
            ..Default::default()
        },
        store.clone(),
    ));
    let interceptor: Arc<dyn EventHandler> = Arc::new(AuditInterceptor::new(context));

    let agent = one_tool_agent(interceptor);
    agent.run("go").await.unwrap();

    let spans = store.query(&AuditQuery::default()).await.unwrap();
    assert!(spans.iter().any(|s| s.span_type == SpanType::Tool));
    let agent_span = spans
        .iter()
        .find(|s| s.span_type == SpanType::Agent)
        .unwrap();
    assert_eq!(agent_span.operation, "audited");
    assert!(agent_span.end_time.is_some());
    // Tool span nests under the agent span.
    let tool_span = spans.iter().find(|s| s.span_type == SpanType::Tool).unwrap();
    assert_eq!(
        tool_span.parent_span_id.as_deref(),
        Some(agent_span.span_id.as_str())
    );
}

#[tokio::test]
async fn global_bus_receives_every_agent_event() {
    // The global bus is process-wide; count only this agent's events.
    struct Counter {
        agent: String,
        count: Mutex<usize>,
    }

    #[async_trait]
    impl EventHandler for Counter {
        async fn on_event(&self, event: &AiEvent) {
            let matches = matches!(
                event,
                AiEvent::AgentRunStarted { agent, .. }
                | AiEvent::AgentRunCompleted { agent, .. } if agent == &self.agent
            );
            if matches {
                *self.count.lock().unwrap() += 1;
            }
        }
    }

    let counter = Arc::new(Counter {
        agent: "bus-watched".into(),
        count: Mutex::new(0),
    });
    EventBus::global().register(counter.clone());

    let agent = Agent::new("bus-watched").with_model_service(Arc::new(OneToolModel {
        asked: Mutex::new(true),
    }));
    agent.run("go").await.unwrap();

    assert_eq!(*counter.count.lock().unwrap(), 2);
}
