//! Audit trail: traces of timed, nested spans over every AI operation.
//!
//! A trace holds a tree of spans.  [`AuditContext::start_span`] pushes a
//! child of the current span, [`AuditContext::end_span`] pops and persists
//! it.  The interceptor ([`AuditInterceptor`]) subscribes to the event bus
//! and wraps `*Started`/`*Completed` event pairs into `model`, `tool`,
//! `agent`, and `embed` spans automatically; explicit `workflow` spans
//! bracket arbitrary caller code.
//!
//! Before persisting, every input/output/metadata value passes through
//! sanitization: keys matching the configured patterns (default
//! `password|apiKey|token|secret`) are replaced by the redact value and
//! string bodies are truncated.  Store failures are logged, never
//! propagated to the caller.

use crate::omnillm::config::AuditSettings;
use crate::omnillm::error::AiError;
use crate::omnillm::event::{AiEvent, EventHandler};
use crate::omnillm::memory::sql::SqlExecutor;
use crate::omnillm::service::TokenUsage;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Category of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanType {
    /// A full agent run.
    Agent,
    /// One model invocation.
    Model,
    /// One tool execution.
    Tool,
    /// Caller-defined bracket around arbitrary code.
    Workflow,
    /// One embedding call.
    Embed,
}

/// A timed, nested unit in an audit trace.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AuditSpan {
    /// Unique span ID.
    pub span_id: String,
    /// Parent span within the trace, when nested.
    pub parent_span_id: Option<String>,
    /// Trace this span belongs to.
    pub trace_id: String,
    /// Span category.
    pub span_type: SpanType,
    /// Operation name (`"chat"`, tool name, agent name, ...).
    pub operation: String,
    /// Start time.
    pub start_time: DateTime<Utc>,
    /// End time; `None` while the span is open.
    pub end_time: Option<DateTime<Utc>>,
    /// Sanitized input capture.
    pub input: Option<Value>,
    /// Sanitized output capture.
    pub output: Option<Value>,
    /// Token accounting for model/embed spans.
    pub tokens: Option<TokenUsage>,
    /// Sanitized free-form metadata.
    pub metadata: Map<String, Value>,
    /// Error text when the operation failed.
    pub error: Option<String>,
}

/// Query over persisted spans.  Unset fields do not filter.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    /// Only spans of this type.
    pub span_type: Option<SpanType>,
    /// Only spans with this operation name.
    pub operation: Option<String>,
    /// Only spans starting at or after this time.
    pub start_time: Option<DateTime<Utc>>,
    /// Only spans starting at or before this time.
    pub end_time: Option<DateTime<Utc>>,
    /// Only spans with at least this many total tokens.
    pub min_tokens: Option<usize>,
    /// Only spans of this trace.
    pub trace_id: Option<String>,
}

impl AuditQuery {
    fn matches(&self, span: &AuditSpan) -> bool {
        if let Some(span_type) = self.span_type {
            if span.span_type != span_type {
                return false;
            }
        }
        if let Some(operation) = &self.operation {
            if &span.operation != operation {
                return false;
            }
        }
        if let Some(start) = self.start_time {
            if span.start_time < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if span.start_time > end {
                return false;
            }
        }
        if let Some(min_tokens) = self.min_tokens {
            if span.tokens.as_ref().map(|t| t.total_tokens).unwrap_or(0) < min_tokens {
                return false;
            }
        }
        if let Some(trace_id) = &self.trace_id {
            if &span.trace_id != trace_id {
                return false;
            }
        }
        true
    }
}

/// Persistence backend for audit spans.
#[async_trait::async_trait]
pub trait AuditStore: Send + Sync {
    /// Persist one finished span.
    async fn write(&self, span: &AuditSpan) -> Result<(), AiError>;

    /// Query persisted spans.
    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditSpan>, AiError>;

    /// Export one trace's spans as a JSON array.
    async fn export_trace(&self, trace_id: &str) -> Result<Value, AiError> {
        let spans = self
            .query(&AuditQuery {
                trace_id: Some(trace_id.to_string()),
                ..Default::default()
            })
            .await?;
        serde_json::to_value(spans).map_err(|e| AiError::Audit(format!("export failed: {}", e)))
    }
}

/// In-memory ring store.
pub struct MemoryAuditStore {
    spans: Mutex<std::collections::VecDeque<AuditSpan>>,
    capacity: usize,
}

impl MemoryAuditStore {
    /// A ring holding up to `capacity` spans (oldest evicted first).
    pub fn new(capacity: usize) -> Self {
        MemoryAuditStore {
            spans: Mutex::new(std::collections::VecDeque::new()),
            capacity: capacity.max(1),
        }
    }
}

impl Default for MemoryAuditStore {
    fn default() -> Self {
        Self::new(1_000)
    }
}

#[async_trait::async_trait]
impl AuditStore for MemoryAuditStore {
    async fn write(&self, span: &AuditSpan) -> Result<(), AiError> {
        let mut spans = self
            .spans
            .lock()
            .map_err(|_| AiError::Audit("memory store lock poisoned".into()))?;
        if spans.len() >= self.capacity {
            spans.pop_front();
        }
        spans.push_back(span.clone());
        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditSpan>, AiError> {
        let spans = self
            .spans
            .lock()
            .map_err(|_| AiError::Audit("memory store lock poisoned".into()))?;
        Ok(spans.iter().filter(|s| query.matches(s)).cloned().collect())
    }
}

/// NDJSON append-file store.
pub struct FileAuditStore {
    path: PathBuf,
    file_lock: Mutex<()>,
}

impl FileAuditStore {
    /// Open (creating if absent) the NDJSON file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AiError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| AiError::Audit(format!("cannot create {:?}: {}", parent, e)))?;
            }
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| AiError::Audit(format!("cannot open {:?}: {}", path, e)))?;
        Ok(FileAuditStore {
            path,
            file_lock: Mutex::new(()),
        })
    }
}

#[async_trait::async_trait]
impl AuditStore for FileAuditStore {
    async fn write(&self, span: &AuditSpan) -> Result<(), AiError> {
        let line = serde_json::to_string(span)
            .map_err(|e| AiError::Audit(format!("span encode failed: {}", e)))?;
        let _guard = self
            .file_lock
            .lock()
            .map_err(|_| AiError::Audit("file store lock poisoned".into()))?;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| AiError::Audit(format!("cannot append {:?}: {}", self.path, e)))?;
        writeln!(file, "{}", line).map_err(|e| AiError::Audit(format!("append failed: {}", e)))?;
        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditSpan>, AiError> {
        let _guard = self
            .file_lock
            .lock()
            .map_err(|_| AiError::Audit("file store lock poisoned".into()))?;
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| AiError::Audit(format!("cannot read {:?}: {}", self.path, e)))?;
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<AuditSpan>(line).ok())
            .filter(|span| query.matches(span))
            .collect())
    }
}

/// SQL store over the shared executor seam.
///
/// Expected table shape: `(span_id, parent_span_id, trace_id, span_type,
/// operation, start_time, end_time, input, output, prompt_tokens,
/// completion_tokens, total_tokens, metadata, error)`.
pub struct SqlAuditStore {
    executor: Arc<dyn SqlExecutor>,
    table: String,
}

impl SqlAuditStore {
    /// A store writing to `table` through `executor`.
    pub fn new(executor: Arc<dyn SqlExecutor>, table: impl Into<String>) -> Self {
        SqlAuditStore {
            executor,
            table: table.into(),
        }
    }
}

#[async_trait::async_trait]
impl AuditStore for SqlAuditStore {
    async fn write(&self, span: &AuditSpan) -> Result<(), AiError> {
        let sql = format!(
            "INSERT INTO {} (span_id, parent_span_id, trace_id, span_type, operation, \
             start_time, end_time, input, output, prompt_tokens, completion_tokens, \
             total_tokens, metadata, error) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.table
        );
        let tokens = span.tokens.clone().unwrap_or_default();
        let params = vec![
            Value::String(span.span_id.clone()),
            span.parent_span_id
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null),
            Value::String(span.trace_id.clone()),
            serde_json::to_value(span.span_type).unwrap_or(Value::Null),
            Value::String(span.operation.clone()),
            Value::String(span.start_time.to_rfc3339()),
            span.end_time
                .map(|t| Value::String(t.to_rfc3339()))
                .unwrap_or(Value::Null),
            span.input.clone().unwrap_or(Value::Null),
            span.output.clone().unwrap_or(Value::Null),
            Value::from(tokens.prompt_tokens),
            Value::from(tokens.completion_tokens),
            Value::from(tokens.total_tokens),
            Value::Object(span.metadata.clone()),
            span.error.clone().map(Value::String).unwrap_or(Value::Null),
        ];
        self.executor
            .execute(&sql, &params)
            .await
            .map_err(|e| AiError::Audit(e.to_string()))?;
        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditSpan>, AiError> {
        // Filtering happens client-side; the executor seam keeps SQL simple.
        let sql = format!("SELECT * FROM {} ORDER BY start_time", self.table);
        let rows = self
            .executor
            .query(&sql, &[])
            .await
            .map_err(|e| AiError::Audit(e.to_string()))?;
        Ok(rows
            .into_iter()
            .filter_map(|row| serde_json::from_value(Value::Object(row)).ok())
            .filter(|span| query.matches(span))
            .collect())
    }
}

/// Replace values under matching keys and truncate long strings.
///
/// Key matching is case-insensitive substring containment against each
/// pattern, so the default `apiKey` pattern also catches `api_key_id`.
pub fn sanitize_value(value: &Value, settings: &AuditSettings, max_size: usize) -> Value {
    match value {
        Value::Object(map) => {
            let mut sanitized = Map::new();
            for (key, entry) in map {
                let key_lower = key.to_ascii_lowercase();
                let redact = settings
                    .sanitize_patterns
                    .iter()
                    .any(|pattern| key_lower.contains(&pattern.to_ascii_lowercase()));
                if redact {
                    sanitized.insert(key.clone(), Value::String(settings.redact_value.clone()));
                } else {
                    sanitized.insert(key.clone(), sanitize_value(entry, settings, max_size));
                }
            }
            Value::Object(sanitized)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| sanitize_value(item, settings, max_size))
                .collect(),
        ),
        Value::String(text) if text.len() > max_size => {
            let cut = text
                .char_indices()
                .take_while(|(i, _)| *i < max_size)
                .last()
                .map(|(i, c)| i + c.len_utf8())
                .unwrap_or(0);
            Value::String(format!("{}…[truncated]", &text[..cut]))
        }
        other => other.clone(),
    }
}

/// A trace under construction: a stack of open spans plus the store.
pub struct AuditContext {
    trace_id: String,
    settings: AuditSettings,
    store: Arc<dyn AuditStore>,
    open: Mutex<Vec<AuditSpan>>,
}

impl AuditContext {
    /// Start a fresh trace against `store`.
    pub fn new(settings: AuditSettings, store: Arc<dyn AuditStore>) -> Self {
        AuditContext {
            trace_id: uuid::Uuid::new_v4().to_string(),
            settings,
            store,
            open: Mutex::new(Vec::new()),
        }
    }

    /// The trace ID spans are recorded under.
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Push a child of the current span; returns its span ID.
    pub fn start_span(&self, span_type: SpanType, operation: impl Into<String>) -> String {
        self.start_span_with_input(span_type, operation, None)
    }

    /// Push a child span capturing an input value.
    pub fn start_span_with_input(
        &self,
        span_type: SpanType,
        operation: impl Into<String>,
        input: Option<Value>,
    ) -> String {
        let span_id = uuid::Uuid::new_v4().to_string();
        let mut open = match self.open.lock() {
            Ok(open) => open,
            Err(_) => {
                log::error!("audit context lock poisoned; span dropped");
                return span_id;
            }
        };
        let parent_span_id = open.last().map(|s| s.span_id.clone());
        let input = if self.settings.capture_input {
            input.map(|v| sanitize_value(&v, &self.settings, self.settings.max_input_size))
        } else {
            None
        };
        open.push(AuditSpan {
            span_id: span_id.clone(),
            parent_span_id,
            trace_id: self.trace_id.clone(),
            span_type,
            operation: operation.into(),
            start_time: Utc::now(),
            end_time: None,
            input,
            output: None,
            tokens: None,
            metadata: Map::new(),
            error: None,
        });
        span_id
    }

    /// Pop the current span, record its output and tokens, and persist it.
    ///
    /// Store failures are logged and swallowed; the caller never sees them.
    pub async fn end_span(&self, output: Option<Value>, tokens: Option<TokenUsage>) {
        self.end_span_with_error(output, tokens, None).await
    }

    /// Pop the current span recording a failure.
    pub async fn end_span_with_error(
        &self,
        output: Option<Value>,
        tokens: Option<TokenUsage>,
        error: Option<String>,
    ) {
        let span = {
            let mut open = match self.open.lock() {
                Ok(open) => open,
                Err(_) => {
                    log::error!("audit context lock poisoned; span dropped");
                    return;
                }
            };
            match open.pop() {
                Some(span) => span,
                None => {
                    log::warn!("end_span with no open span in trace {}", self.trace_id);
                    return;
                }
            }
        };
        let mut span = span;
        span.end_time = Some(Utc::now());
        span.tokens = tokens;
        span.error = error;
        if self.settings.capture_output {
            span.output =
                output.map(|v| sanitize_value(&v, &self.settings, self.settings.max_output_size));
        }
        if let Err(e) = self.store.write(&span).await {
            log::error!("audit write failed (never propagated): {}", e);
        }
    }

    /// Number of spans currently open.
    pub fn depth(&self) -> usize {
        self.open.lock().map(|open| open.len()).unwrap_or(0)
    }
}

/// Event-bus interceptor that wraps lifecycle events into spans.
///
/// `*Started` events open a span keyed by `(type, operation)`;
/// `*Completed` events close the most recent matching one.  Register it on
/// the global bus to audit every operation without touching call sites.
pub struct AuditInterceptor {
    context: Arc<AuditContext>,
    // (span type, operation) → LIFO of open span ids, for correlation.
    pending: Mutex<HashMap<(SpanType, String), Vec<String>>>,
}

impl AuditInterceptor {
    /// An interceptor recording into `context`.
    pub fn new(context: Arc<AuditContext>) -> Self {
        AuditInterceptor {
            context,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn note_start(&self, span_type: SpanType, operation: &str, input: Option<Value>) {
        if !self.context.settings.effective_enabled() {
            return;
        }
        let span_id = self
            .context
            .start_span_with_input(span_type, operation, input);
        if let Ok(mut pending) = self.pending.lock() {
            pending
                .entry((span_type, operation.to_string()))
                .or_default()
                .push(span_id);
        }
    }

    async fn note_end(
        &self,
        span_type: SpanType,
        operation: &str,
        output: Option<Value>,
        tokens: Option<TokenUsage>,
        error: Option<String>,
    ) {
        let known = self
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.get_mut(&(span_type, operation.to_string()))?.pop());
        if known.is_some() {
            self.context
                .end_span_with_error(output, tokens, error)
                .await;
        }
    }
}

#[async_trait::async_trait]
impl EventHandler for AuditInterceptor {
    async fn on_event(&self, event: &AiEvent) {
        match event {
            AiEvent::ChatRequested { provider, .. } => {
                self.note_start(SpanType::Model, provider, None);
            }
            AiEvent::ChatCompleted {
                provider, usage, ..
            } => {
                self.note_end(SpanType::Model, provider, None, usage.clone(), None)
                    .await;
            }
            AiEvent::EmbedRequested { provider, .. } => {
                self.note_start(SpanType::Embed, provider, None);
            }
            AiEvent::EmbedCompleted { provider, .. } => {
                self.note_end(SpanType::Embed, provider, None, None, None).await;
            }
            AiEvent::AgentRunStarted {
                agent,
                input_preview,
                ..
            } => {
                let input = if self.context.settings.capture_input {
                    Some(Value::String(input_preview.clone()))
                } else {
                    None
                };
                self.note_start(SpanType::Agent, agent, input);
            }
            AiEvent::AgentRunCompleted { agent, usage, .. } => {
                self.note_end(SpanType::Agent, agent, None, usage.clone(), None)
                    .await;
            }
            AiEvent::ToolExecutionStarted {
                tool, arguments, ..
            } => {
                let input = if self.context.settings.capture_tool_args {
                    Some(arguments.clone())
                } else {
                    None
                };
                self.note_start(SpanType::Tool, tool, input);
            }
            AiEvent::ToolExecutionCompleted {
                tool, error, ..
            } => {
                self.note_end(SpanType::Tool, tool, None, None, error.clone())
                    .await;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> (Arc<MemoryAuditStore>, AuditContext) {
        let store = Arc::new(MemoryAuditStore::default());
        let settings = AuditSettings {
            enabled: Some(true),
            ..Default::default()
        };
        (store.clone(), AuditContext::new(settings, store))
    }

    #[tokio::test]
    async fn spans_nest_under_the_current_parent() {
        let (store, context) = context();
        let outer = context.start_span(SpanType::Workflow, "pipeline");
        let inner = context.start_span(SpanType::Model, "openai");
        assert_ne!(outer, inner);
        context.end_span(None, None).await;
        context.end_span(None, None).await;

        let spans = store.query(&AuditQuery::default()).await.unwrap();
        assert_eq!(spans.len(), 2);
        let model = spans.iter().find(|s| s.span_type == SpanType::Model).unwrap();
        assert_eq!(model.parent_span_id.as_deref(), Some(outer.as_str()));
        assert!(model.end_time.is_some());
    }

    #[tokio::test]
    async fn sanitization_redacts_and_truncates() {
        let settings = AuditSettings {
            max_input_size: 10,
            ..Default::default()
        };
        let value = serde_json::json!({
            "apiKey": "sk-secret-value",
            "nested": {"password": "hunter2", "note": "0123456789ABCDEF"},
        });
        let sanitized = sanitize_value(&value, &settings, settings.max_input_size);
        assert_eq!(sanitized["apiKey"], serde_json::json!("[REDACTED]"));
        assert_eq!(sanitized["nested"]["password"], serde_json::json!("[REDACTED]"));
        let note = sanitized["nested"]["note"].as_str().unwrap();
        assert!(note.contains("[truncated]"));
        assert!(note.starts_with("0123456789"));
    }

    #[tokio::test]
    async fn query_filters_by_type_operation_and_tokens() {
        let (store, context) = context();
        context.start_span(SpanType::Model, "openai");
        context
            .end_span(
                None,
                Some(TokenUsage {
                    prompt_tokens: 100,
                    completion_tokens: 50,
                    total_tokens: 150,
                }),
            )
            .await;
        context.start_span(SpanType::Tool, "get_weather");
        context.end_span(None, None).await;

        let models = store
            .query(&AuditQuery {
                span_type: Some(SpanType::Model),
                min_tokens: Some(100),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].operation, "openai");

        let tools = store
            .query(&AuditQuery {
                operation: Some("get_weather".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(tools.len(), 1);
    }

    #[tokio::test]
    async fn export_trace_returns_only_that_trace() {
        let (store, context) = context();
        context.start_span(SpanType::Workflow, "job");
        context.end_span(None, None).await;

        let exported = store.export_trace(context.trace_id()).await.unwrap();
        assert_eq!(exported.as_array().unwrap().len(), 1);
        let other = store.export_trace("no-such-trace").await.unwrap();
        assert!(other.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn interceptor_wraps_event_pairs() {
        let (store, context) = context();
        let interceptor = AuditInterceptor::new(Arc::new(context));
        interceptor
            .on_event(&AiEvent::ToolExecutionStarted {
                agent: None,
                tool: "search".into(),
                arguments: serde_json::json!({"q": "x"}),
            })
            .await;
        interceptor
            .on_event(&AiEvent::ToolExecutionCompleted {
                agent: None,
                tool: "search".into(),
                success: true,
                error: None,
                duration_ms: 3,
            })
            .await;

        let spans = store.query(&AuditQuery::default()).await.unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].span_type, SpanType::Tool);
        assert_eq!(spans[0].operation, "search");
    }

    #[tokio::test]
    async fn file_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAuditStore::open(dir.path().join("audit.ndjson")).unwrap();
        let span = AuditSpan {
            span_id: "s1".into(),
            parent_span_id: None,
            trace_id: "t1".into(),
            span_type: SpanType::Model,
            operation: "openai".into(),
            start_time: Utc::now(),
            end_time: Some(Utc::now()),
            input: None,
            output: Some(Value::String("ok".into())),
            tokens: None,
            metadata: Map::new(),
            error: None,
        };
        store.write(&span).await.unwrap();
        let spans = store.query(&AuditQuery::default()).await.unwrap();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].span_id, "s1");
    }
}
