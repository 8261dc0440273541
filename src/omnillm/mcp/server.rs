//! MCP server: named singletons hosting tools, resources, and prompts.
//!
//! Servers are process-wide singletons keyed by name (default
//! `"default"`): [`McpServer::instance`] returns the same instance for
//! equal names, distinct instances for different names, and `force`
//! replaces a registered instance.  Each server dispatches the JSON-RPC
//! method set and keeps request statistics (enabled by default,
//! toggleable).
//!
//! # Example
//!
//! ```rust
//! use omnillm::{McpServer, Tool};
//! use omnillm::omnillm::mcp::protocol::JsonRpcRequest;
//! use serde_json::json;
//!
//! # async fn run() {
//! let server = McpServer::instance("default");
//! server
//!     .register_tool(
//!         Tool::new("search", "Full-text search")
//!             .arg("query")
//!             .with_callable(|args| async move { Ok(args["query"].clone()) }),
//!     )
//!     .await;
//!
//! let response = server
//!     .handle(JsonRpcRequest::new("1", "tools/list", None))
//!     .await;
//! assert_eq!(response.result.unwrap()["tools"][0]["name"], json!("search"));
//! # }
//! ```

use crate::omnillm::error::AiError;
use crate::omnillm::mcp::protocol::{
    JsonRpcRequest, JsonRpcResponse, INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND,
    PROTOCOL_VERSION,
};
use crate::omnillm::tool::Tool;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Instant;
use tokio::sync::RwLock;

/// Server name used when none is given.
pub const DEFAULT_SERVER_NAME: &str = "default";

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Async producer of a resource body.
pub type ResourceReader =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<String, AiError>> + Send>> + Send + Sync>;

/// A resource exposed over `resources/list` / `resources/read`.
#[derive(Clone)]
pub struct McpResource {
    /// Resource URI (e.g. `memory://notes/today`).
    pub uri: String,
    /// Display name.
    pub name: String,
    /// Description shown to clients.
    pub description: String,
    /// MIME type of the content.
    pub mime_type: String,
    reader: ResourceReader,
}

impl McpResource {
    /// A resource with a fixed text body.
    pub fn text(
        uri: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        mime_type: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        McpResource {
            uri: uri.into(),
            name: name.into(),
            description: description.into(),
            mime_type: mime_type.into(),
            reader: Arc::new(move || {
                let content = content.clone();
                Box::pin(async move { Ok(content) })
            }),
        }
    }

    /// A resource whose body is produced on each read.
    pub fn dynamic(
        uri: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        mime_type: impl Into<String>,
        reader: ResourceReader,
    ) -> Self {
        McpResource {
            uri: uri.into(),
            name: name.into(),
            description: description.into(),
            mime_type: mime_type.into(),
            reader,
        }
    }
}

/// One declared prompt argument.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PromptArgument {
    /// Argument name, substituted into the template as `${name}`.
    pub name: String,
    /// Description shown to clients.
    pub description: String,
    /// Whether `prompts/get` requires the argument.
    pub required: bool,
}

/// A prompt template exposed over `prompts/list` / `prompts/get`.
#[derive(Debug, Clone)]
pub struct McpPrompt {
    /// Prompt name.
    pub name: String,
    /// Description shown to clients.
    pub description: String,
    /// Declared arguments.
    pub arguments: Vec<PromptArgument>,
    /// Template with `${name}` placeholders.
    pub template: String,
}

impl McpPrompt {
    /// A prompt with no arguments.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        template: impl Into<String>,
    ) -> Self {
        McpPrompt {
            name: name.into(),
            description: description.into(),
            arguments: Vec::new(),
            template: template.into(),
        }
    }

    /// Declare an argument.
    pub fn argument(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        required: bool,
    ) -> Self {
        self.arguments.push(PromptArgument {
            name: name.into(),
            description: description.into(),
            required,
        });
        self
    }
}

/// Point-in-time statistics snapshot.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct McpStats {
    /// Requests handled (all methods).
    pub total_requests: u64,
    /// `tools/call` invocations.
    pub total_tool_invocations: u64,
    /// `resources/read` invocations.
    pub total_resource_reads: u64,
    /// `prompts/get` invocations.
    pub total_prompt_generations: u64,
    /// Responses that carried a JSON-RPC error.
    pub total_errors: u64,
    /// Running mean response time in milliseconds.
    pub avg_response_time_ms: f64,
    /// `(total_requests - total_errors) / total_requests * 100`.
    pub success_rate: f64,
    /// Seconds since the server was constructed.
    pub uptime_secs: u64,
    /// Time of the most recent request.
    pub last_request_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct StatsInner {
    total_requests: u64,
    total_tool_invocations: u64,
    total_resource_reads: u64,
    total_prompt_generations: u64,
    total_errors: u64,
    total_response_time_ms: f64,
    last_request_at: Option<DateTime<Utc>>,
}

/// An MCP server instance.
pub struct McpServer {
    /// Server name (the singleton registry key).
    pub name: String,
    tools: RwLock<HashMap<String, Tool>>,
    resources: RwLock<HashMap<String, McpResource>>,
    prompts: RwLock<HashMap<String, McpPrompt>>,
    stats_enabled: StdRwLock<bool>,
    stats: StdMutex<StatsInner>,
    started_at: Instant,
}

lazy_static! {
    static ref SERVERS: StdRwLock<HashMap<String, Arc<McpServer>>> =
        StdRwLock::new(HashMap::new());
}

impl McpServer {
    fn build(name: &str) -> Arc<McpServer> {
        Arc::new(McpServer {
            name: name.to_string(),
            tools: RwLock::new(HashMap::new()),
            resources: RwLock::new(HashMap::new()),
            prompts: RwLock::new(HashMap::new()),
            stats_enabled: StdRwLock::new(true),
            stats: StdMutex::new(StatsInner::default()),
            started_at: Instant::now(),
        })
    }

    /// The singleton instance for `name`, created on first use.
    pub fn instance(name: &str) -> Arc<McpServer> {
        let name = if name.is_empty() {
            DEFAULT_SERVER_NAME
        } else {
            name
        };
        if let Ok(servers) = SERVERS.read() {
            if let Some(existing) = servers.get(name) {
                return existing.clone();
            }
        }
        let mut servers = SERVERS.write().expect("server registry lock poisoned");
        servers
            .entry(name.to_string())
            .or_insert_with(|| Self::build(name))
            .clone()
    }

    /// Replace (or create) the instance for `name` with a fresh server.
    pub fn force_instance(name: &str) -> Arc<McpServer> {
        let server = Self::build(name);
        let mut servers = SERVERS.write().expect("server registry lock poisoned");
        servers.insert(name.to_string(), server.clone());
        server
    }

    /// Register a tool; same-named tools are replaced.
    pub async fn register_tool(&self, tool: Tool) {
        self.tools.write().await.insert(tool.name.clone(), tool);
    }

    /// Register a resource by URI.
    pub async fn register_resource(&self, resource: McpResource) {
        self.resources
            .write()
            .await
            .insert(resource.uri.clone(), resource);
    }

    /// Register a prompt by name.
    pub async fn register_prompt(&self, prompt: McpPrompt) {
        self.prompts
            .write()
            .await
            .insert(prompt.name.clone(), prompt);
    }

    /// Number of registered tools.
    pub async fn tool_count(&self) -> usize {
        self.tools.read().await.len()
    }

    /// Toggle statistics collection.
    pub fn set_stats_enabled(&self, enabled: bool) {
        if let Ok(mut flag) = self.stats_enabled.write() {
            *flag = enabled;
        }
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> McpStats {
        let inner = self.stats.lock().expect("stats lock poisoned");
        let avg = if inner.total_requests == 0 {
            0.0
        } else {
            inner.total_response_time_ms / inner.total_requests as f64
        };
        let success_rate = if inner.total_requests == 0 {
            100.0
        } else {
            (inner.total_requests - inner.total_errors) as f64 / inner.total_requests as f64
                * 100.0
        };
        McpStats {
            total_requests: inner.total_requests,
            total_tool_invocations: inner.total_tool_invocations,
            total_resource_reads: inner.total_resource_reads,
            total_prompt_generations: inner.total_prompt_generations,
            total_errors: inner.total_errors,
            avg_response_time_ms: avg,
            success_rate,
            uptime_secs: self.started_at.elapsed().as_secs(),
            last_request_at: inner.last_request_at,
        }
    }

    /// Dispatch one JSON-RPC request.
    pub async fn handle(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let started = Instant::now();
        let id = request.id.clone().unwrap_or(Value::Null);
        let method = request.method.clone();
        let response = self.dispatch(&method, request.params, id).await;

        let enabled = self.stats_enabled.read().map(|f| *f).unwrap_or(true);
        if enabled {
            if let Ok(mut inner) = self.stats.lock() {
                inner.total_requests += 1;
                inner.total_response_time_ms += started.elapsed().as_secs_f64() * 1000.0;
                inner.last_request_at = Some(Utc::now());
                if response.is_error() {
                    inner.total_errors += 1;
                } else {
                    match method.as_str() {
                        "tools/call" => inner.total_tool_invocations += 1,
                        "resources/read" => inner.total_resource_reads += 1,
                        "prompts/get" => inner.total_prompt_generations += 1,
                        _ => {}
                    }
                }
            }
        }
        response
    }

    async fn dispatch(&self, method: &str, params: Option<Value>, id: Value) -> JsonRpcResponse {
        match method {
            "initialize" => JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {
                        "tools": {},
                        "resources": {},
                        "prompts": {},
                    },
                    "serverInfo": {"name": self.name, "version": SERVER_VERSION},
                }),
            ),
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => {
                let tools = self.tools.read().await;
                let listed: Vec<Value> = tools
                    .values()
                    .map(|tool| {
                        let schema = tool.get_schema();
                        json!({
                            "name": tool.name,
                            "description": tool.description,
                            "inputSchema": schema["function"]["parameters"].clone(),
                        })
                    })
                    .collect();
                JsonRpcResponse::success(id, json!({ "tools": listed }))
            }
            "tools/call" => self.call_tool(params, id).await,
            "resources/list" => {
                let resources = self.resources.read().await;
                let listed: Vec<Value> = resources
                    .values()
                    .map(|resource| {
                        json!({
                            "uri": resource.uri,
                            "name": resource.name,
                            "description": resource.description,
                            "mimeType": resource.mime_type,
                        })
                    })
                    .collect();
                JsonRpcResponse::success(id, json!({ "resources": listed }))
            }
            "resources/read" => self.read_resource(params, id).await,
            "prompts/list" => {
                let prompts = self.prompts.read().await;
                let listed: Vec<Value> = prompts
                    .values()
                    .map(|prompt| {
                        json!({
                            "name": prompt.name,
                            "description": prompt.description,
                            "arguments": prompt.arguments,
                        })
                    })
                    .collect();
                JsonRpcResponse::success(id, json!({ "prompts": listed }))
            }
            "prompts/get" => self.get_prompt(params, id).await,
            other => JsonRpcResponse::failure(
                id,
                METHOD_NOT_FOUND,
                format!("method '{}' not found", other),
            ),
        }
    }

    async fn call_tool(&self, params: Option<Value>, id: Value) -> JsonRpcResponse {
        let params = params.unwrap_or(Value::Null);
        let name = match params.get("name").and_then(|n| n.as_str()) {
            Some(name) => name.to_string(),
            None => {
                return JsonRpcResponse::failure(id, INVALID_PARAMS, "missing tool name");
            }
        };
        let arguments: Map<String, Value> = params
            .get("arguments")
            .and_then(|a| a.as_object())
            .cloned()
            .unwrap_or_default();

        let tool = {
            let tools = self.tools.read().await;
            tools.get(&name).cloned()
        };
        match tool {
            Some(tool) => match tool.invoke(arguments).await {
                Ok(text) => JsonRpcResponse::success(
                    id,
                    json!({"content": [{"type": "text", "text": text}]}),
                ),
                Err(e) => JsonRpcResponse::failure(id, INTERNAL_ERROR, e.to_string()),
            },
            None => JsonRpcResponse::failure(
                id,
                INVALID_PARAMS,
                format!("tool '{}' not found", name),
            ),
        }
    }

    async fn read_resource(&self, params: Option<Value>, id: Value) -> JsonRpcResponse {
        let uri = match params
            .as_ref()
            .and_then(|p| p.get("uri"))
            .and_then(|u| u.as_str())
        {
            Some(uri) => uri.to_string(),
            None => {
                return JsonRpcResponse::failure(id, INVALID_PARAMS, "missing resource uri");
            }
        };
        let resource = {
            let resources = self.resources.read().await;
            resources.get(&uri).cloned()
        };
        match resource {
            Some(resource) => match (resource.reader)().await {
                Ok(text) => JsonRpcResponse::success(
                    id,
                    json!({"contents": [{
                        "uri": resource.uri,
                        "mimeType": resource.mime_type,
                        "text": text,
                    }]}),
                ),
                Err(e) => JsonRpcResponse::failure(id, INTERNAL_ERROR, e.to_string()),
            },
            None => JsonRpcResponse::failure(
                id,
                INVALID_PARAMS,
                format!("resource '{}' not found", uri),
            ),
        }
    }

    async fn get_prompt(&self, params: Option<Value>, id: Value) -> JsonRpcResponse {
        let params = params.unwrap_or(Value::Null);
        let name = match params.get("name").and_then(|n| n.as_str()) {
            Some(name) => name.to_string(),
            None => {
                return JsonRpcResponse::failure(id, INVALID_PARAMS, "missing prompt name");
            }
        };
        let prompt = {
            let prompts = self.prompts.read().await;
            prompts.get(&name).cloned()
        };
        let prompt = match prompt {
            Some(prompt) => prompt,
            None => {
                return JsonRpcResponse::failure(
                    id,
                    INVALID_PARAMS,
                    format!("prompt '{}' not found", name),
                );
            }
        };

        let arguments = params
            .get("arguments")
            .and_then(|a| a.as_object())
            .cloned()
            .unwrap_or_default();
        for declared in &prompt.arguments {
            if declared.required && !arguments.contains_key(&declared.name) {
                return JsonRpcResponse::failure(
                    id,
                    INVALID_PARAMS,
                    format!("missing required argument '{}'", declared.name),
                );
            }
        }
        let mut text = prompt.template.clone();
        for (key, value) in &arguments {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            text = text.replace(&format!("${{{}}}", key), &rendered);
        }
        JsonRpcResponse::success(
            id,
            json!({"messages": [{"role": "user", "content": {"type": "text", "text": text}}]}),
        )
    }
}
