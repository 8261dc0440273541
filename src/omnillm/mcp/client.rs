//! MCP client: a builder-configured JSON-RPC consumer.
//!
//! Transport failures never throw: every call resolves to an
//! [`McpResponse`] whose `success` flag and `error` field describe the
//! outcome, so callers handle network trouble and protocol errors the
//! same way.
//!
//! # Example
//!
//! ```rust,no_run
//! use omnillm::McpClient;
//!
//! # async fn run() {
//! let client = McpClient::new("http://localhost:8321")
//!     .with_timeout(10)
//!     .with_bearer_token("secret");
//!
//! let tools = client.list_tools().await;
//! if tools.success {
//!     println!("{} tools", tools.data["tools"].as_array().map(|a| a.len()).unwrap_or(0));
//! } else {
//!     eprintln!("listing failed: {}", tools.error.unwrap_or_default());
//! }
//! # }
//! ```

use crate::omnillm::mcp::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::omnillm::service::get_shared_http_client;
use base64::Engine;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Outcome callback attached via `on_success` / `on_error`.
pub type ResponseCallback = Arc<dyn Fn(&McpResponse) + Send + Sync>;

/// Uniform result envelope for every client call.
#[derive(Debug, Clone)]
pub struct McpResponse {
    /// True when the transport succeeded and the server returned a
    /// JSON-RPC result.
    pub success: bool,
    /// The JSON-RPC `result` (or `Null`).
    pub data: Value,
    /// Transport or JSON-RPC error text.
    pub error: Option<String>,
    /// HTTP status code; 0 when the request never reached the server.
    pub status_code: u16,
    /// Response headers.
    pub headers: HashMap<String, String>,
}

impl McpResponse {
    fn transport_failure(message: String) -> Self {
        McpResponse {
            success: false,
            data: Value::Null,
            error: Some(message),
            status_code: 0,
            headers: HashMap::new(),
        }
    }
}

/// JSON-RPC 2.0 client for a remote MCP server.
pub struct McpClient {
    base_url: String,
    timeout_secs: u64,
    headers: HashMap<String, String>,
    on_success: Option<ResponseCallback>,
    on_error: Option<ResponseCallback>,
    next_id: AtomicU64,
}

impl McpClient {
    /// A client for the MCP endpoint at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        McpClient {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout_secs: crate::omnillm::request::DEFAULT_TIMEOUT_SECS,
            headers: HashMap::new(),
            on_success: None,
            on_error: None,
            next_id: AtomicU64::new(1),
        }
    }

    /// Set the request timeout in seconds.
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_secs = seconds;
        self
    }

    /// Merge extra headers into every request.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Authenticate with a bearer token.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.headers
            .insert("Authorization".into(), format!("Bearer {}", token.into()));
        self
    }

    /// Authenticate with basic credentials.
    pub fn with_auth(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", user.into(), pass.into()));
        self.headers
            .insert("Authorization".into(), format!("Basic {}", encoded));
        self
    }

    /// Register a callback invoked on every successful response.
    pub fn on_success(mut self, callback: ResponseCallback) -> Self {
        self.on_success = Some(callback);
        self
    }

    /// Register a callback invoked on every failed response.
    pub fn on_error(mut self, callback: ResponseCallback) -> Self {
        self.on_error = Some(callback);
        self
    }

    /// Send an arbitrary JSON-RPC method.
    pub async fn send(&self, method: &str, params: Option<Value>) -> McpResponse {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, params);

        let mut builder = get_shared_http_client()
            .post(&self.base_url)
            .timeout(Duration::from_secs(self.timeout_secs))
            .header("Content-Type", "application/json");
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }

        let response = match builder.json(&request).send().await {
            Ok(response) => response,
            Err(e) => {
                let failure = McpResponse::transport_failure(format!("request failed: {}", e));
                self.notify(&failure);
                return failure;
            }
        };

        let status_code = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                Some((name.to_string(), value.to_str().ok()?.to_string()))
            })
            .collect();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                let failure =
                    McpResponse::transport_failure(format!("response read failed: {}", e));
                self.notify(&failure);
                return failure;
            }
        };

        let outcome = match serde_json::from_str::<JsonRpcResponse>(&text) {
            Ok(decoded) => match decoded.error {
                Some(error) => McpResponse {
                    success: false,
                    data: Value::Null,
                    error: Some(error.to_string()),
                    status_code,
                    headers,
                },
                None => McpResponse {
                    success: true,
                    data: decoded.result.unwrap_or(Value::Null),
                    error: None,
                    status_code,
                    headers,
                },
            },
            Err(e) => McpResponse {
                success: false,
                data: Value::Null,
                error: Some(format!("non-JSON-RPC response (HTTP {}): {}", status_code, e)),
                status_code,
                headers,
            },
        };
        self.notify(&outcome);
        outcome
    }

    fn notify(&self, response: &McpResponse) {
        let callback = if response.success {
            self.on_success.as_ref()
        } else {
            self.on_error.as_ref()
        };
        if let Some(callback) = callback {
            callback(response);
        }
    }

    /// `initialize`: server info and capabilities.
    pub async fn get_capabilities(&self) -> McpResponse {
        self.send(
            "initialize",
            Some(json!({
                "protocolVersion": crate::omnillm::mcp::protocol::PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": "omnillm", "version": env!("CARGO_PKG_VERSION")},
            })),
        )
        .await
    }

    /// `tools/list`.
    pub async fn list_tools(&self) -> McpResponse {
        self.send("tools/list", None).await
    }

    /// `tools/call`.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> McpResponse {
        self.send(
            "tools/call",
            Some(json!({"name": name, "arguments": arguments})),
        )
        .await
    }

    /// `resources/list`.
    pub async fn list_resources(&self) -> McpResponse {
        self.send("resources/list", None).await
    }

    /// `resources/read`.
    pub async fn read_resource(&self, uri: &str) -> McpResponse {
        self.send("resources/read", Some(json!({ "uri": uri }))).await
    }

    /// `prompts/list`.
    pub async fn list_prompts(&self) -> McpResponse {
        self.send("prompts/list", None).await
    }

    /// `prompts/get`.
    pub async fn get_prompt(&self, name: &str, arguments: Value) -> McpResponse {
        self.send(
            "prompts/get",
            Some(json!({"name": name, "arguments": arguments})),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn transport_failure_never_panics_and_fires_on_error() {
        let errored = Arc::new(AtomicBool::new(false));
        let flag = errored.clone();
        // Nothing listens on this port.
        let client = McpClient::new("http://127.0.0.1:9")
            .with_timeout(1)
            .on_error(Arc::new(move |response| {
                assert!(!response.success);
                flag.store(true, Ordering::SeqCst);
            }));

        let response = client.list_tools().await;
        assert!(!response.success);
        assert_eq!(response.status_code, 0);
        assert!(response.error.is_some());
        assert!(errored.load(Ordering::SeqCst));
    }

    #[test]
    fn auth_builders_set_authorization_header() {
        let bearer = McpClient::new("http://x").with_bearer_token("tok");
        assert_eq!(
            bearer.headers.get("Authorization").unwrap(),
            "Bearer tok"
        );
        let basic = McpClient::new("http://x").with_auth("u", "p");
        assert!(basic
            .headers
            .get("Authorization")
            .unwrap()
            .starts_with("Basic "));
    }
}
