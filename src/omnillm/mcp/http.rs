//! HTTP endpoint for MCP servers.
//!
//! The endpoint pipeline runs, in order: body-size check (413), CORS
//! (exact, `*.domain` wildcard, or `*`), basic auth (401, constant-time
//! comparison), API-key validation via a caller-registered callback (401),
//! then JSON-RPC dispatch.  Every response (success, error, and preflight
//! alike) carries the fixed security header set.
//!
//! # Example
//!
//! ```rust,no_run
//! use omnillm::McpServer;
//! use omnillm::omnillm::mcp::http::{serve, HttpConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let server = McpServer::instance("default");
//! let instance = serve(server, "127.0.0.1:8321".parse()?, HttpConfig::default()).await?;
//! println!("MCP listening on {}", instance.addr);
//! # Ok(())
//! # }
//! ```

use crate::omnillm::mcp::protocol::{JsonRpcRequest, JsonRpcResponse, INVALID_REQUEST, PARSE_ERROR};
use crate::omnillm::mcp::server::McpServer;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use base64::Engine;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Fixed security headers applied to every response.
const SECURITY_HEADERS: &[(&str, &str)] = &[
    ("X-Content-Type-Options", "nosniff"),
    ("X-Frame-Options", "DENY"),
    ("X-XSS-Protection", "1; mode=block"),
    ("Referrer-Policy", "strict-origin-when-cross-origin"),
    (
        "Content-Security-Policy",
        "default-src 'none'; frame-ancestors 'none'",
    ),
    (
        "Strict-Transport-Security",
        "max-age=31536000; includeSubDomains",
    ),
    (
        "Permissions-Policy",
        "geolocation=(), microphone=(), camera=()",
    ),
];

/// Request context handed to an API-key validation callback.
#[derive(Debug, Clone)]
pub struct ApiKeyContext {
    /// HTTP method of the request.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Request headers.
    pub headers: HashMap<String, String>,
}

/// Callback validating an extracted API key; `false` rejects with 401.
pub type ApiKeyValidator = Arc<dyn Fn(&str, &ApiKeyContext) -> bool + Send + Sync>;

/// CORS policy for the endpoint.
#[derive(Debug, Clone, Default)]
pub struct CorsConfig {
    /// Allowed origins.  Entries match exactly, as `*.domain` wildcards,
    /// or `"*"` for every origin.  Empty allows none.
    pub allowed_origins: Vec<String>,
}

impl CorsConfig {
    /// Allow every origin.
    pub fn allow_all() -> Self {
        CorsConfig {
            allowed_origins: vec!["*".to_string()],
        }
    }

    /// Resolve the `Access-Control-Allow-Origin` value for a request
    /// origin, or `None` when the origin is not allowed.
    pub fn resolve(&self, origin: Option<&str>) -> Option<String> {
        let origin = origin?;
        for allowed in &self.allowed_origins {
            if allowed == "*" {
                return Some("*".to_string());
            }
            if allowed == origin {
                return Some(origin.to_string());
            }
            if let Some(domain) = allowed.strip_prefix("*.") {
                // `*.example.com` matches `sub.example.com` but not the
                // bare `example.com`.
                let host = origin
                    .strip_prefix("https://")
                    .or_else(|| origin.strip_prefix("http://"))
                    .unwrap_or(origin);
                let host = host.split(':').next().unwrap_or(host);
                if host.ends_with(&format!(".{}", domain)) {
                    return Some(origin.to_string());
                }
            }
        }
        None
    }
}

/// Endpoint configuration.
#[derive(Clone, Default)]
pub struct HttpConfig {
    /// Reject bodies larger than this many bytes; 0 means unlimited.
    pub max_request_body_size: usize,
    /// CORS policy.
    pub cors: CorsConfig,
    /// `Basic` credentials; `None` disables basic auth.
    pub basic_auth: Option<(String, String)>,
    /// API-key callback; `None` disables key validation.
    pub api_key_validator: Option<ApiKeyValidator>,
}

struct EndpointState {
    server: Arc<McpServer>,
    config: HttpConfig,
}

/// Build the axum router for an MCP server.
pub fn router(server: Arc<McpServer>, config: HttpConfig) -> Router {
    let state = Arc::new(EndpointState { server, config });
    Router::new()
        .route("/", post(handle_rpc).options(handle_preflight))
        .with_state(state)
}

/// A running MCP HTTP endpoint.
pub struct HttpServerInstance {
    /// Bound socket address.
    pub addr: SocketAddr,
    handle: tokio::task::JoinHandle<Result<(), std::io::Error>>,
}

impl HttpServerInstance {
    /// Stop the endpoint.
    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

/// Bind and serve an MCP server over HTTP.
pub async fn serve(
    server: Arc<McpServer>,
    addr: SocketAddr,
    config: HttpConfig,
) -> Result<HttpServerInstance, std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let addr = listener.local_addr()?;
    let app = router(server, config);
    let handle = tokio::spawn(async move { axum::serve(listener, app).await });
    Ok(HttpServerInstance { addr, handle })
}

fn apply_security_headers(response: &mut Response) {
    let headers = response.headers_mut();
    for (name, value) in SECURITY_HEADERS {
        if let Ok(value) = HeaderValue::from_str(value) {
            headers.insert(*name, value);
        }
    }
}

fn respond(status: StatusCode, body: Value, cors_origin: Option<&str>) -> Response {
    let mut response = (status, axum::Json(body)).into_response();
    apply_security_headers(&mut response);
    if let Some(origin) = cors_origin {
        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(origin) {
            headers.insert("Access-Control-Allow-Origin", value);
        }
        headers.insert(
            "Access-Control-Allow-Headers",
            HeaderValue::from_static("Content-Type, Authorization, X-API-Key"),
        );
    }
    response
}

fn rpc_error(status: StatusCode, code: i64, message: &str, cors_origin: Option<&str>) -> Response {
    let body = json!({
        "jsonrpc": "2.0",
        "id": null,
        "error": {"code": code, "message": message},
    });
    respond(status, body, cors_origin)
}

/// Constant-time string comparison (credential checks).
fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn check_basic_auth(config: &HttpConfig, headers: &HeaderMap) -> bool {
    let (user, pass) = match &config.basic_auth {
        Some(credentials) => credentials,
        None => return true,
    };
    let supplied = match header_value(headers, "authorization")
        .and_then(|auth| auth.strip_prefix("Basic "))
        .and_then(|encoded| base64::engine::general_purpose::STANDARD.decode(encoded).ok())
        .and_then(|decoded| String::from_utf8(decoded).ok())
    {
        Some(supplied) => supplied,
        None => return false,
    };
    constant_time_eq(&supplied, &format!("{}:{}", user, pass))
}

fn check_api_key(config: &HttpConfig, headers: &HeaderMap, method: &Method, uri: &Uri) -> bool {
    let validator = match &config.api_key_validator {
        Some(validator) => validator,
        None => return true,
    };
    let key = header_value(headers, "x-api-key").or_else(|| {
        header_value(headers, "authorization").and_then(|auth| auth.strip_prefix("Bearer "))
    });
    let key = match key {
        Some(key) => key,
        None => return false,
    };
    let context = ApiKeyContext {
        method: method.to_string(),
        path: uri.path().to_string(),
        headers: headers
            .iter()
            .filter_map(|(name, value)| {
                Some((name.to_string(), value.to_str().ok()?.to_string()))
            })
            .collect(),
    };
    validator(key, &context)
}

async fn handle_preflight(
    State(state): State<Arc<EndpointState>>,
    headers: HeaderMap,
) -> Response {
    let origin = header_value(&headers, "origin");
    let resolved = state.config.cors.resolve(origin);
    let mut response = StatusCode::NO_CONTENT.into_response();
    apply_security_headers(&mut response);
    if let Some(origin) = resolved {
        let response_headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&origin) {
            response_headers.insert("Access-Control-Allow-Origin", value);
        }
        response_headers.insert(
            "Access-Control-Allow-Methods",
            HeaderValue::from_static("POST, OPTIONS"),
        );
        response_headers.insert(
            "Access-Control-Allow-Headers",
            HeaderValue::from_static("Content-Type, Authorization, X-API-Key"),
        );
        response_headers.insert(
            "Access-Control-Max-Age",
            HeaderValue::from_static("86400"),
        );
    }
    response
}

async fn handle_rpc(
    State(state): State<Arc<EndpointState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let config = &state.config;
    let cors_origin = config.cors.resolve(header_value(&headers, "origin"));
    let cors = cors_origin.as_deref();

    // 1. Body-size check: the declared Content-Length or the actual body,
    //    whichever is larger.  Exactly at the limit passes.
    if config.max_request_body_size > 0 {
        let declared = header_value(&headers, "content-length")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        let size = declared.max(body.len());
        if size > config.max_request_body_size {
            return rpc_error(
                StatusCode::PAYLOAD_TOO_LARGE,
                INVALID_REQUEST,
                &format!(
                    "request body too large: {} bytes exceeds the {} byte limit",
                    size, config.max_request_body_size
                ),
                cors,
            );
        }
    }

    // 2. CORS was resolved above; a disallowed origin simply gets no CORS
    //    headers (the browser blocks the response).

    // 3. Basic auth.
    if !check_basic_auth(config, &headers) {
        return rpc_error(
            StatusCode::UNAUTHORIZED,
            INVALID_REQUEST,
            "basic authentication failed",
            cors,
        );
    }

    // 4. API-key validation.
    if !check_api_key(config, &headers, &method, &uri) {
        return rpc_error(
            StatusCode::UNAUTHORIZED,
            INVALID_REQUEST,
            "API key validation failed",
            cors,
        );
    }

    // 5. JSON-RPC dispatch.
    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return rpc_error(
                StatusCode::BAD_REQUEST,
                PARSE_ERROR,
                &format!("invalid JSON-RPC body: {}", e),
                cors,
            );
        }
    };
    let response: JsonRpcResponse = state.server.handle(request).await;
    let body = serde_json::to_value(&response).unwrap_or_else(|_| {
        json!({"jsonrpc": "2.0", "id": null, "error": {"code": -32603, "message": "encode failure"}})
    });
    respond(StatusCode::OK, body, cors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::omnillm::tool::Tool;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_router(config: HttpConfig) -> Router {
        let server = McpServer::force_instance("http-test");
        server
            .register_tool(
                Tool::new("search", "Search")
                    .arg("query")
                    .with_callable(|args| async move { Ok(args["query"].clone()) }),
            )
            .await;
        router(server, config)
    }

    fn rpc_body(method: &str) -> Body {
        Body::from(
            serde_json::to_vec(&json!({"jsonrpc": "2.0", "method": method, "id": "1"})).unwrap(),
        )
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn body_at_limit_passes_one_byte_over_rejects() {
        let config = HttpConfig {
            max_request_body_size: 100,
            ..Default::default()
        };

        // Exactly at the limit: allowed.
        let padding = " ".repeat(100 - 42);
        let exact = format!("{{\"jsonrpc\":\"2.0\",\"method\":\"ping\",\"id\":\"1\"}}{}", padding);
        assert_eq!(exact.len(), 100);
        let response = test_router(config.clone()).await
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .header("content-type", "application/json")
                    .body(Body::from(exact))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Declared Content-Length over the limit: 413 with a JSON-RPC
        // error mentioning "too large" and the security header set.
        let response = test_router(config).await
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .header("content-type", "application/json")
                    .header("content-length", "150")
                    .body(Body::from(" ".repeat(150)))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            response.headers().get("X-Content-Type-Options").unwrap(),
            "nosniff"
        );
        let body = body_json(response).await;
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("too large"));
    }

    #[tokio::test]
    async fn cors_wildcard_matches_subdomain_not_apex() {
        let config = HttpConfig {
            cors: CorsConfig {
                allowed_origins: vec!["*.example.com".into()],
            },
            ..Default::default()
        };

        let allowed = test_router(config.clone()).await
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .header("origin", "https://sub.example.com")
                    .body(rpc_body("ping"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            allowed
                .headers()
                .get("Access-Control-Allow-Origin")
                .unwrap(),
            "https://sub.example.com"
        );

        let denied = test_router(config).await
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .header("origin", "https://example.com")
                    .body(rpc_body("ping"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(denied.headers().get("Access-Control-Allow-Origin").is_none());
        // The request still succeeds; the browser enforces the block.
        assert_eq!(denied.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn preflight_carries_cors_and_security_headers() {
        let config = HttpConfig {
            cors: CorsConfig::allow_all(),
            ..Default::default()
        };
        let response = test_router(config).await
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/")
                    .header("origin", "https://anywhere.dev")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response
                .headers()
                .get("Access-Control-Allow-Origin")
                .unwrap(),
            "*"
        );
        assert_eq!(response.headers().get("X-Frame-Options").unwrap(), "DENY");
    }

    #[tokio::test]
    async fn basic_auth_enforced() {
        let config = HttpConfig {
            basic_auth: Some(("admin".into(), "s3cret".into())),
            ..Default::default()
        };

        let denied = test_router(config.clone()).await
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .body(rpc_body("ping"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let token = base64::engine::general_purpose::STANDARD.encode("admin:s3cret");
        let allowed = test_router(config).await
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .header("authorization", format!("Basic {}", token))
                    .body(rpc_body("ping"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn api_key_callback_receives_context() {
        let config = HttpConfig {
            api_key_validator: Some(Arc::new(|key, context| {
                key == "valid-key" && context.method == "POST" && context.path == "/"
            })),
            ..Default::default()
        };

        let denied = test_router(config.clone()).await
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .header("x-api-key", "wrong")
                    .body(rpc_body("ping"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        // Bearer form is accepted too.
        let allowed = test_router(config).await
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .header("authorization", "Bearer valid-key")
                    .body(rpc_body("ping"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
    }
}
