use axum::body::Body;
use axum::http::{Request, StatusCode};
use omnillm::omnillm::mcp::http::{router, serve, CorsConfig, HttpConfig};
use omnillm::omnillm::mcp::protocol::JsonRpcRequest;
use omnillm::{McpClient, McpServer, Tool};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn server_with_search(name: &str) -> Arc<McpServer> {
    init_test_logging();
    let server = McpServer::force_instance(name);
    server
        .register_tool(
            Tool::new("search", "Full-text search")
                .arg("query")
                .with_callable(|args| async move { Ok(args["query"].clone()) }),
        )
        .await;
    server
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[test]
fn named_singletons_are_identical_per_name() {
    let first = McpServer::instance("singleton-check");
    let second = McpServer::instance("singleton-check");
    let other = McpServer::instance("singleton-other");
    assert!(Arc::ptr_eq(&first, &second));
    assert!(!Arc::ptr_eq(&first, &other));
}

#[tokio::test]
async fn tools_list_over_http_returns_the_registered_tool() {
    let server = server_with_search("e2e-tools-list").await;
    let app = router(server, HttpConfig::default());

    let request = json!({"jsonrpc": "2.0", "method": "tools/list", "id": "1"});
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&request).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let tools = body["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["name"], json!("search"));
}

#[tokio::test]
async fn oversized_body_is_rejected_with_413_and_headers() {
    let server = server_with_search("e2e-body-limit").await;
    let app = router(
        server,
        HttpConfig {
            max_request_body_size: 100,
            ..Default::default()
        },
    );

    let response = app
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
    assert_eq!(body["jsonrpc"], json!("2.0"));
    assert!(body["error"]["message"].as_str().unwrap().contains("too large"));
}

#[tokio::test]
async fn client_talks_to_a_live_endpoint() {
    let server = server_with_search("e2e-live").await;
    server
        .register_resource(omnillm::omnillm::mcp::server::McpResource::text(
            "notes://pinned",
            "pinned",
            "Pinned note",
            "text/plain",
            "ship it",
        ))
        .await;
    server
        .register_prompt(
            omnillm::omnillm::mcp::server::McpPrompt::new(
                "summarize",
                "Summarize a text",
                "Summarize: ${text}",
            )
            .argument("text", "Text to summarize", true),
        )
        .await;

    let instance = serve(
        server,
        "127.0.0.1:0".parse().unwrap(),
        HttpConfig::default(),
    )
    .await
    .unwrap();
    let client = McpClient::new(format!("http://{}", instance.addr)).with_timeout(5);

    let capabilities = client.get_capabilities().await;
    assert!(capabilities.success);
    assert_eq!(
        capabilities.data["serverInfo"]["name"],
        json!("e2e-live")
    );

    let tools = client.list_tools().await;
    assert!(tools.success);
    assert_eq!(tools.data["tools"][0]["name"], json!("search"));

    let call = client.call_tool("search", json!({"query": "omni"})).await;
    assert!(call.success);
    assert_eq!(call.data["content"][0]["text"], json!("omni"));

    let read = client.read_resource("notes://pinned").await;
    assert!(read.success);
    assert_eq!(read.data["contents"][0]["text"], json!("ship it"));

    let prompt = client
        .get_prompt("summarize", json!({"text": "a long story"}))
        .await;
    assert!(prompt.success);
    assert_eq!(
        prompt.data["messages"][0]["content"]["text"],
        json!("Summarize: a long story")
    );

    // Unknown methods surface as JSON-RPC -32601, not a transport error.
    let unknown = client.send("tools/destroy", None).await;
    assert!(!unknown.success);
    assert!(unknown.error.unwrap().contains("-32601"));

    instance.shutdown();
}

#[tokio::test]
async fn basic_auth_and_cors_compose_on_the_wire() {
    let server = server_with_search("e2e-auth").await;
    let instance = serve(
        server,
        "127.0.0.1:0".parse().unwrap(),
        HttpConfig {
            basic_auth: Some(("ops".into(), "hunter2".into())),
            cors: CorsConfig {
                allowed_origins: vec!["*.example.com".into()],
            },
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let base = format!("http://{}", instance.addr);

    let denied = McpClient::new(&base).with_timeout(5).list_tools().await;
    assert!(!denied.success);
    assert_eq!(denied.status_code, 401);

    let allowed = McpClient::new(&base)
        .with_timeout(5)
        .with_auth("ops", "hunter2")
        .list_tools()
        .await;
    assert!(allowed.success);
    // Security headers ride on every response.
    assert_eq!(
        allowed.headers.get("x-content-type-options").map(|s| s.as_str()),
        Some("nosniff")
    );

    instance.shutdown();
}

#[tokio::test]
async fn stats_accumulate_over_handled_requests() {
    let server = server_with_search("e2e-stats").await;
    server
        .handle(JsonRpcRequest::new("1", "ping", None))
        .await;
    server
        .handle(JsonRpcRequest::new(
            "2",
            "tools/call",
            Some(json!({"name": "search", "arguments": {"query": "x"}})),
        ))
        .await;

    let stats = server.stats();
    assert_eq!(stats.total_requests, 2);
    assert_eq!(stats.total_tool_invocations, 1);
    assert_eq!(stats.total_errors, 0);
    assert_eq!(stats.success_rate, 100.0);
}
