//! Transport client integration tests against mock MCP backends
//!
//! Each test spins up a wiremock server and verifies the session lifecycle,
//! retry schedule, authorization challenges, and framing handling end to end.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use mux_mcp::protocol::JsonRpcRequest;
use mux_mcp::{ApiKeyDescriptor, HttpBackendClient, McpBackend};
use mux_oauth::{MemoryTokenStore, OAuthToken, TokenStore};
use mux_types::AppError;
use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, header, header_exists, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ACCEPT: &str = "application/json, text/event-stream";

fn client(server: &MockServer) -> HttpBackendClient {
    HttpBackendClient::new(
        "backend1".to_string(),
        server.uri(),
        ACCEPT.to_string(),
        None,
        None,
    )
    .unwrap()
}

fn rpc_result(result: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "result": result
    }))
}

fn rpc_error(code: i32, message: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "error": {"code": code, "message": message}
    }))
}

fn init_result() -> Value {
    json!({
        "protocolVersion": "2024-11-05",
        "capabilities": {"tools": {"listChanged": false}},
        "serverInfo": {"name": "mock-server", "version": "1.0"}
    })
}

/// Baseline mocks for a healthy backend: initialize, the lifecycle
/// notification, one tool, and no resources support.
async fn mount_healthy_backend(server: &MockServer) {
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "initialize"})))
        .respond_with(rpc_result(init_result()))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "notifications/initialized"})))
        .respond_with(ResponseTemplate::new(202))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "tools/list"})))
        .respond_with(rpc_result(json!({
            "tools": [{"name": "search", "inputSchema": {"type": "object"}}]
        })))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "resources/list"})))
        .respond_with(rpc_error(-32601, "Method not found: resources/list"))
        .mount(server)
        .await;
}

async fn count_method(server: &MockServer, method_name: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|request| {
            serde_json::from_slice::<Value>(&request.body)
                .map(|body| body["method"] == method_name)
                .unwrap_or(false)
        })
        .count()
}

#[tokio::test]
async fn session_header_from_initialize_rides_on_every_call() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "initialize"})))
        .respond_with(rpc_result(init_result()).insert_header("Mcp-Session-Id", "abc123"))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "notifications/initialized"})))
        .and(header("Mcp-Session-Id", "abc123"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    // Catalog mocks only match when the assigned session id is carried.
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "tools/list"})))
        .and(header("Mcp-Session-Id", "abc123"))
        .respond_with(rpc_result(json!({"tools": []})))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "resources/list"})))
        .and(header("Mcp-Session-Id", "abc123"))
        .respond_with(rpc_result(json!({"resources": []})))
        .mount(&server)
        .await;

    let client = client(&server);
    client.initialize().await.unwrap();

    assert_eq!(client.session_id().as_deref(), Some("abc123"));
    assert!(client.is_initialized());

    // The very first initialize request went out with no session header.
    let requests = server.received_requests().await.unwrap();
    let first = &requests[0];
    assert!(!first.headers.contains_key("Mcp-Session-Id"));
}

#[tokio::test]
async fn catalog_snapshot_is_cached_for_instance_lifetime() {
    let server = MockServer::start().await;
    mount_healthy_backend(&server).await;

    let client = client(&server);
    client.initialize().await.unwrap();

    // Eager fetch during initialize already populated both caches.
    let tools = client.list_tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    let _ = client.list_tools().await.unwrap();
    let resources = client.list_resources().await.unwrap();
    assert!(resources.is_empty(), "method-not-found means no resources");

    assert_eq!(count_method(&server, "tools/list").await, 1);
    assert_eq!(count_method(&server, "resources/list").await, 1);
}

#[tokio::test]
async fn locally_generated_session_when_backend_assigns_none() {
    let server = MockServer::start().await;

    // First initialize attempt: the backend demands a session but does not
    // assign one.
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "initialize"})))
        .respond_with(ResponseTemplate::new(400).set_body_string("Bad Request: session required"))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;

    // The retry must carry a locally generated id.
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "initialize"})))
        .and(header_exists("Mcp-Session-Id"))
        .respond_with(rpc_result(init_result()))
        .with_priority(5)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "notifications/initialized"})))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "tools/list"})))
        .respond_with(rpc_result(json!({"tools": []})))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "resources/list"})))
        .respond_with(rpc_result(json!({"resources": []})))
        .mount(&server)
        .await;

    let client = client(&server);
    client.initialize().await.unwrap();

    assert!(client.session_id().is_some());
    assert_eq!(count_method(&server, "initialize").await, 2);
}

#[tokio::test]
async fn session_error_triggers_one_reinitialize_then_succeeds() {
    let server = MockServer::start().await;
    mount_healthy_backend(&server).await;

    // One session rejection, then the generic mocks take over.
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "tools/call"})))
        .respond_with(ResponseTemplate::new(400).set_body_string("Invalid session id"))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "tools/call"})))
        .respond_with(rpc_result(json!({"content": [{"type": "text", "text": "ok"}]})))
        .with_priority(5)
        .mount(&server)
        .await;

    let client = client(&server);
    client.initialize().await.unwrap();

    let result = client.call_tool("search", json!({"q": "x"})).await.unwrap();
    assert_eq!(result["content"][0]["text"], "ok");

    // Initial handshake plus exactly one renegotiation.
    assert_eq!(count_method(&server, "initialize").await, 2);
    assert_eq!(count_method(&server, "tools/call").await, 2);
}

#[tokio::test]
async fn persistent_session_error_fails_without_looping() {
    let server = MockServer::start().await;
    mount_healthy_backend(&server).await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "tools/call"})))
        .respond_with(ResponseTemplate::new(404).set_body_string("session not found"))
        .with_priority(1)
        .mount(&server)
        .await;

    let client = client(&server);
    client.initialize().await.unwrap();

    let err = client.call_tool("search", json!({})).await.unwrap_err();
    assert!(matches!(err, AppError::Session(_)));

    // One renegotiation, one replay, then surrender.
    assert_eq!(count_method(&server, "initialize").await, 2);
    assert_eq!(count_method(&server, "tools/call").await, 2);
}

#[tokio::test]
async fn session_error_during_initialize_fails_distinctly() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "initialize"})))
        .respond_with(rpc_result(init_result()).insert_header("Mcp-Session-Id", "s1"))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "notifications/initialized"})))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    // The eager catalog fetch inside initialize keeps hitting a session
    // error; recovery must not recurse into a second initialize.
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "tools/list"})))
        .respond_with(ResponseTemplate::new(400).set_body_string("session expired"))
        .mount(&server)
        .await;

    let client = client(&server);
    let err = client.initialize().await.unwrap_err();

    match err {
        AppError::Session(message) => assert!(message.contains("in flight")),
        other => panic!("expected session error, got {}", other),
    }
    assert_eq!(count_method(&server, "initialize").await, 1);
}

#[tokio::test]
async fn challenge_with_metadata_url_is_surfaced_and_never_retried() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(401).insert_header(
                "WWW-Authenticate",
                r#"Bearer realm="mcp", resource_metadata_uri="https://x/meta""#,
            ),
        )
        .mount(&server)
        .await;

    let client = client(&server);
    let err = client.call_tool("search", json!({})).await.unwrap_err();

    match err {
        AppError::OAuthRequired {
            backend_id,
            metadata_url,
        } => {
            assert_eq!(backend_id, "backend1");
            assert_eq!(metadata_url.as_deref(), Some("https://x/meta"));
        }
        other => panic!("expected OAuthRequired, got {}", other),
    }

    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn bare_bearer_challenge_gives_generic_signal() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).insert_header("WWW-Authenticate", "Bearer"))
        .mount(&server)
        .await;

    let client = client(&server);
    let err = client.call_tool("search", json!({})).await.unwrap_err();

    match err {
        AppError::OAuthRequired { metadata_url, .. } => assert!(metadata_url.is_none()),
        other => panic!("expected OAuthRequired, got {}", other),
    }
}

#[tokio::test]
async fn sse_framed_response_is_parsed() {
    let server = MockServer::start().await;

    let sse_body = format!(
        "event: message\ndata: {}\n\n",
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {"content": [{"type": "text", "text": "from sse"}]}
        })
    );

    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(sse_body)
                .insert_header("content-type", "text/event-stream"),
        )
        .mount(&server)
        .await;

    let client = client(&server);
    let result = client.call_tool("search", json!({})).await.unwrap();
    assert_eq!(result["content"][0]["text"], "from sse");
}

#[tokio::test]
async fn framing_mismatch_is_fatal_without_retry() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("<html>login page</html>")
                .insert_header("content-type", "text/html"),
        )
        .mount(&server)
        .await;

    let client = client(&server);
    let err = client.call_tool("search", json!({})).await.unwrap_err();

    match err {
        AppError::Framing(message) => assert!(message.contains("text/html")),
        other => panic!("expected framing error, got {}", other),
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn unparseable_json_body_is_fatal_without_retry() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("definitely not json")
                .insert_header("content-type", "application/json"),
        )
        .mount(&server)
        .await;

    let client = client(&server);
    let err = client.call_tool("search", json!({})).await.unwrap_err();

    assert!(matches!(err, AppError::Framing(_)));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn server_errors_retry_three_times_with_backoff() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = client(&server);
    let started = Instant::now();
    let err = client.call_tool("search", json!({})).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, AppError::Transport(_)));
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
    // Two backoff gaps: 100 ms then 200 ms.
    assert!(elapsed >= Duration::from_millis(300), "elapsed {:?}", elapsed);
}

#[tokio::test]
async fn backend_protocol_error_is_surfaced_verbatim() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(rpc_error(-32000, "tool exploded"))
        .mount(&server)
        .await;

    let client = client(&server);
    let err = client.call_tool("search", json!({})).await.unwrap_err();

    match err {
        AppError::Protocol { code, message } => {
            assert_eq!(code, -32000);
            assert_eq!(message, "tool exploded");
        }
        other => panic!("expected protocol error, got {}", other),
    }
}

#[tokio::test]
async fn api_key_header_is_built_from_template() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(header("X-Api-Key", "sekrit"))
        .respond_with(rpc_result(json!({"content": []})))
        .mount(&server)
        .await;

    let client = HttpBackendClient::new(
        "backend1".to_string(),
        server.uri(),
        ACCEPT.to_string(),
        Some(ApiKeyDescriptor {
            key: "sekrit".to_string(),
            header_name: "X-Api-Key".to_string(),
            header_value_template: "{apiKey}".to_string(),
        }),
        None,
    )
    .unwrap();

    client.call_tool("search", json!({})).await.unwrap();
}

#[tokio::test]
async fn oauth_token_wins_over_api_key() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(header("Authorization", "Bearer tok1"))
        .respond_with(rpc_result(json!({"content": []})))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryTokenStore::new());
    store
        .store(
            "backend1",
            OAuthToken {
                access_token: "tok1".to_string(),
                token_type: "Bearer".to_string(),
                refresh_token: None,
                expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
                scope: None,
            },
        )
        .await
        .unwrap();

    let client = HttpBackendClient::new(
        "backend1".to_string(),
        server.uri(),
        ACCEPT.to_string(),
        Some(ApiKeyDescriptor {
            key: "sekrit".to_string(),
            header_name: "X-Api-Key".to_string(),
            header_value_template: "{apiKey}".to_string(),
        }),
        Some(store),
    )
    .unwrap();

    client.call_tool("search", json!({})).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert!(!requests[0].headers.contains_key("X-Api-Key"));
}

#[tokio::test]
async fn notification_through_handle_request_returns_nothing() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;

    let client = client(&server);
    let response = client
        .handle_request(JsonRpcRequest::notification(
            "notifications/progress".to_string(),
            Some(json!({"progress": 1})),
        ))
        .await
        .unwrap();

    assert!(response.is_none());
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn handle_request_passes_backend_error_through_in_envelope() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(rpc_error(-32601, "Method not found: prompts/list"))
        .mount(&server)
        .await;

    let client = client(&server);
    let response = client
        .handle_request(JsonRpcRequest::with_id(7, "prompts/list".to_string(), None))
        .await
        .unwrap()
        .unwrap();

    // Envelope-level errors come back inside the response for the gateway to
    // collect, not as Err.
    assert_eq!(response.error.unwrap().code, -32601);
}
