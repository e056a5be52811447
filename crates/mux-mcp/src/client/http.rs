//! Streamable HTTP backend client
//!
//! Talks JSON-RPC 2.0 over HTTP POST to one MCP backend whose session
//! lifecycle, error shape, and response framing are not guaranteed. Session
//! renegotiation, the retry schedule, and authorization challenges are all
//! reconciled here so the gateway above sees one uniform surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mux_oauth::TokenStore;
use mux_types::{AppError, AppResult};
use parking_lot::RwLock;
use reqwest::header::{CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::frame::parse_body;
use super::McpBackend;
use crate::protocol::{
    JsonRpcRequest, JsonRpcResponse, McpResource, McpTool, METHOD_NOT_FOUND, PROTOCOL_VERSION,
};

/// Session affinity header used by streamable HTTP MCP servers.
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Total attempts for transport-level failures (network errors and 5xx).
const MAX_ATTEMPTS: u32 = 3;

/// Backoff doubles from here between attempts: 100, 200, 400 ms.
const BACKOFF_BASE_MS: u64 = 100;

/// API-key header descriptor supplied by the caller
///
/// The template carries an `{apiKey}` placeholder so headers like
/// `Bearer {apiKey}` or bare-value schemes both work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyDescriptor {
    pub key: String,
    pub header_name: String,
    pub header_value_template: String,
}

impl ApiKeyDescriptor {
    pub fn header_value(&self) -> String {
        self.header_value_template.replace("{apiKey}", &self.key)
    }
}

/// One backend connection over streamable HTTP
///
/// Owns the session id, the in-flight initialize guard, and the
/// instance-lifetime tool/resource snapshot. Not safe for concurrent
/// `initialize`; everything else is read-mostly.
pub struct HttpBackendClient {
    id: String,
    endpoint: String,
    http: Client,
    accept: String,
    api_key: Option<ApiKeyDescriptor>,
    token_store: Option<Arc<dyn TokenStore>>,

    session_id: RwLock<Option<String>>,
    initializing: AtomicBool,
    initialized: AtomicBool,
    next_id: AtomicU64,

    tools: RwLock<Option<Vec<McpTool>>>,
    resources: RwLock<Option<Vec<McpResource>>>,
}

impl HttpBackendClient {
    pub fn new(
        id: String,
        endpoint: String,
        accept: String,
        api_key: Option<ApiKeyDescriptor>,
        token_store: Option<Arc<dyn TokenStore>>,
    ) -> AppResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::Mcp(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            id,
            endpoint,
            http,
            accept,
            api_key,
            token_store,
            session_id: RwLock::new(None),
            initializing: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            tools: RwLock::new(None),
            resources: RwLock::new(None),
        })
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn next_request(&self, method: &str, params: Option<Value>) -> JsonRpcRequest {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        JsonRpcRequest::with_id(id, method.to_string(), params)
    }

    /// Request headers for one call. OAuth wins over the API key; the known
    /// session id rides along when present.
    async fn build_headers(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();

        let mut authorized = false;
        if let Some(store) = &self.token_store {
            match store.get(&self.id).await {
                Ok(Some(token)) if !token.is_expired() => {
                    headers.insert("Authorization".to_string(), token.authorization_value());
                    authorized = true;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(backend = %self.id, "token store lookup failed: {}", e);
                }
            }
        }

        if !authorized {
            if let Some(api_key) = &self.api_key {
                headers.insert(api_key.header_name.clone(), api_key.header_value());
            }
        }

        if let Some(session_id) = self.session_id.read().clone() {
            headers.insert(SESSION_HEADER.to_string(), session_id);
        }

        headers
    }

    /// One POST round trip, classified into the failure taxonomy:
    /// `Transport` is the only retryable class, `Session` triggers one
    /// renegotiation above, `OAuthRequired` and `Framing` short-circuit.
    async fn post_once(&self, request: &JsonRpcRequest) -> AppResult<Value> {
        let headers = self.build_headers().await;

        let mut req = self
            .http
            .post(&self.endpoint)
            .header("Accept", &self.accept)
            .json(request);
        for (name, value) in &headers {
            req = req.header(name, value);
        }

        let response = req.send().await.map_err(|e| {
            AppError::Transport(format!("request to backend '{}' failed: {}", self.id, e))
        })?;

        let status = response.status();

        // Backends assign or rotate the session via a response header on any
        // reply, including errors.
        if let Some(session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|h| h.to_str().ok())
        {
            *self.session_id.write() = Some(session_id.to_string());
        }

        if status == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|h| h.to_str().ok())
                .unwrap_or("")
                .to_string();
            return Err(self.classify_challenge(&challenge));
        }

        if status == StatusCode::BAD_REQUEST || status == StatusCode::NOT_FOUND {
            let body = response.text().await.unwrap_or_default();
            if body.to_lowercase().contains("session") {
                return Err(AppError::Session(format!(
                    "backend '{}' rejected the session: {}",
                    self.id,
                    truncate(&body)
                )));
            }
            return Err(AppError::Mcp(format!(
                "backend '{}' returned {}: {}",
                self.id,
                status,
                truncate(&body)
            )));
        }

        if status.is_server_error() {
            return Err(AppError::Transport(format!(
                "backend '{}' returned {}",
                self.id, status
            )));
        }

        if !status.is_success() {
            return Err(AppError::Mcp(format!(
                "backend '{}' returned unexpected status {}",
                self.id, status
            )));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("")
            .to_string();

        let body = response.text().await.map_err(|e| {
            AppError::Transport(format!(
                "failed to read response body from backend '{}': {}",
                self.id, e
            ))
        })?;

        parse_body(&content_type, &body)
    }

    /// 401 handling. A `resource_metadata_uri` parameter names the discovery
    /// document; a bare Bearer challenge still signals OAuth, just without a
    /// pointer. Neither is ever retried.
    fn classify_challenge(&self, challenge: &str) -> AppError {
        if let Some(metadata_url) = challenge_metadata_url(challenge) {
            return AppError::OAuthRequired {
                backend_id: self.id.clone(),
                metadata_url: Some(metadata_url),
            };
        }

        if challenge.trim_start().to_lowercase().starts_with("bearer") {
            return AppError::OAuthRequired {
                backend_id: self.id.clone(),
                metadata_url: None,
            };
        }

        AppError::Mcp(format!(
            "backend '{}' returned 401 without a usable challenge",
            self.id
        ))
    }

    /// Retry transport failures up to [`MAX_ATTEMPTS`] total attempts with
    /// doubling backoff. Everything else surfaces immediately.
    async fn send_with_retry(&self, request: &JsonRpcRequest) -> AppResult<Value> {
        let mut attempt = 0;
        loop {
            match self.post_once(request).await {
                Err(AppError::Transport(message)) => {
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        return Err(AppError::Transport(message));
                    }
                    let delay = Duration::from_millis(BACKOFF_BASE_MS << (attempt - 1));
                    tracing::warn!(
                        backend = %self.id,
                        attempt,
                        "transport failure, retrying in {:?}: {}",
                        delay,
                        message
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Retry plus one session-renegotiation cycle: a session rejection clears
    /// the id, re-initializes, and replays the original call once. A session
    /// rejection while initialize is already in flight fails distinctly
    /// instead of recursing.
    async fn send_recovering(&self, request: &JsonRpcRequest) -> AppResult<Value> {
        match self.send_with_retry(request).await {
            Err(AppError::Session(message)) => {
                if self.initializing.load(Ordering::SeqCst) {
                    return Err(AppError::Session(format!(
                        "backend '{}' rejected the session while initialize is in flight: {}",
                        self.id, message
                    )));
                }

                tracing::info!(backend = %self.id, "session invalidated, renegotiating: {}", message);
                *self.session_id.write() = None;
                self.initialized.store(false, Ordering::SeqCst);
                Box::pin(self.run_initialize()).await?;

                self.send_with_retry(request).await
            }
            other => other,
        }
    }

    fn into_response(&self, value: Value) -> AppResult<JsonRpcResponse> {
        serde_json::from_value(value).map_err(|e| {
            AppError::Framing(format!(
                "backend '{}' sent a body that is not a JSON-RPC response: {}",
                self.id, e
            ))
        })
    }

    /// Typed request: unwraps the result and converts a backend JSON-RPC
    /// `error` into [`AppError::Protocol`].
    async fn request(&self, method: &str, params: Option<Value>) -> AppResult<Value> {
        let req = self.next_request(method, params);
        let value = self.send_recovering(&req).await?;
        let response = self.into_response(value)?;

        if let Some(error) = response.error {
            return Err(AppError::Protocol {
                code: error.code,
                message: error.message,
            });
        }

        response.result.ok_or_else(|| {
            AppError::Mcp(format!(
                "backend '{}' response carried neither result nor error",
                self.id
            ))
        })
    }

    /// Guarded initialize: exactly one in flight per instance.
    async fn run_initialize(&self) -> AppResult<()> {
        if self.initializing.swap(true, Ordering::SeqCst) {
            return Err(AppError::Session(format!(
                "initialize already in flight for backend '{}'",
                self.id
            )));
        }

        let result = self.initialize_inner().await;
        self.initializing.store(false, Ordering::SeqCst);
        result
    }

    async fn initialize_inner(&self) -> AppResult<()> {
        let request = self.next_request(
            "initialize",
            Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "mcpmux",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            })),
        );

        // First attempt goes out without a session header so the backend can
        // assign one via the response. A backend that demands a session but
        // assigns none gets a locally generated id on the one retry.
        match self.try_initialize(&request).await {
            Ok(_) => {}
            Err(AppError::Session(_)) if self.session_id.read().is_none() => {
                tracing::debug!(
                    backend = %self.id,
                    "backend requires a session but assigned none, generating one locally"
                );
                *self.session_id.write() = Some(Uuid::new_v4().to_string());
                self.try_initialize(&request).await?;
            }
            Err(err) => return Err(err),
        }

        self.initialized.store(true, Ordering::SeqCst);

        // Lifecycle handshake; some backends ignore it.
        if let Err(err) = self
            .send_notification(&JsonRpcRequest::notification(
                "notifications/initialized".to_string(),
                None,
            ))
            .await
        {
            tracing::debug!(backend = %self.id, "initialized notification rejected: {}", err);
        }

        // Warm the catalog eagerly. Tools are the point of the connection, so
        // a failure there is fatal; a backend without resources answers
        // method-not-found and simply has none.
        let tools = self.fetch_tools().await?;
        *self.tools.write() = Some(tools);

        let resources = match self.fetch_resources().await {
            Ok(resources) => resources,
            Err(AppError::Protocol {
                code: METHOD_NOT_FOUND,
                ..
            }) => Vec::new(),
            Err(err) => return Err(err),
        };
        *self.resources.write() = Some(resources);

        tracing::info!(
            backend = %self.id,
            session = ?*self.session_id.read(),
            "backend initialized"
        );

        Ok(())
    }

    /// One initialize round trip. A "session required" JSON-RPC error is
    /// folded into the session class so the caller's retry logic sees one
    /// signal regardless of how the backend phrased it.
    async fn try_initialize(&self, request: &JsonRpcRequest) -> AppResult<JsonRpcResponse> {
        let value = self.send_with_retry(request).await?;
        let response = self.into_response(value)?;

        if let Some(error) = &response.error {
            if error.message.to_lowercase().contains("session") {
                return Err(AppError::Session(format!(
                    "backend '{}' requires a session: {}",
                    self.id, error.message
                )));
            }
            return Err(AppError::Protocol {
                code: error.code,
                message: error.message.clone(),
            });
        }

        Ok(response)
    }

    async fn fetch_tools(&self) -> AppResult<Vec<McpTool>> {
        let result = self.request("tools/list", None).await?;
        let tools = result.get("tools").cloned().unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(tools).map_err(|e| {
            AppError::Mcp(format!(
                "backend '{}' sent an invalid tools/list result: {}",
                self.id, e
            ))
        })
    }

    async fn fetch_resources(&self) -> AppResult<Vec<McpResource>> {
        let result = self.request("resources/list", None).await?;
        let resources = result
            .get("resources")
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(resources).map_err(|e| {
            AppError::Mcp(format!(
                "backend '{}' sent an invalid resources/list result: {}",
                self.id, e
            ))
        })
    }

    /// Single-attempt fire-and-forget. Retrying a notification could repeat
    /// its side effect, so transport failures surface instead.
    async fn send_notification(&self, request: &JsonRpcRequest) -> AppResult<()> {
        let headers = self.build_headers().await;

        let mut req = self
            .http
            .post(&self.endpoint)
            .header("Accept", &self.accept)
            .json(request);
        for (name, value) in &headers {
            req = req.header(name, value);
        }

        let response = req.send().await.map_err(|e| {
            AppError::Transport(format!("notification to backend '{}' failed: {}", self.id, e))
        })?;

        // 202 Accepted is the canonical reply; some servers answer 200 with a
        // body, which is also fine.
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AppError::Mcp(format!(
                "backend '{}' rejected notification: {}",
                self.id,
                response.status()
            )))
        }
    }
}

#[async_trait]
impl McpBackend for HttpBackendClient {
    async fn initialize(&self) -> AppResult<()> {
        self.run_initialize().await
    }

    async fn list_tools(&self) -> AppResult<Vec<McpTool>> {
        if let Some(tools) = self.tools.read().clone() {
            return Ok(tools);
        }

        let tools = self.fetch_tools().await?;
        *self.tools.write() = Some(tools.clone());
        Ok(tools)
    }

    async fn list_resources(&self) -> AppResult<Vec<McpResource>> {
        if let Some(resources) = self.resources.read().clone() {
            return Ok(resources);
        }

        let resources = self.fetch_resources().await?;
        *self.resources.write() = Some(resources.clone());
        Ok(resources)
    }

    async fn call_tool(&self, name: &str, args: Value) -> AppResult<Value> {
        self.request(
            "tools/call",
            Some(json!({ "name": name, "arguments": args })),
        )
        .await
    }

    async fn read_resource(&self, uri: &str) -> AppResult<Value> {
        self.request("resources/read", Some(json!({ "uri": uri }))).await
    }

    async fn handle_request(&self, request: JsonRpcRequest) -> AppResult<Option<JsonRpcResponse>> {
        if request.is_notification() {
            self.send_notification(&request).await?;
            return Ok(None);
        }

        let value = self.send_recovering(&request).await?;
        let response = self.into_response(value)?;
        Ok(Some(response))
    }
}

/// Pull the `resource_metadata_uri` parameter out of a `WWW-Authenticate`
/// challenge, quoted or not.
fn challenge_metadata_url(challenge: &str) -> Option<String> {
    let idx = challenge.find("resource_metadata_uri=")?;
    let rest = &challenge[idx + "resource_metadata_uri=".len()..];

    if let Some(quoted) = rest.strip_prefix('"') {
        let end = quoted.find('"')?;
        return Some(quoted[..end].to_string());
    }

    let end = rest.find([',', ' ']).unwrap_or(rest.len());
    let value = rest[..end].trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn truncate(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &body[..end])
    }
}
