//! The aggregator
//!
//! Holds the registration-ordered backend registry and fans one logical
//! request out to N backends. Registration order is the tie-break everywhere:
//! collision renames, catalog scans, and passthrough forwarding all walk it.

use std::sync::Arc;

use futures::future::join_all;
use mux_types::{AppError, AppResult};
use parking_lot::RwLock;
use serde_json::{json, Value};

use super::merger::{
    merge_initialize_results, merge_resources, merge_tools, parse_prefixed,
    stub_initialize_result, BackendFailure,
};
use crate::client::McpBackend;
use crate::protocol::{
    InitializeResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse, McpResource, McpTool,
};

/// One virtual MCP server composed of N backends
///
/// Shared read-mostly across concurrent requests; registration must not
/// mutate concurrently with reads, which the inner lock enforces.
#[derive(Default)]
pub struct McpGateway {
    /// Registration order is meaningful; this is a Vec, not a map.
    backends: RwLock<Vec<(String, Arc<dyn McpBackend>)>>,
}

impl McpGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under a stable caller-assigned id
    ///
    /// The id doubles as the disambiguation prefix for colliding tool names
    /// and the routing prefix for direct calls. Re-registering an id swaps
    /// the client but keeps its position in the order.
    pub fn register(&self, id: impl Into<String>, backend: Arc<dyn McpBackend>) {
        let id = id.into();
        let mut backends = self.backends.write();

        if let Some(slot) = backends.iter_mut().find(|(existing, _)| *existing == id) {
            slot.1 = backend;
        } else {
            backends.push((id, backend));
        }
    }

    /// Remove a backend; returns whether the id was registered.
    pub fn unregister(&self, id: &str) -> bool {
        let mut backends = self.backends.write();
        let before = backends.len();
        backends.retain(|(existing, _)| existing != id);
        backends.len() != before
    }

    pub fn backend_ids(&self) -> Vec<String> {
        self.backends.read().iter().map(|(id, _)| id.clone()).collect()
    }

    fn snapshot(&self) -> Vec<(String, Arc<dyn McpBackend>)> {
        self.backends.read().clone()
    }

    /// Aggregate tool catalog
    ///
    /// Fan-out runs concurrently; `join_all` hands results back in input
    /// order, so conflict resolution still sees registration order. A failing
    /// backend is skipped, its tools simply absent.
    pub async fn list_tools(&self) -> Vec<McpTool> {
        let backends = self.snapshot();

        let fetches = backends.into_iter().map(|(id, backend)| async move {
            (id, backend.list_tools().await)
        });

        let mut per_backend = Vec::new();
        for (id, result) in join_all(fetches).await {
            match result {
                Ok(tools) => per_backend.push((id, tools)),
                Err(err) => {
                    tracing::warn!(backend = %id, "skipping backend in tools/list: {}", err);
                }
            }
        }

        merge_tools(per_backend)
    }

    /// Aggregate resource catalog, same fault tolerance as `list_tools`.
    pub async fn list_resources(&self) -> Vec<McpResource> {
        let backends = self.snapshot();

        let fetches = backends.into_iter().map(|(id, backend)| async move {
            (id, backend.list_resources().await)
        });

        let mut per_backend = Vec::new();
        for (id, result) in join_all(fetches).await {
            match result {
                Ok(resources) => per_backend.push((id, resources)),
                Err(err) => {
                    tracing::warn!(backend = %id, "skipping backend in resources/list: {}", err);
                }
            }
        }

        merge_resources(per_backend)
    }

    /// Invoke a tool by aggregate name
    ///
    /// A `<backendId>:<name>` form with a known backend id routes directly.
    /// Everything else scans backends in registration order for an exact
    /// catalog match and calls the first one found.
    pub async fn call_tool(&self, name: &str, args: Value) -> AppResult<Value> {
        let backends = self.snapshot();

        if let Some((backend_id, tool_name)) = parse_prefixed(name) {
            if let Some((_, backend)) = backends.iter().find(|(id, _)| id == backend_id) {
                return backend.call_tool(tool_name, args).await;
            }
            // Unknown prefix: treat the whole thing as an ordinary tool name.
        }

        for (backend_id, backend) in &backends {
            let tools = match backend.list_tools().await {
                Ok(tools) => tools,
                Err(err) => {
                    tracing::debug!(backend = %backend_id, "skipping backend in tool scan: {}", err);
                    continue;
                }
            };

            if tools.iter().any(|tool| tool.name == name) {
                return backend.call_tool(name, args).await;
            }
        }

        Err(AppError::Aggregate(format!(
            "tool '{}' not found on any backend",
            name
        )))
    }

    /// Read a resource by URI, scanning catalogs in registration order.
    pub async fn read_resource(&self, uri: &str) -> AppResult<Value> {
        let backends = self.snapshot();

        for (backend_id, backend) in &backends {
            let resources = match backend.list_resources().await {
                Ok(resources) => resources,
                Err(err) => {
                    tracing::debug!(backend = %backend_id, "skipping backend in resource scan: {}", err);
                    continue;
                }
            };

            if resources.iter().any(|resource| resource.uri == uri) {
                return backend.read_resource(uri).await;
            }
        }

        Err(AppError::Aggregate(format!(
            "resource '{}' not found on any backend",
            uri
        )))
    }

    /// JSON-RPC entry point
    ///
    /// Notifications perform their side effects and yield `Ok(None)` on every
    /// path. Not-found and unknown-method failures come back as JSON-RPC
    /// error envelopes; transport-level failures (including the
    /// authorization-required signal) propagate as `Err` for the route layer
    /// to map.
    pub async fn handle_request(
        &self,
        request: JsonRpcRequest,
    ) -> AppResult<Option<JsonRpcResponse>> {
        if request.is_notification() {
            if let Err(err) = self.dispatch_notification(&request).await {
                tracing::warn!(
                    method = %request.method,
                    "notification side effects failed: {}",
                    err
                );
            }
            return Ok(None);
        }

        let id = request.id.clone().unwrap_or(Value::Null);

        let response = match request.method.as_str() {
            "initialize" => self.handle_initialize(id, &request).await?,
            "tools/list" => {
                // The protocol envelope is an object, never a bare array.
                let tools = self.list_tools().await;
                JsonRpcResponse::success(id, json!({ "tools": tools }))
            }
            "resources/list" => {
                let resources = self.list_resources().await;
                JsonRpcResponse::success(id, json!({ "resources": resources }))
            }
            "tools/call" => self.handle_tools_call(id, &request).await?,
            "resources/read" => self.handle_resources_read(id, &request).await?,
            _ => self.forward_to_backends(id, &request).await?,
        };

        Ok(Some(response))
    }

    /// Fan initialize out to every registered backend
    ///
    /// Passthrough backends are forwarded the envelope; the rest get a
    /// synthesized stub. Only the all-fail case is fatal, naming every
    /// failed id.
    async fn handle_initialize(
        &self,
        id: Value,
        request: &JsonRpcRequest,
    ) -> AppResult<JsonRpcResponse> {
        let backends = self.snapshot();

        let calls = backends.into_iter().map(|(backend_id, backend)| {
            let request = request.clone();
            async move {
                if !backend.passthrough() {
                    return Ok((backend_id.clone(), stub_initialize_result(&backend_id)));
                }

                match backend.handle_request(request).await {
                    Ok(Some(response)) => {
                        if let Some(error) = response.error {
                            return Err(BackendFailure {
                                backend_id,
                                error: error.message,
                            });
                        }
                        let result = response.result.unwrap_or(Value::Null);
                        match serde_json::from_value::<InitializeResult>(result) {
                            Ok(init) => Ok((backend_id, init)),
                            Err(err) => Err(BackendFailure {
                                backend_id,
                                error: format!("invalid initialize result: {}", err),
                            }),
                        }
                    }
                    Ok(None) => Err(BackendFailure {
                        backend_id,
                        error: "backend produced no initialize response".to_string(),
                    }),
                    Err(err) => Err(BackendFailure {
                        backend_id,
                        error: err.to_string(),
                    }),
                }
            }
        });

        let mut successes = Vec::new();
        let mut failures = Vec::new();
        for outcome in join_all(calls).await {
            match outcome {
                Ok(success) => successes.push(success),
                Err(failure) => failures.push(failure),
            }
        }

        if successes.is_empty() && !failures.is_empty() {
            let summary = failures
                .iter()
                .map(|f| format!("{}: {}", f.backend_id, f.error))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(AppError::Aggregate(format!(
                "all backends failed to initialize: {}",
                summary
            )));
        }

        for failure in &failures {
            tracing::warn!(backend = %failure.backend_id, "backend failed to initialize: {}", failure.error);
        }

        let merged = merge_initialize_results(successes);
        Ok(JsonRpcResponse::success(id, serde_json::to_value(merged)?))
    }

    async fn handle_tools_call(
        &self,
        id: Value,
        request: &JsonRpcRequest,
    ) -> AppResult<JsonRpcResponse> {
        let params = request.params.clone().unwrap_or_else(|| json!({}));

        let name = match params.get("name").and_then(Value::as_str) {
            Some(name) => name,
            None => {
                return Ok(JsonRpcResponse::error(
                    id,
                    JsonRpcError::invalid_params("tools/call requires a 'name' parameter"),
                ));
            }
        };
        let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        match self.call_tool(name, args).await {
            Ok(result) => Ok(JsonRpcResponse::success(id, result)),
            Err(AppError::Aggregate(message)) => Ok(JsonRpcResponse::error(
                id,
                JsonRpcError::tool_not_found(message),
            )),
            Err(AppError::Protocol { code, message }) => Ok(JsonRpcResponse::error(
                id,
                JsonRpcError::new(code, message, None),
            )),
            Err(err) => Err(err),
        }
    }

    async fn handle_resources_read(
        &self,
        id: Value,
        request: &JsonRpcRequest,
    ) -> AppResult<JsonRpcResponse> {
        let params = request.params.clone().unwrap_or_else(|| json!({}));

        let uri = match params.get("uri").and_then(Value::as_str) {
            Some(uri) => uri,
            None => {
                return Ok(JsonRpcResponse::error(
                    id,
                    JsonRpcError::invalid_params("resources/read requires a 'uri' parameter"),
                ));
            }
        };

        match self.read_resource(uri).await {
            Ok(result) => Ok(JsonRpcResponse::success(id, result)),
            Err(AppError::Aggregate(message)) => Ok(JsonRpcResponse::error(
                id,
                JsonRpcError::resource_not_found(message),
            )),
            Err(AppError::Protocol { code, message }) => Ok(JsonRpcResponse::error(
                id,
                JsonRpcError::new(code, message, None),
            )),
            Err(err) => Err(err),
        }
    }

    /// Pass-through for methods the gateway does not interpret
    ///
    /// Walks passthrough backends in registration order and returns the first
    /// non-error response. No taker means the method is unknown.
    async fn forward_to_backends(
        &self,
        id: Value,
        request: &JsonRpcRequest,
    ) -> AppResult<JsonRpcResponse> {
        for (backend_id, backend) in self.snapshot() {
            if !backend.passthrough() {
                continue;
            }

            match backend.handle_request(request.clone()).await {
                Ok(Some(response)) if !response.is_error() => return Ok(response),
                Ok(Some(response)) => {
                    tracing::debug!(
                        backend = %backend_id,
                        method = %request.method,
                        "backend declined forwarded method: {:?}",
                        response.error
                    );
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(
                        backend = %backend_id,
                        method = %request.method,
                        "backend failed forwarded method: {}",
                        err
                    );
                }
            }
        }

        Ok(JsonRpcResponse::error(
            id,
            JsonRpcError::method_not_found(&request.method),
        ))
    }

    /// Side effects for a notification; never produces output.
    async fn dispatch_notification(&self, request: &JsonRpcRequest) -> AppResult<()> {
        match request.method.as_str() {
            "tools/call" => {
                let params = request.params.clone().unwrap_or_else(|| json!({}));
                if let Some(name) = params.get("name").and_then(Value::as_str) {
                    let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
                    self.call_tool(name, args).await?;
                }
                Ok(())
            }
            "resources/read" => {
                let params = request.params.clone().unwrap_or_else(|| json!({}));
                if let Some(uri) = params.get("uri").and_then(Value::as_str) {
                    self.read_resource(uri).await?;
                }
                Ok(())
            }
            "tools/list" => {
                self.list_tools().await;
                Ok(())
            }
            "resources/list" => {
                self.list_resources().await;
                Ok(())
            }
            _ => {
                // Forwarded notifications fan out to every passthrough
                // backend; individual failures only get logged.
                for (backend_id, backend) in self.snapshot() {
                    if !backend.passthrough() {
                        continue;
                    }
                    if let Err(err) = backend.handle_request(request.clone()).await {
                        tracing::debug!(
                            backend = %backend_id,
                            method = %request.method,
                            "backend rejected forwarded notification: {}",
                            err
                        );
                    }
                }
                Ok(())
            }
        }
    }
}
