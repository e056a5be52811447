//! Backend transport clients
//!
//! One client instance owns one backend connection's session, cache, and
//! retry state. The gateway composes clients purely through [`McpBackend`].

mod factory;
mod frame;
mod http;

use async_trait::async_trait;
use mux_types::AppResult;
use serde_json::Value;

use crate::protocol::{JsonRpcRequest, JsonRpcResponse, McpResource, McpTool};

pub use factory::{build_backend, BackendDescriptor, TransportKind};
pub use http::{ApiKeyDescriptor, HttpBackendClient, SESSION_HEADER};

/// One backend as seen by the gateway
///
/// A single instance is effectively single-owner per backend connection:
/// `initialize` is guarded against concurrent re-entry, everything else is
/// read-mostly over the instance-lifetime catalog cache.
#[async_trait]
pub trait McpBackend: Send + Sync {
    /// Establish the session and warm the catalog caches.
    async fn initialize(&self) -> AppResult<()>;

    /// Tool catalog; cached for the instance's lifetime after first success.
    async fn list_tools(&self) -> AppResult<Vec<McpTool>>;

    /// Resource catalog; same caching contract as `list_tools`.
    async fn list_resources(&self) -> AppResult<Vec<McpResource>>;

    /// Invoke one tool by its backend-local name.
    async fn call_tool(&self, name: &str, args: Value) -> AppResult<Value>;

    /// Read one resource by URI.
    async fn read_resource(&self, uri: &str) -> AppResult<Value>;

    /// Generic entry point for embedding: forwards an arbitrary envelope.
    ///
    /// Notifications perform the side effect and return `Ok(None)`. A backend
    /// JSON-RPC `error` comes back inside the response, not as `Err`, so
    /// callers can collect per-backend outcomes.
    async fn handle_request(&self, request: JsonRpcRequest) -> AppResult<Option<JsonRpcResponse>>;

    /// Whether arbitrary envelopes can be forwarded to this backend.
    ///
    /// Backends that answer `false` only speak the typed surface above; the
    /// gateway synthesizes an initialize stub for them.
    fn passthrough(&self) -> bool {
        true
    }
}
