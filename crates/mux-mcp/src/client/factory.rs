//! Backend construction
//!
//! Transport kinds form a closed set; construction is a pure dispatch table
//! over the caller-supplied descriptor. Instance reuse across requests is the
//! gateway registry's concern, never a module-level singleton here.

use std::sync::Arc;

use mux_oauth::TokenStore;
use mux_types::AppResult;
use serde::{Deserialize, Serialize};

use super::http::{ApiKeyDescriptor, HttpBackendClient};
use super::McpBackend;

/// Wire transport spoken by a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Streamable HTTP: POST per message, JSON or SSE-framed responses
    StreamableHttp,

    /// Legacy HTTP+SSE servers; same client, SSE-first Accept preference
    Sse,
}

/// Backend connection descriptor supplied by the embedding application
///
/// This core never reads persisted configuration itself; whatever store the
/// application keeps, it hands over one of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendDescriptor {
    /// Stable caller-assigned id; doubles as the tool-name prefix upstream
    pub id: String,

    pub kind: TransportKind,

    pub base_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<ApiKeyDescriptor>,
}

/// Construct a transport client for a descriptor
///
/// Response framing is auto-detected per message, so both kinds share one
/// client; the kind only decides which framing the `Accept` header prefers.
pub fn build_backend(
    descriptor: BackendDescriptor,
    token_store: Option<Arc<dyn TokenStore>>,
) -> AppResult<Arc<dyn McpBackend>> {
    let accept = match descriptor.kind {
        TransportKind::StreamableHttp => "application/json, text/event-stream",
        TransportKind::Sse => "text/event-stream, application/json",
    };

    let client = HttpBackendClient::new(
        descriptor.id,
        descriptor.base_url,
        accept.to_string(),
        descriptor.api_key,
        token_store,
    )?;

    Ok(Arc::new(client))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names() {
        let kind: TransportKind = serde_json::from_str("\"streamable_http\"").unwrap();
        assert_eq!(kind, TransportKind::StreamableHttp);

        let kind: TransportKind = serde_json::from_str("\"sse\"").unwrap();
        assert_eq!(kind, TransportKind::Sse);

        assert!(serde_json::from_str::<TransportKind>("\"websocket\"").is_err());
    }

    #[test]
    fn test_build_backend_both_kinds() {
        for kind in [TransportKind::StreamableHttp, TransportKind::Sse] {
            let descriptor = BackendDescriptor {
                id: "b1".to_string(),
                kind,
                base_url: "http://localhost:3000/mcp".to_string(),
                api_key: None,
            };
            let backend = build_backend(descriptor, None).unwrap();
            assert!(backend.passthrough());
        }
    }
}
