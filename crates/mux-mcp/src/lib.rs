//! MCP multiplexing core
//!
//! Presents any number of independently reachable MCP backends as one virtual
//! server: per-backend session-resilient transport clients, and a gateway
//! that merges their tool and resource catalogs under a single namespace.

pub mod client;
pub mod gateway;
pub mod protocol;

pub use client::{
    build_backend, ApiKeyDescriptor, BackendDescriptor, HttpBackendClient, McpBackend,
    TransportKind,
};
pub use gateway::McpGateway;
