//! Aggregating gateway
//!
//! Presents a registry of backend clients as one MCP server: catalog merging
//! with deterministic conflict resolution, prefix routing, and JSON-RPC
//! dispatch with per-backend fault tolerance.

#[allow(clippy::module_inception)]
mod gateway;
mod merger;

pub use gateway::McpGateway;
pub use merger::{
    merge_initialize_results, merge_resources, merge_tools, parse_prefixed, prefixed_name,
    stub_initialize_result, BackendFailure,
};
