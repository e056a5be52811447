//! Catalog and capability merging
//!
//! Pure functions over per-backend results, applied in registration order.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::protocol::{
    InitializeResult, McpResource, McpTool, ResourcesCapability, ServerCapabilities, ServerInfo,
    ToolsCapability, PROTOCOL_VERSION,
};

/// Separator between a backend id and a tool name in disambiguated names.
pub const PREFIX_SEPARATOR: char = ':';

/// `("backend2", "search")` -> `"backend2:search"`
pub fn prefixed_name(backend_id: &str, name: &str) -> String {
    format!("{}{}{}", backend_id, PREFIX_SEPARATOR, name)
}

/// Split a name of the form `<backend_id>:<tool_name>`
///
/// Only names containing exactly one separator qualify; anything else is an
/// ordinary tool name and resolves through the catalog scan instead.
pub fn parse_prefixed(name: &str) -> Option<(&str, &str)> {
    let idx = name.find(PREFIX_SEPARATOR)?;
    let (backend_id, rest) = (&name[..idx], &name[idx + 1..]);

    if rest.contains(PREFIX_SEPARATOR) || backend_id.is_empty() || rest.is_empty() {
        return None;
    }

    Some((backend_id, rest))
}

/// Per-backend failure captured during aggregation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendFailure {
    pub backend_id: String,
    pub error: String,
}

/// Merge tool catalogs in registration order
///
/// The first occurrence of a name keeps it; every later occurrence is renamed
/// to `<backendId>:<toolName>`, so names are unique in the aggregate by
/// construction.
pub fn merge_tools(backend_tools: Vec<(String, Vec<McpTool>)>) -> Vec<McpTool> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut merged = Vec::new();

    for (backend_id, tools) in backend_tools {
        for mut tool in tools {
            if seen.contains(&tool.name) {
                tool.name = prefixed_name(&backend_id, &tool.name);
            }
            seen.insert(tool.name.clone());
            merged.push(tool);
        }
    }

    merged
}

/// Concatenate resource catalogs in registration order
///
/// Resources are unique per backend by URI and deliberately not deduplicated
/// across backends.
pub fn merge_resources(backend_resources: Vec<(String, Vec<McpResource>)>) -> Vec<McpResource> {
    backend_resources
        .into_iter()
        .flat_map(|(_, resources)| resources)
        .collect()
}

/// Merge initialize results from the backends that answered
///
/// The aggregate protocol version is the lexicographically greatest one
/// reported. MCP versions are `YYYY-MM-DD` strings, for which that is
/// chronological order; non-date version strings would sort as plain text.
/// Capability keys are a union: present iff at least one backend reported
/// them, with per-flag OR semantics.
pub fn merge_initialize_results(results: Vec<(String, InitializeResult)>) -> InitializeResult {
    let protocol_version = results
        .iter()
        .map(|(_, result)| result.protocol_version.clone())
        .max()
        .unwrap_or_else(|| PROTOCOL_VERSION.to_string());

    let mut capabilities = ServerCapabilities::default();

    for (_, result) in &results {
        if let Some(tools) = &result.capabilities.tools {
            let existing = capabilities
                .tools
                .get_or_insert(ToolsCapability { list_changed: None });
            if tools.list_changed.unwrap_or(false) {
                existing.list_changed = Some(true);
            }
        }

        if let Some(resources) = &result.capabilities.resources {
            let existing = capabilities.resources.get_or_insert(ResourcesCapability {
                list_changed: None,
                subscribe: None,
            });
            if resources.list_changed.unwrap_or(false) {
                existing.list_changed = Some(true);
            }
            if resources.subscribe.unwrap_or(false) {
                existing.subscribe = Some(true);
            }
        }

        if let Some(prompts) = &result.capabilities.prompts {
            let existing = capabilities
                .prompts
                .get_or_insert(crate::protocol::PromptsCapability { list_changed: None });
            if prompts.list_changed.unwrap_or(false) {
                existing.list_changed = Some(true);
            }
        }

        if result.capabilities.logging.is_some() {
            capabilities.logging = Some(crate::protocol::LoggingCapability {});
        }
    }

    InitializeResult {
        protocol_version,
        capabilities,
        server_info: ServerInfo {
            name: "mcpmux".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    }
}

/// Synthesized initialize result for a backend that cannot be forwarded the
/// envelope. Conservative capabilities; the name derives from the backend id.
pub fn stub_initialize_result(backend_id: &str) -> InitializeResult {
    InitializeResult {
        protocol_version: PROTOCOL_VERSION.to_string(),
        capabilities: ServerCapabilities {
            tools: Some(ToolsCapability {
                list_changed: Some(false),
            }),
            resources: Some(ResourcesCapability {
                list_changed: Some(false),
                subscribe: Some(false),
            }),
            ..Default::default()
        },
        server_info: ServerInfo {
            name: backend_id.to_string(),
            version: "0.0.0".to_string(),
        },
    }
}
