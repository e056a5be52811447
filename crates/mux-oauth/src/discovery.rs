//! Runtime OAuth endpoint discovery
//!
//! Implements the two-step discovery chain for protected MCP backends:
//! Protected Resource Metadata (RFC 9728) names the authorization servers,
//! then Authorization Server Metadata (RFC 8414) yields the authorization and
//! token endpoints. Per-backend static endpoint configuration is the fallback,
//! not the norm.

use mux_types::{AppError, AppResult};
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Protected Resource Metadata (RFC 9728)
///
/// Response from the `.well-known/oauth-protected-resource` endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProtectedResourceMetadata {
    /// Human-readable name of the resource
    #[serde(default)]
    pub resource_name: Option<String>,

    /// Protected resource identifier
    #[serde(default)]
    pub resource: Option<String>,

    /// Authorization servers that can issue tokens for this resource
    #[serde(default)]
    pub authorization_servers: Vec<String>,

    /// Methods for sending bearer tokens (e.g., "header")
    #[serde(default)]
    pub bearer_methods_supported: Vec<String>,

    /// Supported scopes for this resource
    #[serde(default)]
    pub scopes_supported: Vec<String>,
}

/// OAuth Authorization Server Metadata (RFC 8414)
///
/// Response from the `.well-known/oauth-authorization-server` endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthorizationServerMetadata {
    /// Authorization endpoint URL
    pub authorization_endpoint: String,

    /// Token endpoint URL
    pub token_endpoint: String,

    /// Dynamic client registration endpoint, if the server offers one
    #[serde(default)]
    pub registration_endpoint: Option<String>,

    /// Supported scopes
    #[serde(default)]
    pub scopes_supported: Vec<String>,

    /// Supported grant types
    #[serde(default)]
    pub grant_types_supported: Vec<String>,
}

/// Combined discovery result
///
/// Unifies protected resource metadata and authorization server metadata into
/// the fields the flow manager needs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OAuthDiscoveryResponse {
    /// Authorization endpoint URL
    #[serde(rename = "authorization_endpoint")]
    pub auth_url: String,

    /// Token endpoint URL
    pub token_endpoint: String,

    /// Dynamic client registration endpoint; surfaced for callers, unused here
    #[serde(default)]
    pub registration_endpoint: Option<String>,

    /// Supported scopes
    #[serde(default)]
    pub scopes_supported: Vec<String>,

    /// Supported grant types
    #[serde(default)]
    pub grant_types_supported: Vec<String>,
}

/// Build a well-known URL for OAuth protected resource discovery per RFC 8615
///
/// When the protected resource identifier has a path component, the
/// `/.well-known/oauth-protected-resource` segment is inserted between
/// the host and the path component.
///
/// # Examples
/// - `https://api.example.com` → `https://api.example.com/.well-known/oauth-protected-resource`
/// - `https://api.example.com/mcp` → `https://api.example.com/.well-known/oauth-protected-resource/mcp`
pub fn build_well_known_url(resource_url: &str) -> String {
    insert_well_known(resource_url, "oauth-protected-resource")
}

/// Build a well-known URL for Authorization Server Metadata (RFC 8414)
///
/// Same path-insertion rule as [`build_well_known_url`], different suffix.
pub fn build_authorization_server_metadata_url(auth_server_url: &str) -> String {
    insert_well_known(auth_server_url, "oauth-authorization-server")
}

fn insert_well_known(url: &str, suffix: &str) -> String {
    let url = url.trim_end_matches('/');

    // URL format: scheme://host[:port][/path]
    if let Some(scheme_end) = url.find("://") {
        let after_scheme = &url[scheme_end + 3..];

        if let Some(path_start) = after_scheme.find('/') {
            let host_end = scheme_end + 3 + path_start;
            let origin = &url[..host_end];
            let path = &url[host_end..];

            // Insert well-known between origin and path
            format!("{}/.well-known/{}{}", origin, suffix, path)
        } else {
            format!("{}/.well-known/{}", url, suffix)
        }
    } else {
        // Malformed URL, just append (shouldn't happen)
        format!("{}/.well-known/{}", url, suffix)
    }
}

/// Fetch protected resource metadata from an explicit URL
///
/// Used when a 401 challenge already named the metadata document via
/// `resource_metadata_uri`, skipping the well-known construction.
pub async fn fetch_resource_metadata(
    client: &Client,
    metadata_url: &str,
) -> AppResult<ProtectedResourceMetadata> {
    let response = client
        .get(metadata_url)
        .send()
        .await
        .map_err(|e| AppError::OAuth(format!("failed to fetch resource metadata: {}", e)))?;

    if !response.status().is_success() {
        return Err(AppError::OAuth(format!(
            "resource metadata endpoint {} returned {}",
            metadata_url,
            response.status()
        )));
    }

    response
        .json()
        .await
        .map_err(|e| AppError::OAuth(format!("failed to parse resource metadata: {}", e)))
}

/// Discover OAuth configuration for a backend
///
/// Two-step process per RFC 9728 and RFC 8414:
/// 1. Fetch Protected Resource Metadata from `.well-known/oauth-protected-resource`
/// 2. Fetch Authorization Server Metadata from each `authorization_servers` entry
///
/// Returns `Ok(None)` when the backend publishes no metadata; most servers
/// without OAuth simply 404 the well-known path.
pub async fn discover_oauth(
    client: &Client,
    base_url: &str,
) -> AppResult<Option<OAuthDiscoveryResponse>> {
    let discovery_url = build_well_known_url(base_url);
    tracing::info!("Discovering protected resource metadata at: {}", discovery_url);

    let response = match client.get(&discovery_url).send().await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::debug!("OAuth discovery failed (server may not require OAuth): {}", e);
            return Ok(None);
        }
    };

    if !response.status().is_success() {
        tracing::debug!(
            "OAuth discovery returned status {} (server may not require OAuth)",
            response.status()
        );
        return Ok(None);
    }

    let resource_metadata: ProtectedResourceMetadata = response
        .json()
        .await
        .map_err(|e| AppError::OAuth(format!("failed to parse protected resource metadata: {}", e)))?;

    if resource_metadata.authorization_servers.is_empty() {
        tracing::debug!("No authorization servers listed in protected resource metadata");
        return Ok(None);
    }

    for auth_server in &resource_metadata.authorization_servers {
        if let Some(discovery) =
            discover_authorization_server(client, auth_server, &resource_metadata.scopes_supported)
                .await?
        {
            return Ok(Some(discovery));
        }
    }

    tracing::debug!("No authorization server published RFC 8414 metadata");
    Ok(None)
}

async fn discover_authorization_server(
    client: &Client,
    auth_server_url: &str,
    resource_scopes: &[String],
) -> AppResult<Option<OAuthDiscoveryResponse>> {
    let metadata_url = build_authorization_server_metadata_url(auth_server_url);
    tracing::debug!("Trying authorization server metadata at: {}", metadata_url);

    let response = match client.get(&metadata_url).send().await {
        Ok(resp) if resp.status().is_success() => resp,
        _ => return Ok(None),
    };

    let metadata: AuthorizationServerMetadata = match response.json().await {
        Ok(metadata) => metadata,
        Err(_) => return Ok(None),
    };

    tracing::info!(
        "Authorization server metadata found: auth={}, token={}",
        metadata.authorization_endpoint,
        metadata.token_endpoint
    );

    // Prefer the scopes the authorization server advertises, falling back to
    // what the resource published.
    let scopes = if metadata.scopes_supported.is_empty() {
        resource_scopes.to_vec()
    } else {
        metadata.scopes_supported
    };

    Ok(Some(OAuthDiscoveryResponse {
        auth_url: metadata.authorization_endpoint,
        token_endpoint: metadata.token_endpoint,
        registration_endpoint: metadata.registration_endpoint,
        scopes_supported: scopes,
        grant_types_supported: metadata.grant_types_supported,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_well_known_url_no_path() {
        assert_eq!(
            build_well_known_url("https://api.example.com"),
            "https://api.example.com/.well-known/oauth-protected-resource"
        );

        assert_eq!(
            build_well_known_url("https://api.example.com/"),
            "https://api.example.com/.well-known/oauth-protected-resource"
        );
    }

    #[test]
    fn test_build_well_known_url_with_path() {
        assert_eq!(
            build_well_known_url("https://api.githubcopilot.com/mcp"),
            "https://api.githubcopilot.com/.well-known/oauth-protected-resource/mcp"
        );

        assert_eq!(
            build_well_known_url("https://gitlab.com/api/v4/mcp"),
            "https://gitlab.com/.well-known/oauth-protected-resource/api/v4/mcp"
        );

        assert_eq!(
            build_well_known_url("https://api.example.com/mcp/"),
            "https://api.example.com/.well-known/oauth-protected-resource/mcp"
        );
    }

    #[test]
    fn test_build_well_known_url_with_port() {
        assert_eq!(
            build_well_known_url("https://api.example.com:8443/mcp"),
            "https://api.example.com:8443/.well-known/oauth-protected-resource/mcp"
        );
    }

    #[test]
    fn test_build_authorization_server_metadata_url() {
        assert_eq!(
            build_authorization_server_metadata_url("https://auth.example.com"),
            "https://auth.example.com/.well-known/oauth-authorization-server"
        );

        assert_eq!(
            build_authorization_server_metadata_url("https://github.com/login/oauth"),
            "https://github.com/.well-known/oauth-authorization-server/login/oauth"
        );
    }
}
