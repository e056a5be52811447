//! OAuth 2.1 authorization-code flow for one backend's authorization server
//!
//! Handles authorization-URL construction, the code-for-token exchange, and
//! refresh. Token persistence goes through the injected [`TokenStore`]; the
//! callback route and browser live in the embedding application.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use mux_types::{AppError, AppResult};
use regex::Regex;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::token_store::{OAuthToken, TokenStore};

/// OAuth client configuration for one backend
///
/// Usually populated from [`crate::discovery`] at runtime rather than static
/// per-backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthConfig {
    /// Authorization endpoint the user agent is sent to
    pub authorization_server_url: String,

    /// Token endpoint for code exchange and refresh
    #[serde(default)]
    pub token_endpoint: Option<String>,

    /// RFC 8707 resource indicator
    #[serde(default)]
    pub resource: Option<String>,

    /// Scopes to request
    #[serde(default)]
    pub scopes: Vec<String>,

    /// OAuth client id
    #[serde(default)]
    pub client_id: Option<String>,

    /// Client secret; present only for confidential clients
    #[serde(default)]
    pub client_secret: Option<String>,

    /// Redirect URI registered for this client
    #[serde(default)]
    pub callback_url: Option<String>,
}

/// Token response from the authorization server
#[derive(Debug, Deserialize, Serialize)]
struct TokenResponse {
    /// Access token
    access_token: String,

    /// Token type (usually "Bearer")
    #[serde(default)]
    token_type: String,

    /// Expires in seconds
    #[serde(default)]
    expires_in: Option<i64>,

    /// Refresh token (optional)
    #[serde(default)]
    refresh_token: Option<String>,

    /// Granted scope (optional)
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    /// Convert into the stored shape, carrying the previous refresh token
    /// forward when the server omitted a new one.
    fn into_token(self, previous_refresh_token: Option<&str>) -> OAuthToken {
        let expires_at: Option<DateTime<Utc>> = self
            .expires_in
            .map(|expires_in| Utc::now() + Duration::seconds(expires_in));

        OAuthToken {
            access_token: self.access_token,
            token_type: if self.token_type.is_empty() {
                "Bearer".to_string()
            } else {
                self.token_type
            },
            refresh_token: self
                .refresh_token
                .or_else(|| previous_refresh_token.map(str::to_string)),
            expires_at,
            scope: self.scope,
        }
    }
}

/// OAuth flow manager
///
/// One instance serves any number of backends; all per-backend state lives in
/// the injected store.
pub struct OAuthFlowManager {
    client: Client,
    store: Arc<dyn TokenStore>,
}

impl OAuthFlowManager {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self {
            client: Client::new(),
            store,
        }
    }

    /// Build the authorization URL the user agent is redirected to
    ///
    /// Requires `client_id` and `callback_url`. Emits PKCE parameters only
    /// when a challenge is supplied.
    pub fn build_authorization_url(
        &self,
        config: &OAuthConfig,
        state: &str,
        code_challenge: Option<&str>,
    ) -> AppResult<String> {
        let client_id = config
            .client_id
            .as_deref()
            .ok_or_else(|| AppError::OAuth("client_id is required to build an authorization URL".to_string()))?;
        let callback_url = config
            .callback_url
            .as_deref()
            .ok_or_else(|| AppError::OAuth("callback_url is required to build an authorization URL".to_string()))?;

        let mut url = format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&state={}",
            config.authorization_server_url,
            urlencoding::encode(client_id),
            urlencoding::encode(callback_url),
            urlencoding::encode(state),
        );

        let scope = config.scopes.join(" ");
        if !scope.is_empty() {
            url.push_str(&format!("&scope={}", urlencoding::encode(&scope)));
        }

        if let Some(resource) = &config.resource {
            url.push_str(&format!("&resource={}", urlencoding::encode(resource)));
        }

        if let Some(challenge) = code_challenge {
            url.push_str(&format!(
                "&code_challenge={}&code_challenge_method=S256",
                urlencoding::encode(challenge)
            ));
        }

        Ok(url)
    }

    /// Exchange an authorization code for a token and persist it
    pub async fn exchange_authorization_code(
        &self,
        backend_id: &str,
        config: &OAuthConfig,
        code: &str,
        code_verifier: &str,
    ) -> AppResult<OAuthToken> {
        let callback_url = config
            .callback_url
            .as_deref()
            .ok_or_else(|| AppError::OAuth("callback_url is required for the token exchange".to_string()))?;

        let mut params: Vec<(&str, String)> = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", callback_url.to_string()),
            ("code_verifier", code_verifier.to_string()),
        ];

        let token_response = self.token_request(config, &mut params).await?;
        let token = token_response.into_token(None);

        self.store.store(backend_id, token.clone()).await?;
        info!("Token exchange successful for backend: {}", backend_id);

        Ok(token)
    }

    /// Refresh an access token and persist the result
    ///
    /// The old refresh token is carried forward when the server omits a new
    /// one, which most servers do.
    pub async fn refresh_token(
        &self,
        backend_id: &str,
        config: &OAuthConfig,
        refresh_token: &str,
    ) -> AppResult<OAuthToken> {
        let mut params: Vec<(&str, String)> = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
        ];

        let token_response = self.token_request(config, &mut params).await?;
        let token = token_response.into_token(Some(refresh_token));

        self.store.update(backend_id, token.clone()).await?;
        info!("Token refresh successful for backend: {}", backend_id);

        Ok(token)
    }

    /// Add `Authorization` for a stored, non-expired token
    ///
    /// Never refreshes; an expired token simply contributes nothing and the
    /// caller sees the backend's 401 instead.
    pub async fn inject_headers(
        &self,
        backend_id: &str,
        headers: &mut HashMap<String, String>,
    ) -> AppResult<()> {
        if let Some(token) = self.store.get(backend_id).await? {
            if !token.is_expired() {
                headers.insert("Authorization".to_string(), token.authorization_value());
            }
        }
        Ok(())
    }

    /// One `application/x-www-form-urlencoded` POST to the token endpoint
    ///
    /// Confidential clients (secret present) authenticate via HTTP Basic;
    /// public clients send `client_id` in the form body.
    async fn token_request(
        &self,
        config: &OAuthConfig,
        params: &mut Vec<(&str, String)>,
    ) -> AppResult<TokenResponse> {
        let client_id = config
            .client_id
            .as_deref()
            .ok_or_else(|| AppError::OAuth("client_id is required at the token endpoint".to_string()))?;
        let token_endpoint = config.token_endpoint.as_deref().ok_or_else(|| {
            AppError::OAuth("token_endpoint is not configured; run discovery first".to_string())
        })?;

        let mut request = self.client.post(token_endpoint);
        if let Some(secret) = &config.client_secret {
            request = request.basic_auth(client_id, Some(secret));
        } else {
            params.push(("client_id", client_id.to_string()));
        }

        let response = request
            .form(&params)
            .send()
            .await
            .map_err(|e| AppError::OAuth(format!("token request to {} failed: {}", token_endpoint, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::OAuth(format!(
                "token endpoint returned {}: {}",
                status,
                extract_error_message(&body)
            )));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("")
            .to_string();

        if !content_type.starts_with("application/json") {
            return Err(AppError::OAuth(format!(
                "token endpoint returned content type '{}' where application/json was expected",
                content_type
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| AppError::OAuth(format!("failed to parse token response: {}", e)))
    }
}

/// Best-effort error message extraction from a token endpoint failure body
///
/// Tries the RFC 6749 JSON fields first, then common HTML locations for
/// servers that answer with an error page, then a truncated raw body.
fn extract_error_message(body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(description) = json.get("error_description").and_then(|v| v.as_str()) {
            return description.to_string();
        }
        if let Some(error) = json.get("error").and_then(|v| v.as_str()) {
            return error.to_string();
        }
    }

    for pattern in [
        r"(?is)<title[^>]*>(.*?)</title>",
        r"(?is)<h1[^>]*>(.*?)</h1>",
        r"(?is)<p[^>]*>(.*?)</p>",
    ] {
        if let Some(text) = Regex::new(pattern)
            .ok()
            .and_then(|re| re.captures(body))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim())
            .filter(|text| !text.is_empty())
        {
            return text.to_string();
        }
    }

    truncate(body)
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
