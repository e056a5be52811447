//! Opaque packing of request context into the OAuth `state` parameter
//!
//! Authorization servers echo `state` verbatim but hold no server-side session
//! for the client, so the `state` query parameter is the only channel that
//! survives the authorization round trip. The backend id, the PKCE verifier,
//! and the CSRF token ride through it as base64url-encoded JSON.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use mux_types::{AppError, AppResult};
use serde::{Deserialize, Serialize};

/// Context bound to one authorization round trip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthState {
    /// Backend the callback belongs to
    pub backend_id: String,

    /// PKCE code verifier for the token exchange
    pub code_verifier: String,

    /// Random CSRF token from [`crate::pkce::generate_state`]
    pub state: String,
}

impl AuthState {
    pub fn new(backend_id: String, code_verifier: String, state: String) -> Self {
        Self {
            backend_id,
            code_verifier,
            state,
        }
    }

    /// Encode as the value to place in the `state` query parameter.
    pub fn encode(&self) -> AppResult<String> {
        Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(self)?))
    }

    /// Decode a `state` parameter received on the callback.
    ///
    /// Strict: anything that is not base64url-wrapped JSON of exactly this
    /// shape, or that carries empty fields, is rejected rather than guessed at.
    pub fn decode(encoded: &str) -> AppResult<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| AppError::OAuth(format!("state parameter is not valid base64url: {}", e)))?;

        let decoded: AuthState = serde_json::from_slice(&bytes).map_err(|e| {
            AppError::OAuth(format!("state parameter does not match the expected shape: {}", e))
        })?;

        if decoded.backend_id.is_empty() || decoded.code_verifier.is_empty() || decoded.state.is_empty() {
            return Err(AppError::OAuth(
                "state parameter decoded with empty fields".to_string(),
            ));
        }

        Ok(decoded)
    }
}
