//! Token persistence surface
//!
//! The core produces and consumes tokens; where they live is the embedding
//! application's decision. [`MemoryTokenStore`] backs tests and short-lived
//! embeddings; a keychain- or database-backed store implements the same trait
//! outside this crate.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mux_types::AppResult;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// An OAuth access token with its refresh companion and expiry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthToken {
    /// Access token
    pub access_token: String,

    /// Token type (usually "Bearer")
    pub token_type: String,

    /// Refresh token (if the server issued one)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Expiry instant; absent means the token never expires
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Granted scope
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl OAuthToken {
    /// A token with no `expires_at` never expires.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= Utc::now(),
            None => false,
        }
    }

    /// Value for the `Authorization` request header.
    pub fn authorization_value(&self) -> String {
        let token_type = if self.token_type.is_empty() {
            "Bearer"
        } else {
            &self.token_type
        };
        format!("{} {}", token_type, self.access_token)
    }
}

/// Token persistence keyed by backend id
///
/// Implementations are externally synchronized; this core never assumes more
/// than one writer per backend id at a time.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn store(&self, backend_id: &str, token: OAuthToken) -> AppResult<()>;

    async fn get(&self, backend_id: &str) -> AppResult<Option<OAuthToken>>;

    async fn update(&self, backend_id: &str, token: OAuthToken) -> AppResult<()>;

    async fn delete(&self, backend_id: &str) -> AppResult<()>;
}

/// In-memory token store
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<HashMap<String, OAuthToken>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn store(&self, backend_id: &str, token: OAuthToken) -> AppResult<()> {
        self.tokens.write().insert(backend_id.to_string(), token);
        Ok(())
    }

    async fn get(&self, backend_id: &str) -> AppResult<Option<OAuthToken>> {
        Ok(self.tokens.read().get(backend_id).cloned())
    }

    async fn update(&self, backend_id: &str, token: OAuthToken) -> AppResult<()> {
        self.tokens.write().insert(backend_id.to_string(), token);
        Ok(())
    }

    async fn delete(&self, backend_id: &str) -> AppResult<()> {
        self.tokens.write().remove(backend_id);
        Ok(())
    }
}
