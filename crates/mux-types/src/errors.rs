//! Error types and conversions

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("MCP error: {0}")]
    Mcp(String),

    /// Network failure or 5xx from a backend. The only retryable class.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Response framing did not match what the backend advertised. Deterministic,
    /// never retried.
    #[error("Framing error: {0}")]
    Framing(String),

    /// The backend rejected or lost the session affinity for this connection.
    #[error("Session error: {0}")]
    Session(String),

    /// JSON-RPC `error` object returned by a backend, surfaced verbatim.
    #[error("Backend returned JSON-RPC error {code}: {message}")]
    Protocol { code: i32, message: String },

    /// The backend demands OAuth. Carries the RFC 9728 metadata URL when the
    /// `WWW-Authenticate` challenge included one, so the caller can drive
    /// discovery without guessing.
    #[error("OAuth authorization required for backend '{backend_id}'")]
    OAuthRequired {
        backend_id: String,
        metadata_url: Option<String>,
    },

    #[error("OAuth error: {0}")]
    OAuth(String),

    /// No backend could serve an aggregated request.
    #[error("Aggregation error: {0}")]
    Aggregate(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type AppResult<T> = Result<T, AppError>;

impl From<AppError> for String {
    fn from(err: AppError) -> String {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oauth_required_display() {
        let err = AppError::OAuthRequired {
            backend_id: "github".to_string(),
            metadata_url: Some("https://x/meta".to_string()),
        };
        assert!(err.to_string().contains("github"));
    }

    #[test]
    fn test_serde_conversion() {
        let parse_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: AppError = parse_err.into();
        assert!(matches!(err, AppError::Serialization(_)));
    }
}
