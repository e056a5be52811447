//! PKCE (Proof Key for Code Exchange) utilities for OAuth 2.1
//!
//! Implements PKCE as defined in RFC 7636 with the S256 (SHA-256) challenge
//! method.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// PKCE challenge containing code verifier and challenge
///
/// Ephemeral: lives for exactly one authorization round trip, carried through
/// the `state` parameter via [`crate::state::AuthState`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PkceChallenge {
    /// Code verifier (base64url of 32 random bytes)
    pub code_verifier: String,

    /// Code challenge (BASE64URL(SHA256(code_verifier)))
    pub code_challenge: String,

    /// Challenge method (always "S256" for SHA-256)
    pub code_challenge_method: String,
}

/// Generate a PKCE pair for the OAuth authorization code flow
///
/// The verifier is the base64url encoding of 32 cryptographically random
/// bytes (43 characters, within the RFC 7636 43-128 range), and the challenge
/// is the base64url-encoded SHA-256 hash of the verifier.
pub fn generate_pkce() -> PkceChallenge {
    let mut bytes = [0u8; 32];
    thread_rng().fill(&mut bytes[..]);
    let code_verifier = URL_SAFE_NO_PAD.encode(bytes);

    let mut hasher = Sha256::new();
    hasher.update(code_verifier.as_bytes());
    let code_challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

    PkceChallenge {
        code_verifier,
        code_challenge,
        code_challenge_method: "S256".to_string(),
    }
}

/// Generate a random state string for CSRF protection
///
/// Base64url encoding of 32 random bytes. Pure entropy; request context is
/// bound to it by [`crate::state::AuthState`], not by this value itself.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    thread_rng().fill(&mut bytes[..]);
    URL_SAFE_NO_PAD.encode(bytes)
}
