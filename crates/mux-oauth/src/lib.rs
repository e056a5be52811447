//! OAuth 2.1 client machinery for protected MCP backends
//!
//! Implements the authorization-code + PKCE flow against endpoints discovered
//! at runtime (RFC 9728 / RFC 8414), token exchange and refresh, and a token
//! persistence trait the embedding application implements. Nothing here opens
//! a browser or serves the callback route; callers drive the flow with the
//! URLs and state this crate produces.

pub mod discovery;
pub mod flow;
pub mod pkce;
pub mod state;
pub mod token_store;

pub use discovery::{
    build_authorization_server_metadata_url, build_well_known_url, discover_oauth,
    fetch_resource_metadata, AuthorizationServerMetadata, OAuthDiscoveryResponse,
    ProtectedResourceMetadata,
};
pub use flow::{OAuthConfig, OAuthFlowManager};
pub use pkce::{generate_pkce, generate_state, PkceChallenge};
pub use state::AuthState;
pub use token_store::{MemoryTokenStore, OAuthToken, TokenStore};
