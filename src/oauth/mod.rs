//! OAuth 2.0 sign-in for the portal
//!
//! Implements the authorization-code flow with PKCE (RFC 7636) against an
//! OIDC identity provider, on behalf of browser sessions.
//!
//! Features:
//! - Flow start / callback completion with state, nonce and PKCE binding
//! - Per-session serializable token cache, written back only when changed
//! - Silent refresh using the cached refresh token
//! - Typed id-token claims with optional role set

mod authority;
mod claims;
mod error;
mod flow;
mod token_cache;

pub use authority::{AuthorityClient, AuthorityConfig, TokenGrants, TokenResponse};
pub use claims::Claims;
pub use error::AuthError;
pub use flow::{AuthFlowController, CallbackParams, FlowState};
pub use token_cache::{AccessToken, CachedAccount, TokenCache};
pub(crate) use token_cache::unix_now;
