//! Authorization-code flow controller
//!
//! Drives one sign-in per browser session: `start_flow` builds the
//! authorization request and the state the callback is checked against,
//! `complete_flow` redeems the code, and `silent_token` keeps the session's
//! access token fresh from the cached refresh token.

use std::sync::Arc;
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use url::Url;

use super::authority::{AuthorityClient, TokenGrants};
use super::token_cache::{AccessToken, CachedAccount, TokenCache, unix_now};
use super::{AuthError, Claims};
use crate::session::Session;
use crate::{Error, Result};

/// Pending authorization request, stored in the session between the
/// redirect to the provider and the callback.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowState {
    /// Anti-CSRF value echoed back by the provider
    pub state: String,
    /// Value the id token must carry
    pub nonce: String,
    /// PKCE verifier
    pub code_verifier: String,
    /// Where the user agent is sent to sign in
    pub auth_uri: String,
    /// Absolute callback URL registered with the provider
    pub redirect_uri: String,
    /// Scopes requested at start
    pub scopes: Vec<String>,
    /// Creation time (Unix timestamp)
    pub created_at: u64,
}

impl std::fmt::Debug for FlowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowState")
            .field("state", &self.state)
            .field("code_verifier", &"<redacted>")
            .field("redirect_uri", &self.redirect_uri)
            .field("scopes", &self.scopes)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Query parameters of the OAuth callback
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    /// Authorization code
    pub code: Option<String>,
    /// State echoed by the provider
    pub state: Option<String>,
    /// Provider error code
    pub error: Option<String>,
    /// Provider error description
    pub error_description: Option<String>,
}

/// Orchestrates the authorization-code flow for browser sessions
#[derive(Debug, Clone)]
pub struct AuthFlowController {
    authority: AuthorityClient,
    grants: Arc<dyn TokenGrants>,
    flow_ttl: Duration,
}

impl AuthFlowController {
    /// Create a controller; flows older than `flow_ttl` are rejected
    #[must_use]
    pub fn new(authority: AuthorityClient, flow_ttl: Duration) -> Self {
        Self {
            grants: Arc::new(authority.clone()),
            authority,
            flow_ttl,
        }
    }

    /// Redeem grants through `grants` instead of the authority client
    #[must_use]
    pub fn with_grants(mut self, grants: Arc<dyn TokenGrants>) -> Self {
        self.grants = grants;
        self
    }

    /// Provider client
    #[must_use]
    pub fn authority(&self) -> &AuthorityClient {
        &self.authority
    }

    /// Build a fresh authorization request
    pub fn start_flow(&self, scopes: &[String], redirect_uri: &str) -> Result<FlowState> {
        let (code_verifier, code_challenge) = generate_pkce();
        let state = generate_state();
        let nonce = generate_state();

        let mut auth_url = Url::parse(&self.authority.authorize_endpoint())
            .map_err(|e| Error::Config(format!("Invalid authority URL: {e}")))?;
        auth_url
            .query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.authority.config().client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("response_mode", "query")
            .append_pair("scope", &AuthorityClient::full_scopes(scopes).join(" "))
            .append_pair("state", &state)
            .append_pair("nonce", &nonce)
            .append_pair("code_challenge", &code_challenge)
            .append_pair("code_challenge_method", "S256");

        debug!(redirect_uri, "Starting authorization-code flow");

        Ok(FlowState {
            state,
            nonce,
            code_verifier,
            auth_uri: auth_url.to_string(),
            redirect_uri: redirect_uri.to_string(),
            scopes: scopes.to_vec(),
            created_at: unix_now(),
        })
    }

    /// Redeem the callback against the flow it was started with.
    ///
    /// Every check fails closed. On success the account is stored in `cache`
    /// and the id-token claims are returned.
    pub async fn complete_flow(
        &self,
        flow: Option<&FlowState>,
        params: &CallbackParams,
        cache: &mut TokenCache,
    ) -> std::result::Result<Claims, AuthError> {
        let flow = flow.ok_or(AuthError::MissingFlow)?;

        if params.state.as_deref() != Some(flow.state.as_str()) {
            return Err(AuthError::StateMismatch);
        }

        if unix_now().saturating_sub(flow.created_at) > self.flow_ttl.as_secs() {
            return Err(AuthError::FlowExpired);
        }

        if let Some(error) = &params.error {
            return Err(AuthError::Provider {
                error: error.clone(),
                description: params.error_description.clone().unwrap_or_default(),
            });
        }

        let code = params.code.as_deref().ok_or(AuthError::MissingCode)?;

        let response = self
            .grants
            .redeem_code(code, &flow.redirect_uri, &flow.code_verifier, &flow.scopes)
            .await?;

        let id_token = response
            .id_token
            .as_deref()
            .ok_or_else(|| AuthError::InvalidIdToken("token response has no id token".into()))?;
        let claims = Claims::from_id_token(id_token, &self.authority.config().client_id)?;

        if claims.nonce.as_deref() != Some(flow.nonce.as_str()) {
            return Err(AuthError::NonceMismatch);
        }

        let account = CachedAccount {
            home_account_id: claims.home_account_id(),
            username: claims.preferred_username.clone(),
            access_token: AccessToken::from_response(&response, &flow.scopes),
            refresh_token: response.refresh_token.clone(),
            id_token_claims: claims.clone(),
        };
        info!(account = %account.home_account_id, "User signed in");
        cache.upsert(account);

        Ok(claims)
    }

    /// Token for a cached account without user interaction.
    ///
    /// `account_id` selects the account; `None` takes the first one. An
    /// unexpired token covering `scopes` is served from the cache.
    /// Otherwise the refresh token is redeemed and rotated. `None` means the
    /// caller has to start a new flow.
    pub async fn silent_token(
        &self,
        cache: &mut TokenCache,
        account_id: Option<&str>,
        scopes: &[String],
    ) -> Option<AccessToken> {
        let account = match account_id {
            Some(id) => cache.account(id),
            None => cache.first_account(),
        }?
        .clone();

        if !account.access_token.is_expired() && account.access_token.covers(scopes) {
            return Some(account.access_token);
        }

        let refresh_token = account.refresh_token.as_deref()?;
        let response = match self
            .grants
            .redeem_refresh_token(refresh_token, scopes)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    account = %account.home_account_id,
                    error = %e.code(),
                    "Silent token refresh failed"
                );
                return None;
            }
        };

        let access_token = AccessToken::from_response(&response, scopes);
        let client_id = &self.authority.config().client_id;
        let id_token_claims = match response
            .id_token
            .as_deref()
            .map(|id_token| Claims::from_id_token(id_token, client_id))
        {
            Some(Ok(claims)) => claims,
            _ => account.id_token_claims.clone(),
        };

        debug!(account = %account.home_account_id, "Refreshed access token");
        cache.upsert(CachedAccount {
            access_token: access_token.clone(),
            refresh_token: response.refresh_token.or(account.refresh_token),
            id_token_claims,
            ..account
        });

        Some(access_token)
    }

    /// `silent_token` for the session user's account against the cache stored
    /// in `session`, written back once
    pub async fn session_token(
        &self,
        session: &mut Session,
        scopes: &[String],
    ) -> Option<AccessToken> {
        let account_id = session.user.as_ref().map(Claims::home_account_id);
        let mut cache = TokenCache::load(session);
        let token = self
            .silent_token(&mut cache, account_id.as_deref(), scopes)
            .await;
        cache.save(session);
        token
    }

    /// Start a flow and record it as the session's pending flow
    pub fn start_session_flow(
        &self,
        session: &mut Session,
        scopes: &[String],
        redirect_uri: &str,
    ) -> Result<String> {
        let flow = self.start_flow(scopes, redirect_uri)?;
        let auth_uri = flow.auth_uri.clone();
        session.flow = Some(flow);
        Ok(auth_uri)
    }

    /// Complete the session's pending flow. The flow is consumed whatever
    /// the outcome; on success the claims become the session user.
    pub async fn complete_session_flow(
        &self,
        session: &mut Session,
        params: &CallbackParams,
    ) -> std::result::Result<Claims, AuthError> {
        let flow = session.flow.take();
        let mut cache = TokenCache::load(session);
        let claims = self.complete_flow(flow.as_ref(), params, &mut cache).await?;
        session.user = Some(claims.clone());
        cache.save(session);
        Ok(claims)
    }
}

/// Generate PKCE code verifier and S256 challenge
fn generate_pkce() -> (String, String) {
    let verifier_bytes: [u8; 32] = rand::rng().random();
    let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);

    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    let challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

    (verifier, challenge)
}

/// Generate a random state or nonce value
fn generate_state() -> String {
    let state_bytes: [u8; 16] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(state_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::AuthorityConfig;
    use std::collections::HashMap;

    fn controller() -> AuthFlowController {
        AuthFlowController::new(
            AuthorityClient::new(
                reqwest::Client::new(),
                AuthorityConfig {
                    client_id: "client-123".to_string(),
                    // Unroutable; tests here must never reach the network
                    authority: "http://127.0.0.1:9/tenant".to_string(),
                    client_secret: "s3cret".to_string(),
                    redirect_path: "/getAToken".to_string(),
                },
            ),
            Duration::from_secs(600),
        )
    }

    fn scopes() -> Vec<String> {
        vec!["User.ReadBasic.All".to_string()]
    }

    fn callback(state: &str) -> CallbackParams {
        CallbackParams {
            code: Some("code-1".to_string()),
            state: Some(state.to_string()),
            ..CallbackParams::default()
        }
    }

    #[test]
    fn pkce_challenge_is_sha256_of_verifier() {
        let (verifier, challenge) = generate_pkce();
        // 32 random bytes -> 43 base64url chars
        assert_eq!(verifier.len(), 43);

        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        assert_eq!(challenge, URL_SAFE_NO_PAD.encode(hasher.finalize()));
    }

    #[test]
    fn state_values_are_unique() {
        assert_ne!(generate_state(), generate_state());
    }

    #[test]
    fn start_flow_builds_authorization_request() {
        let flow = controller()
            .start_flow(&scopes(), "https://portal.example.com/getAToken")
            .unwrap();

        let url = Url::parse(&flow.auth_uri).unwrap();
        assert_eq!(url.path(), "/tenant/oauth2/v2.0/authorize");
        let query: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(query["response_type"], "code");
        assert_eq!(query["client_id"], "client-123");
        assert_eq!(query["redirect_uri"], "https://portal.example.com/getAToken");
        assert_eq!(query["state"], flow.state);
        assert_eq!(query["nonce"], flow.nonce);
        assert_eq!(query["code_challenge_method"], "S256");
        assert_eq!(
            query["scope"],
            "User.ReadBasic.All openid profile offline_access"
        );
        assert!(!flow.auth_uri.contains(&flow.code_verifier));
    }

    #[test]
    fn each_flow_is_fresh() {
        let c = controller();
        let a = c.start_flow(&scopes(), "http://localhost/cb").unwrap();
        let b = c.start_flow(&scopes(), "http://localhost/cb").unwrap();
        assert_ne!(a.state, b.state);
        assert_ne!(a.code_verifier, b.code_verifier);
    }

    #[tokio::test]
    async fn callback_without_flow_fails_closed() {
        let mut cache = TokenCache::new();
        let err = controller()
            .complete_flow(None, &callback("x"), &mut cache)
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::MissingFlow);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn state_mismatch_fails_closed() {
        let c = controller();
        let flow = c.start_flow(&scopes(), "http://localhost/cb").unwrap();
        let mut cache = TokenCache::new();
        let err = c
            .complete_flow(Some(&flow), &callback("forged"), &mut cache)
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::StateMismatch);
    }

    #[tokio::test]
    async fn expired_flow_fails_closed() {
        let c = controller();
        let mut flow = c.start_flow(&scopes(), "http://localhost/cb").unwrap();
        flow.created_at -= 601;
        let mut cache = TokenCache::new();
        let err = c
            .complete_flow(Some(&flow), &callback(&flow.state.clone()), &mut cache)
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::FlowExpired);
    }

    #[tokio::test]
    async fn provider_error_is_surfaced() {
        let c = controller();
        let flow = c.start_flow(&scopes(), "http://localhost/cb").unwrap();
        let params = CallbackParams {
            state: Some(flow.state.clone()),
            error: Some("access_denied".to_string()),
            error_description: Some("User cancelled".to_string()),
            ..CallbackParams::default()
        };
        let mut cache = TokenCache::new();
        let err = c
            .complete_flow(Some(&flow), &params, &mut cache)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "access_denied");
        assert_eq!(err.description(), "User cancelled");
    }

    #[tokio::test]
    async fn callback_without_code_fails() {
        let c = controller();
        let flow = c.start_flow(&scopes(), "http://localhost/cb").unwrap();
        let params = CallbackParams {
            state: Some(flow.state.clone()),
            ..CallbackParams::default()
        };
        let mut cache = TokenCache::new();
        let err = c
            .complete_flow(Some(&flow), &params, &mut cache)
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::MissingCode);
    }

    #[tokio::test]
    async fn silent_token_without_account_is_none() {
        let mut cache = TokenCache::new();
        assert!(controller().silent_token(&mut cache, None, &scopes()).await.is_none());
        assert!(!cache.has_state_changed());
    }

    #[tokio::test]
    async fn silent_token_serves_fresh_cached_token() {
        let mut cache = TokenCache::new();
        cache.upsert(CachedAccount {
            home_account_id: "u.t".to_string(),
            username: None,
            access_token: AccessToken {
                secret: "at-1".to_string(),
                token_type: "Bearer".to_string(),
                expires_at: Some(unix_now() + 3600),
                scopes: scopes(),
            },
            refresh_token: Some("rt-1".to_string()),
            id_token_claims: Claims::default(),
        });
        let cache_before = cache.serialize().unwrap();

        let token = controller()
            .silent_token(&mut cache, None, &scopes())
            .await
            .unwrap();
        assert_eq!(token.secret, "at-1");
        assert_eq!(cache.serialize().unwrap(), cache_before);
    }

    fn fresh_account(id: &str) -> CachedAccount {
        CachedAccount {
            home_account_id: id.to_string(),
            username: None,
            access_token: AccessToken {
                secret: format!("at-{id}"),
                token_type: "Bearer".to_string(),
                expires_at: Some(unix_now() + 3600),
                scopes: scopes(),
            },
            refresh_token: None,
            id_token_claims: Claims::default(),
        }
    }

    #[tokio::test]
    async fn session_token_follows_session_user() {
        let mut cache = TokenCache::new();
        cache.upsert(fresh_account("a"));
        cache.upsert(fresh_account("b"));
        let mut session = Session {
            user: Some(Claims {
                oid: Some("b".to_string()),
                ..Claims::default()
            }),
            ..Session::default()
        };
        cache.save(&mut session);

        let token = controller().session_token(&mut session, &scopes()).await.unwrap();
        assert_eq!(token.secret, "at-b");

        session.user = Some(Claims {
            oid: Some("c".to_string()),
            ..Claims::default()
        });
        assert!(controller().session_token(&mut session, &scopes()).await.is_none());
    }

    #[tokio::test]
    async fn session_flow_is_single_use() {
        let c = controller();
        let mut session = Session::default();
        let auth_uri = c
            .start_session_flow(&mut session, &scopes(), "http://localhost/cb")
            .unwrap();
        let state = session.flow.as_ref().unwrap().state.clone();
        assert!(auth_uri.contains(&state));

        let params = CallbackParams {
            state: Some(state),
            ..CallbackParams::default()
        };
        let _ = c.complete_session_flow(&mut session, &params).await;
        assert!(session.flow.is_none());

        let err = c
            .complete_session_flow(&mut session, &params)
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::MissingFlow);
    }
}
