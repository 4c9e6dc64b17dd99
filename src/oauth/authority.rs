//! Identity provider client
//!
//! Token endpoint calls for a confidential client registered with the
//! provider (client id + client secret).

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::AuthError;

/// Scopes every sign-in requests in addition to the configured ones
const RESERVED_SCOPES: [&str; 3] = ["openid", "profile", "offline_access"];

/// Immutable per-process client registration
#[derive(Clone)]
pub struct AuthorityConfig {
    /// Application (client) id
    pub client_id: String,
    /// Authority URL, e.g. `https://login.microsoftonline.com/{tenant}`
    pub authority: String,
    /// Client secret resolved from the secret store at startup
    pub client_secret: String,
    /// Path of the OAuth callback route, e.g. `/getAToken`
    pub redirect_path: String,
}

impl std::fmt::Debug for AuthorityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorityConfig")
            .field("client_id", &self.client_id)
            .field("authority", &self.authority)
            .field("client_secret", &"<redacted>")
            .field("redirect_path", &self.redirect_path)
            .finish()
    }
}

/// OAuth token endpoint response
#[derive(Deserialize)]
pub struct TokenResponse {
    /// Access token
    pub access_token: String,
    /// Token type
    #[serde(default)]
    pub token_type: Option<String>,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Refresh token (rotated on refresh)
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// OIDC id token
    #[serde(default)]
    pub id_token: Option<String>,
    /// Granted scopes, space separated
    #[serde(default)]
    pub scope: Option<String>,
}

impl std::fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenResponse")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// OAuth error response body
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Client for the identity provider's OAuth endpoints
#[derive(Debug, Clone)]
pub struct AuthorityClient {
    http_client: Client,
    config: AuthorityConfig,
}

impl AuthorityClient {
    /// Create a client bound to one registration
    #[must_use]
    pub fn new(http_client: Client, config: AuthorityConfig) -> Self {
        Self {
            http_client,
            config,
        }
    }

    /// Client registration
    #[must_use]
    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    fn endpoint(&self, name: &str) -> String {
        format!(
            "{}/oauth2/v2.0/{name}",
            self.config.authority.trim_end_matches('/')
        )
    }

    /// Authorization endpoint URL
    #[must_use]
    pub fn authorize_endpoint(&self) -> String {
        self.endpoint("authorize")
    }

    /// Token endpoint URL
    #[must_use]
    pub fn token_endpoint(&self) -> String {
        self.endpoint("token")
    }

    /// Provider logout URL that returns the browser to `post_logout_redirect_uri`
    pub fn logout_url(&self, post_logout_redirect_uri: &str) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&self.endpoint("logout"))?;
        url.query_pairs_mut()
            .append_pair("post_logout_redirect_uri", post_logout_redirect_uri);
        Ok(url)
    }

    /// Requested scopes plus the reserved OIDC scopes, deduplicated
    #[must_use]
    pub fn full_scopes(scopes: &[String]) -> Vec<String> {
        let mut all: Vec<String> = Vec::with_capacity(scopes.len() + RESERVED_SCOPES.len());
        for scope in scopes
            .iter()
            .map(String::as_str)
            .chain(RESERVED_SCOPES.iter().copied())
        {
            if !all.iter().any(|s| s.eq_ignore_ascii_case(scope)) {
                all.push(scope.to_string());
            }
        }
        all
    }

    /// Exchange an authorization code for tokens
    pub async fn redeem_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
        scopes: &[String],
    ) -> Result<TokenResponse, AuthError> {
        let scope = Self::full_scopes(scopes).join(" ");
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("code_verifier", code_verifier),
            ("scope", scope.as_str()),
        ];

        self.post_token(&params).await
    }

    /// Redeem a refresh token for a new access token
    pub async fn redeem_refresh_token(
        &self,
        refresh_token: &str,
        scopes: &[String],
    ) -> Result<TokenResponse, AuthError> {
        let scope = Self::full_scopes(scopes).join(" ");
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("scope", scope.as_str()),
        ];

        self.post_token(&params).await
    }

    async fn post_token(&self, grant: &[(&str, &str)]) -> Result<TokenResponse, AuthError> {
        let mut form: HashMap<&str, &str> = grant.iter().copied().collect();
        form.insert("client_id", &self.config.client_id);
        form.insert("client_secret", &self.config.client_secret);

        let grant_type = form.get("grant_type").copied().unwrap_or_default();
        debug!(grant_type, endpoint = %self.token_endpoint(), "Token request");

        let response = self
            .http_client
            .post(self.token_endpoint())
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<ErrorResponse>(&body) {
                Ok(err) => AuthError::Provider {
                    error: err.error,
                    description: err.error_description.unwrap_or_default(),
                },
                Err(_) => AuthError::Provider {
                    error: format!("http_{}", status.as_u16()),
                    description: status
                        .canonical_reason()
                        .unwrap_or("Token request failed")
                        .to_string(),
                },
            });
        }

        response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))
    }
}

/// Grants redeemed at the provider's token endpoint
#[async_trait]
pub trait TokenGrants: Send + Sync + std::fmt::Debug {
    /// Authorization-code grant
    async fn redeem_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
        scopes: &[String],
    ) -> Result<TokenResponse, AuthError>;

    /// Refresh-token grant
    async fn redeem_refresh_token(
        &self,
        refresh_token: &str,
        scopes: &[String],
    ) -> Result<TokenResponse, AuthError>;
}

#[async_trait]
impl TokenGrants for AuthorityClient {
    async fn redeem_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
        scopes: &[String],
    ) -> Result<TokenResponse, AuthError> {
        AuthorityClient::redeem_code(self, code, redirect_uri, code_verifier, scopes).await
    }

    async fn redeem_refresh_token(
        &self,
        refresh_token: &str,
        scopes: &[String],
    ) -> Result<TokenResponse, AuthError> {
        AuthorityClient::redeem_refresh_token(self, refresh_token, scopes).await
    }
}
