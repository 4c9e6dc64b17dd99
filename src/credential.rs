//! Cloud credentials for the secret vault and blob storage
//!
//! Credential resolution order:
//! 1. Service principal: `AZURE_TENANT_ID` + `AZURE_CLIENT_ID` + `AZURE_CLIENT_SECRET`
//! 2. Managed identity: the App Service identity endpoint (`IDENTITY_ENDPOINT`
//!    + `IDENTITY_HEADER`) when present, otherwise the instance metadata
//!    service. `AZURE_CLIENT_ID` selects a user-assigned identity.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info};

/// Refresh tokens five minutes before expiry
const TOKEN_REFRESH_MARGIN_SECS: i64 = 300;

/// Upper bound on the lifetime taken from a token response
const MAX_TOKEN_LIFETIME_SECS: i64 = 7 * 24 * 3600;

/// Instance metadata token endpoint
const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

/// Default authority for service principal sign-in
const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

/// Credential acquisition failures
#[derive(Debug, Clone, Error)]
pub enum CredentialError {
    /// The token endpoint could not be reached
    #[error("Token endpoint unreachable: {0}")]
    Request(String),

    /// The token endpoint refused the request
    #[error("Token request failed ({status}): {body}")]
    Rejected {
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },

    /// The token endpoint answered without a usable token
    #[error("Invalid token response: {0}")]
    InvalidResponse(String),
}

/// Source of bearer tokens for a resource scope
#[async_trait]
pub trait TokenCredential: Send + Sync {
    /// Bearer token valid for `scope` (e.g. `https://vault.azure.net/.default`)
    async fn token(&self, scope: &str) -> Result<String, CredentialError>;
}

/// A pre-issued token, returned for every scope
#[derive(Clone)]
pub struct StaticTokenCredential {
    token: String,
}

impl StaticTokenCredential {
    /// Wrap a token
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticTokenCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenCredential")
            .field("token", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl TokenCredential for StaticTokenCredential {
    async fn token(&self, _scope: &str) -> Result<String, CredentialError> {
        Ok(self.token.clone())
    }
}

struct CachedToken {
    access_token: String,
    /// Expiry with the refresh margin already applied
    expires_at: DateTime<Utc>,
}

#[derive(Clone)]
enum CredentialSource {
    ServicePrincipal {
        authority_host: String,
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
    AppServiceIdentity {
        endpoint: String,
        header: String,
        client_id: Option<String>,
    },
    InstanceMetadata {
        endpoint: String,
        client_id: Option<String>,
    },
}

impl std::fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ServicePrincipal {
                tenant_id,
                client_id,
                ..
            } => f
                .debug_struct("ServicePrincipal")
                .field("tenant_id", tenant_id)
                .field("client_id", client_id)
                .finish_non_exhaustive(),
            Self::AppServiceIdentity { client_id, .. } => f
                .debug_struct("AppServiceIdentity")
                .field("client_id", client_id)
                .finish_non_exhaustive(),
            Self::InstanceMetadata { client_id, .. } => f
                .debug_struct("InstanceMetadata")
                .field("client_id", client_id)
                .finish_non_exhaustive(),
        }
    }
}

/// Service principal or managed identity credential with a per-scope cache
#[derive(Debug)]
pub struct AzureCredential {
    client: Client,
    source: CredentialSource,
    cache: DashMap<String, CachedTokenEntry>,
}

/// Cache slot; kept separate so the cache map stays `Debug` without tokens
struct CachedTokenEntry(CachedToken);

impl std::fmt::Debug for CachedTokenEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedToken")
            .field("expires_at", &self.0.expires_at)
            .finish_non_exhaustive()
    }
}

impl AzureCredential {
    /// Resolve the credential from environment variables
    #[must_use]
    pub fn from_env(client: Client) -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        let tenant_id = var("AZURE_TENANT_ID");
        let client_id = var("AZURE_CLIENT_ID");
        let client_secret = var("AZURE_CLIENT_SECRET");

        let source = match (tenant_id, client_id.clone(), client_secret) {
            (Some(tenant_id), Some(client_id), Some(client_secret)) => {
                info!("Cloud credential: service principal");
                CredentialSource::ServicePrincipal {
                    authority_host: DEFAULT_AUTHORITY_HOST.to_string(),
                    tenant_id,
                    client_id,
                    client_secret,
                }
            }
            _ => match (var("IDENTITY_ENDPOINT"), var("IDENTITY_HEADER")) {
                (Some(endpoint), Some(header)) => {
                    info!("Cloud credential: App Service managed identity");
                    CredentialSource::AppServiceIdentity {
                        endpoint,
                        header,
                        client_id,
                    }
                }
                _ => {
                    info!("Cloud credential: instance metadata managed identity");
                    CredentialSource::InstanceMetadata {
                        endpoint: IMDS_ENDPOINT.to_string(),
                        client_id,
                    }
                }
            },
        };

        Self::with_source(client, source)
    }

    /// Service principal credential against `authority_host`
    #[must_use]
    pub fn service_principal(
        client: Client,
        authority_host: impl Into<String>,
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self::with_source(
            client,
            CredentialSource::ServicePrincipal {
                authority_host: authority_host.into(),
                tenant_id: tenant_id.into(),
                client_id: client_id.into(),
                client_secret: client_secret.into(),
            },
        )
    }

    /// Managed identity through an App Service style identity endpoint
    #[must_use]
    pub fn app_service_identity(
        client: Client,
        endpoint: impl Into<String>,
        header: impl Into<String>,
    ) -> Self {
        Self::with_source(
            client,
            CredentialSource::AppServiceIdentity {
                endpoint: endpoint.into(),
                header: header.into(),
                client_id: None,
            },
        )
    }

    fn with_source(client: Client, source: CredentialSource) -> Self {
        Self {
            client,
            source,
            cache: DashMap::new(),
        }
    }

    fn cached(&self, scope: &str) -> Option<String> {
        self.cache
            .get(scope)
            .filter(|entry| Utc::now() < entry.0.expires_at)
            .map(|entry| entry.0.access_token.clone())
    }

    async fn acquire(&self, scope: &str) -> Result<CachedToken, CredentialError> {
        let request = match &self.source {
            CredentialSource::ServicePrincipal {
                authority_host,
                tenant_id,
                client_id,
                client_secret,
            } => {
                let url = format!(
                    "{}/{tenant_id}/oauth2/v2.0/token",
                    authority_host.trim_end_matches('/')
                );
                self.client.post(url).form(&[
                    ("grant_type", "client_credentials"),
                    ("client_id", client_id.as_str()),
                    ("client_secret", client_secret.as_str()),
                    ("scope", scope),
                ])
            }
            CredentialSource::AppServiceIdentity {
                endpoint,
                header,
                client_id,
            } => {
                let mut query = vec![
                    ("api-version", "2019-08-01"),
                    ("resource", resource_for(scope)),
                ];
                if let Some(client_id) = client_id {
                    query.push(("client_id", client_id.as_str()));
                }
                self.client
                    .get(endpoint)
                    .query(&query)
                    .header("X-IDENTITY-HEADER", header)
            }
            CredentialSource::InstanceMetadata {
                endpoint,
                client_id,
            } => {
                let mut query = vec![
                    ("api-version", "2018-02-01"),
                    ("resource", resource_for(scope)),
                ];
                if let Some(client_id) = client_id {
                    query.push(("client_id", client_id.as_str()));
                }
                self.client
                    .get(endpoint)
                    .query(&query)
                    .header("Metadata", "true")
                    .timeout(Duration::from_secs(5))
            }
        };

        let response = request
            .send()
            .await
            .map_err(|e| CredentialError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CredentialError::InvalidResponse(e.to_string()))?;
        parse_token_body(&body)
    }
}

#[async_trait]
impl TokenCredential for AzureCredential {
    async fn token(&self, scope: &str) -> Result<String, CredentialError> {
        if let Some(token) = self.cached(scope) {
            return Ok(token);
        }

        let token = self.acquire(scope).await?;
        let access_token = token.access_token.clone();
        self.cache
            .insert(scope.to_string(), CachedTokenEntry(token));
        Ok(access_token)
    }
}

/// Managed identity endpoints take a resource rather than a `.default` scope
fn resource_for(scope: &str) -> &str {
    scope.strip_suffix("/.default").unwrap_or(scope)
}

/// Token body from any of the three endpoints. `expires_in` is a number
/// from the authority and a string from the identity endpoints.
fn parse_token_body(body: &serde_json::Value) -> Result<CachedToken, CredentialError> {
    let access_token = body["access_token"]
        .as_str()
        .ok_or_else(|| CredentialError::InvalidResponse("missing access_token".to_string()))?
        .to_string();

    let expires_in_secs: i64 = body["expires_in"]
        .as_i64()
        .or_else(|| body["expires_in"].as_str().and_then(|s| s.parse().ok()))
        .unwrap_or(3600)
        .clamp(0, MAX_TOKEN_LIFETIME_SECS);

    let expires_at =
        Utc::now() + chrono::Duration::seconds(expires_in_secs - TOKEN_REFRESH_MARGIN_SECS);

    debug!(expires_in_secs, "Acquired cloud access token");

    Ok(CachedToken {
        access_token,
        expires_at,
    })
}
