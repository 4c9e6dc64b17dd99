//! Secret resolution
//!
//! Application settings (client registration, storage account, roles) live
//! in a secret store and are read once at startup. Any missing value stops
//! the process.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::{SecretProviderKind, SecretsConfig};
use crate::credential::TokenCredential;
use crate::{Error, Result};

/// Scope for key vault data-plane tokens
const KEYVAULT_SCOPE: &str = "https://vault.azure.net/.default";

/// Key vault REST API version
const KEYVAULT_API_VERSION: &str = "7.4";

/// Named secret lookup
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Value of a secret, `None` when it does not exist
    async fn get_secret(&self, name: &str) -> Result<Option<String>>;
}

#[async_trait]
impl SecretStore for HashMap<String, String> {
    async fn get_secret(&self, name: &str) -> Result<Option<String>> {
        Ok(self.get(name).cloned())
    }
}

/// Secrets from environment variables: `clientid` reads `{prefix}CLIENTID`
#[derive(Debug, Clone)]
pub struct EnvSecretStore {
    prefix: String,
}

impl EnvSecretStore {
    /// Create a store reading `{prefix}{NAME}`
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name.to_uppercase().replace('-', "_"))
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get_secret(&self, name: &str) -> Result<Option<String>> {
        Ok(std::env::var(self.var_name(name)).ok())
    }
}

#[derive(Deserialize)]
struct SecretBundle {
    value: String,
}

/// Secrets from a cloud key vault over its REST API
pub struct KeyVaultSecretStore {
    client: Client,
    vault_url: String,
    credential: Arc<dyn TokenCredential>,
}

impl std::fmt::Debug for KeyVaultSecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyVaultSecretStore")
            .field("vault_url", &self.vault_url)
            .finish_non_exhaustive()
    }
}

impl KeyVaultSecretStore {
    /// Create a store for `vault_url` (e.g. `https://myvault.vault.azure.net`)
    #[must_use]
    pub fn new(client: Client, vault_url: &str, credential: Arc<dyn TokenCredential>) -> Self {
        Self {
            client,
            vault_url: vault_url.trim_end_matches('/').to_string(),
            credential,
        }
    }
}

#[async_trait]
impl SecretStore for KeyVaultSecretStore {
    async fn get_secret(&self, name: &str) -> Result<Option<String>> {
        let token = self.credential.token(KEYVAULT_SCOPE).await?;
        let url = format!("{}/secrets/{name}", self.vault_url);

        let response = self
            .client
            .get(&url)
            .query(&[("api-version", KEYVAULT_API_VERSION)])
            .bearer_auth(token)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!(secret = %name, "Secret not found in vault");
                Ok(None)
            }
            status if status.is_success() => {
                let bundle: SecretBundle = response.json().await?;
                Ok(Some(bundle.value))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(Error::Config(format!(
                    "Key vault refused secret '{name}' ({status}): {body}"
                )))
            }
        }
    }
}

/// Build the configured secret store
pub fn secret_store_from_config(
    config: &SecretsConfig,
    client: Client,
    credential: Arc<dyn TokenCredential>,
) -> Result<Arc<dyn SecretStore>> {
    match config.provider {
        SecretProviderKind::Keyvault => {
            let vault_url = config.keyvault_uri.as_deref().ok_or_else(|| {
                Error::Config(
                    "KEYVAULT_URI (or secrets.keyvault_uri) is not set".to_string(),
                )
            })?;
            info!(vault = %vault_url, "Reading settings from key vault");
            Ok(Arc::new(KeyVaultSecretStore::new(client, vault_url, credential)))
        }
        SecretProviderKind::Env => {
            info!(prefix = %config.env_prefix, "Reading settings from environment");
            Ok(Arc::new(EnvSecretStore::new(config.env_prefix.clone())))
        }
    }
}

/// Application settings resolved at startup
#[derive(Clone)]
pub struct AppSettings {
    /// Application (client) id
    pub client_id: String,
    /// Authority URL
    pub authority: String,
    /// Path of the OAuth callback route
    pub redirect_path: String,
    /// Name of the secret holding the client secret
    pub secret_name: String,
    /// Default storage account name
    pub storage_name: String,
    /// Roles that may use the portal
    pub roles: BTreeSet<String>,
    /// Client secret
    pub client_secret: String,
}

impl std::fmt::Debug for AppSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppSettings")
            .field("client_id", &self.client_id)
            .field("authority", &self.authority)
            .field("redirect_path", &self.redirect_path)
            .field("secret_name", &self.secret_name)
            .field("storage_name", &self.storage_name)
            .field("roles", &self.roles)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

async fn required(store: &dyn SecretStore, name: &str) -> Result<String> {
    store
        .get_secret(name)
        .await?
        .ok_or_else(|| Error::Config(format!("Secret '{name}' is not set")))
}

/// Read every setting from `store`. A missing value is a fatal error.
pub async fn resolve_settings(store: &dyn SecretStore) -> Result<AppSettings> {
    let client_id = required(store, "clientid").await?;
    let authority = required(store, "authority").await?;
    let redirect_path = required(store, "redirectpath").await?;
    let secret_name = required(store, "secretname").await?;
    let storage_name = required(store, "storagename").await?;
    let roles = format_roles(store.get_secret("roles").await?.as_deref())?;
    let client_secret = required(store, &secret_name).await?;

    if !redirect_path.starts_with('/') {
        return Err(Error::Config(format!(
            "redirectpath must start with '/', got '{redirect_path}'"
        )));
    }

    info!(
        client_id = %client_id,
        storage = %storage_name,
        roles = ?roles,
        "Resolved application settings"
    );

    Ok(AppSettings {
        client_id,
        authority,
        redirect_path,
        secret_name,
        storage_name,
        roles,
        client_secret,
    })
}

/// Parse the comma-separated role list.
///
/// Unset is an error; an empty string allows any role.
pub fn format_roles(roles: Option<&str>) -> Result<BTreeSet<String>> {
    let roles = roles.ok_or_else(|| Error::Config("Secret 'roles' is not set".to_string()))?;
    Ok(roles
        .split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(String::from)
        .collect())
}
