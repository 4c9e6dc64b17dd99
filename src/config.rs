//! Configuration management

use std::{collections::BTreeMap, env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::data::BlobRef;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    /// Environment files to load before resolving secrets.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Session configuration
    pub session: SessionConfig,
    /// Sign-in configuration
    pub auth: AuthConfig,
    /// Secret store configuration
    pub secrets: SecretsConfig,
    /// Data files and blob cache configuration
    pub data: DataConfig,
    /// Production indicator. Also set by a non-empty `IS_PROD` variable.
    pub is_prod: bool,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or combines the auth bypass with the production indicator.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("DASH_PORTAL_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.apply_legacy_env();
        config.validate()?;

        Ok(config)
    }

    /// Reject combinations that must never reach a running server
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when the auth bypass is enabled in production.
    pub fn validate(&self) -> Result<()> {
        if self.auth.bypass && self.is_prod {
            return Err(Error::Config(
                "auth.bypass cannot be enabled when the production indicator is set".to_string(),
            ));
        }
        if !self.data.dash_url_base.starts_with('/') || !self.data.dash_url_base.ends_with('/') {
            return Err(Error::Config(format!(
                "data.dash_url_base must start and end with '/': {}",
                self.data.dash_url_base
            )));
        }
        Ok(())
    }

    /// Honour the unprefixed `IS_PROD` and `KEYVAULT_URI` variables
    fn apply_legacy_env(&mut self) {
        if env::var("IS_PROD").is_ok_and(|v| !v.is_empty()) {
            self.is_prod = true;
        }
        if self.secrets.keyvault_uri.is_none() {
            self.secrets.keyvault_uri = env::var("KEYVAULT_URI").ok().filter(|v| !v.is_empty());
        }
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Externally visible base URL (e.g. `https://portal.example.com`).
    /// When unset, derived from forwarded headers per request.
    pub public_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            public_url: None,
        }
    }
}

/// Where sessions are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStoreKind {
    /// One file per session under `session.directory`
    #[default]
    Filesystem,
    /// Process memory (lost on restart)
    Memory,
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Session store backend
    pub store: SessionStoreKind,
    /// Directory for the filesystem store
    pub directory: PathBuf,
    /// Session cookie name
    pub cookie_name: String,
    /// Mark the session cookie `Secure`
    pub secure_cookie: bool,
    /// Session lifetime
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            store: SessionStoreKind::Filesystem,
            directory: PathBuf::from("sessions"),
            cookie_name: "portal_session".to_string(),
            secure_cookie: false,
            ttl: Duration::from_secs(31 * 24 * 3600),
        }
    }
}

/// Sign-in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Scopes requested for the access token
    pub scopes: Vec<String>,
    /// API called by `/graphcall` with the signed-in user's token
    pub graph_endpoint: String,
    /// How long a started authorization flow stays redeemable
    #[serde(with = "humantime_serde")]
    pub flow_ttl: Duration,
    /// Skip the access gate entirely. Refused in production.
    pub bypass: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            scopes: vec!["User.ReadBasic.All".to_string()],
            graph_endpoint: "https://graph.microsoft.com/v1.0/me".to_string(),
            flow_ttl: Duration::from_secs(600),
            bypass: false,
        }
    }
}

/// Secret store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecretProviderKind {
    /// Cloud key vault (`secrets.keyvault_uri` / `KEYVAULT_URI`)
    #[default]
    Keyvault,
    /// Environment variables named `{env_prefix}{NAME}`
    Env,
}

/// Secret store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// Secret store backend
    pub provider: SecretProviderKind,
    /// Key vault URL
    pub keyvault_uri: Option<String>,
    /// Prefix for the environment secret store
    pub env_prefix: String,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            provider: SecretProviderKind::Keyvault,
            keyvault_uri: None,
            env_prefix: "DASH_PORTAL_SECRET_".to_string(),
        }
    }
}

/// Data files and blob cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Persisted blob cache file
    pub cache_path: PathBuf,
    /// URL prefix under which dashboards are mounted
    pub dash_url_base: String,
    /// Named data files
    pub files: BTreeMap<String, DataFileConfig>,
}

impl Default for DataConfig {
    fn default() -> Self {
        let mut files = BTreeMap::new();
        files.insert(
            "iris".to_string(),
            DataFileConfig {
                account_url: None,
                container: "test".to_string(),
                filename: "iris.csv".to_string(),
            },
        );
        Self {
            cache_path: PathBuf::from("cache.gz"),
            dash_url_base: "/views/".to_string(),
            files,
        }
    }
}

/// A data file in blob storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFileConfig {
    /// Storage account URL. Defaults to the resolved storage account.
    #[serde(default)]
    pub account_url: Option<String>,
    /// Blob container
    pub container: String,
    /// Blob name
    pub filename: String,
}

impl DataFileConfig {
    /// Resolve to a blob reference, filling in the default storage account
    #[must_use]
    pub fn resolve(&self, storage_name: &str) -> BlobRef {
        let account_url = self
            .account_url
            .clone()
            .unwrap_or_else(|| format!("https://{storage_name}.blob.core.windows.net"));
        BlobRef::new(account_url, &self.container, &self.filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_include_iris_data_file() {
        let config = Config::default();
        let iris = &config.data.files["iris"];
        assert_eq!(iris.container, "test");
        assert_eq!(iris.filename, "iris.csv");
        assert_eq!(config.data.dash_url_base, "/views/");
        assert_eq!(config.auth.scopes, vec!["User.ReadBasic.All".to_string()]);
    }

    #[test]
    fn data_file_defaults_to_storage_account_url() {
        let file = DataFileConfig {
            account_url: None,
            container: "test".to_string(),
            filename: "iris.csv".to_string(),
        };
        let blob = file.resolve("portalstore");
        assert_eq!(blob.account_url, "https://portalstore.blob.core.windows.net");
        assert_eq!(blob.container, "test");
    }

    #[test]
    fn explicit_account_url_wins() {
        let file = DataFileConfig {
            account_url: Some("https://other.blob.core.windows.net".to_string()),
            container: "c".to_string(),
            filename: "f.csv".to_string(),
        };
        assert_eq!(
            file.resolve("ignored").account_url,
            "https://other.blob.core.windows.net"
        );
    }

    #[test]
    fn bypass_in_production_is_rejected() {
        let mut config = Config::default();
        config.auth.bypass = true;
        config.is_prod = true;
        let err = config.validate().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn bypass_outside_production_is_accepted() {
        let mut config = Config::default();
        config.auth.bypass = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn dash_url_base_must_be_slash_delimited() {
        let mut config = Config::default();
        config.data.dash_url_base = "views".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn yaml_durations_use_humantime() {
        let yaml = "session:\n  ttl: 8h\nauth:\n  flow_ttl: 5m\n";
        let config: Config = Figment::new()
            .merge(Yaml::string(yaml))
            .extract()
            .unwrap();
        assert_eq!(config.session.ttl, Duration::from_secs(8 * 3600));
        assert_eq!(config.auth.flow_ttl, Duration::from_secs(300));
    }
}
