//! Portal bootstrap and server lifecycle

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::gate::{ACCESS_DENIED_PATH, AccessGate, NOT_SIGNED_IN_PATH};
use super::router::{AppState, create_router};
use crate::config::{Config, SessionStoreKind};
use crate::credential::{AzureCredential, TokenCredential};
use crate::dashboards::{ClusterDashboard, ClusterOptions, DashboardRegistry};
use crate::data::{AzureBlobStore, BlobCache};
use crate::oauth::{AuthFlowController, AuthorityClient, AuthorityConfig};
use crate::secrets::{AppSettings, resolve_settings, secret_store_from_config};
use crate::session::{FileSessionStore, MemorySessionStore, SessionManager, SessionStore};
use crate::{Error, Result};

/// Timeout for every outbound call (identity provider, vault, storage, API)
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// How often expired sessions are swept from the store
const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(300);

/// Data file backing the bundled clustering dashboard
const CLUSTER_DATA_FILE: &str = "iris";

/// Routes the callback path must not shadow
const RESERVED_PATHS: [&str; 7] = [
    "/",
    "/menu",
    "/graphcall",
    "/health",
    "/logout",
    NOT_SIGNED_IN_PATH,
    ACCESS_DENIED_PATH,
];

/// Process-wide collaborators resolved once at startup
pub struct Bootstrap {
    /// Outbound HTTP client
    pub http_client: reqwest::Client,
    /// Credential for the vault and blob storage
    pub credential: Arc<dyn TokenCredential>,
    /// Settings read from the secret store
    pub settings: AppSettings,
}

impl Bootstrap {
    /// Build the HTTP client and credential, then read every setting from
    /// the configured secret store.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for any missing secret.
    pub async fn resolve(config: &Config) -> Result<Self> {
        let http_client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        let credential: Arc<dyn TokenCredential> =
            Arc::new(AzureCredential::from_env(http_client.clone()));

        let secrets =
            secret_store_from_config(&config.secrets, http_client.clone(), Arc::clone(&credential))?;
        let settings = resolve_settings(secrets.as_ref()).await?;

        Ok(Self {
            http_client,
            credential,
            settings,
        })
    }

    /// Blob cache over the storage account, loaded from its file
    #[must_use]
    pub fn blob_cache(&self, config: &Config) -> Arc<BlobCache> {
        let store = Arc::new(AzureBlobStore::new(
            self.http_client.clone(),
            Arc::clone(&self.credential),
        ));
        Arc::new(BlobCache::open(store, &config.data.cache_path))
    }
}

/// The dashboard portal server
pub struct Portal {
    config: Config,
    state: Arc<AppState>,
}

impl Portal {
    /// Resolve settings and wire every component.
    ///
    /// # Errors
    ///
    /// Returns an error when a setting is missing, the auth bypass is
    /// combined with production, or the session store cannot be created.
    pub async fn build(config: Config) -> Result<Self> {
        let bootstrap = Bootstrap::resolve(&config).await?;
        validate_redirect_path(&bootstrap.settings.redirect_path, &config.data.dash_url_base)?;

        let authority = AuthorityClient::new(
            bootstrap.http_client.clone(),
            AuthorityConfig {
                client_id: bootstrap.settings.client_id.clone(),
                authority: bootstrap.settings.authority.clone(),
                client_secret: bootstrap.settings.client_secret.clone(),
                redirect_path: bootstrap.settings.redirect_path.clone(),
            },
        );
        let flow = Arc::new(AuthFlowController::new(authority, config.auth.flow_ttl));

        let gate = Arc::new(AccessGate::new(
            Arc::clone(&flow),
            bootstrap.settings.roles.clone(),
            config.auth.scopes.clone(),
            config.auth.bypass,
            config.is_prod,
        )?);

        let sessions = Arc::new(SessionManager::new(
            session_store(&config).await?,
            config.session.cookie_name.clone(),
            config.session.secure_cookie,
            config.session.ttl,
        ));

        let cache = bootstrap.blob_cache(&config);
        let mut dashboards = DashboardRegistry::new(config.data.dash_url_base.clone());
        match config.data.files.get(CLUSTER_DATA_FILE) {
            Some(file) => dashboards.register(Arc::new(ClusterDashboard::new(
                ClusterOptions::iris(),
                Arc::clone(&cache),
                file.resolve(&bootstrap.settings.storage_name),
            )))?,
            None => warn!(
                file = CLUSTER_DATA_FILE,
                "Data file not configured; clustering dashboard disabled"
            ),
        }
        info!(count = dashboards.len(), "Registered dashboards");

        let state = Arc::new(AppState {
            flow,
            gate,
            sessions,
            dashboards: Arc::new(dashboards),
            http_client: bootstrap.http_client,
            graph_endpoint: config.auth.graph_endpoint.clone(),
            public_url: config.server.public_url.clone(),
        });

        Ok(Self { config, state })
    }

    /// Shared state handed to the router
    #[must_use]
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Serve until Ctrl+C or SIGTERM
    pub async fn run(self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.server.host, self.config.server.port)
            .parse()
            .map_err(|e| Error::Config(format!("Invalid address: {e}")))?;

        let app = create_router(Arc::clone(&self.state));
        let listener = TcpListener::bind(addr).await?;

        info!("Dashboard portal listening on http://{addr}");
        info!("  Dashboards: {}", self.state.dashboards.url_base());
        info!("  Sign-in callback: {}", self.state.flow.authority().config().redirect_path);
        if let Some(public_url) = &self.config.server.public_url {
            info!("  Public URL: {public_url}");
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let purge = spawn_session_purge(
            Arc::clone(self.state.sessions.store()),
            SESSION_PURGE_INTERVAL,
            shutdown_tx.subscribe(),
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        purge.abort();
        info!("Dashboard portal stopped");
        Ok(())
    }
}

/// The callback must be a path of its own
fn validate_redirect_path(redirect_path: &str, dash_url_base: &str) -> Result<()> {
    if RESERVED_PATHS.contains(&redirect_path) || redirect_path.starts_with(dash_url_base) {
        return Err(Error::Config(format!(
            "redirectpath '{redirect_path}' collides with a portal route"
        )));
    }
    Ok(())
}

async fn session_store(config: &Config) -> Result<Arc<dyn SessionStore>> {
    match config.session.store {
        SessionStoreKind::Filesystem => {
            let store = FileSessionStore::new(&config.session.directory, config.session.ttl)?;
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "Removed expired sessions"),
                Err(e) => warn!(error = %e, "Failed to purge expired sessions"),
            }
            info!(dir = %store.dir().display(), "Using filesystem session store");
            Ok(Arc::new(store))
        }
        SessionStoreKind::Memory => {
            info!("Using in-memory session store");
            Ok(Arc::new(MemorySessionStore::new(config.session.ttl)))
        }
    }
}

/// Sweep expired sessions every `every` until shutdown
pub fn spawn_session_purge(
    store: Arc<dyn SessionStore>,
    every: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match store.purge_expired().await {
                        Ok(0) => {}
                        Ok(purged) => debug!(purged, "Removed expired sessions"),
                        Err(e) => warn!(error = %e, "Failed to purge expired sessions"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }
    })
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_may_not_shadow_portal_routes() {
        assert!(validate_redirect_path("/getAToken", "/views/").is_ok());
        assert!(validate_redirect_path("/menu", "/views/").unwrap_err().is_fatal());
        assert!(validate_redirect_path("/views/cb", "/views/").is_err());
    }

    #[tokio::test]
    async fn purge_task_sweeps_expired_sessions_until_shutdown() {
        let store = Arc::new(MemorySessionStore::new(Duration::ZERO));
        for i in 0..100 {
            store
                .save(&format!("anon-{i}"), &crate::session::Session::default())
                .await
                .unwrap();
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        let task = spawn_session_purge(
            Arc::clone(&store) as Arc<dyn SessionStore>,
            Duration::from_millis(10),
            shutdown_tx.subscribe(),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.is_empty());

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn memory_session_store_needs_no_directory() {
        let mut config = Config::default();
        config.session.store = SessionStoreKind::Memory;
        config.session.directory = "/nonexistent/sessions".into();
        assert!(session_store(&config).await.is_ok());
    }

    #[tokio::test]
    async fn filesystem_session_store_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.session.directory = dir.path().join("sessions");
        session_store(&config).await.unwrap();
        assert!(config.session.directory.is_dir());
    }
}
