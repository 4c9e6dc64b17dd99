//! Session persistence backends

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::Session;
use crate::oauth::unix_now;
use crate::{Error, Result};

/// Storage for sessions keyed by their cookie id
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load a live session
    async fn load(&self, id: &str) -> Result<Option<Session>>;

    /// Insert or replace a session, restarting its lifetime
    async fn save(&self, id: &str, session: &Session) -> Result<()>;

    /// Remove a session
    async fn delete(&self, id: &str) -> Result<()>;

    /// Drop every expired session; returns how many were removed
    async fn purge_expired(&self) -> Result<usize>;
}

/// Session plus its expiry as written to the backend
#[derive(Debug, Serialize, Deserialize)]
struct StoredSession {
    expires_at: u64,
    session: Session,
}

impl StoredSession {
    fn is_expired(&self) -> bool {
        unix_now() >= self.expires_at
    }
}

fn expiry(ttl: Duration) -> u64 {
    unix_now().saturating_add(ttl.as_secs())
}

/// One JSON file per session in a directory
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
    ttl: Duration,
}

impl FileSessionStore {
    /// Open (and create) the session directory
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            Error::Session(format!(
                "Failed to create session directory {}: {e}",
                dir.display()
            ))
        })?;
        Ok(Self { dir, ttl })
    }

    /// Session directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self, id: &str) -> Result<Option<Session>> {
        let path = self.path(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Session(format!("Failed to read session: {e}"))),
        };

        let stored = match serde_json::from_slice::<StoredSession>(&bytes) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "Discarding unreadable session file");
                let _ = tokio::fs::remove_file(&path).await;
                return Ok(None);
            }
        };

        if stored.is_expired() {
            debug!("Session expired");
            let _ = tokio::fs::remove_file(&path).await;
            return Ok(None);
        }

        Ok(Some(stored.session))
    }

    async fn save(&self, id: &str, session: &Session) -> Result<()> {
        let stored = StoredSession {
            expires_at: expiry(self.ttl),
            session: session.clone(),
        };
        let content = serde_json::to_vec(&stored)?;
        let path = self.path(id);

        tokio::fs::write(&path, content)
            .await
            .map_err(|e| Error::Session(format!("Failed to write session: {e}")))?;

        // Owner read/write only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await;
        }

        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Session(format!("Failed to delete session: {e}"))),
        }
    }

    /// Also removes unreadable session files
    async fn purge_expired(&self) -> Result<usize> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut removed = 0;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let stale = match tokio::fs::read(&path).await {
                Ok(bytes) => !serde_json::from_slice::<StoredSession>(&bytes)
                    .is_ok_and(|stored| !stored.is_expired()),
                Err(_) => true,
            };
            if stale && tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(removed, dir = %self.dir.display(), "Purged stale sessions");
        }
        Ok(removed)
    }
}

/// Process-local sessions, lost on restart
#[derive(Debug)]
pub struct MemorySessionStore {
    sessions: DashMap<String, StoredSession>,
    ttl: Duration,
}

impl MemorySessionStore {
    /// Create an empty store
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
        }
    }

    /// Number of stored sessions, expired ones included
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether nothing is stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, id: &str) -> Result<Option<Session>> {
        let live = self
            .sessions
            .get(id)
            .map(|entry| (!entry.is_expired()).then(|| entry.session.clone()));

        match live {
            Some(Some(session)) => Ok(Some(session)),
            Some(None) => {
                self.sessions.remove(id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn save(&self, id: &str, session: &Session) -> Result<()> {
        self.sessions.insert(
            id.to_string(),
            StoredSession {
                expires_at: expiry(self.ttl),
                session: session.clone(),
            },
        );
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.sessions.remove(id);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let before = self.sessions.len();
        self.sessions.retain(|_, stored| !stored.is_expired());
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            debug!(removed, "Purged expired sessions");
        }
        Ok(removed)
    }
}
