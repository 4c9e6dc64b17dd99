//! Per-session token cache
//!
//! Holds the tokens obtained for the accounts signed in through one browser
//! session. The cache travels inside the session as a JSON string and is
//! written back only when its contents changed during the request.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::Claims;
use super::authority::TokenResponse;
use crate::session::Session;

/// Seconds before `expires_at` at which an access token counts as expired
const EXPIRY_BUFFER_SECS: u64 = 60;

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// An access token and what it was granted for
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    /// Bearer token value
    pub secret: String,

    /// Token type (usually "Bearer")
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// Expiration time (Unix timestamp); `None` never expires
    #[serde(default)]
    pub expires_at: Option<u64>,

    /// Granted scopes
    #[serde(default)]
    pub scopes: Vec<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

impl AccessToken {
    /// Check if the token is expired (with 60 second buffer)
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| unix_now() + EXPIRY_BUFFER_SECS >= expires_at)
    }

    /// Whether every requested scope was granted.
    ///
    /// Resource prefixes are ignored and names compare case-insensitively, so
    /// `User.Read` is covered by `https://graph.microsoft.com/User.Read`.
    #[must_use]
    pub fn covers(&self, scopes: &[String]) -> bool {
        scopes.iter().all(|wanted| {
            let wanted = scope_name(wanted);
            self.scopes
                .iter()
                .any(|granted| scope_name(granted).eq_ignore_ascii_case(wanted))
        })
    }

    /// Build from a token endpoint response.
    ///
    /// The requested scopes are recorded next to the granted ones: the
    /// provider answered this request, whatever names it reports back.
    #[must_use]
    pub fn from_response(response: &TokenResponse, requested: &[String]) -> Self {
        let mut scopes: Vec<String> = response
            .scope
            .as_deref()
            .map(|s| s.split_whitespace().map(String::from).collect())
            .unwrap_or_default();
        for wanted in requested {
            if !scopes.iter().any(|s| s.eq_ignore_ascii_case(wanted)) {
                scopes.push(wanted.clone());
            }
        }

        Self {
            secret: response.access_token.clone(),
            token_type: response
                .token_type
                .clone()
                .unwrap_or_else(default_token_type),
            expires_at: response.expires_in.map(|secs| unix_now() + secs),
            scopes,
        }
    }

    /// `Authorization` header value
    #[must_use]
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.secret)
    }
}

/// Scope name without its resource prefix (`https://host/Name` -> `Name`)
fn scope_name(scope: &str) -> &str {
    scope.rsplit('/').next().unwrap_or(scope)
}

/// One signed-in account
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedAccount {
    /// Account key (see [`Claims::home_account_id`])
    pub home_account_id: String,
    /// Sign-in name
    #[serde(default)]
    pub username: Option<String>,
    /// Latest access token
    pub access_token: AccessToken,
    /// Refresh token for silent renewal
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Claims of the latest id token
    pub id_token_claims: Claims,
}

impl std::fmt::Debug for CachedAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedAccount")
            .field("home_account_id", &self.home_account_id)
            .field("username", &self.username)
            .field("access_token", &self.access_token)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

/// Serializable token cache owned by a single session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenCache {
    #[serde(default)]
    accounts: BTreeMap<String, CachedAccount>,
    #[serde(skip)]
    changed: bool,
}

impl TokenCache {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a cache from its serialized form
    pub fn deserialize(serialized: &str) -> serde_json::Result<Self> {
        serde_json::from_str(serialized)
    }

    /// Serialize the cache
    pub fn serialize(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Load the cache stored in a session. An unreadable cache is dropped.
    #[must_use]
    pub fn load(session: &Session) -> Self {
        match session.token_cache.as_deref() {
            Some(serialized) if !serialized.is_empty() => Self::deserialize(serialized)
                .unwrap_or_else(|e| {
                    warn!(error = %e, "Discarding unreadable session token cache");
                    Self::new()
                }),
            _ => Self::new(),
        }
    }

    /// Write the cache back into the session if it changed
    pub fn save(&self, session: &mut Session) {
        if !self.changed {
            return;
        }
        match self.serialize() {
            Ok(serialized) => session.token_cache = Some(serialized),
            Err(e) => warn!(error = %e, "Failed to serialize session token cache"),
        }
    }

    /// Whether the cache was modified since it was loaded
    #[must_use]
    pub fn has_state_changed(&self) -> bool {
        self.changed
    }

    /// Accounts in the cache, ordered by account key
    pub fn accounts(&self) -> impl Iterator<Item = &CachedAccount> {
        self.accounts.values()
    }

    /// First cached account
    #[must_use]
    pub fn first_account(&self) -> Option<&CachedAccount> {
        self.accounts.values().next()
    }

    /// Account stored under `home_account_id`
    #[must_use]
    pub fn account(&self, home_account_id: &str) -> Option<&CachedAccount> {
        self.accounts.get(home_account_id)
    }

    /// Insert or replace an account
    pub fn upsert(&mut self, account: CachedAccount) {
        self.accounts
            .insert(account.home_account_id.clone(), account);
        self.changed = true;
    }

    /// Remove an account
    pub fn remove(&mut self, home_account_id: &str) -> Option<CachedAccount> {
        let removed = self.accounts.remove(home_account_id);
        if removed.is_some() {
            self.changed = true;
        }
        removed
    }

    /// Number of cached accounts
    #[must_use]
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    /// Whether no account is cached
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}
