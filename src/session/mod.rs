//! Server-side browser sessions
//!
//! A [`Session`] is loaded by [`session_middleware`] before each request,
//! handed to handlers through a [`SessionHandle`], and written back only when
//! the handler changed it.

mod middleware;
mod store;

use serde::{Deserialize, Serialize};

use crate::oauth::{Claims, FlowState};

pub use middleware::{SessionHandle, SessionManager, session_middleware};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore};

/// Per-browser state
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Pending authorization-code flow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<FlowState>,
    /// Claims from the last successful sign-in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Claims>,
    /// Serialized [`crate::oauth::TokenCache`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_cache: Option<String>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("flow", &self.flow)
            .field("user", &self.user.as_ref().map(|u| &u.name))
            .field("token_cache", &self.token_cache.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Sign-in progress of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Nothing started
    Anonymous,
    /// Redirected to the provider, callback pending
    FlowStarted,
    /// A user is signed in
    Authenticated,
}

impl Session {
    /// Drop everything (logout)
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Whether the session holds no state worth persisting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flow.is_none() && self.user.is_none() && self.token_cache.is_none()
    }

    /// Current sign-in state
    #[must_use]
    pub fn auth_state(&self) -> AuthState {
        if self.user.is_some() && self.token_cache.is_some() {
            AuthState::Authenticated
        } else if self.flow.is_some() {
            AuthState::FlowStarted
        } else {
            AuthState::Anonymous
        }
    }
}
