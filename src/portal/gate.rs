//! Access gate for signed-in routes
//!
//! A request passes when the session yields an access token without user
//! interaction and the signed-in user holds one of the required roles.

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use tracing::{debug, warn};

use crate::oauth::AuthFlowController;
use crate::session::{Session, SessionHandle};
use crate::{Error, Result};

/// Where a blocked request is sent
pub const NOT_SIGNED_IN_PATH: &str = "/not_signed_in";

/// Where a request without a required role is sent
pub const ACCESS_DENIED_PATH: &str = "/access_denied";

/// Outcome of an access check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Run the handler
    Allow,
    /// No token could be obtained silently
    NotSignedIn,
    /// Signed in, but without an accepted role
    AccessDenied,
}

/// Token and role requirements shared by every guarded route
#[derive(Debug)]
pub struct AccessGate {
    flow: Arc<AuthFlowController>,
    required_roles: BTreeSet<String>,
    scopes: Vec<String>,
    bypass: bool,
}

impl AccessGate {
    /// Create a gate.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` when `bypass` is requested while
    /// `is_production` is set.
    pub fn new(
        flow: Arc<AuthFlowController>,
        required_roles: BTreeSet<String>,
        scopes: Vec<String>,
        bypass: bool,
        is_production: bool,
    ) -> Result<Self> {
        if bypass && is_production {
            return Err(Error::Config(
                "Access gate bypass requested in production".to_string(),
            ));
        }
        if bypass {
            warn!("Access gate bypass is enabled; every guarded route is open");
        }
        Ok(Self {
            flow,
            required_roles,
            scopes,
            bypass,
        })
    }

    /// Flow controller used for silent token acquisition
    #[must_use]
    pub fn flow(&self) -> &Arc<AuthFlowController> {
        &self.flow
    }

    /// Scopes every guarded route needs
    #[must_use]
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// Roles of which the user needs at least one
    #[must_use]
    pub fn required_roles(&self) -> &BTreeSet<String> {
        &self.required_roles
    }

    /// Whether the gate lets everything through
    #[must_use]
    pub fn is_bypassed(&self) -> bool {
        self.bypass
    }

    /// Decide whether `session` may proceed.
    ///
    /// A token refresh performed on the way rewrites the session's token
    /// cache, once.
    pub async fn check(&self, session: &mut Session) -> GateDecision {
        if self.bypass {
            return GateDecision::Allow;
        }

        if self.flow.session_token(session, &self.scopes).await.is_none() {
            return GateDecision::NotSignedIn;
        }

        match &session.user {
            Some(user) if user.has_any_role(&self.required_roles) => GateDecision::Allow,
            Some(user) => {
                debug!(roles = ?user.roles, "User lacks a required role");
                GateDecision::AccessDenied
            }
            None => GateDecision::AccessDenied,
        }
    }
}

/// Gate middleware for guarded routes.
///
/// Must run inside the session layer. The session lock is released before
/// the handler runs.
pub async fn gate_middleware(
    State(gate): State<Arc<AccessGate>>,
    session: SessionHandle,
    request: Request<Body>,
    next: Next,
) -> Response {
    let decision = {
        let mut session = session.lock().await;
        gate.check(&mut session).await
    };

    match decision {
        GateDecision::Allow => next.run(request).await,
        GateDecision::NotSignedIn => {
            debug!(path = %request.uri().path(), "Not signed in");
            Redirect::to(NOT_SIGNED_IN_PATH).into_response()
        }
        GateDecision::AccessDenied => {
            debug!(path = %request.uri().path(), "Access denied");
            Redirect::to(ACCESS_DENIED_PATH).into_response()
        }
    }
}
