//! Cookie-bound session middleware

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{FromRequestParts, State},
    http::{Request, StatusCode, request::Parts},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::Rng;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, warn};

use super::{Session, SessionStore};

/// Length of an encoded session id (32 random bytes, base64url)
const SESSION_ID_LEN: usize = 43;

/// Loads and persists sessions around each request
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    cookie_name: String,
    secure: bool,
    ttl: Duration,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("cookie_name", &self.cookie_name)
            .field("secure", &self.secure)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager over a store
    #[must_use]
    pub fn new(
        store: Arc<dyn SessionStore>,
        cookie_name: impl Into<String>,
        secure: bool,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            cookie_name: cookie_name.into(),
            secure,
            ttl,
        }
    }

    /// Backing store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Name of the session cookie
    #[must_use]
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    fn session_cookie(&self, id: String) -> Cookie<'static> {
        let max_age = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        Cookie::build((self.cookie_name.clone(), id))
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .path("/")
            .max_age(time::Duration::seconds(max_age))
            .build()
    }

    fn removal_cookie(&self) -> Cookie<'static> {
        Cookie::build((self.cookie_name.clone(), ""))
            .path("/")
            .max_age(time::Duration::ZERO)
            .build()
    }
}

/// The current request's session, shared between middleware and handlers
#[derive(Debug, Clone, Default)]
pub struct SessionHandle {
    inner: Arc<Mutex<Session>>,
}

impl SessionHandle {
    /// Wrap a session
    #[must_use]
    pub fn new(session: Session) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
        }
    }

    /// Lock the session for reading or mutation
    pub async fn lock(&self) -> MutexGuard<'_, Session> {
        self.inner.lock().await
    }

    /// Copy of the current state
    pub async fn snapshot(&self) -> Session {
        self.inner.lock().await.clone()
    }
}

impl<S> FromRequestParts<S> for SessionHandle
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<SessionHandle>()
            .cloned()
            .ok_or((StatusCode::INTERNAL_SERVER_ERROR, "Session layer missing"))
    }
}

/// Fresh random session id
fn new_session_id() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Ids are only ever produced by [`new_session_id`]; anything else is ignored
fn is_valid_session_id(id: &str) -> bool {
    id.len() == SESSION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Session middleware.
///
/// Loads the session named by the cookie, exposes it as a [`SessionHandle`]
/// extension and, after the handler ran, saves it if it changed. A session
/// emptied by the handler is deleted and its cookie expired. Empty new
/// sessions are never stored.
pub async fn session_middleware(
    State(manager): State<Arc<SessionManager>>,
    jar: CookieJar,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let cookie_id = jar
        .get(&manager.cookie_name)
        .map(|c| c.value().to_string())
        .filter(|id| is_valid_session_id(id));

    let mut stored_id = None;
    let mut original = Session::default();
    if let Some(id) = cookie_id {
        match manager.store.load(&id).await {
            Ok(Some(session)) => {
                original = session;
                stored_id = Some(id);
            }
            Ok(None) => debug!("Session cookie names no live session"),
            Err(e) => warn!(error = %e, "Failed to load session"),
        }
    }

    let handle = SessionHandle::new(original.clone());
    request.extensions_mut().insert(handle.clone());

    let response = next.run(request).await;

    let current = handle.snapshot().await;
    if current == original {
        return response;
    }

    if current.is_empty() {
        if let Some(id) = stored_id {
            if let Err(e) = manager.store.delete(&id).await {
                warn!(error = %e, "Failed to delete session");
            }
        }
        return (jar.remove(manager.removal_cookie()), response).into_response();
    }

    let is_new = stored_id.is_none();
    let id = stored_id.unwrap_or_else(new_session_id);
    if let Err(e) = manager.store.save(&id, &current).await {
        error!(error = %e, "Failed to save session");
        return (StatusCode::INTERNAL_SERVER_ERROR, "Session could not be saved").into_response();
    }

    if is_new {
        (jar.add(manager.session_cookie(id)), response).into_response()
    } else {
        response
    }
}
