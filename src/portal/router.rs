//! HTTP router and handlers

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
};
use futures::FutureExt;
use serde_json::{Value, json};
use tower_http::{catch_panic::CatchPanicLayer, compression::CompressionLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use super::gate::{AccessGate, NOT_SIGNED_IN_PATH, gate_middleware};
use super::pages;
use crate::dashboards::{DashboardQuery, DashboardRegistry};
use crate::oauth::{AuthFlowController, CallbackParams};
use crate::session::{SessionHandle, SessionManager, session_middleware};

/// Shared application state
pub struct AppState {
    /// Sign-in flow controller
    pub flow: Arc<AuthFlowController>,
    /// Access gate for guarded routes
    pub gate: Arc<AccessGate>,
    /// Session loading and persistence
    pub sessions: Arc<SessionManager>,
    /// Mounted dashboards
    pub dashboards: Arc<DashboardRegistry>,
    /// Outbound HTTP client
    pub http_client: reqwest::Client,
    /// API called by `/graphcall`
    pub graph_endpoint: String,
    /// Externally visible base URL, if configured
    pub public_url: Option<String>,
}

impl AppState {
    fn scopes(&self) -> &[String] {
        self.gate.scopes()
    }

    fn redirect_path(&self) -> &str {
        &self.flow.authority().config().redirect_path
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let base = state.dashboards.url_base().to_string();

    let guarded = Router::new()
        .route("/", get(index_handler))
        .route("/menu", get(menu_handler))
        .route("/graphcall", get(graphcall_handler))
        .route(&format!("{base}{{slug}}/"), get(dashboard_handler))
        .route(&format!("{base}{{slug}}/data"), get(dashboard_data_handler))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.gate),
            gate_middleware,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route(NOT_SIGNED_IN_PATH, get(not_signed_in_handler))
        .route("/access_denied", get(access_denied_handler))
        .route(state.redirect_path(), get(callback_handler))
        .route("/logout", get(logout_handler))
        .merge(guarded)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state.sessions),
            session_middleware,
        ))
        .layer(CatchPanicLayer::new())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Absolute URL of `path` as seen by the browser.
///
/// A configured public URL wins. Otherwise the scheme comes from
/// `X-Forwarded-Proto` (default `http`) and the host from
/// `X-Forwarded-Host`, then `Host`.
pub fn external_url(headers: &HeaderMap, public_url: Option<&str>, path: &str) -> String {
    if let Some(base) = public_url {
        return format!("{}{path}", base.trim_end_matches('/'));
    }

    let forwarded = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    let scheme = forwarded("x-forwarded-proto").unwrap_or("http");
    let host = forwarded("x-forwarded-host")
        .or_else(|| headers.get(header::HOST).and_then(|v| v.to_str().ok()))
        .unwrap_or("localhost");

    format!("{scheme}://{host}{path}")
}

/// GET /health
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET / - landing page for signed-in users
async fn index_handler(session: SessionHandle) -> Html<String> {
    let session = session.lock().await;
    let first_name = session.user.as_ref().map_or("", |u| u.first_name());
    Html(pages::index(first_name))
}

/// GET /menu
async fn menu_handler(State(state): State<Arc<AppState>>, session: SessionHandle) -> Html<String> {
    let name = session
        .snapshot()
        .await
        .user
        .map(|u| u.name)
        .unwrap_or_default();

    let dashboards: Vec<(String, String)> = state
        .dashboards
        .iter()
        .map(|d| (d.title().to_string(), state.dashboards.url_for(d.as_ref())))
        .collect();

    Html(pages::menu(&name, &dashboards))
}

/// GET /graphcall - call the configured API with the user's token
async fn graphcall_handler(
    State(state): State<Arc<AppState>>,
    session: SessionHandle,
) -> Response {
    let token = {
        let mut session = session.lock().await;
        state.flow.session_token(&mut session, state.scopes()).await
    };
    let Some(token) = token else {
        return Redirect::to(NOT_SIGNED_IN_PATH).into_response();
    };

    let result = async {
        state
            .http_client
            .get(&state.graph_endpoint)
            .header(header::AUTHORIZATION, token.authorization_header())
            .send()
            .await?
            .json::<Value>()
            .await
    }
    .await;

    match result {
        Ok(body) => Html(pages::display(&body)).into_response(),
        Err(e) => {
            warn!(endpoint = %state.graph_endpoint, error = %e, "Graph call failed");
            (
                StatusCode::BAD_GATEWAY,
                Html(pages::error("Graph call failed", &e.to_string())),
            )
                .into_response()
        }
    }
}

/// GET /not_signed_in - start a fresh flow and offer the sign-in link
async fn not_signed_in_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    session: SessionHandle,
) -> Response {
    let redirect_uri = external_url(
        &headers,
        state.public_url.as_deref(),
        state.redirect_path(),
    );

    let mut session = session.lock().await;
    match state
        .flow
        .start_session_flow(&mut session, state.scopes(), &redirect_uri)
    {
        Ok(auth_uri) => Html(pages::not_signed_in(&auth_uri)).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to start sign-in flow");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html(pages::error("Sign-in unavailable", &e.to_string())),
            )
                .into_response()
        }
    }
}

/// GET /access_denied
async fn access_denied_handler() -> Html<String> {
    Html(pages::access_denied())
}

/// GET {redirect_path} - provider callback
///
/// Any panic during the exchange is caught here and shown on the auth error
/// page.
async fn callback_handler(
    State(state): State<Arc<AppState>>,
    session: SessionHandle,
    Query(params): Query<CallbackParams>,
) -> Response {
    let outcome = AssertUnwindSafe(async {
        let mut session = session.lock().await;
        state.flow.complete_session_flow(&mut session, &params).await
    })
    .catch_unwind()
    .await;

    match outcome {
        Ok(Ok(claims)) => {
            info!(user = %claims.name, "Sign-in completed");
            Redirect::to("/").into_response()
        }
        Ok(Err(e)) => {
            warn!(error = %e.code(), "Sign-in failed");
            Html(pages::auth_error(e.code(), &e.description())).into_response()
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(panic = %message, "Sign-in callback panicked");
            Html(pages::auth_error("Exception", &message)).into_response()
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// GET /logout - clear the session and sign out at the provider
async fn logout_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    session: SessionHandle,
) -> Response {
    session.lock().await.clear();

    let home = external_url(&headers, state.public_url.as_deref(), "/");
    match state.flow.authority().logout_url(&home) {
        Ok(url) => Redirect::to(url.as_str()).into_response(),
        Err(e) => {
            error!(error = %e, "Invalid provider logout URL");
            Redirect::to("/").into_response()
        }
    }
}

/// GET {base}{slug}/
async fn dashboard_handler(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Query(query): Query<DashboardQuery>,
) -> Response {
    let Some(dashboard) = state.dashboards.get(&slug) else {
        return not_found(&slug);
    };

    match dashboard.render(&query).await {
        Ok(content) => Html(pages::dashboard(dashboard.title(), &content)).into_response(),
        Err(e) => {
            error!(dashboard = %slug, error = %e, "Dashboard failed to load its data");
            (
                StatusCode::BAD_GATEWAY,
                Html(pages::error("Data could not be loaded", &e.to_string())),
            )
                .into_response()
        }
    }
}

/// GET {base}{slug}/data
async fn dashboard_data_handler(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
    Query(query): Query<DashboardQuery>,
) -> Response {
    let Some(dashboard) = state.dashboards.get(&slug) else {
        return not_found(&slug);
    };

    match dashboard.figure(&query).await {
        Ok(figure) => Json(figure).into_response(),
        Err(e) => {
            error!(dashboard = %slug, error = %e, "Dashboard failed to load its data");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

fn not_found(slug: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Html(pages::error(
            "Dashboard not found",
            &format!("No dashboard named '{slug}'"),
        )),
    )
        .into_response()
}
