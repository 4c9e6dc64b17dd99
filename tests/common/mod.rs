//! Mock identity provider shared by the sign-in tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::{
    Form, Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use jsonwebtoken::{EncodingKey, Header};
use parking_lot::Mutex;
use serde_json::{Value, json};

use dash_portal::oauth::{AuthFlowController, AuthorityClient, AuthorityConfig};

pub const CLIENT_ID: &str = "client-123";
pub const CLIENT_SECRET: &str = "s3cret";
pub const GOOD_CODE: &str = "good-code";
pub const SCOPE: &str = "User.ReadBasic.All";

/// Token endpoint double. Codes are accepted only when equal to
/// [`GOOD_CODE`]; refresh tokens only when equal to the last one issued.
pub struct MockIdp {
    pub nonce: Mutex<String>,
    pub roles: Mutex<Option<Vec<String>>>,
    pub requests: Mutex<Vec<HashMap<String, String>>>,
    pub refresh_token: Mutex<String>,
    pub reject_refresh: AtomicBool,
    /// Issue id tokens whose `exp` lies in the past
    pub expired_id_token: AtomicBool,
    /// Report granted scopes resource-qualified, as Entra does
    pub qualified_scopes: AtomicBool,
    pub issued: Mutex<u32>,
}

impl MockIdp {
    fn new() -> Self {
        Self {
            nonce: Mutex::new(String::new()),
            roles: Mutex::new(Some(vec!["Reader".to_string()])),
            requests: Mutex::new(Vec::new()),
            refresh_token: Mutex::new(String::new()),
            reject_refresh: AtomicBool::new(false),
            expired_id_token: AtomicBool::new(false),
            qualified_scopes: AtomicBool::new(false),
            issued: Mutex::new(0),
        }
    }

    pub fn set_nonce(&self, nonce: &str) {
        *self.nonce.lock() = nonce.to_string();
    }

    pub fn set_roles(&self, roles: Option<&[&str]>) {
        *self.roles.lock() = roles.map(|r| r.iter().map(|s| (*s).to_string()).collect());
    }

    pub fn token_requests(&self) -> Vec<HashMap<String, String>> {
        self.requests.lock().clone()
    }

    fn id_token(&self) -> String {
        let mut claims = json!({
            "name": "Ada Lovelace",
            "preferred_username": "ada@example.com",
            "oid": "oid-1",
            "tid": "tenant",
            "aud": CLIENT_ID,
            "nonce": *self.nonce.lock(),
            "exp": if self.expired_id_token.load(Ordering::SeqCst) {
                1_u64
            } else {
                4_102_444_800_u64
            },
        });
        if let Some(roles) = self.roles.lock().clone() {
            claims["roles"] = json!(roles);
        }
        encode_jwt(&claims)
    }

    fn issue(&self, with_id_token: bool) -> Value {
        let mut issued = self.issued.lock();
        *issued += 1;
        let refresh_token = format!("rt-{issued}");
        *self.refresh_token.lock() = refresh_token.clone();
        let granted = if self.qualified_scopes.load(Ordering::SeqCst) {
            format!("https://graph.microsoft.com/{SCOPE} openid profile offline_access")
        } else {
            format!("{SCOPE} openid profile offline_access")
        };

        let mut body = json!({
            "token_type": "Bearer",
            "access_token": format!("at-{issued}"),
            "refresh_token": refresh_token,
            "expires_in": 3600,
            "scope": granted,
        });
        if with_id_token {
            body["id_token"] = json!(self.id_token());
        }
        body
    }
}

/// HS256 compact JWT around `claims`, signed with the provider's own key
pub fn encode_jwt(claims: &Value) -> String {
    jsonwebtoken::encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(b"mock-idp-signing-key"),
    )
    .unwrap()
}

fn invalid_grant(description: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "error": "invalid_grant",
            "error_description": description,
        })),
    )
        .into_response()
}

async fn token_handler(
    State(idp): State<Arc<MockIdp>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    idp.requests.lock().push(form.clone());

    if form.get("client_id").map(String::as_str) != Some(CLIENT_ID)
        || form.get("client_secret").map(String::as_str) != Some(CLIENT_SECRET)
    {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid_client", "error_description": "bad credentials"})),
        )
            .into_response();
    }

    match form.get("grant_type").map(String::as_str) {
        Some("authorization_code") => {
            if form.get("code").map(String::as_str) != Some(GOOD_CODE) {
                return invalid_grant("AADSTS70008: The provided authorization code has expired.");
            }
            if form.get("code_verifier").is_none_or(String::is_empty) {
                return invalid_grant("PKCE verifier missing");
            }
            Json(idp.issue(true)).into_response()
        }
        Some("refresh_token") => {
            let current = idp.refresh_token.lock().clone();
            if idp.reject_refresh.load(Ordering::SeqCst)
                || form.get("refresh_token") != Some(&current)
            {
                return invalid_grant("AADSTS700082: The refresh token has expired.");
            }
            Json(idp.issue(false)).into_response()
        }
        _ => invalid_grant("unsupported grant"),
    }
}

/// Running mock provider
pub struct IdpServer {
    pub addr: SocketAddr,
    pub idp: Arc<MockIdp>,
}

impl IdpServer {
    pub async fn start() -> Self {
        let idp = Arc::new(MockIdp::new());
        let app = Router::new()
            .route("/tenant/oauth2/v2.0/token", post(token_handler))
            .with_state(Arc::clone(&idp));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, idp }
    }

    pub fn authority(&self) -> String {
        format!("http://{}/tenant", self.addr)
    }

    pub fn controller(&self) -> AuthFlowController {
        AuthFlowController::new(
            AuthorityClient::new(
                reqwest::Client::new(),
                AuthorityConfig {
                    client_id: CLIENT_ID.to_string(),
                    authority: self.authority(),
                    client_secret: CLIENT_SECRET.to_string(),
                    redirect_path: "/getAToken".to_string(),
                },
            ),
            Duration::from_secs(600),
        )
    }
}

pub fn scopes() -> Vec<String> {
    vec![SCOPE.to_string()]
}
