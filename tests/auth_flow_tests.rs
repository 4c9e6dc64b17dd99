//! Sign-in flow against a mock identity provider
//!
//! Covers:
//! - Code redemption with PKCE and session population
//! - Provider rejections and nonce binding
//! - Silent refresh with refresh-token rotation
//! - Token cache persistence through the session

mod common;

use std::sync::atomic::Ordering;

use common::{GOOD_CODE, IdpServer, scopes};
use dash_portal::oauth::{AuthError, CallbackParams, TokenCache};
use dash_portal::session::{AuthState, Session};

fn callback(state: &str, code: &str) -> CallbackParams {
    CallbackParams {
        code: Some(code.to_string()),
        state: Some(state.to_string()),
        ..CallbackParams::default()
    }
}

/// Start a flow in `session` and point the provider at its nonce
fn start(server: &IdpServer, session: &mut Session) -> String {
    server
        .controller()
        .start_session_flow(session, &scopes(), "http://portal.test/getAToken")
        .unwrap();
    let flow = session.flow.as_ref().unwrap();
    server.idp.set_nonce(&flow.nonce);
    flow.state.clone()
}

async fn signed_in_session(server: &IdpServer) -> Session {
    let mut session = Session::default();
    let state = start(server, &mut session);
    server
        .controller()
        .complete_session_flow(&mut session, &callback(&state, GOOD_CODE))
        .await
        .unwrap();
    session
}

/// Make the cached access token look expired
fn expire_access_token(session: &mut Session) {
    let mut cache = TokenCache::load(session);
    let mut account = cache.first_account().unwrap().clone();
    account.access_token.expires_at = Some(1);
    cache.upsert(account);
    cache.save(session);
}

#[tokio::test]
async fn test_full_sign_in_populates_session() {
    let server = IdpServer::start().await;
    let mut session = Session::default();
    let state = start(&server, &mut session);
    let verifier = session.flow.as_ref().unwrap().code_verifier.clone();
    assert_eq!(session.auth_state(), AuthState::FlowStarted);

    let claims = server
        .controller()
        .complete_session_flow(&mut session, &callback(&state, GOOD_CODE))
        .await
        .unwrap();

    assert_eq!(claims.name, "Ada Lovelace");
    assert_eq!(session.user.as_ref(), Some(&claims));
    assert!(session.flow.is_none(), "flow must be single use");
    assert_eq!(session.auth_state(), AuthState::Authenticated);

    let cache = TokenCache::load(&session);
    let account = cache.first_account().unwrap();
    assert_eq!(account.access_token.secret, "at-1");
    assert_eq!(account.refresh_token.as_deref(), Some("rt-1"));

    let requests = server.idp.token_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["grant_type"], "authorization_code");
    assert_eq!(requests[0]["code_verifier"], verifier);
    assert_eq!(requests[0]["redirect_uri"], "http://portal.test/getAToken");
}

#[tokio::test]
async fn test_provider_rejection_is_surfaced_and_flow_consumed() {
    let server = IdpServer::start().await;
    let mut session = Session::default();
    let state = start(&server, &mut session);

    let err = server
        .controller()
        .complete_session_flow(&mut session, &callback(&state, "stale-code"))
        .await
        .unwrap_err();

    match err {
        AuthError::Provider { error, description } => {
            assert_eq!(error, "invalid_grant");
            assert!(description.starts_with("AADSTS70008"));
        }
        other => panic!("expected provider error, got {other:?}"),
    }
    assert!(session.user.is_none());
    assert!(session.token_cache.is_none());
    assert!(session.flow.is_none());
    assert_eq!(session.auth_state(), AuthState::Anonymous);
}

#[tokio::test]
async fn test_replayed_callback_fails_closed() {
    let server = IdpServer::start().await;
    let mut session = Session::default();
    let state = start(&server, &mut session);
    let controller = server.controller();

    controller
        .complete_session_flow(&mut session, &callback(&state, GOOD_CODE))
        .await
        .unwrap();
    let err = controller
        .complete_session_flow(&mut session, &callback(&state, GOOD_CODE))
        .await
        .unwrap_err();

    assert_eq!(err, AuthError::MissingFlow);
    assert_eq!(server.idp.token_requests().len(), 1);
}

#[tokio::test]
async fn test_nonce_mismatch_fails_closed() {
    let server = IdpServer::start().await;
    let mut session = Session::default();
    let state = start(&server, &mut session);
    server.idp.set_nonce("someone-elses-nonce");

    let err = server
        .controller()
        .complete_session_flow(&mut session, &callback(&state, GOOD_CODE))
        .await
        .unwrap_err();

    assert_eq!(err, AuthError::NonceMismatch);
    assert!(session.user.is_none());
}

#[tokio::test]
async fn test_expired_id_token_fails_closed() {
    let server = IdpServer::start().await;
    server.idp.expired_id_token.store(true, Ordering::SeqCst);
    let mut session = Session::default();
    let state = start(&server, &mut session);

    let err = server
        .controller()
        .complete_session_flow(&mut session, &callback(&state, GOOD_CODE))
        .await
        .unwrap_err();

    assert!(matches!(err, AuthError::InvalidIdToken(_)));
    assert!(session.user.is_none());
    assert!(session.token_cache.is_none());
}

#[tokio::test]
async fn test_qualified_scope_grant_is_served_from_cache() {
    let server = IdpServer::start().await;
    server.idp.qualified_scopes.store(true, Ordering::SeqCst);
    let mut session = signed_in_session(&server).await;

    for _ in 0..2 {
        let token = server
            .controller()
            .session_token(&mut session, &scopes())
            .await
            .unwrap();
        assert_eq!(token.secret, "at-1");
    }

    // Only the code redemption; no refresh grants
    assert_eq!(server.idp.token_requests().len(), 1);
}

#[tokio::test]
async fn test_cached_token_is_served_without_network() {
    let server = IdpServer::start().await;
    let mut session = signed_in_session(&server).await;
    let before = session.clone();

    let token = server
        .controller()
        .session_token(&mut session, &scopes())
        .await
        .unwrap();

    assert_eq!(token.secret, "at-1");
    assert_eq!(server.idp.token_requests().len(), 1);
    assert_eq!(session, before, "unchanged cache must not be rewritten");
}

#[tokio::test]
async fn test_silent_refresh_rotates_refresh_token() {
    let server = IdpServer::start().await;
    let mut session = signed_in_session(&server).await;
    expire_access_token(&mut session);

    let token = server
        .controller()
        .session_token(&mut session, &scopes())
        .await
        .unwrap();
    assert_eq!(token.secret, "at-2");

    let requests = server.idp.token_requests();
    assert_eq!(requests.last().unwrap()["grant_type"], "refresh_token");
    assert_eq!(requests.last().unwrap()["refresh_token"], "rt-1");

    let cache = TokenCache::load(&session);
    let account = cache.first_account().unwrap();
    assert_eq!(account.refresh_token.as_deref(), Some("rt-2"));
    // The refresh carried no id token; the sign-in claims are kept
    assert_eq!(account.id_token_claims.name, "Ada Lovelace");
}

#[tokio::test]
async fn test_failed_refresh_returns_none() {
    let server = IdpServer::start().await;
    let mut session = signed_in_session(&server).await;
    expire_access_token(&mut session);
    server.idp.reject_refresh.store(true, Ordering::SeqCst);

    let token = server
        .controller()
        .session_token(&mut session, &scopes())
        .await;

    assert!(token.is_none());
}

#[tokio::test]
async fn test_no_account_means_no_silent_token() {
    let server = IdpServer::start().await;
    let mut session = Session::default();

    let token = server
        .controller()
        .session_token(&mut session, &scopes())
        .await;

    assert!(token.is_none());
    assert!(session.is_empty());
    assert!(server.idp.token_requests().is_empty());
}

#[tokio::test]
async fn test_token_cache_survives_session_round_trip() {
    let server = IdpServer::start().await;
    let session = signed_in_session(&server).await;

    let stored = serde_json::to_string(&session).unwrap();
    let restored: Session = serde_json::from_str(&stored).unwrap();

    let original = TokenCache::load(&session);
    let reloaded = TokenCache::load(&restored);
    assert_eq!(original.len(), reloaded.len());
    assert_eq!(original.first_account(), reloaded.first_account());
    assert!(!reloaded.has_state_changed());
}
