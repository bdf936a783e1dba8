//! Session flows against a wiremock auth backend.
//!
//! Drives `SessionManager` through `HttpAuthApi` so the bearer token, the
//! lockout counter and the two-factor gate are exercised end to end.

use aegis_core::{Clock, ManualClock, RetryPolicy};
use aegis_http::{ApiClient, HttpConfig, Method, RequestOptions};
use aegis_session::{
    Credentials, HttpAuthApi, LoginOutcome, SessionConfig, SessionError, SessionManager,
    SessionStatus, TokenCell,
};
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Harness {
    manager: SessionManager,
    client: ApiClient,
    clock: Arc<ManualClock>,
}

fn harness(base_url: String) -> Harness {
    let token = Arc::new(TokenCell::new());
    let policy = Arc::new(RetryPolicy {
        max_attempts: 1,
        base_delay_ms: 1,
        max_delay_ms: 5,
        jitter: false,
    });
    let config = HttpConfig {
        base_url,
        timeout_ms: 2_000,
    };
    let client = ApiClient::new(&config, policy, token.clone()).unwrap();
    let clock = Arc::new(ManualClock::default());
    let manager = SessionManager::new(
        SessionConfig::default(),
        Arc::new(HttpAuthApi::new(client.clone())),
        token,
        clock.clone(),
    );
    Harness {
        manager,
        client,
        clock,
    }
}

fn rejection() -> ResponseTemplate {
    ResponseTemplate::new(401).set_body_json(json!({
        "error": { "message": "Invalid username or password", "code": "BAD_CREDENTIALS" }
    }))
}

#[tokio::test]
async fn test_login_attaches_token_and_logout_revokes_it() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .and(body_json(json!({ "username": "analyst", "password": "s3cret" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": {
                "token": "tok-abc",
                "expires_in": 600,
                "user": { "id": "u-7", "username": "analyst", "roles": ["soc"] }
            }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/alerts"))
        .and(header("authorization", "Bearer tok-abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": [] })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/logout"))
        .and(header("authorization", "Bearer tok-abc"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(server.uri());
    let outcome = h
        .manager
        .login(Credentials::new("analyst", "s3cret"))
        .await
        .unwrap();
    assert_eq!(outcome, LoginOutcome::Authenticated);
    assert_eq!(h.manager.user().unwrap().id, "u-7");
    assert_eq!(
        h.manager.snapshot().session_expiry_at,
        Some(h.clock.now_ms() + 600_000)
    );

    let response = h
        .client
        .request(Method::GET, "/alerts", None, RequestOptions::default())
        .await
        .unwrap();
    assert_eq!(response.status, 200);

    h.manager.logout().await;
    assert_eq!(h.manager.status(), SessionStatus::Anonymous);
    assert!(!h.manager.token().is_set());
}

#[tokio::test]
async fn test_sixth_attempt_is_refused_locally() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(rejection())
        .expect(5)
        .mount(&server)
        .await;

    let h = harness(server.uri());
    for attempt in 1..=4u32 {
        match h.manager.login(Credentials::new("analyst", "nope")).await {
            Err(SessionError::InvalidCredentials {
                attempts_remaining, ..
            }) => assert_eq!(attempts_remaining, 5 - attempt),
            other => panic!("attempt {attempt}: unexpected {other:?}"),
        }
    }
    assert!(matches!(
        h.manager.login(Credentials::new("analyst", "nope")).await,
        Err(SessionError::Locked { .. })
    ));

    let err = h
        .manager
        .login(Credentials::new("analyst", "right"))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Account locked. Try again in 15 minutes.");
    assert_eq!(h.manager.status(), SessionStatus::Locked);
}

#[tokio::test]
async fn test_two_factor_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "requires_two_factor": true, "challenge_id": "ch-42" }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/2fa/verify"))
        .and(body_json(json!({ "challenge_id": "ch-42", "code": "654321" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "access_token": "tok-2fa", "expires_in": 60 }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(server.uri());
    assert_eq!(
        h.manager
            .login(Credentials::new("analyst", "s3cret"))
            .await
            .unwrap(),
        LoginOutcome::TwoFactorRequired
    );
    assert!(!h.manager.token().is_set());

    assert_eq!(
        h.manager.verify_two_factor("654321").await.unwrap(),
        LoginOutcome::Authenticated
    );
    assert!(h.manager.is_authenticated());
}

#[tokio::test]
async fn test_unreachable_backend_does_not_count_toward_lockout() {
    // Nothing listens on port 9 on loopback.
    let h = harness("http://127.0.0.1:9".to_string());

    let err = h
        .manager
        .login(Credentials::new("analyst", "s3cret"))
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::NetworkUnavailable(_)));
    assert_eq!(h.manager.snapshot().failed_attempt_count, 0);
    assert_eq!(h.manager.status(), SessionStatus::Anonymous);
}

#[tokio::test]
async fn test_refresh_rejected_expires_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": { "token": "tok-1", "expires_in": 600 }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .and(header("authorization", "Bearer tok-1"))
        .respond_with(rejection())
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(server.uri());
    h.manager
        .login(Credentials::new("analyst", "s3cret"))
        .await
        .unwrap();

    assert!(matches!(h.manager.refresh().await, Err(SessionError::Expired)));
    assert_eq!(h.manager.status(), SessionStatus::Expired);
    assert!(!h.manager.token().is_set());
}
