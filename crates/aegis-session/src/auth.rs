//! Authentication backend.
//!
//! `AuthApi` abstracts the backend's auth endpoints so the state machine can
//! be driven by the real HTTP client or by a scripted mock.

use aegis_core::BoxFuture;
use aegis_http::{ApiClient, ApiError, HttpResult, Method, RequestOptions};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

use crate::state::UserProfile;

/// Username and password. The password is zeroized on drop.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    password: Zeroizing<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Zeroizing::new(password.into()),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Payload of a successful login, verification or refresh call.
#[derive(Clone, Default, Deserialize)]
pub struct AuthGrant {
    #[serde(default, alias = "access_token")]
    pub token: Option<String>,
    /// Absolute expiry in epoch ms. Takes precedence over `expires_in`.
    #[serde(default)]
    pub expires_at: Option<i64>,
    /// Lifetime in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub user: Option<UserProfile>,
    #[serde(default)]
    pub requires_two_factor: bool,
    #[serde(default)]
    pub challenge_id: Option<String>,
}

impl AuthGrant {
    /// Grant carrying a token valid for `expires_in`.
    pub fn with_token(token: impl Into<String>, expires_in: Duration) -> Self {
        Self {
            token: Some(token.into()),
            expires_in: Some(expires_in.as_secs()),
            ..Default::default()
        }
    }

    /// Grant asking for a second factor.
    pub fn two_factor(challenge_id: impl Into<String>) -> Self {
        Self {
            requires_two_factor: true,
            challenge_id: Some(challenge_id.into()),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user: UserProfile) -> Self {
        self.user = Some(user);
        self
    }

    /// Session expiry for this grant, falling back to `now + default_ttl_ms`.
    pub fn expiry_at(&self, now_ms: i64, default_ttl_ms: u64) -> i64 {
        if let Some(at) = self.expires_at {
            return at;
        }
        let ttl_ms = match self.expires_in {
            Some(secs) => secs.saturating_mul(1000),
            None => default_ttl_ms,
        };
        now_ms.saturating_add(i64::try_from(ttl_ms).unwrap_or(i64::MAX))
    }
}

impl std::fmt::Debug for AuthGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGrant")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .field("expires_in", &self.expires_in)
            .field("user", &self.user)
            .field("requires_two_factor", &self.requires_two_factor)
            .field("challenge_id", &self.challenge_id)
            .finish()
    }
}

/// Backend auth operations.
pub trait AuthApi: Send + Sync {
    fn login(&self, credentials: &Credentials) -> BoxFuture<'_, HttpResult<AuthGrant>>;

    fn verify_two_factor(&self, challenge_id: &str, code: &str)
        -> BoxFuture<'_, HttpResult<AuthGrant>>;

    /// Extend the current session. Authenticated with the current token.
    fn refresh(&self) -> BoxFuture<'_, HttpResult<AuthGrant>>;

    /// Invalidate `token` server-side.
    fn logout(&self, token: Zeroizing<String>) -> BoxFuture<'_, HttpResult<()>>;
}

/// `AuthApi` over the HTTP request client.
#[derive(Debug, Clone)]
pub struct HttpAuthApi {
    client: ApiClient,
}

impl HttpAuthApi {
    pub const LOGIN_PATH: &'static str = "/auth/login";
    pub const VERIFY_PATH: &'static str = "/auth/2fa/verify";
    pub const REFRESH_PATH: &'static str = "/auth/refresh";
    pub const LOGOUT_PATH: &'static str = "/auth/logout";

    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

impl AuthApi for HttpAuthApi {
    fn login(&self, credentials: &Credentials) -> BoxFuture<'_, HttpResult<AuthGrant>> {
        let body = json!({
            "username": credentials.username,
            "password": credentials.password(),
        });
        Box::pin(async move {
            self.client
                .post_json(Self::LOGIN_PATH, &body, RequestOptions::default().anonymous())
                .await
        })
    }

    fn verify_two_factor(
        &self,
        challenge_id: &str,
        code: &str,
    ) -> BoxFuture<'_, HttpResult<AuthGrant>> {
        let body = json!({
            "challenge_id": challenge_id,
            "code": code,
        });
        Box::pin(async move {
            // A code is single-use; never replay it.
            self.client
                .post_json(
                    Self::VERIFY_PATH,
                    &body,
                    RequestOptions::default().anonymous().without_retry(),
                )
                .await
        })
    }

    fn refresh(&self) -> BoxFuture<'_, HttpResult<AuthGrant>> {
        Box::pin(async move {
            self.client
                .post_json(Self::REFRESH_PATH, &json!({}), RequestOptions::default())
                .await
        })
    }

    fn logout(&self, token: Zeroizing<String>) -> BoxFuture<'_, HttpResult<()>> {
        Box::pin(async move {
            self.client
                .request(
                    Method::POST,
                    Self::LOGOUT_PATH,
                    None,
                    RequestOptions::default().without_retry().with_bearer(token),
                )
                .await
                .map(|_| ())
        })
    }
}

/// Recorded call on [`MockAuthApi`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthCall {
    Login { username: String },
    VerifyTwoFactor { challenge_id: String, code: String },
    Refresh,
    Logout,
}

/// Scripted auth backend for testing.
///
/// Each operation pops the next queued result; an empty queue yields a
/// `ClientError(401)` for login/verify/refresh and success for logout.
#[derive(Debug, Default)]
pub struct MockAuthApi {
    calls: Mutex<Vec<AuthCall>>,
    login_results: Mutex<VecDeque<HttpResult<AuthGrant>>>,
    verify_results: Mutex<VecDeque<HttpResult<AuthGrant>>>,
    refresh_results: Mutex<VecDeque<HttpResult<AuthGrant>>>,
    logout_results: Mutex<VecDeque<HttpResult<()>>>,
    delay: Mutex<Option<Duration>>,
}

impl MockAuthApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_login(&self, result: HttpResult<AuthGrant>) {
        self.login_results.lock().push_back(result);
    }

    pub fn push_verify(&self, result: HttpResult<AuthGrant>) {
        self.verify_results.lock().push_back(result);
    }

    pub fn push_refresh(&self, result: HttpResult<AuthGrant>) {
        self.refresh_results.lock().push_back(result);
    }

    pub fn push_logout(&self, result: HttpResult<()>) {
        self.logout_results.lock().push_back(result);
    }

    /// Delay every response by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Get recorded calls.
    pub fn calls(&self) -> Vec<AuthCall> {
        self.calls.lock().clone()
    }

    pub fn login_calls(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, AuthCall::Login { .. }))
            .count()
    }

    /// Credential rejection as returned by the backend.
    pub fn rejected() -> ApiError {
        ApiError {
            message: "Invalid username or password".to_string(),
            ..ApiError::from_status(401)
        }
    }

    async fn respond<T>(&self, queue: &Mutex<VecDeque<HttpResult<T>>>, fallback: HttpResult<T>) -> HttpResult<T> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let next = queue.lock().pop_front();
        next.unwrap_or(fallback)
    }
}

impl AuthApi for MockAuthApi {
    fn login(&self, credentials: &Credentials) -> BoxFuture<'_, HttpResult<AuthGrant>> {
        self.calls.lock().push(AuthCall::Login {
            username: credentials.username.clone(),
        });
        Box::pin(async move { self.respond(&self.login_results, Err(Self::rejected())).await })
    }

    fn verify_two_factor(
        &self,
        challenge_id: &str,
        code: &str,
    ) -> BoxFuture<'_, HttpResult<AuthGrant>> {
        self.calls.lock().push(AuthCall::VerifyTwoFactor {
            challenge_id: challenge_id.to_string(),
            code: code.to_string(),
        });
        Box::pin(async move { self.respond(&self.verify_results, Err(Self::rejected())).await })
    }

    fn refresh(&self) -> BoxFuture<'_, HttpResult<AuthGrant>> {
        self.calls.lock().push(AuthCall::Refresh);
        Box::pin(async move { self.respond(&self.refresh_results, Err(Self::rejected())).await })
    }

    fn logout(&self, _token: Zeroizing<String>) -> BoxFuture<'_, HttpResult<()>> {
        self.calls.lock().push(AuthCall::Logout);
        Box::pin(async move { self.respond(&self.logout_results, Ok(())).await })
    }
}
