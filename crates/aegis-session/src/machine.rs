//! Session state machine.
//!
//! States: anonymous, authenticating, authenticated, locked, expired.
//! Every transition happens under one lock, and every reset bumps an epoch so
//! a backend response that arrives after logout or expiry is discarded
//! instead of resurrecting the session.

use crate::auth::{AuthApi, AuthGrant, Credentials};
use crate::config::SessionConfig;
use crate::error::{lockout_minutes, SessionError, SessionResult};
use crate::state::{BlockedReason, Session, SessionStatus, UserProfile};
use crate::token::TokenCell;
use aegis_core::{Clock, FailureKind};
use aegis_http::{ApiError, HttpResult};
use aegis_telemetry::Metrics;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Closes the channels opened under a session.
///
/// Called synchronously on logout, forced expiry and dispose, after the
/// session lock has been released.
#[cfg_attr(test, mockall::automock)]
pub trait ChannelTeardown: Send + Sync {
    fn teardown_all(&self, reason: &str);
}

/// Result of a successful `login` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    Authenticated,
    /// Credentials accepted; call `verify_two_factor` to finish.
    TwoFactorRequired,
}

struct Inner {
    session: Session,
    epoch: u64,
    challenge_id: Option<String>,
    /// Last auth call failed for lack of connectivity.
    network_unavailable: bool,
}

/// Session state machine.
pub struct SessionManager {
    config: SessionConfig,
    auth: Arc<dyn AuthApi>,
    token: Arc<TokenCell>,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    status_tx: watch::Sender<SessionStatus>,
    teardown: Option<Arc<dyn ChannelTeardown>>,
    metrics: Option<Arc<Metrics>>,
    monitor: Mutex<Option<CancellationToken>>,
}

impl SessionManager {
    /// Create an anonymous session.
    ///
    /// # Arguments
    /// * `config` - Lockout and expiry settings
    /// * `auth` - Backend auth operations
    /// * `token` - Bearer token cell shared with the HTTP client
    /// * `clock` - Wall clock for lockout and expiry
    pub fn new(
        config: SessionConfig,
        auth: Arc<dyn AuthApi>,
        token: Arc<TokenCell>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::Anonymous);
        Self {
            config,
            auth,
            token,
            clock,
            inner: Mutex::new(Inner {
                session: Session::anonymous(),
                epoch: 0,
                challenge_id: None,
                network_unavailable: false,
            }),
            status_tx,
            teardown: None,
            metrics: None,
            monitor: Mutex::new(None),
        }
    }

    pub fn with_teardown(mut self, teardown: Arc<dyn ChannelTeardown>) -> Self {
        self.teardown = Some(teardown);
        self
    }

    /// Attach a metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn token(&self) -> &Arc<TokenCell> {
        &self.token
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn status(&self) -> SessionStatus {
        self.inner.lock().session.status
    }

    pub fn snapshot(&self) -> Session {
        self.inner.lock().session.clone()
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.inner.lock().session.user.clone()
    }

    /// True only while authenticated with an unexpired session.
    pub fn is_authenticated(&self) -> bool {
        let now = self.clock.now_ms();
        let inner = self.inner.lock();
        inner.session.status == SessionStatus::Authenticated
            && inner.session.session_expiry_at.is_some_and(|at| at > now)
    }

    /// Why authenticated actions are blocked, or `None` if they are not.
    pub fn blocked_reason(&self) -> Option<BlockedReason> {
        let now = self.clock.now_ms();
        let inner = self.inner.lock();
        match inner.session.status {
            SessionStatus::Authenticated => match inner.session.session_expiry_at {
                Some(at) if at > now => None,
                _ => Some(BlockedReason::Expired),
            },
            SessionStatus::Expired => Some(BlockedReason::Expired),
            SessionStatus::Locked => match inner.session.lockout_expiry_at {
                Some(until) if until > now => Some(BlockedReason::Locked {
                    remaining: Duration::from_millis(u64::try_from(until - now).unwrap_or(0)),
                }),
                _ => Some(BlockedReason::NotAuthenticated),
            },
            _ if inner.network_unavailable => Some(BlockedReason::NetworkUnavailable),
            _ => Some(BlockedReason::NotAuthenticated),
        }
    }

    /// Observe status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    /// Record a user interaction. Does not extend the session.
    pub fn record_activity(&self) {
        let now = self.clock.now_ms();
        self.inner.lock().session.last_activity_at = Some(now);
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Submit credentials.
    ///
    /// Rejected without contacting the backend while locked. An elapsed
    /// lockout or an expired session is cleared first.
    pub async fn login(&self, credentials: Credentials) -> SessionResult<LoginOutcome> {
        self.tick();
        let now = self.clock.now_ms();

        let epoch = {
            let mut inner = self.inner.lock();
            match inner.session.status {
                SessionStatus::Locked => {
                    let remaining = inner.session.lockout_expiry_at.unwrap_or(now) - now;
                    self.record_login("locked");
                    warn!(
                        username = %credentials.username,
                        remaining_ms = remaining,
                        "Login refused: account locked"
                    );
                    return Err(SessionError::Locked {
                        remaining_minutes: lockout_minutes(remaining),
                    });
                }
                SessionStatus::Authenticating => return Err(SessionError::LoginInProgress),
                SessionStatus::Authenticated => return Err(SessionError::AlreadyAuthenticated),
                SessionStatus::Anonymous | SessionStatus::Expired => {}
            }

            inner.session.user = None;
            inner.session.session_expiry_at = None;
            inner.session.last_activity_at = Some(now);
            inner.challenge_id = None;
            inner.network_unavailable = false;
            self.set_status(&mut inner, SessionStatus::Authenticating);
            inner.epoch
        };

        info!(username = %credentials.username, "Login attempt");
        let result = self.auth.login(&credentials).await;
        self.complete_authentication(epoch, result)
    }

    /// Complete a pending two-factor challenge.
    pub async fn verify_two_factor(&self, code: &str) -> SessionResult<LoginOutcome> {
        self.tick();

        let (epoch, challenge_id) = {
            let mut inner = self.inner.lock();
            if inner.session.status != SessionStatus::Authenticating {
                return Err(SessionError::TwoFactorNotPending);
            }
            match inner.challenge_id.take() {
                Some(challenge_id) => (inner.epoch, challenge_id),
                None => return Err(SessionError::TwoFactorNotPending),
            }
        };

        debug!(%challenge_id, "Verifying two-factor code");
        let result = self.auth.verify_two_factor(&challenge_id, code).await;
        self.complete_authentication(epoch, result)
    }

    /// End the session immediately.
    ///
    /// State, token and channels are torn down before the server-side
    /// logout is attempted; that call is best-effort. Ignored while locked.
    pub async fn logout(&self) {
        let token = {
            let mut inner = self.inner.lock();
            let previous = inner.session.status;
            if previous == SessionStatus::Locked {
                debug!("Logout ignored while locked");
                return;
            }

            inner.epoch += 1;
            let failed_attempt_count = inner.session.failed_attempt_count;
            inner.session = Session {
                failed_attempt_count,
                ..Session::anonymous()
            };
            inner.challenge_id = None;
            inner.network_unavailable = false;
            self.set_status(&mut inner, SessionStatus::Anonymous);
            info!(from = %previous, "Logged out");
            self.token.take()
        };

        self.teardown_channels("logout");

        if let Some(token) = token {
            if let Err(err) = self.auth.logout(token).await {
                warn!(kind = %err.kind, error = %err, "Server-side logout failed");
            }
        }
    }

    /// Extend the session from the server.
    ///
    /// A 401 means the server no longer honours the token: the session is
    /// expired and its channels torn down.
    pub async fn refresh(&self) -> SessionResult<()> {
        self.tick();

        let epoch = {
            let inner = self.inner.lock();
            match inner.session.status {
                SessionStatus::Authenticated => inner.epoch,
                SessionStatus::Expired => return Err(SessionError::Expired),
                _ => return Err(SessionError::NotAuthenticated),
            }
        };

        let result = self.auth.refresh().await;
        let now = self.clock.now_ms();

        {
            let mut inner = self.inner.lock();
            if inner.epoch != epoch || inner.session.status != SessionStatus::Authenticated {
                debug!(epoch, current_epoch = inner.epoch, "Discarding stale refresh response");
                return Err(SessionError::Superseded);
            }

            match result {
                Ok(mut grant) => {
                    let expiry = grant.expiry_at(now, self.config.default_ttl_ms);
                    if expiry <= now {
                        warn!(expiry, now, "Refresh grant already expired, keeping current session");
                        return Err(SessionError::Api(ApiError::malformed(
                            None,
                            format!("grant expired at {expiry} (now {now})"),
                        )));
                    }
                    if let Some(token) = grant.token.take() {
                        self.token.set(Zeroizing::new(token));
                    }
                    inner.session.session_expiry_at = Some(expiry);
                    if let Some(user) = grant.user.take() {
                        inner.session.user = Some(user);
                    }
                    inner.network_unavailable = false;
                    info!(expires_in_ms = expiry - now, "Session refreshed");
                    return Ok(());
                }
                Err(err) if err.kind == FailureKind::ClientError(401) => {
                    warn!("Refresh rejected, expiring session");
                    self.expire(&mut inner);
                }
                Err(err) if is_connectivity_failure(err.kind) => {
                    inner.network_unavailable = true;
                    warn!(kind = %err.kind, "Refresh failed: network unavailable");
                    return Err(SessionError::NetworkUnavailable(err.message));
                }
                Err(err) => {
                    warn!(kind = %err.kind, status = ?err.status, "Refresh failed");
                    return Err(SessionError::Api(err));
                }
            }
        }

        self.teardown_channels("session expired");
        Err(SessionError::Expired)
    }

    /// Apply timer-driven transitions: lockout elapsed, session expired.
    ///
    /// Returns the status afterwards.
    pub fn tick(&self) -> SessionStatus {
        let now = self.clock.now_ms();
        let (status, expired) = {
            let mut inner = self.inner.lock();
            let expired = self.apply_timers(&mut inner, now);
            (inner.session.status, expired)
        };
        if expired {
            self.teardown_channels("session expired");
        }
        status
    }

    /// Run `tick` every `expiry_check_interval` until `dispose`.
    ///
    /// Replaces any previously spawned monitor.
    pub fn spawn_expiry_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.monitor.lock().replace(cancel.clone()) {
            previous.cancel();
        }

        let weak = Arc::downgrade(self);
        let period = self.config.expiry_check_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = weak.upgrade() else { break };
                        manager.tick();
                    }
                }
            }
            debug!("Session expiry monitor stopped");
        })
    }

    /// Stop the expiry monitor and reset to a fresh anonymous session.
    pub fn dispose(&self) {
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.cancel();
        }

        {
            let mut inner = self.inner.lock();
            inner.epoch += 1;
            inner.session = Session::anonymous();
            inner.challenge_id = None;
            inner.network_unavailable = false;
            self.set_status(&mut inner, SessionStatus::Anonymous);
        }
        self.token.clear();
        self.teardown_channels("dispose");
        info!("Session disposed");
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn set_status(&self, inner: &mut Inner, status: SessionStatus) {
        let previous = inner.session.status;
        inner.session.status = status;
        if previous != status {
            debug!(from = %previous, to = %status, "Session status changed");
        }
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    /// Returns true if the session just expired and channels must be torn down.
    fn apply_timers(&self, inner: &mut Inner, now: i64) -> bool {
        match inner.session.status {
            SessionStatus::Locked => {
                if inner.session.lockout_expiry_at.map_or(true, |until| until <= now) {
                    inner.session.failed_attempt_count = 0;
                    inner.session.lockout_expiry_at = None;
                    self.set_status(inner, SessionStatus::Anonymous);
                    info!("Lockout elapsed");
                }
                false
            }
            SessionStatus::Authenticated => {
                if inner.session.session_expiry_at.map_or(true, |at| at <= now) {
                    self.expire(inner);
                    return true;
                }
                false
            }
            _ => false,
        }
    }

    fn expire(&self, inner: &mut Inner) {
        inner.epoch += 1;
        let expired_at = inner.session.session_expiry_at.take();
        inner.session.user = None;
        inner.challenge_id = None;
        self.token.clear();
        self.set_status(inner, SessionStatus::Expired);
        warn!(?expired_at, "Session expired");
    }

    fn complete_authentication(
        &self,
        epoch: u64,
        result: HttpResult<AuthGrant>,
    ) -> SessionResult<LoginOutcome> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();

        if inner.epoch != epoch || inner.session.status != SessionStatus::Authenticating {
            debug!(epoch, current_epoch = inner.epoch, "Discarding stale authentication response");
            return Err(SessionError::Superseded);
        }

        let mut grant = match result {
            Ok(grant) => grant,
            Err(err) => return self.fail_authentication(&mut inner, now, err),
        };

        if grant.requires_two_factor {
            let Some(challenge_id) = grant.challenge_id.take() else {
                let err = ApiError::malformed(None, "two-factor required without challenge_id");
                return self.fail_authentication(&mut inner, now, err);
            };
            inner.challenge_id = Some(challenge_id);
            self.record_login("two_factor");
            info!("Two-factor verification required");
            return Ok(LoginOutcome::TwoFactorRequired);
        }

        let Some(token) = grant.token.take() else {
            let err = ApiError::malformed(None, "grant carries no token");
            return self.fail_authentication(&mut inner, now, err);
        };

        let expiry = grant.expiry_at(now, self.config.default_ttl_ms);
        if expiry <= now {
            let err = ApiError::malformed(None, format!("grant expired at {expiry} (now {now})"));
            return self.fail_authentication(&mut inner, now, err);
        }
        self.token.set(Zeroizing::new(token));
        inner.session.user = grant.user.take();
        inner.session.session_expiry_at = Some(expiry);
        inner.session.failed_attempt_count = 0;
        inner.session.lockout_expiry_at = None;
        inner.session.last_activity_at = Some(now);
        inner.challenge_id = None;
        self.set_status(&mut inner, SessionStatus::Authenticated);
        self.record_login("success");
        info!(
            user = inner.session.user.as_ref().map(|u| u.username.as_str()),
            expires_in_ms = expiry - now,
            "Login succeeded"
        );
        Ok(LoginOutcome::Authenticated)
    }

    fn fail_authentication(
        &self,
        inner: &mut Inner,
        now: i64,
        err: ApiError,
    ) -> SessionResult<LoginOutcome> {
        inner.challenge_id = None;

        if err.kind.is_auth_rejection() {
            inner.session.failed_attempt_count += 1;
            let failed = inner.session.failed_attempt_count;
            let max = self.config.max_failed_attempts;

            if failed >= max {
                let lockout_ms = i64::try_from(self.config.lockout_duration_ms).unwrap_or(i64::MAX);
                inner.session.lockout_expiry_at = Some(now.saturating_add(lockout_ms));
                self.set_status(inner, SessionStatus::Locked);
                self.record_login("rejected");
                if let Some(metrics) = &self.metrics {
                    metrics.session_lockout();
                }
                warn!(failed_attempts = failed, lockout_ms, "Account locked after repeated failures");
                return Err(SessionError::Locked {
                    remaining_minutes: lockout_minutes(lockout_ms),
                });
            }

            self.set_status(inner, SessionStatus::Anonymous);
            self.record_login("rejected");
            warn!(failed_attempts = failed, max_failed_attempts = max, "Login rejected");
            return Err(SessionError::InvalidCredentials {
                message: err.message,
                attempts_remaining: max - failed,
            });
        }

        self.set_status(inner, SessionStatus::Anonymous);
        self.record_login("error");
        if is_connectivity_failure(err.kind) {
            inner.network_unavailable = true;
            warn!(kind = %err.kind, "Login failed: network unavailable");
            return Err(SessionError::NetworkUnavailable(err.message));
        }
        warn!(kind = %err.kind, status = ?err.status, "Login failed");
        Err(SessionError::Api(err))
    }

    fn teardown_channels(&self, reason: &str) {
        if let Some(teardown) = &self.teardown {
            teardown.teardown_all(reason);
        }
    }

    fn record_login(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.session_login(outcome);
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.get_mut().take() {
            monitor.cancel();
        }
    }
}

fn is_connectivity_failure(kind: FailureKind) -> bool {
    matches!(kind, FailureKind::Timeout | FailureKind::NetworkUnavailable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthCall, MockAuthApi};
    use aegis_core::ManualClock;
    use aegis_http::CredentialSource;

    const MINUTE: Duration = Duration::from_secs(60);

    fn setup() -> (SessionManager, Arc<MockAuthApi>, Arc<ManualClock>) {
        let auth = MockAuthApi::new();
        let clock = Arc::new(ManualClock::default());
        let manager = SessionManager::new(
            SessionConfig::default(),
            auth.clone(),
            Arc::new(TokenCell::new()),
            clock.clone(),
        );
        (manager, auth, clock)
    }

    fn creds(password: &str) -> Credentials {
        Credentials::new("analyst", password)
    }

    fn grant(token: &str, ttl: Duration) -> AuthGrant {
        AuthGrant::with_token(token, ttl).with_user(UserProfile {
            id: "u-1".to_string(),
            username: "analyst".to_string(),
            email: None,
            roles: vec!["soc".to_string()],
        })
    }

    #[tokio::test]
    async fn test_login_success() {
        let (manager, auth, clock) = setup();
        let mut status_rx = manager.subscribe_status();
        auth.push_login(Ok(grant("tok-1", 10 * MINUTE)));

        let outcome = manager.login(creds("right")).await.unwrap();

        assert_eq!(outcome, LoginOutcome::Authenticated);
        assert!(manager.is_authenticated());
        assert_eq!(manager.blocked_reason(), None);
        let session = manager.snapshot();
        assert_eq!(session.session_expiry_at, Some(clock.now_ms() + 600_000));
        assert_eq!(session.user.unwrap().username, "analyst");
        assert_eq!(manager.token().bearer_token().unwrap().as_str(), "tok-1");
        assert!(status_rx.has_changed().unwrap());
        assert_eq!(*status_rx.borrow_and_update(), SessionStatus::Authenticated);
    }

    #[tokio::test]
    async fn test_grant_without_expiry_uses_default_ttl() {
        let (manager, auth, clock) = setup();
        auth.push_login(Ok(AuthGrant {
            token: Some("tok".to_string()),
            ..Default::default()
        }));

        manager.login(creds("right")).await.unwrap();
        assert_eq!(
            manager.snapshot().session_expiry_at,
            Some(clock.now_ms() + 30 * 60_000)
        );
    }

    #[tokio::test]
    async fn test_grant_already_expired_is_rejected() {
        let (manager, auth, clock) = setup();
        clock.set(1_700_000_000_000);
        // Epoch seconds where epoch ms is expected.
        auth.push_login(Ok(AuthGrant {
            token: Some("tok".to_string()),
            expires_at: Some(1_700_000_600),
            ..Default::default()
        }));

        let err = manager.login(creds("right")).await.unwrap_err();

        assert!(
            matches!(err, SessionError::Api(ref e) if e.kind == FailureKind::MalformedResponse)
        );
        assert_eq!(manager.status(), SessionStatus::Anonymous);
        assert_eq!(manager.snapshot().session_expiry_at, None);
        assert_eq!(manager.snapshot().failed_attempt_count, 0);
        assert!(manager.token().bearer_token().is_none());
    }

    #[tokio::test]
    async fn test_rejection_counts_and_returns_to_anonymous() {
        let (manager, auth, _clock) = setup();

        let err = manager.login(creds("wrong")).await.unwrap_err();
        match err {
            SessionError::InvalidCredentials {
                attempts_remaining, ..
            } => assert_eq!(attempts_remaining, 4),
            other => panic!("expected InvalidCredentials, got {other:?}"),
        }
        assert_eq!(manager.status(), SessionStatus::Anonymous);
        assert_eq!(manager.snapshot().failed_attempt_count, 1);
        assert_eq!(auth.login_calls(), 1);
    }

    #[tokio::test]
    async fn test_lockout_after_five_failures_skips_network() {
        let (manager, auth, _clock) = setup();

        for _ in 0..4 {
            assert!(matches!(
                manager.login(creds("wrong")).await,
                Err(SessionError::InvalidCredentials { .. })
            ));
        }
        let fifth = manager.login(creds("wrong")).await.unwrap_err();
        assert!(matches!(fifth, SessionError::Locked { remaining_minutes: 15 }));
        assert_eq!(manager.status(), SessionStatus::Locked);

        let sixth = manager.login(creds("right")).await.unwrap_err();
        assert_eq!(sixth.to_string(), "Account locked. Try again in 15 minutes.");
        assert_eq!(auth.login_calls(), 5);
    }

    #[tokio::test]
    async fn test_login_after_lockout_elapses_authenticates_directly() {
        let (manager, auth, clock) = setup();
        for _ in 0..5 {
            let _ = manager.login(creds("wrong")).await;
        }
        assert_eq!(manager.status(), SessionStatus::Locked);

        clock.advance(10 * MINUTE);
        let err = manager.login(creds("right")).await.unwrap_err();
        assert_eq!(err.to_string(), "Account locked. Try again in 5 minutes.");

        clock.advance(5 * MINUTE);
        auth.push_login(Ok(grant("tok", 10 * MINUTE)));
        let outcome = manager.login(creds("right")).await.unwrap();

        assert_eq!(outcome, LoginOutcome::Authenticated);
        assert_eq!(manager.snapshot().failed_attempt_count, 0);
        assert_eq!(manager.snapshot().lockout_expiry_at, None);
        assert_eq!(auth.login_calls(), 6);
    }

    #[tokio::test]
    async fn test_tick_releases_elapsed_lockout() {
        let (manager, _auth, clock) = setup();
        for _ in 0..5 {
            let _ = manager.login(creds("wrong")).await;
        }
        assert!(matches!(
            manager.blocked_reason(),
            Some(BlockedReason::Locked { .. })
        ));

        clock.advance(15 * MINUTE);
        assert_eq!(manager.tick(), SessionStatus::Anonymous);
        assert_eq!(manager.snapshot().failed_attempt_count, 0);
    }

    #[tokio::test]
    async fn test_configurable_lockout() {
        let auth = MockAuthApi::new();
        let clock = Arc::new(ManualClock::default());
        let config = SessionConfig {
            max_failed_attempts: 2,
            lockout_duration_ms: 60_000,
            ..Default::default()
        };
        let manager =
            SessionManager::new(config, auth.clone(), Arc::new(TokenCell::new()), clock.clone());

        let _ = manager.login(creds("wrong")).await;
        let err = manager.login(creds("wrong")).await.unwrap_err();
        assert_eq!(err.to_string(), "Account locked. Try again in 1 minutes.");

        clock.advance(MINUTE);
        assert_eq!(manager.tick(), SessionStatus::Anonymous);
    }

    #[tokio::test]
    async fn test_network_failure_does_not_count() {
        let (manager, auth, _clock) = setup();
        auth.push_login(Err(ApiError::new(
            FailureKind::NetworkUnavailable,
            "connection refused",
        )));

        let err = manager.login(creds("right")).await.unwrap_err();
        assert!(matches!(err, SessionError::NetworkUnavailable(_)));
        assert_eq!(manager.status(), SessionStatus::Anonymous);
        assert_eq!(manager.snapshot().failed_attempt_count, 0);
        assert_eq!(
            manager.blocked_reason(),
            Some(BlockedReason::NetworkUnavailable)
        );
    }

    #[tokio::test]
    async fn test_server_error_does_not_count() {
        let (manager, auth, _clock) = setup();
        auth.push_login(Err(ApiError::from_status(503)));

        let err = manager.login(creds("right")).await.unwrap_err();
        assert!(matches!(err, SessionError::Api(ref e) if e.kind == FailureKind::ServerError(503)));
        assert_eq!(manager.snapshot().failed_attempt_count, 0);
        assert_eq!(
            manager.blocked_reason(),
            Some(BlockedReason::NotAuthenticated)
        );
    }

    #[tokio::test]
    async fn test_two_factor_gate() {
        let (manager, auth, _clock) = setup();
        auth.push_login(Ok(AuthGrant::two_factor("ch-9")));
        auth.push_verify(Ok(grant("tok-2fa", 10 * MINUTE)));

        let outcome = manager.login(creds("right")).await.unwrap();
        assert_eq!(outcome, LoginOutcome::TwoFactorRequired);
        assert_eq!(manager.status(), SessionStatus::Authenticating);
        assert!(!manager.is_authenticated());
        assert!(manager.token().bearer_token().is_none());

        let outcome = manager.verify_two_factor("123456").await.unwrap();
        assert_eq!(outcome, LoginOutcome::Authenticated);
        assert!(manager.is_authenticated());
        assert_eq!(
            auth.calls()[1],
            AuthCall::VerifyTwoFactor {
                challenge_id: "ch-9".to_string(),
                code: "123456".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_two_factor_rejection_counts_toward_lockout() {
        let (manager, auth, _clock) = setup();
        auth.push_login(Ok(AuthGrant::two_factor("ch-1")));

        manager.login(creds("right")).await.unwrap();
        let err = manager.verify_two_factor("000000").await.unwrap_err();

        assert!(matches!(err, SessionError::InvalidCredentials { .. }));
        assert_eq!(manager.status(), SessionStatus::Anonymous);
        assert_eq!(manager.snapshot().failed_attempt_count, 1);
    }

    #[tokio::test]
    async fn test_verify_without_challenge() {
        let (manager, _auth, _clock) = setup();
        assert!(matches!(
            manager.verify_two_factor("123456").await,
            Err(SessionError::TwoFactorNotPending)
        ));
    }

    #[tokio::test]
    async fn test_login_while_authenticated_or_in_progress() {
        let (manager, auth, _clock) = setup();
        auth.push_login(Ok(AuthGrant::two_factor("ch-1")));
        manager.login(creds("right")).await.unwrap();

        assert!(matches!(
            manager.login(creds("right")).await,
            Err(SessionError::LoginInProgress)
        ));

        auth.push_verify(Ok(grant("tok", 10 * MINUTE)));
        manager.verify_two_factor("123456").await.unwrap();
        assert!(matches!(
            manager.login(creds("right")).await,
            Err(SessionError::AlreadyAuthenticated)
        ));
        assert_eq!(auth.login_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_login_is_refused() {
        let (manager, auth, _clock) = setup();
        let manager = Arc::new(manager);
        auth.set_delay(Duration::from_millis(50));
        auth.push_login(Ok(grant("tok", 10 * MINUTE)));

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.login(creds("right")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(matches!(
            manager.login(creds("right")).await,
            Err(SessionError::LoginInProgress)
        ));
        assert_eq!(first.await.unwrap().unwrap(), LoginOutcome::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_during_login_discards_response() {
        let (manager, auth, _clock) = setup();
        let manager = Arc::new(manager);
        auth.set_delay(Duration::from_millis(50));
        auth.push_login(Ok(grant("late-token", 10 * MINUTE)));

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.login(creds("right")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.logout().await;

        assert!(matches!(
            pending.await.unwrap(),
            Err(SessionError::Superseded)
        ));
        assert_eq!(manager.status(), SessionStatus::Anonymous);
        assert!(manager.token().bearer_token().is_none());
    }

    #[tokio::test]
    async fn test_expiry_tears_down_channels() {
        let auth = MockAuthApi::new();
        let clock = Arc::new(ManualClock::default());
        let mut teardown = MockChannelTeardown::new();
        teardown
            .expect_teardown_all()
            .withf(|reason| reason == "session expired")
            .times(1)
            .return_const(());
        let manager = SessionManager::new(
            SessionConfig::default(),
            auth.clone(),
            Arc::new(TokenCell::new()),
            clock.clone(),
        )
        .with_teardown(Arc::new(teardown));

        auth.push_login(Ok(grant("tok", MINUTE)));
        manager.login(creds("right")).await.unwrap();

        clock.advance(Duration::from_secs(59));
        assert_eq!(manager.tick(), SessionStatus::Authenticated);

        clock.advance(Duration::from_secs(1));
        assert!(!manager.is_authenticated());
        assert_eq!(manager.tick(), SessionStatus::Expired);
        assert_eq!(manager.user(), None);
        assert_eq!(manager.snapshot().session_expiry_at, None);
        assert!(manager.token().bearer_token().is_none());
        assert_eq!(manager.blocked_reason(), Some(BlockedReason::Expired));

        // A second tick does not tear down again.
        assert_eq!(manager.tick(), SessionStatus::Expired);
    }

    #[tokio::test]
    async fn test_login_after_expiry() {
        let (manager, auth, clock) = setup();
        auth.push_login(Ok(grant("tok-1", MINUTE)));
        manager.login(creds("right")).await.unwrap();
        clock.advance(2 * MINUTE);
        manager.tick();

        auth.push_login(Ok(grant("tok-2", MINUTE)));
        assert_eq!(
            manager.login(creds("right")).await.unwrap(),
            LoginOutcome::Authenticated
        );
        assert_eq!(manager.token().bearer_token().unwrap().as_str(), "tok-2");
    }

    #[tokio::test]
    async fn test_logout_tears_down_then_calls_backend() {
        let auth = MockAuthApi::new();
        let clock = Arc::new(ManualClock::default());
        let mut teardown = MockChannelTeardown::new();
        teardown
            .expect_teardown_all()
            .withf(|reason| reason == "logout")
            .times(1)
            .return_const(());
        let manager = SessionManager::new(
            SessionConfig::default(),
            auth.clone(),
            Arc::new(TokenCell::new()),
            clock,
        )
        .with_teardown(Arc::new(teardown));

        auth.push_login(Ok(grant("tok", 10 * MINUTE)));
        manager.login(creds("right")).await.unwrap();
        auth.push_logout(Err(ApiError::from_status(500)));

        manager.logout().await;

        assert_eq!(manager.status(), SessionStatus::Anonymous);
        assert_eq!(manager.snapshot(), Session::anonymous());
        assert!(manager.token().bearer_token().is_none());
        assert_eq!(auth.calls().last(), Some(&AuthCall::Logout));
    }

    #[tokio::test]
    async fn test_logout_ignored_while_locked() {
        let (manager, auth, _clock) = setup();
        for _ in 0..5 {
            let _ = manager.login(creds("wrong")).await;
        }
        manager.logout().await;

        assert_eq!(manager.status(), SessionStatus::Locked);
        assert!(!auth.calls().contains(&AuthCall::Logout));
    }

    #[tokio::test]
    async fn test_refresh_extends_expiry() {
        let (manager, auth, clock) = setup();
        auth.push_login(Ok(grant("tok-1", 10 * MINUTE)));
        manager.login(creds("right")).await.unwrap();

        clock.advance(5 * MINUTE);
        auth.push_refresh(Ok(AuthGrant::with_token("tok-2", 30 * MINUTE)));
        manager.refresh().await.unwrap();

        assert_eq!(
            manager.snapshot().session_expiry_at,
            Some(clock.now_ms() + 30 * 60_000)
        );
        assert_eq!(manager.token().bearer_token().unwrap().as_str(), "tok-2");
        // Profile from login is kept when the refresh grant has none.
        assert!(manager.user().is_some());
    }

    #[tokio::test]
    async fn test_refresh_with_expired_grant_keeps_session() {
        let (manager, auth, clock) = setup();
        auth.push_login(Ok(grant("tok-1", 10 * MINUTE)));
        manager.login(creds("right")).await.unwrap();
        let expiry = manager.snapshot().session_expiry_at;

        auth.push_refresh(Ok(AuthGrant {
            token: Some("tok-2".to_string()),
            expires_at: Some(clock.now_ms() - 1),
            ..Default::default()
        }));
        let err = manager.refresh().await.unwrap_err();

        assert!(
            matches!(err, SessionError::Api(ref e) if e.kind == FailureKind::MalformedResponse)
        );
        assert!(manager.is_authenticated());
        assert_eq!(manager.snapshot().session_expiry_at, expiry);
        assert_eq!(manager.token().bearer_token().unwrap().as_str(), "tok-1");
    }

    #[tokio::test]
    async fn test_refresh_unauthorized_forces_expiry() {
        let (manager, auth, _clock) = setup();
        auth.push_login(Ok(grant("tok", 10 * MINUTE)));
        manager.login(creds("right")).await.unwrap();
        auth.push_refresh(Err(ApiError::from_status(401)));

        assert!(matches!(manager.refresh().await, Err(SessionError::Expired)));
        assert_eq!(manager.status(), SessionStatus::Expired);
        assert!(manager.token().bearer_token().is_none());
    }

    #[tokio::test]
    async fn test_refresh_requires_authentication() {
        let (manager, _auth, _clock) = setup();
        assert!(matches!(
            manager.refresh().await,
            Err(SessionError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn test_activity_does_not_extend_session() {
        let (manager, auth, clock) = setup();
        auth.push_login(Ok(grant("tok", MINUTE)));
        manager.login(creds("right")).await.unwrap();
        let expiry = manager.snapshot().session_expiry_at;

        clock.advance(Duration::from_secs(30));
        manager.record_activity();

        let session = manager.snapshot();
        assert_eq!(session.last_activity_at, Some(clock.now_ms()));
        assert_eq!(session.session_expiry_at, expiry);
    }

    #[tokio::test]
    async fn test_expiry_monitor_and_dispose() {
        let auth = MockAuthApi::new();
        let clock = Arc::new(ManualClock::default());
        let config = SessionConfig {
            expiry_check_interval_ms: 10,
            ..Default::default()
        };
        let manager = Arc::new(SessionManager::new(
            config,
            auth.clone(),
            Arc::new(TokenCell::new()),
            clock.clone(),
        ));
        let mut status_rx = manager.subscribe_status();

        auth.push_login(Ok(grant("tok", MINUTE)));
        manager.login(creds("right")).await.unwrap();
        let monitor = manager.spawn_expiry_monitor();

        clock.advance(2 * MINUTE);
        let expired = tokio::time::timeout(
            Duration::from_secs(2),
            status_rx.wait_for(|s| *s == SessionStatus::Expired),
        )
        .await;
        assert!(expired.is_ok());

        manager.dispose();
        assert_eq!(manager.status(), SessionStatus::Anonymous);
        tokio::time::timeout(Duration::from_secs(1), monitor)
            .await
            .unwrap()
            .unwrap();
    }
}
