//! Connectivity service.
//!
//! Wires the components together:
//! - Bearer token cell shared by the session and the HTTP client
//! - HTTP client and the auth backend on top of it
//! - Session state machine with its expiry monitor
//! - WebSocket connection manager, torn down whenever the session ends

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use aegis_core::Clock;
use aegis_http::ApiClient;
use aegis_session::{
    BlockedReason, ChannelTeardown, Credentials, HttpAuthApi, LoginOutcome, SessionManager,
    TokenCell,
};
use aegis_telemetry::Metrics;
use aegis_ws::{ChannelOptions, ConnectionManager, MessageHandler, Subscription};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Closes every open channel when the session ends.
struct SessionChannels {
    connections: Arc<ConnectionManager>,
    /// Held across the auth check and `connect` in `open_channel_at`, so a
    /// channel is either refused or visible to this teardown.
    gate: Arc<Mutex<()>>,
}

impl ChannelTeardown for SessionChannels {
    fn teardown_all(&self, reason: &str) {
        let _gate = self.gate.lock();
        let open = self.connections.channel_names();
        if !open.is_empty() {
            info!(reason, channels = ?open, "Closing session channels");
        }
        self.connections.disconnect_all();
    }
}

/// Process-wide connectivity layer.
pub struct ConnectivityService {
    config: AppConfig,
    metrics: Arc<Metrics>,
    api: ApiClient,
    session: Arc<SessionManager>,
    connections: Arc<ConnectionManager>,
    channel_gate: Arc<Mutex<()>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectivityService {
    /// Build every component from `config` and start the expiry monitor.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn init(config: AppConfig, clock: Arc<dyn Clock>) -> AppResult<Self> {
        config.validate()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(AppError::NoRuntime);
        }

        let metrics = Arc::new(Metrics::new()?);
        let policy = Arc::new(config.retry.clone());
        let token = Arc::new(TokenCell::new());

        let api = ApiClient::new(&config.http, policy.clone(), token.clone())?
            .with_metrics(metrics.clone());

        let connections = Arc::new(
            ConnectionManager::new(ChannelOptions::from_config(&config.ws, policy))
                .with_metrics(metrics.clone()),
        );

        let channel_gate = Arc::new(Mutex::new(()));
        let session = Arc::new(
            SessionManager::new(
                config.session.clone(),
                Arc::new(HttpAuthApi::new(api.clone())),
                token,
                clock,
            )
            .with_teardown(Arc::new(SessionChannels {
                connections: connections.clone(),
                gate: channel_gate.clone(),
            }))
            .with_metrics(metrics.clone()),
        );
        let monitor = session.spawn_expiry_monitor();

        info!(
            base_url = %config.http.base_url,
            channels = config.channels.len(),
            "Connectivity service initialized"
        );

        Ok(Self {
            config,
            metrics,
            api,
            session,
            connections,
            channel_gate,
            monitor: Mutex::new(Some(monitor)),
        })
    }

    pub async fn login(&self, credentials: Credentials) -> AppResult<LoginOutcome> {
        Ok(self.session.login(credentials).await?)
    }

    pub async fn verify_two_factor(&self, code: &str) -> AppResult<LoginOutcome> {
        Ok(self.session.verify_two_factor(code).await?)
    }

    /// End the session; every channel is closed before this returns.
    pub async fn logout(&self) {
        self.session.logout().await;
    }

    /// Open a channel at its configured URL.
    pub fn open_channel(&self, name: &str) -> AppResult<()> {
        let url = self
            .config
            .channel_url(name)
            .ok_or_else(|| AppError::UnknownChannel(name.to_string()))?
            .to_string();
        self.open_channel_at(name, &url)
    }

    /// Open a channel at an explicit URL. Requires an authenticated session.
    pub fn open_channel_at(&self, name: &str, url: &str) -> AppResult<()> {
        let _gate = self.channel_gate.lock();
        if !self.session.is_authenticated() {
            let reason = self
                .session
                .blocked_reason()
                .unwrap_or(BlockedReason::NotAuthenticated);
            warn!(channel = name, %reason, "Refusing to open channel");
            return Err(AppError::NotAuthenticated(reason));
        }
        self.connections.connect(name, url, None).map_err(Box::new)?;
        Ok(())
    }

    pub fn close_channel(&self, name: &str) -> bool {
        self.connections.disconnect(name)
    }

    /// Register a handler for frames on `name`.
    pub fn subscribe(&self, name: &str, handler: MessageHandler) -> Subscription {
        self.connections.subscribe(name, handler)
    }

    /// Send on an open channel. Returns false unless it is connected.
    pub fn send<T: Serialize + ?Sized>(&self, name: &str, message: &T) -> bool {
        self.connections.send(name, message)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// HTTP client carrying the session's bearer token.
    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Stop the expiry monitor, close every channel and reset the session.
    pub fn dispose(&self) {
        self.session.dispose();
        self.connections.dispose();
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }
        info!("Connectivity service disposed");
    }
}
