//! WebSocket connection manager.
//!
//! Owns a map of named channels. Each channel runs on its own task with its
//! own reconnect loop, heartbeat and outbound queue. The manager's public
//! methods are the only path that mutates the map; replacing a channel
//! happens under a single lock so no caller observes a half-updated handle.

use crate::error::{WsError, WsResult};
use crate::heartbeat::{Heartbeat, HeartbeatAction};
use crate::message::{parse_frame, OutboundFrame};
use crate::subscriber::{MessageHandler, SubscriberRegistry, Subscription};
use aegis_core::{next_delay, RetryPolicy};
use aegis_telemetry::Metrics;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async_tls_with_config, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Close code sent on an intentional disconnect.
pub const CLEAN_CLOSE_CODE: u16 = 1000;

/// Close code recorded when the transport vanished without a close frame.
const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// Upper bound on flushing the close frame during teardown.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

fn default_heartbeat_interval_ms() -> u64 {
    25_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    10_000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_auto_reconnect() -> bool {
    true
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

/// Channel defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsConfig {
    /// Ping period while connected.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Silence after a ping before the connection is declared dead.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Reconnects before the channel gives up and enters `Error`.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,
    /// Opening handshake timeout.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            auto_reconnect: default_auto_reconnect(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Per-channel options.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub connect_timeout: Duration,
    /// Supplies reconnect delays. Shared, never mutated.
    pub policy: Arc<RetryPolicy>,
}

impl ChannelOptions {
    pub fn from_config(config: &WsConfig, policy: Arc<RetryPolicy>) -> Self {
        Self {
            auto_reconnect: config.auto_reconnect,
            max_reconnect_attempts: config.max_reconnect_attempts,
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(config.heartbeat_timeout_ms),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            policy,
        }
    }
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self::from_config(&WsConfig::default(), Arc::new(RetryPolicy::default()))
    }
}

/// Channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect attempts exhausted. Only an explicit `connect` leaves it.
    Error,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only snapshot of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelView {
    pub name: String,
    pub url: String,
    pub state: ChannelState,
    pub reconnect_attempt: u32,
    /// When the last heartbeat ping was sent.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

/// State shared between a channel's task and the manager.
struct ChannelShared {
    name: String,
    url: String,
    state: RwLock<ChannelState>,
    reconnect_attempt: AtomicU32,
    last_heartbeat_at: RwLock<Option<DateTime<Utc>>>,
    /// Set synchronously on teardown; a closed channel never changes state
    /// or delivers another frame.
    closed: AtomicBool,
    metrics: Option<Arc<Metrics>>,
}

impl ChannelShared {
    fn new(name: &str, url: &str, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            state: RwLock::new(ChannelState::Disconnected),
            reconnect_attempt: AtomicU32::new(0),
            last_heartbeat_at: RwLock::new(None),
            closed: AtomicBool::new(false),
            metrics,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn state(&self) -> ChannelState {
        *self.state.read()
    }

    fn set_state(&self, state: ChannelState) {
        // Checked under the state lock so a write cannot land after `close`.
        let mut current = self.state.write();
        if self.is_closed() {
            return;
        }
        let previous = std::mem::replace(&mut *current, state);
        if previous != state {
            debug!(channel = %self.name, from = %previous, to = %state, "Channel state changed");
        }
        if let Some(metrics) = &self.metrics {
            metrics.ws_state_set(&self.name, state.as_str());
        }
    }

    /// Mark the channel closed and retire its state series.
    fn close(&self) {
        let mut current = self.state.write();
        self.closed.store(true, Ordering::SeqCst);
        *current = ChannelState::Disconnected;
        if let Some(metrics) = &self.metrics {
            metrics.ws_channel_removed(&self.name);
        }
    }

    fn view(&self) -> ChannelView {
        ChannelView {
            name: self.name.clone(),
            url: self.url.clone(),
            state: self.state(),
            reconnect_attempt: self.reconnect_attempt.load(Ordering::SeqCst),
            last_heartbeat_at: *self.last_heartbeat_at.read(),
        }
    }
}

/// Manager-side handle of a running channel.
struct ChannelSlot {
    shared: Arc<ChannelShared>,
    outbound_tx: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl ChannelSlot {
    /// Synchronous teardown: after this returns the channel delivers no
    /// frame, changes no state and schedules no reconnect. The task exits on
    /// its own after flushing a clean close.
    fn teardown(self) {
        self.shared.close();
        self.cancel.cancel();
    }
}

/// WebSocket connection manager.
pub struct ConnectionManager {
    defaults: ChannelOptions,
    channels: Mutex<HashMap<String, ChannelSlot>>,
    subscribers: Arc<SubscriberRegistry>,
    /// Parent of every channel's cancellation token.
    shutdown_token: CancellationToken,
    disposed: AtomicBool,
    metrics: Option<Arc<Metrics>>,
}

impl ConnectionManager {
    /// Create a manager whose channels default to `defaults`.
    pub fn new(defaults: ChannelOptions) -> Self {
        Self {
            defaults,
            channels: Mutex::new(HashMap::new()),
            subscribers: SubscriberRegistry::new(),
            shutdown_token: CancellationToken::new(),
            disposed: AtomicBool::new(false),
            metrics: None,
        }
    }

    /// Attach a metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn defaults(&self) -> &ChannelOptions {
        &self.defaults
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Open (or replace) the named channel.
    ///
    /// An existing channel with the same name is torn down first; its
    /// subscribers carry over to the new connection. Must be called from
    /// within a Tokio runtime.
    pub fn connect(&self, name: &str, url: &str, options: Option<ChannelOptions>) -> WsResult<()> {
        if self.is_disposed() {
            warn!(channel = name, "connect called on disposed ConnectionManager");
            return Err(WsError::Disposed);
        }
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(WsError::InvalidUrl(url.to_string()));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            WsError::ConnectionFailed("connect requires a Tokio runtime".to_string())
        })?;

        let options = options.unwrap_or_else(|| self.defaults.clone());
        let mut channels = self.channels.lock();

        if let Some(previous) = channels.remove(name) {
            info!(channel = name, old_url = %previous.shared.url, new_url = url, "Replacing channel");
            previous.teardown();
        }

        let shared = Arc::new(ChannelShared::new(name, url, self.metrics.clone()));
        shared.set_state(ChannelState::Connecting);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let cancel = self.shutdown_token.child_token();

        let task = ChannelTask {
            shared: shared.clone(),
            options,
            subscribers: self.subscribers.clone(),
            outbound_rx,
            cancel: cancel.clone(),
        };
        runtime.spawn(task.run());

        channels.insert(
            name.to_string(),
            ChannelSlot {
                shared,
                outbound_tx,
                cancel,
            },
        );
        info!(channel = name, url, "Channel opened");
        Ok(())
    }

    /// Close the named channel and drop its subscribers.
    ///
    /// Returns false if no such channel existed.
    pub fn disconnect(&self, name: &str) -> bool {
        let removed = self.channels.lock().remove(name);
        let removed_subscribers = self.subscribers.remove_channel(name);

        match removed {
            Some(slot) => {
                slot.teardown();
                info!(channel = name, removed_subscribers, "Channel disconnected");
                true
            }
            None => false,
        }
    }

    /// Close every channel.
    pub fn disconnect_all(&self) {
        let drained: Vec<(String, ChannelSlot)> = self.channels.lock().drain().collect();
        for (name, slot) in drained {
            self.subscribers.remove_channel(&name);
            slot.teardown();
            debug!(channel = %name, "Channel disconnected");
        }
    }

    /// Close every channel and refuse further `connect` calls.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.disconnect_all();
        self.subscribers.clear();
        self.shutdown_token.cancel();
        info!("ConnectionManager disposed");
    }

    /// Serialize and queue `message` on the named channel.
    ///
    /// Returns false, without error, unless the channel is connected.
    pub fn send<T: Serialize + ?Sized>(&self, name: &str, message: &T) -> bool {
        let channels = self.channels.lock();
        let Some(slot) = channels.get(name) else {
            debug!(channel = name, "send on unknown channel");
            return false;
        };
        if slot.shared.state() != ChannelState::Connected {
            debug!(channel = name, state = %slot.shared.state(), "send on channel that is not connected");
            return false;
        }

        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!(channel = name, error = %e, "Failed to serialize outbound message");
                return false;
            }
        };
        slot.outbound_tx.send(text).is_ok()
    }

    /// State of the named channel; `Disconnected` if unknown.
    pub fn get_status(&self, name: &str) -> ChannelState {
        self.channels
            .lock()
            .get(name)
            .map_or(ChannelState::Disconnected, |slot| slot.shared.state())
    }

    pub fn channel(&self, name: &str) -> Option<ChannelView> {
        self.channels.lock().get(name).map(|slot| slot.shared.view())
    }

    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Register a handler for frames on `name`. The channel need not exist yet.
    pub fn subscribe(&self, name: &str, handler: MessageHandler) -> Subscription {
        self.subscribers.subscribe(name, handler)
    }

    pub fn subscriber_count(&self, name: &str) -> usize {
        self.subscribers.subscriber_count(name)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        for slot in self.channels.get_mut().drain().map(|(_, slot)| slot) {
            slot.teardown();
        }
        self.shutdown_token.cancel();
    }
}

/// How one connection ended.
enum ConnectionEnd {
    /// Torn down by the manager. Do not reconnect.
    Cancelled,
    /// Transport failure, remote close or heartbeat timeout.
    Failed(WsError),
}

/// Task state of one channel.
struct ChannelTask {
    shared: Arc<ChannelShared>,
    options: ChannelOptions,
    subscribers: Arc<SubscriberRegistry>,
    outbound_rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
}

impl ChannelTask {
    async fn run(mut self) {
        let name = self.shared.name.clone();

        loop {
            let err = match self.run_connection().await {
                ConnectionEnd::Cancelled => {
                    debug!(channel = %name, "Channel task exiting");
                    return;
                }
                ConnectionEnd::Failed(err) => err,
            };

            if self.cancel.is_cancelled() || self.shared.is_closed() {
                return;
            }

            // Messages queued for the dead connection are not replayed.
            let mut stale = 0usize;
            while self.outbound_rx.try_recv().is_ok() {
                stale += 1;
            }
            if stale > 0 {
                debug!(channel = %name, stale, "Discarded queued outbound messages");
            }

            if !self.options.auto_reconnect {
                warn!(channel = %name, error = %err, "Channel lost, auto-reconnect disabled");
                self.shared.set_state(ChannelState::Disconnected);
                return;
            }

            let attempt = self.shared.reconnect_attempt.load(Ordering::SeqCst);
            if attempt >= self.options.max_reconnect_attempts {
                error!(
                    channel = %name,
                    attempts = attempt,
                    error = %err,
                    "Max reconnection attempts reached"
                );
                self.shared.set_state(ChannelState::Error);
                return;
            }

            let delay = next_delay(&self.options.policy, attempt);
            self.shared
                .reconnect_attempt
                .store(attempt + 1, Ordering::SeqCst);
            self.shared.set_state(ChannelState::Connecting);
            if let Some(metrics) = &self.shared.metrics {
                metrics.ws_reconnect(&name);
            }
            warn!(
                channel = %name,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Reconnecting"
            );

            // Cancellation-aware backoff: teardown must never be followed
            // by a reconnect.
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    debug!(channel = %name, "Teardown during backoff");
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_connection(&mut self) -> ConnectionEnd {
        let name = self.shared.name.clone();
        info!(channel = %name, url = %self.shared.url, "Connecting to WebSocket");

        let handshake = tokio::time::timeout(
            self.options.connect_timeout,
            connect_async_tls_with_config(self.shared.url.as_str(), None, true, None),
        );
        let ws_stream = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return ConnectionEnd::Cancelled,
            result = handshake => match result {
                Ok(Ok((stream, _response))) => stream,
                Ok(Err(e)) => return ConnectionEnd::Failed(e.into()),
                Err(_) => {
                    return ConnectionEnd::Failed(WsError::ConnectionFailed(format!(
                        "handshake timed out after {:?}",
                        self.options.connect_timeout
                    )))
                }
            },
        };
        let (mut write, mut read) = ws_stream.split();

        if self.shared.is_closed() {
            return ConnectionEnd::Cancelled;
        }
        self.shared.reconnect_attempt.store(0, Ordering::SeqCst);
        self.shared.set_state(ChannelState::Connected);
        info!(channel = %name, "WebSocket connected");

        let mut heartbeat = Heartbeat::new(
            self.options.heartbeat_interval,
            self.options.heartbeat_timeout,
            Instant::now(),
        );

        loop {
            let deadline = heartbeat.next_deadline();

            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    let close = Message::Close(Some(CloseFrame {
                        code: CloseCode::from(CLEAN_CLOSE_CODE),
                        reason: "client disconnect".into(),
                    }));
                    match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, write.send(close)).await {
                        Ok(Ok(())) => debug!(channel = %name, "Sent close frame"),
                        Ok(Err(e)) => debug!(channel = %name, error = %e, "Failed to send close frame"),
                        Err(_) => debug!(channel = %name, "Timed out sending close frame"),
                    }
                    return ConnectionEnd::Cancelled;
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            heartbeat.record_inbound(Instant::now());
                            self.handle_text(&text);
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            heartbeat.record_inbound(Instant::now());
                            match String::from_utf8(bytes) {
                                Ok(text) => self.handle_text(&text),
                                Err(_) => self.drop_frame("binary frame is not UTF-8"),
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            heartbeat.record_inbound(Instant::now());
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                return ConnectionEnd::Failed(e.into());
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            heartbeat.record_inbound(Instant::now());
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (u16::from(f.code), f.reason.to_string()))
                                .unwrap_or((ABNORMAL_CLOSE_CODE, String::new()));
                            warn!(channel = %name, code, %reason, "WebSocket closed by server");
                            return ConnectionEnd::Failed(WsError::ConnectionClosed { code, reason });
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => {
                            warn!(channel = %name, error = %e, "WebSocket read error");
                            return ConnectionEnd::Failed(e.into());
                        }
                        None => {
                            warn!(channel = %name, "WebSocket stream ended");
                            return ConnectionEnd::Failed(WsError::ConnectionClosed {
                                code: ABNORMAL_CLOSE_CODE,
                                reason: "stream ended".to_string(),
                            });
                        }
                    }
                }

                Some(text) = self.outbound_rx.recv() => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        return ConnectionEnd::Failed(e.into());
                    }
                }

                () = tokio::time::sleep_until(deadline) => {
                    match heartbeat.poll(Instant::now()) {
                        HeartbeatAction::TimedOut => {
                            warn!(
                                channel = %name,
                                silent_ms = heartbeat.time_since_last_inbound(Instant::now()).as_millis() as u64,
                                "Heartbeat timeout"
                            );
                            return ConnectionEnd::Failed(WsError::HeartbeatTimeout);
                        }
                        HeartbeatAction::SendPing => {
                            let ping = match OutboundFrame::Ping.to_json() {
                                Ok(ping) => ping,
                                Err(e) => return ConnectionEnd::Failed(e),
                            };
                            if let Err(e) = write.send(Message::Text(ping)).await {
                                return ConnectionEnd::Failed(e.into());
                            }
                            *self.shared.last_heartbeat_at.write() = Some(Utc::now());
                            debug!(channel = %name, "Sent heartbeat ping");
                        }
                        HeartbeatAction::Idle => {}
                    }
                }
            }
        }
    }

    fn handle_text(&self, text: &str) {
        let msg = match parse_frame(text) {
            Ok(msg) => msg,
            Err(e) => {
                self.drop_frame(&e.to_string());
                return;
            }
        };

        if msg.is_pong() {
            debug!(channel = %self.shared.name, "Received pong");
            return;
        }

        let shared = &self.shared;
        self.subscribers
            .dispatch(&shared.name, &msg, || shared.is_closed());
    }

    fn drop_frame(&self, reason: &str) {
        warn!(channel = %self.shared.name, reason, "Dropping malformed frame");
        if let Some(metrics) = &self.shared.metrics {
            metrics.ws_frame_dropped(&self.shared.name);
        }
    }
}
