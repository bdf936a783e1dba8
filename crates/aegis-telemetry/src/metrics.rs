//! Prometheus metrics for the connectivity layer.
//!
//! Each `Metrics` instance owns its own registry so that several services
//! (and tests) can coexist in one process without name collisions.
//! Components hold an `Option<Arc<Metrics>>`; recording is a no-op without it.

use crate::error::{TelemetryError, TelemetryResult};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

/// Channel states reported through `aegis_ws_state`.
const WS_STATES: [&str; 4] = ["disconnected", "connecting", "connected", "error"];

/// Connectivity metrics.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    http_requests_total: IntCounterVec,
    http_retries_total: IntCounter,
    http_latency_ms: HistogramVec,
    ws_reconnect_total: IntCounterVec,
    ws_state: IntGaugeVec,
    ws_frames_dropped_total: IntCounterVec,
    session_login_total: IntCounterVec,
    session_lockouts_total: IntCounter,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create and register all metrics on a fresh registry.
    pub fn new() -> TelemetryResult<Self> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new("aegis_http_requests_total", "Completed HTTP calls by outcome"),
            &["outcome"],
        )?;
        let http_retries_total =
            IntCounter::new("aegis_http_retries_total", "HTTP retry attempts")?;
        let http_latency_ms = HistogramVec::new(
            HistogramOpts::new(
                "aegis_http_latency_ms",
                "HTTP call latency including retries in milliseconds",
            )
            .buckets(vec![
                5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 10000.0,
            ]),
            &["method"],
        )?;
        let ws_reconnect_total = IntCounterVec::new(
            Opts::new("aegis_ws_reconnect_total", "Scheduled channel reconnects"),
            &["channel"],
        )?;
        let ws_state = IntGaugeVec::new(
            Opts::new(
                "aegis_ws_state",
                "Channel state machine current state (1=active, 0=inactive)",
            ),
            &["channel", "state"],
        )?;
        let ws_frames_dropped_total = IntCounterVec::new(
            Opts::new(
                "aegis_ws_frames_dropped_total",
                "Malformed inbound frames dropped",
            ),
            &["channel"],
        )?;
        let session_login_total = IntCounterVec::new(
            Opts::new("aegis_session_login_total", "Login attempts by outcome"),
            &["outcome"],
        )?;
        let session_lockouts_total =
            IntCounter::new("aegis_session_lockouts_total", "Account lockouts entered")?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_retries_total.clone()))?;
        registry.register(Box::new(http_latency_ms.clone()))?;
        registry.register(Box::new(ws_reconnect_total.clone()))?;
        registry.register(Box::new(ws_state.clone()))?;
        registry.register(Box::new(ws_frames_dropped_total.clone()))?;
        registry.register(Box::new(session_login_total.clone()))?;
        registry.register(Box::new(session_lockouts_total.clone()))?;

        Ok(Self {
            registry,
            http_requests_total,
            http_retries_total,
            http_latency_ms,
            ws_reconnect_total,
            ws_state,
            ws_frames_dropped_total,
            session_login_total,
            session_lockouts_total,
        })
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn render(&self) -> TelemetryResult<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|_| TelemetryError::Encoding)
    }

    // =========================================================================
    // HTTP
    // =========================================================================

    /// Record a finished HTTP call (`ok`, or the failure kind).
    pub fn http_request(&self, outcome: &str) {
        self.http_requests_total.with_label_values(&[outcome]).inc();
    }

    /// Record a retry attempt.
    pub fn http_retry(&self) {
        self.http_retries_total.inc();
    }

    /// Record call latency.
    pub fn http_latency(&self, method: &str, latency_ms: f64) {
        self.http_latency_ms
            .with_label_values(&[method])
            .observe(latency_ms);
    }

    // =========================================================================
    // WebSocket
    // =========================================================================

    /// Set channel state. Only the active state is 1.
    pub fn ws_state_set(&self, channel: &str, state: &str) {
        for s in &WS_STATES {
            self.ws_state.with_label_values(&[channel, s]).set(0);
        }
        self.ws_state.with_label_values(&[channel, state]).set(1);
    }

    /// Drop every state series for a channel that no longer exists.
    pub fn ws_channel_removed(&self, channel: &str) {
        for s in &WS_STATES {
            let _ = self.ws_state.remove_label_values(&[channel, s]);
        }
    }

    /// Record a scheduled reconnect.
    pub fn ws_reconnect(&self, channel: &str) {
        self.ws_reconnect_total.with_label_values(&[channel]).inc();
    }

    /// Record a dropped malformed frame.
    pub fn ws_frame_dropped(&self, channel: &str) {
        self.ws_frames_dropped_total
            .with_label_values(&[channel])
            .inc();
    }

    // =========================================================================
    // Session
    // =========================================================================

    /// Record a login attempt outcome.
    pub fn session_login(&self, outcome: &str) {
        self.session_login_total.with_label_values(&[outcome]).inc();
    }

    /// Record entering lockout.
    pub fn session_lockout(&self) {
        self.session_lockouts_total.inc();
    }
}
