//! Application error types.

use aegis_session::BlockedReason;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not authenticated: {0}")]
    NotAuthenticated(BlockedReason),

    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<aegis_ws::WsError>),

    #[error("Session error: {0}")]
    Session(#[from] aegis_session::SessionError),

    #[error("HTTP client error: {0}")]
    Http(#[from] aegis_http::HttpError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] aegis_telemetry::TelemetryError),

    #[error("No Tokio runtime available")]
    NoRuntime,
}

impl From<aegis_core::CoreError> for AppError {
    fn from(err: aegis_core::CoreError) -> Self {
        Self::Config(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
