//! HTTP error types.

use aegis_core::FailureKind;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single logical HTTP call, after any retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ApiError {
    /// Classified failure kind; decides retryability.
    pub kind: FailureKind,
    /// Human-readable message (server-provided when available).
    pub message: String,
    /// HTTP status, when a response was received.
    pub status: Option<u16>,
    /// Server-provided error code.
    pub code: Option<String>,
}

impl ApiError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: kind.status(),
            code: None,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("Request timed out after {}ms", after.as_millis()),
        )
    }

    /// Generic error for a status whose body carried no usable message.
    pub fn from_status(status: u16) -> Self {
        let kind = FailureKind::from_status(status).unwrap_or(FailureKind::MalformedResponse);
        Self {
            kind,
            message: format!("HTTP {status}"),
            status: Some(status),
            code: None,
        }
    }

    pub fn malformed(status: Option<u16>, detail: impl std::fmt::Display) -> Self {
        Self {
            kind: FailureKind::MalformedResponse,
            message: format!("Malformed response: {detail}"),
            status,
            code: None,
        }
    }

    /// Classify a transport-level reqwest failure.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            FailureKind::Timeout
        } else if err.is_builder() {
            FailureKind::InvalidRequest
        } else if err.is_decode() {
            FailureKind::MalformedResponse
        } else {
            FailureKind::NetworkUnavailable
        };
        Self::new(kind, format!("HTTP request failed: {err}"))
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Client construction errors.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Invalid base URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP client error: {0}")]
    Client(String),
}

pub type HttpResult<T> = Result<T, ApiError>;
