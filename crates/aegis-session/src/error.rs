//! Session error types.
//!
//! Display strings are shown to users as-is.

use aegis_http::ApiError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Account locked. Try again in {remaining_minutes} minutes.")]
    Locked { remaining_minutes: u64 },

    #[error("{message}")]
    InvalidCredentials {
        message: String,
        attempts_remaining: u32,
    },

    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("Session expired. Please log in again.")]
    Expired,

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Already authenticated")]
    AlreadyAuthenticated,

    #[error("Login already in progress")]
    LoginInProgress,

    #[error("No two-factor challenge is pending")]
    TwoFactorNotPending,

    /// The session was reset while the call was in flight.
    #[error("Authentication was cancelled")]
    Superseded,

    #[error("API error: {0}")]
    Api(#[from] ApiError),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Whole minutes left in a lockout, rounded up, never below one.
pub(crate) fn lockout_minutes(remaining_ms: i64) -> u64 {
    let remaining_ms = u64::try_from(remaining_ms).unwrap_or(0);
    remaining_ms.div_ceil(60_000).max(1)
}
