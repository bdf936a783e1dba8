//! Session snapshot types.

use crate::error::lockout_minutes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Authentication status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Anonymous,
    /// Credentials submitted, or waiting on a two-factor code.
    Authenticating,
    Authenticated,
    Locked,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::Authenticating => "authenticating",
            Self::Authenticated => "authenticated",
            Self::Locked => "locked",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authenticated user profile as returned by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Snapshot of the authenticated principal. All times are epoch ms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub status: SessionStatus,
    pub user: Option<UserProfile>,
    pub session_expiry_at: Option<i64>,
    pub failed_attempt_count: u32,
    pub lockout_expiry_at: Option<i64>,
    pub last_activity_at: Option<i64>,
}

impl Session {
    pub fn anonymous() -> Self {
        Self {
            status: SessionStatus::Anonymous,
            user: None,
            session_expiry_at: None,
            failed_attempt_count: 0,
            lockout_expiry_at: None,
            last_activity_at: None,
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::anonymous()
    }
}

/// Why an authenticated action cannot proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockedReason {
    Locked { remaining: Duration },
    Expired,
    NetworkUnavailable,
    NotAuthenticated,
}

impl std::fmt::Display for BlockedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Locked { remaining } => {
                let ms = i64::try_from(remaining.as_millis()).unwrap_or(i64::MAX);
                write!(
                    f,
                    "Account locked. Try again in {} minutes.",
                    lockout_minutes(ms)
                )
            }
            Self::Expired => f.write_str("Session expired. Please log in again."),
            Self::NetworkUnavailable => f.write_str("Network unavailable. Check your connection."),
            Self::NotAuthenticated => f.write_str("Not authenticated"),
        }
    }
}
