//! Backoff scheduler.
//!
//! Computes retry delays and attempt ceilings for both the HTTP client and
//! the WebSocket reconnect loops. The policy is an immutable value; every
//! caller keeps its own attempt counter.
//!
//! Delay for attempt `n` (zero-based):
//!
//! ```text
//! min(base_delay_ms * 2^n, max_delay_ms)            (jitter = false)
//! min(base_delay_ms * 2^n, max_delay_ms) * [0.8, 1.2) clamped to max_delay_ms
//! ```

use crate::error::{CoreError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Symmetric jitter range applied when `RetryPolicy::jitter` is set (±20%).
pub const JITTER_FRACTION: f64 = 0.2;

/// Largest exponent applied to the base delay. Beyond this the delay is
/// saturated at `max_delay_ms` anyway.
const MAX_EXPONENT: u32 = 31;

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_jitter() -> bool {
    true
}

/// Retry parameters shared by HTTP calls and reconnect loops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Number of retries allowed after the initial attempt.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for any computed delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Randomize delays by ±20%.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Validate the policy parameters.
    pub fn validate(&self) -> Result<()> {
        if self.base_delay_ms == 0 {
            return Err(CoreError::InvalidPolicy(
                "base_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(CoreError::InvalidPolicy(format!(
                "base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }
}

/// Transport failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The call exceeded its timeout.
    Timeout,
    /// The remote host could not be reached.
    NetworkUnavailable,
    /// 5xx response.
    ServerError(u16),
    /// 4xx response, including authentication rejection.
    ClientError(u16),
    /// The response body could not be interpreted.
    MalformedResponse,
    /// The request could not be built (bad URL, unserializable body).
    InvalidRequest,
    /// Transport-level socket failure.
    ConnectionError,
}

impl FailureKind {
    /// Classify an HTTP status code. Returns `None` for non-error codes.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            400..=499 => Some(Self::ClientError(status)),
            500..=599 => Some(Self::ServerError(status)),
            _ => None,
        }
    }

    /// Whether a failure of this kind may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::NetworkUnavailable | Self::ServerError(_) | Self::ConnectionError
        )
    }

    /// HTTP status carried by this failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ServerError(s) | Self::ClientError(s) => Some(*s),
            _ => None,
        }
    }

    /// Whether this failure means the credentials were rejected.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self, Self::ClientError(400 | 401 | 403 | 422))
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::NetworkUnavailable => write!(f, "network_unavailable"),
            Self::ServerError(s) => write!(f, "server_error({s})"),
            Self::ClientError(s) => write!(f, "client_error({s})"),
            Self::MalformedResponse => write!(f, "malformed_response"),
            Self::InvalidRequest => write!(f, "invalid_request"),
            Self::ConnectionError => write!(f, "connection_error"),
        }
    }
}

fn capped_delay_ms(policy: &RetryPolicy, attempt: u32) -> u64 {
    let exponent = attempt.min(MAX_EXPONENT);
    policy
        .base_delay_ms
        .saturating_mul(1u64 << exponent)
        .min(policy.max_delay_ms)
}

/// Compute the delay before retry number `attempt` (zero-based).
pub fn next_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let random = if policy.jitter {
        rand::thread_rng().gen::<f64>()
    } else {
        0.5
    };
    next_delay_with_random(policy, attempt, random)
}

/// Deterministic core of [`next_delay`].
///
/// `random` must be in `[0.0, 1.0)`; it maps to a factor in `[0.8, 1.2)`.
/// Ignored when the policy has jitter disabled.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn next_delay_with_random(policy: &RetryPolicy, attempt: u32, random: f64) -> Duration {
    let capped = capped_delay_ms(policy, attempt);
    if !policy.jitter {
        return Duration::from_millis(capped);
    }

    let factor = 1.0 + (random.clamp(0.0, 1.0) * 2.0 - 1.0) * JITTER_FRACTION;
    let jittered = ((capped as f64) * factor).round().max(0.0) as u64;
    Duration::from_millis(jittered.min(policy.max_delay_ms))
}

/// Decide whether a failed attempt should be retried.
///
/// `attempt` is the zero-based index of the attempt that just failed.
pub fn should_retry(policy: &RetryPolicy, attempt: u32, failure: FailureKind) -> bool {
    attempt < policy.max_attempts && failure.is_retryable()
}
