//! WebSocket frame types.
//!
//! Inbound frames are JSON objects discriminated by their `type` field.
//! Known kinds decode into typed variants; unknown kinds are kept as
//! `WsMessage::Other` so feature areas can add kinds without breaking
//! existing subscribers.

use crate::error::{WsError, WsResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Inbound
// ============================================================================

/// Inbound message, matched exhaustively by consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Heartbeat reply. Consumed by the connection, never fanned out.
    Pong {
        #[serde(default)]
        timestamp: Option<i64>,
    },
    /// Metrics sample.
    Metrics {
        #[serde(default)]
        data: Value,
    },
    /// Security alert.
    Alert {
        #[serde(default)]
        severity: Option<String>,
        #[serde(default)]
        data: Value,
    },
    /// Named domain event.
    Event {
        event: String,
        #[serde(default)]
        data: Value,
    },
    /// Server-reported error on the channel.
    Error {
        message: String,
        #[serde(default)]
        code: Option<String>,
    },
    /// Frame with a `type` this client does not model.
    #[serde(skip)]
    Other { kind: String, payload: Value },
}

impl WsMessage {
    /// `type` values decoded into typed variants.
    pub const KNOWN_KINDS: [&'static str; 5] = ["pong", "metrics", "alert", "event", "error"];

    /// The frame's `type` discriminator.
    pub fn kind(&self) -> &str {
        match self {
            Self::Pong { .. } => "pong",
            Self::Metrics { .. } => "metrics",
            Self::Alert { .. } => "alert",
            Self::Event { .. } => "event",
            Self::Error { .. } => "error",
            Self::Other { kind, .. } => kind,
        }
    }

    pub fn is_pong(&self) -> bool {
        matches!(self, Self::Pong { .. })
    }

    /// JSON representation, including unmodelled frames.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Other { payload, .. } => payload.clone(),
            typed => serde_json::to_value(typed).unwrap_or(Value::Null),
        }
    }
}

/// Parse one inbound text frame.
///
/// Errors for non-JSON text, non-object JSON, a missing/non-string `type`,
/// or a known kind whose fields don't match.
pub fn parse_frame(text: &str) -> WsResult<WsMessage> {
    let value: Value = serde_json::from_str(text)?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| WsError::ParseError("frame has no string `type` field".to_string()))?
        .to_string();

    if WsMessage::KNOWN_KINDS.contains(&kind.as_str()) {
        return serde_json::from_value(value)
            .map_err(|e| WsError::ParseError(format!("invalid `{kind}` frame: {e}")));
    }

    Ok(WsMessage::Other {
        kind,
        payload: value,
    })
}

// ============================================================================
// Outbound
// ============================================================================

/// Frames generated by the connection itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// Reserved heartbeat shape: `{"type":"ping"}`.
    Ping,
}

impl OutboundFrame {
    pub fn to_json(&self) -> WsResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}
