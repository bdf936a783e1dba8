//! Heartbeat scheduling for a single connection.
//!
//! Pings go out every `interval` while connected. Any inbound frame proves
//! liveness; if nothing arrives within `timeout` of an unanswered ping the
//! connection is considered dead even though the transport hasn't closed.

use std::time::Duration;
use tokio::time::Instant;

/// What the connection loop should do when the heartbeat deadline fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send `{"type":"ping"}`.
    SendPing,
    /// No inbound traffic since the last ping within the timeout.
    TimedOut,
    /// Deadline moved (inbound traffic arrived); nothing to do.
    Idle,
}

/// Per-connection heartbeat state. Owned by the connection task.
#[derive(Debug)]
pub struct Heartbeat {
    interval: Duration,
    timeout: Duration,
    next_ping_at: Instant,
    /// Time of the oldest ping not yet followed by inbound traffic.
    awaiting_since: Option<Instant>,
    last_inbound: Instant,
}

impl Heartbeat {
    /// Start the schedule at `now`; the first ping is due one interval later.
    pub fn new(interval: Duration, timeout: Duration, now: Instant) -> Self {
        Self {
            interval,
            timeout,
            next_ping_at: now + interval,
            awaiting_since: None,
            last_inbound: now,
        }
    }

    /// When the connection loop should next call [`Heartbeat::poll`].
    pub fn next_deadline(&self) -> Instant {
        match self.awaiting_since {
            Some(sent) => (sent + self.timeout).min(self.next_ping_at),
            None => self.next_ping_at,
        }
    }

    /// Record any inbound frame.
    pub fn record_inbound(&mut self, now: Instant) {
        self.last_inbound = now;
        self.awaiting_since = None;
    }

    /// Evaluate the schedule at `now`.
    pub fn poll(&mut self, now: Instant) -> HeartbeatAction {
        if let Some(sent) = self.awaiting_since {
            if now >= sent + self.timeout {
                return HeartbeatAction::TimedOut;
            }
        }

        if now >= self.next_ping_at {
            self.next_ping_at = now + self.interval;
            self.awaiting_since.get_or_insert(now);
            return HeartbeatAction::SendPing;
        }

        HeartbeatAction::Idle
    }

    pub fn is_awaiting_reply(&self) -> bool {
        self.awaiting_since.is_some()
    }

    pub fn time_since_last_inbound(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_inbound)
    }
}
