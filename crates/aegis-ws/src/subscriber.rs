//! Subscriber registry and fan-out.
//!
//! Subscribers are keyed by channel name and never own the channel's
//! lifetime. Handlers run synchronously, in registration order, on the
//! connection task that received the frame; a panicking handler is isolated
//! so the remaining handlers still see the frame.

use crate::message::WsMessage;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error};

/// Callback invoked for every frame on a channel.
pub type MessageHandler = Arc<dyn Fn(&WsMessage) + Send + Sync>;

/// Registry of handlers per channel name.
#[derive(Default)]
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    channels: RwLock<HashMap<String, Vec<(u64, MessageHandler)>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a handler. Dropping the returned guard unsubscribes.
    pub fn subscribe(self: &Arc<Self>, channel: &str, handler: MessageHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.channels
            .write()
            .entry(channel.to_string())
            .or_default()
            .push((id, handler));
        debug!(channel, subscriber_id = id, "Subscriber added");

        Subscription {
            registry: Arc::downgrade(self),
            channel: channel.to_string(),
            id,
            active: true,
        }
    }

    /// Remove one handler. Returns false if it was already gone.
    pub fn unsubscribe(&self, channel: &str, id: u64) -> bool {
        let mut channels = self.channels.write();
        let Some(handlers) = channels.get_mut(channel) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            channels.remove(channel);
        }
        removed
    }

    /// Remove every handler for a channel. Returns how many were removed.
    pub fn remove_channel(&self, channel: &str) -> usize {
        self.channels
            .write()
            .remove(channel)
            .map_or(0, |handlers| handlers.len())
    }

    pub fn clear(&self) {
        self.channels.write().clear();
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.read().get(channel).map_or(0, Vec::len)
    }

    /// Deliver a frame to every current handler of `channel`.
    ///
    /// The handler list is snapshotted so handlers may subscribe, unsubscribe
    /// or disconnect without deadlocking. `is_closed` is checked before each
    /// invocation; once it reports true no further handler runs. A handler
    /// unsubscribed by an earlier one is skipped.
    ///
    /// Returns the number of handlers that completed without panicking.
    pub fn dispatch(&self, channel: &str, msg: &WsMessage, is_closed: impl Fn() -> bool) -> usize {
        let handlers: Vec<(u64, MessageHandler)> = match self.channels.read().get(channel) {
            Some(handlers) => handlers.clone(),
            None => return 0,
        };

        let mut delivered = 0;
        for (id, handler) in handlers {
            if is_closed() {
                break;
            }
            if !self.is_registered(channel, id) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| handler(msg))) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    error!(
                        channel,
                        subscriber_id = id,
                        kind = msg.kind(),
                        "Subscriber panicked; continuing fan-out"
                    );
                }
            }
        }
        delivered
    }

    fn is_registered(&self, channel: &str, id: u64) -> bool {
        self.channels
            .read()
            .get(channel)
            .is_some_and(|handlers| handlers.iter().any(|(existing, _)| *existing == id))
    }
}

/// Handle to a registered handler.
#[must_use = "dropping a Subscription unsubscribes its handler"]
pub struct Subscription {
    registry: Weak<SubscriberRegistry>,
    channel: String,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the handler now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(&self.channel, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("id", &self.id)
            .finish()
    }
}
