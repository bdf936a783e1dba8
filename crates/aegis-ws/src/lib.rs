//! WebSocket connection manager for the Aegis connectivity layer.
//!
//! Owns any number of named, independent channels, each with:
//! - Automatic reconnection with exponential backoff
//! - Heartbeat ping and silent-connection detection
//! - Ordered, panic-isolated fan-out to subscribers
//! - A liveness-tolerant `send` that never fails loudly

pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod message;
pub mod subscriber;

pub use connection::{
    ChannelOptions, ChannelState, ChannelView, ConnectionManager, WsConfig, CLEAN_CLOSE_CODE,
};
pub use error::{WsError, WsResult};
pub use message::{parse_frame, OutboundFrame, WsMessage};
pub use subscriber::{MessageHandler, SubscriberRegistry, Subscription};

use std::sync::Once;

static INIT_CRYPTO: Once = Once::new();

/// Initialize the TLS crypto provider.
/// Must be called before any `wss://` connections are made.
pub fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
