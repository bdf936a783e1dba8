//! Aegis client connectivity layer.
//!
//! Owns one session, one HTTP client and one WebSocket connection manager
//! for the whole process. Channels may only be opened while the session is
//! authenticated and are closed whenever it ends.

pub mod config;
pub mod error;
pub mod service;

pub use config::{AppConfig, ChannelConfig};
pub use error::{AppError, AppResult};
pub use service::ConnectivityService;
