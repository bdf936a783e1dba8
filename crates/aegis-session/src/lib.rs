//! Session state machine for the Aegis connectivity layer.
//!
//! Governs the authenticated principal:
//! - Login with an optional two-factor gate
//! - Lockout after repeated credential rejections
//! - Wall-clock session expiry with forced channel teardown
//! - The bearer token read by the HTTP client

pub mod auth;
pub mod config;
pub mod error;
pub mod machine;
pub mod state;
pub mod token;

pub use auth::{AuthApi, AuthCall, AuthGrant, Credentials, HttpAuthApi, MockAuthApi};
pub use config::SessionConfig;
pub use error::{SessionError, SessionResult};
pub use machine::{ChannelTeardown, LoginOutcome, SessionManager};
pub use state::{BlockedReason, Session, SessionStatus, UserProfile};
pub use token::TokenCell;
