//! Core types for the Aegis connectivity layer.
//!
//! This crate provides the building blocks shared by the HTTP client,
//! the WebSocket connection manager and the session state machine:
//! - `RetryPolicy`: immutable retry parameters
//! - `next_delay` / `should_retry`: the backoff scheduler
//! - `FailureKind`: transport failure taxonomy
//! - `Clock`: wall-clock abstraction for timer-driven transitions

pub mod backoff;
pub mod clock;
pub mod error;

pub use backoff::{
    next_delay, next_delay_with_random, should_retry, FailureKind, RetryPolicy,
    JITTER_FRACTION,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, Result};

use std::future::Future;
use std::pin::Pin;

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
