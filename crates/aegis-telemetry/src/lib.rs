//! Prometheus metrics and structured logging for the Aegis connectivity layer.
//!
//! - Structured JSON logging with tracing in production, pretty output otherwise
//! - A per-instance Prometheus registry covering HTTP retries, channel
//!   reconnects and session lockouts

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::Metrics;
