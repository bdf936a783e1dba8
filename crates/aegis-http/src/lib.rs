//! HTTP request client for the Aegis connectivity layer.
//!
//! - Per-call timeout that aborts the in-flight request
//! - Transparent retry of transient failures using the backoff scheduler
//! - Uniform `{success, data, error, status}` envelope for every outcome
//! - Bearer credential attached from a `CredentialSource` on every attempt

pub mod client;
pub mod envelope;
pub mod error;

pub use client::{ApiClient, CredentialSource, HttpConfig, NoCredentials, RequestOptions};
pub use envelope::{ApiResponse, Envelope};
pub use error::{ApiError, HttpError, HttpResult};
pub use reqwest::Method;
