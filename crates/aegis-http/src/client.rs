//! HTTP client with timeout, retry and bearer credentials.
//!
//! Retries of one logical call are strictly sequential: the next attempt is
//! only issued after the previous one failed and its backoff delay elapsed.

use crate::envelope::{normalize, ApiResponse};
use crate::error::{ApiError, HttpError, HttpResult};
use aegis_core::{next_delay, should_retry, RetryPolicy};
use aegis_telemetry::Metrics;
use reqwest::header::ACCEPT;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Header carrying the per-call correlation id.
const REQUEST_ID_HEADER: &str = "x-request-id";

fn default_timeout_ms() -> u64 {
    10_000
}

/// HTTP client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Backend base URL (e.g., "https://platform.example.com/api").
    #[serde(default)]
    pub base_url: String,
    /// Per-call timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Source of the bearer token attached to outgoing calls.
///
/// Read on every attempt; the client never stores or mutates it.
pub trait CredentialSource: Send + Sync {
    /// Current bearer token, if the principal is authenticated.
    fn bearer_token(&self) -> Option<Zeroizing<String>>;
}

/// Credential source that never supplies a token.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

impl CredentialSource for NoCredentials {
    fn bearer_token(&self) -> Option<Zeroizing<String>> {
        None
    }
}

/// Per-call options.
#[derive(Clone)]
pub struct RequestOptions {
    /// Overrides the configured timeout.
    pub timeout: Option<Duration>,
    /// Retry transient failures.
    pub retry: bool,
    /// Attach the bearer credential when available.
    pub authenticated: bool,
    /// Token used instead of the credential source for this call.
    pub bearer: Option<Zeroizing<String>>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            retry: true,
            authenticated: true,
            bearer: None,
        }
    }
}

impl std::fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOptions")
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("authenticated", &self.authenticated)
            .field("bearer", &self.bearer.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl RequestOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn without_retry(mut self) -> Self {
        self.retry = false;
        self
    }

    /// Do not attach the bearer credential.
    pub fn anonymous(mut self) -> Self {
        self.authenticated = false;
        self
    }

    /// Authenticate this call with `token` rather than the credential source.
    pub fn with_bearer(mut self, token: Zeroizing<String>) -> Self {
        self.authenticated = true;
        self.bearer = Some(token);
        self
    }
}

/// HTTP request client.
///
/// Cheap to clone; clones share the connection pool, policy and credentials.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    timeout: Duration,
    policy: Arc<RetryPolicy>,
    credentials: Arc<dyn CredentialSource>,
    metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    /// Create a new client.
    ///
    /// # Arguments
    /// * `config` - Base URL and default timeout
    /// * `policy` - Retry policy shared with other components
    /// * `credentials` - Bearer token source (usually the session)
    pub fn new(
        config: &HttpConfig,
        policy: Arc<RetryPolicy>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Result<Self, HttpError> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(HttpError::InvalidUrl(config.base_url.clone()));
        }

        let client = Client::builder()
            .build()
            .map_err(|e| HttpError::Client(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            timeout: Duration::from_millis(config.timeout_ms),
            policy,
            credentials,
            metrics: None,
        })
    }

    /// Attach a metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Retry policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Issue a request, retrying transient failures per the retry policy.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        options: RequestOptions,
    ) -> HttpResult<ApiResponse> {
        let url = self.url(path);
        let request_id = Uuid::new_v4();
        let timeout = options.timeout.unwrap_or(self.timeout);
        let started = Instant::now();
        let mut attempt = 0u32;

        let result = loop {
            debug!(%method, %url, %request_id, attempt, "Sending HTTP request");

            match self
                .send_once(&method, &url, body, &options, timeout, request_id)
                .await
            {
                Ok(response) => break Ok(response),
                Err(err) => {
                    if !(options.retry && should_retry(&self.policy, attempt, err.kind)) {
                        break Err(err);
                    }

                    let delay = next_delay(&self.policy, attempt);
                    warn!(
                        %method,
                        %url,
                        %request_id,
                        attempt,
                        kind = %err.kind,
                        delay_ms = delay.as_millis() as u64,
                        "Transient HTTP failure, retrying"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.http_retry();
                    }
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        };

        if let Some(metrics) = &self.metrics {
            let outcome = match &result {
                Ok(_) => "ok".to_string(),
                Err(err) => err.kind.to_string(),
            };
            metrics.http_request(&outcome);
            metrics.http_latency(method.as_str(), started.elapsed().as_secs_f64() * 1000.0);
        }

        if let Err(err) = &result {
            warn!(%method, %url, %request_id, attempts = attempt + 1, kind = %err.kind, status = ?err.status, "HTTP request failed");
        }

        result
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &str,
        body: Option<&Value>,
        options: &RequestOptions,
        timeout: Duration,
        request_id: Uuid,
    ) -> HttpResult<ApiResponse> {
        let mut builder = self
            .client
            .request(method.clone(), url)
            .header(ACCEPT, "application/json")
            .header(REQUEST_ID_HEADER, request_id.to_string());

        if options.authenticated {
            let token = options
                .bearer
                .clone()
                .or_else(|| self.credentials.bearer_token());
            if let Some(token) = token {
                builder = builder.bearer_auth(token.as_str());
            }
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        // Dropping the exchange future on timeout aborts the in-flight call.
        let exchange = async {
            let response = builder.send().await?;
            let status = response.status().as_u16();
            let bytes = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, bytes))
        };

        let (status, bytes) = match tokio::time::timeout(timeout, exchange).await {
            Err(_) => return Err(ApiError::timeout(timeout)),
            Ok(Err(e)) => return Err(ApiError::from_transport(&e)),
            Ok(Ok(pair)) => pair,
        };

        normalize(status, &bytes)
    }

    pub async fn get(&self, path: &str) -> HttpResult<ApiResponse> {
        self.request(Method::GET, path, None, RequestOptions::default())
            .await
    }

    pub async fn post(&self, path: &str, body: &Value) -> HttpResult<ApiResponse> {
        self.request(Method::POST, path, Some(body), RequestOptions::default())
            .await
    }

    pub async fn put(&self, path: &str, body: &Value) -> HttpResult<ApiResponse> {
        self.request(Method::PUT, path, Some(body), RequestOptions::default())
            .await
    }

    pub async fn delete(&self, path: &str) -> HttpResult<ApiResponse> {
        self.request(Method::DELETE, path, None, RequestOptions::default())
            .await
    }

    /// GET and deserialize the unwrapped payload.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> HttpResult<T> {
        self.get(path).await?.json()
    }

    /// POST a serializable body and deserialize the unwrapped payload.
    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        options: RequestOptions,
    ) -> HttpResult<T> {
        let body = serde_json::to_value(body).map_err(|e| {
            ApiError::new(
                aegis_core::FailureKind::InvalidRequest,
                format!("Failed to serialize request body: {e}"),
            )
        })?;
        self.request(Method::POST, path, Some(&body), options)
            .await?
            .json()
    }
}
