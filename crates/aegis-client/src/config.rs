//! Application configuration.
//!
//! Layered with the `config` crate: an optional TOML file, then environment
//! overrides such as `AEGIS__HTTP__TIMEOUT_MS=5000`.

use crate::error::{AppError, AppResult};
use aegis_core::RetryPolicy;
use aegis_http::HttpConfig;
use aegis_session::SessionConfig;
use aegis_ws::WsConfig;
use config::{Config, ConfigBuilder, Environment, File, FileFormat, Map};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "AEGIS";

/// A named channel endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    /// `ws://` or `wss://` URL.
    pub url: String,
}

/// Top-level configuration. Every section is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub retry: RetryPolicy,
    pub ws: WsConfig,
    pub session: SessionConfig,
    pub channels: Vec<ChannelConfig>,
}

impl AppConfig {
    /// Load from an optional TOML file plus `AEGIS__*` environment overrides.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }
        Self::build(builder.add_source(environment(None)))
    }

    /// Parse a TOML document, applying `overrides` as if they were
    /// environment variables.
    pub fn from_toml_str(toml: &str, overrides: Option<Map<String, String>>) -> AppResult<Self> {
        let builder = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .add_source(environment(overrides));
        Self::build(builder)
    }

    fn build(builder: ConfigBuilder<config::builder::DefaultState>) -> AppResult<Self> {
        let config: Self = builder
            .build()
            .map_err(|e| AppError::Config(format!("Failed to load config: {e}")))?
            .try_deserialize()
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the components cannot run with.
    pub fn validate(&self) -> AppResult<()> {
        if self.http.base_url.trim().is_empty() {
            return Err(AppError::Config("http.base_url must be set".to_string()));
        }
        if self.http.timeout_ms == 0 {
            return Err(AppError::Config("http.timeout_ms must be positive".to_string()));
        }

        self.retry.validate()?;

        if self.ws.heartbeat_interval_ms == 0
            || self.ws.heartbeat_timeout_ms == 0
            || self.ws.connect_timeout_ms == 0
        {
            return Err(AppError::Config(
                "ws heartbeat and connect timeouts must be positive".to_string(),
            ));
        }

        self.session.validate()?;

        let mut seen = HashSet::new();
        for channel in &self.channels {
            if channel.name.trim().is_empty() {
                return Err(AppError::Config("channel name must not be empty".to_string()));
            }
            if !seen.insert(channel.name.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate channel name: {}",
                    channel.name
                )));
            }
            if !(channel.url.starts_with("ws://") || channel.url.starts_with("wss://")) {
                return Err(AppError::Config(format!(
                    "channel {} has a non-WebSocket URL: {}",
                    channel.name, channel.url
                )));
            }
        }

        Ok(())
    }

    /// Configured URL for a channel name.
    pub fn channel_url(&self, name: &str) -> Option<&str> {
        self.channels
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.url.as_str())
    }

    /// Render the effective configuration.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| AppError::Config(format!("Failed to render config: {e}")))
    }
}

fn environment(source: Option<Map<String, String>>) -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
        .source(source)
}
