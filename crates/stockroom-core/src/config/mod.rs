//! Runtime configuration for the remote store and the sync engine.
//!
//! Values come from the environment (`STOCKROOM_*`) or from JSON documents;
//! both paths go through the same validation.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::{is_http_url, normalize_text_option};

pub const ENV_REMOTE_URL: &str = "STOCKROOM_REMOTE_URL";
pub const ENV_REMOTE_KEY: &str = "STOCKROOM_REMOTE_KEY";
pub const ENV_CONNECTION_TIMEOUT_MS: &str = "STOCKROOM_CONNECTION_TIMEOUT_MS";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "STOCKROOM_REQUEST_TIMEOUT_MS";

const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("configuration value '{0}' is required")]
    Missing(&'static str),
    #[error("'{field}' must include http:// or https:// (got '{value}')")]
    InvalidUrl { field: &'static str, value: String },
    #[error("'{field}' must be a positive integer (got '{value}')")]
    InvalidNumber { field: &'static str, value: String },
}

/// Connection settings for the remote tabular store.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    /// Base URL of the project, e.g. `https://project.example.co`
    pub url: String,
    /// Public API key sent as `apikey` and bearer token
    pub api_key: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RemoteConfig")
            .field("url", &self.url)
            .field("api_key", &"[REDACTED]")
            .field("request_timeout_ms", &self.request_timeout_ms)
            .finish()
    }
}

const fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

const fn default_connection_timeout_ms() -> u64 {
    DEFAULT_CONNECTION_TIMEOUT_MS
}

impl RemoteConfig {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, ConfigError> {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
        .validated()
    }

    /// Normalize and check every field.
    pub fn validated(self) -> Result<Self, ConfigError> {
        let url = normalize_text_option(Some(self.url)).ok_or(ConfigError::Missing("url"))?;
        if !is_http_url(&url) {
            return Err(ConfigError::InvalidUrl {
                field: "url",
                value: url,
            });
        }
        let api_key =
            normalize_text_option(Some(self.api_key)).ok_or(ConfigError::Missing("api_key"))?;
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidNumber {
                field: "request_timeout_ms",
                value: "0".to_string(),
            });
        }

        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            api_key,
            request_timeout_ms: self.request_timeout_ms,
        })
    }

    /// Read from the process environment. `Ok(None)` when no URL is set.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Option<Self>, ConfigError> {
        let Some(url) = normalize_text_option(lookup(ENV_REMOTE_URL)) else {
            return Ok(None);
        };
        let api_key =
            normalize_text_option(lookup(ENV_REMOTE_KEY)).ok_or(ConfigError::Missing(ENV_REMOTE_KEY))?;
        let request_timeout_ms =
            parse_millis(lookup(ENV_REQUEST_TIMEOUT_MS), ENV_REQUEST_TIMEOUT_MS)?
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);

        Self {
            url,
            api_key,
            request_timeout_ms,
        }
        .validated()
        .map(Some)
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Sync engine tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Upper bound for a connectivity probe
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub const fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let connection_timeout_ms =
            parse_millis(lookup(ENV_CONNECTION_TIMEOUT_MS), ENV_CONNECTION_TIMEOUT_MS)?
                .unwrap_or(DEFAULT_CONNECTION_TIMEOUT_MS);
        Ok(Self {
            connection_timeout_ms,
        })
    }
}

fn parse_millis(raw: Option<String>, field: &'static str) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = normalize_text_option(raw) else {
        return Ok(None);
    };
    match raw.parse::<u64>() {
        Ok(value) if value > 0 => Ok(Some(value)),
        _ => Err(ConfigError::InvalidNumber { field, value: raw }),
    }
}
