use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("public_host must not be empty")]
    EmptyPublicHost,

    #[error("public_host must be a bare hostname, not {0}")]
    PublicHostNotBare(String),

    #[error("Delivery attempts must be at least 1")]
    NoAttempts,
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// Ingest router configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Main listener for incoming events
    pub listener: Listener,
    /// Public ingest hostname; subdomains of it address streams by id
    pub public_host: String,
    /// Whether a write key without a secret part may address a stream by id
    #[serde(default = "default_true")]
    pub allow_bare_write_keys: bool,
    /// Downstream ingestion service
    pub bulker: BulkerConfig,
}

/// Connection settings for the downstream ingestion service
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct BulkerConfig {
    /// Base URL of the service
    ///
    /// Note: Uses the `url::Url` type for compile-time URL validation.
    /// Invalid URLs will be rejected during config deserialization.
    pub base_url: Url,
    /// Bearer token sent with each forward, if set
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Per-attempt request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Total delivery attempts per event
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Backoff unit in milliseconds; attempt k waits 2^(k-2) units
    #[serde(default = "default_base_retry_ms")]
    pub base_retry_ms: u64,
}

impl BulkerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn base_retry(&self) -> Duration {
        Duration::from_millis(self.base_retry_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_attempts() -> u32 {
    3
}

fn default_base_retry_ms() -> u64 {
    1000
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;

        if self.public_host.is_empty() {
            return Err(ValidationError::EmptyPublicHost);
        }
        if self.public_host.contains('/') || self.public_host.contains(':') {
            return Err(ValidationError::PublicHostNotBare(self.public_host.clone()));
        }
        if self.bulker.attempts == 0 {
            return Err(ValidationError::NoAttempts);
        }

        Ok(())
    }
}
