//! Configuration management for the deploy controller
//!
//! Loads configuration from environment variables with sensible defaults.

use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// API server host
    pub api_host: String,

    /// API server port
    pub api_port: u16,

    /// Registry host[:port], as it appears in image references
    pub registry_url: String,

    /// Scheme used for registry API calls
    pub registry_scheme: String,

    /// Build service base URL
    pub forge_url: String,

    /// Namespace listed by the read-model sync and used as default namespace
    pub namespace: String,

    /// Registry digest polling interval in seconds
    pub registry_poll_interval_secs: u64,

    /// Read-model sync interval in seconds
    pub sync_interval_secs: u64,

    /// Timeout of every outbound HTTP call in seconds
    pub http_timeout_secs: u64,

    /// Window in which a repeated (target, digest) dispatch is suppressed; 0 disables
    pub dedup_window_secs: u64,

    /// Whether to use in-memory registry, cluster and build service
    pub mock_mode: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenvy::dotenv().ok();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let config = Config {
            api_host: var("API_HOST", "0.0.0.0"),

            api_port: var("PORT", "8080").parse().context("Invalid PORT")?,

            registry_url: var("REGISTRY_URL", "10.110.67.87:5000"),

            registry_scheme: var("REGISTRY_SCHEME", "http"),

            forge_url: var("FORGE_URL", "http://forge.holm.svc.cluster.local"),

            namespace: var("MANAGED_NAMESPACE", "holm"),

            registry_poll_interval_secs: var("REGISTRY_POLL_INTERVAL_SECS", "30")
                .parse()
                .context("Invalid REGISTRY_POLL_INTERVAL_SECS")?,

            sync_interval_secs: var("SYNC_INTERVAL_SECS", "10")
                .parse()
                .context("Invalid SYNC_INTERVAL_SECS")?,

            http_timeout_secs: var("HTTP_TIMEOUT_SECS", "5")
                .parse()
                .context("Invalid HTTP_TIMEOUT_SECS")?,

            dedup_window_secs: var("DEDUP_WINDOW_SECS", "120")
                .parse()
                .context("Invalid DEDUP_WINDOW_SECS")?,

            mock_mode: var("MOCK_MODE", "false")
                .parse()
                .context("Invalid MOCK_MODE (expected true/false)")?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.api_port == 0 {
            anyhow::bail!("PORT must be greater than 0");
        }

        if self.registry_poll_interval_secs == 0 || self.sync_interval_secs == 0 {
            anyhow::bail!("Polling intervals must be greater than 0");
        }

        if self.http_timeout_secs == 0 {
            anyhow::bail!("HTTP_TIMEOUT_SECS must be greater than 0");
        }

        if self.registry_url.is_empty() {
            anyhow::bail!("REGISTRY_URL must not be empty");
        }

        Ok(())
    }

    /// Get the API server address
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }

    /// Base URL of the registry v2 API
    pub fn registry_api_base(&self) -> String {
        format!("{}://{}", self.registry_scheme, self.registry_url)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }
}
