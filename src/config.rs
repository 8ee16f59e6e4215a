//! Configuration management for Turnstile.

use axum::http::HeaderName;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{Quota, DEFAULT_CLEANUP_INTERVAL};

/// Main configuration for the Turnstile server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_addr")]
    pub addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
        }
    }
}

fn default_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// How requests are grouped into rate limited keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Caller address, honouring `X-Forwarded-For` / `X-Real-IP`
    #[default]
    ClientAddr,
    /// Socket peer address only
    PeerAddr,
    /// Value of the request header named by `key_header`
    Header,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Requests allowed per period, also the burst size
    #[serde(default = "default_num_requests")]
    pub num_requests: u32,

    /// Refill period in milliseconds
    #[serde(default = "default_per_ms")]
    pub per_ms: u64,

    /// Interval between sweeps of expired limiters, in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Key derivation strategy
    #[serde(default)]
    pub key: KeyStrategy,

    /// Header read by the `header` strategy
    #[serde(default)]
    pub key_header: Option<String>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            num_requests: default_num_requests(),
            per_ms: default_per_ms(),
            cleanup_interval_secs: default_cleanup_interval(),
            key: KeyStrategy::default(),
            key_header: None,
        }
    }
}

fn default_num_requests() -> u32 {
    60
}

fn default_per_ms() -> u64 {
    60_000
}

fn default_cleanup_interval() -> u64 {
    DEFAULT_CLEANUP_INTERVAL.as_secs()
}

impl RateLimitingConfig {
    /// The configured quota, validated.
    pub fn quota(&self) -> Result<Quota> {
        Quota::new(self.num_requests, Duration::from_millis(self.per_ms))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// The header used by [`KeyStrategy::Header`].
    pub fn header_name(&self) -> Result<HeaderName> {
        let name = self.key_header.as_deref().ok_or_else(|| {
            TurnstileError::Config("key_header is required for the header strategy".to_string())
        })?;
        HeaderName::try_from(name)
            .map_err(|e| TurnstileError::Config(format!("Invalid key header '{}': {}", name, e)))
    }
}

impl TurnstileConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the values that would otherwise only fail once the server starts.
    pub fn validate(&self) -> Result<()> {
        self.rate_limiting.quota()?;
        if self.rate_limiting.cleanup_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "cleanup_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.rate_limiting.key == KeyStrategy::Header {
            self.rate_limiting.header_name()?;
        }
        Ok(())
    }
}
