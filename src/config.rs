//! Relay configuration
//!
//! ## Example
//!
//! ```rust,ignore
//! use chat_relay::config::RelayConfig;
//!
//! let config = RelayConfig::builder()
//!     .addr("0.0.0.0:8080".parse()?)
//!     .max_segments(3)
//!     .build();
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{RelayError, Result};
use crate::streaming::continuation::{ContinuationConfig, DEFAULT_SEGMENT_TIMEOUT};
use crate::telemetry::{OutputFormat, SubscriberConfig};

pub const DEFAULT_ADDR: &str = "127.0.0.1:5173";
pub const DEFAULT_PROVIDER: &str = "OpenAI";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Runtime configuration of the relay service.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address
    pub addr: SocketAddr,
    /// Continuation settings for `/api/chat`
    pub continuation: ContinuationConfig,
    /// Deadline for one upstream segment
    pub segment_timeout: Duration,
    /// Provider used when a chat request names none
    pub default_provider: String,
    /// Model used when a chat request names none
    pub default_model: String,
    pub telemetry: SubscriberConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 5173)),
            continuation: ContinuationConfig::default(),
            segment_timeout: DEFAULT_SEGMENT_TIMEOUT,
            default_provider: DEFAULT_PROVIDER.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            telemetry: SubscriberConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn builder() -> RelayConfigBuilder {
        RelayConfigBuilder::default()
    }

    /// Load configuration from `CHAT_RELAY_*` environment variables.
    ///
    /// Supported variables:
    /// - `CHAT_RELAY_ADDR`: listen address
    /// - `CHAT_RELAY_MAX_SEGMENTS`: segments chained per chat response
    /// - `CHAT_RELAY_MAX_TOKENS`: token budget per segment
    /// - `CHAT_RELAY_SEGMENT_TIMEOUT_SECS`: deadline per segment
    /// - `CHAT_RELAY_DEFAULT_PROVIDER` / `CHAT_RELAY_DEFAULT_MODEL`
    /// - `CHAT_RELAY_LOG_LEVEL`, `CHAT_RELAY_LOG_FORMAT`, `CHAT_RELAY_LOG_FILE`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`RelayConfig::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut builder = Self::builder();

        if let Some(addr) = get("CHAT_RELAY_ADDR") {
            builder = builder.addr(parse("CHAT_RELAY_ADDR", &addr)?);
        }
        if let Some(value) = get("CHAT_RELAY_MAX_SEGMENTS") {
            builder = builder.max_segments(parse("CHAT_RELAY_MAX_SEGMENTS", &value)?);
        }
        if let Some(value) = get("CHAT_RELAY_MAX_TOKENS") {
            builder = builder.max_tokens(parse("CHAT_RELAY_MAX_TOKENS", &value)?);
        }
        if let Some(value) = get("CHAT_RELAY_SEGMENT_TIMEOUT_SECS") {
            let secs: u64 = parse("CHAT_RELAY_SEGMENT_TIMEOUT_SECS", &value)?;
            builder = builder.segment_timeout(Duration::from_secs(secs));
        }
        if let Some(provider) = get("CHAT_RELAY_DEFAULT_PROVIDER") {
            builder = builder.default_provider(provider);
        }
        if let Some(model) = get("CHAT_RELAY_DEFAULT_MODEL") {
            builder = builder.default_model(model);
        }

        let mut telemetry = SubscriberConfig::builder();
        if let Some(level) = get("CHAT_RELAY_LOG_LEVEL") {
            telemetry = telemetry.log_level_str(&level)?;
        }
        if let Some(format) = get("CHAT_RELAY_LOG_FORMAT") {
            telemetry = telemetry.output_format(OutputFormat::from_str(&format)?);
        }
        if let Some(file) = get("CHAT_RELAY_LOG_FILE") {
            telemetry = telemetry.log_file(PathBuf::from(file));
        }

        let config = builder.telemetry(telemetry.build()).build();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.continuation.max_segments == 0 {
            return Err(RelayError::ConfigurationError(
                "max_segments must be at least 1".into(),
            ));
        }
        if self.continuation.max_tokens == 0 {
            return Err(RelayError::ConfigurationError(
                "max_tokens must be at least 1".into(),
            ));
        }
        if self.segment_timeout.is_zero() {
            return Err(RelayError::ConfigurationError(
                "segment timeout must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| RelayError::ConfigurationError(format!("invalid {key} '{value}': {e}")))
}

/// Builder for [`RelayConfig`]
#[derive(Debug, Default)]
pub struct RelayConfigBuilder {
    addr: Option<SocketAddr>,
    max_segments: Option<usize>,
    max_tokens: Option<u32>,
    segment_timeout: Option<Duration>,
    default_provider: Option<String>,
    default_model: Option<String>,
    telemetry: Option<SubscriberConfig>,
}

impl RelayConfigBuilder {
    pub fn addr(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }

    pub fn max_segments(mut self, max_segments: usize) -> Self {
        self.max_segments = Some(max_segments);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn segment_timeout(mut self, timeout: Duration) -> Self {
        self.segment_timeout = Some(timeout);
        self
    }

    pub fn default_provider(mut self, provider: impl Into<String>) -> Self {
        self.default_provider = Some(provider.into());
        self
    }

    pub fn default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn telemetry(mut self, telemetry: SubscriberConfig) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn build(self) -> RelayConfig {
        let defaults = RelayConfig::default();
        RelayConfig {
            addr: self.addr.unwrap_or(defaults.addr),
            continuation: ContinuationConfig {
                max_segments: self
                    .max_segments
                    .unwrap_or(defaults.continuation.max_segments),
                max_tokens: self.max_tokens.unwrap_or(defaults.continuation.max_tokens),
            },
            segment_timeout: self.segment_timeout.unwrap_or(defaults.segment_timeout),
            default_provider: self.default_provider.unwrap_or(defaults.default_provider),
            default_model: self.default_model.unwrap_or(defaults.default_model),
            telemetry: self.telemetry.unwrap_or(defaults.telemetry),
        }
    }
}
