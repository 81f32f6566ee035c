//! Layered configuration.
//!
//! Sources, highest priority first:
//! 1. `HOOKLINE_API_URL` (endpoint only)
//! 2. user config file (`<data-dir>/config.json`)
//! 3. bundled config file shipped next to the binary
//! 4. hard-coded defaults
//!
//! Each source yields a partial [`ConfigLayer`]; layers are merged field by
//! field. A source that is missing, unreadable or invalid is skipped with a
//! warning. Resolution itself never fails.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::queue::RetryPolicy;

pub const API_URL_ENV: &str = "HOOKLINE_API_URL";

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api/v1";
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 10;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_PROCESSING_TIMEOUT_MINUTES: u64 = 5;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 2_000;
pub const DEFAULT_RETRY_MAX_DELAY_SECS: u64 = 300;

/// Frozen, fully resolved configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Without trailing slash.
    pub api_base_url: String,
    pub max_retry_count: u32,
    pub request_timeout: Duration,
    pub processing_timeout: Duration,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        ConfigLayer::defaults().freeze()
    }
}

impl Config {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retry_count: self.max_retry_count,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
            ..RetryPolicy::default()
        }
    }
}

/// One source's contribution. Absent keys leave lower layers in charge.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ConfigLayer {
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub max_retry_count: Option<u32>,
    /// Seconds.
    #[serde(default)]
    pub request_timeout: Option<u64>,
    #[serde(default)]
    pub processing_timeout_minutes: Option<u64>,
    #[serde(default)]
    pub retry_base_delay_ms: Option<u64>,
    #[serde(default)]
    pub retry_max_delay_seconds: Option<u64>,
}

impl ConfigLayer {
    pub fn defaults() -> Self {
        Self {
            api_base_url: Some(DEFAULT_API_BASE_URL.to_string()),
            max_retry_count: Some(DEFAULT_MAX_RETRY_COUNT),
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT_SECS),
            processing_timeout_minutes: Some(DEFAULT_PROCESSING_TIMEOUT_MINUTES),
            retry_base_delay_ms: Some(DEFAULT_RETRY_BASE_DELAY_MS),
            retry_max_delay_seconds: Some(DEFAULT_RETRY_MAX_DELAY_SECS),
        }
    }

    /// Fill fields unset here from `lower`.
    pub fn or(self, lower: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            api_base_url: self.api_base_url.or(lower.api_base_url),
            max_retry_count: self.max_retry_count.or(lower.max_retry_count),
            request_timeout: self.request_timeout.or(lower.request_timeout),
            processing_timeout_minutes: self
                .processing_timeout_minutes
                .or(lower.processing_timeout_minutes),
            retry_base_delay_ms: self.retry_base_delay_ms.or(lower.retry_base_delay_ms),
            retry_max_delay_seconds: self.retry_max_delay_seconds.or(lower.retry_max_delay_seconds),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(url) = &self.api_base_url {
            validate_url(url)?;
        }
        for (field, value) in [
            ("request_timeout", self.request_timeout),
            ("processing_timeout_minutes", self.processing_timeout_minutes),
            ("retry_max_delay_seconds", self.retry_max_delay_seconds),
        ] {
            if value == Some(0) {
                return Err(ConfigError::Invalid {
                    field,
                    message: "must be greater than zero".into(),
                });
            }
        }
        Ok(())
    }

    /// Turn a merged layer into a `Config`, using defaults for any gap.
    pub fn freeze(self) -> Config {
        let merged = self.or(ConfigLayer::defaults());
        let minutes = merged
            .processing_timeout_minutes
            .unwrap_or(DEFAULT_PROCESSING_TIMEOUT_MINUTES);
        Config {
            api_base_url: merged
                .api_base_url
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            max_retry_count: merged.max_retry_count.unwrap_or(DEFAULT_MAX_RETRY_COUNT),
            request_timeout: Duration::from_secs(
                merged.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
            processing_timeout: Duration::from_secs(minutes.saturating_mul(60)),
            retry_base_delay: Duration::from_millis(
                merged.retry_base_delay_ms.unwrap_or(DEFAULT_RETRY_BASE_DELAY_MS),
            ),
            retry_max_delay: Duration::from_secs(
                merged
                    .retry_max_delay_seconds
                    .unwrap_or(DEFAULT_RETRY_MAX_DELAY_SECS),
            ),
        }
    }
}

fn validate_url(raw: &str) -> Result<(), ConfigError> {
    let invalid = |message: String| ConfigError::Invalid {
        field: "api_base_url",
        message,
    };
    let url = reqwest::Url::parse(raw).map_err(|e| invalid(format!("{raw}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("{raw}: scheme must be http or https")));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid(format!("{raw}: missing host")));
    }
    Ok(())
}

/// A configuration source.
pub trait ConfigProvider: Send + Sync {
    /// Used in log lines.
    fn name(&self) -> String;

    /// `Ok(None)` when the source simply is not there.
    fn load(&self) -> Result<Option<ConfigLayer>, ConfigError>;
}

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Endpoint override from the environment.
pub struct EnvProvider {
    lookup: Lookup,
}

impl EnvProvider {
    pub fn new() -> Self {
        Self::with_lookup(|key| std::env::var(key).ok())
    }

    /// Custom variable source, so tests do not touch the process environment.
    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            lookup: Box::new(lookup),
        }
    }
}

impl Default for EnvProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigProvider for EnvProvider {
    fn name(&self) -> String {
        format!("env {API_URL_ENV}")
    }

    fn load(&self) -> Result<Option<ConfigLayer>, ConfigError> {
        Ok((self.lookup)(API_URL_ENV)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(|url| ConfigLayer {
                api_base_url: Some(url),
                ..Default::default()
            }))
    }
}

/// A JSON object with any subset of the `ConfigLayer` keys.
pub struct JsonFileProvider {
    path: PathBuf,
}

impl JsonFileProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigProvider for JsonFileProvider {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn load(&self) -> Result<Option<ConfigLayer>, ConfigError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| ConfigError::Parse {
                path: self.path.clone(),
                source,
            })
    }
}

pub struct DefaultsProvider;

impl ConfigProvider for DefaultsProvider {
    fn name(&self) -> String {
        "defaults".to_string()
    }

    fn load(&self) -> Result<Option<ConfigLayer>, ConfigError> {
        Ok(Some(ConfigLayer::defaults()))
    }
}

/// Ordered list of providers, highest priority first.
pub struct ConfigResolver {
    providers: Vec<Box<dyn ConfigProvider>>,
}

impl ConfigResolver {
    pub fn new(providers: Vec<Box<dyn ConfigProvider>>) -> Self {
        Self { providers }
    }

    /// env > user file > bundled file (when given) > defaults.
    pub fn standard(user_config: impl Into<PathBuf>, bundled_config: Option<PathBuf>) -> Self {
        let mut providers: Vec<Box<dyn ConfigProvider>> = vec![
            Box::new(EnvProvider::new()),
            Box::new(JsonFileProvider::new(user_config)),
        ];
        if let Some(bundled) = bundled_config {
            providers.push(Box::new(JsonFileProvider::new(bundled)));
        }
        providers.push(Box::new(DefaultsProvider));
        Self::new(providers)
    }

    pub fn resolve(&self) -> Config {
        let mut merged = ConfigLayer::default();
        for provider in &self.providers {
            let layer = match provider.load().and_then(|layer| {
                if let Some(layer) = &layer {
                    layer.validate()?;
                }
                Ok(layer)
            }) {
                Ok(Some(layer)) => layer,
                Ok(None) => {
                    debug!(source = %provider.name(), "config source not present");
                    continue;
                }
                Err(e) => {
                    warn!(source = %provider.name(), error = %e, "skipping config source");
                    continue;
                }
            };
            merged = merged.or(layer);
        }
        merged.freeze()
    }
}
