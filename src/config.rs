use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, UserStoreError};

/// Main configuration structure for the user store client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: Backend,
    /// Falls back to the SDK's region chain when unset
    pub region: Option<String>,
    pub table_name: String,
    /// Alternate endpoint, e.g. DynamoDB Local
    pub endpoint_url: Option<String>,
    /// Items evaluated per scan page; unset lets the service decide
    pub scan_page_limit: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Dynamodb,
    /// In-process store, nothing leaves the machine
    Memory,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dynamodb" => Ok(Self::Dynamodb),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryMode {
    /// Fixed exponential schedule
    Standard,
    /// Backoff scaled by the observed failure rate
    Adaptive,
}

impl FromStr for RetryMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "standard" => Ok(Self::Standard),
            "adaptive" => Ok(Self::Adaptive),
            other => Err(format!("unknown retry mode '{other}'")),
        }
    }
}

impl fmt::Display for RetryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standard => f.write_str("standard"),
            Self::Adaptive => f.write_str("adaptive"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub mode: RetryMode,
    /// Total attempts including the first
    pub max_attempts: u32,
    pub max_backoff_ms: u64,
    pub base_delay_ms: u64,
    pub jitter: bool,
    /// Codes retried regardless of the base classification
    pub retryable_codes: Vec<String>,
    /// Deadline for a whole call, retries included
    pub call_timeout_ms: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Dynamodb,
            region: Some("us-west-2".to_string()),
            table_name: "Users".to_string(),
            endpoint_url: None,
            scan_page_limit: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            mode: RetryMode::Standard,
            max_attempts: 5,
            max_backoff_ms: 20_000,
            base_delay_ms: 1_000,
            jitter: true,
            retryable_codes: vec![
                "ProvisionedThroughputExceededException".to_string(),
                "ThrottlingException".to_string(),
                "RequestLimitExceeded".to_string(),
            ],
            call_timeout_ms: None,
        }
    }
}

impl RetryConfig {
    /// Same as the default but with adaptive backoff
    pub fn adaptive() -> Self {
        Self {
            mode: RetryMode::Adaptive,
            ..Self::default()
        }
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(UserStoreError::Config(
                "retry max_attempts must be at least 1".into(),
            ));
        }
        if self.max_backoff_ms == 0 {
            return Err(UserStoreError::Config(
                "retry max_backoff_ms must be positive".into(),
            ));
        }
        if self.base_delay_ms == 0 {
            return Err(UserStoreError::Config(
                "retry base_delay_ms must be positive".into(),
            ));
        }
        if self.call_timeout_ms == Some(0) {
            return Err(UserStoreError::Config(
                "retry call_timeout_ms must be positive when set".into(),
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from file with environment variable overrides
    /// Never fails; problems are logged and surface when the client is built
    pub fn load() -> Self {
        if dotenvy::dotenv().is_ok() {
            tracing::info!("Loaded .env from current directory");
        }

        let config_path =
            env::var("USERSTORE_CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());

        let mut config = if Path::new(&config_path).exists() {
            match fs::read_to_string(&config_path) {
                Ok(contents) => match Self::from_yaml(&contents) {
                    Ok(config) => {
                        tracing::info!("Loaded configuration from {}", config_path);
                        config
                    }
                    Err(e) => {
                        tracing::error!("{} in {} - using defaults", e, config_path);
                        Self::default()
                    }
                },
                Err(e) => {
                    tracing::error!(
                        "Failed to read config file {}: {} - using defaults",
                        config_path,
                        e
                    );
                    Self::default()
                }
            }
        } else {
            tracing::debug!("Config file not found at {} - using defaults", config_path);
            Self::default()
        };

        config.apply_overrides(|key| env::var(key).ok());

        if let Err(e) = config.validate() {
            tracing::warn!("Config validation warnings: {}", e);
        }

        config
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| UserStoreError::Config(format!("Failed to parse config: {e}")))
    }

    /// Apply overrides from a variable lookup (the process environment in `load`)
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(region) = lookup("AWS_REGION") {
            self.store.region = Some(region);
        }
        if let Some(table) = lookup("USERSTORE_TABLE") {
            self.store.table_name = table;
        }
        if let Some(url) = lookup("USERSTORE_ENDPOINT_URL") {
            self.store.endpoint_url = Some(url);
        }
        if let Some(backend) = lookup("USERSTORE_BACKEND") {
            match backend.parse() {
                Ok(backend) => self.store.backend = backend,
                Err(e) => tracing::warn!("Ignoring USERSTORE_BACKEND: {}", e),
            }
        }

        if let Some(mode) = lookup("USERSTORE_RETRY_MODE") {
            match mode.parse() {
                Ok(mode) => self.retry.mode = mode,
                Err(e) => tracing::warn!("Ignoring USERSTORE_RETRY_MODE: {}", e),
            }
        }
        if let Some(attempts) = lookup("USERSTORE_RETRY_MAX_ATTEMPTS") {
            if let Ok(attempts) = attempts.parse() {
                self.retry.max_attempts = attempts;
            }
        }
        if let Some(backoff) = lookup("USERSTORE_RETRY_MAX_BACKOFF_MS") {
            if let Ok(backoff) = backoff.parse() {
                self.retry.max_backoff_ms = backoff;
            }
        }
        if let Some(base) = lookup("USERSTORE_RETRY_BASE_DELAY_MS") {
            if let Ok(base) = base.parse() {
                self.retry.base_delay_ms = base;
            }
        }
        if let Some(codes) = lookup("USERSTORE_RETRY_CODES") {
            self.retry.retryable_codes = codes
                .split(',')
                .map(str::trim)
                .filter(|code| !code.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(timeout) = lookup("USERSTORE_CALL_TIMEOUT_MS") {
            if let Ok(timeout) = timeout.parse() {
                self.retry.call_timeout_ms = Some(timeout);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.table_name.trim().is_empty() {
            return Err(UserStoreError::Config("table_name cannot be empty".into()));
        }
        if let Some(region) = &self.store.region {
            if region.trim().is_empty() {
                return Err(UserStoreError::Config("region cannot be empty".into()));
            }
        }
        if let Some(limit) = self.store.scan_page_limit {
            if limit <= 0 {
                return Err(UserStoreError::Config(
                    "scan_page_limit must be positive".into(),
                ));
            }
        }
        self.retry.validate()
    }
}
