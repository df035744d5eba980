//! Configuration loader and validator for the timeout migrator.
use crate::storage::DEFAULT_PAGE_SIZE;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const SOURCE_URL_ENV: &str = "SOURCE_DATABASE_URL";
pub const TARGET_URL_ENV: &str = "TARGET_DATABASE_URL";

/// Largest `max_delay_seconds` a `chrono::Duration` can hold.
pub const MAX_DELAY_SECONDS_LIMIT: u64 = (i64::MAX / 1_000) as u64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Contents of `config.yaml`: where timeouts are read from and where they are delivered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub source: Source,
    pub target: Target,
}

/// Legacy timeout store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Source {
    pub database_url: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

/// Transport database holding native delayed delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    pub database_url: String,
    #[serde(default)]
    pub max_delay_seconds: Option<u64>,
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

impl Config {
    /// Source URL, with `SOURCE_DATABASE_URL` taking precedence over the file.
    pub fn source_url(&self) -> String {
        std::env::var(SOURCE_URL_ENV).unwrap_or_else(|_| self.source.database_url.clone())
    }

    /// Transport maximum delay, if one is configured.
    pub fn max_delay(&self) -> Option<chrono::Duration> {
        self.target
            .max_delay_seconds
            .and_then(|secs| i64::try_from(secs).ok())
            .filter(|secs| *secs as u64 <= MAX_DELAY_SECONDS_LIMIT)
            .map(chrono::Duration::seconds)
    }

    /// Target URL, with `TARGET_DATABASE_URL` taking precedence over the file.
    pub fn target_url(&self) -> String {
        std::env::var(TARGET_URL_ENV).unwrap_or_else(|_| self.target.database_url.clone())
    }
}

/// Read and validate the YAML config; `config.yaml` in the working directory when `path` is None.
/// The URL environment overrides are applied later by `source_url`/`target_url`.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.source.database_url.trim().is_empty() {
        return Err(ConfigError::Invalid("source.database_url must be non-empty"));
    }
    if cfg.source.page_size == 0 {
        return Err(ConfigError::Invalid("source.page_size must be > 0"));
    }
    if cfg.target.database_url.trim().is_empty() {
        return Err(ConfigError::Invalid("target.database_url must be non-empty"));
    }
    match cfg.target.max_delay_seconds {
        Some(0) => return Err(ConfigError::Invalid("target.max_delay_seconds must be > 0 when set")),
        Some(secs) if secs > MAX_DELAY_SECONDS_LIMIT => {
            return Err(ConfigError::Invalid("target.max_delay_seconds is too large"))
        }
        _ => {}
    }
    Ok(())
}

pub fn example() -> &'static str {
    r#"source:
  database_url: "sqlite://./data/timeouts.db"
  page_size: 500

target:
  database_url: "sqlite://./data/transport.db"
  # Longest delay the transport accepts; omit for no limit.
  max_delay_seconds: 2147483647
"#
}
