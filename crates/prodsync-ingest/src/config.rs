//! Ingestion configuration
//!
//! Loaded from environment variables (a `.env` file is read first by the binary) and
//! validated before any fetch begins. Every missing required variable is reported in
//! one [`ConfigError::Missing`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::rate_limit::RateLimitConfig;
use crate::retry::RetryPolicy;
use crate::sources::MAX_PAGE_SIZE;

pub const DEFAULT_PAGE_SIZE: usize = MAX_PAGE_SIZE;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONSUMER_BATCH_SIZE: usize = 100;
pub const DEFAULT_SNAPSHOT_PATH: &str = "./data/canonical.snapshot.json";
pub const DEFAULT_SINK_DIR: &str = "./data/batches";
pub const DEFAULT_INDEX_NAME: &str = "products";

/// Where merged records are uploaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Http,
    Directory,
}

impl FromStr for SinkKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "http" | "index" => Ok(SinkKind::Http),
            "directory" | "dir" | "file" => Ok(SinkKind::Directory),
            other => Err(ConfigError::invalid(
                "PRODSYNC_SINK",
                format!("unknown sink '{}', expected http or directory", other),
            )),
        }
    }
}

/// Credentials and location of the HTTP index
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexConfig {
    pub app_id: String,
    pub api_key: String,
    pub index_name: String,
    pub base_url: String,
}

impl std::fmt::Debug for IndexConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexConfig")
            .field("app_id", &self.app_id)
            .field("api_key", &"<redacted>")
            .field("index_name", &self.index_name)
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Main ingestion configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestConfig {
    /// URL or file path of the paginated source
    pub paged_source: String,
    /// URL or file path of the XML catalog
    pub catalog_source: String,
    /// JSON-lines event file replayed by `sync` and `consume`
    pub events_source: Option<PathBuf>,
    pub page_size: usize,
    pub rate_limit_max_calls: usize,
    pub rate_limit_period: Duration,
    /// HTTP timeout for source requests
    pub fetch_timeout: Duration,
    pub max_retries: u32,
    pub batch_size: usize,
    /// Bound on the final-batch completion wait
    pub completion_timeout: Duration,
    /// Buffered events that trigger a consumer flush
    pub consumer_batch_size: usize,
    pub snapshot_path: PathBuf,
    pub sink: SinkKind,
    pub sink_dir: PathBuf,
    /// Present when `sink` is `http`
    pub index: Option<IndexConfig>,
}

impl IngestConfig {
    /// Load from the process environment and validate
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary variable lookup and validate
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut missing = Vec::new();

        let mut required = |key: &str| match get(key) {
            Some(value) => value,
            None => {
                missing.push(key.to_string());
                String::new()
            },
        };

        let paged_source = required("PRODSYNC_PAGED_SOURCE");
        let catalog_source = required("PRODSYNC_CATALOG_SOURCE");

        let sink = match get("PRODSYNC_SINK") {
            Some(value) => value.parse()?,
            None => SinkKind::Http,
        };

        let index = if sink == SinkKind::Http {
            let app_id = required("INDEX_APP_ID");
            let api_key = required("INDEX_API_KEY");
            let base_url = get("INDEX_BASE_URL")
                .unwrap_or_else(|| format!("https://{}.index.example.net", app_id));
            Some(IndexConfig {
                app_id,
                api_key,
                index_name: get("INDEX_NAME").unwrap_or_else(|| DEFAULT_INDEX_NAME.to_string()),
                base_url,
            })
        } else {
            None
        };

        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let config = Self {
            paged_source,
            catalog_source,
            events_source: get("PRODSYNC_EVENTS_SOURCE").map(PathBuf::from),
            page_size: parse_or(&get, "PRODSYNC_PAGE_SIZE", DEFAULT_PAGE_SIZE)?,
            rate_limit_max_calls: parse_or(
                &get,
                "PRODSYNC_RATE_MAX_CALLS",
                crate::rate_limit::DEFAULT_MAX_CALLS,
            )?,
            rate_limit_period: Duration::from_millis(parse_or(
                &get,
                "PRODSYNC_RATE_PERIOD_MS",
                crate::rate_limit::DEFAULT_PERIOD.as_millis() as u64,
            )?),
            fetch_timeout: Duration::from_secs(parse_or(
                &get,
                "PRODSYNC_FETCH_TIMEOUT_SECS",
                DEFAULT_FETCH_TIMEOUT_SECS,
            )?),
            max_retries: parse_or(&get, "PRODSYNC_MAX_RETRIES", crate::retry::MAX_RETRIES)?,
            batch_size: parse_or(
                &get,
                "PRODSYNC_BATCH_SIZE",
                crate::uploader::DEFAULT_MAX_BATCH_SIZE,
            )?,
            completion_timeout: Duration::from_secs(parse_or(
                &get,
                "PRODSYNC_COMPLETION_TIMEOUT_SECS",
                crate::uploader::DEFAULT_COMPLETION_TIMEOUT.as_secs(),
            )?),
            consumer_batch_size: parse_or(
                &get,
                "PRODSYNC_CONSUMER_BATCH_SIZE",
                DEFAULT_CONSUMER_BATCH_SIZE,
            )?,
            snapshot_path: get("PRODSYNC_SNAPSHOT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_PATH)),
            sink,
            sink_dir: get("PRODSYNC_SINK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SINK_DIR)),
            index,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::invalid(
                "PRODSYNC_PAGE_SIZE",
                format!("must be between 1 and {}", MAX_PAGE_SIZE),
            ));
        }
        if self.rate_limit_max_calls == 0 {
            return Err(ConfigError::invalid("PRODSYNC_RATE_MAX_CALLS", "must be at least 1"));
        }
        if self.rate_limit_period.is_zero() {
            return Err(ConfigError::invalid("PRODSYNC_RATE_PERIOD_MS", "must be positive"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("PRODSYNC_BATCH_SIZE", "must be at least 1"));
        }
        if self.consumer_batch_size == 0 {
            return Err(ConfigError::invalid(
                "PRODSYNC_CONSUMER_BATCH_SIZE",
                "must be at least 1",
            ));
        }
        if self.completion_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "PRODSYNC_COMPLETION_TIMEOUT_SECS",
                "must be positive",
            ));
        }
        if self.sink == SinkKind::Http && self.index.is_none() {
            return Err(ConfigError::Missing(vec![
                "INDEX_APP_ID".to_string(),
                "INDEX_API_KEY".to_string(),
            ]));
        }
        Ok(())
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_calls: self.rate_limit_max_calls,
            period: self.rate_limit_period,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries)
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(key, format!("'{}': {}", raw, e))),
        None => Ok(default),
    }
}
