//! Transport options.
//!
//! Caller-supplied tuning is kept in [`StreamsOptions`] (every field optional)
//! and merged with defaults into [`ResolvedOptions`] once, at client/server
//! construction. Options can also be loaded from YAML and environment
//! variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};
use crate::naming;

/// Default Redis connection URL.
pub const DEFAULT_URL: &str = "redis://127.0.0.1:6379";
/// Default namespace for stream names.
pub const DEFAULT_STREAM_PREFIX: &str = "_microservices";
/// Default consumer group shared by server instances.
pub const DEFAULT_CONSUMER_GROUP: &str = "redstream";
/// Default blocking-read timeout.
pub const DEFAULT_BLOCK_TIMEOUT_MS: u64 = 100;
/// Default number of entries per read.
pub const DEFAULT_BATCH_SIZE: usize = 50;
/// Default approximate maximum stream length applied on every append.
pub const DEFAULT_MAX_STREAM_LENGTH: usize = 10_000;
/// Default delay before retrying a failed read.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 250;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "redstream.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "REDSTREAM_CONFIG";
/// Prefix for configuration environment variables (`REDSTREAM__BATCH_SIZE=10`).
pub const CONFIG_ENV_PREFIX: &str = "REDSTREAM";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "REDSTREAM_LOG";

/// Caller-supplied transport options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamsOptions {
    /// Redis connection URL.
    pub url: Option<String>,
    /// Logical database index, overriding the one in `url`.
    pub database: Option<i64>,
    /// Namespace prepended to every stream name.
    pub stream_prefix: Option<String>,
    /// Consumer group joined by servers.
    pub consumer_group: Option<String>,
    /// Consumer name within the group. Empty means derive one.
    pub consumer_name: Option<String>,
    /// Blocking-read timeout in milliseconds.
    pub block_timeout_ms: Option<u64>,
    /// Maximum entries returned per read.
    pub batch_size: Option<usize>,
    /// Approximate maximum length kept on every append.
    pub max_stream_length: Option<usize>,
    /// Delay before retrying a failed read, in milliseconds.
    pub retry_delay_ms: Option<u64>,
    /// Expiry applied to reply streams after each response, in seconds.
    pub reply_stream_ttl_secs: Option<u64>,
}

/// Options with every default filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOptions {
    pub url: String,
    pub database: Option<i64>,
    pub stream_prefix: String,
    pub consumer_group: String,
    pub consumer_name: String,
    pub block_timeout: Duration,
    pub batch_size: usize,
    pub max_stream_length: usize,
    pub retry_delay: Duration,
    pub reply_stream_ttl: Option<Duration>,
}

impl StreamsOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_database(mut self, database: i64) -> Self {
        self.database = Some(database);
        self
    }

    pub fn with_stream_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.stream_prefix = Some(prefix.into());
        self
    }

    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = Some(group.into());
        self
    }

    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = Some(name.into());
        self
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    pub fn with_max_stream_length(mut self, len: usize) -> Self {
        self.max_stream_length = Some(len);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = Some(delay.as_millis() as u64);
        self
    }

    pub fn with_reply_stream_ttl(mut self, ttl: Duration) -> Self {
        self.reply_stream_ttl_secs = Some(ttl.as_secs());
        self
    }

    /// Merge with defaults.
    ///
    /// A zero block timeout is raised to 1ms: a zero block would wait forever
    /// and loops could never observe cancellation. A zero batch size is
    /// raised to 1.
    pub fn resolve(&self) -> ResolvedOptions {
        let consumer_name = self
            .consumer_name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(naming::default_consumer_name);

        ResolvedOptions {
            url: self.url.clone().unwrap_or_else(|| DEFAULT_URL.to_string()),
            database: self.database,
            stream_prefix: self
                .stream_prefix
                .clone()
                .unwrap_or_else(|| DEFAULT_STREAM_PREFIX.to_string()),
            consumer_group: self
                .consumer_group
                .clone()
                .unwrap_or_else(|| DEFAULT_CONSUMER_GROUP.to_string()),
            consumer_name,
            block_timeout: Duration::from_millis(
                self.block_timeout_ms
                    .unwrap_or(DEFAULT_BLOCK_TIMEOUT_MS)
                    .max(1),
            ),
            batch_size: self.batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1),
            max_stream_length: self.max_stream_length.unwrap_or(DEFAULT_MAX_STREAM_LENGTH),
            retry_delay: Duration::from_millis(
                self.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS),
            ),
            reply_stream_ttl: self.reply_stream_ttl_secs.map(Duration::from_secs),
        }
    }

    /// Load options from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `redstream.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Parse options from a YAML document.
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| TransportError::Config(::config::ConfigError::Foreign(Box::new(e))))
    }
}

impl ResolvedOptions {
    /// Stream name for a canonical pattern.
    pub fn stream_name(&self, canonical: &str) -> String {
        naming::stream_name(&self.stream_prefix, canonical)
    }

    /// Trim bound passed to every append. Zero disables trimming.
    pub fn trim(&self) -> Option<usize> {
        (self.max_stream_length > 0).then_some(self.max_stream_length)
    }
}

impl Default for ResolvedOptions {
    fn default() -> Self {
        StreamsOptions::default().resolve()
    }
}
