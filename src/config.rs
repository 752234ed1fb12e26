//! Configuration file parser for `hotlist.toml` plus environment overrides.
//!
//! The config file is optional: a missing or empty file yields `Config::default()`.
//! Unknown keys are accepted by serde but logged as a warning. After the file is
//! read, the deployment-style environment variables (`CACHE_TTL`, `REDIS_HOST`,
//! `SCHEDULER_CRON_EXPRESSION`, ...) override whatever the file said.
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default TTL for cached HTTP payloads, in seconds.
    pub cache_ttl_secs: u64,

    /// Default per-request deadline for outbound HTTP, in milliseconds.
    pub request_timeout_ms: u64,

    /// Simple retries performed by the HTTP client after the first attempt.
    pub request_retries: u32,

    /// Maximum entries held by the in-process fallback cache.
    pub memory_cache_capacity: usize,

    /// SQLite database path for persisted items and run configs.
    pub database_path: String,

    /// Interval assigned to newly discovered sources.
    pub default_interval_minutes: u32,

    pub redis: RedisConfig,

    pub scheduler: SchedulerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 3600,
            request_timeout_ms: 6000,
            request_retries: 2,
            memory_cache_capacity: 1000,
            database_path: "hotlist.db".to_string(),
            default_interval_minutes: 30,
            redis: RedisConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Connection parameters for the primary cache backend.
///
/// Custom Debug impl masks `password`.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// When false the cache starts directly on the in-process fallback.
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    /// Deadline for opening a connection, at startup or on re-probe.
    pub connect_timeout_ms: u64,
    /// Deadline for each command on an open connection.
    pub op_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            db: 0,
            connect_timeout_ms: 2000,
            op_timeout_ms: 1000,
        }
    }
}

impl std::fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConfig")
            .field("enabled", &self.enabled)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("db", &self.db)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("op_timeout_ms", &self.op_timeout_ms)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Arm the cron timer at startup.
    pub auto_start: bool,
    /// Five-field (minute-first) or six-field (second-first) cron expression.
    pub cron_expression: String,
    /// Sources skipped by scheduled and "refresh all" runs.
    pub ignored_sources: Vec<String>,
    /// Number of sources fetched concurrently in one window.
    pub window_size: usize,
    /// Pause between two windows.
    pub window_delay_ms: u64,
    /// Fetch attempts per source per run (first try included).
    pub max_attempts: u32,
    /// First backoff delay; doubles on each further attempt.
    pub backoff_base_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            auto_start: true,
            cron_expression: "0 */12 * * *".to_string(),
            ignored_sources: Vec::new(),
            window_size: 5,
            window_delay_ms: 1000,
            max_attempts: 3,
            backoff_base_ms: 1000,
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file, then apply process environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_file(path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load configuration from a TOML file only.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)`
    /// - Unknown keys → accepted, logged as warning
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            let known_keys = [
                "cache_ttl_secs",
                "request_timeout_ms",
                "request_retries",
                "memory_cache_capacity",
                "database_path",
                "default_interval_minutes",
                "redis",
                "scheduler",
            ];
            for key in raw.keys() {
                if !known_keys.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Apply environment-style overrides through `lookup`.
    ///
    /// Values that fail to parse are logged and leave the current setting untouched.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, value: Option<String>) -> Option<T> {
            let value = value?;
            match value.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(key = %key, value = %value, "Ignoring unparsable environment override");
                    None
                }
            }
        }

        if let Some(v) = parsed("CACHE_TTL", lookup("CACHE_TTL")) {
            self.cache_ttl_secs = v;
        }
        if let Some(v) = parsed("REQUEST_TIMEOUT", lookup("REQUEST_TIMEOUT")) {
            self.request_timeout_ms = v;
        }
        if let Some(v) = lookup("DATABASE_PATH").filter(|v| !v.trim().is_empty()) {
            self.database_path = v;
        }
        if let Some(v) = lookup("REDIS_HOST").filter(|v| !v.trim().is_empty()) {
            self.redis.host = v;
        }
        if let Some(v) = parsed("REDIS_PORT", lookup("REDIS_PORT")) {
            self.redis.port = v;
        }
        if let Some(v) = lookup("REDIS_PASSWORD") {
            self.redis.password = if v.is_empty() { None } else { Some(v) };
        }
        if let Some(v) = parsed("REDIS_DB", lookup("REDIS_DB")) {
            self.redis.db = v;
        }
        if let Some(v) = lookup("SCHEDULER_CRON_EXPRESSION").filter(|v| !v.trim().is_empty()) {
            self.scheduler.cron_expression = v.trim().to_string();
        }
        if let Some(v) = lookup("SCHEDULER_AUTO_START") {
            self.scheduler.auto_start = matches!(v.trim(), "1" | "true" | "TRUE" | "True");
        }
        if let Some(v) = lookup("IGNORE_SAVE_SOURCES") {
            self.scheduler.ignored_sources = split_source_list(&v);
        }
    }
}

/// Split a comma-separated source list, trimming entries and dropping empties.
pub fn split_source_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
