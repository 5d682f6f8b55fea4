//! Configuration management for slawatch
//!
//! Handles loading and validation of `slawatch.toml` configuration files.
//! Every section and field has a default, so an empty file (or no file at
//! all) yields a working single-node setup: SQLite store, in-memory cache,
//! log alert sink.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::ConfigError;
use crate::logging::LogConfig;
use crate::retry::RetryPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub detection: DetectionConfig,

    #[serde(default)]
    pub alerting: AlertingConfig,

    #[serde(default)]
    pub events: EventsConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("invalid log format: {other} (expected pretty or json)")),
        }
    }
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Optional log file; stderr only when unset
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Pretty,
            log_file: None,
        }
    }
}

impl GeneralConfig {
    #[must_use]
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level.clone(),
            format: self.log_format,
            file: self.log_file.clone(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Canonical store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path (`:memory:` for an ephemeral store)
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Upper bound for a single store command
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

fn default_db_path() -> String {
    dirs::data_local_dir()
        .map(|dir| dir.join("slawatch").join("slawatch.db"))
        .and_then(|path| path.to_str().map(str::to_string))
        .unwrap_or_else(|| "slawatch.db".to_string())
}

fn default_command_timeout_ms() -> u64 {
    2_000
}

/// Cache backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    #[default]
    Memory,
    Redis,
}

/// Cache and deadline index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: CacheBackendKind,

    /// Redis connection URL, required when `backend = "redis"`
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix applied to every key written by this service
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Recompute the status response right after eviction
    #[serde(default = "default_true")]
    pub warm_on_change: bool,

    /// History size kept in the status response (excluding the current run)
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::Memory,
            redis_url: None,
            key_prefix: default_key_prefix(),
            command_timeout_ms: default_command_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            warm_on_change: true,
            history_limit: default_history_limit(),
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_key_prefix() -> String {
    "obs".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_history_limit() -> usize {
    5
}

fn default_true() -> bool {
    true
}

/// Live breach detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_detection_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_detection_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_early_warning_interval_ms")]
    pub early_warning_interval_ms: u64,

    #[serde(default = "default_early_warning_initial_delay_ms")]
    pub early_warning_initial_delay_ms: u64,

    #[serde(default = "default_early_warning_window_minutes")]
    pub early_warning_window_minutes: u32,

    /// How often the index safety expiry is re-applied
    #[serde(default = "default_index_refresh_interval_ms")]
    pub index_refresh_interval_ms: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_detection_interval_ms(),
            initial_delay_ms: default_detection_initial_delay_ms(),
            early_warning_interval_ms: default_early_warning_interval_ms(),
            early_warning_initial_delay_ms: default_early_warning_initial_delay_ms(),
            early_warning_window_minutes: default_early_warning_window_minutes(),
            index_refresh_interval_ms: default_index_refresh_interval_ms(),
        }
    }
}

fn default_detection_interval_ms() -> u64 {
    15_000
}

fn default_detection_initial_delay_ms() -> u64 {
    10_000
}

fn default_early_warning_interval_ms() -> u64 {
    60_000
}

fn default_early_warning_initial_delay_ms() -> u64 {
    30_000
}

fn default_early_warning_window_minutes() -> u32 {
    10
}

fn default_index_refresh_interval_ms() -> u64 {
    3_600_000
}

/// Alert sink selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AlertSinkKind {
    #[default]
    Log,
    Webhook,
}

/// Alert delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertingConfig {
    #[serde(default)]
    pub sink: AlertSinkKind,

    /// Webhook endpoint, required when `sink = "webhook"`
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Per-attempt send timeout
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    #[serde(default = "default_jitter_percent")]
    pub jitter_percent: f64,

    /// Consecutive failed sends before the breaker opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_open_cooldown_ms")]
    pub open_cooldown_ms: u64,

    #[serde(default = "default_true")]
    pub reconciliation_enabled: bool,

    #[serde(default = "default_reconciliation_interval_ms")]
    pub reconciliation_interval_ms: u64,

    #[serde(default = "default_reconciliation_batch")]
    pub reconciliation_batch: usize,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            sink: AlertSinkKind::Log,
            webhook_url: None,
            send_timeout_ms: default_send_timeout_ms(),
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            jitter_percent: default_jitter_percent(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_cooldown_ms: default_open_cooldown_ms(),
            reconciliation_enabled: true,
            reconciliation_interval_ms: default_reconciliation_interval_ms(),
            reconciliation_batch: default_reconciliation_batch(),
        }
    }
}

impl AlertingConfig {
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.backoff_factor,
            self.jitter_percent,
            Some(self.max_attempts.max(1)),
        )
    }

    #[must_use]
    pub fn circuit_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(
            self.failure_threshold,
            self.success_threshold,
            Duration::from_millis(self.open_cooldown_ms),
        )
    }

    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Longest a live send can hold a breach in RETRYING: every attempt
    /// timing out after the longest backoff.
    #[must_use]
    pub fn retrying_stale_after(&self) -> Duration {
        let per_attempt = self.send_timeout_ms.saturating_add(self.max_delay_ms);
        Duration::from_millis(per_attempt.saturating_mul(u64::from(self.max_attempts.max(1))))
    }
}

fn default_send_timeout_ms() -> u64 {
    5_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_jitter_percent() -> f64 {
    0.1
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    1
}

fn default_open_cooldown_ms() -> u64 {
    60_000
}

fn default_reconciliation_interval_ms() -> u64 {
    300_000
}

fn default_reconciliation_batch() -> usize {
    100
}

/// How the event bus hands events to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Publisher awaits each subscriber in registration order
    #[default]
    Inline,
    /// Each subscriber runs on its own tokio task
    Spawned,
}

/// Event bus configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventsConfig {
    #[serde(default)]
    pub dispatch: DispatchMode,
}

impl Config {
    /// Default config file location (`$XDG_CONFIG_HOME/slawatch/slawatch.toml`)
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("slawatch").join("slawatch.toml"))
    }

    /// Load configuration from the default location, or defaults if absent
    pub fn load() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load and validate configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        let config = Self::from_toml_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::ParseFailed(e.to_string()))
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeFailed(e.to_string()))
    }

    /// Reject settings that would make a background loop spin or a backend unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("detection.interval_ms", self.detection.interval_ms),
            (
                "detection.early_warning_interval_ms",
                self.detection.early_warning_interval_ms,
            ),
            (
                "detection.index_refresh_interval_ms",
                self.detection.index_refresh_interval_ms,
            ),
            (
                "alerting.reconciliation_interval_ms",
                self.alerting.reconciliation_interval_ms,
            ),
            ("store.command_timeout_ms", self.store.command_timeout_ms),
            ("cache.command_timeout_ms", self.cache.command_timeout_ms),
            ("alerting.send_timeout_ms", self.alerting.send_timeout_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!("{name} must be > 0")));
            }
        }

        if self.cache.backend == CacheBackendKind::Redis
            && self.cache.redis_url.as_deref().is_none_or(str::is_empty)
        {
            return Err(ConfigError::ValidationError(
                "cache.redis_url is required when cache.backend = \"redis\"".to_string(),
            ));
        }

        if self.alerting.sink == AlertSinkKind::Webhook
            && self.alerting.webhook_url.as_deref().is_none_or(str::is_empty)
        {
            return Err(ConfigError::ValidationError(
                "alerting.webhook_url is required when alerting.sink = \"webhook\"".to_string(),
            ));
        }

        if self.alerting.reconciliation_batch == 0 {
            return Err(ConfigError::ValidationError(
                "alerting.reconciliation_batch must be > 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.alerting.jitter_percent) {
            return Err(ConfigError::ValidationError(
                "alerting.jitter_percent must be within [0, 1]".to_string(),
            ));
        }

        Ok(())
    }
}
