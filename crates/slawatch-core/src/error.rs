//! Error types for slawatch-core

use std::fmt::Write;
use thiserror::Error;

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands as (label, command) pairs
    pub commands: Vec<(String, String)>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push((label.into(), command.into()));
        self
    }

    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);
        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for (label, command) in &self.commands {
                let _ = writeln!(output, "    - {label}: {command}");
            }
        }
        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }
        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for slawatch-core
#[derive(Error, Debug)]
pub enum Error {
    /// Canonical store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Cache / deadline index backend errors
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Alert delivery errors
    #[error("Alert error: {0}")]
    Alert(#[from] AlertError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("No runs recorded for calculator {calculator_id} (tenant {tenant_id})")]
    CalculatorNotFound {
        calculator_id: String,
        tenant_id: String,
    },

    #[error("Access denied to run {run_id} for tenant {tenant_id}")]
    TenantAccessDenied { run_id: String, tenant_id: String },

    #[error("circuit breaker is open for `{circuit}` (retry after {retry_after_ms}ms)")]
    CircuitOpen {
        circuit: String,
        retry_after_ms: u64,
    },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (task join failures, channel failures, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Store(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Cache(_) => Some(
                Remediation::new("Cache backend unavailable. Reads fall back to the store.")
                    .command("Check config", "slawatch config show")
                    .alternative("Switch `[cache] backend` to \"memory\" for a single node."),
            ),
            Self::Alert(_) | Self::CircuitOpen { .. } => Some(
                Remediation::new("Alert delivery failed. Pending alerts are retried by the reconciliation sweep.")
                    .command("List unalerted breaches", "slawatch breaches")
                    .command("Retry now", "slawatch reconcile"),
            ),
            Self::RunNotFound(_) | Self::CalculatorNotFound { .. } => Some(
                Remediation::new("Verify the identifier and tenant, then retry.")
                    .command("Calculator status", "slawatch status <calculator-id> --tenant <tenant>"),
            ),
            Self::TenantAccessDenied { .. } => Some(Remediation::new(
                "The run belongs to a different tenant. Pass the owning tenant with --tenant.",
            )),
            Self::Timeout { .. } => Some(
                Remediation::new("A backend call exceeded its timeout. Check store and cache latency.")
                    .alternative("Raise `command_timeout_ms` in the config."),
            ),
            Self::Io(_) | Self::Json(_) | Self::Runtime(_) => None,
        }
    }
}

/// Canonical store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid stored value for {column}: {value}")]
    InvalidValue { column: &'static str, value: String },

    #[error("Schema bootstrap failed: {0}")]
    SchemaFailed(String),

    #[error("Store task failed: {0}")]
    Join(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl StoreError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Database(_) | Self::Join(_) => Remediation::new(
                "Database operation failed. Check the database path and permissions, then retry.",
            )
            .command("Show config", "slawatch config show"),
            Self::InvalidValue { column, .. } => Remediation::new(format!(
                "A stored `{column}` value could not be decoded. Inspect the row and repair it."
            )),
            Self::SchemaFailed(_) => Remediation::new(
                "Schema creation failed. Ensure the database file is writable and not from an incompatible tool.",
            ),
        }
    }
}

/// Cache and deadline index backend errors
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to decode cached value: {0}")]
    Decode(String),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
            Self::Unavailable(err.to_string())
        } else {
            Self::Backend(err.to_string())
        }
    }
}

/// Alert sink errors
#[derive(Error, Debug)]
pub enum AlertError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Sink rejected alert with status {status}")]
    Rejected { status: u16 },

    #[error("Alert send timed out after {0}ms")]
    Timeout(u64),

    #[error("Sink error: {0}")]
    Sink(String),
}

impl From<reqwest::Error> for AlertError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => {
                Remediation::new(format!("Config file not found: {path}. Verify the path and retry."))
                    .alternative("Omit --config to run with built-in defaults.")
            }
            Self::ReadFailed(path, _) => {
                Remediation::new(format!("Check that {path} is readable by the current user."))
            }
            Self::ParseFailed(_) => Remediation::new("Fix the TOML syntax in the config file.")
                .command("Validate", "slawatch config validate"),
            Self::SerializeFailed(_) => Remediation::new("Report this as a bug."),
            Self::ValidationError(_) => Remediation::new("Fix the offending config value.")
                .command("Validate", "slawatch config validate")
                .command("Show effective config", "slawatch config show"),
        }
    }
}
