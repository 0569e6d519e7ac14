//! Error types for deathwatch-core
//!
//! Errors exist for the internal plumbing only. Every operation a host or a
//! trap handler calls is total: it reports failures through a best-effort
//! console line and returns normally (see [`report_storage_fault`]).

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for deathwatch-core
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors (log store, marker, history directory)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Signal registration errors
    #[error("Signal error: {0}")]
    Signal(String),

    /// Runtime errors (no tokio runtime, task failures, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(String),

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Write a storage fault to stderr without going through `tracing`.
///
/// This is the fallback diagnostic channel for the crash log itself, so it
/// must not route back into anything that could append to the log.
pub fn report_storage_fault(context: &str, err: &dyn std::fmt::Display) {
    eprintln!("deathwatch: {context}: {err}");
}
