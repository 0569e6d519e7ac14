//! Configuration management for deathwatch
//!
//! Handles loading and validation of `deathwatch.toml`. Every section is
//! optional; missing keys fall back to the defaults below, so an empty file
//! is a valid configuration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "deathwatch.toml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GuardianConfig {
    /// Where the crash log, death-note marker and history live
    pub paths: PathsConfig,

    /// Watchdog alarm thresholds and sampling intervals
    pub thresholds: WatchdogThresholds,

    /// Console diagnostics
    pub logging: LogConfig,
}

/// On-disk locations used by the guardian.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Append-only crash log (one JSON record per line)
    pub log_file: PathBuf,

    /// Death-note marker, present only after a fatal or signal stop
    pub death_note: PathBuf,

    /// Directory holding archived death notes
    pub history_dir: PathBuf,
}

impl PathsConfig {
    /// Derive the standard layout under `base`:
    ///
    /// ```text
    /// <base>/logs/crash_log.log
    /// <base>/logs/death_note.json
    /// <base>/logs/history/
    /// ```
    #[must_use]
    pub fn under(base: &Path) -> Self {
        let logs = base.join("logs");
        Self {
            log_file: logs.join("crash_log.log"),
            death_note: logs.join("death_note.json"),
            history_dir: logs.join("history"),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::under(&cwd)
    }
}

/// Watchdog thresholds. Fixed at startup, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogThresholds {
    /// Mean scheduling lag (ms) above which a snapshot is captured
    pub lag_alarm_ms: f64,
    /// Resident set (MB) above which a snapshot is captured
    pub rss_alarm_mb: f64,
    /// Heartbeat cadence (ms)
    pub heartbeat_interval_ms: u64,
    /// Lag sampler cadence (ms)
    pub lag_sample_interval_ms: u64,
    /// Memory sampler cadence (ms)
    pub memory_sample_interval_ms: u64,
    /// Lag probe resolution (ms): how often the probe measures timer drift
    pub lag_resolution_ms: u64,
}

impl Default for WatchdogThresholds {
    fn default() -> Self {
        Self {
            lag_alarm_ms: 2_000.0,
            rss_alarm_mb: 800.0,
            heartbeat_interval_ms: 10_000,
            lag_sample_interval_ms: 5_000,
            memory_sample_interval_ms: 3_000,
            lag_resolution_ms: 20,
        }
    }
}

impl WatchdogThresholds {
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub fn lag_sample_interval(&self) -> Duration {
        Duration::from_millis(self.lag_sample_interval_ms)
    }

    #[must_use]
    pub fn memory_sample_interval(&self) -> Duration {
        Duration::from_millis(self.memory_sample_interval_ms)
    }

    #[must_use]
    pub fn lag_resolution(&self) -> Duration {
        Duration::from_millis(self.lag_resolution_ms)
    }

    /// Reject values that would make a sampler spin or never fire.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("thresholds.heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("thresholds.lag_sample_interval_ms", self.lag_sample_interval_ms),
            (
                "thresholds.memory_sample_interval_ms",
                self.memory_sample_interval_ms,
            ),
            ("thresholds.lag_resolution_ms", self.lag_resolution_ms),
        ];
        for (field, value) in intervals {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        let alarms = [
            ("thresholds.lag_alarm_ms", self.lag_alarm_ms),
            ("thresholds.rss_alarm_mb", self.rss_alarm_mb),
        ];
        for (field, value) in alarms {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("must be a positive number, got {value}"),
                });
            }
        }

        Ok(())
    }
}

impl GuardianConfig {
    /// Config rooted at `base` with default thresholds.
    #[must_use]
    pub fn under(base: &Path) -> Self {
        Self {
            paths: PathsConfig::under(base),
            ..Self::default()
        }
    }

    /// Load configuration.
    ///
    /// With an explicit path the file must exist. Without one,
    /// `deathwatch.toml` in the working directory is used when present and
    /// defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::NotFound(path.display().to_string()));
                }
                Self::load_from(path)
            }
            None => {
                let default_path = PathBuf::from(CONFIG_FILE_NAME);
                if default_path.exists() {
                    Self::load_from(&default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_toml(&contents)?;
        tracing::debug!(path = %path.display(), "Loaded guardian config");
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.thresholds.validate()
    }
}

/// Console log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "unknown log format: {s}. Expected one of: pretty, json"
            )),
        }
    }
}
