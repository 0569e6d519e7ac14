//! Crash-safe structured logger.
//!
//! Appends one JSON record per line to the crash log and mirrors each record
//! to the console through `tracing`. [`CrashLog::log`] never fails from the
//! caller's point of view: an I/O error is reported on stderr and dropped.
//!
//! # Record format
//!
//! ```text
//! {"time":"2026-10-17T09:14:03.512Z","pid":4121,"level":"SNAPSHOT","message":"HIGH_MEMORY_PRESSURE","extra":{...}}
//! ```
//!
//! Records are written with a single `write_all` on an `O_APPEND` handle, so
//! a record that reached the kernel survives an abrupt process exit. Levels
//! that describe a fatal or alarming condition are additionally fsynced.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::report_storage_fault;

/// Crash log record level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Info,
    Warn,
    Error,
    Fatal,
    Alert,
    Snapshot,
    Heartbeat,
}

impl Level {
    pub const ALL: [Self; 7] = [
        Self::Info,
        Self::Warn,
        Self::Error,
        Self::Fatal,
        Self::Alert,
        Self::Snapshot,
        Self::Heartbeat,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
            Self::Alert => "ALERT",
            Self::Snapshot => "SNAPSHOT",
            Self::Heartbeat => "HEARTBEAT",
        }
    }

    /// Whether a record of this level is fsynced after the append.
    #[must_use]
    pub const fn is_durable(self) -> bool {
        matches!(
            self,
            Self::Error | Self::Fatal | Self::Alert | Self::Snapshot
        )
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Level {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown crash log level: {s}"))
    }
}

/// One crash log entry. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub time: DateTime<Utc>,
    pub pid: u32,
    pub level: Level,
    pub message: String,
    #[serde(default)]
    pub extra: serde_json::Value,
}

#[derive(Default)]
struct LogState {
    file: Option<File>,
    last_time: Option<DateTime<Utc>>,
}

/// Append-only crash log.
pub struct CrashLog {
    path: PathBuf,
    state: Mutex<LogState>,
}

impl CrashLog {
    /// Create a logger for `path`. Nothing touches the disk until
    /// [`ensure_store`](Self::ensure_store) or the first [`log`](Self::log).
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(LogState::default()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the log directory and file if they do not exist yet.
    ///
    /// Idempotent. Returns `false` (after a stderr diagnostic) when the store
    /// cannot be prepared.
    pub fn ensure_store(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match self.open(&mut state) {
            Ok(_) => true,
            Err(e) => {
                report_storage_fault("failed to initialize crash log", &e);
                false
            }
        }
    }

    /// Append one record. Never fails visibly.
    pub fn log(&self, level: Level, message: impl Into<String>, extra: serde_json::Value) {
        let message = message.into();
        mirror(level, &message, &extra);

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let now = Utc::now().trunc_subsecs(3);
        let time = match state.last_time {
            Some(last) if last > now => last,
            _ => now,
        };

        let record = LogRecord {
            time,
            pid: std::process::id(),
            level,
            message,
            extra,
        };

        match self.append(&mut state, &record) {
            Ok(()) => state.last_time = Some(time),
            Err(e) => {
                // Drop the handle so the next call reopens the file.
                state.file = None;
                report_storage_fault("logging failed", &e);
            }
        }
    }

    /// Shorthand for a record without an extra payload.
    pub fn log_plain(&self, level: Level, message: impl Into<String>) {
        self.log(level, message, serde_json::Value::Object(serde_json::Map::new()));
    }

    fn append(&self, state: &mut LogState, record: &LogRecord) -> io::Result<()> {
        let mut line = serde_json::to_string(record).map_err(io::Error::other)?;
        line.push('\n');
        let file = self.open(state)?;
        file.write_all(line.as_bytes())?;
        if record.level.is_durable() {
            file.sync_data()?;
        }
        Ok(())
    }

    fn open<'a>(&self, state: &'a mut LogState) -> io::Result<&'a mut File> {
        if state.file.is_none() {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?;
            state.file = Some(file);
        }
        state
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("crash log handle unavailable"))
    }
}

/// Mirror a record to the console diagnostics stream.
fn mirror(level: Level, message: &str, extra: &serde_json::Value) {
    let has_extra = extra.as_object().is_none_or(|m| !m.is_empty());
    match level {
        Level::Info | Level::Heartbeat => {
            tracing::info!(level = %level, "{message}");
        }
        Level::Warn | Level::Alert => {
            if has_extra {
                tracing::warn!(level = %level, extra = %extra, "{message}");
            } else {
                tracing::warn!(level = %level, "{message}");
            }
        }
        Level::Error | Level::Fatal | Level::Snapshot => {
            tracing::error!(level = %level, extra = %extra, "{message}");
        }
    }
}

/// Read a crash log back. Lines that do not parse are skipped.
pub fn read_records(path: &Path) -> io::Result<Vec<LogRecord>> {
    let file = File::open(path)?;
    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(record) = serde_json::from_str::<LogRecord>(&line) {
            records.push(record);
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_log() -> (tempfile::TempDir, CrashLog) {
        let tmp = tempfile::TempDir::new().unwrap();
        let log = CrashLog::new(tmp.path().join("logs").join("crash_log.log"));
        (tmp, log)
    }

    #[test]
    fn level_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Level::Heartbeat).unwrap(), "\"HEARTBEAT\"");
        let parsed: Level = serde_json::from_str("\"SNAPSHOT\"").unwrap();
        assert_eq!(parsed, Level::Snapshot);
    }

    #[test]
    fn level_from_str_is_case_insensitive() {
        assert_eq!("fatal".parse::<Level>().unwrap(), Level::Fatal);
        assert_eq!("Alert".parse::<Level>().unwrap(), Level::Alert);
        assert!("DEBUG".parse::<Level>().is_err());
    }

    #[test]
    fn ensure_store_creates_directory_and_file() {
        let (_tmp, log) = temp_log();
        assert!(!log.path().exists());
        assert!(log.ensure_store());
        assert!(log.path().exists());
        // Second call is a no-op.
        assert!(log.ensure_store());
        assert_eq!(fs::read_to_string(log.path()).unwrap(), "");
    }

    #[test]
    fn ensure_store_keeps_existing_content() {
        let (_tmp, log) = temp_log();
        fs::create_dir_all(log.path().parent().unwrap()).unwrap();
        fs::write(log.path(), "previous run\n").unwrap();
        assert!(log.ensure_store());
        assert_eq!(fs::read_to_string(log.path()).unwrap(), "previous run\n");
    }

    #[test]
    fn log_appends_json_lines() {
        let (_tmp, log) = temp_log();
        log.log(Level::Info, "started", json!({ "port": 8080 }));
        log.log_plain(Level::Heartbeat, "process alive");

        let contents = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["level"], "INFO");
        assert_eq!(first["message"], "started");
        assert_eq!(first["extra"]["port"], 8080);
        assert_eq!(first["pid"], std::process::id());
        assert!(first["time"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn records_preserve_insertion_order_and_time() {
        let (_tmp, log) = temp_log();
        for i in 0..50 {
            log.log(Level::Info, format!("record {i}"), json!({}));
        }
        let records = read_records(log.path()).unwrap();
        assert_eq!(records.len(), 50);
        for (i, pair) in records.windows(2).enumerate() {
            assert!(pair[0].time <= pair[1].time, "time went backwards at {i}");
        }
        assert_eq!(records[49].message, "record 49");
    }

    #[test]
    fn unwritable_store_does_not_propagate() {
        let tmp = tempfile::TempDir::new().unwrap();
        // A regular file where the log directory should be.
        let blocker = tmp.path().join("logs");
        fs::write(&blocker, "not a directory").unwrap();
        let log = CrashLog::new(blocker.join("crash_log.log"));

        assert!(!log.ensure_store());
        log.log(Level::Fatal, "boom", json!({}));
        log.log_plain(Level::Info, "still here");
    }

    #[test]
    fn logging_recovers_after_store_reappears() {
        let tmp = tempfile::TempDir::new().unwrap();
        let blocker = tmp.path().join("logs");
        fs::write(&blocker, "x").unwrap();
        let log = CrashLog::new(blocker.join("crash_log.log"));
        log.log_plain(Level::Info, "lost");

        fs::remove_file(&blocker).unwrap();
        log.log_plain(Level::Info, "kept");

        let records = read_records(log.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "kept");
    }

    #[test]
    fn read_records_skips_garbage_lines() {
        let (_tmp, log) = temp_log();
        log.log_plain(Level::Info, "one");
        {
            let mut f = OpenOptions::new().append(true).open(log.path()).unwrap();
            f.write_all(b"{\"truncated\":\n\n").unwrap();
        }
        log.log_plain(Level::Warn, "two");

        let records = read_records(log.path()).unwrap();
        let messages: Vec<&str> = records.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, ["one", "two"]);
    }

    #[test]
    fn durable_levels() {
        assert!(Level::Fatal.is_durable());
        assert!(Level::Snapshot.is_durable());
        assert!(!Level::Heartbeat.is_durable());
        assert!(!Level::Info.is_durable());
    }
}
