//! Death note persistence and the startup post-mortem check.
//!
//! A death note is written synchronously by the trap layer right before the
//! process terminates because of a signal or an uncaught fault. The marker
//! is written to `<marker>.tmp`, fsynced, and renamed into place, so the
//! post-mortem check never sees a half-written note.
//!
//! On the next start, [`DeathNoteStore::check_post_mortem`] reports the
//! note and renames it into the history directory as
//! `death_note_YYYYMMDD_HHMMSS_mmm.json`. History files are never
//! overwritten or deleted by this crate.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::report_storage_fault;
use crate::journal::{CrashLog, Level};
use crate::snapshot::SystemSnapshot;

const HISTORY_PREFIX: &str = "death_note_";
const HISTORY_EXT: &str = "json";
const MAX_NAME_COLLISIONS: u32 = 1000;

/// Error attached to a fault-triggered death note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Durable description of the most recent fatal event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeathNote {
    pub timestamp: DateTime<Utc>,
    pub pid: u32,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub snapshot: SystemSnapshot,
    /// `true` when the process was stopped by a signal, `false` for faults
    #[serde(default)]
    pub graceful: bool,
    /// Crate version that wrote the note
    #[serde(default)]
    pub version: String,
}

impl DeathNote {
    #[must_use]
    pub fn new(
        reason: impl Into<String>,
        error: Option<ErrorInfo>,
        snapshot: SystemSnapshot,
        graceful: bool,
    ) -> Self {
        Self {
            timestamp: Utc::now().trunc_subsecs(3),
            pid: std::process::id(),
            reason: reason.into(),
            error,
            snapshot,
            graceful,
            version: crate::VERSION.to_string(),
        }
    }

    /// Parse a marker's bytes. Total: any input yields `Ok` or `Err`.
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Outcome of the startup post-mortem check.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PostMortem {
    /// No marker: the previous run exited normally (or this is the first run).
    Clean,
    /// A note was found, reported, and archived.
    Recovered { note: DeathNote, archived_to: PathBuf },
    /// The marker could not be read or parsed and was left in place.
    Corrupt { path: PathBuf, error: String },
    /// The note was reported but could not be moved into history.
    ArchiveFailed { note: DeathNote, error: String },
}

impl PostMortem {
    /// The recovered note, if any.
    #[must_use]
    pub fn note(&self) -> Option<&DeathNote> {
        match self {
            Self::Recovered { note, .. } | Self::ArchiveFailed { note, .. } => Some(note),
            Self::Clean | Self::Corrupt { .. } => None,
        }
    }
}

/// An archived death note on disk.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub path: PathBuf,
    pub note: DeathNote,
}

/// Reads and writes the death-note marker and its history.
pub struct DeathNoteStore {
    marker: PathBuf,
    history_dir: PathBuf,
    log: Arc<CrashLog>,
}

impl DeathNoteStore {
    pub fn new(marker: impl Into<PathBuf>, history_dir: impl Into<PathBuf>, log: Arc<CrashLog>) -> Self {
        Self {
            marker: marker.into(),
            history_dir: history_dir.into(),
            log,
        }
    }

    #[must_use]
    pub fn marker_path(&self) -> &Path {
        &self.marker
    }

    #[must_use]
    pub fn history_dir(&self) -> &Path {
        &self.history_dir
    }

    /// Persist `note` as the live marker, replacing any unconsumed one.
    ///
    /// Blocks until the data is on disk. Returns `false` after a stderr
    /// diagnostic when the write failed.
    pub fn write(&self, note: &DeathNote) -> bool {
        match self.try_write(note) {
            Ok(()) => {
                self.log.log(
                    Level::Info,
                    "death note written",
                    json!({ "path": self.marker.display().to_string(), "reason": note.reason }),
                );
                true
            }
            Err(e) => {
                let _ = fs::remove_file(self.tmp_path());
                report_storage_fault("failed to write death note", &e);
                false
            }
        }
    }

    fn try_write(&self, note: &DeathNote) -> io::Result<()> {
        if let Some(parent) = self.marker.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_vec_pretty(note).map_err(io::Error::other)?;
        let tmp = self.tmp_path();
        write_file_sync(&tmp, &json)?;
        fs::rename(&tmp, &self.marker)?;
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.marker.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.marker.with_file_name(name)
    }

    /// Whether a live marker currently exists.
    #[must_use]
    pub fn marker_exists(&self) -> bool {
        self.marker.is_file()
    }

    /// Report and archive a marker left by the previous run.
    ///
    /// Emits exactly one `ALERT` record and creates exactly one history file
    /// when a valid marker is present; does nothing when it is absent. A
    /// corrupt marker is reported on stderr and left untouched.
    pub fn check_post_mortem(&self) -> PostMortem {
        let bytes = match fs::read(&self.marker) {
            Ok(bytes) => bytes,
            Err(_) if !self.marker.exists() => {
                debug!(path = %self.marker.display(), "No death note from previous run");
                return PostMortem::Clean;
            }
            Err(e) => return self.corrupt(&e),
        };

        let note = match DeathNote::parse(&bytes) {
            Ok(note) => note,
            Err(e) => return self.corrupt(&e),
        };

        let payload = serde_json::to_value(&note).unwrap_or(serde_json::Value::Null);
        self.log
            .log(Level::Alert, "previous process did not exit cleanly", payload);

        match self.archive() {
            Ok(archived_to) => {
                self.log.log(
                    Level::Info,
                    "death note archived",
                    json!({ "path": archived_to.display().to_string() }),
                );
                PostMortem::Recovered { note, archived_to }
            }
            Err(e) => {
                report_storage_fault("failed to archive death note", &e);
                PostMortem::ArchiveFailed {
                    note,
                    error: e.to_string(),
                }
            }
        }
    }

    fn corrupt(&self, err: &dyn std::fmt::Display) -> PostMortem {
        let context = format!(
            "unreadable death note left in place at {}",
            self.marker.display()
        );
        report_storage_fault(&context, err);
        self.log.log(
            Level::Warn,
            "unreadable death note left in place",
            json!({ "path": self.marker.display().to_string(), "error": err.to_string() }),
        );
        PostMortem::Corrupt {
            path: self.marker.clone(),
            error: err.to_string(),
        }
    }

    fn archive(&self) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.history_dir)?;
        let target = unique_history_path(&self.history_dir, Utc::now())?;
        fs::rename(&self.marker, &target)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&target, fs::Permissions::from_mode(0o600));
        }

        Ok(target)
    }

    /// Archived notes, newest first. Unreadable files are skipped.
    #[must_use]
    pub fn list_history(&self, limit: usize) -> Vec<HistoryEntry> {
        list_history(&self.history_dir, limit)
    }
}

/// List archived notes in `dir`, newest first, up to `limit`.
#[must_use]
pub fn list_history(dir: &Path, limit: usize) -> Vec<HistoryEntry> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut history: Vec<HistoryEntry> = entries
        .filter_map(Result::ok)
        .filter(|e| {
            e.file_type().is_ok_and(|ft| ft.is_file())
                && e.file_name()
                    .to_str()
                    .is_some_and(|n| n.starts_with(HISTORY_PREFIX) && n.ends_with(".json"))
        })
        .filter_map(|e| {
            let path = e.path();
            let note = DeathNote::parse(&fs::read(&path).ok()?).ok()?;
            Some(HistoryEntry { path, note })
        })
        .collect();

    // File names break ties between notes written in the same millisecond.
    history.sort_by(|a, b| {
        b.note
            .timestamp
            .cmp(&a.note.timestamp)
            .then_with(|| b.path.cmp(&a.path))
    });
    history.truncate(limit);
    history
}

/// `death_note_YYYYMMDD_HHMMSS_mmm.json`, with `_N` appended on collision.
fn unique_history_path(dir: &Path, at: DateTime<Utc>) -> io::Result<PathBuf> {
    let stem = format!("{HISTORY_PREFIX}{}", at.format("%Y%m%d_%H%M%S_%3f"));
    let first = dir.join(format!("{stem}.{HISTORY_EXT}"));
    if !first.exists() {
        return Ok(first);
    }
    for counter in 1..=MAX_NAME_COLLISIONS {
        let candidate = dir.join(format!("{stem}_{counter}.{HISTORY_EXT}"));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        "too many death notes with the same timestamp",
    ))
}

fn write_file_sync(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut f = fs::File::create(path)?;
    f.write_all(data)?;
    f.sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = f.set_permissions(fs::Permissions::from_mode(0o600));
    }

    Ok(())
}
