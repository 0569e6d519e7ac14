//! deathwatch-core: in-process crash guardian for long-running services
//!
//! Detects that the host process is degraded or about to die, captures
//! enough state to explain why, persists that evidence so it survives an
//! abrupt exit, and reports it on the next startup.
//!
//! # Architecture
//!
//! ```text
//!        signals / panics / task errors
//!                     ↓
//!               Trap Layer ──→ Death Note ──→ history/ (next start)
//!                     ↓             ↓
//!   Watchdog ──→ Snapshot Collector ──→ Crash Log (JSON lines)
//! ```
//!
//! # Modules
//!
//! - `journal`: crash-safe JSON-lines logger
//! - `snapshot`: point-in-time runtime health snapshots
//! - `probe`: OS metric sources behind the `ProcessProbe` trait
//! - `tracker`: read-only view of the host's in-flight work
//! - `lag`: scheduling-lag probe and histogram
//! - `watchdog`: heartbeat, lag and memory samplers
//! - `death_note`: death-note marker, post-mortem check, history
//! - `trap`: fault and signal traps with the lifecycle state machine
//! - `guardian`: the process-wide facade wiring everything together
//! - `config`: TOML configuration with defaults
//! - `logging`: console diagnostics via `tracing`
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod config;
pub mod death_note;
pub mod error;
pub mod guardian;
pub mod journal;
pub mod lag;
pub mod logging;
pub mod probe;
pub mod snapshot;
pub mod tracker;
pub mod trap;
pub mod watchdog;

pub use config::{GuardianConfig, PathsConfig, WatchdogThresholds};
pub use death_note::{DeathNote, DeathNoteStore, ErrorInfo, HistoryEntry, PostMortem};
pub use error::{ConfigError, Error, Result};
pub use guardian::{Guardian, TrapOptions};
pub use journal::{CrashLog, Level, LogRecord};
pub use snapshot::{SnapshotCollector, SystemSnapshot};
pub use tracker::{NoWork, WorkItem, WorkTracker};
pub use trap::{Disposition, LifecycleState, TrapEvent, TrapLayer, TrapSignal};

/// Version of the deathwatch-core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
