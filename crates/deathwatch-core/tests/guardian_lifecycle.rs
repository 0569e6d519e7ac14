//! End-to-end lifecycle tests for the guardian.
//!
//! Each test simulates one or two process lifetimes against the same
//! temporary directory: build a guardian, start it, feed it lifecycle
//! events, and check the crash log, marker and history on disk.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use deathwatch_core::journal::read_records;
use deathwatch_core::probe::{CpuUsage, HeapStatistics, LoadAverage, MemoryUsage, ProcessProbe};
use deathwatch_core::{
    Disposition, Guardian, GuardianConfig, Level, LogRecord, NoWork, PostMortem, TrapEvent,
    TrapOptions, TrapSignal, WorkItem,
};

/// Probe reporting a settable resident set and nothing else.
#[derive(Default)]
struct StubProbe {
    rss_mb: AtomicU64,
}

impl StubProbe {
    fn new(rss_mb: u64) -> Arc<Self> {
        Arc::new(Self {
            rss_mb: AtomicU64::new(rss_mb),
        })
    }
}

impl ProcessProbe for StubProbe {
    fn memory(&self) -> Option<MemoryUsage> {
        Some(MemoryUsage {
            rss_bytes: self.rss_mb.load(Ordering::SeqCst) * 1024 * 1024,
            heap_used_bytes: None,
        })
    }

    fn cpu(&self) -> Option<CpuUsage> {
        None
    }

    fn load_average(&self) -> Option<LoadAverage> {
        None
    }

    fn heap(&self) -> Option<HeapStatistics> {
        None
    }

    fn open_handles(&self) -> Option<usize> {
        None
    }

    fn active_tasks(&self) -> Option<usize> {
        None
    }

    fn uptime(&self) -> Duration {
        Duration::from_secs(1)
    }
}

fn boot(dir: &Path, rss_mb: u64) -> Arc<Guardian> {
    Guardian::with_probe(
        GuardianConfig::under(dir),
        Arc::new(NoWork),
        StubProbe::new(rss_mb),
    )
}

fn records(guardian: &Guardian) -> Vec<LogRecord> {
    read_records(guardian.crash_log().path()).unwrap_or_default()
}

fn count(records: &[LogRecord], level: Level, message: &str) -> usize {
    records
        .iter()
        .filter(|r| r.level == level && r.message == message)
        .count()
}

fn history_len(guardian: &Guardian) -> usize {
    fs::read_dir(guardian.death_notes().history_dir()).map_or(0, Iterator::count)
}

#[tokio::test]
async fn fresh_start_is_clean() {
    let tmp = tempfile::TempDir::new().unwrap();
    let g = boot(tmp.path(), 50);

    assert_eq!(g.start_with(TrapOptions::none()).unwrap(), PostMortem::Clean);
    g.stop().await;

    let records = records(&g);
    assert!(records.iter().all(|r| r.level != Level::Alert));
    assert_eq!(count(&records, Level::Info, "guardian initialized"), 1);
    assert_eq!(history_len(&g), 0);
    assert!(tmp.path().join("logs").join("crash_log.log").exists());
}

#[tokio::test]
async fn uncaught_fault_is_recovered_on_next_start() {
    let tmp = tempfile::TempDir::new().unwrap();

    // First lifetime: a fault with message "boom".
    let first = boot(tmp.path(), 50);
    first.start_with(TrapOptions::none()).unwrap();
    let disposition = first.trap(TrapEvent::UncaughtFault {
        message: "boom".to_string(),
        stack: Some("panicked at src/handler.rs:42:9".to_string()),
    });
    assert_eq!(disposition, Disposition::Exit(1));
    first.stop().await;
    assert!(first.death_notes().marker_exists());

    let log = records(&first);
    let position = |level: Level| log.iter().position(|r| r.level == level).unwrap();
    let note_written = log
        .iter()
        .position(|r| r.message == "death note written")
        .unwrap();
    assert!(note_written < position(Level::Snapshot));
    assert!(position(Level::Snapshot) < position(Level::Fatal));

    // Second lifetime: the note is reported and archived.
    let second = boot(tmp.path(), 50);
    let outcome = second.start_with(TrapOptions::none()).unwrap();
    second.stop().await;

    let PostMortem::Recovered { note, archived_to } = outcome else {
        panic!("expected a recovered note, got {outcome:?}");
    };
    assert_eq!(note.reason, "UNCAUGHT_EXCEPTION");
    assert_eq!(note.error.unwrap().message, "boom");
    assert!(!note.graceful);
    assert!(archived_to.starts_with(second.death_notes().history_dir()));
    assert!(!second.death_notes().marker_exists());

    let log = records(&second);
    assert_eq!(
        count(&log, Level::Alert, "previous process did not exit cleanly"),
        1
    );
    assert_eq!(history_len(&second), 1);

    // ALERT comes before the guardian reports itself initialized.
    let alert = log.iter().position(|r| r.level == Level::Alert).unwrap();
    let init = log
        .iter()
        .rposition(|r| r.message == "guardian initialized")
        .unwrap();
    assert!(alert < init);
}

#[tokio::test]
async fn signal_stop_leaves_graceful_note() {
    let tmp = tempfile::TempDir::new().unwrap();
    let g = boot(tmp.path(), 50);
    g.start_with(TrapOptions::none()).unwrap();

    assert_eq!(g.trap(TrapEvent::Signal(TrapSignal::Term)), Disposition::Exit(0));
    g.stop().await;

    let next = boot(tmp.path(), 50);
    let outcome = next.start_with(TrapOptions::none()).unwrap();
    next.stop().await;
    let note = outcome.note().expect("signal note recovered");
    assert_eq!(note.reason, "SIGNAL_SIGTERM");
    assert!(note.graceful);
}

#[tokio::test]
async fn normal_exit_leaves_no_marker() {
    let tmp = tempfile::TempDir::new().unwrap();
    let g = boot(tmp.path(), 50);
    g.start_with(TrapOptions::none()).unwrap();
    g.stop().await;
    assert_eq!(g.exit(0), 0);
    assert!(!g.death_notes().marker_exists());

    let next = boot(tmp.path(), 50);
    assert_eq!(next.start_with(TrapOptions::none()).unwrap(), PostMortem::Clean);
    next.stop().await;
}

#[tokio::test]
async fn corrupt_marker_survives_startup() {
    let tmp = tempfile::TempDir::new().unwrap();
    let g = boot(tmp.path(), 50);
    let marker = g.death_notes().marker_path().to_path_buf();
    fs::create_dir_all(marker.parent().unwrap()).unwrap();
    fs::write(&marker, b"\x00\x01 not json").unwrap();

    let outcome = g.start_with(TrapOptions::none()).unwrap();
    g.stop().await;

    assert!(matches!(outcome, PostMortem::Corrupt { .. }));
    assert_eq!(fs::read(&marker).unwrap(), b"\x00\x01 not json");
    assert_eq!(history_len(&g), 0);
}

#[tokio::test]
async fn failed_task_is_reported_without_terminating() {
    let tmp = tempfile::TempDir::new().unwrap();
    let g = boot(tmp.path(), 50);
    g.start_with(TrapOptions::none()).unwrap();

    let failing = tokio::spawn(async { Err::<(), _>("upstream closed the stream") });
    assert_eq!(g.watch_task(failing).await.unwrap(), None);
    let fine = tokio::spawn(async { Ok::<_, String>(7) });
    assert_eq!(g.watch_task(fine).await.unwrap(), Some(7));
    g.stop().await;

    let log = records(&g);
    assert_eq!(count(&log, Level::Snapshot, "UNHANDLED_REJECTION"), 1);
    assert_eq!(count(&log, Level::Error, "upstream closed the stream"), 1);
    assert!(!g.death_notes().marker_exists());
    assert_eq!(g.traps().state(), deathwatch_core::LifecycleState::Running);
}

#[tokio::test(start_paused = true)]
async fn memory_pressure_is_detected_while_running() {
    let tmp = tempfile::TempDir::new().unwrap();
    let g = boot(tmp.path(), 900);
    g.start_with(TrapOptions::none()).unwrap();

    tokio::time::sleep(Duration::from_millis(3_100)).await;
    g.stop().await;

    let log = records(&g);
    assert_eq!(count(&log, Level::Snapshot, "HIGH_MEMORY_PRESSURE"), 1);
    let snap = log
        .iter()
        .find(|r| r.message == "HIGH_MEMORY_PRESSURE")
        .unwrap();
    assert_eq!(snap.extra["detail"], "rss=900.0MB");
}

#[tokio::test]
async fn snapshot_includes_in_flight_work() {
    let tmp = tempfile::TempDir::new().unwrap();
    let tracker = || {
        vec![WorkItem {
            method: "GET".to_string(),
            target: "/reports/monthly".to_string(),
            start_time: "2026-10-17T08:59:58.120Z".to_string(),
            origin: "192.0.2.10".to_string(),
        }]
    };
    let g = Guardian::with_probe(
        GuardianConfig::under(tmp.path()),
        Arc::new(tracker),
        StubProbe::new(50),
    );

    let snap = g.capture("MANUAL", Some("operator request"));
    assert_eq!(snap.ongoing_work.len(), 1);

    let log = records(&g);
    assert_eq!(
        log[0].extra["snapshot"]["ongoing_work"][0]["target"],
        "/reports/monthly"
    );
    // Optional sources the probe does not provide are omitted.
    assert!(log[0].extra["snapshot"].get("cpu").is_none());
}

#[tokio::test]
async fn unwritable_store_never_propagates() {
    let tmp = tempfile::TempDir::new().unwrap();
    fs::write(tmp.path().join("logs"), "a file where the log dir should be").unwrap();
    let g = boot(tmp.path(), 900);

    assert_eq!(g.start_with(TrapOptions::none()).unwrap(), PostMortem::Clean);
    g.capture("MANUAL", None);
    g.trap(TrapEvent::UnhandledRejection {
        reason: "ignored".to_string(),
    });
    assert_eq!(
        g.trap(TrapEvent::UncaughtFault {
            message: "boom".to_string(),
            stack: None,
        }),
        Disposition::Exit(1)
    );
    g.stop().await;
}
