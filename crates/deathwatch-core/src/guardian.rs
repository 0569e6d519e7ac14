//! The process-wide guardian instance.
//!
//! One [`Guardian`] is built at startup and owns every component: crash log,
//! snapshot collector, death-note store, trap layer, lag probe and watchdog.
//! Nothing here is ambient global state except the panic hook and the signal
//! handlers, which [`Guardian::start`] registers exactly once.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::GuardianConfig;
use crate::death_note::{DeathNoteStore, PostMortem};
use crate::error::{Error, Result};
use crate::journal::{CrashLog, Level};
use crate::lag::LagMonitor;
use crate::probe::{OsProbe, ProcessProbe};
use crate::snapshot::{SnapshotCollector, SystemSnapshot};
use crate::trap::{self, Disposition, TrapEvent, TrapLayer};
use crate::tracker::WorkTracker;
use crate::watchdog::{WatchdogHandle, spawn_watchdog};

/// Which process-wide hooks [`Guardian::start_with`] installs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapOptions {
    /// Route panics to the trap layer (and exit with status 1).
    pub panics: bool,
    /// Trap `SIGTERM`, `SIGINT` and `SIGABRT` (and exit with status 0).
    pub signals: bool,
}

impl Default for TrapOptions {
    fn default() -> Self {
        Self {
            panics: true,
            signals: true,
        }
    }
}

impl TrapOptions {
    /// No process-wide hooks; for embedding in test harnesses.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            panics: false,
            signals: false,
        }
    }
}

struct Running {
    watchdog: WatchdogHandle,
    lag_probe: JoinHandle<()>,
    lag_shutdown: Arc<AtomicBool>,
    signals: Option<JoinHandle<()>>,
}

/// In-process crash guardian.
pub struct Guardian {
    config: GuardianConfig,
    log: Arc<CrashLog>,
    collector: SnapshotCollector,
    death_notes: Arc<DeathNoteStore>,
    traps: Arc<TrapLayer>,
    lag: LagMonitor,
    running: Mutex<Option<Running>>,
}

impl Guardian {
    /// Build a guardian reading metrics from the operating system.
    pub fn new(config: GuardianConfig, tracker: Arc<dyn WorkTracker>) -> Arc<Self> {
        Self::with_probe(config, tracker, Arc::new(OsProbe::new()))
    }

    /// Build a guardian with a custom metric source.
    pub fn with_probe(
        config: GuardianConfig,
        tracker: Arc<dyn WorkTracker>,
        probe: Arc<dyn ProcessProbe>,
    ) -> Arc<Self> {
        let log = Arc::new(CrashLog::new(&config.paths.log_file));
        let collector = SnapshotCollector::new(Arc::clone(&log), probe, tracker);
        let death_notes = Arc::new(DeathNoteStore::new(
            &config.paths.death_note,
            &config.paths.history_dir,
            Arc::clone(&log),
        ));
        let traps = Arc::new(TrapLayer::new(collector.clone(), Arc::clone(&death_notes)));
        let lag = LagMonitor::new(config.thresholds.lag_resolution());

        Arc::new(Self {
            config,
            log,
            collector,
            death_notes,
            traps,
            lag,
            running: Mutex::new(None),
        })
    }

    /// Start with every trap installed. See [`start_with`](Self::start_with).
    pub fn start(&self) -> Result<PostMortem> {
        self.start_with(TrapOptions::default())
    }

    /// Prepare the log store, run the post-mortem check, register traps and
    /// spawn the watchdog.
    ///
    /// Must be called from inside a tokio runtime. Returns the outcome of the
    /// post-mortem check so the host can act on a previous crash.
    ///
    /// Thresholds are validated first; an invalid config touches nothing on
    /// disk and spawns nothing.
    pub fn start_with(&self, options: TrapOptions) -> Result<PostMortem> {
        tokio::runtime::Handle::try_current()
            .map_err(|_| Error::Runtime("guardian must start inside a tokio runtime".to_string()))?;
        self.config.validate()?;

        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return Err(Error::Runtime("guardian already started".to_string()));
        }

        self.log.ensure_store();
        let post_mortem = self.death_notes.check_post_mortem();

        let signals = if options.signals {
            Some(trap::spawn_signal_listener(Arc::clone(&self.traps))?)
        } else {
            None
        };

        let lag_shutdown = Arc::new(AtomicBool::new(false));
        let lag_probe = self.lag.spawn(Arc::clone(&lag_shutdown));
        let watchdog = spawn_watchdog(
            self.config.thresholds.clone(),
            self.collector.clone(),
            Arc::new(self.lag.clone()),
        );

        if options.panics {
            trap::install_panic_hook(Arc::clone(&self.traps));
        }

        *running = Some(Running {
            watchdog,
            lag_probe,
            lag_shutdown,
            signals,
        });
        drop(running);

        self.log.log(
            Level::Info,
            "guardian initialized",
            json!({
                "version": crate::VERSION,
                "log_file": self.config.paths.log_file.display().to_string(),
                "death_note": self.config.paths.death_note.display().to_string(),
                "thresholds": self.config.thresholds,
                "panic_hook": options.panics,
                "signal_traps": options.signals,
            }),
        );
        Ok(post_mortem)
    }

    /// Stop the watchdog and lag probe and wait for them. Signal traps are
    /// removed; the panic hook stays installed.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(running) = running else {
            return;
        };

        running.watchdog.signal_shutdown();
        running.lag_shutdown.store(true, Ordering::SeqCst);
        if let Some(signals) = running.signals {
            signals.abort();
        }
        running.watchdog.join().await;
        let _ = running.lag_probe.await;
        info!("Guardian stopped");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Supervise a fallible task: an `Err` outcome is reported as an
    /// unhandled rejection and the process keeps running.
    pub fn watch_task<T, E>(&self, task: JoinHandle<std::result::Result<T, E>>) -> JoinHandle<Option<T>>
    where
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        let traps = Arc::clone(&self.traps);
        tokio::spawn(async move {
            match task.await {
                Ok(Ok(value)) => Some(value),
                Ok(Err(e)) => {
                    traps.handle(TrapEvent::UnhandledRejection {
                        reason: e.to_string(),
                    });
                    None
                }
                Err(join) if join.is_panic() => {
                    traps.handle(TrapEvent::UnhandledRejection {
                        reason: format!("supervised task panicked: {join}"),
                    });
                    None
                }
                Err(join) => {
                    debug!(error = %join, "Supervised task cancelled");
                    None
                }
            }
        })
    }

    /// Record a normal exit and return the status the host should exit with.
    pub fn exit(&self, code: i32) -> i32 {
        match self.traps.handle(TrapEvent::Exit { code }) {
            Disposition::Exit(status) => status,
            _ => code,
        }
    }

    /// Route a lifecycle event directly.
    pub fn trap(&self, event: TrapEvent) -> Disposition {
        self.traps.handle(event)
    }

    /// Capture and log a snapshot on demand.
    pub fn capture(&self, reason: &str, detail: Option<&str>) -> SystemSnapshot {
        self.collector.capture(reason, detail)
    }

    /// Append a record to the crash log.
    pub fn log(&self, level: Level, message: impl Into<String>, extra: serde_json::Value) {
        self.log.log(level, message, extra);
    }

    #[must_use]
    pub fn config(&self) -> &GuardianConfig {
        &self.config
    }

    #[must_use]
    pub fn crash_log(&self) -> &Arc<CrashLog> {
        &self.log
    }

    #[must_use]
    pub fn death_notes(&self) -> &Arc<DeathNoteStore> {
        &self.death_notes
    }

    #[must_use]
    pub fn traps(&self) -> &Arc<TrapLayer> {
        &self.traps
    }

    #[must_use]
    pub fn lag_monitor(&self) -> &LagMonitor {
        &self.lag
    }
}
