//! Watchdog scheduler: heartbeat, lag sampler and memory sampler.
//!
//! Each probe is its own task with its own interval, so a stall in one
//! metric's collection path cannot suppress the others. Ticks are short and
//! synchronous; a sampler that cannot read its source skips the tick.
//!
//! The first tick of every task fires one full period after spawn, not
//! immediately.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::config::WatchdogThresholds;
use crate::journal::Level;
use crate::lag::{LagSource, LagStats};
use crate::probe::MemoryUsage;
use crate::snapshot::SnapshotCollector;

/// Snapshot reason for a lag alarm.
pub const EVENT_LOOP_BLOCKED: &str = "EVENT_LOOP_BLOCKED";
/// Snapshot reason for a memory alarm.
pub const HIGH_MEMORY_PRESSURE: &str = "HIGH_MEMORY_PRESSURE";

/// Handle returned by [`spawn_watchdog`] to control the sampler tasks.
pub struct WatchdogHandle {
    tasks: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WatchdogHandle {
    /// Ask every sampler to stop after its current tick.
    pub fn signal_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Wait for all sampler tasks to finish.
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Spawn the heartbeat, lag and memory tasks on the current runtime.
#[must_use]
pub fn spawn_watchdog(
    thresholds: WatchdogThresholds,
    collector: SnapshotCollector,
    lag: Arc<dyn LagSource>,
) -> WatchdogHandle {
    let (shutdown, rx) = watch::channel(false);

    let heartbeat = {
        let collector = collector.clone();
        periodic(
            "heartbeat",
            thresholds.heartbeat_interval(),
            rx.clone(),
            move || heartbeat_tick(&collector),
        )
    };

    let lag_sampler = {
        let collector = collector.clone();
        let threshold = thresholds.lag_alarm_ms;
        periodic(
            "lag sampler",
            thresholds.lag_sample_interval(),
            rx.clone(),
            move || {
                if let Some(detail) = lag.take_window().and_then(|s| lag_alarm(&s, threshold)) {
                    collector.capture(EVENT_LOOP_BLOCKED, Some(&detail));
                }
            },
        )
    };

    let memory_sampler = {
        let threshold = thresholds.rss_alarm_mb;
        periodic(
            "memory sampler",
            thresholds.memory_sample_interval(),
            rx,
            move || {
                let reading = collector.probe().memory();
                if let Some(detail) = reading.and_then(|m| memory_alarm(&m, threshold)) {
                    collector.capture(HIGH_MEMORY_PRESSURE, Some(&detail));
                }
            },
        )
    };

    info!(
        heartbeat_ms = thresholds.heartbeat_interval_ms,
        lag_sample_ms = thresholds.lag_sample_interval_ms,
        memory_sample_ms = thresholds.memory_sample_interval_ms,
        "Watchdog started"
    );

    WatchdogHandle {
        tasks: vec![tokio::spawn(heartbeat), tokio::spawn(lag_sampler), tokio::spawn(memory_sampler)],
        shutdown,
    }
}

fn periodic<F>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> impl Future<Output = ()> + Send + 'static
where
    F: FnMut() + Send + 'static,
{
    async move {
        let start = tokio::time::Instant::now() + period;
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    // A dropped sender also means stop.
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *shutdown.borrow() {
                break;
            }
            tick();
        }
        debug!(task = name, "Watchdog task stopped");
    }
}

fn heartbeat_tick(collector: &SnapshotCollector) {
    let uptime = collector.probe().uptime().as_secs_f64();
    collector.log().log(
        Level::Heartbeat,
        "process alive",
        json!({ "uptime_secs": uptime }),
    );
}

/// Alarm detail when the window's mean lag exceeds `threshold_ms`.
pub(crate) fn lag_alarm(stats: &LagStats, threshold_ms: f64) -> Option<String> {
    (stats.mean_ms > threshold_ms).then(|| {
        format!(
            "mean lag {:.1}ms over {} samples (max {:.1}ms, p99 <= {:.0}ms)",
            stats.mean_ms, stats.count, stats.max_ms, stats.p99_ms
        )
    })
}

/// Alarm detail when resident memory exceeds `threshold_mb`.
pub(crate) fn memory_alarm(usage: &MemoryUsage, threshold_mb: f64) -> Option<String> {
    let rss = usage.rss_mb();
    (rss > threshold_mb).then(|| match usage.heap_used_mb() {
        Some(heap) => format!("rss={rss:.1}MB heap={heap:.1}MB"),
        None => format!("rss={rss:.1}MB"),
    })
}
