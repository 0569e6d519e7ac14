//! Point-in-time runtime health snapshots.
//!
//! [`SystemSnapshot::collect`] is a pure read of the probe and the host's
//! work tracker. [`SnapshotCollector::capture`] additionally appends a
//! `SNAPSHOT` record to the crash log. Neither takes locks on task-owned
//! state, so both are safe to call from a fault handler that interrupted
//! arbitrary work.

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::journal::{CrashLog, Level};
use crate::probe::{CpuUsage, HeapStatistics, LoadAverage, MemoryUsage, ProcessProbe};
use crate::tracker::{WorkItem, WorkTracker};

/// Runtime health bundle. Recomputed on demand, never mutated.
///
/// Optional fields are omitted from JSON when their source was unavailable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub captured_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_average: Option<LoadAverage>,
    pub uptime_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heap: Option<HeapStatistics>,
    /// Open file descriptors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_handles: Option<usize>,
    /// Alive async tasks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_requests: Option<usize>,
    /// Copy of the host's in-flight work at capture time
    #[serde(default)]
    pub ongoing_work: Vec<WorkItem>,
}

impl SystemSnapshot {
    /// Read every metric source once.
    pub fn collect(probe: &dyn ProcessProbe, tracker: &dyn WorkTracker) -> Self {
        Self {
            captured_at: Utc::now().trunc_subsecs(3),
            memory: probe.memory(),
            cpu: probe.cpu(),
            load_average: probe.load_average(),
            uptime_secs: probe.uptime().as_secs_f64(),
            heap: probe.heap(),
            active_handles: probe.open_handles(),
            active_requests: probe.active_tasks(),
            ongoing_work: tracker.in_flight(),
        }
    }

    /// JSON form for log payloads. Falls back to `null` rather than failing.
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Captures snapshots and records them in the crash log.
#[derive(Clone)]
pub struct SnapshotCollector {
    log: Arc<CrashLog>,
    probe: Arc<dyn ProcessProbe>,
    tracker: Arc<dyn WorkTracker>,
}

impl SnapshotCollector {
    pub fn new(
        log: Arc<CrashLog>,
        probe: Arc<dyn ProcessProbe>,
        tracker: Arc<dyn WorkTracker>,
    ) -> Self {
        Self {
            log,
            probe,
            tracker,
        }
    }

    /// Snapshot without logging (used when embedding into a death note).
    pub fn collect(&self) -> SystemSnapshot {
        SystemSnapshot::collect(self.probe.as_ref(), self.tracker.as_ref())
    }

    /// Capture a snapshot and emit a `SNAPSHOT` record with `reason` as its
    /// message.
    pub fn capture(&self, reason: &str, detail: Option<&str>) -> SystemSnapshot {
        let snapshot = self.collect();
        let mut extra = json!({ "snapshot": snapshot.to_value() });
        if let Some(detail) = detail {
            extra["detail"] = json!(detail);
        }
        self.log.log(Level::Snapshot, reason, extra);
        snapshot
    }

    #[must_use]
    pub fn probe(&self) -> &Arc<dyn ProcessProbe> {
        &self.probe
    }

    #[must_use]
    pub fn log(&self) -> &Arc<CrashLog> {
        &self.log
    }
}
