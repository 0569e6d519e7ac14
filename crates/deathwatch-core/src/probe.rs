//! Process metric sources.
//!
//! Every reading is optional: a source that is unavailable on the current
//! platform (or fails transiently) yields `None`, and the snapshot simply
//! omits the field.
//!
//! - **Linux**: memory segments from `/proc/self/status`, open descriptors
//!   from `/proc/self/fd`, load average from `/proc/loadavg`, process start
//!   time from `/proc/self/stat`
//! - **Unix**: CPU time via `getrusage(RUSAGE_SELF)`
//! - **Any**: alive task count from the current tokio runtime, if any

use std::sync::LazyLock;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Resident and heap memory of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    /// Resident set size in bytes
    pub rss_bytes: u64,
    /// Data segment (heap and anonymous mappings) in bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heap_used_bytes: Option<u64>,
}

impl MemoryUsage {
    #[must_use]
    pub fn rss_mb(&self) -> f64 {
        self.rss_bytes as f64 / (1024.0 * 1024.0)
    }

    #[must_use]
    pub fn heap_used_mb(&self) -> Option<f64> {
        self.heap_used_bytes.map(|b| b as f64 / (1024.0 * 1024.0))
    }
}

/// CPU time consumed by the process since it started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuUsage {
    pub user_micros: u64,
    pub system_micros: u64,
}

/// System load averages (1, 5, 15 minutes).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

/// Address-space statistics of the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapStatistics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak_rss_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap_bytes: Option<u64>,
}

/// Source of process-level readings.
///
/// Implementations must be cheap and non-blocking: they are called from
/// sampler ticks and from fault handlers.
pub trait ProcessProbe: Send + Sync {
    fn memory(&self) -> Option<MemoryUsage>;
    fn cpu(&self) -> Option<CpuUsage>;
    fn load_average(&self) -> Option<LoadAverage>;
    fn heap(&self) -> Option<HeapStatistics>;
    /// Open file descriptors.
    fn open_handles(&self) -> Option<usize>;
    /// Alive tasks on the current async runtime.
    fn active_tasks(&self) -> Option<usize>;
    fn uptime(&self) -> Duration;
}

/// Fallback uptime origin where the kernel does not report a start time.
static FIRST_PROBE: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Production probe reading from the operating system.
#[derive(Debug, Clone)]
pub struct OsProbe;

impl Default for OsProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl OsProbe {
    #[must_use]
    pub fn new() -> Self {
        LazyLock::force(&FIRST_PROBE);
        Self
    }
}

impl ProcessProbe for OsProbe {
    fn memory(&self) -> Option<MemoryUsage> {
        let status = read_proc_status()?;
        Some(MemoryUsage {
            rss_bytes: status_kb(&status, "VmRSS")?,
            heap_used_bytes: status_kb(&status, "VmData"),
        })
    }

    fn cpu(&self) -> Option<CpuUsage> {
        #[cfg(unix)]
        {
            use nix::sys::resource::{UsageWho, getrusage};

            let usage = getrusage(UsageWho::RUSAGE_SELF).ok()?;
            let micros = |tv: nix::sys::time::TimeVal| {
                (tv.tv_sec() as u64) * 1_000_000 + tv.tv_usec() as u64
            };
            Some(CpuUsage {
                user_micros: micros(usage.user_time()),
                system_micros: micros(usage.system_time()),
            })
        }
        #[cfg(not(unix))]
        {
            None
        }
    }

    fn load_average(&self) -> Option<LoadAverage> {
        let contents = std::fs::read_to_string("/proc/loadavg").ok()?;
        parse_loadavg(&contents)
    }

    fn heap(&self) -> Option<HeapStatistics> {
        let status = read_proc_status()?;
        let stats = HeapStatistics {
            virtual_bytes: status_kb(&status, "VmSize"),
            data_bytes: status_kb(&status, "VmData"),
            peak_rss_bytes: status_kb(&status, "VmHWM"),
            swap_bytes: status_kb(&status, "VmSwap"),
        };
        (stats != HeapStatistics::default()).then_some(stats)
    }

    fn open_handles(&self) -> Option<usize> {
        std::fs::read_dir("/proc/self/fd")
            .ok()
            .map(|entries| entries.filter_map(Result::ok).count())
    }

    fn active_tasks(&self) -> Option<usize> {
        tokio::runtime::Handle::try_current()
            .ok()
            .map(|handle| handle.metrics().num_alive_tasks())
    }

    /// Time since the process started, or since the first probe was built
    /// when `/proc` is unavailable.
    fn uptime(&self) -> Duration {
        process_uptime().unwrap_or_else(|| FIRST_PROBE.elapsed())
    }
}

#[cfg(target_os = "linux")]
fn process_uptime() -> Option<Duration> {
    use nix::unistd::{SysconfVar, sysconf};

    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    let start_ticks = parse_start_ticks(&stat)?;
    let ticks_per_sec = sysconf(SysconfVar::CLK_TCK).ok()??;
    if ticks_per_sec <= 0 {
        return None;
    }
    let boot = std::fs::read_to_string("/proc/uptime").ok()?;
    let since_boot: f64 = boot.split_whitespace().next()?.parse().ok()?;
    let started = start_ticks as f64 / ticks_per_sec as f64;
    Duration::try_from_secs_f64((since_boot - started).max(0.0)).ok()
}

#[cfg(not(target_os = "linux"))]
fn process_uptime() -> Option<Duration> {
    None
}

/// Field 22 of `/proc/<pid>/stat` (start time in clock ticks after boot).
/// The command name in field 2 may contain spaces and parentheses, so
/// fields are counted from the last `)`.
pub(crate) fn parse_start_ticks(stat: &str) -> Option<u64> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().nth(19)?.parse().ok()
}

fn read_proc_status() -> Option<String> {
    std::fs::read_to_string("/proc/self/status").ok()
}

/// Extract a `Key:   12345 kB` line from `/proc/<pid>/status`, in bytes.
pub(crate) fn status_kb(contents: &str, key: &str) -> Option<u64> {
    contents.lines().find_map(|line| {
        let rest = line.strip_prefix(key)?.strip_prefix(':')?;
        let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
        Some(kb * 1024)
    })
}

/// Parse `/proc/loadavg`: `0.52 0.58 0.59 1/389 12345`.
pub(crate) fn parse_loadavg(contents: &str) -> Option<LoadAverage> {
    let mut fields = contents.split_whitespace();
    let mut next = || fields.next()?.parse::<f64>().ok();
    Some(LoadAverage {
        one: next()?,
        five: next()?,
        fifteen: next()?,
    })
}
