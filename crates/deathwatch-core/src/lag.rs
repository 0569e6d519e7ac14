//! Scheduling-lag measurement.
//!
//! A probe task sleeps for a fixed resolution and records how late it woke
//! up. When the runtime's threads are starved by blocking work, wake-ups
//! overshoot and the recorded delays grow. The lag sampler in
//! [`crate::watchdog`] reads the mean of the current window and resets it.
//!
//! On a multi-thread runtime the probe is scheduled on whichever worker is
//! free, so one task blocking one worker goes unnoticed; only starvation of
//! every worker shows up. Hosts that want single-loop semantics run on a
//! `current_thread` runtime, where any blocking task delays the probe.
//!
//! # Bucket scheme
//!
//! Delays are kept in a log-scale histogram with power-of-two millisecond
//! buckets: `[0, 1)` as underflow, then `[1, 2)`, `[2, 4)`, ... up to
//! `2^max_exp`. Exact sum, min and max are tracked alongside, so the mean
//! is exact while percentiles are bucket upper bounds capped at the max.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

/// Power-of-two latency histogram in milliseconds.
#[derive(Debug, Clone)]
pub struct LagHistogram {
    buckets: Vec<u64>,
    underflow: u64,
    overflow: u64,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

/// Summary of a histogram window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LagStats {
    pub count: u64,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p99_ms: f64,
}

impl Default for LagHistogram {
    fn default() -> Self {
        // 2^20 ms is about 17 minutes; anything longer lands in overflow.
        Self::new(20)
    }
}

impl LagHistogram {
    /// Buckets cover `[1, 2^max_exp)` ms.
    ///
    /// # Panics
    ///
    /// Panics if `max_exp` is not positive.
    #[must_use]
    pub fn new(max_exp: i32) -> Self {
        assert!(max_exp > 0, "max_exp must be > 0");
        Self {
            buckets: vec![0; max_exp as usize],
            underflow: 0,
            overflow: 0,
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn record(&mut self, ms: f64) {
        if !ms.is_finite() {
            return;
        }
        let ms = ms.max(0.0);
        self.count += 1;
        self.sum += ms;
        self.min = self.min.min(ms);
        self.max = self.max.max(ms);

        if ms < 1.0 {
            self.underflow += 1;
            return;
        }
        let idx = ms.log2().floor() as usize;
        match self.buckets.get_mut(idx) {
            Some(bucket) => *bucket += 1,
            None => self.overflow += 1,
        }
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    #[must_use]
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    #[must_use]
    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    /// Upper bound of the bucket holding percentile `p` (0.0 to 1.0), capped
    /// at the largest recorded value.
    #[must_use]
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let target = (p.clamp(0.0, 1.0) * self.count as f64).ceil().max(1.0) as u64;
        let mut cumulative = self.underflow;
        if cumulative >= target {
            return Some(self.max.min(1.0));
        }
        for (i, &n) in self.buckets.iter().enumerate() {
            cumulative += n;
            if cumulative >= target {
                return Some(2f64.powi(i as i32 + 1).min(self.max));
            }
        }
        Some(self.max)
    }

    #[must_use]
    pub fn stats(&self) -> Option<LagStats> {
        Some(LagStats {
            count: self.count,
            mean_ms: self.mean()?,
            min_ms: self.min,
            max_ms: self.max,
            p99_ms: self.percentile(0.99)?,
        })
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.buckets.len() as i32);
    }
}

/// Source of the mean scheduling lag for the current sampling window.
pub trait LagSource: Send + Sync {
    /// Return the window's statistics and start a new window.
    /// `None` when nothing was recorded.
    fn take_window(&self) -> Option<LagStats>;
}

/// Timer-drift probe feeding a shared [`LagHistogram`].
#[derive(Debug, Clone)]
pub struct LagMonitor {
    histogram: Arc<Mutex<LagHistogram>>,
    resolution: Duration,
}

impl LagMonitor {
    #[must_use]
    pub fn new(resolution: Duration) -> Self {
        Self {
            histogram: Arc::new(Mutex::new(LagHistogram::default())),
            resolution: resolution.max(Duration::from_millis(1)),
        }
    }

    /// Record a single measured delay (exposed for hosts with their own
    /// scheduling loop).
    pub fn record(&self, delay: Duration) {
        self.histogram
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(delay.as_secs_f64() * 1000.0);
    }

    /// Spawn the probe task on the current runtime.
    #[must_use]
    pub fn spawn(&self, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            loop {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                let expected = tokio::time::Instant::now() + monitor.resolution;
                tokio::time::sleep_until(expected).await;
                let overshoot = tokio::time::Instant::now().saturating_duration_since(expected);
                monitor.record(overshoot);
            }
            tracing::debug!("Lag probe stopped");
        })
    }
}

impl LagSource for LagMonitor {
    fn take_window(&self) -> Option<LagStats> {
        let mut histogram = self.histogram.lock().unwrap_or_else(PoisonError::into_inner);
        let stats = histogram.stats();
        histogram.reset();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_histogram_has_no_stats() {
        let h = LagHistogram::default();
        assert_eq!(h.count(), 0);
        assert!(h.mean().is_none());
        assert!(h.percentile(0.5).is_none());
        assert!(h.stats().is_none());
    }

    #[test]
    fn mean_is_exact() {
        let mut h = LagHistogram::default();
        for v in [0.5, 10.0, 2500.0, 3.5] {
            h.record(v);
        }
        assert!((h.mean().unwrap() - 628.5).abs() < 1e-9);
        assert!((h.max().unwrap() - 2500.0).abs() < 1e-9);
    }

    #[test]
    fn percentile_returns_bucket_upper_bound() {
        let mut h = LagHistogram::default();
        for _ in 0..99 {
            h.record(3.0); // bucket [2, 4)
        }
        h.record(1000.0); // bucket [512, 1024)
        assert!((h.percentile(0.5).unwrap() - 4.0).abs() < 1e-9);
        assert!((h.percentile(1.0).unwrap() - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn percentile_never_exceeds_max() {
        let mut h = LagHistogram::default();
        h.record(2496.4); // bucket [2048, 4096)
        let stats = h.stats().unwrap();
        assert!((stats.p99_ms - 2496.4).abs() < 1e-9);
        assert!(stats.p99_ms <= stats.max_ms);

        let mut small = LagHistogram::default();
        small.record(0.25);
        assert!((small.percentile(0.99).unwrap() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn overflow_percentile_is_max() {
        let mut h = LagHistogram::new(4); // up to 16 ms
        h.record(100.0);
        assert!((h.percentile(0.99).unwrap() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn negative_and_nan_inputs() {
        let mut h = LagHistogram::default();
        h.record(f64::NAN);
        h.record(-5.0);
        assert_eq!(h.count(), 1);
        assert!((h.mean().unwrap()).abs() < 1e-9);
    }

    #[test]
    fn reset_clears_window() {
        let mut h = LagHistogram::default();
        h.record(42.0);
        h.reset();
        assert_eq!(h.count(), 0);
        assert!(h.mean().is_none());
    }

    #[test]
    fn take_window_resets() {
        let monitor = LagMonitor::new(Duration::from_millis(20));
        monitor.record(Duration::from_millis(2500));
        monitor.record(Duration::from_millis(2500));
        let stats = monitor.take_window().unwrap();
        assert_eq!(stats.count, 2);
        assert!((stats.mean_ms - 2500.0).abs() < 1e-9);
        assert!(monitor.take_window().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn probe_records_samples_and_stops() {
        let monitor = LagMonitor::new(Duration::from_millis(20));
        let shutdown = Arc::new(AtomicBool::new(false));
        let task = monitor.spawn(Arc::clone(&shutdown));

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(40)).await;
        task.await.unwrap();

        let stats = monitor.take_window().unwrap();
        assert!(stats.count >= 5, "expected several probe samples, got {}", stats.count);
        // Paused time never overshoots.
        assert!(stats.mean_ms < 1.0);
    }
}
