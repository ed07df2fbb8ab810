//! Per-breaker call statistics
//!
//! Counts admitted, failed and rejected calls and keeps a bounded window of
//! latency samples for percentiles.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

/// Latency samples kept per breaker
const LATENCY_WINDOW: usize = 512;

/// Call statistics for one guarded dependency
pub struct CallStats {
    successes: AtomicU64,
    failures: AtomicU64,
    rejected: AtomicU64,
    last_success: RwLock<Option<DateTime<Utc>>>,
    last_failure: RwLock<Option<DateTime<Utc>>>,
    latencies: Mutex<LatencyWindow>,
}

impl Default for CallStats {
    fn default() -> Self {
        Self {
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            last_success: RwLock::new(None),
            last_failure: RwLock::new(None),
            latencies: Mutex::new(LatencyWindow::new(LATENCY_WINDOW)),
        }
    }
}

impl CallStats {
    /// Record a call that the dependency answered
    pub fn record_success(&self, latency: Duration) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        *self.last_success.write() = Some(Utc::now());
        self.latencies.lock().record(latency);
    }

    /// Record a failed call
    pub fn record_failure(&self, latency: Duration) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        *self.last_failure.write() = Some(Utc::now());
        self.latencies.lock().record(latency);
    }

    /// Record a call the breaker refused to admit
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counters and latency percentiles
    #[must_use]
    pub fn snapshot(&self) -> CallStatsSnapshot {
        let latencies = self.latencies.lock().sorted();
        CallStatsSnapshot {
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            last_success: *self.last_success.read(),
            last_failure: *self.last_failure.read(),
            latency_p50_ms: percentile(&latencies, 0.50),
            latency_p95_ms: percentile(&latencies, 0.95),
            latency_p99_ms: percentile(&latencies, 0.99),
        }
    }
}

/// Snapshot of [`CallStats`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallStatsSnapshot {
    /// Calls that succeeded
    pub successes: u64,
    /// Calls that failed (errors and timeouts)
    pub failures: u64,
    /// Calls rejected while open
    pub rejected: u64,
    /// Time of the last success
    pub last_success: Option<DateTime<Utc>>,
    /// Time of the last failure
    pub last_failure: Option<DateTime<Utc>>,
    /// Median latency
    pub latency_p50_ms: Option<u64>,
    /// 95th percentile latency
    pub latency_p95_ms: Option<u64>,
    /// 99th percentile latency
    pub latency_p99_ms: Option<u64>,
}

/// Fixed-size FIFO of latency samples in milliseconds
struct LatencyWindow {
    samples: VecDeque<u64>,
    capacity: usize,
}

impl LatencyWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn record(&mut self, latency: Duration) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples
            .push_back(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX));
    }

    fn sorted(&self) -> Vec<u64> {
        let mut samples: Vec<u64> = self.samples.iter().copied().collect();
        samples.sort_unstable();
        samples
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn percentile(sorted: &[u64], p: f64) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let index = ((sorted.len() as f64) * p).floor() as usize;
    Some(sorted[index.min(sorted.len() - 1)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts() {
        let stats = CallStats::default();
        stats.record_success(Duration::from_millis(5));
        stats.record_success(Duration::from_millis(7));
        stats.record_failure(Duration::from_millis(400));
        stats.record_rejected();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.successes, 2);
        assert_eq!(snapshot.failures, 1);
        assert_eq!(snapshot.rejected, 1);
        assert!(snapshot.last_success.is_some());
        assert!(snapshot.last_failure.is_some());
    }

    #[test]
    fn test_percentiles() {
        let stats = CallStats::default();
        for ms in [10, 20, 30, 40, 50] {
            stats.record_success(Duration::from_millis(ms));
        }
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.latency_p50_ms, Some(30));
        assert_eq!(snapshot.latency_p99_ms, Some(50));
    }

    #[test]
    fn test_empty_has_no_percentiles() {
        let snapshot = CallStats::default().snapshot();
        assert_eq!(snapshot.latency_p50_ms, None);
        assert_eq!(snapshot.successes, 0);
    }

    #[test]
    fn test_window_drops_oldest() {
        let mut window = LatencyWindow::new(3);
        for ms in [100, 1, 2, 3] {
            window.record(Duration::from_millis(ms));
        }
        assert_eq!(window.sorted(), vec![1, 2, 3]);
    }
}
