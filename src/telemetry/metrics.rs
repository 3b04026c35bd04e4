//! Metrics collection for engine monitoring.

use hdrhistogram::Histogram;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

// One hour in nanoseconds.
const MAX_TRACKED_LATENCY_NS: u64 = 3_600_000_000_000;

/// Engine metrics collector
#[derive(Debug)]
pub struct Metrics {
    tasks_executed: AtomicU64,
    tasks_cancelled: AtomicU64,
    ticks: AtomicU64,
    tick_overruns: AtomicU64,

    // None only if the histogram could not be allocated.
    latency_histogram: Option<RwLock<Histogram<u64>>>,

    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        let latency_histogram = Histogram::new_with_max(MAX_TRACKED_LATENCY_NS, 3)
            .ok()
            .map(RwLock::new);

        Self {
            tasks_executed: AtomicU64::new(0),
            tasks_cancelled: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
            tick_overruns: AtomicU64::new(0),
            latency_histogram,
            start_time: Instant::now(),
        }
    }

    /// Record a finished task body and how long it ran
    pub fn record_task_execution(&self, duration: Duration) {
        self.tasks_executed.fetch_add(1, Ordering::Relaxed);

        if let Some(hist) = &self.latency_histogram {
            if let Some(mut hist) = hist.try_write() {
                let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
                let _ = hist.record(ns.min(MAX_TRACKED_LATENCY_NS));
            }
        }
    }

    /// Record a cancel request delivered to a running task
    pub fn record_task_cancelled(&self) {
        self.tasks_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one periodic tick
    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a tick whose work took longer than its period
    pub fn record_tick_overrun(&self) {
        self.tick_overruns.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let (avg_latency_ns, p99_latency_ns, max_latency_ns) = match &self.latency_histogram {
            Some(hist) => {
                let hist = hist.read();
                if hist.len() > 0 {
                    (
                        hist.mean() as u64,
                        hist.value_at_quantile(0.99),
                        hist.max(),
                    )
                } else {
                    (0, 0, 0)
                }
            }
            None => (0, 0, 0),
        };

        MetricsSnapshot {
            uptime: self.start_time.elapsed(),
            tasks_executed: self.tasks_executed.load(Ordering::Relaxed),
            tasks_cancelled: self.tasks_cancelled.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            tick_overruns: self.tick_overruns.load(Ordering::Relaxed),
            avg_latency_ns,
            p99_latency_ns,
            max_latency_ns,
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.tasks_executed.store(0, Ordering::Relaxed);
        self.tasks_cancelled.store(0, Ordering::Relaxed);
        self.ticks.store(0, Ordering::Relaxed);
        self.tick_overruns.store(0, Ordering::Relaxed);

        if let Some(hist) = &self.latency_histogram {
            hist.write().reset();
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub uptime: Duration,
    pub tasks_executed: u64,
    pub tasks_cancelled: u64,
    pub ticks: u64,
    pub tick_overruns: u64,
    pub avg_latency_ns: u64,
    pub p99_latency_ns: u64,
    pub max_latency_ns: u64,
}

impl MetricsSnapshot {
    /// Calculate tasks per second
    pub fn tasks_per_second(&self) -> f64 {
        let seconds = self.uptime.as_secs_f64();
        if seconds == 0.0 {
            return 0.0;
        }
        self.tasks_executed as f64 / seconds
    }
}
