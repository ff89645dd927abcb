//! Submit-latency accounting for one carrier service.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

/// Count/sum/min/max bundle, updated lock-free.
#[derive(Debug)]
struct Accumulator {
    count: AtomicU64,
    sum_ms: AtomicU64,
    min_ms: AtomicU64,
    max_ms: AtomicU64,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum_ms: AtomicU64::new(0),
            min_ms: AtomicU64::new(u64::MAX),
            max_ms: AtomicU64::new(0),
        }
    }

    /// Returns the post-increment count.
    fn record(&self, latency_ms: u64) -> u64 {
        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        self.sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.min_ms.fetch_min(latency_ms, Ordering::Relaxed);
        self.max_ms.fetch_max(latency_ms, Ordering::Relaxed);
        count
    }

    fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.sum_ms.store(0, Ordering::Relaxed);
        self.min_ms.store(u64::MAX, Ordering::Relaxed);
        self.max_ms.store(0, Ordering::Relaxed);
    }

    /// Best-effort snapshot; fields may be mutually inconsistent under
    /// concurrent writers, which is fine for monitoring output.
    fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.count.load(Ordering::Relaxed),
            self.sum_ms.load(Ordering::Relaxed),
            self.min_ms.load(Ordering::Relaxed),
            self.max_ms.load(Ordering::Relaxed),
        )
    }
}

/// Thread-safe accumulator of submit-response latencies and window timeouts.
///
/// Keeps an all-time accumulator and a current-window accumulator; the window
/// resets after every `report_every` successful records, right after the
/// summary line is emitted. Timeouts are tracked independently and never
/// reset.
#[derive(Debug)]
pub struct LatencyStats {
    total: Accumulator,
    window: Accumulator,
    timeout_count: AtomicU64,
    timeout_sum_ms: AtomicU64,
    report_every: u64,
}

impl LatencyStats {
    /// Default reporting cadence, in successful records.
    pub const DEFAULT_REPORT_EVERY: u64 = 100;

    pub fn new(report_every: u64) -> Self {
        Self {
            total: Accumulator::new(),
            window: Accumulator::new(),
            timeout_count: AtomicU64::new(0),
            timeout_sum_ms: AtomicU64::new(0),
            report_every: report_every.max(1),
        }
    }

    /// Record one submit-response latency.
    pub fn record(&self, latency_ms: u64) {
        self.total.record(latency_ms);
        let window_count = self.window.record(latency_ms);

        if window_count % self.report_every == 0 {
            self.report();
            self.window.reset();
        }
    }

    /// Record one window timeout (a slot cancelled without a response).
    pub fn record_timeout(&self, elapsed_ms: u64) {
        self.timeout_count.fetch_add(1, Ordering::Relaxed);
        self.timeout_sum_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
    }

    fn report(&self) {
        let (count, sum, min, max) = self.total.snapshot();
        let (w_count, w_sum, w_min, w_max) = self.window.snapshot();
        let timeouts = self.timeout_count.load(Ordering::Relaxed);
        let avg = if count > 0 { sum as f64 / count as f64 } else { 0.0 };
        let w_avg = if w_count > 0 { w_sum as f64 / w_count as f64 } else { 0.0 };

        info!(
            total = count,
            avg_ms = avg,
            min_ms = if count > 0 { min } else { 0 },
            max_ms = max,
            window_total = w_count,
            window_avg_ms = w_avg,
            window_min_ms = if w_count > 0 { w_min } else { 0 },
            window_max_ms = w_max,
            timeouts,
            "latencia SMPP"
        );
    }

    pub fn total_count(&self) -> u64 {
        self.total.count.load(Ordering::Relaxed)
    }

    pub fn window_count(&self) -> u64 {
        self.window.count.load(Ordering::Relaxed)
    }

    pub fn timeout_count(&self) -> u64 {
        self.timeout_count.load(Ordering::Relaxed)
    }

    pub fn timeout_sum_ms(&self) -> u64 {
        self.timeout_sum_ms.load(Ordering::Relaxed)
    }
}
