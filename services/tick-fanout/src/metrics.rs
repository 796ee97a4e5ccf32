//! Counters and latency tracking for the fan-out engine
//!
//! All counters are relaxed atomics updated from producer threads and shard
//! workers. Processing latency (queue insertion to end of fan-out) is kept in
//! a bounded sample window for averages and percentiles.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Why a tick was not admitted or not processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropKind {
    /// Rejected by the backpressure controller.
    Backpressure,
    /// The shard queue was at capacity.
    QueueFull,
    /// Admissions were already closed for shutdown.
    ShutDown,
    /// Empty routing symbol.
    Invalid,
}

/// Core metrics for the fan-out engine.
pub struct FanoutMetrics {
    // Admission
    pub ticks_queued: AtomicU64,
    pub ticks_dropped_backpressure: AtomicU64,
    pub ticks_dropped_queue_full: AtomicU64,
    pub ticks_dropped_shutdown: AtomicU64,
    pub ticks_rejected_invalid: AtomicU64,

    // Processing
    pub ticks_processed: AtomicU64,
    pub ticks_fired: AtomicU64,
    pub no_subscriber_ticks: AtomicU64,
    pub processing_ns_total: AtomicU64,
    pub processing_ns: Mutex<LatencyTracker>,

    // Callbacks
    pub callbacks_executed: AtomicU64,
    pub callback_errors: AtomicU64,
    pub slow_callbacks: AtomicU64,
    pub very_slow_callbacks: AtomicU64,
    pub depth_updates: AtomicU64,
    pub replays: AtomicU64,

    // Failures
    pub shard_failures: AtomicU64,
    pub ticks_unprocessed: AtomicU64,

    rate: Mutex<RateSample>,
}

struct RateSample {
    at: Instant,
    processed: u64,
}

impl FanoutMetrics {
    pub fn new(latency_window: usize) -> Self {
        Self {
            ticks_queued: AtomicU64::new(0),
            ticks_dropped_backpressure: AtomicU64::new(0),
            ticks_dropped_queue_full: AtomicU64::new(0),
            ticks_dropped_shutdown: AtomicU64::new(0),
            ticks_rejected_invalid: AtomicU64::new(0),
            ticks_processed: AtomicU64::new(0),
            ticks_fired: AtomicU64::new(0),
            no_subscriber_ticks: AtomicU64::new(0),
            processing_ns_total: AtomicU64::new(0),
            processing_ns: Mutex::new(LatencyTracker::new(latency_window)),
            callbacks_executed: AtomicU64::new(0),
            callback_errors: AtomicU64::new(0),
            slow_callbacks: AtomicU64::new(0),
            very_slow_callbacks: AtomicU64::new(0),
            depth_updates: AtomicU64::new(0),
            replays: AtomicU64::new(0),
            shard_failures: AtomicU64::new(0),
            ticks_unprocessed: AtomicU64::new(0),
            rate: Mutex::new(RateSample {
                at: Instant::now(),
                processed: 0,
            }),
        }
    }

    pub fn record_queued(&self) {
        self.ticks_queued.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a tick that was not enqueued. Returns the running count for
    /// that kind so callers can rate-limit their logging.
    pub fn record_drop(&self, kind: DropKind) -> u64 {
        let counter = match kind {
            DropKind::Backpressure => &self.ticks_dropped_backpressure,
            DropKind::QueueFull => &self.ticks_dropped_queue_full,
            DropKind::ShutDown => &self.ticks_dropped_shutdown,
            DropKind::Invalid => &self.ticks_rejected_invalid,
        };
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record a tick that finished processing after `latency_ns` in the pipeline.
    pub fn record_processed(&self, latency_ns: u64) {
        self.ticks_processed.fetch_add(1, Ordering::Relaxed);
        self.processing_ns_total.fetch_add(latency_ns, Ordering::Relaxed);
        if let Ok(mut tracker) = self.processing_ns.lock() {
            tracker.record(latency_ns);
        }
    }

    pub fn record_fired(&self) {
        self.ticks_fired.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the running count for rate-limited logging.
    pub fn record_no_subscribers(&self) -> u64 {
        self.no_subscriber_ticks.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record one successful callback invocation and classify its duration.
    pub fn record_callback(&self, elapsed_ns: u64) {
        self.callbacks_executed.fetch_add(1, Ordering::Relaxed);
        if elapsed_ns > VERY_SLOW_CALLBACK_NS {
            self.very_slow_callbacks.fetch_add(1, Ordering::Relaxed);
        } else if elapsed_ns > SLOW_CALLBACK_NS {
            self.slow_callbacks.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns the running error count for rate-limited logging.
    pub fn record_callback_error(&self) -> u64 {
        self.callback_errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn record_depth_update(&self) {
        self.depth_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replay(&self) {
        self.replays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_shard_failure(&self) {
        self.shard_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unprocessed(&self, count: u64) {
        self.ticks_unprocessed.fetch_add(count, Ordering::Relaxed);
    }

    /// Total ticks not admitted, across all drop kinds.
    pub fn ticks_dropped(&self) -> u64 {
        self.ticks_dropped_backpressure.load(Ordering::Relaxed)
            + self.ticks_dropped_queue_full.load(Ordering::Relaxed)
            + self.ticks_dropped_shutdown.load(Ordering::Relaxed)
            + self.ticks_rejected_invalid.load(Ordering::Relaxed)
    }

    /// Ticks admitted but not yet processed.
    pub fn outstanding(&self) -> u64 {
        let queued = self.ticks_queued.load(Ordering::Relaxed);
        let processed = self.ticks_processed.load(Ordering::Relaxed);
        queued.saturating_sub(processed)
    }

    /// Fraction of callback invocations that did not panic; 1.0 when idle.
    pub fn callback_success_rate(&self) -> f64 {
        let executed = self.callbacks_executed.load(Ordering::Relaxed);
        let errors = self.callback_errors.load(Ordering::Relaxed);
        let total = executed + errors;
        if total == 0 {
            1.0
        } else {
            executed as f64 / total as f64
        }
    }

    /// Read-only snapshot. The ticks/second figure covers the time since the
    /// previous snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let ticks_processed = self.ticks_processed.load(Ordering::Relaxed);

        let current_ticks_per_second = match self.rate.lock() {
            Ok(mut rate) => {
                let elapsed = rate.at.elapsed().as_secs_f64();
                let delta = ticks_processed.saturating_sub(rate.processed);
                rate.at = Instant::now();
                rate.processed = ticks_processed;
                if elapsed > 0.0 {
                    delta as f64 / elapsed
                } else {
                    0.0
                }
            }
            Err(_) => 0.0,
        };

        let (avg_ns, p99_ns) = match self.processing_ns.lock() {
            Ok(tracker) => (tracker.average(), tracker.percentile(99)),
            Err(_) => (None, None),
        };

        MetricsSnapshot {
            ticks_queued: self.ticks_queued.load(Ordering::Relaxed),
            ticks_processed,
            ticks_dropped: self.ticks_dropped(),
            avg_processing_ms: avg_ns.map(ns_to_ms).unwrap_or(0.0),
            p99_processing_ms: p99_ns.map(ns_to_ms).unwrap_or(0.0),
            current_ticks_per_second,
            callbacks_executed: self.callbacks_executed.load(Ordering::Relaxed),
            callback_errors: self.callback_errors.load(Ordering::Relaxed),
            slow_callbacks: self.slow_callbacks.load(Ordering::Relaxed),
            very_slow_callbacks: self.very_slow_callbacks.load(Ordering::Relaxed),
            no_subscriber_ticks: self.no_subscriber_ticks.load(Ordering::Relaxed),
            depth_updates: self.depth_updates.load(Ordering::Relaxed),
            replays: self.replays.load(Ordering::Relaxed),
        }
    }

    /// Export metrics as a BTreeMap for Prometheus-style exposition.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let counters = [
            ("ticks_queued", &self.ticks_queued),
            ("ticks_processed", &self.ticks_processed),
            ("processing_ns_total", &self.processing_ns_total),
            ("ticks_fired", &self.ticks_fired),
            ("ticks_dropped_backpressure", &self.ticks_dropped_backpressure),
            ("ticks_dropped_queue_full", &self.ticks_dropped_queue_full),
            ("ticks_dropped_shutdown", &self.ticks_dropped_shutdown),
            ("ticks_rejected_invalid", &self.ticks_rejected_invalid),
            ("ticks_unprocessed", &self.ticks_unprocessed),
            ("no_subscriber_ticks", &self.no_subscriber_ticks),
            ("callbacks_executed", &self.callbacks_executed),
            ("callback_errors", &self.callback_errors),
            ("slow_callbacks", &self.slow_callbacks),
            ("very_slow_callbacks", &self.very_slow_callbacks),
            ("depth_updates", &self.depth_updates),
            ("replays", &self.replays),
            ("shard_failures", &self.shard_failures),
        ];
        counters
            .iter()
            .map(|(name, counter)| (name.to_string(), counter.load(Ordering::Relaxed)))
            .collect()
    }
}

impl Default for FanoutMetrics {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Callback durations above this count as slow (1ms).
pub const SLOW_CALLBACK_NS: u64 = 1_000_000;
/// Callback durations above this count as very slow (5ms).
pub const VERY_SLOW_CALLBACK_NS: u64 = 5_000_000;

fn ns_to_ms(ns: u64) -> f64 {
    ns as f64 / 1_000_000.0
}

/// Operational snapshot returned by the engine facade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub ticks_queued: u64,
    pub ticks_processed: u64,
    pub ticks_dropped: u64,
    pub avg_processing_ms: f64,
    pub p99_processing_ms: f64,
    pub current_ticks_per_second: f64,
    pub callbacks_executed: u64,
    pub callback_errors: u64,
    pub slow_callbacks: u64,
    pub very_slow_callbacks: u64,
    pub no_subscriber_ticks: u64,
    pub depth_updates: u64,
    pub replays: u64,
}

/// Tracks latency samples for percentile calculation.
pub struct LatencyTracker {
    samples: VecDeque<u64>,
    max_samples: usize,
}

impl LatencyTracker {
    pub fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples,
        }
    }

    /// Record a latency sample, evicting the oldest once the window is full.
    pub fn record(&mut self, value: u64) {
        if self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    /// Get a percentile value (0-100).
    pub fn percentile(&self, p: usize) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (p as f64 / 100.0 * (sorted.len() - 1) as f64) as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }

    /// Average latency.
    pub fn average(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: u64 = self.samples.iter().sum();
        Some(sum / self.samples.len() as u64)
    }

    /// Number of samples recorded.
    pub fn count(&self) -> usize {
        self.samples.len()
    }
}
