//! Coordinate subsystem metrics
//!
//! Counters and a flush-latency histogram, rendered in the Prometheus text
//! format by the `/metrics` endpoint.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for flush latency (in milliseconds)
const FLUSH_LATENCY_BUCKETS: [f64; 9] = [1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0];

/// A simple histogram for latency tracking
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn with_buckets(boundaries: &[f64]) -> Self {
        Self {
            buckets: (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect(),
            boundaries: boundaries.to_vec(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Record a value in milliseconds
    pub fn observe(&self, value_ms: f64) {
        let idx = self
            .boundaries
            .iter()
            .position(|&b| value_ms <= b)
            .unwrap_or(self.boundaries.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((value_ms * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative bucket counts, ending with the +Inf bucket
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.buckets.len());
        for (i, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            let le = self.boundaries.get(i).copied().unwrap_or(f64::INFINITY);
            result.push((le, cumulative));
        }
        result
    }

    pub fn sum(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge for tracking current values
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Metrics for ingestion, flushing and aggregation.
///
/// One instance is shared (behind an `Arc`) by the coalescer, the service
/// and the HTTP layer.
#[derive(Debug)]
pub struct CoordinateMetrics {
    pub updates_accepted: Counter,
    pub updates_rejected: Counter,
    /// Updates that overwrote a key already pending in the same epoch
    pub updates_coalesced: Counter,
    pub flushes: Counter,
    pub flush_failures: Counter,
    pub keys_written: Counter,
    pub partial_aggregations: Counter,
    pub pending_keys: Gauge,
    pub flush_latency: Histogram,
    start_time: Instant,
}

impl CoordinateMetrics {
    pub fn new() -> Self {
        Self {
            updates_accepted: Counter::new(),
            updates_rejected: Counter::new(),
            updates_coalesced: Counter::new(),
            flushes: Counter::new(),
            flush_failures: Counter::new(),
            keys_written: Counter::new(),
            partial_aggregations: Counter::new(),
            pending_keys: Gauge::default(),
            flush_latency: Histogram::with_buckets(&FLUSH_LATENCY_BUCKETS),
            start_time: Instant::now(),
        }
    }

    pub fn record_flush(&self, keys: usize, duration: Duration) {
        self.flushes.inc();
        self.keys_written.add(keys as u64);
        self.flush_latency.observe(duration.as_secs_f64() * 1000.0);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters = [
            ("netcoord_updates_accepted_total", "Coordinate updates accepted", &self.updates_accepted),
            ("netcoord_updates_rejected_total", "Coordinate updates rejected", &self.updates_rejected),
            ("netcoord_updates_coalesced_total", "Updates superseded within a flush epoch", &self.updates_coalesced),
            ("netcoord_flushes_total", "Successful coalescer flushes", &self.flushes),
            ("netcoord_flush_failures_total", "Failed coalescer flushes", &self.flush_failures),
            ("netcoord_keys_written_total", "Coordinate records written to the store", &self.keys_written),
            ("netcoord_partial_aggregations_total", "Datacenter summaries missing one or more datacenters", &self.partial_aggregations),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}", name, counter.get());
        }

        out.push_str("# HELP netcoord_pending_keys Keys waiting for the next flush\n");
        out.push_str("# TYPE netcoord_pending_keys gauge\n");
        let _ = writeln!(out, "netcoord_pending_keys {}", self.pending_keys.get());

        out.push_str("# HELP netcoord_uptime_seconds Server uptime in seconds\n");
        out.push_str("# TYPE netcoord_uptime_seconds gauge\n");
        let _ = writeln!(out, "netcoord_uptime_seconds {}", self.uptime_seconds());

        out.push_str("# HELP netcoord_flush_duration_ms Flush duration in milliseconds\n");
        out.push_str("# TYPE netcoord_flush_duration_ms histogram\n");
        for (le, count) in self.flush_latency.get_buckets() {
            if le.is_infinite() {
                let _ = writeln!(out, "netcoord_flush_duration_ms_bucket{{le=\"+Inf\"}} {}", count);
            } else {
                let _ = writeln!(out, "netcoord_flush_duration_ms_bucket{{le=\"{}\"}} {}", le, count);
            }
        }
        let _ = writeln!(out, "netcoord_flush_duration_ms_sum {}", self.flush_latency.sum());
        let _ = writeln!(out, "netcoord_flush_duration_ms_count {}", self.flush_latency.count());

        out
    }
}

impl Default for CoordinateMetrics {
    fn default() -> Self {
        Self::new()
    }
}
