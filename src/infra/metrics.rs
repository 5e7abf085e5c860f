//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! Interval counters are swapped to zero on `report()`; totals are monotonic.
//!
//! NOTE: All atomics use Relaxed ordering: these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤10, ≤20, ≤40, ≤80, ≤160, ≤320, ≤640, ≤1280, ≤2560, ≤5120, >5120
const BUCKET_BOUNDS: [u64; 10] = [10, 20, 40, 80, 160, 320, 640, 1280, 2560, 5120];
const NUM_BUCKETS: usize = 11;

pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Load all bucket values without resetting
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.load(Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = ((total as f64 * percentile).ceil() as u64).max(1);
    let mut cumulative = 0u64;

    // Last bucket uses 2x the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [10, 20, 40, 80, 160, 320, 640, 1280, 2560, 5120, 10240];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector for the aggregator
pub struct Metrics {
    registrations_total: AtomicU64,
    assignments_total: AtomicU64,
    /// Reports applied to a lot counter (monotonic)
    reports_applied: AtomicU64,
    /// Reports since last `report()` call
    reports_since_report: AtomicU64,
    reports_unknown: AtomicU64,
    reports_unassigned: AtomicU64,
    /// Malformed or wrong-method requests
    requests_rejected: AtomicU64,
    enter_total: AtomicU64,
    exit_total: AtomicU64,
    /// Ingest latency histogram (monotonic, exported as Prometheus histogram)
    latency_buckets: [AtomicU64; NUM_BUCKETS],
    latency_sum_us: AtomicU64,
    latency_max_us: AtomicU64,
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            registrations_total: AtomicU64::new(0),
            assignments_total: AtomicU64::new(0),
            reports_applied: AtomicU64::new(0),
            reports_since_report: AtomicU64::new(0),
            reports_unknown: AtomicU64::new(0),
            reports_unassigned: AtomicU64::new(0),
            requests_rejected: AtomicU64::new(0),
            enter_total: AtomicU64::new(0),
            exit_total: AtomicU64::new(0),
            latency_buckets: Default::default(),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_registration(&self) {
        self.registrations_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_assignment(&self) {
        self.assignments_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_report_applied(&self, enter: u32, exit: u32, latency_us: u64) {
        self.reports_applied.fetch_add(1, Ordering::Relaxed);
        self.reports_since_report.fetch_add(1, Ordering::Relaxed);
        self.enter_total.fetch_add(u64::from(enter), Ordering::Relaxed);
        self.exit_total.fetch_add(u64::from(exit), Ordering::Relaxed);
        self.latency_buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        update_atomic_max(&self.latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_report_unknown(&self) {
        self.reports_unknown.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_report_unassigned(&self) {
        self.reports_unassigned.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rejected(&self) {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot all counters and reset the interval counters
    pub fn report(&self) -> MetricsSummary {
        let now = Instant::now();
        let elapsed_secs = {
            let mut last = self.last_report_time.lock();
            let secs = now.duration_since(*last).as_secs_f64();
            *last = now;
            secs
        };

        let interval_reports = self.reports_since_report.swap(0, Ordering::Relaxed);
        let reports_per_sec =
            if elapsed_secs > 0.0 { interval_reports as f64 / elapsed_secs } else { 0.0 };

        let lat_buckets = load_buckets(&self.latency_buckets);
        let reports_applied = self.reports_applied.load(Ordering::Relaxed);
        let lat_sum = self.latency_sum_us.load(Ordering::Relaxed);

        MetricsSummary {
            registrations_total: self.registrations_total.load(Ordering::Relaxed),
            assignments_total: self.assignments_total.load(Ordering::Relaxed),
            reports_applied,
            reports_unknown: self.reports_unknown.load(Ordering::Relaxed),
            reports_unassigned: self.reports_unassigned.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            enter_total: self.enter_total.load(Ordering::Relaxed),
            exit_total: self.exit_total.load(Ordering::Relaxed),
            reports_per_sec,
            lat_buckets,
            lat_sum_us: lat_sum,
            lat_avg_us: if reports_applied > 0 { lat_sum / reports_applied } else { 0 },
            lat_max_us: self.latency_max_us.load(Ordering::Relaxed),
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
        }
    }
}

/// Point-in-time metrics snapshot
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub registrations_total: u64,
    pub assignments_total: u64,
    pub reports_applied: u64,
    pub reports_unknown: u64,
    pub reports_unassigned: u64,
    pub requests_rejected: u64,
    pub enter_total: u64,
    pub exit_total: u64,
    pub reports_per_sec: f64,
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_sum_us: u64,
    pub lat_avg_us: u64,
    pub lat_max_us: u64,
    pub lat_p50_us: u64,
    pub lat_p99_us: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            registrations = %self.registrations_total,
            assignments = %self.assignments_total,
            reports_applied = %self.reports_applied,
            reports_unknown = %self.reports_unknown,
            reports_unassigned = %self.reports_unassigned,
            rejected = %self.requests_rejected,
            enter_total = %self.enter_total,
            exit_total = %self.exit_total,
            reports_per_sec = %format!("{:.2}", self.reports_per_sec),
            lat_avg_us = %self.lat_avg_us,
            lat_p99_us = %self.lat_p99_us,
            lat_max_us = %self.lat_max_us,
            "metrics"
        );
    }
}
