//! Lock-free metrics collection and periodic reporting
//!
//! Counter updates are lock-free; `report()` swaps the periodic counters to
//! zero so each summary covers one reporting interval.
//!
//! NOTE: All atomics use Relaxed ordering. These are statistical counters
//! only and must not drive any monitoring decision.

use crate::domain::alert::{AlertType, Priority};
use crate::domain::eta::EtaMethod;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Tick latency bucket boundaries (milliseconds)
/// Buckets: ≤10, ≤20, ≤40, ≤80, ≤160, ≤320, ≤640, ≤1280, ≤2560, ≤5120, >5120
const BUCKET_BOUNDS: [u64; 10] = [10, 20, 40, 80, 160, 320, 640, 1280, 2560, 5120];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
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

#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
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

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Lock-free metrics collector shared by the monitor, ETA engine and dispatcher
pub struct Metrics {
    /// Monitoring ticks completed (monotonic)
    ticks_total: AtomicU64,
    /// Tick latency histogram (reset on report)
    tick_latency_buckets: [AtomicU64; NUM_BUCKETS],
    tick_latency_sum_ms: AtomicU64,
    tick_latency_max_ms: AtomicU64,
    /// Cumulative tick latency histogram for Prometheus (never reset)
    tick_latency_cumulative: [AtomicU64; NUM_BUCKETS],
    tick_latency_cumulative_sum_ms: AtomicU64,
    /// Vehicles evaluated since last report
    vehicles_processed: AtomicU64,
    /// Vehicles throttled since last report
    vehicles_skipped: AtomicU64,
    /// Per-vehicle failures isolated by the batch (monotonic)
    vehicle_errors_total: AtomicU64,
    /// ETA results by method (monotonic)
    eta_routing_total: AtomicU64,
    eta_projection_total: AtomicU64,
    eta_historical_total: AtomicU64,
    eta_arrived_total: AtomicU64,
    /// Routing provider outcomes (monotonic)
    routing_calls_total: AtomicU64,
    routing_failures_total: AtomicU64,
    routing_rate_limited_total: AtomicU64,
    /// Alerts dispatched by type (monotonic)
    alerts_approaching_total: AtomicU64,
    alerts_entered_total: AtomicU64,
    alerts_exited_total: AtomicU64,
    alerts_high_priority_total: AtomicU64,
    alerts_acknowledged_total: AtomicU64,
    /// Alerts sent since last report
    alerts_since_report: AtomicU64,
    alert_persist_failures_total: AtomicU64,
    escalations_total: AtomicU64,
    escalation_failures_total: AtomicU64,
    /// Feed events dropped because a subscriber queue was full (monotonic)
    broadcast_dropped_total: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            ticks_total: AtomicU64::new(0),
            tick_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            tick_latency_sum_ms: AtomicU64::new(0),
            tick_latency_max_ms: AtomicU64::new(0),
            tick_latency_cumulative: std::array::from_fn(|_| AtomicU64::new(0)),
            tick_latency_cumulative_sum_ms: AtomicU64::new(0),
            vehicles_processed: AtomicU64::new(0),
            vehicles_skipped: AtomicU64::new(0),
            vehicle_errors_total: AtomicU64::new(0),
            eta_routing_total: AtomicU64::new(0),
            eta_projection_total: AtomicU64::new(0),
            eta_historical_total: AtomicU64::new(0),
            eta_arrived_total: AtomicU64::new(0),
            routing_calls_total: AtomicU64::new(0),
            routing_failures_total: AtomicU64::new(0),
            routing_rate_limited_total: AtomicU64::new(0),
            alerts_approaching_total: AtomicU64::new(0),
            alerts_entered_total: AtomicU64::new(0),
            alerts_exited_total: AtomicU64::new(0),
            alerts_high_priority_total: AtomicU64::new(0),
            alerts_acknowledged_total: AtomicU64::new(0),
            alerts_since_report: AtomicU64::new(0),
            alert_persist_failures_total: AtomicU64::new(0),
            escalations_total: AtomicU64::new(0),
            escalation_failures_total: AtomicU64::new(0),
            broadcast_dropped_total: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record a completed monitoring tick
    #[inline]
    pub fn record_tick(&self, latency_ms: u64) {
        self.ticks_total.fetch_add(1, Ordering::Relaxed);
        self.tick_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        let idx = bucket_index(latency_ms);
        self.tick_latency_buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.tick_latency_cumulative[idx].fetch_add(1, Ordering::Relaxed);
        self.tick_latency_cumulative_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        update_atomic_max(&self.tick_latency_max_ms, latency_ms);
    }

    #[inline]
    pub fn record_vehicle_processed(&self) {
        self.vehicles_processed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_vehicle_skipped(&self) {
        self.vehicles_skipped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_vehicle_error(&self) {
        self.vehicle_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_eta(&self, method: EtaMethod) {
        let counter = match method {
            EtaMethod::RoutingApi => &self.eta_routing_total,
            EtaMethod::GpsProjection => &self.eta_projection_total,
            EtaMethod::HistoricalAverage => &self.eta_historical_total,
            EtaMethod::Arrived => &self.eta_arrived_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_routing_call(&self) {
        self.routing_calls_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_routing_failure(&self) {
        self.routing_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_routing_rate_limited(&self) {
        self.routing_rate_limited_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dispatched alert
    #[inline]
    pub fn record_alert(&self, alert_type: AlertType, priority: Priority) {
        let counter = match alert_type {
            AlertType::Approaching => &self.alerts_approaching_total,
            AlertType::Entered => &self.alerts_entered_total,
            AlertType::Exited => &self.alerts_exited_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.alerts_since_report.fetch_add(1, Ordering::Relaxed);
        if priority == Priority::High {
            self.alerts_high_priority_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_alert_acknowledged(&self) {
        self.alerts_acknowledged_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_alert_persist_failure(&self) {
        self.alert_persist_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_escalation(&self, ok: bool) {
        if ok {
            self.escalations_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.escalation_failures_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_broadcast_dropped(&self) {
        self.broadcast_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn ticks_total(&self) -> u64 {
        self.ticks_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn broadcast_dropped_total(&self) -> u64 {
        self.broadcast_dropped_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn alert_persist_failures_total(&self) -> u64 {
        self.alert_persist_failures_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn vehicle_errors_total(&self) -> u64 {
        self.vehicle_errors_total.load(Ordering::Relaxed)
    }

    /// Cumulative tick latency buckets and sum in ms
    pub fn tick_histogram(&self) -> ([u64; NUM_BUCKETS], u64) {
        let mut buckets = [0u64; NUM_BUCKETS];
        for (i, bucket) in self.tick_latency_cumulative.iter().enumerate() {
            buckets[i] = bucket.load(Ordering::Relaxed);
        }
        (buckets, self.tick_latency_cumulative_sum_ms.load(Ordering::Relaxed))
    }

    /// Monotonic counters for the Prometheus endpoint (no reset)
    pub fn counters(&self) -> MetricsCounters {
        MetricsCounters {
            ticks_total: self.ticks_total.load(Ordering::Relaxed),
            vehicle_errors_total: self.vehicle_errors_total.load(Ordering::Relaxed),
            eta_routing_total: self.eta_routing_total.load(Ordering::Relaxed),
            eta_projection_total: self.eta_projection_total.load(Ordering::Relaxed),
            eta_historical_total: self.eta_historical_total.load(Ordering::Relaxed),
            eta_arrived_total: self.eta_arrived_total.load(Ordering::Relaxed),
            routing_calls_total: self.routing_calls_total.load(Ordering::Relaxed),
            routing_failures_total: self.routing_failures_total.load(Ordering::Relaxed),
            routing_rate_limited_total: self.routing_rate_limited_total.load(Ordering::Relaxed),
            alerts_approaching_total: self.alerts_approaching_total.load(Ordering::Relaxed),
            alerts_entered_total: self.alerts_entered_total.load(Ordering::Relaxed),
            alerts_exited_total: self.alerts_exited_total.load(Ordering::Relaxed),
            alerts_high_priority_total: self.alerts_high_priority_total.load(Ordering::Relaxed),
            alerts_acknowledged_total: self.alerts_acknowledged_total.load(Ordering::Relaxed),
            alert_persist_failures_total: self
                .alert_persist_failures_total
                .load(Ordering::Relaxed),
            escalations_total: self.escalations_total.load(Ordering::Relaxed),
            escalation_failures_total: self.escalation_failures_total.load(Ordering::Relaxed),
            broadcast_dropped_total: self.broadcast_dropped_total.load(Ordering::Relaxed),
        }
    }

    /// Calculate and return the interval summary, then reset periodic counters
    pub fn report(&self, tracked_vehicles: usize) -> MetricsSummary {
        let processed = self.vehicles_processed.swap(0, Ordering::Relaxed);
        let skipped = self.vehicles_skipped.swap(0, Ordering::Relaxed);
        let alerts = self.alerts_since_report.swap(0, Ordering::Relaxed);

        let tick_buckets = swap_buckets(&self.tick_latency_buckets);
        let tick_sum = self.tick_latency_sum_ms.swap(0, Ordering::Relaxed);
        let tick_max = self.tick_latency_max_ms.swap(0, Ordering::Relaxed);
        let tick_count: u64 = tick_buckets.iter().sum();
        let tick_avg = if tick_count > 0 { tick_sum / tick_count } else { 0 };

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        MetricsSummary {
            interval_secs: elapsed.as_secs_f64(),
            vehicles_processed: processed,
            vehicles_skipped: skipped,
            tracked_vehicles,
            alerts_sent: alerts,
            ticks: tick_count,
            tick_buckets,
            tick_avg_ms: tick_avg,
            tick_max_ms: tick_max,
            tick_p99_ms: percentile_from_buckets(&tick_buckets, 0.99),
            counters: self.counters(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetricsCounters {
    pub ticks_total: u64,
    pub vehicle_errors_total: u64,
    pub eta_routing_total: u64,
    pub eta_projection_total: u64,
    pub eta_historical_total: u64,
    pub eta_arrived_total: u64,
    pub routing_calls_total: u64,
    pub routing_failures_total: u64,
    pub routing_rate_limited_total: u64,
    pub alerts_approaching_total: u64,
    pub alerts_entered_total: u64,
    pub alerts_exited_total: u64,
    pub alerts_high_priority_total: u64,
    pub alerts_acknowledged_total: u64,
    pub alert_persist_failures_total: u64,
    pub escalations_total: u64,
    pub escalation_failures_total: u64,
    pub broadcast_dropped_total: u64,
}

#[derive(Debug)]
pub struct MetricsSummary {
    pub interval_secs: f64,
    pub vehicles_processed: u64,
    pub vehicles_skipped: u64,
    pub tracked_vehicles: usize,
    pub alerts_sent: u64,
    pub ticks: u64,
    /// Bounds: ≤10, ≤20, ≤40, ≤80, ≤160, ≤320, ≤640, ≤1280, ≤2560, ≤5120, >5120 ms
    pub tick_buckets: [u64; NUM_BUCKETS],
    pub tick_avg_ms: u64,
    pub tick_max_ms: u64,
    pub tick_p99_ms: u64,
    pub counters: MetricsCounters,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            interval_secs = format!("{:.1}", self.interval_secs),
            processed = %self.vehicles_processed,
            skipped = %self.vehicles_skipped,
            tracked_vehicles = %self.tracked_vehicles,
            alerts = %self.alerts_sent,
            ticks = %self.ticks,
            tick_avg_ms = %self.tick_avg_ms,
            tick_p99_ms = %self.tick_p99_ms,
            routing_calls = %self.counters.routing_calls_total,
            routing_failures = %self.counters.routing_failures_total,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.ticks_total(), 0);
        assert_eq!(metrics.broadcast_dropped_total(), 0);
    }

    #[test]
    fn test_report_resets_periodic_counters() {
        let metrics = Metrics::new();

        metrics.record_vehicle_processed();
        metrics.record_vehicle_processed();
        metrics.record_vehicle_skipped();
        metrics.record_alert(AlertType::Entered, Priority::High);

        let summary = metrics.report(7);
        assert_eq!(summary.vehicles_processed, 2);
        assert_eq!(summary.vehicles_skipped, 1);
        assert_eq!(summary.tracked_vehicles, 7);
        assert_eq!(summary.alerts_sent, 1);
        assert_eq!(summary.counters.alerts_entered_total, 1);
        assert_eq!(summary.counters.alerts_high_priority_total, 1);

        let summary = metrics.report(0);
        assert_eq!(summary.vehicles_processed, 0);
        assert_eq!(summary.vehicles_skipped, 0);
        assert_eq!(summary.alerts_sent, 0);
        // Monotonic counters survive the reset
        assert_eq!(summary.counters.alerts_entered_total, 1);
    }

    #[test]
    fn test_tick_latency() {
        let metrics = Metrics::new();

        metrics.record_tick(5);
        metrics.record_tick(30);
        metrics.record_tick(25);

        let summary = metrics.report(0);
        assert_eq!(summary.ticks, 3);
        assert_eq!(summary.tick_avg_ms, 20);
        assert_eq!(summary.tick_max_ms, 30);
        assert_eq!(summary.tick_buckets[0], 1);
        assert_eq!(summary.tick_buckets[2], 2);
        assert_eq!(metrics.ticks_total(), 3);

        // Cumulative histogram survives the report
        let (buckets, sum) = metrics.tick_histogram();
        assert_eq!(buckets[0], 1);
        assert_eq!(buckets[2], 2);
        assert_eq!(sum, 60);
    }

    #[test]
    fn test_eta_method_counters() {
        let metrics = Metrics::new();
        metrics.record_eta(EtaMethod::GpsProjection);
        metrics.record_eta(EtaMethod::GpsProjection);
        metrics.record_eta(EtaMethod::Arrived);

        let counters = metrics.counters();
        assert_eq!(counters.eta_projection_total, 2);
        assert_eq!(counters.eta_arrived_total, 1);
        assert_eq!(counters.eta_routing_total, 0);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    m.record_broadcast_dropped();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.broadcast_dropped_total(), 10_000);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(10), 0);
        assert_eq!(bucket_index(11), 1);
        assert_eq!(bucket_index(5120), 9);
        assert_eq!(bucket_index(5121), 10);
    }

    #[test]
    fn test_percentile_computation() {
        let mut buckets = [0u64; NUM_BUCKETS];
        buckets[1] = 100;
        assert_eq!(percentile_from_buckets(&buckets, 0.50), 20);
        assert_eq!(percentile_from_buckets(&buckets, 0.99), 20);
        assert_eq!(percentile_from_buckets(&[0; NUM_BUCKETS], 0.99), 0);
    }
}
