//! Prometheus text exposition for `/metrics`
//!
//! Counters come from `Metrics::counters()` and never reset. Gauges are
//! sampled from the live services at scrape time.

use crate::infra::metrics::{Metrics, MetricsCounters, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use std::fmt::Write;

/// Point-in-time values sampled from the services
#[derive(Debug, Clone, Copy, Default)]
pub struct Gauges {
    pub tracked_vehicles: usize,
    pub active_alerts: usize,
    pub subscribers: usize,
    pub eta_cache_size: usize,
    pub routing_calls_in_window: usize,
    pub routing_rate_limited: bool,
}

enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name} {val}");
}

/// Counter family split by one label
fn write_labeled_counter(output: &mut String, name: &str, help: &str, label: &str, values: &[(&str, u64)]) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    for (value, count) in values {
        let _ = writeln!(output, "{name}{{{label}=\"{value}\"}} {count}");
    }
}

fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(output, "{name}_sum {sum}");
    let _ = writeln!(output, "{name}_count {cumulative}");
}

pub fn format_prometheus_metrics(metrics: &Metrics, gauges: &Gauges) -> String {
    let counters = metrics.counters();
    let mut output = String::with_capacity(4096);

    write_monitor_metrics(&mut output, metrics, &counters, gauges);
    write_eta_metrics(&mut output, &counters, gauges);
    write_alert_metrics(&mut output, &counters, gauges);

    output
}

fn write_monitor_metrics(output: &mut String, metrics: &Metrics, counters: &MetricsCounters, gauges: &Gauges) {
    write_metric(
        output,
        "geofence_ticks_total",
        "Monitoring ticks completed",
        MetricType::Counter,
        counters.ticks_total,
    );
    let (buckets, sum) = metrics.tick_histogram();
    write_histogram(
        output,
        "geofence_tick_latency_ms",
        "Monitoring tick duration in milliseconds",
        &buckets,
        &METRICS_BUCKET_BOUNDS,
        sum,
    );
    write_metric(
        output,
        "geofence_vehicle_errors_total",
        "Vehicle evaluations that failed",
        MetricType::Counter,
        counters.vehicle_errors_total,
    );
    write_metric(
        output,
        "geofence_tracked_vehicles",
        "Vehicles with monitoring state",
        MetricType::Gauge,
        gauges.tracked_vehicles as u64,
    );
}

fn write_eta_metrics(output: &mut String, counters: &MetricsCounters, gauges: &Gauges) {
    write_labeled_counter(
        output,
        "geofence_eta_total",
        "Arrival estimates computed by method",
        "method",
        &[
            ("routing_api", counters.eta_routing_total),
            ("gps_projection", counters.eta_projection_total),
            ("historical_average", counters.eta_historical_total),
            ("arrived", counters.eta_arrived_total),
        ],
    );
    write_metric(
        output,
        "geofence_routing_calls_total",
        "Routing provider calls attempted",
        MetricType::Counter,
        counters.routing_calls_total,
    );
    write_metric(
        output,
        "geofence_routing_failures_total",
        "Routing provider calls that failed or timed out",
        MetricType::Counter,
        counters.routing_failures_total,
    );
    write_metric(
        output,
        "geofence_routing_rate_limited_total",
        "Rate-limit responses from the routing provider",
        MetricType::Counter,
        counters.routing_rate_limited_total,
    );
    write_metric(
        output,
        "geofence_routing_calls_in_window",
        "Routing calls in the current one-minute window",
        MetricType::Gauge,
        gauges.routing_calls_in_window as u64,
    );
    write_metric(
        output,
        "geofence_routing_rate_limited",
        "Whether routing is currently rate limited (0/1)",
        MetricType::Gauge,
        u64::from(gauges.routing_rate_limited),
    );
    write_metric(
        output,
        "geofence_eta_cache_entries",
        "Entries in the arrival estimate cache",
        MetricType::Gauge,
        gauges.eta_cache_size as u64,
    );
}

fn write_alert_metrics(output: &mut String, counters: &MetricsCounters, gauges: &Gauges) {
    write_labeled_counter(
        output,
        "geofence_alerts_total",
        "Alerts dispatched by type",
        "type",
        &[
            ("approaching", counters.alerts_approaching_total),
            ("entered", counters.alerts_entered_total),
            ("exited", counters.alerts_exited_total),
        ],
    );
    write_metric(
        output,
        "geofence_alerts_high_priority_total",
        "High priority alerts dispatched",
        MetricType::Counter,
        counters.alerts_high_priority_total,
    );
    write_metric(
        output,
        "geofence_alerts_acknowledged_total",
        "Alerts acknowledged by operators",
        MetricType::Counter,
        counters.alerts_acknowledged_total,
    );
    write_metric(
        output,
        "geofence_alert_persist_failures_total",
        "Alert writes to the durable store that failed",
        MetricType::Counter,
        counters.alert_persist_failures_total,
    );
    write_metric(
        output,
        "geofence_escalations_total",
        "High priority alerts handed to the escalation channel",
        MetricType::Counter,
        counters.escalations_total,
    );
    write_metric(
        output,
        "geofence_escalation_failures_total",
        "Escalations the channel rejected",
        MetricType::Counter,
        counters.escalation_failures_total,
    );
    write_metric(
        output,
        "geofence_broadcast_dropped_total",
        "Feed events dropped for slow subscribers",
        MetricType::Counter,
        counters.broadcast_dropped_total,
    );
    write_metric(
        output,
        "geofence_active_alerts",
        "Alerts in the active index",
        MetricType::Gauge,
        gauges.active_alerts as u64,
    );
    write_metric(
        output,
        "geofence_ws_subscribers",
        "Connected real-time subscribers",
        MetricType::Gauge,
        gauges.subscribers as u64,
    );
}
