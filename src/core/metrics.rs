//! Prometheus metrics for the gateway.
//!
//! All collectors live in the default registry so `/metrics` can gather
//! them with a plain [`prometheus::gather`].

use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter, register_int_counter_vec,
    GaugeVec, HistogramVec, IntCounter, IntCounterVec,
};
use std::sync::OnceLock;

/// Container for all application metrics.
pub struct Metrics {
    /// Completed gateway requests by group, provider and status code
    pub request_count: IntCounterVec,

    /// End-to-end gateway time in seconds
    pub request_duration: HistogramVec,

    /// Upstream call latency in seconds
    pub upstream_latency: HistogramVec,

    /// Provider picks by group, provider and strategy
    pub provider_selections: IntCounterVec,

    /// Provider health status (1=healthy, 0=unhealthy)
    pub provider_health: GaugeVec,

    /// Times a component fell back to its fail-open default
    pub fail_open: IntCounterVec,

    /// Log events discarded because the sink queue was full
    pub log_events_dropped: IntCounter,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Initialize the metrics registry.
///
/// Safe to call more than once; every call returns the same instance.
pub fn init_metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let request_count = register_int_counter_vec!(
            "gateway_requests_total",
            "Total number of gateway requests",
            &["group", "provider", "status"]
        )
        .expect("Failed to register request_count metric");

        let request_duration = register_histogram_vec!(
            "gateway_request_duration_seconds",
            "Gateway request duration in seconds",
            &["group"],
            vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
        )
        .expect("Failed to register request_duration metric");

        let upstream_latency = register_histogram_vec!(
            "gateway_upstream_latency_seconds",
            "Upstream provider latency in seconds",
            &["provider"],
            vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
        )
        .expect("Failed to register upstream_latency metric");

        let provider_selections = register_int_counter_vec!(
            "gateway_provider_selections_total",
            "Provider selections by group and strategy",
            &["group", "provider", "strategy"]
        )
        .expect("Failed to register provider_selections metric");

        let provider_health = register_gauge_vec!(
            "gateway_provider_health",
            "Provider health status (1=healthy, 0=unhealthy)",
            &["provider"]
        )
        .expect("Failed to register provider_health metric");

        let fail_open = register_int_counter_vec!(
            "gateway_fail_open_total",
            "Dependency failures answered with a permissive default",
            &["component"]
        )
        .expect("Failed to register fail_open metric");

        let log_events_dropped = register_int_counter!(
            "gateway_log_events_dropped_total",
            "Log events dropped because the sink queue was full"
        )
        .expect("Failed to register log_events_dropped metric");

        Metrics {
            request_count,
            request_duration,
            upstream_latency,
            provider_selections,
            provider_health,
            fail_open,
            log_events_dropped,
        }
    })
}

/// Get the global metrics instance, registering it on first use.
pub fn get_metrics() -> &'static Metrics {
    init_metrics()
}
