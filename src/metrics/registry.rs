use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds). Upstream LLM
/// calls routinely run tens of seconds, so the tail extends past a minute.
const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.025, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering `/metrics`.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Must be called once at startup before any macro use.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        // request path
        describe_counter!(
            "gateway_http_requests_total",
            Unit::Count,
            "Total HTTP requests processed"
        );
        describe_histogram!(
            "gateway_http_request_duration_seconds",
            Unit::Seconds,
            "Total request duration from the client's perspective"
        );
        describe_gauge!(
            "gateway_http_requests_in_flight",
            Unit::Count,
            "Requests currently being processed"
        );

        // upstream calls
        describe_counter!(
            "gateway_upstream_requests_total",
            Unit::Count,
            "Upstream call outcomes by provider"
        );
        describe_histogram!(
            "gateway_upstream_request_duration_seconds",
            Unit::Seconds,
            "Upstream call duration by provider"
        );
        describe_counter!(
            "gateway_upstream_retries_total",
            Unit::Count,
            "Backoff retries within a single upstream attempt"
        );

        // cache
        describe_counter!(
            "gateway_cache_events_total",
            Unit::Count,
            "Cache lookups by result"
        );

        // limiting
        describe_counter!(
            "gateway_rate_limit_rejected_total",
            Unit::Count,
            "Requests rejected by the sliding-window limiter"
        );
        describe_counter!(
            "gateway_budget_denied_total",
            Unit::Count,
            "Requests denied by the token budget manager"
        );

        // upstream health & protection
        describe_gauge!(
            "gateway_upstream_health_status",
            Unit::Count,
            "Upstream health: 1=healthy 0=unhealthy"
        );
        describe_counter!(
            "gateway_health_check_total",
            Unit::Count,
            "Active health check attempts"
        );

        // evaluation loop
        describe_counter!(
            "gateway_shadow_calls_total",
            Unit::Count,
            "Shadow call outcomes by provider"
        );
        describe_counter!(
            "gateway_shadow_queue_dropped_total",
            Unit::Count,
            "Shadow comparisons dropped on queue overflow"
        );
        describe_counter!(
            "gateway_judge_verdicts_total",
            Unit::Count,
            "Judge verdicts by winner"
        );
        describe_counter!(
            "gateway_weight_updates_total",
            Unit::Count,
            "Accepted weight optimizer changes by provider"
        );
        describe_gauge!(
            "gateway_dynamic_weight",
            Unit::Count,
            "Current dynamic routing weight by provider"
        );

        // system health
        describe_gauge!(
            "gateway_system_load_normalized",
            Unit::Count,
            "1-minute load average divided by CPU count"
        );
        describe_gauge!(
            "gateway_system_memory_fraction",
            Unit::Count,
            "Used-memory fraction"
        );
        describe_gauge!(
            "gateway_system_loop_lag_ms",
            Unit::Milliseconds,
            "Sampling-loop timer drift"
        );

        // plugins
        describe_counter!(
            "gateway_plugin_failures_total",
            Unit::Count,
            "Isolated plugin handler failures by hook"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
