use super::{HealthReport, UpstreamSet};
use futures_util::stream::{self, StreamExt};
use tracing::{debug, warn};

const HEALTH_CHECK_CONCURRENCY: usize = 4;

/// Run a single round of health checks across all upstreams.
///
/// The caller is responsible for looping / scheduling. Results feed the
/// `gateway_upstream_health_status` gauge and the deep `/health` view.
pub async fn run_health_checks(upstreams: &UpstreamSet) -> Vec<(String, HealthReport)> {
    let reports: Vec<(String, HealthReport)> = stream::iter(upstreams.all().to_vec())
        .map(|handle| async move {
            let report = handle.adapter.health_check().await;
            (handle.name().to_string(), report)
        })
        .buffer_unordered(HEALTH_CHECK_CONCURRENCY)
        .collect()
        .await;

    for (name, report) in &reports {
        metrics::gauge!(
            "gateway_upstream_health_status",
            "provider" => name.clone(),
        )
        .set(if report.ok { 1.0 } else { 0.0 });
        metrics::counter!(
            "gateway_health_check_total",
            "provider" => name.clone(),
            "result" => if report.ok { "ok" } else { "fail" },
        )
        .increment(1);

        if report.ok {
            debug!(
                "health: ok, provider={}, latency_ms={}",
                name, report.latency_ms
            );
        } else {
            warn!(
                "health: failing, provider={}, error={}",
                name,
                report.error.as_deref().unwrap_or("unknown")
            );
        }
    }

    reports
}
