//! Prometheus metrics exposition
//!
//! Service metrics, rendered on `/metrics` together with the pool's own
//! (`ubi_login_attempts_total`, `ubi_identities_invalidated_total`,
//! `ubi_pool_identities`):
//!
//! - `ubi_proxy_requests_total` (counter): labels `status`, `method`
//! - `ubi_proxy_request_duration_seconds` (histogram): label `status`
//! - `ubi_proxy_upstream_errors_total` (counter): label `error_type`

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("ubi_proxy_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the global Prometheus recorder and return a handle for rendering.
///
/// The request duration is configured with explicit buckets so it renders as
/// a histogram rather than a summary.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a completed proxy request.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("ubi_proxy_requests_total", "status" => status_str.clone(), "method" => method.to_string())
        .increment(1);
    metrics::histogram!("ubi_proxy_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

/// Record an upstream error with a classification label.
pub fn record_upstream_error(error_type: &'static str) {
    metrics::counter!("ubi_proxy_upstream_errors_total", "error_type" => error_type).increment(1);
}
