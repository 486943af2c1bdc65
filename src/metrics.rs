//! Prometheus metrics for replistore.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides a Tower-compatible middleware for
//! HTTP RED metrics, and exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, histogram,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "replistore_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "replistore_http_request_duration_seconds";

/// Total accepted client writes (counter). Labels: status.
pub const WRITES_TOTAL: &str = "replistore_writes_total";

/// Total writes proxied to the leader (counter).
pub const FORWARDS_TOTAL: &str = "replistore_forwards_total";

/// Total committed entries applied to the store (counter).
pub const APPLIED_ENTRIES_TOTAL: &str = "replistore_applied_entries_total";

/// Last applied log index (gauge).
pub const APPLIED_INDEX: &str = "replistore_applied_index";

/// Current leader term, -1 when not leader (gauge).
pub const LEADER_TERM: &str = "replistore_leader_term";

/// Readiness flag, 1 when caught up (gauge).
pub const READY: &str = "replistore_ready";

/// Total snapshot attempts (counter). Labels: status.
pub const SNAPSHOTS_TOTAL: &str = "replistore_snapshots_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times (e.g. in tests). Returns a reference to the global handle.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(WRITES_TOTAL, "Total accepted client writes");
    describe_counter!(FORWARDS_TOTAL, "Total writes proxied to the leader");
    describe_counter!(APPLIED_ENTRIES_TOTAL, "Total committed entries applied");
    describe_gauge!(APPLIED_INDEX, "Last applied log index");
    describe_gauge!(LEADER_TERM, "Current leader term (-1 when not leader)");
    describe_gauge!(READY, "Readiness flag (1 when caught up)");
    describe_counter!(SNAPSHOTS_TOTAL, "Total snapshot attempts by status");
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation to avoid feedback loops.
/// Must be the outermost layer so it captures the full request lifecycle.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    // Do not instrument the metrics endpoint itself.
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Normalize an actual request path to a route template for metric labels.
///
/// This prevents high-cardinality labels from unique keys:
/// `/read/some-key` -> `/read/{key}`; fixed routes map to themselves.
fn normalize_path(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("/read/") {
        if !rest.is_empty() {
            return "/read/{key}".to_string();
        }
    }
    path.to_string()
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> impl IntoResponse {
    let handle = PROMETHEUS_HANDLE
        .get()
        .expect("Prometheus recorder not initialized");
    let body = handle.render();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

// -- Tests --------------------------------------------------------------------
