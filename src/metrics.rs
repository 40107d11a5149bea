//! Prometheus metrics for the cluster node.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides the admin HTTP middleware, and
//! exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total admin HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "gateway_cluster_http_requests_total";

/// Admin HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "gateway_cluster_http_request_duration_seconds";

/// Bootstrap attempts (counter). Labels: result (ok, failed, fatal).
pub const BOOTSTRAP_ATTEMPTS_TOTAL: &str = "gateway_cluster_bootstrap_attempts_total";

/// Heartbeat steps (counter). Labels: step (status, members), result.
pub const HEARTBEATS_TOTAL: &str = "gateway_cluster_heartbeats_total";

/// Defragmentation runs (counter). Labels: result.
pub const DEFRAG_TOTAL: &str = "gateway_cluster_defrag_total";

/// Member purges (counter). Labels: result.
pub const PURGES_TOTAL: &str = "gateway_cluster_purges_total";

/// 1 once the node is cluster-ready (gauge).
pub const CLUSTER_READY: &str = "gateway_cluster_ready";

/// Members in the last merged member list (gauge).
pub const CLUSTER_MEMBERS: &str = "gateway_cluster_members";

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
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total admin HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "Admin HTTP request duration in seconds"
    );
    describe_counter!(BOOTSTRAP_ATTEMPTS_TOTAL, "Cluster bootstrap attempts by result");
    describe_counter!(HEARTBEATS_TOTAL, "Heartbeat steps by step and result");
    describe_counter!(DEFRAG_TOTAL, "Store defragmentation runs by result");
    describe_counter!(PURGES_TOTAL, "Member purges by result");
    describe_gauge!(CLUSTER_READY, "Whether this node is cluster-ready");
    describe_gauge!(CLUSTER_MEMBERS, "Members in the store's member list");
}

/// Label value for an operation outcome.
pub(crate) fn result_label<T, E>(result: &Result<T, E>) -> &'static str {
    if result.is_ok() {
        "ok"
    } else {
        "failed"
    }
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

/// Normalize an actual request path to a route template for metric labels,
/// so member names never become label values.
///
/// Examples:
/// - `/health` -> `/health`
/// - `/cluster/members` -> `/cluster/members`
/// - `/cluster/members/gw-2` -> `/cluster/members/{name}`
/// - anything unrouted -> `/{other}`
fn normalize_path(path: &str) -> String {
    match path {
        "/" | "/health" | "/readyz" | "/openapi.json" | "/metrics" | "/cluster/members"
        | "/cluster/status" | "/cluster/server/start" | "/cluster/server/stop" => {
            path.to_string()
        }
        _ if path.starts_with("/cluster/members/") => "/cluster/members/{name}".to_string(),
        _ => "/{other}".to_string(),
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> impl IntoResponse {
    let Some(handle) = PROMETHEUS_HANDLE.get() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [("content-type", "text/plain; version=0.0.4")],
            "metrics disabled\n".to_string(),
        );
    };
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        handle.render(),
    )
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_fixed_routes() {
        assert_eq!(normalize_path("/health"), "/health");
        assert_eq!(normalize_path("/readyz"), "/readyz");
        assert_eq!(normalize_path("/cluster/status"), "/cluster/status");
        assert_eq!(normalize_path("/cluster/server/start"), "/cluster/server/start");
    }

    #[test]
    fn test_normalize_path_member_name() {
        assert_eq!(normalize_path("/cluster/members"), "/cluster/members");
        assert_eq!(
            normalize_path("/cluster/members/gw-002"),
            "/cluster/members/{name}"
        );
    }

    #[test]
    fn test_normalize_path_unknown() {
        assert_eq!(normalize_path("/nope/at/all"), "/{other}");
    }

    #[test]
    fn test_result_label() {
        assert_eq!(result_label::<(), ()>(&Ok(())), "ok");
        assert_eq!(result_label::<(), ()>(&Err(())), "failed");
    }
}
