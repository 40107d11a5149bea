//! Axum router for the node's admin surface.
//!
//! The [`app`] function wires the health routes, metrics, and cluster
//! administration endpoints and returns a ready-to-serve [`axum::Router`].
//! Handlers only translate HTTP to [`Cluster`](crate::cluster::Cluster)
//! calls; every failure renders through [`ClusterError`]'s `IntoResponse`.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;

use crate::cluster::Readiness;
use crate::errors::ClusterError;
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

// -- OpenAPI specification ----------------------------------------------------

/// OpenAPI documentation for the admin API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Gateway Cluster Admin API",
        version = "0.1.0",
        description = "Cluster membership and store administration for a gateway node"
    ),
    paths(
        health_check,
        readiness_check,
        list_members,
        member_status,
        start_server,
        stop_server,
        purge_member,
    ),
    tags(
        (name = "Health", description = "Liveness and readiness checks"),
        (name = "Cluster", description = "Cluster membership and store server control"),
    )
)]
struct ApiDoc;

/// Build the admin [`Router`].
///
/// The `/health` and `/readyz` routes are mounted only when
/// `observability.health_check` is on.
pub fn app(state: Arc<AppState>) -> Router {
    let mut router: Router<Arc<AppState>> = Router::new();
    if state.config.observability.health_check {
        router = router
            .route("/health", get(health_check))
            .route("/readyz", get(readiness_check));
    }
    router
        .route("/metrics", get(metrics_handler))
        .route("/openapi.json", get(openapi_json))
        .route("/cluster/members", get(list_members))
        .route("/cluster/members/:name", delete(purge_member))
        .route("/cluster/status", get(member_status))
        .route("/cluster/server/start", post(start_server))
        .route("/cluster/server/stop", post(stop_server))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        // metrics_middleware is outer (captures full request lifecycle).
        .layer(middleware::from_fn(metrics_middleware))
}

async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

// -- Health -------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    operation_id = "HealthCheck",
    responses(
        (status = 200, description = "Process is alive")
    )
)]
async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

#[utoipa::path(
    get,
    path = "/readyz",
    tag = "Health",
    operation_id = "ReadinessCheck",
    responses(
        (status = 200, description = "Node is cluster-ready"),
        (status = 503, description = "Still bootstrapping, or bootstrap failed fatally")
    )
)]
async fn readiness_check(State(state): State<Arc<AppState>>) -> Response {
    match state.cluster.readiness() {
        Readiness::Ready => (StatusCode::OK, Json(json!({ "status": "ready" }))).into_response(),
        Readiness::Bootstrapping => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "bootstrapping" })),
        )
            .into_response(),
        Readiness::Fatal(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "fatal", "code": e.code(), "message": e.to_string() })),
        )
            .into_response(),
    }
}

// -- Cluster ------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/cluster/members",
    tag = "Cluster",
    operation_id = "ListMembers",
    responses(
        (status = 200, description = "Self identity, store member list and known peer URLs")
    )
)]
async fn list_members(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.cluster.members())
}

#[utoipa::path(
    get,
    path = "/cluster/status",
    tag = "Cluster",
    operation_id = "MemberStatus",
    responses(
        (status = 200, description = "This node's last published status document"),
        (status = 404, description = "No status published yet")
    )
)]
async fn member_status(State(state): State<Arc<AppState>>) -> Result<Response, ClusterError> {
    match state.cluster.status().await? {
        Some(status) => Ok(Json(status).into_response()),
        None => Err(ClusterError::NotFound {
            key: state.cluster.layout().status_member_key(),
        }),
    }
}

#[utoipa::path(
    post,
    path = "/cluster/server/start",
    tag = "Cluster",
    operation_id = "StartServer",
    responses(
        (status = 200, description = "Embedded server is ready"),
        (status = 400, description = "Node is a reader"),
        (status = 504, description = "Server did not become ready in time")
    )
)]
async fn start_server(State(state): State<Arc<AppState>>) -> Result<Response, ClusterError> {
    state.cluster.start_server().await?;
    info!("embedded server started through admin API");
    Ok(Json(json!({ "status": "ready" })).into_response())
}

#[utoipa::path(
    post,
    path = "/cluster/server/stop",
    tag = "Cluster",
    operation_id = "StopServer",
    responses(
        (status = 200, description = "Embedded server stopped (or was not running)")
    )
)]
async fn stop_server(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.cluster.close_server().await;
    info!("embedded server stopped through admin API");
    Json(json!({ "status": "stopped" }))
}

#[utoipa::path(
    delete,
    path = "/cluster/members/{name}",
    tag = "Cluster",
    operation_id = "PurgeMember",
    params(
        ("name" = String, Path, description = "Member name to purge")
    ),
    responses(
        (status = 204, description = "Member removed and its lease revoked"),
        (status = 404, description = "Member has no lease record")
    )
)]
async fn purge_member(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ClusterError> {
    state.cluster.purge_member(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::MemoryStore;
    use crate::cluster::Cluster;
    use crate::config::{ClusterRole, Config};
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn reader_state(tmp: &TempDir, store: &Arc<MemoryStore>) -> Arc<AppState> {
        reader_state_with(tmp, store, Config::default()).await
    }

    async fn reader_state_with(
        tmp: &TempDir,
        store: &Arc<MemoryStore>,
        mut config: Config,
    ) -> Arc<AppState> {
        config.cluster.name = "gw-r".to_string();
        config.cluster.role = ClusterRole::Reader;
        config.cluster.data_dir = tmp.path().to_str().unwrap().to_string();
        config.cluster.join_urls = vec!["http://gw-1:2380".to_string()];
        let cluster = Cluster::new(config.cluster.clone(), store.connector(), None).unwrap();
        cluster.wait_ready().await.unwrap();
        Arc::new(AppState { config, cluster })
    }

    async fn send(state: &Arc<AppState>, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app(Arc::clone(state))
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_and_readiness() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let state = reader_state(&tmp, &store).await;

        let (status, body) = send(&state, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = send(&state, "GET", "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
        state.cluster.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_routes_disabled_by_config() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let mut config = Config::default();
        config.observability.health_check = false;
        let state = reader_state_with(&tmp, &store, config).await;

        let (status, _) = send(&state, "GET", "/health").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&state, "GET", "/readyz").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&state, "GET", "/cluster/members").await;
        assert_eq!(status, StatusCode::OK);
        state.cluster.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_members_view() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let state = reader_state(&tmp, &store).await;
        let (status, body) = send(&state, "GET", "/cluster/members").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["self"]["name"], "gw-r");
        assert_eq!(body["known_peer_urls"][0], "http://gw-1:2380");
        state.cluster.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_published_after_heartbeat() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let state = reader_state(&tmp, &store).await;

        let (status, body) = send(&state, "GET", "/cluster/status").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NotFound");

        tokio::time::sleep(Duration::from_secs(6)).await;
        let (status, body) = send(&state, "GET", "/cluster/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["options"]["name"], "gw-r");
        state.cluster.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reader_cannot_start_server() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let state = reader_state(&tmp, &store).await;
        let (status, body) = send(&state, "POST", "/cluster/server/start").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "InvalidConfig");

        let (status, _) = send(&state, "POST", "/cluster/server/stop").await;
        assert_eq!(status, StatusCode::OK);
        state.cluster.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_unknown_member_is_404() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let state = reader_state(&tmp, &store).await;
        let (status, body) = send(&state, "DELETE", "/cluster/members/gw-ghost").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NotFound");
        state.cluster.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_openapi_lists_admin_paths() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let state = reader_state(&tmp, &store).await;
        let (status, body) = send(&state, "GET", "/openapi.json").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["paths"]["/cluster/members/{name}"].is_object());
        assert!(body["paths"]["/readyz"].is_object());
        state.cluster.close().await;
    }
}
