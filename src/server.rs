//! HTTP server assembly and request handlers.
//!
//! Builds the axum `Router`, wires middleware (request tracing, common
//! response headers, metrics) and exposes the client, admin and probe
//! endpoints.  Handlers stay thin: they parse the request, call into
//! [`ReplicationState`](crate::replication::state::ReplicationState), and
//! map the result onto HTTP.

use std::path::PathBuf;

use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::errors::{generate_request_id, ReplicationError};
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::replication::state::WriteResponse;
use crate::store::engine::StoreOperation;
use crate::AppState;

/// Server identification header value.
const SERVER_NAME: &str = "replistore";

/// Build the application router with all middleware attached.
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/write", post(write))
        .route("/read/:key", get(read))
        .route("/status", get(status))
        .route("/admin/snapshot", post(admin_snapshot))
        .route("/admin/nodes", post(admin_nodes))
        .route("/admin/vote", post(admin_vote));

    if state.config.observability.health_check {
        router = router.route("/health", get(health)).route("/readyz", get(readyz));
    }
    if state.config.observability.metrics {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(metrics_middleware))
        .with_state(state)
}

/// Attach `x-request-id` and `server` headers to every response that does
/// not already carry them.
async fn common_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    if !headers.contains_key("x-request-id") {
        if let Ok(value) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-request-id", value);
        }
    }
    headers.insert(header::SERVER, HeaderValue::from_static(SERVER_NAME));
    response
}

// -- Probe handlers -----------------------------------------------------------

/// `GET /health` -- liveness: the process is up and serving.
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// `GET /readyz` -- readiness: 200 only once the node has caught up.
async fn readyz(State(state): State<AppState>) -> Response {
    if state.replication.is_ready() {
        (StatusCode::OK, Json(serde_json::json!({ "ready": true }))).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "ready": false })),
        )
            .into_response()
    }
}

/// `GET /status` -- replication introspection.
async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.replication.node_status())
}

// -- Client handlers ----------------------------------------------------------

/// `POST /write` -- replicate one store operation.
///
/// On the leader the response carries the apply result; on a follower the
/// leader's response is relayed verbatim, status included.
async fn write(
    State(state): State<AppState>,
    Json(op): Json<StoreOperation>,
) -> Result<Response, ReplicationError> {
    match state.replication.write(op).await? {
        WriteResponse::Applied(result) => Ok((
            StatusCode::OK,
            Json(serde_json::json!({ "status": "ok", "value": result.value })),
        )
            .into_response()),
        WriteResponse::Forwarded { status, body } => {
            let status =
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            Ok((
                status,
                [(header::CONTENT_TYPE, "application/json")],
                body,
            )
                .into_response())
        }
    }
}

/// `GET /read/:key` -- read one key from the local store.
async fn read(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Response, ReplicationError> {
    match state.replication.read(&key)? {
        Some(value) => Ok(Json(serde_json::json!({ "key": key, "value": value })).into_response()),
        None => Err(ReplicationError::NotFound(key)),
    }
}

// -- Admin handlers -----------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct SnapshotParams {
    /// Optional external full-state override recorded in the manifest.
    snapshot_path: Option<PathBuf>,
}

/// `POST /admin/snapshot` -- take a snapshot now.
async fn admin_snapshot(
    State(state): State<AppState>,
    body: Option<Json<SnapshotParams>>,
) -> Result<Response, ReplicationError> {
    let params = body.map(|Json(p)| p).unwrap_or_default();
    let applied_index = state.replication.do_snapshot(params.snapshot_path).await?;
    info!(applied_index, "on-demand snapshot completed");
    Ok(Json(serde_json::json!({ "status": "ok", "applied_index": applied_index }))
        .into_response())
}

#[derive(Debug, Deserialize)]
struct NodesParams {
    /// Comma-separated `host:peering_port:api_port` membership string.
    nodes: String,
}

/// `POST /admin/nodes` -- replace the cluster membership.
async fn admin_nodes(
    State(state): State<AppState>,
    Json(params): Json<NodesParams>,
) -> Result<Response, ReplicationError> {
    state.replication.refresh_nodes(&params.nodes)?;
    Ok(Json(serde_json::json!({ "status": "ok" })).into_response())
}

/// `POST /admin/vote` -- ask the consensus core to start an election.
async fn admin_vote(State(state): State<AppState>) -> Result<Response, ReplicationError> {
    state.replication.trigger_vote()?;
    Ok(Json(serde_json::json!({ "status": "ok" })).into_response())
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::replication::state::ReplicationState;
    use crate::store::memory::MemoryStore;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn test_app() -> (Router, Arc<ReplicationState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            r#"
replication:
  data_dir: {}
store:
  engine: memory
"#,
            dir.path().display()
        );
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        let replication =
            ReplicationState::bootstrap(&config, Arc::new(MemoryStore::new())).unwrap();
        let app = build_router(AppState {
            config: Arc::new(config),
            replication: replication.clone(),
        });
        (app, replication, dir)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_and_common_headers() {
        let (app, state, _dir) = test_app().await;
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        assert_eq!(response.headers()[header::SERVER], "replistore");
        state.shutdown();
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (app, state, _dir) = test_app().await;

        let response = app
            .clone()
            .oneshot(post_json(
                "/write",
                r#"{"op":"SET","key":"city","value":"lisbon"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/read/city").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["value"], "lisbon");

        state.shutdown();
    }

    #[tokio::test]
    async fn test_read_missing_key_is_404() {
        let (app, state, _dir) = test_app().await;
        let response = app
            .oneshot(Request::get("/read/absent").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["code"], "not_found");
        state.shutdown();
    }

    #[tokio::test]
    async fn test_write_rejects_malformed_body() {
        let (app, state, _dir) = test_app().await;
        let response = app
            .oneshot(post_json("/write", r#"{"op":"FROB"}"#))
            .await
            .unwrap();
        assert!(response.status().is_client_error());
        state.shutdown();
    }

    #[tokio::test]
    async fn test_status_reports_leader() {
        let (app, state, _dir) = test_app().await;
        // Leader state is reported once the pipeline sees leader-start.
        for _ in 0..100 {
            if state.has_leader_term() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let response = app
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["state"], "LEADER");
        assert_eq!(body["applied_index"], 0);
        state.shutdown();
    }

    #[tokio::test]
    async fn test_readyz_follows_catchup() {
        let (app, state, _dir) = test_app().await;
        // Readiness is recomputed by the pipeline on leader start; give the
        // startup events a moment to flow through.
        for _ in 0..100 {
            if state.is_ready() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let response = app
            .clone()
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        state.shutdown();
        let response = app
            .oneshot(Request::get("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_admin_snapshot_roundtrip() {
        let (app, state, dir) = test_app().await;
        app.clone()
            .oneshot(post_json(
                "/write",
                r#"{"op":"SET","key":"k","value":"v"}"#,
            ))
            .await
            .unwrap();

        let response = app
            .oneshot(post_json("/admin/snapshot", "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["applied_index"], 1);
        assert!(dir.path().join("snapshot").join("snapshot-1").is_dir());
        state.shutdown();
    }

    #[tokio::test]
    async fn test_admin_nodes_rejects_garbage() {
        let (app, state, _dir) = test_app().await;
        let response = app
            .oneshot(post_json("/admin/nodes", r#"{"nodes":"not-a-node"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        state.shutdown();
    }
}
