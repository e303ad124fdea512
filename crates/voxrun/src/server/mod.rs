//! HTTP surface over the orchestrator and the run store.

mod errors;

pub use errors::ApiError;

use crate::datasets::DatasetError;
use crate::model::{validate_path_component, Case, Layer, Run};
use crate::orchestrator::{run_json, RunContext};
use crate::runner::RunnerError;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Cache policy for produced layers; a run directory never changes once the
/// run has finished.
pub const LAYER_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

#[derive(Clone)]
pub struct ServerState {
    ctx: Arc<RunContext>,
}

pub fn build_router(ctx: Arc<RunContext>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/run", post(run_batch))
        .route("/workspaces/:workspace_id/runs", get(list_runs))
        .route(
            "/workspaces/:workspace_id/:case_id/:run_id/layers",
            get(list_layers),
        )
        .route(
            "/workspaces/:workspace_id/:case_id/:run_id/layers/:layer",
            get(get_layer),
        )
        .route(
            "/datasets/:dataset_id/cases/:case_id/layers",
            get(dataset_layers),
        )
        .with_state(ServerState { ctx })
}

/// Serve until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    ctx: Arc<RunContext>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, build_router(ctx))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn healthz() -> &'static str {
    "ok"
}

async fn run_batch(
    State(state): State<ServerState>,
    body: Bytes,
) -> Result<Json<Vec<Run>>, ApiError> {
    let runs = run_json(state.ctx, &body).await?;
    Ok(Json(runs))
}

async fn list_runs(
    State(state): State<ServerState>,
    Path(workspace_id): Path<String>,
) -> Result<Json<Vec<Run>>, ApiError> {
    Ok(Json(state.ctx.store.list_runs(&workspace_id).await?))
}

async fn list_layers(
    State(state): State<ServerState>,
    Path((workspace_id, case_id, run_id)): Path<(String, String, String)>,
) -> Result<Json<Vec<Layer>>, ApiError> {
    let layers = state
        .ctx
        .store
        .list_layers(&workspace_id, &case_id, &run_id)
        .await?;
    if layers.is_empty() {
        return Err(RunnerError::not_found(
            "run produced no layers",
            Some(serde_json::json!({ "run_id": run_id })),
        )
        .into());
    }
    Ok(Json(layers))
}

async fn get_layer(
    State(state): State<ServerState>,
    Path((workspace_id, case_id, run_id, layer)): Path<(String, String, String, String)>,
) -> Result<Response, ApiError> {
    let bytes = state
        .ctx
        .store
        .read_layer(&workspace_id, &case_id, &run_id, &layer)
        .await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream"),
            (header::CACHE_CONTROL, LAYER_CACHE_CONTROL),
        ],
        bytes,
    )
        .into_response())
}

async fn dataset_layers(
    State(state): State<ServerState>,
    Path((dataset_id, case_id)): Path<(String, String)>,
) -> Result<Json<Vec<Layer>>, ApiError> {
    validate_path_component("dataset id", &dataset_id)?;
    validate_path_component("case id", &case_id)?;
    let case = Case::in_dataset(&dataset_id, &case_id);
    let resolver = Arc::clone(&state.ctx.resolver);
    let layers = tokio::task::spawn_blocking(move || resolver.layers(&case))
        .await
        .map_err(|err| RunnerError::internal(format!("layer listing did not complete: {err}")))?
        .map_err(|err| match err {
            DatasetError::CaseNotFound { path } => {
                RunnerError::not_found("case not found", Some(serde_json::json!({ "path": path })))
            }
            other => RunnerError::io("failed to list dataset layers", other),
        })?;
    Ok(Json(layers))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::config::RunnerConfigBuilder;
    use crate::model::RunId;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use serde_json::Value;
    use std::time::Duration;
    use tower::util::ServiceExt;

    fn context(root: &std::path::Path, binary: &str) -> Arc<RunContext> {
        let config = RunnerConfigBuilder::new()
            .binary_path(binary)
            .workspaces_root(root.join("workspaces"))
            .datasets_root(root.join("datasets"))
            .timeout(Duration::from_secs(10))
            .build();
        Arc::new(RunContext::new(config).unwrap())
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_run(body: &Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/run")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn empty_case_list_is_bad_request() {
        let tmp = tempfile::tempdir().unwrap();
        let router = build_router(context(tmp.path(), "/bin/sh"));
        let resp = router
            .oneshot(post_run(&serde_json::json!({
                "workspaceId": "ws",
                "scriptContent": "printf '{}'",
                "cases": [],
            })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(body["error"]["code"], "E_INVALID_REQUEST");
    }

    #[tokio::test]
    async fn missing_binary_is_bad_request() {
        let tmp = tempfile::tempdir().unwrap();
        let router = build_router(context(tmp.path(), "/nonexistent/voxlogica"));
        let resp = router
            .oneshot(post_run(&serde_json::json!({
                "workspaceId": "ws",
                "scriptContent": "printf '{}'",
                "cases": [{"id": "c1", "path": "/datasets/d/cases/c1"}],
            })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"]["code"], "E_BINARY_UNAVAILABLE");
        assert!(!tmp.path().join("workspaces").exists());
    }

    #[tokio::test]
    async fn run_then_list_history() {
        let tmp = tempfile::tempdir().unwrap();
        let router = build_router(context(tmp.path(), "/bin/sh"));
        let resp = router
            .clone()
            .oneshot(post_run(&serde_json::json!({
                "workspaceId": "ws",
                "scriptContent": "printf '{\"log\":\"done\"}'",
                "cases": [
                    {"id": "c1", "path": "/datasets/d/cases/c1"},
                    {"id": "c2", "path": "/datasets/d/cases/c2"},
                ],
            })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let runs = body_json(resp).await;
        assert_eq!(runs.as_array().unwrap().len(), 2);
        assert_eq!(runs[0]["casePath"], "/datasets/d/cases/c1");
        assert_eq!(runs[0]["outputLog"], "done");
        assert_eq!(runs[0]["id"], runs[1]["id"]);

        let resp = router.oneshot(get("/workspaces/ws/runs")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn layer_bytes_are_immutable() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = context(tmp.path(), "/bin/sh");
        let run_id = RunId::new();
        let dir = ctx.store.run_dir("ws", "c1", run_id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("mask.nii.gz"), b"\x1f\x8bvoxels").unwrap();
        let router = build_router(ctx);

        let uri = format!("/workspaces/ws/c1/{run_id}/layers/mask.nii.gz");
        let resp = router.clone().oneshot(get(&uri)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CACHE_CONTROL], LAYER_CACHE_CONTROL);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            "application/octet-stream"
        );
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"\x1f\x8bvoxels");

        let uri = format!("/workspaces/ws/c1/{run_id}/layers");
        let layers = body_json(router.clone().oneshot(get(&uri)).await.unwrap()).await;
        assert_eq!(layers[0]["name"], "mask");

        let uri = format!("/workspaces/ws/c1/{run_id}/layers/other");
        let resp = router.oneshot(get(&uri)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn dataset_layers_are_listed() {
        let tmp = tempfile::tempdir().unwrap();
        let case_dir = tmp.path().join("datasets").join("brats").join("c1");
        std::fs::create_dir_all(&case_dir).unwrap();
        std::fs::write(case_dir.join("c1_flair.nii.gz"), b"x").unwrap();
        let router = build_router(context(tmp.path(), "/bin/sh"));

        let resp = router
            .clone()
            .oneshot(get("/datasets/brats/cases/c1/layers"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await[0]["name"], "flair");

        let resp = router
            .clone()
            .oneshot(get("/datasets/brats/cases/missing/layers"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = router.oneshot(get("/healthz")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
