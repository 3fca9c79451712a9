//! HTTP Surface - `axum` Router Over The Pipeline
//!
//! Three routes: the sole request entry point (`POST /pipeline/v2/process`),
//! the static output endpoint the Storage Adapter's URLs point at
//! (`GET /files/{kind}/{jobId}/{kind}.png`), and a liveness probe
//! (`GET /healthz`). Every domain-level failure is encoded in the `JobResult`
//! body with HTTP 200 - only a genuinely malformed JSON body, which never
//! reaches a pipeline stage, is handled here directly.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::config::EngineConfig;
use crate::error::{ErrorBody, ErrorCode, Note};
use crate::pipeline::{FailureResult, JobResult, Pipeline, ProcessRequest, Timing};
use crate::storage::StorageAdapter;

pub struct AppState {
    pub pipeline: Pipeline,
    pub storage: StorageAdapter,
    pub started_at: Instant,
}

pub fn build_router(state: AppState) -> Router {
    let state = Arc::new(state);
    Router::new()
        .route("/pipeline/v2/process", post(process_handler))
        .route("/files/:kind/:job_id/:file_name", get(files_handler))
        .route("/healthz", get(healthz_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Build the full application, wiring the pipeline and storage adapter from
/// a resolved `EngineConfig` - the shape `serve` (CLI) and any test harness
/// both go through.
pub fn build_app(config: &EngineConfig) -> Router {
    let resolver = crate::resolver::TemplateResolver::new(
        config.cache_root.clone(),
        config.connect_timeout,
        config.read_timeout,
    );
    // The pipeline owns one `StorageAdapter` for writing outputs; the route
    // handler below needs its own for resolving read paths. Both are cheap,
    // stateless handles onto the same `storage_root`.
    let pipeline = Pipeline::new(
        resolver,
        StorageAdapter::new(config.storage_root.clone(), config.public_base_url.clone()),
    );
    let storage = StorageAdapter::new(config.storage_root.clone(), config.public_base_url.clone());

    build_router(AppState {
        pipeline,
        storage,
        started_at: Instant::now(),
    })
}

async fn process_handler(State(state): State<Arc<AppState>>, bytes: Bytes) -> impl IntoResponse {
    let request: ProcessRequest = match serde_json::from_slice(&bytes) {
        Ok(r) => r,
        Err(e) => return malformed_request_response(format!("malformed request body: {e}")),
    };

    let result = state.pipeline.process(request).await;
    (StatusCode::OK, Json(result)).into_response()
}

/// A request body that never reaches a pipeline stage - `timing.steps` stays
/// empty and the code is `INTERNAL_ERROR`, matching an unmapped exception
/// rather than any stage-specific taxonomy entry.
fn malformed_request_response(message: String) -> axum::response::Response {
    let job_id = crate::pipeline::mint_job_id();
    let failure = JobResult::Failure(FailureResult {
        ok: false,
        job_id,
        error: ErrorBody {
            code: ErrorCode::InternalError,
            message,
            retryable: false,
            detail: None,
        },
        timing: Timing::default(),
        notes: vec![Note::new("REQUEST_REJECTED", "request body could not be parsed")],
    });
    (StatusCode::OK, Json(failure)).into_response()
}

async fn files_handler(
    State(state): State<Arc<AppState>>,
    Path((kind, job_id, file_name)): Path<(String, String, String)>,
) -> impl IntoResponse {
    let Some(path) = state.storage.resolve_public_path(&kind, &job_id, &file_name) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "image/png")],
            bytes,
        )
            .into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "engineVersion": crate::ENGINE_VERSION,
        "uptimeSecs": state.started_at.elapsed().as_secs(),
    }))
}
