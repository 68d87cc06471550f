//! Worker management API: spawn / activate / kill / kill-by-path / inspect.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use kiln_core::guardrail::UserKwargs;
use kiln_core::CoreError;

use crate::error::ServerError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/model-workers", get(list_workers))
        .route("/api/model-workers/inspect", get(inspect_workers))
        .route("/api/model-workers/spawn", post(spawn_worker))
        .route("/api/model-workers/activate/{worker_id}", post(activate_worker))
        .route("/api/model-workers/kill/{worker_id}", post(kill_worker))
        .route("/api/model-workers/kill-all", post(kill_all))
        .route("/api/model-workers/kill-by-path", post(kill_by_path))
}

#[derive(Debug, Deserialize)]
pub struct SpawnReq {
    #[serde(rename = "modelPath")]
    pub model_path: String,
    #[serde(rename = "llamaKwargs", default)]
    pub llama_kwargs: UserKwargs,
}

#[derive(Debug, Deserialize)]
pub struct KillByPathReq {
    #[serde(rename = "modelPath")]
    pub model_path: String,
    #[serde(rename = "includeReady", default = "default_true")]
    pub include_ready: bool,
}

fn default_true() -> bool {
    true
}

async fn list_workers(State(state): State<Arc<AppState>>) -> Json<Value> {
    let workers = state.supervisor.list().await;
    Json(json!({ "ok": true, "workers": workers, "active": state.active.get() }))
}

async fn inspect_workers(State(state): State<Arc<AppState>>) -> Json<Value> {
    let workers = state.supervisor.list().await;
    Json(json!({
        "ok": true,
        "workers": workers,
        "active": state.active.get(),
        "system": state.snapshot.get(),
    }))
}

async fn spawn_worker(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SpawnReq>,
) -> Result<Response, ServerError> {
    match state
        .supervisor
        .spawn_worker(&req.model_path, req.llama_kwargs)
        .await
    {
        Ok(info) => {
            state.active.set_if_empty(&info.id);
            info!(wid = %info.id, status = %info.status, "spawn finished");
            Ok(Json(json!({
                "ok": true,
                "worker": info,
                "active": state.active.get(),
            }))
            .into_response())
        }
        Err(CoreError::GuardrailAbort { diag }) => {
            // The full diagnostics record (incoming / resolved / env /
            // projection) tells the caller exactly why and what would fit.
            let detail = state
                .supervisor
                .last_guardrail_diag()
                .unwrap_or_else(|| serde_json::to_value(&diag).unwrap_or(Value::Null));
            Ok((
                StatusCode::CONFLICT,
                Json(json!({ "error": "guardrail_abort", "detail": detail })),
            )
                .into_response())
        }
        Err(e) => Err(e.into()),
    }
}

async fn activate_worker(
    State(state): State<Arc<AppState>>,
    Path(worker_id): Path<String>,
) -> Result<Json<Value>, ServerError> {
    if state.supervisor.get_worker(&worker_id).is_none() {
        return Err(ServerError::NotFound(format!("worker {worker_id}")));
    }
    state.active.set(Some(worker_id));
    Ok(Json(json!({ "ok": true, "active": state.active.get() })))
}

async fn kill_worker(
    State(state): State<Arc<AppState>>,
    Path(worker_id): Path<String>,
) -> Result<Json<Value>, ServerError> {
    if !state.supervisor.stop_worker(&worker_id).await {
        return Err(ServerError::NotFound(format!("worker {worker_id}")));
    }
    state.active.clear_if(&worker_id);
    Ok(Json(json!({
        "ok": true,
        "killed": worker_id,
        "active": state.active.get(),
    })))
}

async fn kill_all(State(state): State<Arc<AppState>>) -> Json<Value> {
    let stopped = state.supervisor.stop_all().await;
    state.active.set(None);
    Json(json!({ "ok": true, "stopped": stopped, "active": Value::Null }))
}

async fn kill_by_path(
    State(state): State<Arc<AppState>>,
    Json(req): Json<KillByPathReq>,
) -> Json<Value> {
    let res = state
        .supervisor
        .request_kill_by_path(&req.model_path, req.include_ready)
        .await;
    for wid in &res.killed {
        state.active.clear_if(wid);
    }
    Json(json!({ "ok": true, "killed": res.killed, "queued": res.queued }))
}
