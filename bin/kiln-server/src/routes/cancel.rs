//! Cancel endpoint: sets the local flag and nudges the worker, best effort.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::debug;

use kiln_core::bridge::protocol::WorkerClient;

use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api/cancel/{session_id}", post(cancel_session))
}

/// Returns 200 whether or not a generation is in progress.
async fn cancel_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Json<Value> {
    state.registry.cancel(&session_id);
    debug!(session_id, "cancel flag set");

    // Forward to the active worker so its token loop stops promptly too.
    if let Ok(worker) = state.active_worker() {
        let (host, port) = worker.addr();
        let sid = session_id.clone();
        tokio::spawn(async move {
            WorkerClient::for_addr(&host, port).cancel(&sid).await;
        });
    }

    Json(json!({ "ok": true }))
}
