//! Health / heartbeat endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tracing::debug;

use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(get_health))
}

/// Heartbeat. Also drops a `health.json` marker into the runtime dir so the
/// desktop shell can find a live server after restarts.
async fn get_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let body = json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    });

    let path = state.config.runtime_dir().join("health.json");
    let marker = body.clone();
    tokio::task::spawn_blocking(move || {
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        if let Err(e) = std::fs::write(&path, marker.to_string()) {
            debug!(error = %e, "failed to write health marker");
        }
    });

    Json(body)
}
