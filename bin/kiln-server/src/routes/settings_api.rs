//! Settings API: effective view, patch, and wholesale replace.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::error::ServerError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route(
        "/api/settings",
        get(get_settings).patch(patch_settings).put(replace_settings),
    )
}

async fn get_settings(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "effective": Value::Object(state.settings.effective(None)),
        "overrides": Value::Object(state.settings.overrides()),
    }))
}

/// Recursive merge into overrides; a JSON `null` deletes the key.
async fn patch_settings(
    State(state): State<Arc<AppState>>,
    Json(patch): Json<Value>,
) -> Result<Json<Value>, ServerError> {
    state.settings.patch_overrides(patch)?;
    Ok(Json(json!({ "ok": true })))
}

async fn replace_settings(
    State(state): State<Arc<AppState>>,
    Json(new_overrides): Json<Value>,
) -> Result<Json<Value>, ServerError> {
    state.settings.replace_overrides(new_overrides)?;
    Ok(Json(json!({ "ok": true })))
}
