//! System snapshot route.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use kiln_core::system::SystemSnapshot;

use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api/system", get(get_system))
}

async fn get_system(State(state): State<Arc<AppState>>) -> Json<SystemSnapshot> {
    Json(state.snapshot.get())
}
