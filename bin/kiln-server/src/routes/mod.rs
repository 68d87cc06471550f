//! Route registration.

mod cancel;
mod generate;
mod health;
mod settings_api;
mod system;
mod workers;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn build(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(health::router())
        .merge(system::router())
        .merge(settings_api::router())
        .merge(workers::router())
        .merge(generate::router())
        .merge(cancel::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
