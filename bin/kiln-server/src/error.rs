//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors become JSON-body responses with
//! the right status code. Guardrail refusals and "no active worker" both map
//! to 409, matching the conflict semantics of the worker lifecycle.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use kiln_core::CoreError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Propagated from kiln-core (supervisor, settings, store, bridge).
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ServerError::NotFound(m) => (StatusCode::NOT_FOUND, json!({ "error": m })),
            ServerError::BadRequest(m) => (StatusCode::BAD_REQUEST, json!({ "error": m })),
            ServerError::Core(e @ CoreError::GuardrailAbort { diag }) => (
                StatusCode::CONFLICT,
                json!({ "error": e.kind(), "detail": diag }),
            ),
            ServerError::Core(e @ CoreError::NoActiveWorker) => {
                (StatusCode::CONFLICT, json!({ "error": e.kind() }))
            }
            ServerError::Core(e @ CoreError::WorkerNotFound { .. }) => {
                (StatusCode::NOT_FOUND, json!({ "error": e.kind(), "message": e.to_string() }))
            }
            ServerError::Core(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": e.kind(), "message": e.to_string() }),
            ),
            ServerError::Internal(m) => {
                (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": m }))
            }
        };
        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ServerError {
    fn from(e: anyhow::Error) -> Self {
        ServerError::Internal(e.to_string())
    }
}
