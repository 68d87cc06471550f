use thiserror::Error;

use crate::guardrail::PlanDiag;

/// Errors produced by the worker/streaming core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The guardrail planner refused the launch plan. Carries the full
    /// diagnostics record so callers can surface it verbatim (HTTP 409).
    #[error("guardrail refused launch: {}", .diag.decision)]
    GuardrailAbort { diag: Box<PlanDiag> },

    /// The worker subprocess exited before becoming ready.
    #[error("worker exited immediately; set KILN_WORKER_DEBUG=1 to see its output")]
    WorkerSpawnFailed,

    /// A generation request arrived with no active worker selected.
    #[error("no active worker")]
    NoActiveWorker,

    /// The referenced worker id does not exist.
    #[error("worker not found: {id}")]
    WorkerNotFound { id: String },

    /// The required defaults settings file is missing or unparsable.
    #[error("cannot load settings defaults from {path}: {message}")]
    SettingsDefaults { path: String, message: String },

    /// Persisting overrides (or another store file) failed.
    #[error("settings io error: {0}")]
    SettingsIo(#[from] std::io::Error),

    /// Chat/session persistence failed.
    #[error("chat store error: {message}")]
    ChatStore { message: String },

    /// An upstream worker HTTP call failed.
    #[error("worker request failed: {0}")]
    WorkerRequest(#[from] reqwest::Error),

    /// Spawning the worker subprocess failed at the OS level.
    #[error("failed to start worker process: {0}")]
    SpawnIo(std::io::Error),
}

impl CoreError {
    /// Stable machine-readable kind, used by the HTTP layer.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::GuardrailAbort { .. } => "guardrail_abort",
            CoreError::WorkerSpawnFailed => "worker_spawn_failed",
            CoreError::NoActiveWorker => "no_active_worker",
            CoreError::WorkerNotFound { .. } => "worker_not_found",
            CoreError::SettingsDefaults { .. } => "settings_defaults_error",
            CoreError::SettingsIo(_) => "settings_io_error",
            CoreError::ChatStore { .. } => "chat_store_error",
            CoreError::WorkerRequest(_) => "worker_request_failed",
            CoreError::SpawnIo(_) => "worker_spawn_failed",
        }
    }
}
