//! kiln-worker – one model, one subprocess.
//!
//! Startup order:
//! 1. Initialise tracing.
//! 2. Read the launch environment (`MODEL_PATH`, mirrored knobs,
//!    `LLAMA_KWARGS_JSON`).
//! 3. Bind the HTTP surface immediately; `/health` reports `ok: false` and
//!    load progress until the model finishes loading in the background.
//! 4. Load the model through the dynamic llama library.
//! 5. Exit on SIGTERM / shutdown request, closing the model first.

mod config;
mod engine;
mod server;

use std::sync::{Arc, Mutex};

use tracing::{error, info, warn};

use config::WorkerCfg;
use engine::{llama::LlamaEngine, SharedProgress, TokenEngine};
use kiln_core::cancel::CancelRegistry;
use server::WorkerState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();

    let cfg = WorkerCfg::from_env()?;
    info!(
        worker_id = %cfg.worker_id,
        model = %cfg.kwargs.model_path,
        port = cfg.port,
        accel = %cfg.accel,
        "kiln-worker starting"
    );

    let progress = SharedProgress::default();
    let state = WorkerState {
        cfg: Arc::new(cfg),
        engine: Arc::new(Mutex::new(None)),
        registry: Arc::new(CancelRegistry::new(1)),
        progress: Arc::clone(&progress),
    };

    // Load the model off the event loop; readiness polling sees progress.
    {
        let state = state.clone();
        let progress = Arc::clone(&progress);
        tokio::task::spawn_blocking(move || {
            let cfg = &state.cfg;
            match LlamaEngine::load(cfg.lib_path.clone(), &cfg.kwargs, progress) {
                Ok(engine) => {
                    *state.engine.lock().unwrap() = Some(Box::new(engine) as Box<dyn TokenEngine>);
                    info!("model loaded; worker ready");
                }
                Err(e) => {
                    error!(error = %e, "model load failed; exiting");
                    std::process::exit(1);
                }
            }
        });
    }

    let addr = format!("{}:{}", state.cfg.host, state.cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "worker HTTP surface listening");

    let shutdown_state = state.clone();
    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Close the model before exiting so the runtime can release device memory.
    let engine = Arc::clone(&shutdown_state.engine);
    let _ = tokio::task::spawn_blocking(move || {
        *engine.lock().unwrap() = None;
    })
    .await;

    info!("kiln-worker stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM (the supervisor's graceful stop).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
