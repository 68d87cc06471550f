//! kiln-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing.
//! 3. Bootstrap and load the layered settings store.
//! 4. Start the background system snapshot task.
//! 5. Build the supervisor, chat store, cancel registry, and retitle queue.
//! 6. Write `.runtime/ports.json` and serve HTTP with graceful shutdown;
//!    every worker is stopped on the way out.

mod config;
mod error;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use kiln_core::cancel::CancelRegistry;
use kiln_core::chat::ChatStore;
use kiln_core::retitle::{RetitleQueue, WorkerResolver};
use kiln_core::settings::Settings;
use kiln_core::supervisor::{Supervisor, SupervisorConfig, WorkerStatus};
use kiln_core::system::spawn_snapshot_task;

use crate::config::Config;
use crate::state::{ActiveWorker, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ─────────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ───────────────────────────────────────────────────────────
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => cfg
            .log_level
            .parse::<tracing_subscriber::EnvFilter>()
            .unwrap_or_else(|e| {
                eprintln!(
                    "WARN: KILN_LOG='{}' is not a valid tracing filter ({e}); using 'info'",
                    cfg.log_level
                );
                tracing_subscriber::EnvFilter::new("info")
            }),
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "kiln-server starting");

    // ── 3. Settings ──────────────────────────────────────────────────────────
    bootstrap_defaults(&cfg)?;
    let settings = Arc::new(Settings::load(
        &cfg.settings_defaults,
        &cfg.settings_overrides,
    )?);

    // ── 4. System snapshot ───────────────────────────────────────────────────
    let snapshot = spawn_snapshot_task();

    // ── 5. Core components ───────────────────────────────────────────────────
    let store = Arc::new(ChatStore::new(&cfg.data_dir));
    let registry = Arc::new(CancelRegistry::new(settings.stream().gen_permits));

    let sup_cfg = SupervisorConfig {
        worker_program: cfg.worker_program.clone(),
        debug: cfg.worker_debug,
        ..SupervisorConfig::default()
    };
    let supervisor = Arc::new(Supervisor::new(
        sup_cfg,
        Arc::clone(&settings),
        snapshot.clone(),
    ));

    let active = ActiveWorker::default();
    let resolver: WorkerResolver = {
        let supervisor = Arc::clone(&supervisor);
        let active = active.clone();
        Arc::new(move || {
            let id = active.get()?;
            let info = supervisor.get_worker(&id)?;
            (info.status == WorkerStatus::Ready)
                .then(|| format!("http://{}:{}", info.client_host, info.port))
        })
    };
    let retitle = RetitleQueue::start(
        Arc::clone(&settings),
        Arc::clone(&store),
        Arc::clone(&registry),
        resolver,
    );

    let state = Arc::new(AppState {
        config: Arc::new(cfg.clone()),
        settings,
        store,
        registry,
        supervisor: Arc::clone(&supervisor),
        snapshot,
        retitle,
        active,
    });

    // ── 6. HTTP server ───────────────────────────────────────────────────────
    let app = routes::build(Arc::clone(&state));
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!(addr = %local, "HTTP server listening");
    write_ports_file(&cfg, local.port());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let stopped = supervisor.stop_all().await;
    info!(stopped, "kiln-server stopped");
    Ok(())
}

/// First run: materialize the shipped defaults so the settings store always
/// has a readable defaults file to load (and the user a file to inspect).
fn bootstrap_defaults(cfg: &Config) -> anyhow::Result<()> {
    if cfg.settings_defaults.exists() {
        return Ok(());
    }
    let defaults = json!({
        "worker_default": {
            "n_ctx": 4096,
            "n_batch": 256,
            "accel": "auto",
            "offload_kv_to_gpu": true,
            "limit_offload_to_dedicated_vram": false,
            "guardrail": { "mode": "balanced", "auto_fit": true },
        },
        "stream": {
            "queue_maxsize": 64,
            "gen_permits": 1,
            "default_temperature": 0.6,
            "default_top_p": 0.9,
            "default_max_tokens": 512,
            "min_out_tokens": 16,
            "clamp_margin": 32,
            "reserved_system_tokens": 64,
            "emit_stopped_line": true,
        },
        "packing": {
            "chars_per_token": 4,
            "recent_maxlen": 64,
            "summary_max_chars": 2000,
        },
        "retitle": {
            "enable": true,
            "grace_ms": 1000,
            "backoff_start_ms": 75,
            "backoff_max_ms": 600,
            "backoff_total_ms": 20000,
        },
    });
    if let Some(dir) = cfg.settings_defaults.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(
        &cfg.settings_defaults,
        serde_json::to_string_pretty(&defaults)?,
    )?;
    info!(path = %cfg.settings_defaults.display(), "settings defaults bootstrapped");
    Ok(())
}

fn write_ports_file(cfg: &Config, api_port: u16) {
    let dir = cfg.runtime_dir();
    if let Err(e) = std::fs::create_dir_all(&dir) {
        warn!(error = %e, "cannot create runtime dir");
        return;
    }
    let path = dir.join("ports.json");
    if let Err(e) = std::fs::write(&path, json!({ "api_port": api_port }).to_string()) {
        warn!(error = %e, path = %path.display(), "cannot write ports file");
    }
}


/// Resolves when SIGINT (Ctrl-C) or SIGTERM is received.
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

    info!("shutdown signal received; starting graceful shutdown");
}
