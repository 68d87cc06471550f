//! Server configuration, loaded from environment variables at startup.

use std::path::PathBuf;

/// Runtime configuration for kiln-server. Every field has a default so the
/// server works out of the box.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default `127.0.0.1:8040`).
    pub bind_address: String,

    /// Per-user data root: chats, index, pending ops, runtime files.
    pub data_dir: PathBuf,

    /// Settings files (defaults are bootstrapped on first run).
    pub settings_defaults: PathBuf,
    pub settings_overrides: PathBuf,

    /// Worker executable; defaults to `kiln-worker` beside this binary.
    pub worker_program: PathBuf,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When true, workers inherit stdio so their logs are visible.
    pub worker_debug: bool,
}

impl Config {
    pub fn from_env() -> Self {
        let data_dir = PathBuf::from(env_or("KILN_DATA_DIR", ".kiln"));
        let worker_program = std::env::var("KILN_WORKER_BIN")
            .map(PathBuf::from)
            .unwrap_or_else(|_| sibling_worker_bin());
        Self {
            bind_address: env_or("KILN_BIND", "127.0.0.1:8040"),
            settings_defaults: std::env::var("KILN_SETTINGS_DEFAULTS")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("settings/defaults.json")),
            settings_overrides: std::env::var("KILN_SETTINGS_OVERRIDES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("settings/overrides.json")),
            worker_program,
            log_level: env_or("KILN_LOG", "info"),
            worker_debug: std::env::var("KILN_WORKER_DEBUG")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            data_dir,
        }
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.data_dir.join(".runtime")
    }
}

/// The worker normally ships next to the server binary.
fn sibling_worker_bin() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.join("kiln-worker")))
        .unwrap_or_else(|| PathBuf::from("kiln-worker"))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}
