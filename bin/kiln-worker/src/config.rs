//! Worker configuration from the launch environment.
//!
//! The supervisor passes the effective launch kwargs twice: as mirrored plain
//! variables (`N_CTX`, `N_GPU_LAYERS`, …) and as the `LLAMA_KWARGS_JSON`
//! blob. The blob wins; unknown keys in it are ignored rather than fatal.

use std::path::PathBuf;

use kiln_core::guardrail::LlamaKwargs;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("MODEL_PATH env is required for worker")]
    MissingModelPath,
}

/// Subset of kwargs accepted from `LLAMA_KWARGS_JSON`. `model_path` is
/// deliberately absent so the blob can never clobber `MODEL_PATH`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct KwargsPatch {
    n_ctx: Option<u32>,
    n_batch: Option<u32>,
    n_threads: Option<u32>,
    n_gpu_layers: Option<i64>,
    main_gpu: Option<u32>,
    rope_freq_base: Option<f64>,
    rope_freq_scale: Option<f64>,
    kv_offload: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct WorkerCfg {
    pub worker_id: String,
    pub host: String,
    pub port: u16,
    pub accel: String,
    /// Path to the llama shared library (`LLAMA_LIB`).
    pub lib_path: Option<PathBuf>,
    pub kwargs: LlamaKwargs,
    pub emit_stopped_line: bool,
}

impl WorkerCfg {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source (tests pass a map).
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let model_path = get("MODEL_PATH")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::MissingModelPath)?;

        fn num<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            get(key).and_then(|v| v.trim().parse().ok())
        }

        let mut kwargs = LlamaKwargs {
            model_path,
            n_ctx: num(&get, "N_CTX").unwrap_or(4096),
            n_batch: num(&get, "N_BATCH").unwrap_or(256),
            n_threads: num(&get, "N_THREADS"),
            n_gpu_layers: num(&get, "N_GPU_LAYERS"),
            main_gpu: num(&get, "LLAMA_DEVICE"),
            rope_freq_base: num(&get, "ROPE_FREQ_BASE"),
            rope_freq_scale: num(&get, "ROPE_FREQ_SCALE"),
            kv_offload: false,
        };

        if let Some(raw) = get("LLAMA_KWARGS_JSON") {
            if let Ok(patch) = serde_json::from_str::<KwargsPatch>(&raw) {
                if let Some(v) = patch.n_ctx {
                    kwargs.n_ctx = v;
                }
                if let Some(v) = patch.n_batch {
                    kwargs.n_batch = v;
                }
                if patch.n_threads.is_some() {
                    kwargs.n_threads = patch.n_threads;
                }
                if patch.n_gpu_layers.is_some() {
                    kwargs.n_gpu_layers = patch.n_gpu_layers;
                }
                if patch.main_gpu.is_some() {
                    kwargs.main_gpu = patch.main_gpu;
                }
                if patch.rope_freq_base.is_some() {
                    kwargs.rope_freq_base = patch.rope_freq_base;
                }
                if patch.rope_freq_scale.is_some() {
                    kwargs.rope_freq_scale = patch.rope_freq_scale;
                }
                if let Some(v) = patch.kv_offload {
                    kwargs.kv_offload = v;
                }
            }
        }

        Ok(Self {
            worker_id: get("WORKER_ID").unwrap_or_default(),
            host: get("WORKER_HOST").unwrap_or_else(|| "127.0.0.1".into()),
            port: num(&get, "WORKER_PORT").unwrap_or(8801),
            accel: get("LLAMA_ACCEL").unwrap_or_else(|| "auto".into()),
            lib_path: get("LLAMA_LIB").map(PathBuf::from),
            kwargs,
            emit_stopped_line: get("STREAM_EMIT_STOPPED")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn model_path_is_required() {
        let err = WorkerCfg::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingModelPath));
    }

    #[test]
    fn mirrored_numerics_fill_defaults() {
        let cfg = WorkerCfg::from_lookup(lookup(&[
            ("MODEL_PATH", "/m/foo.gguf"),
            ("N_CTX", "8192"),
            ("N_GPU_LAYERS", "20"),
            ("WORKER_PORT", "9123"),
        ]))
        .unwrap();
        assert_eq!(cfg.kwargs.n_ctx, 8192);
        assert_eq!(cfg.kwargs.n_gpu_layers, Some(20));
        assert_eq!(cfg.kwargs.n_batch, 256, "unset mirror takes default");
        assert_eq!(cfg.port, 9123);
    }

    #[test]
    fn kwargs_json_wins_over_mirrors_but_not_model_path() {
        let cfg = WorkerCfg::from_lookup(lookup(&[
            ("MODEL_PATH", "/m/real.gguf"),
            ("N_CTX", "4096"),
            (
                "LLAMA_KWARGS_JSON",
                r#"{"model_path": "/tmp/evil.gguf", "n_ctx": 2048, "kv_offload": true,
                    "some_future_knob": 7}"#,
            ),
        ]))
        .unwrap();
        assert_eq!(cfg.kwargs.model_path, "/m/real.gguf");
        assert_eq!(cfg.kwargs.n_ctx, 2048);
        assert!(cfg.kwargs.kv_offload);
    }

    #[test]
    fn malformed_kwargs_json_is_ignored() {
        let cfg = WorkerCfg::from_lookup(lookup(&[
            ("MODEL_PATH", "/m/foo.gguf"),
            ("LLAMA_KWARGS_JSON", "{broken"),
        ]))
        .unwrap();
        assert_eq!(cfg.kwargs.n_ctx, 4096);
    }
}
