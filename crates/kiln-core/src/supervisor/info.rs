//! Worker records, status vocabulary, and launch-environment helpers.

use serde::{Deserialize, Serialize};

use crate::guardrail::LlamaKwargs;

/// Lifecycle state of a worker subprocess. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Loading,
    Ready,
    Stopped,
}

impl WorkerStatus {
    pub fn is_terminal(self) -> bool {
        self == WorkerStatus::Stopped
    }

    pub fn is_live(self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerStatus::Loading => "loading",
            WorkerStatus::Ready => "ready",
            WorkerStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Public record for one spawned worker. The process handle itself lives in
/// the supervisor's private map.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub id: String,
    pub model_path: String,
    pub port: u16,
    pub bind_host: String,
    pub client_host: String,
    pub status: WorkerStatus,
    pub kwargs: LlamaKwargs,
    pub pid: Option<u32>,
}

impl WorkerInfo {
    /// Dialing address for the worker's HTTP surface.
    pub fn addr(&self) -> (String, u16) {
        (self.client_host.clone(), self.port)
    }
}

/// Numeric knobs mirrored into the child environment so the worker can read
/// either the JSON blob or plain variables.
pub fn mirror_kwargs_to_env(kwargs: &LlamaKwargs, env: &mut Vec<(String, String)>) {
    env.push(("N_CTX".into(), kwargs.n_ctx.to_string()));
    env.push(("N_BATCH".into(), kwargs.n_batch.to_string()));
    if let Some(t) = kwargs.n_threads {
        env.push(("N_THREADS".into(), t.to_string()));
    }
    if let Some(n) = kwargs.n_gpu_layers {
        env.push(("N_GPU_LAYERS".into(), n.to_string()));
    }
    if let Some(v) = kwargs.rope_freq_base {
        env.push(("ROPE_FREQ_BASE".into(), v.to_string()));
    }
    if let Some(v) = kwargs.rope_freq_scale {
        env.push(("ROPE_FREQ_SCALE".into(), v.to_string()));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_terminality() {
        assert!(WorkerStatus::Stopped.is_terminal());
        assert!(WorkerStatus::Loading.is_live());
        assert!(WorkerStatus::Ready.is_live());
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(WorkerStatus::Loading).unwrap(),
            serde_json::json!("loading")
        );
    }

    #[test]
    fn mirrors_only_present_knobs() {
        let kwargs = LlamaKwargs {
            model_path: "/m/x.gguf".into(),
            n_ctx: 4096,
            n_batch: 256,
            n_threads: None,
            n_gpu_layers: Some(12),
            main_gpu: None,
            rope_freq_base: None,
            rope_freq_scale: None,
            kv_offload: false,
        };
        let mut env = Vec::new();
        mirror_kwargs_to_env(&kwargs, &mut env);
        let keys: Vec<&str> = env.iter().map(|(k, _)| k.as_str()).collect();
        assert!(keys.contains(&"N_CTX"));
        assert!(keys.contains(&"N_GPU_LAYERS"));
        assert!(!keys.contains(&"N_THREADS"));
        assert!(!keys.contains(&"ROPE_FREQ_BASE"));
    }
}
