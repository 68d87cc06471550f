//! Typed views over the effective settings map.
//!
//! Each subsystem deserializes its own section once per request instead of
//! reaching into the raw map key-by-key. Every field carries a serde default
//! so a partial settings file still yields a usable configuration.

use serde::Deserialize;

use super::JsonMap;

/// Deserialize a named section of the effective map, falling back to the
/// struct's defaults when the section is missing or malformed.
pub(super) fn section<T: for<'de> Deserialize<'de> + Default>(eff: &JsonMap, key: &str) -> T {
    eff.get(key)
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

// ── Guardrail ────────────────────────────────────────────────────────────────

/// VRAM guardrail policy mode, from least to most permissive budget:
/// strict < balanced < relaxed < off. `custom` caps at a user-supplied GiB
/// figure bounded by the balanced cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardrailMode {
    Off,
    Strict,
    Balanced,
    Relaxed,
    Custom,
}

impl Default for GuardrailMode {
    fn default() -> Self {
        GuardrailMode::Balanced
    }
}

impl std::fmt::Display for GuardrailMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GuardrailMode::Off => "off",
            GuardrailMode::Strict => "strict",
            GuardrailMode::Balanced => "balanced",
            GuardrailMode::Relaxed => "relaxed",
            GuardrailMode::Custom => "custom",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    pub mode: GuardrailMode,
    /// Budget cap in GiB for `custom` mode.
    pub custom_gb: Option<f64>,
    /// When the caller did not pin layer count, pick the largest fitting one.
    pub auto_fit: bool,
    /// Assumed layer count when the model file does not reveal one.
    pub total_layers_fallback: u32,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            mode: GuardrailMode::default(),
            custom_gb: None,
            auto_fit: true,
            total_layers_fallback: 32,
        }
    }
}

// ── Worker launch defaults ───────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerDefaults {
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_threads: Option<u32>,
    pub n_gpu_layers: Option<i64>,
    pub rope_freq_base: Option<f64>,
    pub rope_freq_scale: Option<f64>,
    /// Accelerator family: cpu | cuda | metal | hip | rocm | auto.
    pub accel: String,
    /// GPU device index for CUDA/HIP paths.
    pub device: Option<u32>,
    /// Preference for keeping the KV cache on the GPU.
    pub offload_kv_to_gpu: Option<bool>,
    /// When true, mask driver VMM so offload stays within dedicated VRAM.
    pub limit_offload_to_dedicated_vram: bool,
    pub guardrail: GuardrailConfig,
}

impl Default for WorkerDefaults {
    fn default() -> Self {
        Self {
            n_ctx: 4096,
            n_batch: 256,
            n_threads: None,
            n_gpu_layers: None,
            rope_freq_base: None,
            rope_freq_scale: None,
            accel: "auto".into(),
            device: None,
            offload_kv_to_gpu: None,
            limit_offload_to_dedicated_vram: false,
            guardrail: GuardrailConfig::default(),
        }
    }
}

// ── Streaming bridge ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Bounded producer→consumer queue size.
    pub queue_maxsize: usize,
    /// Generation semaphore permits shared by interactive and retitle traffic.
    pub gen_permits: usize,
    pub default_temperature: f32,
    pub default_top_p: f32,
    pub default_max_tokens: u32,
    pub min_out_tokens: u32,
    pub clamp_margin: u32,
    pub reserved_system_tokens: u32,
    /// Emit the visible "⏹ stopped" terminator after a cancelled stream.
    pub emit_stopped_line: bool,
    pub default_session_id: String,
    pub stop_strings: Vec<String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            queue_maxsize: 64,
            gen_permits: 1,
            default_temperature: 0.6,
            default_top_p: 0.9,
            default_max_tokens: 512,
            min_out_tokens: 16,
            clamp_margin: 32,
            reserved_system_tokens: 64,
            emit_stopped_line: true,
            default_session_id: "default".into(),
            stop_strings: vec!["</s>".into(), "User:".into(), "\nUser:".into()],
        }
    }
}

// ── Context packing ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PackingConfig {
    /// Cheap token estimate: ceil(chars / chars_per_token).
    pub chars_per_token: usize,
    /// Flat per-message token overhead added to the estimate.
    pub per_message_overhead: usize,
    /// How many recent messages are kept in memory per session.
    pub recent_maxlen: usize,
    pub min_input_budget: usize,
    /// Roll-up is skipped while the overage stays below this many tokens.
    pub skip_overage_lt: usize,
    pub peel_min: usize,
    pub peel_max: usize,
    pub peel_frac: f64,
    pub heuristic_max_bullets: usize,
    pub heuristic_max_words: usize,
    pub bullet_prefix: String,
    pub summary_header_prefix: String,
    pub summary_max_chars: usize,
    pub final_shrink_keep_ratio: f64,
    pub final_shrink_min_chars: usize,
    pub system_preamble: String,
}

impl Default for PackingConfig {
    fn default() -> Self {
        Self {
            chars_per_token: 4,
            per_message_overhead: 4,
            recent_maxlen: 64,
            min_input_budget: 256,
            skip_overage_lt: 48,
            peel_min: 3,
            peel_max: 12,
            peel_frac: 0.2,
            heuristic_max_bullets: 6,
            heuristic_max_words: 18,
            bullet_prefix: "- ".into(),
            summary_header_prefix: "Conversation so far:\n".into(),
            summary_max_chars: 2000,
            final_shrink_keep_ratio: 0.5,
            final_shrink_min_chars: 200,
            system_preamble: "You are a helpful, concise assistant.".into(),
        }
    }
}

// ── Retitle queue ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetitleConfig {
    pub enable: bool,
    pub queue_maxsize: usize,
    pub grace_ms: u64,
    pub backoff_start_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_total_ms: u64,
    pub backoff_growth: f64,
    /// Minimum length for a user message to qualify as the title source.
    pub min_user_chars: usize,
    pub min_substantial_chars: usize,
    pub require_alpha: bool,
    pub max_words: usize,
    pub max_chars: usize,
    pub llm_max_tokens: u32,
    pub llm_temperature: f32,
    pub llm_top_p: f32,
    pub llm_stop: Vec<String>,
    pub system_prompt: String,
}

impl Default for RetitleConfig {
    fn default() -> Self {
        Self {
            enable: true,
            queue_maxsize: 64,
            grace_ms: 1000,
            backoff_start_ms: 75,
            backoff_max_ms: 600,
            backoff_total_ms: 20_000,
            backoff_growth: 2.0,
            min_user_chars: 8,
            min_substantial_chars: 6,
            require_alpha: true,
            max_words: 6,
            max_chars: 60,
            llm_max_tokens: 16,
            llm_temperature: 0.2,
            llm_top_p: 0.9,
            llm_stop: vec!["\n".into()],
            system_prompt: "Reply with a 2-5 word Title Case name for this \
                            conversation. No quotes, no punctuation, nothing else."
                .into(),
        }
    }
}
