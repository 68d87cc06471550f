//! VRAM guardrail planner.
//!
//! Maps (worker defaults, user overrides, live GPU state, pinned knobs) to a
//! final launch plan: effective llama kwargs, an environment patch for the
//! subprocess, and a diagnostics record. Pure over [`PlanInput`] so the whole
//! policy is unit-testable without a GPU or filesystem.
//!
//! Over-budget handling is a bounded spillover ladder: move the KV cache to
//! CPU, then drop just enough GPU layers, then shrink the context window,
//! never touching a knob the caller pinned explicitly. Auto-fit starts from a
//! full offload and lets the ladder land on the largest layer count that
//! still fits the budget.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::settings::{GuardrailMode, WorkerDefaults};

/// GiB overhead added to every projection (scratch buffers, CUDA context).
const OVERHEAD_GB: f64 = 0.2;

/// Extra headroom subtracted when driver VMM is forced off.
const VMM_PAD_GB: f64 = 0.10;

/// Spillover ladder step bound.
const MAX_SPILL_STEPS: u32 = 6;

/// Floor for context shrinking.
const MIN_CTX: u32 = 2048;

/// Conservative upper bound for KV bytes per context token.
const KV_BYTES_PER_TOKEN: u64 = 131_072;
const KV_FLOOR_BYTES: u64 = 64 * 1024 * 1024;

// ── Kwargs ───────────────────────────────────────────────────────────────────

/// Effective launch kwargs, serialized into `LLAMA_KWARGS_JSON` for the child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlamaKwargs {
    pub model_path: String,
    pub n_ctx: u32,
    pub n_batch: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_threads: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_gpu_layers: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_gpu: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rope_freq_base: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rope_freq_scale: Option<f64>,
    pub kv_offload: bool,
}

/// Caller-supplied launch knobs. A non-null value here is a hard pin: the
/// planner either honors it verbatim or aborts.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct UserKwargs {
    pub n_ctx: Option<u32>,
    pub n_batch: Option<u32>,
    pub n_threads: Option<u32>,
    pub n_gpu_layers: Option<i64>,
    pub kv_offload: Option<bool>,
    pub rope_freq_base: Option<f64>,
    pub rope_freq_scale: Option<f64>,
}

// ── Planner I/O ──────────────────────────────────────────────────────────────

/// Everything the planner reads. Assembled by the supervisor from settings,
/// the system snapshot, and its own pending-VRAM ledger.
#[derive(Debug, Clone)]
pub struct PlanInput {
    pub model_path: String,
    pub model_size_bytes: u64,
    pub user: UserKwargs,
    pub defaults: WorkerDefaults,
    /// Free bytes of GPU 0 at plan time, in GiB.
    pub free_gb: f64,
    pub total_gb: f64,
    /// Σ projections of other still-loading workers, in GiB.
    pub pending_gb: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Proceed,
    ProceedVmmAllowed,
    AbortOverBudgetHardPins,
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Decision::Proceed => "proceed",
            Decision::ProceedVmmAllowed => "proceed_vmm_allowed",
            Decision::AbortOverBudgetHardPins => "abort_over_budget_hard_pins",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Pins {
    #[serde(rename = "kvOffload")]
    pub kv_offload: bool,
    pub layers: bool,
    pub ctx: bool,
}

/// Intermediate values surfaced in 409 responses and logs.
#[derive(Debug, Clone, Serialize)]
pub struct PlanDiag {
    pub mode: String,
    #[serde(rename = "perLayerGB")]
    pub per_layer_gb: f64,
    #[serde(rename = "overheadGB")]
    pub overhead_gb: f64,
    #[serde(rename = "projGB")]
    pub proj_gb: f64,
    #[serde(rename = "freeGB")]
    pub free_gb: f64,
    #[serde(rename = "freeGBLive")]
    pub free_gb_live: f64,
    #[serde(rename = "pendingGB")]
    pub pending_gb: f64,
    #[serde(rename = "totalGB")]
    pub total_gb: f64,
    /// None encodes an unbounded budget (mode `off`).
    #[serde(rename = "budgetGB")]
    pub budget_gb: Option<f64>,
    #[serde(rename = "kvOn")]
    pub kv_on: bool,
    #[serde(rename = "nGpuLayers")]
    pub n_gpu_layers: Option<i64>,
    #[serde(rename = "nCtx")]
    pub n_ctx: u32,
    #[serde(rename = "autoFit")]
    pub auto_fit: bool,
    pub steps: u32,
    pub decision: Decision,
    pub pins: Pins,
    /// Populated on abort: the layer count that would have fit.
    #[serde(rename = "suggestedLayersThatFit", skip_serializing_if = "Option::is_none")]
    pub suggested_layers_that_fit: Option<i64>,
}

/// The planner's output, ready for the supervisor to act on.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub kwargs: LlamaKwargs,
    pub env: Vec<(String, String)>,
    pub diag: PlanDiag,
}

impl LaunchPlan {
    pub fn aborted(&self) -> bool {
        self.diag.decision == Decision::AbortOverBudgetHardPins
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn kv_gb(n_ctx: u32, kv_on: bool) -> f64 {
    if !kv_on {
        return 0.0;
    }
    let bytes = (u64::from(n_ctx) * KV_BYTES_PER_TOKEN).max(KV_FLOOR_BYTES);
    bytes as f64 / (1u64 << 30) as f64
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// KV share of a plan's projection, for pending-VRAM accounting.
pub fn kv_projection_gb(kwargs: &LlamaKwargs) -> f64 {
    kv_gb(kwargs.n_ctx, kwargs.kv_offload)
}

/// Accelerator family after normalization. `rocm` folds into `hip`.
fn normalize_accel(raw: &str) -> &'static str {
    match raw.trim().to_ascii_lowercase().as_str() {
        "cpu" => "cpu",
        "cuda" => "cuda",
        "metal" => "metal",
        "hip" | "rocm" => "hip",
        _ => "auto",
    }
}

fn budget_for(
    mode: GuardrailMode,
    custom_gb: Option<f64>,
    live_free_gb: f64,
    total_gb: f64,
    vmm_pad: f64,
) -> f64 {
    let capped = |headroom: f64, frac: f64| {
        f64::min(
            f64::max(live_free_gb - (headroom + vmm_pad), 0.0),
            (frac - vmm_pad) * total_gb,
        )
    };
    match mode {
        GuardrailMode::Off => f64::INFINITY,
        GuardrailMode::Strict => capped(0.25, 0.85),
        GuardrailMode::Balanced => capped(0.15, 0.93),
        GuardrailMode::Relaxed => capped(0.05, 0.99),
        GuardrailMode::Custom => match custom_gb {
            Some(gb) => f64::max(f64::min(gb, capped(0.15, 0.93)), 0.0),
            // custom without a figure degrades to balanced
            None => capped(0.15, 0.93),
        },
    }
}

// ── Planner ──────────────────────────────────────────────────────────────────

/// Compute the launch plan. Deterministic and side-effect free.
pub fn plan(input: &PlanInput) -> LaunchPlan {
    let d = &input.defaults;
    let gr = &d.guardrail;
    let accel = normalize_accel(&d.accel);

    let pins = Pins {
        kv_offload: input.user.kv_offload.is_some(),
        layers: matches!(input.user.n_gpu_layers, Some(n) if n > 0),
        ctx: matches!(input.user.n_ctx, Some(n) if n > 0),
    };

    // Base kwargs: defaults folded, then user values (non-null) on top.
    let mut kwargs = LlamaKwargs {
        model_path: input.model_path.clone(),
        n_ctx: input.user.n_ctx.filter(|&n| n > 0).unwrap_or(d.n_ctx),
        n_batch: input.user.n_batch.unwrap_or(d.n_batch),
        n_threads: input.user.n_threads.or(d.n_threads),
        n_gpu_layers: input.user.n_gpu_layers.or(d.n_gpu_layers),
        main_gpu: d.device,
        rope_freq_base: input.user.rope_freq_base.or(d.rope_freq_base),
        rope_freq_scale: input.user.rope_freq_scale.or(d.rope_freq_scale),
        kv_offload: false,
    };

    // KV preference: user pin wins; otherwise the settings preference, valid
    // only on GPU-capable paths.
    let kv_pref = input
        .user
        .kv_offload
        .or(d.offload_kv_to_gpu)
        .unwrap_or(false);
    kwargs.kv_offload = kv_pref && accel != "cpu";

    // Environment patch: accel selection and accelerator masking.
    let mut env: Vec<(String, String)> = vec![("LLAMA_ACCEL".into(), accel.into())];
    match accel {
        "cpu" => {
            env.push(("CUDA_VISIBLE_DEVICES".into(), "-1".into()));
            env.push(("HIP_VISIBLE_DEVICES".into(), "-1".into()));
            env.push(("LLAMA_NO_METAL".into(), "1".into()));
        }
        "hip" => {
            env.push(("CUDA_VISIBLE_DEVICES".into(), "-1".into()));
            env.push(("LLAMA_NO_METAL".into(), "1".into()));
        }
        "metal" => env.push(("LLAMA_NO_METAL".into(), "0".into())),
        _ => {}
    }
    if d.limit_offload_to_dedicated_vram {
        env.push(("GGML_CUDA_NO_VMM".into(), "1".into()));
    }

    // CPU path: nothing to budget, model and KV both stay on the host.
    if accel == "cpu" {
        kwargs.n_gpu_layers = Some(0);
        kwargs.kv_offload = false;
        debug!(model = %input.model_path, "cpu accel; skipping VRAM guardrail");
        let diag = PlanDiag {
            mode: gr.mode.to_string(),
            per_layer_gb: 0.0,
            overhead_gb: OVERHEAD_GB,
            proj_gb: 0.0,
            free_gb: 0.0,
            free_gb_live: 0.0,
            pending_gb: 0.0,
            total_gb: 0.0,
            budget_gb: None,
            kv_on: false,
            n_gpu_layers: Some(0),
            n_ctx: kwargs.n_ctx,
            auto_fit: gr.auto_fit,
            steps: 0,
            decision: Decision::Proceed,
            pins,
            suggested_layers_that_fit: None,
        };
        return LaunchPlan { kwargs, env, diag };
    }

    let total_layers = i64::from(gr.total_layers_fallback.max(1));
    let per_layer_gb = input.model_size_bytes as f64 / (1u64 << 30) as f64 / total_layers as f64;

    let auto_fit = gr.auto_fit && !pins.layers;

    // Working layer count used for projection. A pin beyond the assumed layer
    // total is clamped here only; the pinned kwarg itself is never rewritten.
    let mut ngl: i64 = match kwargs.n_gpu_layers {
        Some(n) if n > 0 => n.min(total_layers),
        // Auto-fit starts from a full offload; the ladder lands on the
        // largest count that fits.
        _ if auto_fit => total_layers,
        _ => 0,
    };

    let mut n_ctx = kwargs.n_ctx;
    let mut kv_on = kwargs.kv_offload;

    let live_free_gb = f64::max(input.free_gb - f64::max(input.pending_gb, 0.0), 0.0);
    let vmm_pad = if d.limit_offload_to_dedicated_vram {
        VMM_PAD_GB
    } else {
        0.0
    };
    let budget_gb = budget_for(gr.mode, gr.custom_gb, live_free_gb, input.total_gb, vmm_pad);

    let mut kv = kv_gb(n_ctx, kv_on);
    let mut model_gb = per_layer_gb * ngl.max(0) as f64;
    let mut proj = model_gb + kv + OVERHEAD_GB;

    debug!(
        mode = %gr.mode,
        per_layer_gb,
        budget_gb,
        proj_gb = proj,
        n_gpu_layers = ngl,
        kv_on,
        "initial projection"
    );

    let mut steps = 0u32;
    let mut decision = Decision::Proceed;

    if proj > budget_gb {
        // Off never lands here (its budget is +inf); relaxed tolerates overflow.
        if gr.mode == GuardrailMode::Relaxed {
            decision = Decision::ProceedVmmAllowed;
        } else {
            let can_flip_kv = kv_on && !pins.kv_offload;
            let can_drop_layers = per_layer_gb > 0.0 && ngl > 1 && !pins.layers;
            let can_shrink_ctx = kv_on && n_ctx > MIN_CTX && !pins.ctx;

            if !(can_flip_kv || can_drop_layers || can_shrink_ctx) {
                decision = Decision::AbortOverBudgetHardPins;
            } else {
                // Spillover ladder, bounded and deterministic.
                while proj > budget_gb && steps < MAX_SPILL_STEPS {
                    steps += 1;

                    if kv_on && !pins.kv_offload {
                        kv_on = false;
                        kv = 0.0;
                        proj = model_gb + OVERHEAD_GB;
                        info!(steps, proj_gb = proj, budget_gb, "spillover: kv cache moved to cpu");
                        continue;
                    }

                    let need_gb = proj - budget_gb;
                    if !pins.layers && per_layer_gb > 0.0 && ngl > 1 && need_gb > 0.0 {
                        let drop = (need_gb / per_layer_gb).ceil() as i64;
                        let new_ngl = (ngl - drop.max(1)).max(1);
                        if new_ngl != ngl {
                            ngl = new_ngl;
                            model_gb = per_layer_gb * ngl as f64;
                            proj = model_gb + kv + OVERHEAD_GB;
                            info!(
                                steps,
                                n_gpu_layers = ngl,
                                proj_gb = proj,
                                budget_gb,
                                "spillover: layers reduced"
                            );
                            continue;
                        }
                    }

                    if kv_on && n_ctx > MIN_CTX && !pins.ctx {
                        let new_ctx = ((n_ctx as f64 * 0.85) as u32).max(MIN_CTX);
                        if new_ctx != n_ctx {
                            n_ctx = new_ctx;
                            kv = kv_gb(n_ctx, kv_on);
                            proj = model_gb + kv + OVERHEAD_GB;
                            info!(steps, n_ctx, proj_gb = proj, budget_gb, "spillover: context shrunk");
                            continue;
                        }
                    }

                    break;
                }

                if proj > budget_gb {
                    decision = Decision::AbortOverBudgetHardPins;
                }
            }
        }
    }

    // Strict and custom budgets disallow driver VMM growth.
    if matches!(gr.mode, GuardrailMode::Strict | GuardrailMode::Custom)
        && !env.iter().any(|(k, _)| k == "GGML_CUDA_NO_VMM")
    {
        env.push(("GGML_CUDA_NO_VMM".into(), "1".into()));
    }

    // Write the fitted values back, leaving pinned knobs verbatim. The GPU
    // path floors the unpinned layer count at 1.
    if !pins.layers {
        kwargs.n_gpu_layers = Some(ngl.max(1));
    }
    if !pins.ctx {
        kwargs.n_ctx = n_ctx;
    }
    if !pins.kv_offload {
        kwargs.kv_offload = kv_on;
    }

    let suggested = if decision == Decision::AbortOverBudgetHardPins && per_layer_gb > 0.0 {
        let fit = (f64::max(0.0, budget_gb - (kv + OVERHEAD_GB)) / per_layer_gb).floor() as i64;
        Some(fit.max(1))
    } else {
        None
    };

    let diag = PlanDiag {
        mode: gr.mode.to_string(),
        per_layer_gb: round2(per_layer_gb),
        overhead_gb: OVERHEAD_GB,
        proj_gb: round2(proj),
        free_gb: round2(input.free_gb),
        free_gb_live: round2(live_free_gb),
        pending_gb: round2(input.pending_gb),
        total_gb: round2(input.total_gb),
        budget_gb: budget_gb.is_finite().then(|| round2(budget_gb)),
        kv_on,
        n_gpu_layers: kwargs.n_gpu_layers,
        n_ctx: kwargs.n_ctx,
        auto_fit,
        steps,
        decision,
        pins,
        suggested_layers_that_fit: suggested,
    };

    LaunchPlan { kwargs, env, diag }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;
    use crate::settings::GuardrailConfig;

    const GIB: u64 = 1 << 30;

    fn defaults(mode: GuardrailMode) -> WorkerDefaults {
        WorkerDefaults {
            accel: "cuda".into(),
            offload_kv_to_gpu: Some(true),
            guardrail: GuardrailConfig {
                mode,
                ..GuardrailConfig::default()
            },
            ..WorkerDefaults::default()
        }
    }

    fn input(mode: GuardrailMode) -> PlanInput {
        PlanInput {
            model_path: "/m/foo.gguf".into(),
            model_size_bytes: 8 * GIB,
            user: UserKwargs::default(),
            defaults: defaults(mode),
            free_gb: 6.0,
            total_gb: 8.0,
            pending_gb: 0.0,
        }
    }

    #[test]
    fn budget_monotone_in_strictness() {
        // off → relaxed → balanced → strict never increases the budget.
        let modes = [
            GuardrailMode::Off,
            GuardrailMode::Relaxed,
            GuardrailMode::Balanced,
            GuardrailMode::Strict,
        ];
        let budgets: Vec<f64> = modes
            .iter()
            .map(|&m| budget_for(m, None, 6.0, 8.0, 0.0))
            .collect();
        for pair in budgets.windows(2) {
            assert!(pair[0] >= pair[1], "budgets must be non-increasing: {budgets:?}");
        }
    }

    #[test]
    fn custom_budget_is_capped_by_balanced() {
        let capped = budget_for(GuardrailMode::Custom, Some(100.0), 6.0, 8.0, 0.0);
        let balanced = budget_for(GuardrailMode::Balanced, None, 6.0, 8.0, 0.0);
        assert!((capped - balanced).abs() < 1e-9);

        let small = budget_for(GuardrailMode::Custom, Some(1.5), 6.0, 8.0, 0.0);
        assert!((small - 1.5).abs() < 1e-9);
    }

    #[test]
    fn vmm_pad_tightens_the_budget() {
        let without = budget_for(GuardrailMode::Balanced, None, 6.0, 8.0, 0.0);
        let with = budget_for(GuardrailMode::Balanced, None, 6.0, 8.0, VMM_PAD_GB);
        assert!(with < without);
    }

    #[test]
    fn pending_vram_reduces_live_headroom() {
        let mut inp = input(GuardrailMode::Balanced);
        inp.pending_gb = 4.0;
        let plan_pending = plan(&inp);
        inp.pending_gb = 0.0;
        let plan_free = plan(&inp);
        assert!(plan_pending.diag.budget_gb.unwrap() < plan_free.diag.budget_gb.unwrap());
        assert_eq!(plan_pending.diag.free_gb_live, 2.0);
    }

    #[test]
    fn abort_when_all_knobs_pinned_and_over_budget() {
        // Free 2 GiB, model 8 GiB, everything pinned: planner must refuse
        // without touching the pinned values.
        let mut inp = input(GuardrailMode::Balanced);
        inp.free_gb = 2.0;
        inp.user = UserKwargs {
            n_gpu_layers: Some(40),
            n_ctx: Some(8192),
            kv_offload: Some(true),
            ..UserKwargs::default()
        };
        let p = plan(&inp);
        assert_eq!(p.diag.decision, Decision::AbortOverBudgetHardPins);
        assert!(p.aborted());
        assert_eq!(p.diag.steps, 0, "nothing movable, ladder never ran");
        assert!(p.diag.proj_gb > p.diag.budget_gb.unwrap());
        // Pins survive verbatim.
        assert_eq!(p.kwargs.n_gpu_layers, Some(40));
        assert_eq!(p.kwargs.n_ctx, 8192);
        assert!(p.kwargs.kv_offload);
        assert!(p.diag.suggested_layers_that_fit.is_some());
    }

    #[test]
    fn pinned_layers_within_budget_pass_through() {
        let mut inp = input(GuardrailMode::Balanced);
        inp.free_gb = 12.0;
        inp.total_gb = 16.0;
        inp.user.n_gpu_layers = Some(10);
        let p = plan(&inp);
        assert_eq!(p.diag.decision, Decision::Proceed);
        assert_eq!(p.kwargs.n_gpu_layers, Some(10));
    }

    #[test]
    fn auto_fit_spillover_flips_kv_before_dropping_layers() {
        // Free 6 GiB, model 8 GiB / 32 layers (0.25 GiB per layer), KV pref
        // on, no pins: a full offload plus on-GPU KV overflows the balanced
        // budget, so the first ladder move flips KV to CPU, and only then are
        // layers reduced to the largest fitting count.
        let inp = input(GuardrailMode::Balanced);
        let p = plan(&inp);
        assert_eq!(p.diag.decision, Decision::Proceed);
        assert!(!p.kwargs.kv_offload, "kv must have moved to cpu first");
        let ngl = p.kwargs.n_gpu_layers.unwrap();
        // budget 5.85, overhead 0.2, 0.25 GiB/layer → 22 layers fit, 23 do not.
        assert_eq!(ngl, 22);
        assert!(p.diag.steps >= 2);
        assert!(p.diag.proj_gb <= p.diag.budget_gb.unwrap() + 1e-9);
    }

    #[test]
    fn spillover_drops_layers_when_kv_already_pinned_off() {
        // KV pinned off, model alone over budget: the ladder reduces layers.
        let mut inp = input(GuardrailMode::Balanced);
        inp.free_gb = 4.0;
        inp.user.kv_offload = Some(false);
        let p = plan(&inp);
        assert_eq!(p.diag.decision, Decision::Proceed);
        let ngl = p.kwargs.n_gpu_layers.unwrap();
        assert!(ngl < 32 && ngl >= 1, "layers reduced, floor 1: {ngl}");
        assert!(p.diag.proj_gb <= p.diag.budget_gb.unwrap() + 1e-9);
    }

    #[test]
    fn relaxed_mode_tolerates_overflow() {
        let mut inp = input(GuardrailMode::Relaxed);
        inp.free_gb = 1.0;
        inp.user.n_gpu_layers = Some(32);
        inp.user.kv_offload = Some(true);
        inp.user.n_ctx = Some(8192);
        let p = plan(&inp);
        assert_eq!(p.diag.decision, Decision::ProceedVmmAllowed);
        assert_eq!(p.diag.steps, 0, "relaxed skips the ladder");
    }

    #[test]
    fn off_mode_has_unbounded_budget() {
        let mut inp = input(GuardrailMode::Off);
        inp.free_gb = 0.5;
        let p = plan(&inp);
        assert_eq!(p.diag.decision, Decision::Proceed);
        assert!(p.diag.budget_gb.is_none(), "budget serializes as null");
        assert_eq!(p.kwargs.n_gpu_layers, Some(32));
    }

    #[test]
    fn cpu_accel_forces_everything_onto_host() {
        let mut inp = input(GuardrailMode::Strict);
        inp.defaults.accel = "cpu".into();
        let p = plan(&inp);
        assert_eq!(p.kwargs.n_gpu_layers, Some(0));
        assert!(!p.kwargs.kv_offload);
        assert_eq!(p.diag.decision, Decision::Proceed);
        let env: std::collections::HashMap<_, _> = p.env.into_iter().collect();
        assert_eq!(env.get("LLAMA_ACCEL").map(String::as_str), Some("cpu"));
        assert_eq!(env.get("CUDA_VISIBLE_DEVICES").map(String::as_str), Some("-1"));
        assert_eq!(env.get("HIP_VISIBLE_DEVICES").map(String::as_str), Some("-1"));
        assert_eq!(env.get("LLAMA_NO_METAL").map(String::as_str), Some("1"));
    }

    #[test]
    fn strict_mode_masks_driver_vmm() {
        let mut inp = input(GuardrailMode::Strict);
        inp.free_gb = 12.0;
        inp.total_gb = 16.0;
        let p = plan(&inp);
        assert!(p.env.iter().any(|(k, v)| k == "GGML_CUDA_NO_VMM" && v == "1"));
    }

    #[test]
    fn rocm_normalizes_to_hip_and_masks_cuda() {
        let mut inp = input(GuardrailMode::Balanced);
        inp.defaults.accel = "ROCm".into();
        let p = plan(&inp);
        let env: std::collections::HashMap<_, _> = p.env.into_iter().collect();
        assert_eq!(env.get("LLAMA_ACCEL").map(String::as_str), Some("hip"));
        assert_eq!(env.get("CUDA_VISIBLE_DEVICES").map(String::as_str), Some("-1"));
    }

    #[test]
    fn context_shrink_is_last_resort_with_kv_and_layers_pinned() {
        // KV pinned on GPU and layers pinned: only the context can give.
        let mut inp = input(GuardrailMode::Balanced);
        inp.model_size_bytes = 2 * GIB;
        inp.free_gb = 1.5;
        inp.total_gb = 8.0;
        inp.defaults.n_ctx = 16384;
        inp.user.kv_offload = Some(true);
        inp.user.n_gpu_layers = Some(2);
        let p = plan(&inp);
        assert_eq!(p.diag.decision, Decision::Proceed);
        assert!(p.kwargs.n_ctx < 16384, "ctx must have shrunk");
        assert!(p.kwargs.n_ctx >= MIN_CTX);
        assert_eq!(p.kwargs.n_gpu_layers, Some(2), "layer pin untouched");
        assert!(p.kwargs.kv_offload, "kv pin untouched");
        assert!(p.diag.proj_gb <= p.diag.budget_gb.unwrap() + 1e-9);
    }

    #[test]
    fn spillover_is_bounded() {
        let mut inp = input(GuardrailMode::Strict);
        inp.free_gb = 0.1;
        inp.total_gb = 0.2;
        let p = plan(&inp);
        assert!(p.diag.steps <= MAX_SPILL_STEPS);
    }

    #[test]
    fn kv_estimate_has_a_floor() {
        assert!(kv_gb(1, true) * (1u64 << 30) as f64 >= KV_FLOOR_BYTES as f64 - 1.0);
        assert_eq!(kv_gb(4096, false), 0.0);
    }

    #[test]
    fn kwargs_json_omits_unset_knobs() {
        let inp = input(GuardrailMode::Balanced);
        let p = plan(&inp);
        let v = serde_json::to_value(&p.kwargs).unwrap();
        assert!(v.get("rope_freq_base").is_none());
        assert!(v.get("n_threads").is_none());
        assert_eq!(v["model_path"], "/m/foo.gguf");
    }
}
