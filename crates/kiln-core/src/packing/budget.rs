//! Output-token budget clamping and the budget view recorded in telemetry.

use serde::Serialize;

use crate::settings::StreamConfig;

/// Structured snapshot of the token budget for one request; lands in the
/// RUNJSON trailer's `stats.budget`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetView {
    pub model_ctx: u32,
    pub clamp_margin: u32,
    pub reserved_system_tokens: u32,
    pub usable_ctx: u32,
    pub input_tokens_est: u32,
    pub out_budget_requested: u32,
    pub out_budget_chosen: u32,
    pub out_budget_max_allowed: u32,
    /// > 0 when the requested output would have overflowed the window.
    pub over_by_tokens: u32,
    pub min_out_tokens: u32,
}

/// Clamp the requested output budget to what the context window can hold:
/// `max(min_out, n_ctx − prompt_est − margin − reserved_system)`.
pub fn clamp_out_budget(
    cfg: &StreamConfig,
    model_ctx: u32,
    prompt_tokens_est: u32,
    requested_out: u32,
) -> BudgetView {
    let margin = cfg.clamp_margin;
    let reserved = cfg.reserved_system_tokens;
    let min_out = cfg.min_out_tokens;

    let available = model_ctx
        .saturating_sub(prompt_tokens_est)
        .saturating_sub(margin)
        .saturating_sub(reserved)
        .max(min_out);
    let chosen = requested_out.min(available).max(min_out);
    let over_by = (prompt_tokens_est + requested_out + margin + reserved)
        .saturating_sub(model_ctx);

    BudgetView {
        model_ctx,
        clamp_margin: margin,
        reserved_system_tokens: reserved,
        usable_ctx: model_ctx.saturating_sub(margin + reserved),
        input_tokens_est: prompt_tokens_est,
        out_budget_requested: requested_out,
        out_budget_chosen: chosen,
        out_budget_max_allowed: available,
        over_by_tokens: over_by,
        min_out_tokens: min_out,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn cfg() -> StreamConfig {
        StreamConfig {
            clamp_margin: 32,
            reserved_system_tokens: 64,
            min_out_tokens: 16,
            ..StreamConfig::default()
        }
    }

    #[test]
    fn request_within_window_is_untouched() {
        let v = clamp_out_budget(&cfg(), 4096, 1000, 512);
        assert_eq!(v.out_budget_chosen, 512);
        assert_eq!(v.over_by_tokens, 0);
        assert_eq!(v.out_budget_max_allowed, 4096 - 1000 - 32 - 64);
    }

    #[test]
    fn oversized_request_is_clamped() {
        let v = clamp_out_budget(&cfg(), 4096, 3900, 512);
        assert_eq!(v.out_budget_chosen, 4096 - 3900 - 32 - 64);
        assert!(v.over_by_tokens > 0);
    }

    #[test]
    fn floor_holds_when_prompt_fills_the_window() {
        let v = clamp_out_budget(&cfg(), 2048, 2048, 512);
        assert_eq!(v.out_budget_chosen, 16, "min_out floor");
        assert_eq!(v.out_budget_max_allowed, 16);
    }

    #[test]
    fn budget_view_serializes_camel_case() {
        let v = clamp_out_budget(&cfg(), 4096, 100, 256);
        let j = serde_json::to_value(&v).unwrap();
        assert!(j.get("modelCtx").is_some());
        assert!(j.get("outBudgetChosen").is_some());
    }
}
