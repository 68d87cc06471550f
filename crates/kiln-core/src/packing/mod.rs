//! Context-window packing: build the message list a generation request sends
//! to the worker, rolling older history up into a running summary when the
//! token estimate outgrows the input budget.
//!
//! Token math here is deliberately cheap (chars / chars_per_token plus a flat
//! per-message overhead); the worker re-checks against the real tokenizer and
//! the bridge handles its overflow signal with a single retry.

mod budget;

pub use budget::{clamp_out_budget, BudgetView};

use serde::{Deserialize, Serialize};

use crate::settings::PackingConfig;

/// One role/content pair as sent to the worker. Distinct from the persisted
/// [`crate::chat::ChatMessage`], which carries a sequence id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

pub fn approx_tokens(text: &str, cfg: &PackingConfig) -> usize {
    let cpt = cfg.chars_per_token.max(1);
    text.len().div_ceil(cpt).max(1)
}

pub fn count_prompt_tokens(msgs: &[PromptMessage], cfg: &PackingConfig) -> usize {
    msgs.iter()
        .map(|m| approx_tokens(&m.content, cfg) + cfg.per_message_overhead)
        .sum()
}

/// Result of packing one request.
#[derive(Debug, Clone)]
pub struct Packed {
    pub messages: Vec<PromptMessage>,
    pub summary: String,
    pub input_budget: usize,
    /// Messages peeled into the summary this turn.
    pub peeled: usize,
}

fn prologue(cfg: &PackingConfig, system_text: &str, summary: &str) -> Vec<PromptMessage> {
    let mut out = vec![PromptMessage::new("user", system_text)];
    if !summary.is_empty() {
        out.push(PromptMessage::new(
            "user",
            format!("{}{}", cfg.summary_header_prefix, summary),
        ));
    }
    out
}

/// Pack system preamble + summary header + recent tail against the input
/// budget, rolling up and trimming as needed.
pub fn pack_with_rollup(
    cfg: &PackingConfig,
    system_text: &str,
    summary: &str,
    recent: &[PromptMessage],
    model_ctx: usize,
    out_budget: usize,
) -> Packed {
    let mut input_budget = model_ctx.saturating_sub(out_budget);
    if input_budget < cfg.min_input_budget {
        input_budget = cfg.min_input_budget;
    }

    let mut summary = summary.to_string();
    let mut recent: Vec<PromptMessage> = recent.to_vec();
    let mut packed: Vec<PromptMessage> = prologue(cfg, system_text, &summary)
        .into_iter()
        .chain(recent.iter().cloned())
        .collect();

    let start_tokens = count_prompt_tokens(&packed, cfg);
    let overage = start_tokens.saturating_sub(input_budget);
    let mut peeled = 0;

    if overage > cfg.skip_overage_lt && recent.len() > 6 {
        // Roll-up: peel the oldest slice of the tail into the summary.
        let target = ((recent.len() as f64 * cfg.peel_frac).ceil() as usize)
            .clamp(cfg.peel_min, cfg.peel_max)
            .min(recent.len());
        let peel: Vec<PromptMessage> = recent.drain(..target).collect();
        peeled = peel.len();

        let bullets = heuristic_bullets(&peel, cfg);
        summary = if summary.is_empty() {
            bullets
        } else {
            format!("{summary}\n{bullets}")
        };
        summary = compress_summary(&summary, cfg);

        packed = prologue(cfg, system_text, &summary)
            .into_iter()
            .chain(recent.iter().cloned())
            .collect();
    }

    let messages = final_safety_trim(packed, input_budget, cfg);

    Packed {
        messages,
        summary,
        input_budget,
        peeled,
    }
}

/// Summarize peeled messages as capped plain-text bullets.
pub fn heuristic_bullets(chunks: &[PromptMessage], cfg: &PackingConfig) -> String {
    let mut bullets = Vec::new();
    for m in chunks {
        let words: Vec<&str> = m.content.split_whitespace().collect();
        if words.is_empty() {
            continue;
        }
        let snippet = words
            .iter()
            .take(cfg.heuristic_max_words)
            .copied()
            .collect::<Vec<_>>()
            .join(" ");
        bullets.push(format!("{}{}", cfg.bullet_prefix, snippet));
        if bullets.len() >= cfg.heuristic_max_bullets {
            break;
        }
    }
    if bullets.is_empty() {
        cfg.bullet_prefix.trim().to_string()
    } else {
        bullets.join("\n")
    }
}

/// Deduplicate bullet lines and cap total characters, keeping the tail.
pub fn compress_summary(summary: &str, cfg: &PackingConfig) -> String {
    let prefix = cfg.bullet_prefix.as_str();
    let mut kept: Vec<&str> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for line in summary.lines() {
        let line = line.trim();
        if !line.starts_with(prefix) {
            continue;
        }
        let norm = line[prefix.len()..]
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        if norm.is_empty() || !seen.insert(norm) {
            continue;
        }
        kept.push(line);
    }

    let text = kept.join("\n");
    if text.len() <= cfg.summary_max_chars {
        return text;
    }

    // Over the cap: keep the newest lines that fit.
    let mut tail: Vec<&str> = Vec::new();
    let mut total = 0;
    for line in kept.iter().rev() {
        if total + line.len() + 1 > cfg.summary_max_chars {
            break;
        }
        tail.push(line);
        total += line.len() + 1;
    }
    tail.reverse();
    tail.join("\n")
}

/// Last-resort trim, in escalating order: drop oldest non-system/non-summary
/// messages, shrink the summary body, drop the summary, trim the tail.
pub fn final_safety_trim(
    mut packed: Vec<PromptMessage>,
    input_budget: usize,
    cfg: &PackingConfig,
) -> Vec<PromptMessage> {
    let toks = |msgs: &[PromptMessage]| count_prompt_tokens(msgs, cfg);

    let has_summary = packed
        .get(1)
        .map(|m| m.content.starts_with(&cfg.summary_header_prefix))
        .unwrap_or(false);
    let keep_head = if has_summary { 2 } else { 1 };

    while toks(&packed) > input_budget && packed.len() > keep_head + 1 {
        packed.remove(keep_head);
    }

    if toks(&packed) > input_budget && has_summary && packed.len() >= 2 {
        let body = packed[1].content.clone();
        let keep = ((body.len() as f64 * cfg.final_shrink_keep_ratio) as usize)
            .max(cfg.final_shrink_min_chars)
            .min(body.len());
        let start = body.len() - keep;
        // Keep the tail of the summary; cut on a char boundary.
        let cut = (start..body.len())
            .find(|i| body.is_char_boundary(*i))
            .unwrap_or(body.len());
        packed[1].content = body[cut..].to_string();
    }

    if toks(&packed) > input_budget && has_summary && packed.len() >= 2 {
        packed.remove(1);
    }

    while toks(&packed) > input_budget && packed.len() > 2 {
        let idx = if packed.len() > 3 { 2 } else { 1 };
        packed.remove(idx);
    }

    packed
}
