//! RUNJSON telemetry trailer: sentinels, construction, and stream splitting.
//!
//! Every completed stream carries exactly one structured trailer between the
//! literal markers `<RUNJSON_START>` and `<RUNJSON_END>`, each on its own
//! line, so a naive consumer can split the stream by exact string match. An
//! optional visible terminator line may follow the trailer after a cancel.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const RUNJSON_START: &str = "<RUNJSON_START>";
pub const RUNJSON_END: &str = "<RUNJSON_END>";

/// Visible terminator appended when a cancelled stream is configured to show one.
pub const STOPPED_LINE: &str = "⏹ stopped";

/// The full trailer block as emitted on the wire.
pub fn wrap_trailer(trailer: &Value) -> String {
    format!("\n{RUNJSON_START}\n{trailer}\n{RUNJSON_END}\n")
}

/// The full terminator line as emitted on the wire.
pub fn stopped_line() -> String {
    format!("\n{STOPPED_LINE}\n")
}

/// Remove every trailer block from accumulated stream text.
pub fn strip_runjson(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    loop {
        match rest.find(RUNJSON_START) {
            None => {
                out.push_str(rest);
                break;
            }
            Some(start) => {
                out.push_str(&rest[..start]);
                match rest[start..].find(RUNJSON_END) {
                    // Unterminated trailer: drop the remainder.
                    None => break,
                    Some(rel_end) => {
                        rest = &rest[start + rel_end + RUNJSON_END.len()..];
                    }
                }
            }
        }
    }
    out.trim().to_string()
}

/// Why a stream ended, in the wire vocabulary.
pub fn derive_stop_reason(
    cancelled: bool,
    finish_reason: Option<&str>,
    error: Option<&str>,
) -> String {
    if cancelled {
        return "user_cancel".into();
    }
    match finish_reason {
        Some("stop") => "eosFound".into(),
        Some(other) => format!("finish:{other}"),
        None => {
            if error.is_some() {
                "error".into()
            } else {
                "end_of_stream".into()
            }
        }
    }
}

// ── Engine timings ───────────────────────────────────────────────────────────

/// Engine-level timing block. Only some native builds expose these, so every
/// field is optional and the block itself may be absent entirely.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineTimings {
    #[serde(rename = "loadSec", skip_serializing_if = "Option::is_none")]
    pub load_sec: Option<f64>,
    #[serde(rename = "promptSec", skip_serializing_if = "Option::is_none")]
    pub prompt_sec: Option<f64>,
    #[serde(rename = "evalSec", skip_serializing_if = "Option::is_none")]
    pub eval_sec: Option<f64>,
    #[serde(rename = "promptN", skip_serializing_if = "Option::is_none")]
    pub prompt_n: Option<u64>,
    #[serde(rename = "evalN", skip_serializing_if = "Option::is_none")]
    pub eval_n: Option<u64>,
}

// ── Trailer construction ─────────────────────────────────────────────────────

/// Inputs for one trailer. Timing fields are seconds.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub model_ident: String,
    /// Effective load kwargs snapshot: (n_threads, n_ctx, n_gpu_layers, n_batch,
    /// rope_freq_base, rope_freq_scale).
    pub n_threads: u32,
    pub n_ctx: u32,
    pub n_gpu_layers: i64,
    pub n_batch: u32,
    pub rope_freq_base: Option<f64>,
    pub rope_freq_scale: Option<f64>,
    /// Sampling parameters of this request.
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub stop_strings: Vec<String>,
    /// Token accounting.
    pub prompt_tokens: Option<u64>,
    pub predicted_tokens: u64,
    /// Timings.
    pub time_to_first_token_sec: f64,
    pub total_time_sec: f64,
    pub generation_sec: f64,
    /// Outcome.
    pub cancelled: bool,
    pub finish_reason: Option<String>,
    pub error: Option<String>,
    /// Budget view recorded by the bridge; empty object when unknown.
    pub budget: Value,
    pub engine: Option<EngineTimings>,
}

/// Build the trailer object in the exact wire shape.
pub fn build_run_json(report: &RunReport) -> Value {
    let tokens_per_second = if report.generation_sec > 0.0 {
        Some(report.predicted_tokens as f64 / report.generation_sec)
    } else {
        None
    };
    let total_tokens = report
        .prompt_tokens
        .map(|p| p + report.predicted_tokens);
    let stop_reason = derive_stop_reason(
        report.cancelled,
        report.finish_reason.as_deref(),
        report.error.as_deref(),
    );
    let budget = if report.budget.is_object() {
        report.budget.clone()
    } else {
        json!({})
    };

    json!({
        "indexedModelIdentifier": report.model_ident,
        "identifier": report.model_ident,
        "loadModelConfig": {
            "fields": [
                {"key": "llm.load.llama.cpuThreadPoolSize", "value": report.n_threads},
                {"key": "llm.load.contextLength", "value": report.n_ctx},
                {"key": "llm.load.llama.acceleration.offloadRatio",
                 "value": if report.n_gpu_layers > 0 { 1 } else { 0 }},
                {"key": "llm.load.llama.nBatch", "value": report.n_batch},
                {"key": "llm.load.ropeFreqBase", "value": report.rope_freq_base},
                {"key": "llm.load.ropeFreqScale", "value": report.rope_freq_scale},
            ],
        },
        "predictionConfig": {
            "fields": [
                {"key": "llm.prediction.temperature", "value": report.temperature},
                {"key": "llm.prediction.topPSampling",
                 "value": {"checked": true, "value": report.top_p}},
                {"key": "llm.prediction.maxTokens", "value": report.max_tokens},
                {"key": "llm.prediction.stopStrings", "value": report.stop_strings},
                {"key": "llm.prediction.llama.cpuThreads", "value": report.n_threads},
                {"key": "llm.prediction.tools", "value": {"type": "none"}},
                {"key": "llm.prediction.promptTemplate", "value": {"type": "none"}},
            ],
        },
        "stats": {
            "stopReason": stop_reason,
            "tokensPerSecond": tokens_per_second,
            "numGpuLayers": report.n_gpu_layers,
            "timeToFirstTokenSec": round3(report.time_to_first_token_sec),
            "totalTimeSec": round3(report.total_time_sec),
            "promptTokensCount": report.prompt_tokens,
            "predictedTokensCount": report.predicted_tokens,
            "totalTokensCount": total_tokens,
            "budget": budget,
            "timings": {"engine": report.engine},
            "error": report.error,
        },
    })
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// Pull the engine timings block out of a parsed trailer, tolerating absence.
pub fn engine_timings_of(trailer: &Value) -> Option<EngineTimings> {
    let engine = trailer.get("stats")?.get("timings")?.get("engine")?;
    if engine.is_null() {
        return None;
    }
    serde_json::from_value(engine.clone()).ok()
}

// ── Stream splitting ─────────────────────────────────────────────────────────

/// Separates token bytes from the trailer in a byte stream whose chunk
/// boundaries may fall anywhere, including inside a sentinel.
///
/// Feed chunks as they arrive; each call returns the bytes that are safe to
/// forward as visible output. After the last chunk, [`TrailerSplitter::finish`]
/// yields the parsed trailer (when one was present) plus any text that
/// followed it (e.g. a stop terminator line).
#[derive(Debug, Default)]
pub struct TrailerSplitter {
    pending: Vec<u8>,
    trailer: Vec<u8>,
    in_trailer: bool,
}

impl TrailerSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<u8> {
        if self.in_trailer {
            self.trailer.extend_from_slice(chunk);
            return Vec::new();
        }
        self.pending.extend_from_slice(chunk);

        let marker = RUNJSON_START.as_bytes();
        if let Some(idx) = find(&self.pending, marker) {
            let mut visible: Vec<u8> = self.pending.drain(..idx).collect();
            self.trailer = std::mem::take(&mut self.pending);
            self.in_trailer = true;
            // The marker is preceded by a newline we injected on the wire;
            // that newline belongs to the trailer framing, not the output.
            if visible.last() == Some(&b'\n') {
                visible.pop();
            }
            return visible;
        }

        // Hold back the longest suffix that could still begin a marker
        // (including its leading newline) in the next chunk.
        let hold = longest_marker_prefix_suffix(&self.pending, marker);
        let emit_len = self.pending.len() - hold;
        self.pending.drain(..emit_len).collect()
    }

    /// Flush held bytes and parse the trailer if one arrived.
    ///
    /// Returns `(remaining_visible, trailer, tail_text)`.
    pub fn finish(mut self) -> (Vec<u8>, Option<Value>, String) {
        if !self.in_trailer {
            return (std::mem::take(&mut self.pending), None, String::new());
        }
        let text = String::from_utf8_lossy(&self.trailer).into_owned();
        let body = text
            .strip_prefix(RUNJSON_START)
            .unwrap_or(&text);
        match body.find(RUNJSON_END) {
            Some(end) => {
                let json_text = body[..end].trim();
                let tail = body[end + RUNJSON_END.len()..].trim().to_string();
                (Vec::new(), serde_json::from_str(json_text).ok(), tail)
            }
            // Trailer never terminated: surface nothing rather than garbage.
            None => (Vec::new(), None, String::new()),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Length of the longest suffix of `buf` that is a prefix of `\n` + marker.
fn longest_marker_prefix_suffix(buf: &[u8], marker: &[u8]) -> usize {
    let mut full = Vec::with_capacity(marker.len() + 1);
    full.push(b'\n');
    full.extend_from_slice(marker);

    let max = buf.len().min(full.len().saturating_sub(1));
    for take in (1..=max).rev() {
        if buf[buf.len() - take..] == full[..take] {
            return take;
        }
    }
    // Also guard a bare marker prefix (no leading newline at chunk start).
    let max = buf.len().min(marker.len().saturating_sub(1));
    for take in (1..=max).rev() {
        if buf[buf.len() - take..] == marker[..take] {
            return take;
        }
    }
    0
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stop_reason_vocabulary() {
        assert_eq!(derive_stop_reason(true, Some("stop"), None), "user_cancel");
        assert_eq!(derive_stop_reason(false, Some("stop"), None), "eosFound");
        assert_eq!(derive_stop_reason(false, Some("length"), None), "finish:length");
        assert_eq!(derive_stop_reason(false, None, Some("boom")), "error");
        assert_eq!(derive_stop_reason(false, None, None), "end_of_stream");
    }

    #[test]
    fn trailer_wire_shape() {
        let report = RunReport {
            model_ident: "foo.gguf".into(),
            n_ctx: 4096,
            predicted_tokens: 7,
            prompt_tokens: Some(20),
            generation_sec: 0.5,
            ..Default::default()
        };
        let v = build_run_json(&report);
        assert_eq!(v["identifier"], "foo.gguf");
        assert_eq!(v["stats"]["predictedTokensCount"], 7);
        assert_eq!(v["stats"]["totalTokensCount"], 27);
        assert_eq!(v["stats"]["tokensPerSecond"], 14.0);
        assert_eq!(v["stats"]["stopReason"], "end_of_stream");
        // Absent engine timings serialize as null without changing the schema.
        assert!(v["stats"]["timings"]["engine"].is_null());
        assert!(v["stats"]["error"].is_null());
    }

    #[test]
    fn zero_generation_time_yields_null_rate() {
        let v = build_run_json(&RunReport::default());
        assert!(v["stats"]["tokensPerSecond"].is_null());
        assert!(v["stats"]["totalTokensCount"].is_null());
    }

    #[test]
    fn strip_removes_trailer_block() {
        let body = format!("hello{}world", wrap_trailer(&serde_json::json!({"a": 1})));
        assert_eq!(strip_runjson(&body), "hello\nworld");
    }

    #[test]
    fn strip_drops_unterminated_trailer() {
        let body = format!("hello\n{RUNJSON_START}\n{{\"a\":");
        assert_eq!(strip_runjson(&body), "hello");
    }

    #[test]
    fn splitter_passes_plain_tokens_through() {
        let mut sp = TrailerSplitter::new();
        let mut out = Vec::new();
        out.extend(sp.feed(b"hel"));
        out.extend(sp.feed(b"lo world"));
        let (rest, trailer, tail) = sp.finish();
        out.extend(rest);
        assert_eq!(out, b"hello world");
        assert!(trailer.is_none());
        assert!(tail.is_empty());
    }

    #[test]
    fn splitter_extracts_trailer_and_tail() {
        let wire = format!(
            "token1 token2{}{}",
            wrap_trailer(&serde_json::json!({"stats": {"stopReason": "user_cancel"}})),
            stopped_line(),
        );
        let mut sp = TrailerSplitter::new();
        let mut out = Vec::new();
        // Deliberately nasty chunking: split inside the sentinel.
        let bytes = wire.as_bytes();
        for chunk in bytes.chunks(7) {
            out.extend(sp.feed(chunk));
        }
        let (rest, trailer, tail) = sp.finish();
        out.extend(rest);
        assert_eq!(String::from_utf8(out).unwrap(), "token1 token2");
        let trailer = trailer.expect("trailer should parse");
        assert_eq!(trailer["stats"]["stopReason"], "user_cancel");
        assert_eq!(tail, STOPPED_LINE);
    }

    #[test]
    fn splitter_holds_back_partial_marker_lookalikes() {
        // A newline followed by '<RUN' could open a sentinel; it must not be
        // emitted until disambiguated.
        let mut sp = TrailerSplitter::new();
        let first = sp.feed(b"abc\n<RUN");
        assert_eq!(first, b"abc");
        // It was a false alarm; the held bytes surface with the next chunk.
        let second = sp.feed(b"NING text");
        let (rest, trailer, _) = sp.finish();
        let mut all = first;
        all.extend(second);
        all.extend(rest);
        assert_eq!(String::from_utf8(all).unwrap(), "abc\n<RUNNING text");
        assert!(trailer.is_none());
    }

    #[test]
    fn end_sentinel_appears_exactly_once_in_wire_form() {
        let wire = wrap_trailer(&serde_json::json!({}));
        assert_eq!(wire.matches(RUNJSON_END).count(), 1);
        assert!(wire.ends_with(&format!("{RUNJSON_END}\n")));
    }

    #[test]
    fn engine_timings_round_trip_through_trailer() {
        let report = RunReport {
            engine: Some(EngineTimings {
                prompt_sec: Some(0.12),
                eval_sec: Some(1.5),
                ..Default::default()
            }),
            ..Default::default()
        };
        let v = build_run_json(&report);
        let t = engine_timings_of(&v).unwrap();
        assert_eq!(t.prompt_sec, Some(0.12));
        assert_eq!(t.eval_n, None);
    }
}
