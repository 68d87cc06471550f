//! Worker HTTP surface: health, streaming generation, cancel, shutdown.

use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use kiln_core::bridge::protocol::GenerateRequest;
use kiln_core::cancel::CancelRegistry;
use kiln_core::packing::PromptMessage;
use kiln_core::runjson::{build_run_json, stopped_line, wrap_trailer, RunReport};

use crate::config::WorkerCfg;
use crate::engine::{EngineError, FinishReason, GenerateSpec, SharedProgress, TokenEngine};

const DEFAULT_MAX_TOKENS: u32 = 512;
const DEFAULT_TEMPERATURE: f32 = 0.6;
const DEFAULT_TOP_P: f32 = 0.9;
const DEFAULT_STOP: &[&str] = &["</s>", "User:", "\nUser:"];

type SharedEngine = Arc<Mutex<Option<Box<dyn TokenEngine>>>>;

#[derive(Clone)]
pub struct WorkerState {
    pub cfg: Arc<WorkerCfg>,
    /// `None` until the model load finishes; the mutex also serializes the
    /// single active generation.
    pub engine: SharedEngine,
    pub registry: Arc<CancelRegistry>,
    pub progress: SharedProgress,
}

pub fn router(state: WorkerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/generate/stream", post(generate_stream))
        .route("/cancel/{session_id}", post(cancel))
        .route("/shutdown", post(shutdown))
        .with_state(state)
}

/// Render the packed message list into the plain chat template the stop
/// strings are written against.
pub fn render_prompt(messages: &[PromptMessage]) -> String {
    let mut out = String::new();
    for m in messages {
        match m.role.as_str() {
            "system" => {
                out.push_str(&m.content);
                out.push_str("\n\n");
            }
            "assistant" => {
                out.push_str("Assistant: ");
                out.push_str(&m.content);
                out.push('\n');
            }
            _ => {
                out.push_str("User: ");
                out.push_str(&m.content);
                out.push('\n');
            }
        }
    }
    out.push_str("Assistant:");
    out
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health(State(state): State<WorkerState>) -> Json<Value> {
    // A held lock means a generation is running, which implies loaded.
    let (loaded, n_ctx) = match state.engine.try_lock() {
        Ok(guard) => (
            guard.is_some(),
            guard.as_ref().map(|e| e.n_ctx()).unwrap_or(state.cfg.kwargs.n_ctx),
        ),
        Err(_) => (true, state.cfg.kwargs.n_ctx),
    };
    let model = std::path::Path::new(&state.cfg.kwargs.model_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    Json(json!({
        "ok": loaded,
        "model": model,
        "path": state.cfg.kwargs.model_path,
        "accel": state.cfg.accel,
        "kwargs": state.cfg.kwargs,
        "n_ctx": n_ctx,
        "kv_offload": state.cfg.kwargs.kv_offload,
        "progress": { "pct": state.progress.pct(), "hits": state.progress.hits() },
    }))
}

async fn cancel(
    State(state): State<WorkerState>,
    Path(session_id): Path<String>,
) -> Json<Value> {
    state.registry.cancel(&session_id);
    Json(json!({ "ok": true }))
}

async fn shutdown(State(state): State<WorkerState>) -> Json<Value> {
    info!("shutdown requested; closing model");
    let engine = Arc::clone(&state.engine);
    tokio::spawn(async move {
        let _ = tokio::task::spawn_blocking(move || {
            *engine.lock().unwrap() = None;
        })
        .await;
        std::process::exit(0);
    });
    Json(json!({ "ok": true }))
}

/// Refusals delivered before the first streamed byte.
enum StartRefusal {
    NotReady,
    ContextOverflow(String),
}

async fn generate_stream(
    State(state): State<WorkerState>,
    Json(req): Json<GenerateRequest>,
) -> Response {
    let session_id = req
        .session_id
        .clone()
        .unwrap_or_else(|| "default".to_string());
    let flag = state.registry.flag(&session_id);
    flag.clear();

    let (start_tx, start_rx) = oneshot::channel::<Result<(), StartRefusal>>();
    let (byte_tx, byte_rx) = mpsc::channel::<Result<Bytes, Infallible>>(64);

    {
        let state = state.clone();
        let flag = flag.clone();
        tokio::task::spawn_blocking(move || {
            produce(state, req, flag, start_tx, byte_tx);
        });
    }

    match start_rx.await {
        Ok(Ok(())) => {
            let body = Body::from_stream(ReceiverStream::new(byte_rx));
            (
                [
                    (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
                    (header::CACHE_CONTROL, "no-cache"),
                ],
                body,
            )
                .into_response()
        }
        Ok(Err(StartRefusal::NotReady)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "Model not ready" })),
        )
            .into_response(),
        Ok(Err(StartRefusal::ContextOverflow(msg))) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": msg }))).into_response()
        }
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "generation task failed to start" })),
        )
            .into_response(),
    }
}

/// Blocking generation driver: engine lock → prompt check → token loop →
/// trailer. Runs on the blocking pool.
fn produce(
    state: WorkerState,
    req: GenerateRequest,
    flag: kiln_core::cancel::CancelFlag,
    start_tx: oneshot::Sender<Result<(), StartRefusal>>,
    byte_tx: mpsc::Sender<Result<Bytes, Infallible>>,
) {
    let mut guard = state.engine.lock().unwrap();
    let Some(engine) = guard.as_mut() else {
        let _ = start_tx.send(Err(StartRefusal::NotReady));
        return;
    };

    let prompt = render_prompt(&req.messages);
    let prompt_tokens = engine.count_tokens(&prompt);
    let n_ctx = engine.n_ctx();
    if prompt_tokens as u32 >= n_ctx {
        let msg = format!("prompt of {prompt_tokens} tokens exceeds context window of {n_ctx}");
        let _ = start_tx.send(Err(StartRefusal::ContextOverflow(msg)));
        return;
    }
    if start_tx.send(Ok(())).is_err() {
        return;
    }

    let spec = GenerateSpec {
        prompt,
        max_tokens: req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS).max(1),
        temperature: req.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        top_p: req.top_p.unwrap_or(DEFAULT_TOP_P),
        stop: req
            .stop
            .clone()
            .unwrap_or_else(|| DEFAULT_STOP.iter().map(|s| s.to_string()).collect()),
    };

    let t_start = Instant::now();
    let mut t_first: Option<Instant> = None;
    let mut t_last: Option<Instant> = None;
    let mut out_text = String::new();

    let result = {
        let flag = flag.clone();
        let byte_tx = byte_tx.clone();
        let out = &mut out_text;
        let t_first = &mut t_first;
        let t_last = &mut t_last;
        engine.generate(&spec, &mut |piece: &str| {
            if flag.is_set() {
                return false;
            }
            let now = Instant::now();
            if t_first.is_none() {
                *t_first = Some(now);
            }
            *t_last = Some(now);
            out.push_str(piece);
            byte_tx
                .blocking_send(Ok(Bytes::from(piece.as_bytes().to_vec())))
                .is_ok()
        })
    };

    let (finish_reason, error) = match &result {
        Ok(reason) => (reason.as_finish_str().map(str::to_string), None),
        Err(e) => {
            warn!(error = %e, "generation failed mid-stream");
            let _ = byte_tx.blocking_send(Ok(Bytes::from(format!("[error] {e}"))));
            (None, Some(e.to_string()))
        }
    };
    let cancelled = flag.is_set() || matches!(result, Ok(FinishReason::Cancelled));

    let t_end = Instant::now();
    let report = RunReport {
        model_ident: engine.model_ident(),
        n_threads: state.cfg.kwargs.n_threads.unwrap_or(0),
        n_ctx,
        n_gpu_layers: state.cfg.kwargs.n_gpu_layers.unwrap_or(0),
        n_batch: state.cfg.kwargs.n_batch,
        rope_freq_base: state.cfg.kwargs.rope_freq_base,
        rope_freq_scale: state.cfg.kwargs.rope_freq_scale,
        temperature: spec.temperature,
        top_p: spec.top_p,
        max_tokens: spec.max_tokens,
        stop_strings: spec.stop.clone(),
        prompt_tokens: Some(prompt_tokens as u64),
        predicted_tokens: engine.count_tokens(&out_text) as u64,
        time_to_first_token_sec: t_first
            .map(|t| (t - t_start).as_secs_f64())
            .unwrap_or_else(|| (t_end - t_start).as_secs_f64()),
        total_time_sec: (t_end - t_start).as_secs_f64(),
        generation_sec: match (t_first, t_last) {
            (Some(a), Some(b)) => (b - a).as_secs_f64(),
            _ => 0.0,
        },
        cancelled,
        finish_reason,
        error,
        budget: json!({}),
        engine: engine.last_timings(),
    };
    let trailer = build_run_json(&report);
    let _ = byte_tx.blocking_send(Ok(Bytes::from(wrap_trailer(&trailer))));
    if cancelled && state.cfg.emit_stopped_line {
        let _ = byte_tx.blocking_send(Ok(Bytes::from(stopped_line())));
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;
    use kiln_core::runjson::{EngineTimings, RUNJSON_END, RUNJSON_START, STOPPED_LINE};
    use std::time::Duration;

    /// Deterministic engine for exercising the HTTP surface.
    struct ScriptedEngine {
        pieces: Vec<String>,
        delay: Duration,
        n_ctx: u32,
    }

    impl ScriptedEngine {
        fn quick(pieces: &[&str]) -> Self {
            Self {
                pieces: pieces.iter().map(|s| s.to_string()).collect(),
                delay: Duration::ZERO,
                n_ctx: 4096,
            }
        }
    }

    impl TokenEngine for ScriptedEngine {
        fn model_ident(&self) -> String {
            "scripted.gguf".into()
        }

        fn n_ctx(&self) -> u32 {
            self.n_ctx
        }

        fn count_tokens(&self, text: &str) -> usize {
            text.len().div_ceil(4).max(1)
        }

        fn generate(
            &mut self,
            _spec: &GenerateSpec,
            emit: &mut dyn FnMut(&str) -> bool,
        ) -> Result<FinishReason, EngineError> {
            for piece in &self.pieces {
                if !self.delay.is_zero() {
                    std::thread::sleep(self.delay);
                }
                if !emit(piece) {
                    return Ok(FinishReason::Cancelled);
                }
            }
            Ok(FinishReason::Eos)
        }

        fn last_timings(&self) -> Option<EngineTimings> {
            Some(EngineTimings {
                eval_sec: Some(0.25),
                ..EngineTimings::default()
            })
        }
    }

    fn state_with(engine: Option<Box<dyn TokenEngine>>) -> WorkerState {
        let cfg = WorkerCfg::from_lookup(|key| match key {
            "MODEL_PATH" => Some("/m/scripted.gguf".to_string()),
            _ => None,
        })
        .unwrap();
        WorkerState {
            cfg: Arc::new(cfg),
            engine: Arc::new(Mutex::new(engine)),
            registry: Arc::new(CancelRegistry::new(1)),
            progress: SharedProgress::default(),
        }
    }

    async fn serve(state: WorkerState) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn gen_request(session: &str, max_tokens: u32) -> serde_json::Value {
        json!({
            "sessionId": session,
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": max_tokens,
        })
    }

    #[test]
    fn prompt_template_orders_roles_and_ends_open() {
        let prompt = render_prompt(&[
            PromptMessage::new("system", "Be brief."),
            PromptMessage::new("user", "hi"),
            PromptMessage::new("assistant", "hello"),
            PromptMessage::new("user", "again"),
        ]);
        assert!(prompt.starts_with("Be brief.\n\n"));
        assert!(prompt.contains("User: hi\n"));
        assert!(prompt.contains("Assistant: hello\n"));
        assert!(prompt.ends_with("Assistant:"));
    }

    #[tokio::test]
    async fn health_reports_ok_only_when_loaded() {
        let base = serve(state_with(None)).await;
        let v: Value = reqwest::get(format!("{base}/health")).await.unwrap().json().await.unwrap();
        assert_eq!(v["ok"], false);

        let base = serve(state_with(Some(Box::new(ScriptedEngine::quick(&["x"]))))).await;
        let v: Value = reqwest::get(format!("{base}/health")).await.unwrap().json().await.unwrap();
        assert_eq!(v["ok"], true);
        assert_eq!(v["model"], "scripted.gguf");
        assert_eq!(v["n_ctx"], 4096);
        assert!(v["progress"]["pct"].is_number());
        assert_eq!(v["kwargs"]["model_path"], "/m/scripted.gguf");
    }

    #[tokio::test]
    async fn generate_streams_pieces_then_single_trailer() {
        let base = serve(state_with(Some(Box::new(ScriptedEngine::quick(&[
            "Hello", " ", "world",
        ]))))).await;

        let client = reqwest::Client::new();
        let body = client
            .post(format!("{base}/generate/stream"))
            .json(&gen_request("s1", 16))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();

        assert!(body.starts_with("Hello world"));
        assert_eq!(body.matches(RUNJSON_END).count(), 1);
        let start = body.find(RUNJSON_START).unwrap() + RUNJSON_START.len();
        let end = body.find(RUNJSON_END).unwrap();
        let trailer: Value = serde_json::from_str(body[start..end].trim()).unwrap();
        assert_eq!(trailer["stats"]["stopReason"], "eosFound");
        assert!(trailer["stats"]["predictedTokensCount"].as_u64().unwrap() >= 1);
        assert_eq!(trailer["stats"]["timings"]["engine"]["evalSec"], 0.25);
        assert_eq!(trailer["identifier"], "scripted.gguf");
    }

    #[tokio::test]
    async fn generate_without_engine_is_503() {
        let base = serve(state_with(None)).await;
        let resp = reqwest::Client::new()
            .post(format!("{base}/generate/stream"))
            .json(&gen_request("s1", 16))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 503);
    }

    #[tokio::test]
    async fn oversized_prompt_is_rejected_as_overflow() {
        let mut engine = ScriptedEngine::quick(&["x"]);
        engine.n_ctx = 8;
        let base = serve(state_with(Some(Box::new(engine)))).await;

        let big = "y".repeat(4096);
        let resp = reqwest::Client::new()
            .post(format!("{base}/generate/stream"))
            .json(&json!({
                "sessionId": "s1",
                "messages": [{"role": "user", "content": big}],
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
        let v: Value = resp.json().await.unwrap();
        assert!(v["error"].as_str().unwrap().contains("exceeds context window"));
    }

    #[tokio::test]
    async fn cancel_endpoint_stops_a_running_stream() {
        let engine = ScriptedEngine {
            pieces: (0..200).map(|i| format!("tok{i} ")).collect(),
            delay: Duration::from_millis(20),
            n_ctx: 4096,
        };
        let base = serve(state_with(Some(Box::new(engine)))).await;
        let client = reqwest::Client::new();

        let mut resp = client
            .post(format!("{base}/generate/stream"))
            .json(&gen_request("s1", 512))
            .send()
            .await
            .unwrap();

        // Read a couple of chunks, then cancel.
        let mut collected = Vec::new();
        if let Some(chunk) = resp.chunk().await.unwrap() {
            collected.extend_from_slice(&chunk);
        }
        let cancel_resp: Value = client
            .post(format!("{base}/cancel/s1"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(cancel_resp["ok"], true);

        let started = Instant::now();
        while let Some(chunk) = resp.chunk().await.unwrap() {
            collected.extend_from_slice(&chunk);
        }
        assert!(started.elapsed() < Duration::from_secs(2), "stream winds down fast");

        let body = String::from_utf8_lossy(&collected);
        let start = body.find(RUNJSON_START).unwrap() + RUNJSON_START.len();
        let end = body.find(RUNJSON_END).unwrap();
        let trailer: Value = serde_json::from_str(body[start..end].trim()).unwrap();
        assert_eq!(trailer["stats"]["stopReason"], "user_cancel");
        assert!(body.trim_end().ends_with(STOPPED_LINE), "visible terminator");
    }
}
