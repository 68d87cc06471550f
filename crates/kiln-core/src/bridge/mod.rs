//! Streaming bridge: producer thread → bounded queue → async consumer.
//!
//! The producer opens a streaming POST against the selected worker on the
//! blocking pool, forwards token deltas into a bounded channel (back-pressure
//! via `blocking_send`), strips the worker's telemetry trailer, and finally
//! composes the client-facing RUNJSON trailer. The consumer relays bytes to
//! the HTTP response, treats a failed downstream send as a client disconnect
//! (which behaves exactly like an explicit cancel), and runs the post-stream
//! hooks on every exit path.

pub mod protocol;

use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, warn};

use crate::cancel::CancelFlag;
use crate::guardrail::LlamaKwargs;
use crate::packing::{BudgetView, PromptMessage};
use crate::runjson::{
    self, build_run_json, engine_timings_of, wrap_trailer, RunReport, TrailerSplitter,
};
use crate::settings::StreamConfig;

use protocol::{BlockingWorkerClient, GenerateRequest, StreamStartError};

/// Floor for the context-overflow retry budget.
const RETRY_MIN_TOKENS: u32 = 64;

/// Everything the bridge needs for one generation, resolved by the caller.
#[derive(Debug, Clone)]
pub struct BridgeRequest {
    pub session_id: String,
    /// `http://host:port` of the active worker.
    pub worker_base: String,
    /// Packed message list.
    pub messages: Vec<PromptMessage>,
    pub out_budget: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub stop: Vec<String>,
    /// Model identity and load kwargs for the trailer.
    pub model_ident: String,
    pub kwargs: LlamaKwargs,
    pub prompt_tokens_est: u32,
    pub budget_view: BudgetView,
    /// Cheap token estimate divisor for output accounting.
    pub chars_per_token: usize,
}

/// What a finished stream looked like, handed to the post-stream hooks.
#[derive(Debug, Clone, Default)]
pub struct StreamOutcome {
    /// Visible assistant text (trailer and terminator excluded).
    pub visible_text: String,
    pub cancelled: bool,
    pub error: Option<String>,
}

enum StreamItem {
    Delta(Bytes),
    Trailer(Bytes),
    Done(StreamOutcome),
}

/// Run one generation stream. Returns the byte receiver backing the HTTP
/// response body; `on_finish` runs after the last byte on every exit path
/// (end, cancel, disconnect, upstream error), after which the generation
/// permit is released.
pub fn run_stream(
    cfg: StreamConfig,
    req: BridgeRequest,
    flag: CancelFlag,
    permit: OwnedSemaphorePermit,
    on_finish: impl FnOnce(StreamOutcome) + Send + 'static,
) -> mpsc::Receiver<Bytes> {
    let (out_tx, out_rx) = mpsc::channel::<Bytes>(16);
    let (item_tx, mut item_rx) = mpsc::channel::<StreamItem>(cfg.queue_maxsize.max(1));

    let producer_flag = flag.clone();
    let producer = tokio::task::spawn_blocking(move || produce(req, producer_flag, item_tx));

    tokio::spawn(async move {
        let _permit = permit;
        let mut outcome = StreamOutcome::default();
        let mut client_gone = false;

        while let Some(item) = item_rx.recv().await {
            match item {
                StreamItem::Delta(bytes) => {
                    // After a cancel no further token bytes reach the client;
                    // the queue keeps draining so the producer can finish.
                    if flag.is_set() || client_gone {
                        continue;
                    }
                    if out_tx.send(bytes).await.is_err() {
                        client_gone = true;
                        flag.set();
                    }
                }
                StreamItem::Trailer(bytes) => {
                    if !client_gone && out_tx.send(bytes).await.is_err() {
                        client_gone = true;
                        flag.set();
                    }
                }
                StreamItem::Done(o) => outcome = o,
            }
        }

        if flag.is_set() {
            outcome.cancelled = true;
        }
        if outcome.cancelled && cfg.emit_stopped_line && !client_gone {
            let _ = out_tx.send(Bytes::from(runjson::stopped_line())).await;
        }

        // The producer ends as soon as its channel drains; the bound here
        // only guards a wedged upstream read.
        let _ = tokio::time::timeout(Duration::from_secs(2), producer).await;
        on_finish(outcome);
    });

    out_rx
}

fn finish_reason_from_trailer(trailer: &Value) -> Option<String> {
    let s = trailer.get("stats")?.get("stopReason")?.as_str()?;
    match s {
        "eosFound" => Some("stop".into()),
        _ if s.starts_with("finish:") => Some(s["finish:".len()..].to_string()),
        _ => None,
    }
}

fn predicted_from_trailer(trailer: &Value) -> Option<u64> {
    trailer
        .get("stats")?
        .get("predictedTokensCount")?
        .as_u64()
}

/// Blocking producer: upstream HTTP stream → bounded channel.
fn produce(req: BridgeRequest, flag: CancelFlag, tx: mpsc::Sender<StreamItem>) {
    let t_start = Instant::now();
    let client = BlockingWorkerClient::new(&req.worker_base);

    let mut wire = GenerateRequest {
        session_id: Some(req.session_id.clone()),
        messages: req.messages.clone(),
        max_tokens: Some(req.out_budget),
        temperature: Some(req.temperature),
        top_p: Some(req.top_p),
        stop: Some(req.stop.clone()),
    };

    let mut error: Option<String> = None;
    let mut visible: Vec<u8> = Vec::new();
    let mut t_first: Option<Instant> = None;
    let mut t_last: Option<Instant> = None;
    let mut worker_trailer: Option<Value> = None;

    let resp = match client.start_stream(&wire) {
        Ok(r) => Some(r),
        Err(StreamStartError::ContextOverflow(msg)) => {
            // Single retry with a halved output budget.
            let retry_tokens = (req.out_budget / 2).max(RETRY_MIN_TOKENS);
            warn!(
                session_id = %req.session_id,
                retry_tokens,
                "context overflow; retrying once: {msg}"
            );
            wire.max_tokens = Some(retry_tokens);
            match client.start_stream(&wire) {
                Ok(r) => Some(r),
                Err(e) => {
                    error = Some(e.to_string());
                    None
                }
            }
        }
        Err(e) => {
            error = Some(e.to_string());
            None
        }
    };

    if let Some(mut resp) = resp {
        let mut splitter = TrailerSplitter::new();
        let mut buf = [0u8; 4096];
        loop {
            if flag.is_set() {
                debug!(session_id = %req.session_id, "cancel observed; closing upstream stream");
                break;
            }
            match std::io::Read::read(&mut resp, &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let out = splitter.feed(&buf[..n]);
                    if out.is_empty() {
                        continue;
                    }
                    let now = Instant::now();
                    if t_first.is_none() {
                        t_first = Some(now);
                    }
                    t_last = Some(now);
                    visible.extend_from_slice(&out);
                    if tx.blocking_send(StreamItem::Delta(Bytes::from(out))).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    error = Some(e.to_string());
                    break;
                }
            }
        }

        let (rest, trailer, _tail) = splitter.finish();
        if !rest.is_empty() && error.is_none() && !flag.is_set() {
            visible.extend_from_slice(&rest);
            if tx.blocking_send(StreamItem::Delta(Bytes::from(rest))).is_err() {
                return;
            }
        }
        worker_trailer = trailer;
    }

    // Upstream failures surface as a synthetic visible chunk; the HTTP
    // response itself stays 200 with a partial stream.
    if let Some(err) = &error {
        let _ = tx.blocking_send(StreamItem::Delta(Bytes::from(format!("[error] {err}"))));
    }

    let visible_text = String::from_utf8_lossy(&visible).into_owned();
    let cancelled = flag.is_set();

    let predicted = worker_trailer
        .as_ref()
        .and_then(predicted_from_trailer)
        .unwrap_or_else(|| {
            (visible_text.len().div_ceil(req.chars_per_token.max(1))) as u64
        });
    let finish_reason = worker_trailer.as_ref().and_then(finish_reason_from_trailer);
    let engine = worker_trailer.as_ref().and_then(engine_timings_of);

    let t_end = Instant::now();
    let report = RunReport {
        model_ident: req.model_ident.clone(),
        n_threads: req.kwargs.n_threads.unwrap_or(0),
        n_ctx: req.kwargs.n_ctx,
        n_gpu_layers: req.kwargs.n_gpu_layers.unwrap_or(0),
        n_batch: req.kwargs.n_batch,
        rope_freq_base: req.kwargs.rope_freq_base,
        rope_freq_scale: req.kwargs.rope_freq_scale,
        temperature: req.temperature,
        top_p: req.top_p,
        max_tokens: wire.max_tokens.unwrap_or(req.out_budget),
        stop_strings: req.stop.clone(),
        prompt_tokens: Some(u64::from(req.prompt_tokens_est)),
        predicted_tokens: predicted,
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
        error: error.clone(),
        budget: serde_json::to_value(&req.budget_view).unwrap_or(Value::Null),
        engine,
    };
    let trailer_json = build_run_json(&report);
    let _ = tx.blocking_send(StreamItem::Trailer(Bytes::from(wrap_trailer(&trailer_json))));
    let _ = tx.blocking_send(StreamItem::Done(StreamOutcome {
        visible_text,
        cancelled,
        error,
    }));
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;
    use crate::cancel::CancelRegistry;
    use crate::packing::clamp_out_budget;
    use crate::runjson::{RUNJSON_END, RUNJSON_START, STOPPED_LINE};
    use axum::body::Body;
    use axum::extract::State;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn kwargs() -> LlamaKwargs {
        LlamaKwargs {
            model_path: "/m/foo.gguf".into(),
            n_ctx: 4096,
            n_batch: 256,
            n_threads: Some(8),
            n_gpu_layers: Some(32),
            main_gpu: None,
            rope_freq_base: None,
            rope_freq_scale: None,
            kv_offload: false,
        }
    }

    fn request(base: &str) -> BridgeRequest {
        let cfg = StreamConfig::default();
        BridgeRequest {
            session_id: "s1".into(),
            worker_base: base.to_string(),
            messages: vec![PromptMessage::new("user", "hi")],
            out_budget: 512,
            temperature: 0.6,
            top_p: 0.9,
            stop: vec!["</s>".into()],
            model_ident: "foo.gguf".into(),
            kwargs: kwargs(),
            prompt_tokens_est: 20,
            budget_view: clamp_out_budget(&cfg, 4096, 20, 512),
            chars_per_token: 4,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<Bytes>) -> String {
        let mut all = Vec::new();
        while let Some(b) =
            tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap()
        {
            all.extend_from_slice(&b);
        }
        String::from_utf8_lossy(&all).into_owned()
    }

    fn worker_trailer_body(text: &str) -> String {
        let trailer = serde_json::json!({
            "stats": {
                "stopReason": "eosFound",
                "predictedTokensCount": 5,
                "timings": {"engine": {"promptSec": 0.05, "evalSec": 0.4}},
            },
        });
        format!("{text}{}", wrap_trailer(&trailer))
    }

    fn extract_trailer(wire: &str) -> Value {
        let start = wire.find(RUNJSON_START).expect("trailer start") + RUNJSON_START.len();
        let end = wire.find(RUNJSON_END).expect("trailer end");
        serde_json::from_str(wire[start..end].trim()).expect("trailer json")
    }

    async fn run_collect(
        base: &str,
        flag: CancelFlag,
    ) -> (String, StreamOutcome) {
        let registry = CancelRegistry::new(1);
        let permit = registry.acquire_generation().await;
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let rx = run_stream(
            StreamConfig::default(),
            request(base),
            flag,
            permit,
            move |o| {
                let _ = done_tx.send(o);
            },
        );
        let wire = collect(rx).await;
        let outcome = done_rx.await.unwrap();
        (wire, outcome)
    }

    #[tokio::test]
    async fn happy_path_streams_tokens_then_single_trailer() {
        let app = Router::new().route(
            "/generate/stream",
            post(|| async { worker_trailer_body("Hello world") }),
        );
        let base = serve(app).await;

        let (wire, outcome) = run_collect(&base, CancelFlag::default()).await;

        assert!(wire.starts_with("Hello world"));
        assert_eq!(wire.matches(RUNJSON_END).count(), 1, "exactly one trailer");
        let after = &wire[wire.find(RUNJSON_END).unwrap() + RUNJSON_END.len()..];
        assert!(after.trim().is_empty(), "nothing follows the trailer");

        let trailer = extract_trailer(&wire);
        assert_eq!(trailer["stats"]["stopReason"], "eosFound");
        assert_eq!(trailer["stats"]["predictedTokensCount"], 5);
        assert_eq!(trailer["stats"]["promptTokensCount"], 20);
        assert_eq!(trailer["stats"]["timings"]["engine"]["promptSec"], 0.05);
        assert!(trailer["stats"]["budget"]["modelCtx"].is_number());

        assert_eq!(outcome.visible_text, "Hello world");
        assert!(!outcome.cancelled);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn cancel_stops_tokens_but_delivers_trailer_and_terminator() {
        // A slow worker that would stream for ~6 seconds.
        let app = Router::new().route(
            "/generate/stream",
            post(|| async {
                let (tx, rx) = mpsc::channel::<Result<Bytes, std::convert::Infallible>>(4);
                tokio::spawn(async move {
                    for i in 0..200 {
                        if tx.send(Ok(Bytes::from(format!("tok{i} ")))).await.is_err() {
                            return;
                        }
                        tokio::time::sleep(Duration::from_millis(30)).await;
                    }
                });
                Body::from_stream(tokio_stream::wrappers::ReceiverStream::new(rx))
            }),
        );
        let base = serve(app).await;

        let flag = CancelFlag::default();
        let cancel_flag = flag.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel_flag.set();
        });

        let started = Instant::now();
        let (wire, outcome) = run_collect(&base, flag).await;
        assert!(
            started.elapsed() < Duration::from_secs(3),
            "cancelled stream must wind down promptly"
        );

        let trailer = extract_trailer(&wire);
        assert_eq!(trailer["stats"]["stopReason"], "user_cancel");
        assert!(trailer["stats"]["predictedTokensCount"].as_u64().unwrap() > 0);
        assert!(wire.trim_end().ends_with(STOPPED_LINE), "visible terminator");
        assert!(outcome.cancelled);
    }

    #[tokio::test]
    async fn context_overflow_retries_once_with_halved_budget() {
        #[derive(Clone, Default)]
        struct Seen {
            calls: Arc<AtomicU32>,
            budgets: Arc<Mutex<Vec<u32>>>,
        }
        let seen = Seen::default();

        async fn handler(
            State(seen): State<Seen>,
            Json(req): Json<GenerateRequest>,
        ) -> axum::response::Response {
            let n = seen.calls.fetch_add(1, Ordering::SeqCst);
            seen.budgets.lock().unwrap().push(req.max_tokens.unwrap_or(0));
            if n == 0 {
                (
                    axum::http::StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({"error": "prompt exceeds context window"})),
                )
                    .into_response()
            } else {
                worker_trailer_body("retried ok").into_response()
            }
        }

        let app = Router::new()
            .route("/generate/stream", post(handler))
            .with_state(seen.clone());
        let base = serve(app).await;

        let (wire, outcome) = run_collect(&base, CancelFlag::default()).await;
        assert!(wire.starts_with("retried ok"));
        assert!(outcome.error.is_none());
        assert_eq!(seen.calls.load(Ordering::SeqCst), 2, "exactly one retry");
        assert_eq!(*seen.budgets.lock().unwrap(), vec![512, 256]);
    }

    #[tokio::test]
    async fn upstream_error_yields_synthetic_chunk_and_error_trailer() {
        let app = Router::new().route(
            "/generate/stream",
            post(|| async {
                (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom")
            }),
        );
        let base = serve(app).await;

        let (wire, outcome) = run_collect(&base, CancelFlag::default()).await;
        assert!(wire.contains("[error]"), "synthetic error chunk: {wire}");
        let trailer = extract_trailer(&wire);
        assert_eq!(trailer["stats"]["stopReason"], "error");
        assert!(!trailer["stats"]["error"].is_null());
        assert!(outcome.error.is_some());
        assert!(outcome.visible_text.is_empty(), "error chunk is not transcript");
    }

    #[tokio::test]
    async fn client_disconnect_behaves_like_cancel() {
        let app = Router::new().route(
            "/generate/stream",
            post(|| async {
                let (tx, rx) = mpsc::channel::<Result<Bytes, std::convert::Infallible>>(4);
                tokio::spawn(async move {
                    for _ in 0..100 {
                        if tx.send(Ok(Bytes::from("tok "))).await.is_err() {
                            return;
                        }
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                });
                Body::from_stream(tokio_stream::wrappers::ReceiverStream::new(rx))
            }),
        );
        let base = serve(app).await;

        let registry = CancelRegistry::new(1);
        let permit = registry.acquire_generation().await;
        let flag = CancelFlag::default();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let mut rx = run_stream(
            StreamConfig::default(),
            request(&base),
            flag.clone(),
            permit,
            move |o| {
                let _ = done_tx.send(o);
            },
        );

        // Read a little, then vanish like a closed browser tab.
        let _ = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        drop(rx);

        let outcome = tokio::time::timeout(Duration::from_secs(5), done_rx)
            .await
            .expect("hooks must run after disconnect")
            .unwrap();
        assert!(outcome.cancelled, "disconnect sets the cancel flag");
        assert!(flag.is_set());
    }

    #[tokio::test]
    async fn permit_is_released_after_stream_ends() {
        let app = Router::new().route(
            "/generate/stream",
            post(|| async { worker_trailer_body("hi") }),
        );
        let base = serve(app).await;

        let registry = Arc::new(CancelRegistry::new(1));
        let permit = registry.acquire_generation().await;
        let rx = run_stream(
            StreamConfig::default(),
            request(&base),
            CancelFlag::default(),
            permit,
            |_| {},
        );
        collect(rx).await;
        // Wait for the consumer task to drop the permit.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.try_acquire_generation().is_some());
    }
}
