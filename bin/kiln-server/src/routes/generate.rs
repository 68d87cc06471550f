//! The generate endpoint: front half of the streaming bridge.
//!
//! Loads session state, packs the prompt against the active worker's context
//! window, clamps the output budget, then hands off to
//! [`kiln_core::bridge::run_stream`]. Post-stream bookkeeping (assistant
//! message, pending ops, retitle) runs on every exit path.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use kiln_core::bridge::{self, protocol::GenerateRequest, BridgeRequest};
use kiln_core::packing::{clamp_out_budget, count_prompt_tokens, pack_with_rollup, PromptMessage};
use kiln_core::runjson::strip_runjson;

use crate::error::ServerError;
use crate::state::AppState;

/// Uid used for retitle keys until multi-user routing exists above this layer.
const LOCAL_UID: &str = "local";

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api/generate", post(generate))
}

async fn generate(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GenerateRequest>,
) -> Result<Response, ServerError> {
    let stream_cfg = state.settings.stream();
    let pack_cfg = state.settings.packing();

    let session_id = body
        .session_id
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| stream_cfg.default_session_id.clone());

    if body.messages.is_empty() {
        return Ok(plain_response(Body::from("")));
    }

    // Persist the incoming turn before anything can fail mid-stream.
    for m in &body.messages {
        state.store.append_message(&session_id, &m.role, &m.content)?;
    }
    state.store.touch_index(&session_id)?;

    // Active worker first: no point packing for a window we don't have.
    let worker = state.active_worker()?;
    let n_ctx = worker.kwargs.n_ctx;
    let model_ident = std::path::Path::new(&worker.model_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "local-gguf".into());

    let temperature = body.temperature.unwrap_or(stream_cfg.default_temperature);
    let top_p = body.top_p.unwrap_or(stream_cfg.default_top_p);
    let requested_out = body.max_tokens.unwrap_or(stream_cfg.default_max_tokens);
    let stop = body
        .stop
        .clone()
        .unwrap_or_else(|| stream_cfg.stop_strings.clone());

    // Session tail + running summary, trailer chrome stripped.
    let rec = state.store.load_chat(&session_id);
    let tail_start = rec.messages.len().saturating_sub(pack_cfg.recent_maxlen);
    let recent: Vec<PromptMessage> = rec.messages[tail_start..]
        .iter()
        .map(|m| PromptMessage::new(m.role.clone(), strip_runjson(&m.content)))
        .collect();

    let packed = pack_with_rollup(
        &pack_cfg,
        &pack_cfg.system_preamble,
        &rec.summary,
        &recent,
        n_ctx as usize,
        requested_out as usize,
    );
    if packed.peeled > 0 {
        info!(session_id, peeled = packed.peeled, "rolled old messages into summary");
        state.store.set_summary(&session_id, &packed.summary)?;
    }

    let prompt_tokens_est = count_prompt_tokens(&packed.messages, &pack_cfg) as u32;
    let budget_view = clamp_out_budget(&stream_cfg, n_ctx, prompt_tokens_est, requested_out);
    let out_budget = budget_view.out_budget_chosen;
    info!(
        session_id,
        msgs = packed.messages.len(),
        prompt_tokens_est,
        out_budget,
        "generation packed"
    );

    // Cancel flag armed fresh for this stream.
    let flag = state.registry.flag(&session_id);
    flag.clear();

    let permit = state.registry.acquire_generation().await;
    state.registry.mark_active(&session_id, 1);

    let breq = BridgeRequest {
        session_id: session_id.clone(),
        worker_base: format!("http://{}:{}", worker.client_host, worker.port),
        messages: packed.messages,
        out_budget,
        temperature,
        top_p,
        stop,
        model_ident,
        kwargs: worker.kwargs.clone(),
        prompt_tokens_est,
        budget_view,
        chars_per_token: pack_cfg.chars_per_token,
    };

    let hooks = {
        let store = Arc::clone(&state.store);
        let registry = Arc::clone(&state.registry);
        let retitle = state.retitle.clone();
        let session_id = session_id.clone();
        move |outcome: bridge::StreamOutcome| {
            let text = outcome.visible_text.trim();
            if !text.is_empty() {
                if let Err(e) = store.append_message(&session_id, "assistant", text) {
                    warn!(session_id, error = %e, "failed to persist assistant message");
                }
            }
            store.apply_pending_for(&session_id);
            let messages = store.list_messages(&session_id);
            let seq = store.current_seq(&session_id);
            retitle.enqueue(LOCAL_UID, &session_id, messages, Some(seq));
            registry.mark_active(&session_id, -1);
            info!(session_id, cancelled = outcome.cancelled, "generation stream finished");
        }
    };

    let rx = bridge::run_stream(stream_cfg, breq, flag, permit, hooks);
    let body = Body::from_stream(
        ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>),
    );
    Ok(plain_response(body))
}

fn plain_response(body: Body) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        body,
    )
        .into_response()
}
