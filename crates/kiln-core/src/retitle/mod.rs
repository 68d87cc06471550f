//! Coalesced background retitle queue.
//!
//! One pending snapshot per (user, session) key, last write wins, with a
//! bounded FIFO of keys feeding a single worker loop. The loop defers while
//! the session is actively streaming (exponential backoff with a total cap),
//! skips jobs made stale by a newer chat sequence, and shares the generation
//! semaphore with interactive traffic so it can never pre-empt a user.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bridge::protocol::{GenerateRequest, WorkerClient};
use crate::cancel::CancelRegistry;
use crate::chat::{ChatMessage, ChatStore};
use crate::packing::PromptMessage;
use crate::runjson::{strip_runjson, STOPPED_LINE};
use crate::settings::{RetitleConfig, Settings};

/// Resolves the base URL of a ready worker able to serve a title request,
/// or `None` when no worker is available right now.
pub type WorkerResolver = Arc<dyn Fn() -> Option<String> + Send + Sync>;

type JobKey = (String, String);

#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub messages: Vec<ChatMessage>,
    pub job_seq: u64,
}

struct Inner {
    settings: Arc<Settings>,
    store: Arc<ChatStore>,
    registry: Arc<CancelRegistry>,
    resolver: WorkerResolver,
    pending: Mutex<HashMap<JobKey, JobSnapshot>>,
    enqueued: Mutex<HashSet<JobKey>>,
    tx: mpsc::Sender<JobKey>,
}

/// Handle for enqueuing retitle jobs; the worker loop runs until the handle
/// (and its clones) drop.
#[derive(Clone)]
pub struct RetitleQueue {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RetitleQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetitleQueue").finish()
    }
}

impl RetitleQueue {
    /// Spawn the worker loop and return the enqueue handle.
    pub fn start(
        settings: Arc<Settings>,
        store: Arc<ChatStore>,
        registry: Arc<CancelRegistry>,
        resolver: WorkerResolver,
    ) -> Self {
        let maxsize = settings.retitle().queue_maxsize.max(1);
        let (tx, mut rx) = mpsc::channel::<JobKey>(maxsize);
        let inner = Arc::new(Inner {
            settings,
            store,
            registry,
            resolver,
            pending: Mutex::new(HashMap::new()),
            enqueued: Mutex::new(HashSet::new()),
            tx,
        });

        let loop_inner = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(key) = rx.recv().await {
                let Some(inner) = loop_inner.upgrade() else {
                    return;
                };
                if let Err(e) = process_job(&inner, &key).await {
                    warn!(session_id = %key.1, error = %e, "retitle job failed");
                }
            }
        });

        Self { inner }
    }

    /// Replace the pending snapshot for the key and make sure the key is in
    /// the FIFO exactly once. `job_seq` defaults to the highest message id.
    pub fn enqueue(
        &self,
        uid: &str,
        session_id: &str,
        messages: Vec<ChatMessage>,
        job_seq: Option<u64>,
    ) {
        if session_id.is_empty() {
            return;
        }
        let key = (uid.to_string(), session_id.to_string());
        let job_seq =
            job_seq.unwrap_or_else(|| messages.iter().map(|m| m.id).max().unwrap_or(0));

        self.inner
            .pending
            .lock()
            .unwrap()
            .insert(key.clone(), JobSnapshot { messages, job_seq });

        let newly = self.inner.enqueued.lock().unwrap().insert(key.clone());
        if newly {
            if let Err(e) = self.inner.tx.try_send(key.clone()) {
                warn!(session_id, error = %e, "retitle queue full; dropping key");
                self.inner.enqueued.lock().unwrap().remove(&key);
                self.inner.pending.lock().unwrap().remove(&key);
            }
        }
    }

    /// Number of keys currently coalesced (tests / introspection).
    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }
}

async fn process_job(inner: &Inner, key: &JobKey) -> Result<(), String> {
    let cfg = inner.settings.retitle();
    if !cfg.enable {
        return Ok(());
    }
    let (_uid, session_id) = key;

    tokio::time::sleep(Duration::from_millis(cfg.grace_ms)).await;

    // Back off while the session is mid-stream, up to the total cap; after
    // that the job may proceed (the semaphore still orders it behind the
    // active generation).
    let mut waited = 0u64;
    let mut backoff = cfg.backoff_start_ms.max(1);
    while inner.registry.is_active(session_id) && waited < cfg.backoff_total_ms {
        tokio::time::sleep(Duration::from_millis(backoff)).await;
        waited += backoff;
        backoff = ((backoff as f64 * cfg.backoff_growth) as u64).min(cfg.backoff_max_ms);
    }

    let snapshot = {
        let mut pending = inner.pending.lock().unwrap();
        inner.enqueued.lock().unwrap().remove(key);
        pending.remove(key)
    };
    let Some(snapshot) = snapshot else {
        return Ok(());
    };

    // A newer enqueue will carry fresher messages; let it do the work.
    let cur_seq = inner.store.current_seq(session_id);
    if cur_seq > snapshot.job_seq {
        debug!(session_id, cur_seq, job_seq = snapshot.job_seq, "retitle job stale; skipping");
        return Ok(());
    }

    let Some(src) = pick_source(&snapshot.messages, &cfg) else {
        return Ok(());
    };

    let _permit = inner.registry.acquire_generation().await;

    let Some(base) = (inner.resolver)() else {
        debug!(session_id, "no ready worker for retitle");
        return Ok(());
    };

    let req = GenerateRequest {
        session_id: Some(format!("retitle-{session_id}")),
        messages: vec![
            PromptMessage::new("system", cfg.system_prompt.clone()),
            PromptMessage::new("user", format!("Conversation opener:\n{src}")),
        ],
        max_tokens: Some(cfg.llm_max_tokens),
        temperature: Some(cfg.llm_temperature),
        top_p: Some(cfg.llm_top_p),
        stop: Some(cfg.llm_stop.clone()),
    };
    let raw = WorkerClient::new(base).generate_collect(&req).await?;
    drop(_permit);

    let title = sanitize_title(&strip_stream_chrome(&raw), &cfg);
    if title.is_empty() {
        return Ok(());
    }
    match inner.store.update_title(session_id, &title) {
        Ok(true) => info!(session_id, title, "chat retitled"),
        Ok(false) => {}
        Err(e) => return Err(e.to_string()),
    }
    Ok(())
}

/// Remove the trailer and the stop terminator from a collected stream body.
fn strip_stream_chrome(raw: &str) -> String {
    let text = strip_runjson(raw);
    text.replace(STOPPED_LINE, " ").trim().to_string()
}

/// First substantial user message; fallback: last substantial assistant.
pub fn pick_source(messages: &[ChatMessage], cfg: &RetitleConfig) -> Option<String> {
    let substantial = |text: &str| {
        let t = text.trim();
        t.len() >= cfg.min_substantial_chars
            && (!cfg.require_alpha || t.chars().any(|c| c.is_ascii_alphabetic()))
    };

    messages
        .iter()
        .find(|m| {
            m.role == "user" && m.content.trim().len() >= cfg.min_user_chars && substantial(&m.content)
        })
        .or_else(|| {
            messages
                .iter()
                .rev()
                .find(|m| m.role == "assistant" && substantial(&m.content))
        })
        .map(|m| m.content.trim().to_string())
}

/// Clean the model's title suggestion: drop wrapping quotes and code fences,
/// keep a conservative character set, cap words and characters.
pub fn sanitize_title(raw: &str, cfg: &RetitleConfig) -> String {
    let mut s = raw.trim().to_string();
    for _ in 0..2 {
        s = s
            .trim()
            .trim_matches('"')
            .trim_matches('\'')
            .trim_matches('`')
            .to_string();
    }

    let filtered: String = s
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, ' ' | '\'' | '&' | '-') {
                c
            } else {
                ' '
            }
        })
        .collect();
    let mut s = filtered.split_whitespace().collect::<Vec<_>>().join(" ");

    if cfg.max_words > 0 {
        s = s
            .split_whitespace()
            .take(cfg.max_words)
            .collect::<Vec<_>>()
            .join(" ");
    }
    if cfg.max_chars > 0 && s.len() > cfg.max_chars {
        let mut cut = cfg.max_chars;
        while cut > 0 && !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s = s[..cut].trim_end().to_string();
    }
    s.trim_end_matches(['.', ':', ';', ',', '-', ' ']).to_string()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;
    use axum::routing::post;
    use axum::Router;
    use serde_json::json;

    fn cfg() -> RetitleConfig {
        RetitleConfig::default()
    }

    fn msg(id: u64, role: &str, content: &str) -> ChatMessage {
        ChatMessage {
            id,
            role: role.into(),
            content: content.into(),
        }
    }

    #[test]
    fn source_prefers_first_substantial_user_message() {
        let msgs = vec![
            msg(1, "user", "hi"),
            msg(2, "user", "How do I tune GPU offload for llama models?"),
            msg(3, "assistant", "Here is a long detailed answer about offload."),
            msg(4, "user", "Another later question about something else?"),
        ];
        let src = pick_source(&msgs, &cfg()).unwrap();
        assert!(src.starts_with("How do I tune"));
    }

    #[test]
    fn source_falls_back_to_last_substantial_assistant() {
        let msgs = vec![
            msg(1, "user", "ok"),
            msg(2, "assistant", "First answer with enough substance."),
            msg(3, "assistant", "Second answer, also substantial."),
        ];
        let src = pick_source(&msgs, &cfg()).unwrap();
        assert!(src.starts_with("Second answer"));
    }

    #[test]
    fn source_none_when_nothing_substantial() {
        let msgs = vec![msg(1, "user", "ok"), msg(2, "assistant", "…")];
        assert!(pick_source(&msgs, &cfg()).is_none());
    }

    #[test]
    fn sanitize_drops_quotes_fences_and_noise() {
        let c = cfg();
        assert_eq!(sanitize_title("\"GPU Offload Tuning\"", &c), "GPU Offload Tuning");
        assert_eq!(sanitize_title("`Rust Workers`.", &c), "Rust Workers");
        assert_eq!(
            sanitize_title("Title:   with\nweird   spacing!!!", &c),
            "Title with weird spacing"
        );
    }

    #[test]
    fn sanitize_caps_words_and_chars() {
        let c = cfg();
        let long = "One Two Three Four Five Six Seven Eight";
        assert_eq!(sanitize_title(long, &c), "One Two Three Four Five Six");
        let mut tight = cfg();
        tight.max_chars = 7;
        assert_eq!(sanitize_title("Abcdefghij", &tight), "Abcdefg");
    }

    #[test]
    fn stream_chrome_is_removed() {
        let body = format!(
            "A Nice Title{}\n{STOPPED_LINE}\n",
            crate::runjson::wrap_trailer(&json!({"stats": {}}))
        );
        assert_eq!(strip_stream_chrome(&body), "A Nice Title");
    }

    // ── Queue behavior ───────────────────────────────────────────────────────

    struct Fixture {
        queue: RetitleQueue,
        store: Arc<ChatStore>,
        registry: Arc<CancelRegistry>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(worker_base: Option<String>, retitle_overrides: serde_json::Value) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut retitle = json!({
            "grace_ms": 10,
            "backoff_start_ms": 10,
            "backoff_max_ms": 20,
            "backoff_total_ms": 120,
        });
        if let (Some(dst), Some(src)) = (retitle.as_object_mut(), retitle_overrides.as_object()) {
            for (k, v) in src {
                dst.insert(k.clone(), v.clone());
            }
        }
        let settings = Arc::new(Settings::from_values(json!({"retitle": retitle}), json!({})));
        let store = Arc::new(ChatStore::new(dir.path()));
        let registry = Arc::new(CancelRegistry::new(1));
        let resolver: WorkerResolver = Arc::new(move || worker_base.clone());
        let queue = RetitleQueue::start(settings, Arc::clone(&store), Arc::clone(&registry), resolver);
        Fixture {
            queue,
            store,
            registry,
            _dir: dir,
        }
    }

    async fn fake_title_worker(title: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            "/generate/stream",
            post(move || async move {
                format!(
                    "{title}{}",
                    crate::runjson::wrap_trailer(&json!({"stats": {"stopReason": "eosFound"}}))
                )
            }),
        );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn seed_session(store: &ChatStore, sid: &str) -> u64 {
        store
            .append_message(sid, "user", "How do I tune GPU offload for llama?")
            .unwrap();
        let seq = store.append_message(sid, "assistant", "Like this, at length.").unwrap();
        store.touch_index(sid).unwrap();
        seq
    }

    async fn wait_for_title(store: &ChatStore, sid: &str, deadline: Duration) -> String {
        let start = tokio::time::Instant::now();
        loop {
            let title = store
                .load_index()
                .into_iter()
                .find(|r| r.session_id == sid)
                .map(|r| r.title)
                .unwrap_or_default();
            if !title.is_empty() || start.elapsed() > deadline {
                return title;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn retitles_idle_session_from_worker_output() {
        let base = fake_title_worker("\"Gpu Offload Help\"").await;
        let fx = fixture(Some(base), json!({})).await;
        let seq = seed_session(&fx.store, "s1");

        fx.queue
            .enqueue("local", "s1", fx.store.list_messages("s1"), Some(seq));
        let title = wait_for_title(&fx.store, "s1", Duration::from_secs(3)).await;
        assert_eq!(title, "Gpu Offload Help");
    }

    #[tokio::test]
    async fn stale_job_is_skipped() {
        let base = fake_title_worker("Should Not Appear").await;
        let fx = fixture(Some(base), json!({})).await;
        let seq = seed_session(&fx.store, "s1");

        // Enqueue with an old seq, then advance the chat.
        fx.queue
            .enqueue("local", "s1", fx.store.list_messages("s1"), Some(seq));
        fx.store.append_message("s1", "user", "newer turn").unwrap();

        let title = wait_for_title(&fx.store, "s1", Duration::from_millis(600)).await;
        assert_eq!(title, "", "stale snapshot must not retitle");
    }

    #[tokio::test]
    async fn enqueue_coalesces_per_key() {
        let fx = fixture(None, json!({"grace_ms": 200})).await;
        let seq = seed_session(&fx.store, "s1");
        for _ in 0..5 {
            fx.queue
                .enqueue("local", "s1", fx.store.list_messages("s1"), Some(seq));
        }
        assert_eq!(fx.queue.pending_len(), 1, "last write wins on one key");
    }

    #[tokio::test]
    async fn defers_while_session_is_active() {
        let base = fake_title_worker("Deferred Title").await;
        let fx = fixture(Some(base), json!({})).await;
        let seq = seed_session(&fx.store, "s1");

        fx.registry.mark_active("s1", 1);
        fx.queue
            .enqueue("local", "s1", fx.store.list_messages("s1"), Some(seq));

        // While active (and within the backoff budget) no title appears.
        tokio::time::sleep(Duration::from_millis(80)).await;
        let early = fx
            .store
            .load_index()
            .into_iter()
            .find(|r| r.session_id == "s1")
            .map(|r| r.title)
            .unwrap_or_default();
        assert_eq!(early, "", "retitle must not run mid-stream");

        fx.registry.mark_active("s1", -1);
        let title = wait_for_title(&fx.store, "s1", Duration::from_secs(3)).await;
        assert_eq!(title, "Deferred Title");
    }

    #[tokio::test]
    async fn disabled_queue_does_nothing() {
        let base = fake_title_worker("Nope").await;
        let fx = fixture(Some(base), json!({"enable": false})).await;
        let seq = seed_session(&fx.store, "s1");
        fx.queue
            .enqueue("local", "s1", fx.store.list_messages("s1"), Some(seq));
        let title = wait_for_title(&fx.store, "s1", Duration::from_millis(400)).await;
        assert_eq!(title, "");
    }
}
