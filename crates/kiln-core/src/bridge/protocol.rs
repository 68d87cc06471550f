//! Wire types and clients for the worker HTTP surface.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::packing::PromptMessage;

/// Body of `POST /generate/stream` on a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub messages: Vec<PromptMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

/// Model-load progress exposed by the worker health endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LoadProgress {
    pub pct: u32,
    pub hits: u32,
}

/// Body of `GET /health` on a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub ok: bool,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub accel: String,
    #[serde(default)]
    pub kwargs: Value,
    #[serde(default)]
    pub n_ctx: u32,
    #[serde(default)]
    pub kv_offload: bool,
    #[serde(default)]
    pub progress: LoadProgress,
}

/// Failure starting a worker stream, before any bytes flow.
#[derive(Debug)]
pub enum StreamStartError {
    /// The worker rejected the prompt as larger than its context window; the
    /// bridge retries once with a halved output budget.
    ContextOverflow(String),
    Other(String),
}

impl std::fmt::Display for StreamStartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamStartError::ContextOverflow(m) => write!(f, "context overflow: {m}"),
            StreamStartError::Other(m) => f.write_str(m),
        }
    }
}

fn looks_like_overflow(message: &str) -> bool {
    let m = message.to_lowercase();
    m.contains("exceed") && m.contains("context window")
}

/// Blocking client used by the producer thread. Kept separate from the async
/// client so the thread never touches the runtime.
pub struct BlockingWorkerClient {
    base: String,
    http: reqwest::blocking::Client,
}

impl BlockingWorkerClient {
    /// `base` is `http://host:port` with no trailing slash.
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            http: reqwest::blocking::Client::new(),
        }
    }

    /// Open the generation stream. The returned response is read chunk-wise
    /// by the caller.
    pub fn start_stream(
        &self,
        req: &GenerateRequest,
    ) -> Result<reqwest::blocking::Response, StreamStartError> {
        let url = format!("{}/generate/stream", self.base);
        let resp = self
            .http
            .post(&url)
            .json(req)
            .send()
            .map_err(|e| StreamStartError::Other(e.to_string()))?;

        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
            .unwrap_or(body);
        if looks_like_overflow(&message) {
            Err(StreamStartError::ContextOverflow(message))
        } else {
            Err(StreamStartError::Other(format!("worker returned {status}: {message}")))
        }
    }
}

/// Async client for the worker's control endpoints.
#[derive(Debug, Clone)]
pub struct WorkerClient {
    base: String,
    http: reqwest::Client,
}

impl WorkerClient {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            http: reqwest::Client::new(),
        }
    }

    pub fn for_addr(host: &str, port: u16) -> Self {
        Self::new(format!("http://{host}:{port}"))
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub async fn health(&self, timeout: std::time::Duration) -> Option<WorkerHealth> {
        self.http
            .get(format!("{}/health", self.base))
            .timeout(timeout)
            .send()
            .await
            .ok()?
            .json()
            .await
            .ok()
    }

    /// Best-effort: the worker may be mid-token or already done.
    pub async fn cancel(&self, session_id: &str) {
        let _ = self
            .http
            .post(format!("{}/cancel/{session_id}", self.base))
            .send()
            .await;
    }

    /// Best-effort: the worker exits while answering, so errors are expected.
    pub async fn shutdown(&self) {
        let _ = self
            .http
            .post(format!("{}/shutdown", self.base))
            .send()
            .await;
    }

    /// Run a generation to completion and return the full body text. Used by
    /// the retitle queue, which wants the whole short answer at once.
    pub async fn generate_collect(&self, req: &GenerateRequest) -> Result<String, String> {
        let resp = self
            .http
            .post(format!("{}/generate/stream", self.base))
            .json(req)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("worker returned {}", resp.status()));
        }
        resp.text().await.map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn overflow_detection_is_substring_based() {
        assert!(looks_like_overflow("Requested tokens exceed context window of 4096"));
        assert!(looks_like_overflow("would EXCEED the Context Window"));
        assert!(!looks_like_overflow("model not ready"));
    }

    #[test]
    fn generate_request_omits_unset_fields() {
        let req = GenerateRequest {
            session_id: Some("s1".into()),
            messages: vec![PromptMessage::new("user", "hi")],
            max_tokens: None,
            temperature: None,
            top_p: None,
            stop: None,
        };
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["sessionId"], "s1");
        assert!(v.get("max_tokens").is_none());
    }

    #[test]
    fn worker_health_tolerates_minimal_body() {
        let h: WorkerHealth = serde_json::from_str(r#"{"ok": false}"#).unwrap();
        assert!(!h.ok);
        assert_eq!(h.progress.pct, 0);
    }
}
