//! The inference engine boundary.
//!
//! The worker talks to the native runtime exclusively through [`TokenEngine`]
//! so the HTTP surface and streaming logic are testable without a model file.
//! The shipped implementation is [`llama::LlamaEngine`], which loads the
//! llama.cpp shared library at runtime.

pub mod llama;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use kiln_core::runjson::EngineTimings;
use thiserror::Error;

/// One generation request as the engine sees it: a fully rendered prompt.
#[derive(Debug, Clone)]
pub struct GenerateSpec {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub stop: Vec<String>,
}

/// Why a generation loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The model emitted an end-of-generation token.
    Eos,
    /// A stop string was produced.
    StopString,
    /// The token budget ran out.
    Length,
    /// The emit sink asked to stop (cooperative cancel).
    Cancelled,
}

impl FinishReason {
    /// Wire vocabulary used in the telemetry trailer.
    pub fn as_finish_str(self) -> Option<&'static str> {
        match self {
            FinishReason::Eos | FinishReason::StopString => Some("stop"),
            FinishReason::Length => Some("length"),
            FinishReason::Cancelled => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to load runtime library {path}: {message}")]
    LibraryLoad { path: String, message: String },

    #[error("failed to load model {path}")]
    ModelLoad { path: String },

    #[error("failed to create inference context")]
    ContextCreate,

    #[error("prompt of {prompt_tokens} tokens exceeds context window of {n_ctx}")]
    ContextExceeded { prompt_tokens: usize, n_ctx: u32 },

    #[error("tokenization failed")]
    Tokenize,

    #[error("decode failed with status {0}")]
    Decode(i32),
}

impl EngineError {
    pub fn is_context_overflow(&self) -> bool {
        matches!(self, EngineError::ContextExceeded { .. })
    }
}

/// Model-load progress shared between the loading thread and `/health`.
#[derive(Debug, Default)]
pub struct ProgressState {
    pct: AtomicU32,
    hits: AtomicU32,
}

impl ProgressState {
    pub fn record(&self, fraction: f32) {
        let pct = (fraction.clamp(0.0, 1.0) * 100.0) as u32;
        self.pct.store(pct, Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pct(&self) -> u32 {
        self.pct.load(Ordering::Relaxed)
    }

    pub fn hits(&self) -> u32 {
        self.hits.load(Ordering::Relaxed)
    }
}

pub type SharedProgress = Arc<ProgressState>;

/// A loaded model able to stream token pieces.
///
/// `emit` receives each visible piece; returning `false` stops the loop
/// cooperatively. One generation runs at a time; the caller serializes.
pub trait TokenEngine: Send {
    fn model_ident(&self) -> String;

    fn n_ctx(&self) -> u32;

    fn count_tokens(&self, text: &str) -> usize;

    fn generate(
        &mut self,
        spec: &GenerateSpec,
        emit: &mut dyn FnMut(&str) -> bool,
    ) -> Result<FinishReason, EngineError>;

    /// Engine-level timings of the last generation, when the build exposes them.
    fn last_timings(&self) -> Option<EngineTimings>;
}
