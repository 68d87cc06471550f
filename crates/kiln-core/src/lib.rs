//! kiln-core — the model-worker supervisor and streaming core.
//!
//! This crate owns everything between the HTTP gateway and the model worker
//! subprocesses:
//!
//! * [`settings`] — layered configuration (defaults ⊕ adaptive ⊕ overrides)
//!   with typed per-subsystem views.
//! * [`system`] — GPU probe and the background-refreshed system snapshot.
//! * [`guardrail`] — the deterministic VRAM launch planner.
//! * [`supervisor`] — spawn / readiness / dedup / kill-on-spawn / pending-VRAM
//!   accounting for worker subprocesses.
//! * [`bridge`] — the streaming generation pipeline (producer thread →
//!   bounded queue → async consumer) with the RUNJSON telemetry trailer.
//! * [`cancel`] — cooperative per-session cancel flags and the shared
//!   generation semaphore.
//! * [`chat`] — on-disk chat sessions, index, and queued session ops.
//! * [`packing`] — context-window packing, summary roll-up, output budget.
//! * [`retitle`] — the coalesced background retitle queue.
//! * [`runjson`] — trailer sentinels, construction, and stream splitting.

mod fsjson;

pub mod bridge;
pub mod cancel;
pub mod chat;
pub mod error;
pub mod guardrail;
pub mod packing;
pub mod retitle;
pub mod runjson;
pub mod settings;
pub mod supervisor;
pub mod system;

pub use error::CoreError;
