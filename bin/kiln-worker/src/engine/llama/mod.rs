//! Dynamic-library llama.cpp engine.
//!
//! Safety model: the engine owns exactly one model and one context, both
//! created and destroyed here; raw pointers never escape this module. One
//! generation runs at a time because the worker serializes access behind a
//! mutex.

mod ffi;

use std::ffi::CString;
use std::os::raw::c_void;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_core::guardrail::LlamaKwargs;
use kiln_core::runjson::EngineTimings;
use tracing::info;

use super::{EngineError, FinishReason, GenerateSpec, SharedProgress, TokenEngine};

/// Default library name per platform, overridable via `LLAMA_LIB`.
pub fn default_library_name() -> &'static str {
    if cfg!(target_os = "macos") {
        "libllama.dylib"
    } else if cfg!(target_os = "windows") {
        "llama.dll"
    } else {
        "libllama.so"
    }
}

unsafe extern "C" fn progress_trampoline(progress: f32, user_data: *mut c_void) -> bool {
    if !user_data.is_null() {
        let state = &*(user_data as *const super::ProgressState);
        state.record(progress);
    }
    // Never abort the load from the callback; kills go through signals.
    true
}

pub struct LlamaEngine {
    api: ffi::LlamaApi,
    model: *mut ffi::llama_model,
    vocab: *const ffi::llama_vocab,
    ctx: *mut ffi::llama_context,
    n_ctx: u32,
    n_batch: u32,
    ident: String,
    last_perf: Option<ffi::llama_perf_context_data>,
    // Keeps the progress state alive for the duration of the model load.
    _progress: SharedProgress,
}

// Raw pointers are confined to this module and the engine is used behind a
// mutex; the underlying llama structures are not thread-affine.
unsafe impl Send for LlamaEngine {}

impl LlamaEngine {
    /// Load the runtime library and the model described by `kwargs`.
    pub fn load(
        lib_path: Option<PathBuf>,
        kwargs: &LlamaKwargs,
        progress: SharedProgress,
    ) -> Result<Self, EngineError> {
        let lib_path = lib_path.unwrap_or_else(|| PathBuf::from(default_library_name()));
        let api = ffi::LlamaApi::load(&lib_path).map_err(|message| EngineError::LibraryLoad {
            path: lib_path.display().to_string(),
            message,
        })?;

        unsafe { (api.backend_init)() };

        let mut mparams = unsafe { (api.model_default_params)() };
        mparams.n_gpu_layers = kwargs.n_gpu_layers.unwrap_or(0) as i32;
        if let Some(device) = kwargs.main_gpu {
            mparams.main_gpu = device as i32;
        }
        mparams.progress_callback = Some(progress_trampoline);
        mparams.progress_callback_user_data =
            Arc::as_ptr(&progress) as *mut super::ProgressState as *mut c_void;
        let n_gpu_layers = mparams.n_gpu_layers;

        let c_path = CString::new(kwargs.model_path.as_str())
            .map_err(|_| EngineError::ModelLoad {
                path: kwargs.model_path.clone(),
            })?;
        let model = unsafe { (api.model_load_from_file)(c_path.as_ptr(), mparams) };
        if model.is_null() {
            return Err(EngineError::ModelLoad {
                path: kwargs.model_path.clone(),
            });
        }
        let vocab = unsafe { (api.model_get_vocab)(model) };

        let mut cparams = unsafe { (api.context_default_params)() };
        cparams.n_ctx = kwargs.n_ctx;
        cparams.n_batch = kwargs.n_batch;
        if let Some(t) = kwargs.n_threads {
            cparams.n_threads = t as i32;
            cparams.n_threads_batch = t as i32;
        }
        if let Some(base) = kwargs.rope_freq_base {
            cparams.rope_freq_base = base as f32;
        }
        if let Some(scale) = kwargs.rope_freq_scale {
            cparams.rope_freq_scale = scale as f32;
        }
        // The library knows this knob as offload_kqv.
        cparams.offload_kqv = kwargs.kv_offload;

        let ctx = unsafe { (api.init_from_model)(model, cparams) };
        if ctx.is_null() {
            unsafe { (api.model_free)(model) };
            return Err(EngineError::ContextCreate);
        }

        let n_ctx = unsafe { (api.n_ctx)(ctx) };
        let ident = Path::new(&kwargs.model_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "local-gguf".into());

        info!(model = %ident, n_ctx, n_gpu_layers, "llama engine ready");

        Ok(Self {
            api,
            model,
            vocab,
            ctx,
            n_ctx,
            n_batch: kwargs.n_batch.max(1),
            ident,
            last_perf: None,
            _progress: progress,
        })
    }

    fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<ffi::llama_token>, EngineError> {
        let bytes = text.as_bytes();
        let guess = bytes.len() + 16;
        let mut tokens = vec![0 as ffi::llama_token; guess];
        let n = unsafe {
            (self.api.tokenize)(
                self.vocab,
                bytes.as_ptr() as *const _,
                bytes.len() as i32,
                tokens.as_mut_ptr(),
                tokens.len() as i32,
                add_special,
                true,
            )
        };
        let n = if n < 0 {
            // Buffer was too small; -n is the required size.
            let needed = (-n) as usize;
            tokens.resize(needed, 0);
            let again = unsafe {
                (self.api.tokenize)(
                    self.vocab,
                    bytes.as_ptr() as *const _,
                    bytes.len() as i32,
                    tokens.as_mut_ptr(),
                    tokens.len() as i32,
                    add_special,
                    true,
                )
            };
            if again < 0 {
                return Err(EngineError::Tokenize);
            }
            again
        } else {
            n
        };
        tokens.truncate(n as usize);
        Ok(tokens)
    }

    fn piece_of(&self, token: ffi::llama_token) -> String {
        let mut buf = vec![0u8; 256];
        let n = unsafe {
            (self.api.token_to_piece)(
                self.vocab,
                token,
                buf.as_mut_ptr() as *mut _,
                buf.len() as i32,
                0,
                true,
            )
        };
        if n <= 0 {
            return String::new();
        }
        buf.truncate(n as usize);
        String::from_utf8_lossy(&buf).into_owned()
    }

    fn decode_tokens(&mut self, tokens: &mut [ffi::llama_token]) -> Result<(), EngineError> {
        for chunk in tokens.chunks_mut(self.n_batch as usize) {
            let batch = unsafe { (self.api.batch_get_one)(chunk.as_mut_ptr(), chunk.len() as i32) };
            let status = unsafe { (self.api.decode)(self.ctx, batch) };
            if status != 0 {
                return Err(EngineError::Decode(status));
            }
        }
        Ok(())
    }
}

impl TokenEngine for LlamaEngine {
    fn model_ident(&self) -> String {
        self.ident.clone()
    }

    fn n_ctx(&self) -> u32 {
        self.n_ctx
    }

    fn count_tokens(&self, text: &str) -> usize {
        self.tokenize(text, false).map(|t| t.len()).unwrap_or(0)
    }

    fn generate(
        &mut self,
        spec: &GenerateSpec,
        emit: &mut dyn FnMut(&str) -> bool,
    ) -> Result<FinishReason, EngineError> {
        let mut prompt_tokens = self.tokenize(&spec.prompt, true)?;
        let prompt_len = prompt_tokens.len();
        if prompt_len as u32 >= self.n_ctx {
            return Err(EngineError::ContextExceeded {
                prompt_tokens: prompt_len,
                n_ctx: self.n_ctx,
            });
        }

        // Sampler chain: top-p → temperature → final distribution draw.
        let chain = unsafe {
            let params = (self.api.sampler_chain_default_params)();
            let chain = (self.api.sampler_chain_init)(params);
            (self.api.sampler_chain_add)(chain, (self.api.sampler_init_top_p)(spec.top_p, 1));
            (self.api.sampler_chain_add)(chain, (self.api.sampler_init_temp)(spec.temperature));
            (self.api.sampler_chain_add)(chain, (self.api.sampler_init_dist)(0xFFFF_FFFF));
            chain
        };

        let result = self.generate_inner(spec, prompt_tokens.as_mut_slice(), chain, emit);

        unsafe {
            self.last_perf = Some((self.api.perf_context)(self.ctx));
            (self.api.sampler_free)(chain);
        }
        result
    }

    fn last_timings(&self) -> Option<EngineTimings> {
        let perf = self.last_perf?;
        Some(EngineTimings {
            load_sec: Some(perf.t_load_ms / 1000.0),
            prompt_sec: Some(perf.t_p_eval_ms / 1000.0),
            eval_sec: Some(perf.t_eval_ms / 1000.0),
            prompt_n: Some(perf.n_p_eval.max(0) as u64),
            eval_n: Some(perf.n_eval.max(0) as u64),
        })
    }
}

impl LlamaEngine {
    fn generate_inner(
        &mut self,
        spec: &GenerateSpec,
        prompt_tokens: &mut [ffi::llama_token],
        chain: *mut ffi::llama_sampler,
        emit: &mut dyn FnMut(&str) -> bool,
    ) -> Result<FinishReason, EngineError> {
        self.decode_tokens(prompt_tokens)?;

        // Pieces are held back long enough to recognize stop strings that
        // span piece boundaries.
        let max_stop = spec.stop.iter().map(String::len).max().unwrap_or(0);
        let mut tail = String::new();

        let mut generated = 0u32;
        while generated < spec.max_tokens {
            let token = unsafe { (self.api.sampler_sample)(chain, self.ctx, -1) };
            unsafe { (self.api.sampler_accept)(chain, token) };

            if unsafe { (self.api.vocab_is_eog)(self.vocab, token) } {
                if !tail.is_empty() && !emit(&tail) {
                    return Ok(FinishReason::Cancelled);
                }
                return Ok(FinishReason::Eos);
            }

            let piece = self.piece_of(token);
            tail.push_str(&piece);
            if spec.stop.iter().any(|s| !s.is_empty() && tail.contains(s)) {
                // Emit only the text before the stop string.
                let cut = spec
                    .stop
                    .iter()
                    .filter(|s| !s.is_empty())
                    .filter_map(|s| tail.find(s.as_str()))
                    .min()
                    .unwrap_or(0);
                if cut > 0 && !emit(&tail[..cut]) {
                    return Ok(FinishReason::Cancelled);
                }
                return Ok(FinishReason::StopString);
            }

            // Flush everything that can no longer be part of a stop string.
            if max_stop == 0 || tail.len() > max_stop {
                let flush_to = tail.len() - max_stop.min(tail.len());
                let mut cut = flush_to;
                while cut > 0 && !tail.is_char_boundary(cut) {
                    cut -= 1;
                }
                if cut > 0 {
                    let out: String = tail.drain(..cut).collect();
                    if !emit(&out) {
                        return Ok(FinishReason::Cancelled);
                    }
                }
            }

            let mut next = [token];
            self.decode_tokens(&mut next)?;
            generated += 1;
        }

        if !tail.is_empty() && !emit(&tail) {
            return Ok(FinishReason::Cancelled);
        }
        Ok(FinishReason::Length)
    }
}

impl Drop for LlamaEngine {
    fn drop(&mut self) {
        unsafe {
            (self.api.free)(self.ctx);
            (self.api.model_free)(self.model);
            (self.api.backend_free)();
        }
    }
}
