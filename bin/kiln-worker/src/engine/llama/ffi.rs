//! Minimal raw bindings to the llama.cpp C API, resolved at runtime with
//! `libloading`. Only the symbols the worker actually drives are bound; the
//! struct layouts mirror `llama.h` and must track the pinned runtime build.

#![allow(non_camel_case_types)]

use std::os::raw::{c_char, c_int, c_void};
use std::path::Path;

use libloading::Library;

pub type llama_token = i32;
pub type llama_pos = i32;
pub type llama_seq_id = i32;

#[repr(C)]
pub struct llama_model {
    _private: [u8; 0],
}

#[repr(C)]
pub struct llama_context {
    _private: [u8; 0],
}

#[repr(C)]
pub struct llama_vocab {
    _private: [u8; 0],
}

#[repr(C)]
pub struct llama_sampler {
    _private: [u8; 0],
}

/// Return `false` to abort the model load.
pub type llama_progress_callback =
    unsafe extern "C" fn(progress: f32, user_data: *mut c_void) -> bool;

#[repr(C)]
pub struct llama_model_params {
    pub devices: *mut c_void,
    pub tensor_buft_overrides: *const c_void,
    pub n_gpu_layers: c_int,
    pub split_mode: c_int,
    pub main_gpu: c_int,
    pub tensor_split: *const f32,
    pub progress_callback: Option<llama_progress_callback>,
    pub progress_callback_user_data: *mut c_void,
    pub kv_overrides: *const c_void,
    pub vocab_only: bool,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub check_tensors: bool,
}

#[repr(C)]
pub struct llama_context_params {
    pub n_ctx: u32,
    pub n_batch: u32,
    pub n_ubatch: u32,
    pub n_seq_max: u32,
    pub n_threads: c_int,
    pub n_threads_batch: c_int,
    pub rope_scaling_type: c_int,
    pub pooling_type: c_int,
    pub attention_type: c_int,
    pub rope_freq_base: f32,
    pub rope_freq_scale: f32,
    pub yarn_ext_factor: f32,
    pub yarn_attn_factor: f32,
    pub yarn_beta_fast: f32,
    pub yarn_beta_slow: f32,
    pub yarn_orig_ctx: u32,
    pub defrag_thold: f32,
    pub cb_eval: *mut c_void,
    pub cb_eval_user_data: *mut c_void,
    pub type_k: c_int,
    pub type_v: c_int,
    pub logits_all: bool,
    pub embeddings: bool,
    pub offload_kqv: bool,
    pub flash_attn: bool,
    pub no_perf: bool,
    pub abort_callback: *mut c_void,
    pub abort_callback_data: *mut c_void,
}

#[repr(C)]
pub struct llama_batch {
    pub n_tokens: i32,
    pub token: *mut llama_token,
    pub embd: *mut f32,
    pub pos: *mut llama_pos,
    pub n_seq_id: *mut i32,
    pub seq_id: *mut *mut llama_seq_id,
    pub logits: *mut i8,
}

#[repr(C)]
pub struct llama_sampler_chain_params {
    pub no_perf: bool,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct llama_perf_context_data {
    pub t_start_ms: f64,
    pub t_load_ms: f64,
    pub t_p_eval_ms: f64,
    pub t_eval_ms: f64,
    pub n_p_eval: i32,
    pub n_eval: i32,
    pub n_reused: i32,
}

macro_rules! bind {
    ($lib:expr, $name:literal) => {{
        let sym = unsafe { $lib.get($name) }.map_err(|e| e.to_string())?;
        *sym
    }};
}

/// Resolved function table. The library handle lives alongside the raw
/// pointers so they stay valid for the table's lifetime.
pub struct LlamaApi {
    _lib: Library,

    pub backend_init: unsafe extern "C" fn(),
    pub backend_free: unsafe extern "C" fn(),

    pub model_default_params: unsafe extern "C" fn() -> llama_model_params,
    pub model_load_from_file:
        unsafe extern "C" fn(*const c_char, llama_model_params) -> *mut llama_model,
    pub model_free: unsafe extern "C" fn(*mut llama_model),
    pub model_get_vocab: unsafe extern "C" fn(*const llama_model) -> *const llama_vocab,

    pub context_default_params: unsafe extern "C" fn() -> llama_context_params,
    pub init_from_model:
        unsafe extern "C" fn(*mut llama_model, llama_context_params) -> *mut llama_context,
    pub free: unsafe extern "C" fn(*mut llama_context),
    pub n_ctx: unsafe extern "C" fn(*const llama_context) -> u32,

    pub tokenize: unsafe extern "C" fn(
        *const llama_vocab,
        *const c_char,
        i32,
        *mut llama_token,
        i32,
        bool,
        bool,
    ) -> i32,
    pub token_to_piece:
        unsafe extern "C" fn(*const llama_vocab, llama_token, *mut c_char, i32, i32, bool) -> i32,
    pub vocab_is_eog: unsafe extern "C" fn(*const llama_vocab, llama_token) -> bool,

    pub batch_get_one: unsafe extern "C" fn(*mut llama_token, i32) -> llama_batch,
    pub decode: unsafe extern "C" fn(*mut llama_context, llama_batch) -> i32,

    pub sampler_chain_default_params: unsafe extern "C" fn() -> llama_sampler_chain_params,
    pub sampler_chain_init:
        unsafe extern "C" fn(llama_sampler_chain_params) -> *mut llama_sampler,
    pub sampler_chain_add: unsafe extern "C" fn(*mut llama_sampler, *mut llama_sampler),
    pub sampler_init_top_p: unsafe extern "C" fn(f32, usize) -> *mut llama_sampler,
    pub sampler_init_temp: unsafe extern "C" fn(f32) -> *mut llama_sampler,
    pub sampler_init_dist: unsafe extern "C" fn(u32) -> *mut llama_sampler,
    pub sampler_sample:
        unsafe extern "C" fn(*mut llama_sampler, *mut llama_context, i32) -> llama_token,
    pub sampler_accept: unsafe extern "C" fn(*mut llama_sampler, llama_token),
    pub sampler_free: unsafe extern "C" fn(*mut llama_sampler),

    pub perf_context: unsafe extern "C" fn(*const llama_context) -> llama_perf_context_data,
}

impl LlamaApi {
    /// Open the shared library and resolve every bound symbol up front, so a
    /// missing symbol fails the load instead of a later call.
    pub fn load(path: &Path) -> Result<Self, String> {
        let lib = unsafe { Library::new(path) }.map_err(|e| e.to_string())?;
        Ok(Self {
            backend_init: bind!(lib, b"llama_backend_init"),
            backend_free: bind!(lib, b"llama_backend_free"),
            model_default_params: bind!(lib, b"llama_model_default_params"),
            model_load_from_file: bind!(lib, b"llama_model_load_from_file"),
            model_free: bind!(lib, b"llama_model_free"),
            model_get_vocab: bind!(lib, b"llama_model_get_vocab"),
            context_default_params: bind!(lib, b"llama_context_default_params"),
            init_from_model: bind!(lib, b"llama_init_from_model"),
            free: bind!(lib, b"llama_free"),
            n_ctx: bind!(lib, b"llama_n_ctx"),
            tokenize: bind!(lib, b"llama_tokenize"),
            token_to_piece: bind!(lib, b"llama_token_to_piece"),
            vocab_is_eog: bind!(lib, b"llama_vocab_is_eog"),
            batch_get_one: bind!(lib, b"llama_batch_get_one"),
            decode: bind!(lib, b"llama_decode"),
            sampler_chain_default_params: bind!(lib, b"llama_sampler_chain_default_params"),
            sampler_chain_init: bind!(lib, b"llama_sampler_chain_init"),
            sampler_chain_add: bind!(lib, b"llama_sampler_chain_add"),
            sampler_init_top_p: bind!(lib, b"llama_sampler_init_top_p"),
            sampler_init_temp: bind!(lib, b"llama_sampler_init_temp"),
            sampler_init_dist: bind!(lib, b"llama_sampler_init_dist"),
            sampler_sample: bind!(lib, b"llama_sampler_sample"),
            sampler_accept: bind!(lib, b"llama_sampler_accept"),
            sampler_free: bind!(lib, b"llama_sampler_free"),
            perf_context: bind!(lib, b"llama_perf_context"),
            _lib: lib,
        })
    }
}
