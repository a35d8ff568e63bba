//! Engine adapter
//!
//! Thin contract over the external token-generation engine. The gateway
//! never does tokenization math, sampling, or KV-cache management itself;
//! it drives any engine through [`InferenceEngine`]: launch a generation,
//! fetch tokens until the terminal sentinel, abort on early exit.
//!
//! `fetch_next` blocks until the engine produces the next token, so
//! callers run the fetch loop on a blocking thread feeding an async
//! channel. `decode` returns raw bytes: a single token's text can end in
//! the middle of a UTF-8 sequence, and [`crate::utf8::Utf8Buffer`] owns
//! reassembly.
//!
//! The in-process [`DemoEngine`] is a deterministic byte-level engine
//! used by the test suite and for local development without a model.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};

/// Opaque generation handle issued by [`InferenceEngine::launch`]
pub type HandleId = u64;

/// One step of the token stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFetch {
    /// Next generated token
    Token(u32),
    /// Generation finished (or the handle was aborted/unknown)
    Terminal,
}

/// Generation settings handed to the engine at launch
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    /// Maximum number of tokens to generate
    pub output_token_limit: usize,
    /// Sampling temperature
    pub temperature: f32,
    /// Nucleus sampling threshold
    pub top_p: f32,
    /// Top-k cutoff
    pub top_k: u32,
    /// Repetition penalty factor
    pub repeat_penalty: f32,
    /// Window of recent tokens the penalty applies to
    pub last_n: usize,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            output_token_limit: 256,
            temperature: 1.0,
            top_p: 1.0,
            top_k: 1,
            repeat_penalty: 1.0,
            last_n: 64,
        }
    }
}

/// Read-only snapshot of the engine's prefix cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KvCacheInfo {
    /// Number of cached prefixes
    pub entries: usize,
    /// Configured cap
    pub max_entries: usize,
}

/// Contract the gateway consumes from the generation engine
pub trait InferenceEngine: Send + Sync {
    /// Tokenize text (synchronous, deterministic)
    fn encode(&self, text: &str) -> Vec<u32>;

    /// Tokenize text, optionally adding the model's special tokens.
    ///
    /// Engines whose tokenizer has no special-token handling fall back
    /// to [`InferenceEngine::encode`].
    fn encode_special(&self, text: &str, add_special: bool) -> Vec<u32> {
        let _ = add_special;
        self.encode(text)
    }

    /// Detokenize token IDs to raw bytes; may end mid-UTF-8-sequence
    fn decode(&self, tokens: &[u32]) -> Vec<u8>;

    /// The model's Jinja chat template source, when it ships one
    fn chat_template(&self) -> Option<String> {
        None
    }

    /// Beginning-of-sequence token text
    fn bos_token(&self) -> String {
        String::new()
    }

    /// End-of-sequence token text
    fn eos_token(&self) -> String {
        String::new()
    }

    /// Context window, when the engine exposes one
    fn context_limit(&self) -> Option<usize> {
        None
    }

    /// Start a generation; non-blocking
    fn launch(&self, tokens: Vec<u32>, params: GenerationParams) -> Result<HandleId>;

    /// Block until the next token or the terminal sentinel.
    ///
    /// Fetching from a finished or aborted handle returns `Terminal`.
    fn fetch_next(&self, handle: HandleId) -> TokenFetch;

    /// Release a handle; idempotent
    fn abort(&self, handle: HandleId);

    /// Snapshot of the engine's KV cache
    fn kv_cache_info(&self) -> KvCacheInfo;
}

/// Contract for the optional embedding model behind `/v1/embeddings` and
/// `/v1/rerank`
pub trait EmbeddingEngine: Send + Sync {
    /// Token count of `text` for usage reporting
    fn token_count(&self, text: &str) -> usize;

    /// Sentence embedding, L2-normalized
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

// ============================================================================
// Demo engine
// ============================================================================

/// Token IDs at and above this value index into the scripted reply table;
/// IDs below are literal bytes.
const REPLY_TOKEN_BASE: u32 = 0x10000;

#[derive(Debug)]
struct DemoHandle {
    pending: Vec<u32>,
    cursor: usize,
    done: bool,
}

/// Deterministic in-process engine with a byte-level tokenizer.
///
/// `encode` maps text to its UTF-8 bytes, `decode` maps byte tokens back,
/// so `detokenize(tokenize(s)) == s` for any string. Generated tokens are
/// drawn from a scripted reply, one token per script chunk, which lets
/// tests drive exact byte sequences (including split UTF-8 and tool-call
/// markers) through the streaming pipeline.
pub struct DemoEngine {
    reply_chunks: Vec<Vec<u8>>,
    template: Option<String>,
    handles: Mutex<HashMap<HandleId, DemoHandle>>,
    next_handle: AtomicU64,
    max_cache_entries: usize,
}

impl std::fmt::Debug for DemoEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DemoEngine")
            .field("reply_chunks", &self.reply_chunks.len())
            .finish_non_exhaustive()
    }
}

impl Default for DemoEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoEngine {
    /// Engine with the default greeting reply
    #[must_use]
    pub fn new() -> Self {
        Self::with_reply("Hello! This is the fastllm demo engine.")
    }

    /// Engine that generates `reply` one byte-token at a time
    #[must_use]
    pub fn with_reply(reply: &str) -> Self {
        let chunks = reply.bytes().map(|b| vec![b]).collect();
        Self::with_reply_chunks(chunks)
    }

    /// Engine that generates one token per scripted byte chunk
    #[must_use]
    pub fn with_reply_chunks(reply_chunks: Vec<Vec<u8>>) -> Self {
        Self {
            reply_chunks,
            template: None,
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            max_cache_entries: 16,
        }
    }

    /// Attach a Jinja chat template to the demo model
    #[must_use]
    pub fn with_chat_template(mut self, source: &str) -> Self {
        self.template = Some(source.to_string());
        self
    }
}

impl InferenceEngine for DemoEngine {
    fn encode(&self, text: &str) -> Vec<u32> {
        text.bytes().map(u32::from).collect()
    }

    fn decode(&self, tokens: &[u32]) -> Vec<u8> {
        let mut out = Vec::new();
        for &token in tokens {
            if token < 256 {
                out.push(token as u8);
            } else if token >= REPLY_TOKEN_BASE {
                if let Some(chunk) = self.reply_chunks.get((token - REPLY_TOKEN_BASE) as usize) {
                    out.extend_from_slice(chunk);
                }
            }
            // IDs between the byte range and the reply table are unmapped.
        }
        out
    }

    fn chat_template(&self) -> Option<String> {
        self.template.clone()
    }

    fn context_limit(&self) -> Option<usize> {
        Some(4096)
    }

    fn launch(&self, _tokens: Vec<u32>, params: GenerationParams) -> Result<HandleId> {
        let count = self.reply_chunks.len().min(params.output_token_limit);
        let pending: Vec<u32> = (0..count)
            .map(|i| REPLY_TOKEN_BASE + i as u32)
            .collect();
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let mut handles = self
            .handles
            .lock()
            .map_err(|_| ServerError::Engine("handle table poisoned".to_string()))?;
        handles.insert(
            id,
            DemoHandle {
                pending,
                cursor: 0,
                done: false,
            },
        );
        Ok(id)
    }

    fn fetch_next(&self, handle: HandleId) -> TokenFetch {
        let Ok(mut handles) = self.handles.lock() else {
            return TokenFetch::Terminal;
        };
        let Some(state) = handles.get_mut(&handle) else {
            return TokenFetch::Terminal;
        };
        if state.done || state.cursor >= state.pending.len() {
            state.done = true;
            return TokenFetch::Terminal;
        }
        let token = state.pending[state.cursor];
        state.cursor += 1;
        TokenFetch::Token(token)
    }

    fn abort(&self, handle: HandleId) {
        if let Ok(mut handles) = self.handles.lock() {
            if let Some(state) = handles.get_mut(&handle) {
                state.done = true;
            }
        }
    }

    fn kv_cache_info(&self) -> KvCacheInfo {
        let entries = self.handles.lock().map(|h| h.len()).unwrap_or(0);
        KvCacheInfo {
            entries,
            max_entries: self.max_cache_entries,
        }
    }
}

// ============================================================================
// Demo embedding engine
// ============================================================================

/// Deterministic hashed n-gram embedding model.
///
/// Identical texts map to identical unit vectors (cosine similarity 1.0),
/// different texts to different directions, which is all the rerank and
/// embedding endpoints need from a development model.
#[derive(Debug, Default)]
pub struct DemoEmbeddingEngine;

const EMBEDDING_DIM: usize = 64;

impl EmbeddingEngine for DemoEmbeddingEngine {
    fn token_count(&self, text: &str) -> usize {
        text.split_whitespace().count().max(usize::from(!text.is_empty()))
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vec = vec![0.0f32; EMBEDDING_DIM];
        let bytes = text.as_bytes();
        for n in 1..=3 {
            if bytes.len() < n {
                break;
            }
            for window in bytes.windows(n) {
                let mut hash: u64 = 1_469_598_103_934_665_603;
                for &b in window {
                    hash ^= u64::from(b);
                    hash = hash.wrapping_mul(1_099_511_628_211);
                }
                let bucket = (hash % EMBEDDING_DIM as u64) as usize;
                let sign = if hash & (1 << 63) == 0 { 1.0 } else { -1.0 };
                vec[bucket] += sign;
            }
        }
        let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vec {
                *v /= norm;
            }
        }
        Ok(vec)
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Load the generation engine for the configured model path.
///
/// The native fastllm engine and its model loader are external
/// collaborators behind the [`InferenceEngine`] seam; this build wires the
/// deterministic demo engine once the model path exists.
pub fn load_engine(config: &ServerConfig) -> Result<Arc<dyn InferenceEngine>> {
    if !Path::new(&config.path).exists() {
        return Err(ServerError::Startup(format!(
            "model file {} does not exist",
            config.path
        )));
    }
    tracing::info!(path = %config.path, model = %config.model_name, "model loaded");
    Ok(Arc::new(DemoEngine::new()))
}

/// Load the optional embedding model
pub fn load_embedding_engine(path: &str) -> Result<Arc<dyn EmbeddingEngine>> {
    if !Path::new(path).exists() {
        return Err(ServerError::Startup(format!(
            "embedding model file {path} does not exist"
        )));
    }
    tracing::info!(path = %path, "embedding model loaded");
    Ok(Arc::new(DemoEmbeddingEngine))
}
