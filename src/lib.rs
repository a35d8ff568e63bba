//! # fastllm-server
//!
//! OpenAI-compatible HTTP inference gateway for the fastllm engine.
//!
//! The gateway accepts chat-completion, text-completion, embedding,
//! rerank, tokenize, and observability requests; drives the engine
//! through a bounded concurrent request pool; streams tokens back as
//! Server-Sent Events with correct UTF-8 framing; and performs structured
//! extraction of reasoning content and tool calls from the model's token
//! stream.
//!
//! ## Endpoints
//!
//! - `GET /health`, `/v1/health` - health check
//! - `GET /version` - server version
//! - `GET /v1/models` - model list
//! - `POST /v1/chat/completions` - chat completion (SSE when `stream`)
//! - `POST /v1/completions` - text completion
//! - `POST /v1/embeddings` - sentence embeddings
//! - `POST /v1/rerank` - document reranking
//! - `POST /generate` - native generation
//! - `POST /tokenize`, `/detokenize` - tokenizer access
//! - `GET /slots`, `/props`, `/metrics` - observability
//! - `POST /v1/cancel`, `GET /v1/active_conversations` - dev mode only
//!
//! ## Example
//!
//! ```rust,no_run
//! use fastllm_server::api::{create_router, AppState};
//!
//! # async fn serve() -> fastllm_server::Result<()> {
//! let state = AppState::demo();
//! let app = create_router(state);
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080")
//!     .await
//!     .map_err(|e| fastllm_server::ServerError::Startup(e.to_string()))?;
//! axum::serve(listener, app)
//!     .await
//!     .map_err(|e| fastllm_server::ServerError::Startup(e.to_string()))?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Sampling parameters narrow from JSON f64 to the engine's f32.
#![allow(clippy::cast_possible_truncation)]

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod peg;
pub mod pool;
pub mod sse;
pub mod stats;
pub mod template;
pub mod toolcall;
pub mod utf8;

// Re-exports for convenience
pub use error::{Result, ServerError};

/// Server version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(VERSION.contains('.'));
        assert!(!VERSION.is_empty());
    }
}
