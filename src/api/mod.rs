//! HTTP API for the inference gateway
//!
//! Routing, auth, the response envelope, and the non-generation
//! endpoints. Generation endpoints (chat, completions, embeddings,
//! rerank) live in [`openai`]; wire types in [`protocol`].
//!
//! Every response carries `server: fastllm api server` and permissive
//! CORS headers. When an API key is configured, all routes except
//! `/health`, `/v1/health`, and `/version` require
//! `Authorization: Bearer <key>`.

pub mod openai;
pub mod protocol;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    body::Bytes,
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, MethodRouter},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::config::ServerConfig;
use crate::engine::{DemoEmbeddingEngine, DemoEngine, EmbeddingEngine, InferenceEngine};
use crate::error::ServerError;
use crate::metrics::render_prometheus;
use crate::pool::RequestPool;
use crate::template::ChatHandler;
use crate::VERSION;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Generation engine
    pub engine: Arc<dyn InferenceEngine>,
    /// Optional embedding model for /v1/embeddings and /v1/rerank
    pub embedding: Option<Arc<dyn EmbeddingEngine>>,
    /// Chat template renderer for the loaded model
    pub chat: Arc<ChatHandler>,
    /// Admission pool for generation requests
    pub pool: Arc<RequestPool>,
    /// Immutable process configuration
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Build state around a loaded engine
    #[must_use]
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        embedding: Option<Arc<dyn EmbeddingEngine>>,
        config: ServerConfig,
    ) -> Self {
        let template = engine.chat_template();
        let chat = ChatHandler::new(
            template.as_deref(),
            &engine.bos_token(),
            &engine.eos_token(),
        );
        let pool = RequestPool::new(config.max_active);
        Self {
            engine,
            embedding,
            chat: Arc::new(chat),
            pool,
            config: Arc::new(config),
        }
    }

    /// State backed by the demo engine and embedding model, for tests and
    /// local development
    #[must_use]
    pub fn demo() -> Self {
        Self::new(
            Arc::new(DemoEngine::new()),
            Some(Arc::new(DemoEmbeddingEngine)),
            ServerConfig::demo(),
        )
    }

    /// Demo state around a specific engine (scripted replies in tests)
    #[must_use]
    pub fn demo_with_engine(engine: Arc<dyn InferenceEngine>) -> Self {
        Self::new(engine, Some(Arc::new(DemoEmbeddingEngine)), ServerConfig::demo())
    }

    /// Demo state with a custom configuration
    #[must_use]
    pub fn demo_with_config(config: ServerConfig) -> Self {
        Self::new(
            Arc::new(DemoEngine::new()),
            Some(Arc::new(DemoEmbeddingEngine)),
            config,
        )
    }
}

// ============================================================================
// Errors on the wire
// ============================================================================

/// OpenAI-shaped error body: `{"error": {message, type, param, code}}`
#[must_use]
pub fn openai_error_body(err: &ServerError) -> Value {
    json!({
        "error": {
            "message": err.to_string(),
            "type": err.error_type(),
            "param": err.param(),
            "code": err.code(),
        }
    })
}

/// Response-side wrapper turning [`ServerError`] into its wire surface
#[derive(Debug)]
pub struct ApiError(
    /// Underlying error kind
    pub ServerError,
);

impl From<ServerError> for ApiError {
    fn from(err: ServerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(openai_error_body(&self.0))).into_response()
    }
}

/// Parse a JSON request body, surfacing malformed JSON as a 400 in
/// OpenAI error shape
pub fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| {
        ApiError(ServerError::bad_request(format!("invalid JSON body: {e}")))
    })
}

/// Seconds since the Unix epoch
#[must_use]
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ============================================================================
// Router
// ============================================================================

/// Register `path` with and without a trailing slash
fn route_pair(router: Router<AppState>, path: &str, handler: MethodRouter<AppState>) -> Router<AppState> {
    let with_slash = format!("{path}/");
    router.route(path, handler.clone()).route(&with_slash, handler)
}

/// Build the full API router around `state`
#[must_use]
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new();
    router = route_pair(router, "/health", get(health_handler));
    router = route_pair(router, "/v1/health", get(health_handler));
    router = route_pair(router, "/version", get(version_handler));
    router = route_pair(router, "/v1/models", get(models_handler));
    router = route_pair(router, "/v1/chat/completions", post(openai::chat_completions_handler));
    router = route_pair(router, "/v1/completions", post(openai::completions_handler));
    router = route_pair(router, "/v1/embeddings", post(openai::embeddings_handler));
    router = route_pair(router, "/v1/rerank", post(openai::rerank_handler));
    router = route_pair(router, "/generate", post(openai::generate_handler));
    router = route_pair(router, "/tokenize", post(tokenize_handler));
    router = route_pair(router, "/detokenize", post(detokenize_handler));
    router = route_pair(router, "/slots", get(slots_handler));
    router = route_pair(router, "/props", get(props_handler));
    router = route_pair(router, "/metrics", get(metrics_handler));
    router = route_pair(router, "/v1/cancel", post(cancel_handler));
    router = route_pair(router, "/v1/active_conversations", get(active_conversations_handler));

    router
        .fallback(|| async { StatusCode::NOT_FOUND })
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .layer(middleware::from_fn(envelope_headers))
        .with_state(state)
}

/// Stamp the fastllm identity and CORS headers on every response
async fn envelope_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(header::SERVER, HeaderValue::from_static("fastllm api server"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

/// Routes reachable without an API key
fn auth_exempt(path: &str) -> bool {
    matches!(
        path.trim_end_matches('/'),
        "/health" | "/v1/health" | "/version" | ""
    )
}

/// Bearer-token gate, active when an API key is configured
async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = &state.config.api_key {
        if !auth_exempt(request.uri().path()) {
            let provided = request
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(str::trim_start)
                .and_then(|auth| auth.strip_prefix("Bearer "));
            if provided != Some(expected.as_str()) {
                return ApiError(ServerError::InvalidApiKey).into_response();
            }
        }
    }
    next.run(request).await
}

// ============================================================================
// Non-generation handlers
// ============================================================================

async fn health_handler() -> Json<Value> {
    Json(json!({"status": "healthy"}))
}

async fn version_handler() -> Json<Value> {
    Json(json!({"version": VERSION, "engine": "fastllm"}))
}

async fn models_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "object": "list",
        "data": [{
            "id": state.config.model_name,
            "object": "model",
            "created": unix_now(),
            "owned_by": "fastllm"
        }]
    }))
}

async fn tokenize_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request: protocol::TokenizeRequest = parse_body(&body)?;
    if request.content.is_empty() {
        return Err(ServerError::validation("content is required", "content").into());
    }

    let ids = state
        .engine
        .encode_special(&request.content, request.add_special);
    let tokens: Vec<Value> = if request.with_pieces {
        ids.iter()
            .map(|&id| {
                let piece = String::from_utf8_lossy(&state.engine.decode(&[id])).into_owned();
                json!({"id": id, "piece": piece})
            })
            .collect()
    } else {
        ids.iter().map(|&id| json!(id)).collect()
    };

    Ok(Json(json!({"tokens": tokens})))
}

async fn detokenize_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request: protocol::DetokenizeRequest = parse_body(&body)?;
    let Some(tokens) = request.tokens else {
        return Err(ServerError::validation("tokens array is required", "tokens").into());
    };

    let ids: Vec<u32> = tokens
        .iter()
        .filter_map(Value::as_u64)
        .filter_map(|id| u32::try_from(id).ok())
        .collect();
    if ids.is_empty() {
        return Ok(Json(json!({"content": ""})));
    }

    let bytes = state.engine.decode(&ids);
    let valid = crate::utf8::valid_prefix_len(&bytes);
    let content = String::from_utf8(bytes[..valid].to_vec()).unwrap_or_default();
    Ok(Json(json!({"content": content})))
}

async fn slots_handler(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.pool.snapshot();
    let processing = snapshot.active > 0;
    let n_ctx = state
        .config
        .tokens_limit
        .or_else(|| state.engine.context_limit())
        .unwrap_or(4096);

    Json(json!([{
        "id": 0,
        "is_processing": processing,
        "n_ctx": n_ctx,
        "params": {
            "temperature": 0.8,
            "top_k": 40,
            "top_p": 0.95,
            "n_predict": -1
        },
        "next_token": {
            "has_next_token": processing,
            "n_remain": -1,
            "n_decoded": 0
        },
        "active_requests": snapshot.active,
        "max_requests": snapshot.max_active
    }]))
}

async fn props_handler(State(state): State<AppState>) -> Json<Value> {
    let kv = state.engine.kv_cache_info();
    Json(json!({
        "model": state.config.model_name,
        "model_path": state.config.path,
        "embedding_model_loaded": state.embedding.is_some(),
        "server_version": VERSION,
        "engine": "fastllm",
        "default_generation_settings": {
            "max_tokens": 256,
            "temperature": 1.0,
            "top_p": 1.0,
            "top_k": 1,
            "repeat_penalty": 1.0,
            "repeat_last_n": 64
        },
        "kv_cache": {
            "total_entries": kv.entries,
            "max_entries": kv.max_entries
        },
        "supported_endpoints": [
            "/v1/chat/completions",
            "/v1/completions",
            "/v1/embeddings",
            "/v1/models",
            "/v1/rerank",
            "/health",
            "/v1/health",
            "/version",
            "/props",
            "/tokenize",
            "/detokenize",
            "/slots",
            "/metrics"
        ],
        "supported_parameters": [
            "temperature", "top_p", "top_k", "max_tokens", "max_completion_tokens",
            "frequency_penalty", "presence_penalty", "repetition_penalty",
            "repeat_last_n", "stream", "stream_options", "response_format",
            "tools", "tool_choice", "stop"
        ],
        "capabilities": {
            "streaming": true,
            "tool_calls": true,
            "response_format": true,
            "embeddings": state.embedding.is_some(),
            "rerank": state.embedding.is_some()
        }
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    let text = render_prometheus(&state.pool.snapshot(), true, state.embedding.is_some());
    (
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
        )],
        text,
    )
        .into_response()
}

async fn cancel_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    if !state.config.dev_mode {
        return Err(ServerError::DevEndpointDisabled("/v1/cancel").into());
    }
    let request: protocol::CancelRequest = parse_body(&body)?;
    let Some(conversation_id) = request.conversation_id.filter(|id| !id.is_empty()) else {
        return Err(
            ServerError::validation("conversation_id is required", "conversation_id").into(),
        );
    };

    // Reserved for per-conversation cancellation wiring; reports receipt.
    Ok(Json(json!({
        "status": "cancelled",
        "conversation_id": conversation_id,
        "message": "Cancellation request received (note: full cancellation support requires conversation tracking)"
    })))
}

async fn active_conversations_handler(
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    if !state.config.dev_mode {
        return Err(ServerError::DevEndpointDisabled("/v1/active_conversations").into());
    }
    let snapshot = state.pool.snapshot();
    Ok(Json(json!({
        "active_count": snapshot.active,
        "max_count": snapshot.max_active,
        "total_processed": snapshot.total_processed,
        "conversations": []
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_shape() {
        let body = openai_error_body(&ServerError::validation("bad", "temperature"));
        assert_eq!(body["error"]["message"], "bad");
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert_eq!(body["error"]["param"], "temperature");
        assert!(body["error"]["code"].is_null());
    }

    #[test]
    fn test_error_body_auth_code() {
        let body = openai_error_body(&ServerError::InvalidApiKey);
        assert_eq!(body["error"]["code"], "invalid_api_key");
        assert!(body["error"]["param"].is_null());
    }

    #[test]
    fn test_auth_exempt_paths() {
        assert!(auth_exempt("/health"));
        assert!(auth_exempt("/health/"));
        assert!(auth_exempt("/v1/health"));
        assert!(auth_exempt("/version"));
        assert!(!auth_exempt("/v1/models"));
        assert!(!auth_exempt("/v1/chat/completions"));
    }

    #[test]
    fn test_parse_body_rejects_bad_json() {
        let err = parse_body::<protocol::TokenizeRequest>(&Bytes::from_static(b"{nope"))
            .err()
            .unwrap();
        assert_eq!(err.0.status(), 400);
    }

    #[test]
    fn test_unix_now_is_recent() {
        // Sanity bound: after 2020, before 2100.
        let now = unix_now();
        assert!(now > 1_577_836_800);
        assert!(now < 4_102_444_800);
    }
}
