//! Generation endpoint handlers
//!
//! Chat completions, text completions, embeddings, rerank, and the native
//! `/generate` route. Each generation request is admitted through the
//! request pool, owns one engine handle from launch to terminal token,
//! and streams through the UTF-8 boundary buffer and the tool-call parser
//! before anything reaches the socket.

use std::convert::Infallible;

use axum::{
    body::Bytes,
    extract::State,
    response::{sse::Event, IntoResponse, Response, Sse},
    Json,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use uuid::Uuid;

use super::protocol::{
    chat_completion_response, chat_chunk, classify_finish_reason, completion_chunk,
    completion_response, ChatCompletionRequest, CompletionRequest, EmbeddingRequest,
    GenerateRequest, RequestMessage, RerankRequest, Usage,
};
use super::{parse_body, unix_now, ApiError, AppState};
use crate::engine::{GenerationParams, HandleId, TokenFetch};
use crate::error::ServerError;
use crate::pool::PoolGuard;
use crate::sse;
use crate::stats::InferenceStats;
use crate::template::{self, ToolChoice};
use crate::toolcall::{ChatMsg, DiffTracker, StreamingToolCallParser};
use crate::utf8::Utf8Buffer;

// ============================================================================
// Shared helpers
// ============================================================================

/// Reject an out-of-range optional parameter
fn validate_range(
    value: Option<f64>,
    min: f64,
    max: f64,
    param: &str,
    message: &str,
) -> Result<(), ApiError> {
    if let Some(v) = value {
        if v < min || v > max {
            return Err(ServerError::validation(message, param).into());
        }
    }
    Ok(())
}

/// Validate sampling parameter ranges shared by chat and completions
fn validate_sampling(
    temperature: Option<f64>,
    top_p: Option<f64>,
    frequency_penalty: Option<f64>,
    presence_penalty: Option<f64>,
) -> Result<(), ApiError> {
    validate_range(
        temperature,
        0.0,
        2.0,
        "temperature",
        "temperature must be between 0 and 2",
    )?;
    validate_range(top_p, 0.0, 1.0, "top_p", "top_p must be between 0 and 1")?;
    validate_range(
        frequency_penalty,
        -2.0,
        2.0,
        "frequency_penalty",
        "frequency_penalty must be between -2 and 2",
    )?;
    validate_range(
        presence_penalty,
        -2.0,
        2.0,
        "presence_penalty",
        "presence_penalty must be between -2 and 2",
    )?;
    Ok(())
}

/// A non-empty model name must match the served model
fn validate_model(requested: &str, state: &AppState) -> Result<(), ApiError> {
    if !requested.is_empty() && requested != state.config.model_name {
        return Err(ServerError::ModelNotFound(requested.to_string()).into());
    }
    Ok(())
}

/// Map chat request fields onto the engine generation config
fn chat_generation_params(request: &ChatCompletionRequest) -> GenerationParams {
    let mut params = GenerationParams {
        output_token_limit: request
            .max_tokens
            .or(request.max_completion_tokens)
            .unwrap_or(256),
        ..GenerationParams::default()
    };
    if let Some(t) = request.temperature {
        params.temperature = t as f32;
    }
    if let Some(p) = request.top_p {
        params.top_p = p as f32;
    }
    if let Some(k) = request.top_k {
        params.top_k = k;
    }
    if let Some(f) = request.frequency_penalty {
        params.repeat_penalty = f as f32;
    } else if let Some(p) = request.presence_penalty {
        params.repeat_penalty = 1.0 + p as f32;
    }
    if let Some(r) = request.repetition_penalty {
        params.repeat_penalty = r as f32;
    }
    if let Some(n) = request.repeat_last_n {
        params.last_n = n;
    }
    params
}

/// Drain an engine handle to the terminal token on a blocking thread,
/// returning the raw output bytes and per-request stats. The pool slot is
/// held until the drain completes.
async fn drain_to_terminal(
    state: &AppState,
    handle: HandleId,
    prompt_tokens: usize,
    guard: PoolGuard,
) -> Result<(Vec<u8>, InferenceStats), ApiError> {
    let engine = state.engine.clone();
    tokio::task::spawn_blocking(move || {
        let _guard = guard;
        let mut stats = InferenceStats::new(prompt_tokens);
        let mut bytes = Vec::new();
        loop {
            match engine.fetch_next(handle) {
                TokenFetch::Token(token) => {
                    stats.on_token();
                    bytes.extend(engine.decode(&[token]));
                }
                TokenFetch::Terminal => break,
            }
        }
        (bytes, stats)
    })
    .await
    .map_err(|e| ApiError(ServerError::Engine(format!("generation task failed: {e}"))))
}

/// Decode raw engine output to text, dropping any trailing partial
/// sequence the same way the streaming path does
fn bytes_to_text(bytes: &[u8]) -> String {
    let mut utf8 = Utf8Buffer::new();
    let mut text = utf8.push(bytes);
    text.push_str(&utf8.finish());
    text
}

// ============================================================================
// Chat completions
// ============================================================================

/// POST `/v1/chat/completions`
pub async fn chat_completions_handler(State(state): State<AppState>, body: Bytes) -> Response {
    match chat_completions(state, body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn chat_completions(state: AppState, body: Bytes) -> Result<Response, ApiError> {
    let request: ChatCompletionRequest = parse_body(&body)?;

    validate_model(&request.model, &state)?;
    validate_sampling(
        request.temperature,
        request.top_p,
        request.frequency_penalty,
        request.presence_penalty,
    )?;

    let mut messages: Vec<ChatMsg> = if request.messages.is_empty() {
        match &request.prompt {
            Some(prompt) => vec![ChatMsg {
                role: "user".to_string(),
                content: prompt.clone(),
                ..ChatMsg::default()
            }],
            None => {
                return Err(
                    ServerError::validation("messages or prompt is required", "messages").into(),
                )
            }
        }
    } else {
        request.messages.iter().map(RequestMessage::to_chat_msg).collect()
    };

    // Tool schemas go through the template when it supports them natively,
    // otherwise as an injected system-prompt block.
    let tools_enabled = !request.tools.is_empty();
    let native_tools =
        tools_enabled && state.chat.has_template() && state.chat.capabilities().supports_tools;
    if tools_enabled && !native_tools {
        let tool_choice = ToolChoice::parse(request.tool_choice.as_ref());
        let block = template::build_tools_prompt(&request.tools, tool_choice);
        template::inject_system_text(&mut messages, &block);
    }

    if let Some(format) = &request.response_format {
        let format_type = format.format_type.as_deref().unwrap_or("text");
        let schema = format.json_schema.as_ref().and_then(|s| s.schema.as_ref());
        let block = template::build_json_mode_prompt(format_type, schema);
        template::inject_system_text(&mut messages, &block);
    }

    let tools_value = native_tools.then(|| Value::Array(request.tools.clone()));
    let prompt = state
        .chat
        .apply(&messages, tools_value.as_ref(), true, None)?;
    let prompt_ids = state.engine.encode(&prompt);
    let prompt_tokens = prompt_ids.len();
    let params = chat_generation_params(&request);

    let request_id = format!("fastllm-{}", Uuid::new_v4());
    let created = unix_now();

    let guard = state.pool.acquire().await?;
    let handle = state.engine.launch(prompt_ids, params.clone())?;

    if request.stream {
        Ok(stream_chat_response(
            &state,
            request_id,
            created,
            prompt_tokens,
            params,
            tools_enabled,
            request.include_usage(),
            guard,
            handle,
        ))
    } else {
        let (bytes, stats) = drain_to_terminal(&state, handle, prompt_tokens, guard).await?;
        let text = bytes_to_text(&bytes);

        let mut parser = StreamingToolCallParser::new(tools_enabled);
        parser.feed(&text);
        let message = parser.finalize();
        let finish = classify_finish_reason(
            stats.output_tokens(),
            params.output_token_limit,
            parser.has_tool_calls(),
        );
        let usage = Usage::new(prompt_tokens, stats.output_tokens());
        stats.log();

        Ok(Json(chat_completion_response(
            &request_id,
            created,
            &state.config.model_name,
            &message,
            finish,
            usage,
        ))
        .into_response())
    }
}

/// Spawn the blocking fetch loop and build the SSE response for a chat
/// request. A failed channel send means the client is gone: the fetch
/// loop aborts the engine handle and exits.
#[allow(clippy::too_many_arguments)]
fn stream_chat_response(
    state: &AppState,
    request_id: String,
    created: i64,
    prompt_tokens: usize,
    params: GenerationParams,
    tools_enabled: bool,
    include_usage: bool,
    guard: PoolGuard,
    handle: HandleId,
) -> Response {
    let mut token_stream = ReceiverStream::new(spawn_fetch_loop(state, handle));
    let model_name = state.config.model_name.clone();

    let stream = async_stream::stream! {
        // Slot held until the stream is fully written or dropped.
        let _guard = guard;
        let mut stats = InferenceStats::new(prompt_tokens);
        let mut utf8 = Utf8Buffer::new();
        let mut parser = StreamingToolCallParser::new(tools_enabled);
        let mut tracker = DiffTracker::new();

        yield Ok::<Event, Infallible>(sse::json_event(&chat_chunk(
            &request_id,
            created,
            &model_name,
            json!({"role": "assistant"}),
            None,
            None,
        )));

        while let Some(bytes) = token_stream.next().await {
            stats.on_token();
            let text = utf8.push(&bytes);
            if text.is_empty() {
                continue;
            }
            parser.feed(&text);
            for diff in tracker.update(&parser.current_message()) {
                yield Ok(sse::json_event(&chat_chunk(
                    &request_id,
                    created,
                    &model_name,
                    diff.to_delta(),
                    None,
                    None,
                )));
            }
        }

        // Terminal: flush the UTF-8 carry and the parser's buffer.
        let rest = utf8.finish();
        if !rest.is_empty() {
            parser.feed(&rest);
        }
        let final_msg = parser.finalize();
        for diff in tracker.update(&final_msg) {
            yield Ok(sse::json_event(&chat_chunk(
                &request_id,
                created,
                &model_name,
                diff.to_delta(),
                None,
                None,
            )));
        }

        let finish = classify_finish_reason(
            stats.output_tokens(),
            params.output_token_limit,
            parser.has_tool_calls(),
        );
        let usage = include_usage.then(|| Usage::new(prompt_tokens, stats.output_tokens()));
        yield Ok(sse::json_event(&chat_chunk(
            &request_id,
            created,
            &model_name,
            json!({}),
            Some(finish),
            usage,
        )));
        stats.log();
        yield Ok(sse::done_event());
    };

    let mut response = Sse::new(stream).into_response();
    sse::apply_stream_headers(response.headers_mut());
    response
}

/// Run the blocking `fetch_next` loop on its own thread, forwarding
/// decoded bytes through a bounded channel. Dropping the receiver (client
/// disconnect) fails the next send, which aborts the engine handle.
fn spawn_fetch_loop(state: &AppState, handle: HandleId) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel::<Vec<u8>>(16);
    let engine = state.engine.clone();
    tokio::task::spawn_blocking(move || loop {
        match engine.fetch_next(handle) {
            TokenFetch::Token(token) => {
                let bytes = engine.decode(&[token]);
                if tx.blocking_send(bytes).is_err() {
                    engine.abort(handle);
                    return;
                }
            }
            TokenFetch::Terminal => return,
        }
    });
    rx
}

// ============================================================================
// Text completions
// ============================================================================

/// POST `/v1/completions`
pub async fn completions_handler(State(state): State<AppState>, body: Bytes) -> Response {
    match completions(state, body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn completions(state: AppState, body: Bytes) -> Result<Response, ApiError> {
    let request: CompletionRequest = parse_body(&body)?;

    let Some(prompt) = request.prompt_text() else {
        return Err(ServerError::validation("prompt is required", "prompt").into());
    };
    validate_model(&request.model, &state)?;
    validate_sampling(
        request.temperature,
        request.top_p,
        request.frequency_penalty,
        None,
    )?;

    let mut params = GenerationParams {
        output_token_limit: request.max_tokens.unwrap_or(16),
        ..GenerationParams::default()
    };
    if let Some(t) = request.temperature {
        params.temperature = t as f32;
    }
    if let Some(p) = request.top_p {
        params.top_p = p as f32;
    }
    if let Some(k) = request.top_k {
        params.top_k = k;
    }
    if let Some(f) = request.frequency_penalty {
        params.repeat_penalty = f as f32;
    }

    let prompt_ids = state.engine.encode(&prompt);
    let prompt_tokens = prompt_ids.len();
    let request_id = format!("cmpl-{}", Uuid::new_v4());
    let created = unix_now();

    let guard = state.pool.acquire().await?;
    let handle = state.engine.launch(prompt_ids, params.clone())?;

    if request.stream {
        Ok(stream_completion_response(
            &state,
            request_id,
            created,
            prompt,
            request.echo,
            prompt_tokens,
            params,
            guard,
            handle,
        ))
    } else {
        let (bytes, stats) = drain_to_terminal(&state, handle, prompt_tokens, guard).await?;
        let generated = bytes_to_text(&bytes);
        let text = if request.echo {
            format!("{prompt}{generated}")
        } else {
            generated
        };
        let finish =
            classify_finish_reason(stats.output_tokens(), params.output_token_limit, false);
        let usage = Usage::new(prompt_tokens, stats.output_tokens());
        stats.log();

        Ok(Json(completion_response(
            &request_id,
            created,
            &state.config.model_name,
            &text,
            finish,
            usage,
        ))
        .into_response())
    }
}

#[allow(clippy::too_many_arguments)]
fn stream_completion_response(
    state: &AppState,
    request_id: String,
    created: i64,
    prompt: String,
    echo: bool,
    prompt_tokens: usize,
    params: GenerationParams,
    guard: PoolGuard,
    handle: HandleId,
) -> Response {
    let mut token_stream = ReceiverStream::new(spawn_fetch_loop(state, handle));
    let model_name = state.config.model_name.clone();

    let stream = async_stream::stream! {
        let _guard = guard;
        let mut stats = InferenceStats::new(prompt_tokens);
        let mut utf8 = Utf8Buffer::new();

        if echo && !prompt.is_empty() {
            yield Ok::<Event, Infallible>(sse::json_event(&completion_chunk(
                &request_id, created, &model_name, &prompt, None,
            )));
        }

        while let Some(bytes) = token_stream.next().await {
            stats.on_token();
            let text = utf8.push(&bytes);
            if text.is_empty() {
                continue;
            }
            yield Ok(sse::json_event(&completion_chunk(
                &request_id, created, &model_name, &text, None,
            )));
        }

        let rest = utf8.finish();
        if !rest.is_empty() {
            yield Ok(sse::json_event(&completion_chunk(
                &request_id, created, &model_name, &rest, None,
            )));
        }

        let finish =
            classify_finish_reason(stats.output_tokens(), params.output_token_limit, false);
        yield Ok(sse::json_event(&completion_chunk(
            &request_id, created, &model_name, "", Some(finish),
        )));
        stats.log();
        yield Ok(sse::done_event());
    };

    let mut response = Sse::new(stream).into_response();
    sse::apply_stream_headers(response.headers_mut());
    response
}

// ============================================================================
// Native generate
// ============================================================================

/// POST `/generate`: prompt in, generated text out, no OpenAI envelope
pub async fn generate_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request: GenerateRequest = parse_body(&body)?;
    let Some(prompt) = request.prompt.filter(|p| !p.is_empty()) else {
        return Err(ServerError::validation("prompt is required", "prompt").into());
    };

    let messages = vec![ChatMsg {
        role: "user".to_string(),
        content: prompt,
        ..ChatMsg::default()
    }];
    let rendered = state.chat.apply(&messages, None, true, None)?;
    let prompt_ids = state.engine.encode(&rendered);
    let prompt_tokens = prompt_ids.len();
    let params = GenerationParams {
        output_token_limit: request.max_tokens.unwrap_or(200),
        ..GenerationParams::default()
    };

    let guard = state.pool.acquire().await?;
    let handle = state.engine.launch(prompt_ids, params)?;
    let (bytes, stats) = drain_to_terminal(&state, handle, prompt_tokens, guard).await?;
    stats.log();

    Ok(Json(json!({"response": bytes_to_text(&bytes)})))
}

// ============================================================================
// Embeddings and rerank
// ============================================================================

/// POST `/v1/embeddings`
pub async fn embeddings_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let Some(embedding) = state.embedding.clone() else {
        return Err(ServerError::validation(
            "Embeddings model not loaded. Start apiserver with --embedding_path.",
            "model",
        )
        .into());
    };
    let request: EmbeddingRequest = parse_body(&body)?;

    let input = match &request.input {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) if !items.is_empty() => match &items[0] {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
        _ => {
            return Err(ServerError::validation("Input cannot be empty", "input").into());
        }
    };

    let prompt_tokens = embedding.token_count(&input);
    let vector = embedding.embed(&input)?;
    let model = request
        .model
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| state.config.model_name.clone());

    Ok(Json(json!({
        "object": "list",
        "data": [{
            "object": "embedding",
            "embedding": vector,
            "index": 0
        }],
        "model": model,
        "usage": {
            "prompt_tokens": prompt_tokens,
            "total_tokens": prompt_tokens
        }
    })))
}

/// POST `/v1/rerank`: score documents against the query by cosine
/// similarity, descending
pub async fn rerank_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let Some(embedding) = state.embedding.clone() else {
        return Err(ServerError::validation(
            "Embeddings model not loaded. Start apiserver with --embedding_path to enable rerank.",
            "model",
        )
        .into());
    };
    let request: RerankRequest = parse_body(&body)?;

    if request.query.is_empty() {
        return Err(ServerError::validation("query is required", "query").into());
    }
    let documents: Vec<String> = request
        .documents
        .iter()
        .filter_map(|doc| match doc {
            Value::String(s) => Some(s.clone()),
            Value::Object(obj) => obj
                .get("text")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        })
        .collect();
    if documents.is_empty() {
        return Err(ServerError::validation(
            "documents is required and must be non-empty array",
            "documents",
        )
        .into());
    }

    let top_n = request.top_n.unwrap_or(documents.len()).min(documents.len());
    let query_embedding = embedding.embed(&request.query)?;

    let mut scores: Vec<(usize, f64)> = Vec::with_capacity(documents.len());
    for (index, document) in documents.iter().enumerate() {
        let doc_embedding = embedding.embed(document)?;
        scores.push((index, cosine_similarity(&query_embedding, &doc_embedding)));
    }
    scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let data: Vec<Value> = scores
        .iter()
        .take(top_n)
        .map(|&(index, score)| {
            json!({
                "index": index,
                "relevance_score": score,
                "document": { "text": documents[index] }
            })
        })
        .collect();

    let model = request
        .model
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| state.config.model_name.clone());

    Ok(Json(json!({
        "object": "list",
        "data": data,
        "model": model,
        "usage": { "total_tokens": 0 }
    })))
}

/// Cosine similarity over the shared prefix of two vectors
fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += f64::from(x) * f64::from(y);
        norm_a += f64::from(x) * f64::from(x);
        norm_b += f64::from(y) * f64::from(y);
    }
    if norm_a > 0.0 && norm_b > 0.0 {
        dot / (norm_a.sqrt() * norm_b.sqrt())
    } else {
        0.0
    }
}
