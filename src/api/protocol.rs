//! OpenAI-compatible wire types
//!
//! Request deserialization and response construction for the `/v1/*`
//! endpoints. Unknown request keys are silently ignored; response objects
//! carry the fastllm identity fields (`system_fingerprint`,
//! `owned_by`, id prefixes).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::toolcall::ChatMsg;

/// Why generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Natural end of generation
    Stop,
    /// Token limit reached
    Length,
    /// The model requested tool invocation
    ToolCalls,
}

impl FinishReason {
    /// Wire string
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolCalls => "tool_calls",
        }
    }
}

/// Terminal classification: token limit first, then tool calls, else stop
#[must_use]
pub fn classify_finish_reason(
    output_tokens: usize,
    token_limit: usize,
    has_tool_calls: bool,
) -> FinishReason {
    if output_tokens >= token_limit {
        FinishReason::Length
    } else if has_tool_calls {
        FinishReason::ToolCalls
    } else {
        FinishReason::Stop
    }
}

/// Token accounting for a completed request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    /// Prompt token count
    pub prompt_tokens: usize,
    /// Generated token count
    pub completion_tokens: usize,
    /// Sum of the two
    pub total_tokens: usize,
}

impl Usage {
    /// Build usage from prompt and completion counts
    #[must_use]
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// `system_fingerprint` value for a model
#[must_use]
pub fn system_fingerprint(model: &str) -> String {
    format!("fastllm-{model}")
}

// ============================================================================
// Requests
// ============================================================================

/// Message content: plain text, typed parts, or an object with a `text`
/// field, covering the shapes clients send in practice
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Canonical string content
    Text(String),
    /// Typed-part array (`[{"type": "text", "text": ...}, ...]`)
    Parts(Vec<Value>),
    /// Anything else; text is extracted from a `text` field when present
    Other(Value),
}

impl MessageContent {
    /// Flatten to plain text the way the chat template consumes it
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Parts(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        Value::String(s) => out.push_str(s),
                        Value::Object(obj) => {
                            let part_type =
                                obj.get("type").and_then(Value::as_str).unwrap_or("text");
                            if part_type == "text" || part_type == "input_text" {
                                if let Some(text) = obj.get("text").and_then(Value::as_str) {
                                    out.push_str(text);
                                }
                            }
                        }
                        _ => {}
                    }
                }
                out
            }
            Self::Other(value) => value
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }
    }
}

/// One request message
#[derive(Debug, Clone, Deserialize)]
pub struct RequestMessage {
    /// Message role
    #[serde(default)]
    pub role: String,
    /// Message content in any accepted shape
    #[serde(default)]
    pub content: Option<MessageContent>,
    /// Tool name, for tool-role messages
    #[serde(default)]
    pub name: Option<String>,
    /// Tool call being answered
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

impl RequestMessage {
    /// Convert to the canonical message form
    #[must_use]
    pub fn to_chat_msg(&self) -> ChatMsg {
        ChatMsg {
            role: self.role.clone(),
            content: self
                .content
                .as_ref()
                .map(MessageContent::to_text)
                .unwrap_or_default(),
            tool_name: self.name.clone().unwrap_or_default(),
            tool_call_id: self.tool_call_id.clone().unwrap_or_default(),
            ..ChatMsg::default()
        }
    }
}

/// `stream_options` request field
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct StreamOptions {
    /// Attach usage to the terminal streaming chunk (default true)
    #[serde(default)]
    pub include_usage: Option<bool>,
}

/// `response_format` request field
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseFormat {
    /// `text`, `json_object`, or `json_schema`
    #[serde(rename = "type", default)]
    pub format_type: Option<String>,
    /// Schema wrapper for `json_schema`
    #[serde(default)]
    pub json_schema: Option<JsonSchemaFormat>,
}

/// `response_format.json_schema` contents
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonSchemaFormat {
    /// The schema the response must follow
    #[serde(default)]
    pub schema: Option<Value>,
}

/// `/v1/chat/completions` request body
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatCompletionRequest {
    /// Requested model name
    #[serde(default)]
    pub model: String,
    /// Conversation messages
    #[serde(default)]
    pub messages: Vec<RequestMessage>,
    /// Prompt fallback when `messages` is absent
    #[serde(default)]
    pub prompt: Option<String>,
    /// Generation token limit
    #[serde(default)]
    pub max_tokens: Option<usize>,
    /// Alias accepted for `max_tokens`
    #[serde(default)]
    pub max_completion_tokens: Option<usize>,
    /// Sampling temperature, `[0, 2]`
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Nucleus threshold, `[0, 1]`
    #[serde(default)]
    pub top_p: Option<f64>,
    /// Top-k cutoff
    #[serde(default)]
    pub top_k: Option<u32>,
    /// Frequency penalty, `[-2, 2]`
    #[serde(default)]
    pub frequency_penalty: Option<f64>,
    /// Presence penalty, `[-2, 2]`
    #[serde(default)]
    pub presence_penalty: Option<f64>,
    /// HuggingFace-style repetition penalty
    #[serde(default)]
    pub repetition_penalty: Option<f64>,
    /// Penalty context window
    #[serde(default)]
    pub repeat_last_n: Option<usize>,
    /// Stream the response as SSE
    #[serde(default)]
    pub stream: bool,
    /// Streaming options
    #[serde(default)]
    pub stream_options: Option<StreamOptions>,
    /// Tool schemas available to the model
    #[serde(default)]
    pub tools: Vec<Value>,
    /// Tool choice directive
    #[serde(default)]
    pub tool_choice: Option<Value>,
    /// Response format directive
    #[serde(default)]
    pub response_format: Option<ResponseFormat>,
    /// Stop sequences (accepted, engine-dependent)
    #[serde(default)]
    pub stop: Option<Value>,
}

impl ChatCompletionRequest {
    /// Effective `include_usage` for streaming (defaults to true)
    #[must_use]
    pub fn include_usage(&self) -> bool {
        self.stream_options
            .and_then(|o| o.include_usage)
            .unwrap_or(true)
    }
}

/// `/v1/completions` request body
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionRequest {
    /// Requested model name
    #[serde(default)]
    pub model: String,
    /// Prompt: a string or an array whose first element is used
    #[serde(default)]
    pub prompt: Option<Value>,
    /// Generation token limit (default 16)
    #[serde(default)]
    pub max_tokens: Option<usize>,
    /// Sampling temperature
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Nucleus threshold
    #[serde(default)]
    pub top_p: Option<f64>,
    /// Top-k cutoff
    #[serde(default)]
    pub top_k: Option<u32>,
    /// Frequency penalty
    #[serde(default)]
    pub frequency_penalty: Option<f64>,
    /// Prefix the prompt to the output
    #[serde(default)]
    pub echo: bool,
    /// Stream the response as SSE
    #[serde(default)]
    pub stream: bool,
}

impl CompletionRequest {
    /// Resolve the prompt text: string, or first array element
    #[must_use]
    pub fn prompt_text(&self) -> Option<String> {
        match &self.prompt {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Array(items)) => items.first().map(|first| match first {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
            _ => None,
        }
    }
}

/// `/tokenize` request body
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenizeRequest {
    /// Text to tokenize
    #[serde(default)]
    pub content: String,
    /// Add model special tokens (engine-dependent)
    #[serde(default)]
    pub add_special: bool,
    /// Return `[{id, piece}]` instead of bare IDs
    #[serde(default)]
    pub with_pieces: bool,
}

/// `/detokenize` request body
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetokenizeRequest {
    /// Token IDs; non-numeric entries are ignored
    #[serde(default)]
    pub tokens: Option<Vec<Value>>,
}

/// `/v1/embeddings` request body
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmbeddingRequest {
    /// Input text: a string or an array whose first element is used
    #[serde(default)]
    pub input: Option<Value>,
    /// Model name echoed in the response
    #[serde(default)]
    pub model: Option<String>,
}

/// `/v1/rerank` request body
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RerankRequest {
    /// Query text
    #[serde(default)]
    pub query: String,
    /// Documents: strings or `{"text": ...}` objects
    #[serde(default)]
    pub documents: Vec<Value>,
    /// Number of top documents to return (default: all)
    #[serde(default)]
    pub top_n: Option<usize>,
    /// Model name echoed in the response
    #[serde(default)]
    pub model: Option<String>,
}

/// `/generate` request body
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateRequest {
    /// Prompt text
    #[serde(default)]
    pub prompt: Option<String>,
    /// Generation token limit (default 200)
    #[serde(default)]
    pub max_tokens: Option<usize>,
}

/// `/v1/cancel` request body (dev-only)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CancelRequest {
    /// Conversation to cancel
    #[serde(default)]
    pub conversation_id: Option<String>,
}

// ============================================================================
// Responses
// ============================================================================

/// Non-streaming chat completion response
#[must_use]
pub fn chat_completion_response(
    id: &str,
    created: i64,
    model: &str,
    message: &ChatMsg,
    finish_reason: FinishReason,
    usage: Usage,
) -> Value {
    json!({
        "id": id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "system_fingerprint": system_fingerprint(model),
        "choices": [{
            "index": 0,
            "message": message.to_json(),
            "logprobs": null,
            "finish_reason": finish_reason.as_str()
        }],
        "usage": usage
    })
}

/// Streaming chat chunk carrying `delta`, with optional terminal fields
#[must_use]
pub fn chat_chunk(
    id: &str,
    created: i64,
    model: &str,
    delta: Value,
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
) -> Value {
    let mut chunk = json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "system_fingerprint": system_fingerprint(model),
        "choices": [{
            "index": 0,
            "delta": delta,
            "logprobs": null,
            "finish_reason": finish_reason.map(FinishReason::as_str)
        }]
    });
    if let Some(usage) = usage {
        chunk
            .as_object_mut()
            .expect("object literal")
            .insert("usage".to_string(), json!(usage));
    }
    chunk
}

/// Non-streaming text completion response
#[must_use]
pub fn completion_response(
    id: &str,
    created: i64,
    model: &str,
    text: &str,
    finish_reason: FinishReason,
    usage: Usage,
) -> Value {
    json!({
        "id": id,
        "object": "text_completion",
        "created": created,
        "model": model,
        "system_fingerprint": system_fingerprint(model),
        "choices": [{
            "index": 0,
            "text": text,
            "logprobs": null,
            "finish_reason": finish_reason.as_str()
        }],
        "usage": usage
    })
}

/// Streaming text completion chunk
#[must_use]
pub fn completion_chunk(
    id: &str,
    created: i64,
    model: &str,
    text: &str,
    finish_reason: Option<FinishReason>,
) -> Value {
    json!({
        "id": id,
        "object": "text_completion",
        "created": created,
        "model": model,
        "system_fingerprint": system_fingerprint(model),
        "choices": [{
            "index": 0,
            "text": text,
            "logprobs": null,
            "finish_reason": finish_reason.map(FinishReason::as_str)
        }]
    })
}
