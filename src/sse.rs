//! Server-Sent Events framing
//!
//! Each streamed event is a `data: <compact-JSON>\n\n` payload; the
//! terminal event is `data: [DONE]\n\n`. Chunked transfer-encoding of the
//! HTTP body is owned by hyper underneath axum; this module owns the event
//! payloads and the headers that mark a response as an SSE stream.

use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::sse::Event;

/// Collapse JSON to a single line without touching quoted strings.
///
/// SSE terminates an event at a blank line, so a payload that spans lines
/// would be torn apart by the client. Serialized values from `serde_json`
/// are already compact; this guards payloads assembled from pre-rendered
/// fragments (tool schemas, template output) as well.
#[must_use]
pub fn compact_json(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    let mut in_string = false;
    let mut escape = false;
    for c in json.chars() {
        if escape {
            out.push(c);
            escape = false;
            continue;
        }
        if in_string && c == '\\' {
            out.push(c);
            escape = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            out.push(c);
            continue;
        }
        if !in_string && matches!(c, ' ' | '\t' | '\n' | '\r') {
            continue;
        }
        out.push(c);
    }
    out
}

/// Build a `data:` event carrying a compacted JSON payload
#[must_use]
pub fn json_event(value: &serde_json::Value) -> Event {
    let payload = serde_json::to_string(value).unwrap_or_default();
    Event::default().data(compact_json(&payload))
}

/// Terminal `data: [DONE]` event
#[must_use]
pub fn done_event() -> Event {
    Event::default().data("[DONE]")
}

/// Headers required on a streaming response.
///
/// `Content-Type: text/event-stream` is set by axum's `Sse` wrapper and
/// `Transfer-Encoding: chunked` by hyper; the rest are applied here.
pub fn apply_stream_headers(headers: &mut HeaderMap) {
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
}
