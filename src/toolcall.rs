//! Streaming extraction of reasoning, content, and tool calls
//!
//! Model output arrives as an untrusted, incrementally growing text
//! buffer. [`StreamingToolCallParser`] classifies it into three monotone
//! streams (`reasoning_content`, visible `content`, and `tool_calls`)
//! across several marker dialects, tolerating markers split between
//! chunks. [`ChatMsgDiff`] turns successive parser states into
//! OpenAI-compatible streaming deltas.
//!
//! Dialects (sticky once detected, at most one per request):
//!
//! | Format | Markers |
//! |---|---|
//! | Qwen3 | `<tool_call>…</tool_call>` |
//! | DeepSeek | `<｜tool▁calls▁begin｜>…<｜tool▁calls▁end｜>` split by `<｜tool▁sep｜>` |
//! | JsonBlock | ```` ```json … ``` ```` |
//! | DirectJson | bare `{"name": …, "arguments": …}` object |
//!
//! Reasoning markers (`<think>`, `<thinking>`, `<｜thinking｜>` pairs) are
//! orthogonal to the tool-call dialect.

use rand::Rng;
use serde_json::{json, Value};

use crate::peg::Rule;

const QWEN3_START: &str = "<tool_call>";
const QWEN3_END: &str = "</tool_call>";
const DEEPSEEK_START: &str = "<｜tool▁calls▁begin｜>";
const DEEPSEEK_END: &str = "<｜tool▁calls▁end｜>";
const DEEPSEEK_SEP: &str = "<｜tool▁sep｜>";
const JSON_BLOCK_START: &str = "```json";
const JSON_BLOCK_END: &str = "```";

/// Thinking marker pairs, checked in order
const THINKING_MARKERS: [(&str, &str); 3] = [
    ("<think>", "</think>"),
    ("<thinking>", "</thinking>"),
    ("<｜thinking｜>", "<｜/thinking｜>"),
];

/// A tool call extracted from model output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolCall {
    /// Stable identifier, `call_<24 alphanumerics>` when the model did not
    /// supply one
    pub id: String,
    /// Function name
    pub name: String,
    /// Arguments as serialized JSON text
    pub arguments: String,
    /// True once the closing marker has been consumed
    pub is_complete: bool,
}

/// One part of a typed-array message content
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatMsgContentPart {
    /// Part type, e.g. `text` or `image_url`
    pub part_type: String,
    /// Text payload for text-typed parts
    pub text: String,
}

/// A chat message in canonical form
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatMsg {
    /// `system`, `user`, `assistant`, or `tool`
    pub role: String,
    /// Canonical text content (mutually exclusive with `content_parts`)
    pub content: String,
    /// Typed-array content as sent by the client
    pub content_parts: Vec<ChatMsgContentPart>,
    /// Extracted tool calls
    pub tool_calls: Vec<ToolCall>,
    /// Extracted thinking trace
    pub reasoning_content: String,
    /// Tool name, for `tool`-role messages
    pub tool_name: String,
    /// Tool call being answered, for `tool`-role messages
    pub tool_call_id: String,
}

impl ChatMsg {
    /// Empty assistant message, the starting state for diff tracking
    #[must_use]
    pub fn assistant() -> Self {
        Self {
            role: "assistant".to_string(),
            ..Self::default()
        }
    }

    /// True when the message carries no content of any kind
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
            && self.content_parts.is_empty()
            && self.tool_calls.is_empty()
            && self.reasoning_content.is_empty()
    }

    /// OpenAI-compatible message object.
    ///
    /// `content` is `null` when the message consists only of tool calls.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut msg = json!({ "role": self.role });
        let obj = msg.as_object_mut().expect("object literal");

        if !self.tool_calls.is_empty() && self.content.is_empty() {
            obj.insert("content".to_string(), Value::Null);
        } else {
            obj.insert("content".to_string(), json!(self.content));
        }
        if !self.reasoning_content.is_empty() {
            obj.insert("reasoning_content".to_string(), json!(self.reasoning_content));
        }
        if !self.tool_name.is_empty() {
            obj.insert("name".to_string(), json!(self.tool_name));
        }
        if !self.tool_call_id.is_empty() {
            obj.insert("tool_call_id".to_string(), json!(self.tool_call_id));
        }
        if !self.tool_calls.is_empty() {
            obj.insert("tool_calls".to_string(), tool_calls_to_json(&self.tool_calls));
        }
        msg
    }
}

/// OpenAI `tool_calls` array for a finished message
#[must_use]
pub fn tool_calls_to_json(calls: &[ToolCall]) -> Value {
    Value::Array(
        calls
            .iter()
            .map(|tc| {
                json!({
                    "id": tc.id,
                    "type": "function",
                    "function": { "name": tc.name, "arguments": tc.arguments }
                })
            })
            .collect(),
    )
}

/// Generate a tool-call ID: `call_` + 24 lowercase alphanumerics, with an
/// optional `_<index>` suffix to keep IDs unique within a response
#[must_use]
pub fn generate_tool_call_id(index: Option<usize>) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    let mut id = String::with_capacity(32);
    id.push_str("call_");
    for _ in 0..24 {
        id.push(CHARSET[rng.random_range(0..CHARSET.len())] as char);
    }
    if let Some(i) = index {
        id.push('_');
        id.push_str(&i.to_string());
    }
    id
}

// ============================================================================
// Streaming diffs
// ============================================================================

/// Delta between two successive message states
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatMsgDiff {
    /// Appended reasoning text
    pub reasoning_delta: String,
    /// Appended visible content
    pub content_delta: String,
    /// Index of the tool call this delta belongs to, if any
    pub tool_call_index: Option<usize>,
    /// Partial tool-call update (new id/name and/or argument suffix)
    pub tool_call_delta: ToolCall,
}

/// Suffix of `current` past `last`; empty when `current` is not a strict
/// extension (which monotone streaming never produces)
fn string_diff(last: &str, current: &str) -> String {
    if last.is_empty() {
        return current.to_string();
    }
    current.strip_prefix(last).unwrap_or("").to_string()
}

impl ChatMsgDiff {
    /// True when the delta carries nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reasoning_delta.is_empty()
            && self.content_delta.is_empty()
            && self.tool_call_index.is_none()
    }

    /// Compute the deltas that turn `prev` into `new`
    #[must_use]
    pub fn compute(prev: &ChatMsg, new: &ChatMsg) -> Vec<ChatMsgDiff> {
        let mut diffs = Vec::new();

        if prev.reasoning_content != new.reasoning_content {
            let delta = string_diff(&prev.reasoning_content, &new.reasoning_content);
            if !delta.is_empty() {
                diffs.push(ChatMsgDiff {
                    reasoning_delta: delta,
                    ..Self::default()
                });
            }
        }

        if prev.content != new.content {
            let delta = string_diff(&prev.content, &new.content);
            if !delta.is_empty() {
                diffs.push(ChatMsgDiff {
                    content_delta: delta,
                    ..Self::default()
                });
            }
        }

        // Tool-call indices only grow.
        if new.tool_calls.len() < prev.tool_calls.len() {
            return diffs;
        }

        // Incremental update to the last previously-seen tool call.
        if let Some(prev_tc) = prev.tool_calls.last() {
            let idx = prev.tool_calls.len() - 1;
            let new_tc = &new.tool_calls[idx];
            if prev_tc.name == new_tc.name {
                let args_delta = string_diff(&prev_tc.arguments, &new_tc.arguments);
                if !args_delta.is_empty() || prev_tc.id != new_tc.id {
                    let mut delta = ToolCall {
                        arguments: args_delta,
                        ..ToolCall::default()
                    };
                    if prev_tc.id != new_tc.id {
                        delta.id = new_tc.id.clone();
                        delta.name = new_tc.name.clone();
                    }
                    diffs.push(ChatMsgDiff {
                        tool_call_index: Some(idx),
                        tool_call_delta: delta,
                        ..Self::default()
                    });
                }
            }
        }

        // Full objects for tool calls beyond the previous count.
        for idx in prev.tool_calls.len()..new.tool_calls.len() {
            diffs.push(ChatMsgDiff {
                tool_call_index: Some(idx),
                tool_call_delta: new.tool_calls[idx].clone(),
                ..Self::default()
            });
        }

        diffs
    }

    /// OpenAI streaming `delta` object for this diff
    #[must_use]
    pub fn to_delta(&self) -> Value {
        let mut delta = json!({});
        let obj = delta.as_object_mut().expect("object literal");

        if !self.reasoning_delta.is_empty() {
            obj.insert("reasoning_content".to_string(), json!(self.reasoning_delta));
        }
        if !self.content_delta.is_empty() {
            obj.insert("content".to_string(), json!(self.content_delta));
        }
        if let Some(idx) = self.tool_call_index {
            let mut tc = json!({ "index": idx });
            let tc_obj = tc.as_object_mut().expect("object literal");
            if !self.tool_call_delta.id.is_empty() {
                tc_obj.insert("id".to_string(), json!(self.tool_call_delta.id));
                tc_obj.insert("type".to_string(), json!("function"));
            }
            let mut func = json!({ "arguments": self.tool_call_delta.arguments });
            if !self.tool_call_delta.name.is_empty() {
                func.as_object_mut()
                    .expect("object literal")
                    .insert("name".to_string(), json!(self.tool_call_delta.name));
            }
            tc_obj.insert("function".to_string(), func);
            obj.insert("tool_calls".to_string(), Value::Array(vec![tc]));
        }

        delta
    }
}

/// Tracks the last emitted message state and produces deltas on update
#[derive(Debug)]
pub struct DiffTracker {
    last: ChatMsg,
}

impl Default for DiffTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DiffTracker {
    /// Start tracking from an empty assistant message
    #[must_use]
    pub fn new() -> Self {
        Self {
            last: ChatMsg::assistant(),
        }
    }

    /// Diff the new state against the last emitted one and advance
    pub fn update(&mut self, msg: &ChatMsg) -> Vec<ChatMsgDiff> {
        let diffs = ChatMsgDiff::compute(&self.last, msg);
        self.last = msg.clone();
        diffs
    }

    /// Last emitted message state
    #[must_use]
    pub fn current(&self) -> &ChatMsg {
        &self.last
    }
}

// ============================================================================
// Streaming parser
// ============================================================================

/// Tool-call marker dialect, detected once per request and then sticky
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// No confident marker seen yet
    #[default]
    Unknown,
    /// ```` ```json … ``` ````
    JsonBlock,
    /// `<tool_call>…</tool_call>`
    Qwen3,
    /// `<｜tool▁calls▁begin｜>…<｜tool▁calls▁end｜>`
    DeepSeek,
    /// Bare JSON object with `"name"` and `"arguments"`
    DirectJson,
}

/// Stateful streaming parser separating reasoning, content, and tool calls
#[derive(Debug, Default)]
pub struct StreamingToolCallParser {
    buffer: String,
    content: String,
    reasoning: String,
    tool_calls: Vec<ToolCall>,
    in_reasoning: bool,
    open_marker: Option<usize>,
    thinking_forced_open: bool,
    in_tool_call: bool,
    tool_call_index: usize,
    format: Format,
    tools_enabled: bool,
}

impl StreamingToolCallParser {
    /// Create a parser. Tool-call dialect detection only runs when the
    /// request declared tools; reasoning extraction always runs.
    #[must_use]
    pub fn new(tools_enabled: bool) -> Self {
        Self {
            tools_enabled,
            ..Self::default()
        }
    }

    /// Feed a chunk of model output and reprocess the buffer
    pub fn feed(&mut self, chunk: &str) {
        self.buffer.push_str(chunk);
        self.process();
    }

    /// Flush remaining state at stream end and return the final message.
    ///
    /// Whatever is still buffered (a partial marker, an unterminated tool
    /// call) is surfaced as reasoning when a thinking block is still open,
    /// otherwise as content.
    pub fn finalize(&mut self) -> ChatMsg {
        self.process();
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            if self.in_reasoning {
                self.reasoning.push_str(&rest);
            } else {
                self.content.push_str(&rest);
            }
        }
        self.current_message()
    }

    /// Reset all state for reuse on a new request
    pub fn reset(&mut self) {
        *self = Self::new(self.tools_enabled);
    }

    /// True while the buffer holds an unterminated tool-call block
    #[must_use]
    pub fn is_parsing_tool_call(&self) -> bool {
        self.in_tool_call
    }

    /// True when a thinking marker opened without a close yet
    #[must_use]
    pub fn thinking_forced_open(&self) -> bool {
        self.thinking_forced_open
    }

    /// True once at least one complete tool call has been parsed
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.iter().any(|tc| tc.is_complete)
    }

    /// Detected dialect
    #[must_use]
    pub fn format(&self) -> Format {
        self.format
    }

    /// Accumulated message state for diff computation
    #[must_use]
    pub fn current_message(&self) -> ChatMsg {
        ChatMsg {
            role: "assistant".to_string(),
            content: self.content.clone(),
            reasoning_content: self.reasoning.clone(),
            tool_calls: self.tool_calls.clone(),
            ..ChatMsg::default()
        }
    }

    fn process(&mut self) {
        self.process_reasoning();

        if !self.tools_enabled {
            if !self.in_reasoning {
                self.flush_content_with_holdback();
            }
            return;
        }

        if self.format == Format::Unknown {
            self.detect_format();
        }

        match self.format {
            Format::Qwen3 => self.process_qwen3(),
            Format::DeepSeek => self.process_deepseek(),
            Format::JsonBlock => self.process_json_block(),
            Format::DirectJson => self.process_direct_json(),
            Format::Unknown => {
                if !self.in_reasoning {
                    self.flush_content_with_holdback();
                }
            }
        }
    }

    /// Extract thinking blocks from the front of the buffer.
    ///
    /// Text before an opening marker flushes to content; text between the
    /// markers (or to end-of-buffer while unclosed) accumulates as
    /// reasoning. A partial close marker at the buffer end is held back so
    /// it can match once completed by the next chunk.
    fn process_reasoning(&mut self) {
        loop {
            if let Some(mi) = self.open_marker {
                let (_, end_tag) = THINKING_MARKERS[mi];
                if let Some(end) = self.buffer.find(end_tag) {
                    self.reasoning.push_str(&self.buffer[..end]);
                    self.buffer.drain(..end + end_tag.len());
                    self.in_reasoning = false;
                    self.thinking_forced_open = false;
                    self.open_marker = None;
                    continue;
                }
                let hold = partial_suffix_holdback(&self.buffer, &[end_tag]);
                let take = self.buffer.len() - hold;
                self.reasoning.push_str(&self.buffer[..take]);
                self.buffer.drain(..take);
                return;
            }

            let Some((pos, mi)) = earliest_thinking_start(&self.buffer) else {
                return;
            };
            let (start_tag, _) = THINKING_MARKERS[mi];
            self.content.push_str(&self.buffer[..pos]);
            self.buffer.drain(..pos + start_tag.len());
            self.in_reasoning = true;
            self.thinking_forced_open = true;
            self.open_marker = Some(mi);
        }
    }

    /// First confident marker wins; the choice is stable for the request
    fn detect_format(&mut self) {
        if self.buffer.contains(QWEN3_START) {
            self.format = Format::Qwen3;
        } else if self.buffer.contains(DEEPSEEK_START) {
            self.format = Format::DeepSeek;
        } else if self.buffer.contains(JSON_BLOCK_START) {
            self.format = Format::JsonBlock;
        } else if (self.buffer.contains("{\"name\"") || self.buffer.contains("{ \"name\""))
            && self.buffer.contains("\"arguments\"")
        {
            self.format = Format::DirectJson;
        }
    }

    fn process_qwen3(&mut self) {
        let rule = Rule::seq(vec![
            Rule::literal(QWEN3_START),
            Rule::capture("json", Rule::until(QWEN3_END, false)),
            Rule::literal(QWEN3_END),
        ]);
        while let Some(start) = self.buffer.find(QWEN3_START) {
            self.content.push_str(&self.buffer[..start]);
            self.buffer.drain(..start);

            match rule.parse(&self.buffer, 0) {
                Some(m) => {
                    let payload = m.captures.get("json").cloned().unwrap_or_default();
                    self.push_tool_calls(&payload);
                    self.buffer.drain(..m.end);
                    self.in_tool_call = false;
                }
                None => {
                    // End marker not in the buffer yet.
                    self.in_tool_call = true;
                    return;
                }
            }
        }
        self.flush_content_with_holdback();
    }

    fn process_deepseek(&mut self) {
        let rule = Rule::seq(vec![
            Rule::literal(DEEPSEEK_START),
            Rule::capture("calls", Rule::until(DEEPSEEK_END, false)),
            Rule::literal(DEEPSEEK_END),
        ]);
        while let Some(start) = self.buffer.find(DEEPSEEK_START) {
            self.content.push_str(&self.buffer[..start]);
            self.buffer.drain(..start);

            match rule.parse(&self.buffer, 0) {
                Some(m) => {
                    let payload = m.captures.get("calls").cloned().unwrap_or_default();
                    for part in payload.split(DEEPSEEK_SEP) {
                        self.push_tool_calls(part);
                    }
                    self.buffer.drain(..m.end);
                    self.in_tool_call = false;
                }
                None => {
                    self.in_tool_call = true;
                    return;
                }
            }
        }
        self.flush_content_with_holdback();
    }

    fn process_json_block(&mut self) {
        let rule = Rule::seq(vec![
            Rule::literal(JSON_BLOCK_START),
            Rule::optional(Rule::literal("\n")),
            Rule::capture("json", Rule::until(JSON_BLOCK_END, false)),
            Rule::literal(JSON_BLOCK_END),
        ]);
        while let Some(start) = self.buffer.find(JSON_BLOCK_START) {
            self.content.push_str(&self.buffer[..start]);
            self.buffer.drain(..start);

            match rule.parse(&self.buffer, 0) {
                Some(m) => {
                    let payload = m.captures.get("json").cloned().unwrap_or_default();
                    self.push_tool_calls(&payload);
                    self.buffer.drain(..m.end);
                    self.in_tool_call = false;
                }
                None => {
                    self.in_tool_call = true;
                    return;
                }
            }
        }
        self.flush_content_with_holdback();
    }

    fn process_direct_json(&mut self) {
        while let Some(start) = self.buffer.find('{') {
            self.content.push_str(&self.buffer[..start]);
            self.buffer.drain(..start);

            match matching_brace(&self.buffer) {
                Some(end) => {
                    let object: String = self.buffer.drain(..end + 1).collect();
                    let before = self.tool_calls.len();
                    self.push_tool_calls(&object);
                    if self.tool_calls.len() == before {
                        // Balanced JSON that is not a tool call is content.
                        self.content.push_str(&object);
                    }
                    self.in_tool_call = false;
                }
                None => {
                    self.in_tool_call = true;
                    return;
                }
            }
        }
        self.flush_content_with_holdback();
    }

    /// Parse a payload into tool calls, accepting every shape in the
    /// OpenAI-ish wild: bare objects, `function` nesting, `parameters`
    /// aliasing, and `tool_calls` arrays
    fn push_tool_calls(&mut self, payload: &str) {
        let trimmed = payload.trim();
        if !trimmed.starts_with('{') {
            return;
        }
        let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
            return;
        };
        if let Some(arr) = value.get("tool_calls").and_then(Value::as_array) {
            for item in arr {
                if let Some(tc) = self.normalize_tool_call(item) {
                    self.tool_calls.push(tc);
                }
            }
        } else if let Some(tc) = self.normalize_tool_call(&value) {
            self.tool_calls.push(tc);
        }
    }

    /// Normalize one JSON value to `{id, name, arguments}`
    fn normalize_tool_call(&mut self, value: &Value) -> Option<ToolCall> {
        let (holder, id_holder) = match value.get("function") {
            Some(func) if func.is_object() => (func, value),
            _ => (value, value),
        };

        let name = holder.get("name")?.as_str()?.to_string();
        if name.is_empty() {
            return None;
        }

        let arguments = match holder.get("arguments") {
            Some(Value::String(s)) => s.clone(),
            Some(v @ Value::Object(_)) => v.to_string(),
            _ => match holder.get("parameters") {
                Some(v @ Value::Object(_)) => v.to_string(),
                _ => String::new(),
            },
        };

        let id = id_holder
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| {
                let id = generate_tool_call_id(Some(self.tool_call_index));
                self.tool_call_index += 1;
                id
            });

        Some(ToolCall {
            id,
            name,
            arguments,
            is_complete: true,
        })
    }

    /// Move the buffer to content, keeping back any suffix that could be
    /// the beginning of a marker split across chunks
    fn flush_content_with_holdback(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let mut markers: Vec<&str> = vec![QWEN3_START, DEEPSEEK_START, JSON_BLOCK_START];
        for (start, _) in THINKING_MARKERS {
            markers.push(start);
        }
        let hold = partial_suffix_holdback(&self.buffer, &markers);
        let take = self.buffer.len() - hold;
        self.content.push_str(&self.buffer[..take]);
        self.buffer.drain(..take);
    }
}

/// Byte position of the earliest thinking start marker, with its index
fn earliest_thinking_start(buffer: &str) -> Option<(usize, usize)> {
    THINKING_MARKERS
        .iter()
        .enumerate()
        .filter_map(|(mi, (start, _))| buffer.find(start).map(|pos| (pos, mi)))
        .min_by_key(|&(pos, _)| pos)
}

/// Length of the longest buffer suffix that is a proper prefix of any
/// marker. Those bytes must stay buffered: the rest of the marker may
/// arrive in the next chunk.
fn partial_suffix_holdback(buffer: &str, markers: &[&str]) -> usize {
    let mut hold = 0;
    for marker in markers {
        // Full occurrences are handled by the dialect passes; only proper
        // prefixes matter here.
        for (idx, _) in marker.char_indices().skip(1) {
            let prefix = &marker[..idx];
            if prefix.len() > hold && buffer.ends_with(prefix) {
                hold = prefix.len();
            }
        }
    }
    hold
}

/// Find the byte index of the `}` closing the object that starts at byte 0,
/// respecting strings and backslash escapes
fn matching_brace(buffer: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;
    for (idx, c) in buffer.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        match c {
            '\\' if in_string => escape = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(parser: &mut StreamingToolCallParser, chunks: &[&str]) -> ChatMsg {
        for chunk in chunks {
            parser.feed(chunk);
        }
        parser.finalize()
    }

    #[test]
    fn test_plain_content_passes_through() {
        let mut parser = StreamingToolCallParser::new(true);
        let msg = feed_all(&mut parser, &["hello ", "world"]);
        assert_eq!(msg.content, "hello world");
        assert!(msg.tool_calls.is_empty());
        assert!(msg.reasoning_content.is_empty());
    }

    #[test]
    fn test_qwen3_complete_block() {
        let mut parser = StreamingToolCallParser::new(true);
        let msg = feed_all(
            &mut parser,
            &[r#"<tool_call>{"name":"add","arguments":{"a":1,"b":2}}</tool_call>"#],
        );
        assert_eq!(msg.tool_calls.len(), 1);
        let tc = &msg.tool_calls[0];
        assert_eq!(tc.name, "add");
        assert_eq!(tc.arguments, r#"{"a":1,"b":2}"#);
        assert!(tc.is_complete);
        assert!(tc.id.starts_with("call_"));
        assert_eq!(parser.format(), Format::Qwen3);
    }

    #[test]
    fn test_qwen3_split_across_chunks() {
        let mut parser = StreamingToolCallParser::new(true);
        parser.feed("Result: <tool_call>{\"name\":\"f\",");
        assert!(parser.is_parsing_tool_call());
        assert_eq!(parser.current_message().content, "Result: ");
        parser.feed("\"arguments\":{}}</tool_call>");
        let msg = parser.finalize();
        assert_eq!(msg.content, "Result: ");
        assert_eq!(msg.tool_calls.len(), 1);
        assert!(!parser.is_parsing_tool_call());
    }

    #[test]
    fn test_qwen3_marker_split_mid_marker() {
        let mut parser = StreamingToolCallParser::new(true);
        parser.feed("text<tool_ca");
        // Partial marker held back, not flushed as content.
        assert_eq!(parser.current_message().content, "text");
        parser.feed("ll>{\"name\":\"g\",\"arguments\":{}}</tool_call>");
        let msg = parser.finalize();
        assert_eq!(msg.content, "text");
        assert_eq!(msg.tool_calls.len(), 1);
        assert_eq!(msg.tool_calls[0].name, "g");
    }

    #[test]
    fn test_qwen3_multiple_blocks_index_ids() {
        let mut parser = StreamingToolCallParser::new(true);
        let msg = feed_all(
            &mut parser,
            &[
                "<tool_call>{\"name\":\"a\",\"arguments\":{}}</tool_call>",
                "<tool_call>{\"name\":\"b\",\"arguments\":{}}</tool_call>",
            ],
        );
        assert_eq!(msg.tool_calls.len(), 2);
        assert!(msg.tool_calls[0].id.ends_with("_0"));
        assert!(msg.tool_calls[1].id.ends_with("_1"));
        assert_ne!(msg.tool_calls[0].id, msg.tool_calls[1].id);
    }

    #[test]
    fn test_deepseek_multiple_calls() {
        let mut parser = StreamingToolCallParser::new(true);
        let input = format!(
            "{}{}{}{}{}",
            "<｜tool▁calls▁begin｜>",
            r#"{"name":"first","arguments":{"x":1}}"#,
            "<｜tool▁sep｜>",
            r#"{"name":"second","arguments":{"y":2}}"#,
            "<｜tool▁calls▁end｜>"
        );
        let msg = feed_all(&mut parser, &[&input]);
        assert_eq!(parser.format(), Format::DeepSeek);
        assert_eq!(msg.tool_calls.len(), 2);
        assert_eq!(msg.tool_calls[0].name, "first");
        assert_eq!(msg.tool_calls[1].name, "second");
    }

    #[test]
    fn test_json_block_with_newline() {
        let mut parser = StreamingToolCallParser::new(true);
        let msg = feed_all(
            &mut parser,
            &["```json\n{\"name\":\"lookup\",\"arguments\":{\"q\":\"rust\"}}\n```"],
        );
        assert_eq!(parser.format(), Format::JsonBlock);
        assert_eq!(msg.tool_calls.len(), 1);
        assert_eq!(msg.tool_calls[0].name, "lookup");
    }

    #[test]
    fn test_direct_json_brace_counting() {
        let mut parser = StreamingToolCallParser::new(true);
        let msg = feed_all(
            &mut parser,
            &[r#"{"name":"calc","arguments":{"expr":"{1+2}","nested":{"deep":true}}}"#],
        );
        assert_eq!(parser.format(), Format::DirectJson);
        assert_eq!(msg.tool_calls.len(), 1);
        assert_eq!(msg.tool_calls[0].name, "calc");
        assert!(msg.tool_calls[0].arguments.contains("nested"));
    }

    #[test]
    fn test_direct_json_string_aware_braces() {
        // Braces and escaped quotes inside strings must not confuse the scan.
        let input = r#"{"name":"echo","arguments":{"text":"say \"}\" loudly"}}"#;
        let mut parser = StreamingToolCallParser::new(true);
        let msg = feed_all(&mut parser, &[input]);
        assert_eq!(msg.tool_calls.len(), 1);
        assert!(msg.tool_calls[0].arguments.contains("loudly"));
    }

    #[test]
    fn test_direct_json_incomplete_waits() {
        let mut parser = StreamingToolCallParser::new(true);
        parser.feed(r#"{"name":"f","arguments":{"a":"#);
        assert!(parser.is_parsing_tool_call());
        parser.feed("1}}");
        parser.feed("");
        let msg = parser.finalize();
        assert_eq!(msg.tool_calls.len(), 1);
    }

    #[test]
    fn test_thinking_extraction() {
        let mut parser = StreamingToolCallParser::new(true);
        let msg = feed_all(&mut parser, &["<think>step one</think>answer"]);
        assert_eq!(msg.reasoning_content, "step one");
        assert_eq!(msg.content, "answer");
    }

    #[test]
    fn test_thinking_marker_variants() {
        for (start, end) in [
            ("<think>", "</think>"),
            ("<thinking>", "</thinking>"),
            ("<｜thinking｜>", "<｜/thinking｜>"),
        ] {
            let mut parser = StreamingToolCallParser::new(false);
            let input = format!("{start}idea{end}done");
            let msg = feed_all(&mut parser, &[&input]);
            assert_eq!(msg.reasoning_content, "idea", "marker {start}");
            assert_eq!(msg.content, "done", "marker {start}");
        }
    }

    #[test]
    fn test_thinking_forced_open() {
        let mut parser = StreamingToolCallParser::new(true);
        parser.feed("<think>still going");
        assert!(parser.thinking_forced_open());
        let msg = parser.finalize();
        assert_eq!(msg.reasoning_content, "still going");
        assert!(msg.content.is_empty());
    }

    #[test]
    fn test_thinking_close_split_across_chunks() {
        let mut parser = StreamingToolCallParser::new(true);
        parser.feed("<think>abc</th");
        parser.feed("ink>visible");
        let msg = parser.finalize();
        assert_eq!(msg.reasoning_content, "abc");
        assert_eq!(msg.content, "visible");
    }

    #[test]
    fn test_content_before_thinking_flushes_to_content() {
        let mut parser = StreamingToolCallParser::new(true);
        let msg = feed_all(&mut parser, &["pre<think>mid</think>post"]);
        assert_eq!(msg.content, "prepost");
        assert_eq!(msg.reasoning_content, "mid");
    }

    #[test]
    fn test_thinking_then_tool_call() {
        let mut parser = StreamingToolCallParser::new(true);
        let msg = feed_all(
            &mut parser,
            &[
                "<think>Let me compute</think>",
                "Result: ",
                "<tool_call>{\"name\":\"add\",\"arguments\":{\"a\":1,\"b\":2}}</tool_call>",
            ],
        );
        assert_eq!(msg.reasoning_content, "Let me compute");
        assert_eq!(msg.content, "Result: ");
        assert_eq!(msg.tool_calls.len(), 1);
        assert_eq!(msg.tool_calls[0].arguments, r#"{"a":1,"b":2}"#);
    }

    #[test]
    fn test_tools_disabled_keeps_markers_as_content() {
        let mut parser = StreamingToolCallParser::new(false);
        let input = r#"<tool_call>{"name":"f","arguments":{}}</tool_call>"#;
        let msg = feed_all(&mut parser, &[input]);
        assert!(msg.tool_calls.is_empty());
        assert_eq!(msg.content, input);
    }

    #[test]
    fn test_format_sticky_once_detected() {
        let mut parser = StreamingToolCallParser::new(true);
        parser.feed("<tool_call>{\"name\":\"f\",\"arguments\":{}}</tool_call>");
        assert_eq!(parser.format(), Format::Qwen3);
        // A later DeepSeek-looking marker does not switch dialects.
        parser.feed("<｜tool▁calls▁begin｜>ignored");
        assert_eq!(parser.format(), Format::Qwen3);
    }

    #[test]
    fn test_function_nested_shape_preserves_id() {
        let mut parser = StreamingToolCallParser::new(true);
        let input = r#"<tool_call>{"id":"call_custom","function":{"name":"f","arguments":{"k":1}},"arguments":"ignored"}</tool_call>"#;
        let msg = feed_all(&mut parser, &[input]);
        assert_eq!(msg.tool_calls.len(), 1);
        assert_eq!(msg.tool_calls[0].id, "call_custom");
        assert_eq!(msg.tool_calls[0].name, "f");
        assert_eq!(msg.tool_calls[0].arguments, r#"{"k":1}"#);
    }

    #[test]
    fn test_string_arguments_used_verbatim() {
        let mut parser = StreamingToolCallParser::new(true);
        let input = r#"<tool_call>{"name":"f","arguments":"{\"raw\":true}"}</tool_call>"#;
        let msg = feed_all(&mut parser, &[input]);
        assert_eq!(msg.tool_calls[0].arguments, r#"{"raw":true}"#);
    }

    #[test]
    fn test_parameters_alias() {
        let mut parser = StreamingToolCallParser::new(true);
        let input = r#"<tool_call>{"name":"f","parameters":{"p":1}}</tool_call>"#;
        let msg = feed_all(&mut parser, &[input]);
        assert_eq!(msg.tool_calls[0].arguments, r#"{"p":1}"#);
    }

    #[test]
    fn test_tool_calls_array_shape() {
        let mut parser = StreamingToolCallParser::new(true);
        let input = r#"<tool_call>{"tool_calls":[{"function":{"name":"a","arguments":{}}},{"function":{"name":"b","arguments":{}}}]}</tool_call>"#;
        let msg = feed_all(&mut parser, &[input]);
        assert_eq!(msg.tool_calls.len(), 2);
        assert_eq!(msg.tool_calls[0].name, "a");
        assert_eq!(msg.tool_calls[1].name, "b");
    }

    #[test]
    fn test_malformed_marker_payload_dropped() {
        let mut parser = StreamingToolCallParser::new(true);
        let msg = feed_all(&mut parser, &["<tool_call>not json</tool_call>after"]);
        assert!(msg.tool_calls.is_empty());
        assert_eq!(msg.content, "after");
    }

    #[test]
    fn test_direct_json_non_tool_object_becomes_content() {
        let mut parser = StreamingToolCallParser::new(true);
        // Detection needs name+arguments substrings; a later balanced object
        // without a usable name falls back to content.
        parser.feed(r#"{"name":"f","arguments":{}}"#);
        parser.feed(r#"{"just":"data"}"#);
        let msg = parser.finalize();
        assert_eq!(msg.tool_calls.len(), 1);
        assert_eq!(msg.content, r#"{"just":"data"}"#);
    }

    #[test]
    fn test_finalize_flushes_partial_marker_as_content() {
        let mut parser = StreamingToolCallParser::new(true);
        parser.feed("tail<tool_ca");
        let msg = parser.finalize();
        assert_eq!(msg.content, "tail<tool_ca");
    }

    #[test]
    fn test_reset_clears_state() {
        let mut parser = StreamingToolCallParser::new(true);
        parser.feed("<tool_call>{\"name\":\"f\",\"arguments\":{}}</tool_call>");
        parser.reset();
        assert_eq!(parser.format(), Format::Unknown);
        assert!(!parser.has_tool_calls());
        assert!(parser.current_message().is_empty());
    }

    // ------------------------------------------------------------------
    // Diff computation
    // ------------------------------------------------------------------

    #[test]
    fn test_diff_content_append() {
        let prev = ChatMsg {
            content: "hel".to_string(),
            ..ChatMsg::assistant()
        };
        let new = ChatMsg {
            content: "hello".to_string(),
            ..ChatMsg::assistant()
        };
        let diffs = ChatMsgDiff::compute(&prev, &new);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].content_delta, "lo");
    }

    #[test]
    fn test_diff_non_extension_emits_nothing() {
        let prev = ChatMsg {
            content: "abc".to_string(),
            ..ChatMsg::assistant()
        };
        let new = ChatMsg {
            content: "xyz".to_string(),
            ..ChatMsg::assistant()
        };
        assert!(ChatMsgDiff::compute(&prev, &new).is_empty());
    }

    #[test]
    fn test_diff_new_tool_call_is_full_object() {
        let prev = ChatMsg::assistant();
        let mut new = ChatMsg::assistant();
        new.tool_calls.push(ToolCall {
            id: "call_x".to_string(),
            name: "f".to_string(),
            arguments: "{}".to_string(),
            is_complete: true,
        });
        let diffs = ChatMsgDiff::compute(&prev, &new);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].tool_call_index, Some(0));
        assert_eq!(diffs[0].tool_call_delta.name, "f");
    }

    #[test]
    fn test_diff_argument_growth_on_last_call() {
        let mut prev = ChatMsg::assistant();
        prev.tool_calls.push(ToolCall {
            id: "call_x".to_string(),
            name: "f".to_string(),
            arguments: "{\"a\"".to_string(),
            is_complete: false,
        });
        let mut new = prev.clone();
        new.tool_calls[0].arguments = "{\"a\":1}".to_string();
        let diffs = ChatMsgDiff::compute(&prev, &new);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].tool_call_index, Some(0));
        assert_eq!(diffs[0].tool_call_delta.arguments, ":1}");
        // Unchanged id is not re-sent.
        assert!(diffs[0].tool_call_delta.id.is_empty());
    }

    #[test]
    fn test_diff_delta_json_shape() {
        let diff = ChatMsgDiff {
            tool_call_index: Some(0),
            tool_call_delta: ToolCall {
                id: "call_1".to_string(),
                name: "add".to_string(),
                arguments: "{\"a\":1}".to_string(),
                is_complete: true,
            },
            ..ChatMsgDiff::default()
        };
        let delta = diff.to_delta();
        let tc = &delta["tool_calls"][0];
        assert_eq!(tc["index"], 0);
        assert_eq!(tc["id"], "call_1");
        assert_eq!(tc["type"], "function");
        assert_eq!(tc["function"]["name"], "add");
        assert_eq!(tc["function"]["arguments"], "{\"a\":1}");
    }

    #[test]
    fn test_diff_tracker_emits_monotone_sequence() {
        let mut parser = StreamingToolCallParser::new(true);
        let mut tracker = DiffTracker::new();
        let mut reasoning = String::new();
        let mut content = String::new();

        for chunk in [
            "<think>Let me compute</think>",
            "Result: ",
            "<tool_call>{\"name\":\"add\",\"arguments\":{\"a\":1,\"b\":2}}</tool_call>",
        ] {
            parser.feed(chunk);
            for diff in tracker.update(&parser.current_message()) {
                reasoning.push_str(&diff.reasoning_delta);
                content.push_str(&diff.content_delta);
            }
        }
        let final_msg = parser.finalize();
        let final_diffs = tracker.update(&final_msg);

        assert_eq!(reasoning, "Let me compute");
        assert_eq!(content, "Result: ");
        assert!(final_diffs.is_empty());
        assert_eq!(tracker.current().tool_calls.len(), 1);
    }

    #[test]
    fn test_chat_msg_to_json_tool_calls_null_content() {
        let mut msg = ChatMsg::assistant();
        msg.tool_calls.push(ToolCall {
            id: "call_1".to_string(),
            name: "f".to_string(),
            arguments: "{}".to_string(),
            is_complete: true,
        });
        let j = msg.to_json();
        assert!(j["content"].is_null());
        assert_eq!(j["tool_calls"][0]["function"]["name"], "f");
    }

    #[test]
    fn test_generate_tool_call_id_shape() {
        let id = generate_tool_call_id(None);
        assert_eq!(id.len(), "call_".len() + 24);
        assert!(id.starts_with("call_"));
        assert!(id["call_".len()..]
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));

        let indexed = generate_tool_call_id(Some(3));
        assert!(indexed.ends_with("_3"));
    }

    #[test]
    fn test_matching_brace_helper() {
        assert_eq!(matching_brace("{}"), Some(1));
        assert_eq!(matching_brace("{\"a\":{\"b\":1}}"), Some(12));
        assert_eq!(matching_brace("{\"s\":\"}\"}"), Some(8));
        assert_eq!(matching_brace("{open"), None);
    }

    #[test]
    fn test_partial_suffix_holdback_helper() {
        assert_eq!(partial_suffix_holdback("abc<tool", &[QWEN3_START]), 5);
        assert_eq!(partial_suffix_holdback("abc", &[QWEN3_START]), 0);
        // Full marker present is not a partial suffix.
        assert_eq!(partial_suffix_holdback("x<think", &["<think>"]), 6);
        assert_eq!(partial_suffix_holdback("x<", &["<think>"]), 1);
    }
}
