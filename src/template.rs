//! Chat template application and prompt-level injection
//!
//! Renders a message array (plus optional tool schemas) into the prompt
//! string the engine expects. Models that ship a Jinja chat template are
//! rendered through `minijinja`; models without one fall back to ChatML
//! (`<|im_start|>role\ncontent<|im_end|>`), the most common convention.
//!
//! When the template has no native tool support, tool schemas and
//! `response_format` JSON-mode instructions are injected as text into the
//! system message before rendering.

use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use minijinja::Environment;
use serde_json::{json, Map, Value};

use crate::error::{Result, ServerError};
use crate::toolcall::ChatMsg;

/// Tool choice mode from the `tool_choice` request field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolChoice {
    /// Model decides whether to call tools
    #[default]
    Auto,
    /// Model must call at least one tool
    Required,
    /// Model must not call tools
    None,
}

impl ToolChoice {
    /// Parse the OpenAI `tool_choice` value: a string, an object naming a
    /// specific function (treated as required), or absent
    #[must_use]
    pub fn parse(value: Option<&Value>) -> Self {
        match value {
            Some(Value::String(s)) => match s.as_str() {
                "none" => Self::None,
                "required" => Self::Required,
                _ => Self::Auto,
            },
            Some(Value::Object(_)) => Self::Required,
            _ => Self::Auto,
        }
    }

    /// Display name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Required => "required",
            Self::None => "none",
        }
    }
}

/// Capabilities detected from the chat template source
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateCaps {
    /// Template renders a `tools` variable natively
    pub supports_tools: bool,
    /// Template renders assistant `tool_calls`
    pub supports_tool_calls: bool,
    /// Template accepts a system-role message
    pub supports_system_role: bool,
    /// Template handles multiple tool calls per message
    pub supports_parallel_tool_calls: bool,
    /// Template expects `arguments` as an object rather than a string
    pub requires_object_arguments: bool,
    /// Template understands reasoning/thinking content
    pub supports_reasoning: bool,
}

impl TemplateCaps {
    /// Heuristic scan of the template source, in the spirit of the
    /// format-detection scan used for ChatML/LLaMA templates
    fn detect(source: &str) -> Self {
        Self {
            supports_tools: source.contains("tools"),
            supports_tool_calls: source.contains("tool_calls"),
            supports_system_role: source.contains("system"),
            supports_parallel_tool_calls: source.contains("parallel_tool_calls"),
            requires_object_arguments: source.contains("arguments | tojson")
                || source.contains("arguments|tojson"),
            supports_reasoning: source.contains("reasoning_content")
                || source.contains("<think>"),
        }
    }

    /// Capabilities of the ChatML fallback formatter
    fn chatml_fallback() -> Self {
        Self {
            supports_system_role: true,
            ..Self::default()
        }
    }
}

/// Renders messages (and optionally tools) to the engine prompt
pub struct ChatHandler {
    env: Option<Environment<'static>>,
    source: Option<String>,
    caps: TemplateCaps,
    bos_token: String,
    eos_token: String,
}

impl std::fmt::Debug for ChatHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatHandler")
            .field("has_template", &self.env.is_some())
            .field("caps", &self.caps)
            .finish_non_exhaustive()
    }
}

impl ChatHandler {
    /// Build a handler from an optional Jinja template source.
    ///
    /// A template that fails to parse is logged and discarded; rendering
    /// then uses the ChatML fallback, so a malformed template degrades
    /// service rather than refusing requests.
    #[must_use]
    pub fn new(template_source: Option<&str>, bos_token: &str, eos_token: &str) -> Self {
        let mut handler = Self {
            env: None,
            source: None,
            caps: TemplateCaps::chatml_fallback(),
            bos_token: bos_token.to_string(),
            eos_token: eos_token.to_string(),
        };

        if let Some(source) = template_source {
            let mut env = Environment::new();
            match env.add_template_owned("chat".to_string(), source.to_string()) {
                Ok(()) => {
                    handler.caps = TemplateCaps::detect(source);
                    handler.env = Some(env);
                    handler.source = Some(source.to_string());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "invalid chat template, using ChatML fallback");
                }
            }
        }
        handler
    }

    /// True when a model-supplied template is in use
    #[must_use]
    pub fn has_template(&self) -> bool {
        self.env.is_some()
    }

    /// Detected template capabilities
    #[must_use]
    pub fn capabilities(&self) -> &TemplateCaps {
        &self.caps
    }

    /// Template source, if any
    #[must_use]
    pub fn template_source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Render messages to the prompt string.
    ///
    /// `tools` is passed into the template only when it supports tools
    /// natively; callers inject tool text into the system message
    /// otherwise. `extra_context` merges additional template variables.
    pub fn apply(
        &self,
        messages: &[ChatMsg],
        tools: Option<&Value>,
        add_generation_prompt: bool,
        extra_context: Option<&Map<String, Value>>,
    ) -> Result<String> {
        match &self.env {
            Some(env) => {
                let tmpl = env
                    .get_template("chat")
                    .map_err(|e| ServerError::Template {
                        reason: format!("template lookup: {e}"),
                    })?;

                let mut ctx = Map::new();
                ctx.insert(
                    "messages".to_string(),
                    Value::Array(messages.iter().map(ChatMsg::to_json).collect()),
                );
                if let Some(tools) = tools {
                    ctx.insert("tools".to_string(), tools.clone());
                }
                ctx.insert("add_generation_prompt".to_string(), json!(add_generation_prompt));
                ctx.insert("bos_token".to_string(), json!(self.bos_token));
                ctx.insert("eos_token".to_string(), json!(self.eos_token));
                ctx.insert("now".to_string(), json!(unix_timestamp()));
                if let Some(extra) = extra_context {
                    for (k, v) in extra {
                        ctx.insert(k.clone(), v.clone());
                    }
                }

                tmpl.render(minijinja::Value::from_serialize(&ctx))
                    .map_err(|e| ServerError::Template {
                        reason: format!("render: {e}"),
                    })
            }
            None => Ok(self.format_chatml(messages, add_generation_prompt)),
        }
    }

    /// ChatML fallback: `<|im_start|>{role}\n{content}<|im_end|>\n`
    fn format_chatml(&self, messages: &[ChatMsg], add_generation_prompt: bool) -> String {
        let mut out = String::new();
        for msg in messages {
            let _ = write!(out, "<|im_start|>{}\n{}<|im_end|>\n", msg.role, msg.content);
        }
        if add_generation_prompt {
            out.push_str("<|im_start|>assistant\n");
        }
        out
    }
}

/// Seconds since the Unix epoch, for templates that reference `now`
fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ============================================================================
// Prompt injection
// ============================================================================

/// Build the tools block injected into the system message when the
/// template has no native tool support
#[must_use]
pub fn build_tools_prompt(tools: &[Value], tool_choice: ToolChoice) -> String {
    if tools.is_empty() {
        return String::new();
    }

    let mut out = String::new();
    out.push_str("\n\n# Tools\n\nYou have access to the following tools:\n\n");

    for tool in tools {
        if tool.get("type").and_then(Value::as_str) != Some("function") {
            continue;
        }
        let Some(func) = tool.get("function").filter(|f| f.is_object()) else {
            continue;
        };
        let name = func.get("name").and_then(Value::as_str).unwrap_or_default();
        let _ = write!(out, "## {name}\n\n");
        if let Some(desc) = func.get("description").and_then(Value::as_str) {
            if !desc.is_empty() {
                let _ = write!(out, "{desc}\n\n");
            }
        }
        if let Some(params) = func.get("parameters").filter(|p| p.is_object()) {
            let serialized = serde_json::to_string(params).unwrap_or_default();
            let _ = write!(out, "Parameters:\n```json\n{serialized}\n```\n\n");
        }
    }

    out.push_str(
        "# Tool Call Format\n\n\
         When you need to use a tool, respond with a JSON object in this exact format:\n\
         ```json\n\
         {\n  \"name\": \"tool_name\",\n  \"arguments\": { ... }\n}\n\
         ```\n\n",
    );

    out.push_str(match tool_choice {
        ToolChoice::Required => "You MUST use one of the available tools to respond.\n",
        ToolChoice::None => "Do NOT use any tools. Respond directly with text.\n",
        ToolChoice::Auto => {
            "Use a tool if it helps answer the user's question. Otherwise, respond directly.\n"
        }
    });

    out
}

/// Build the JSON-mode instruction for `response_format`
#[must_use]
pub fn build_json_mode_prompt(format_type: &str, schema: Option<&Value>) -> String {
    match format_type {
        "json_object" => "\n\nYou must respond with valid JSON only. \
                          Do not include any text outside of the JSON object."
            .to_string(),
        "json_schema" => match schema {
            Some(schema) => format!(
                "\n\nYou must respond with valid JSON that follows this schema:\n{}\n\n\
                 Do not include any text outside of the JSON object.",
                serde_json::to_string(schema).unwrap_or_default()
            ),
            None => String::new(),
        },
        _ => String::new(),
    }
}

/// Append `text` to the first system message, or prepend a new system
/// message when none exists (dropping the leading blank lines that
/// separate an injected block from prior system text)
pub fn inject_system_text(messages: &mut Vec<ChatMsg>, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(system) = messages.iter_mut().find(|m| m.role == "system") {
        system.content.push_str(text);
        return;
    }
    let system = ChatMsg {
        role: "system".to_string(),
        content: text.strip_prefix("\n\n").unwrap_or(text).to_string(),
        ..ChatMsg::default()
    };
    messages.insert(0, system);
}
