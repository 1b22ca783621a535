// ABOUTME: Output records produced by a backend during one query.
// ABOUTME: Wraps the raw JSON object unchanged and classifies it by its type discriminant.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of an output record, derived from its `type`/`subtype` fields
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// `system` record with `subtype: init`, carries the continuation token
    Init,
    /// Any other `system` record
    System,
    /// Assistant content (text, thinking)
    Assistant,
    /// Assistant message that invokes one or more tools
    ToolUse,
    /// Tool result fed back to the assistant (`user` message with tool_result blocks)
    ToolResult,
    /// Backend-reported error (`error` record or `result` with `is_error`)
    Error,
    /// Final completion record
    Result,
    /// Anything with an unrecognised discriminant
    Other,
}

/// One unit of backend output.
///
/// The raw JSON is kept exactly as the backend produced it; `kind` is
/// computed once at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub struct OutputRecord {
    kind: RecordKind,
    raw: Value,
}

impl OutputRecord {
    /// Classify a parsed JSON value
    pub fn new(raw: Value) -> Self {
        let kind = classify(&raw);
        Self { kind, raw }
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// The record exactly as emitted by the backend
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn into_raw(self) -> Value {
        self.raw
    }

    pub fn is_init(&self) -> bool {
        self.kind == RecordKind::Init
    }

    /// Continuation token carried by an init record
    pub fn session_id(&self) -> Option<&str> {
        if !self.is_init() {
            return None;
        }
        self.raw.get("session_id").and_then(|s| s.as_str())
    }

    /// Model name announced by an init record
    pub fn model(&self) -> Option<&str> {
        self.raw.get("model").and_then(|m| m.as_str())
    }

    /// Concatenated text blocks of an assistant message
    pub fn text(&self) -> Option<String> {
        match self.kind {
            RecordKind::Assistant | RecordKind::ToolUse => {
                let mut text = String::new();
                for block in content_blocks(&self.raw) {
                    if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                        if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                            text.push_str(t);
                        }
                    }
                }
                if text.is_empty() {
                    None
                } else {
                    Some(text)
                }
            }
            RecordKind::Result => self
                .raw
                .get("result")
                .and_then(|r| r.as_str())
                .map(str::to_string),
            _ => None,
        }
    }

    /// Tool invocations in an assistant message
    pub fn tool_uses(&self) -> Vec<ToolUse> {
        if self.kind != RecordKind::ToolUse {
            return Vec::new();
        }
        content_blocks(&self.raw)
            .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("tool_use"))
            .map(|b| ToolUse {
                id: b
                    .get("id")
                    .and_then(|i| i.as_str())
                    .unwrap_or("unknown")
                    .to_string(),
                name: b
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or("unknown")
                    .to_string(),
                input: b.get("input").cloned().unwrap_or(Value::Null),
            })
            .collect()
    }

    /// Error message of an error record
    pub fn error_message(&self) -> Option<String> {
        if self.kind != RecordKind::Error {
            return None;
        }
        let raw = &self.raw;
        raw.get("error")
            .and_then(|e| {
                e.as_str()
                    .map(str::to_string)
                    .or_else(|| e.get("message").and_then(|m| m.as_str()).map(str::to_string))
            })
            .or_else(|| raw.get("result").and_then(|r| r.as_str()).map(str::to_string))
            .or_else(|| raw.get("subtype").and_then(|s| s.as_str()).map(str::to_string))
    }

    /// Token usage and cost from a completion record
    pub fn usage(&self) -> Option<Usage> {
        match self.kind {
            RecordKind::Result | RecordKind::Error => extract_usage(&self.raw),
            _ => None,
        }
    }
}

impl From<Value> for OutputRecord {
    fn from(raw: Value) -> Self {
        Self::new(raw)
    }
}

impl From<OutputRecord> for Value {
    fn from(record: OutputRecord) -> Self {
        record.raw
    }
}

/// A tool call found inside an assistant message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Token usage and cost tracking
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    /// Input tokens consumed
    pub input_tokens: u64,
    /// Output tokens generated
    pub output_tokens: u64,
    /// Tokens read from cache
    pub cache_read_tokens: Option<u64>,
    /// Tokens written to cache
    pub cache_write_tokens: Option<u64>,
    /// Total cost in USD
    pub cost_usd: Option<f64>,
}

fn classify(raw: &Value) -> RecordKind {
    let Some(event_type) = raw.get("type").and_then(|t| t.as_str()) else {
        return RecordKind::Other;
    };

    match event_type {
        "system" => {
            if raw.get("subtype").and_then(|s| s.as_str()) == Some("init") {
                RecordKind::Init
            } else {
                RecordKind::System
            }
        }
        "assistant" => {
            let has_tool_use = content_blocks(raw)
                .any(|b| b.get("type").and_then(|t| t.as_str()) == Some("tool_use"));
            if has_tool_use {
                RecordKind::ToolUse
            } else {
                RecordKind::Assistant
            }
        }
        "user" => {
            let has_tool_result = content_blocks(raw)
                .any(|b| b.get("type").and_then(|t| t.as_str()) == Some("tool_result"));
            if has_tool_result {
                RecordKind::ToolResult
            } else {
                RecordKind::Other
            }
        }
        "result" => {
            let is_error = raw
                .get("is_error")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if is_error {
                RecordKind::Error
            } else {
                RecordKind::Result
            }
        }
        "error" => RecordKind::Error,
        _ => RecordKind::Other,
    }
}

fn content_blocks(raw: &Value) -> impl Iterator<Item = &Value> {
    raw.get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_array())
        .into_iter()
        .flatten()
}

fn extract_usage(json: &Value) -> Option<Usage> {
    let mut usage = Usage::default();
    let mut found_usage = false;

    if let Some(cost) = json.get("total_cost_usd").and_then(|v| v.as_f64()) {
        usage.cost_usd = Some(cost);
        found_usage = true;
    }

    if let Some(usage_obj) = json.get("usage") {
        usage.input_tokens = usage_obj
            .get("input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        usage.output_tokens = usage_obj
            .get("output_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        usage.cache_read_tokens = usage_obj
            .get("cache_read_input_tokens")
            .and_then(|v| v.as_u64());
        usage.cache_write_tokens = usage_obj
            .get("cache_creation_input_tokens")
            .and_then(|v| v.as_u64());
        found_usage = true;
    }

    if found_usage {
        Some(usage)
    } else {
        None
    }
}
