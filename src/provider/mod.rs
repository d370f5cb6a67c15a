//! Provider adapters: the pluggable layer between the phase runner and the
//! external LLM command-line tools.
//!
//! An adapter knows how to build the provider command for a phase and how to
//! normalize the provider's native stream records onto one fixed payload
//! schema, so downstream consumers (event viewer, streaming endpoint) stay
//! provider-agnostic.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod claude;
pub mod codex;

/// A fully-resolved provider invocation.
#[derive(Debug, Clone)]
pub struct ProviderCommand {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelEventKind {
    AssistantMessage,
    AssistantToolResult,
    ResultSuccess,
    Result,
    System,
    User,
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelEventType {
    Message,
    ToolUse,
    Result,
    Unknown,
}

/// One item of a normalized assistant message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageItem {
    Text { content: String },
    ToolUse { content: Value },
    ToolResult { content: Value },
    Unknown { content: Value },
}

/// Normalized model-event payload: the fixed wire schema every adapter maps
/// its native stream shape onto.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEventPayload {
    pub level: String,
    pub model_event_kind: ModelEventKind,
    #[serde(rename = "type")]
    pub event_type: ModelEventType,
    pub message: Option<Vec<MessageItem>>,
    pub summary: Option<String>,
    pub result_message: Option<String>,
}

impl ModelEventPayload {
    pub fn unknown(summary: Option<String>) -> Self {
        Self {
            level: "info".to_string(),
            model_event_kind: ModelEventKind::Unknown,
            event_type: ModelEventType::Unknown,
            message: None,
            summary,
            result_message: None,
        }
    }
}

/// Contract between the phase runner and a concrete provider.
pub trait ProviderAdapter: Send {
    fn name(&self) -> &'static str;

    /// Build the command for one phase invocation. `schema_path` points to a
    /// JSON schema file inside the run directory when the plan requested a
    /// strict execute output contract.
    fn build_command(&self, phase: &str, prompt: &str, schema_path: Option<&Path>)
        -> ProviderCommand;

    /// Observe one subprocess output line; normalized payloads are handed to
    /// `sink` (zero or more per line).
    fn observe_line(&mut self, line: &str, sink: &mut dyn FnMut(ModelEventPayload));

    /// True when the provider emits its result only at the end of the stream
    /// as a distinguished record; the runner then parses
    /// `terminal_result_text()` instead of the full captured text.
    fn is_terminal_stream(&self) -> bool;

    fn terminal_result_text(&self) -> Option<String>;

    /// Clear per-phase capture state before the next invocation.
    fn reset(&mut self);
}

/// Look up an adapter by provider name.
pub fn adapter_for(name: &str) -> Option<Box<dyn ProviderAdapter>> {
    match name {
        "claude" => Some(Box::new(claude::ClaudeAdapter::new())),
        "codex" => Some(Box::new(codex::CodexAdapter::new())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_lookup() {
        assert_eq!(adapter_for("claude").unwrap().name(), "claude");
        assert_eq!(adapter_for("codex").unwrap().name(), "codex");
        assert!(adapter_for("gemini").is_none());
    }

    #[test]
    fn test_payload_serializes_with_type_rename() {
        let payload = ModelEventPayload {
            level: "info".into(),
            model_event_kind: ModelEventKind::AssistantMessage,
            event_type: ModelEventType::Message,
            message: Some(vec![MessageItem::Text {
                content: "hi".into(),
            }]),
            summary: Some("hi".into()),
            result_message: None,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["model_event_kind"], "assistant_message");
        assert_eq!(json["type"], "message");
        assert_eq!(json["message"][0]["type"], "text");
        assert_eq!(json["message"][0]["content"], "hi");
    }
}
