//! Adapter for a Claude-CLI-compatible provider speaking the `stream-json`
//! output format: one JSON record per line, tagged `assistant` / `user` /
//! `result` / `system`, with the run result carried only by the terminal
//! `result` record.

use std::path::Path;

use serde_json::Value;

use super::{
    MessageItem, ModelEventKind, ModelEventPayload, ModelEventType, ProviderAdapter,
    ProviderCommand,
};

pub struct ClaudeAdapter {
    command: String,
    skip_permissions: bool,
    terminal_result: Option<String>,
}

impl ClaudeAdapter {
    pub fn new() -> Self {
        let command = std::env::var("CLAUDE_CMD").unwrap_or_else(|_| "claude".to_string());
        // Permission prompts would hang a headless worker, so skipping them
        // is the default; set CLAUDE_SKIP_PERMISSIONS=false (or 0) to keep
        // them for supervised runs.
        let skip_permissions = !matches!(
            std::env::var("CLAUDE_SKIP_PERMISSIONS").as_deref(),
            Ok("false") | Ok("0")
        );
        Self {
            command,
            skip_permissions,
            terminal_result: None,
        }
    }
}

impl Default for ClaudeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderAdapter for ClaudeAdapter {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn build_command(
        &self,
        _phase: &str,
        prompt: &str,
        schema_path: Option<&Path>,
    ) -> ProviderCommand {
        let mut args = Vec::new();
        if self.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }
        args.push("--print".to_string());
        args.push("--output-format".to_string());
        args.push("stream-json".to_string());
        args.push("--verbose".to_string());
        if let Some(path) = schema_path {
            args.push("--json-schema".to_string());
            args.push(path.to_string_lossy().to_string());
        }
        ProviderCommand {
            program: self.command.clone(),
            args,
            stdin: Some(prompt.to_string()),
            env: Vec::new(),
        }
    }

    fn observe_line(&mut self, line: &str, sink: &mut dyn FnMut(ModelEventPayload)) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        let record: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(_) => {
                sink(ModelEventPayload::unknown(Some(truncate(trimmed, 200))));
                return;
            }
        };
        match record.get("type").and_then(|t| t.as_str()) {
            Some("assistant") => sink(normalize_assistant(&record)),
            Some("user") => {
                if let Some(payload) = normalize_tool_results(&record) {
                    sink(payload);
                } else {
                    sink(ModelEventPayload {
                        level: "info".into(),
                        model_event_kind: ModelEventKind::User,
                        event_type: ModelEventType::Message,
                        message: None,
                        summary: None,
                        result_message: None,
                    });
                }
            }
            Some("result") => {
                let text = record
                    .get("result")
                    .and_then(|r| r.as_str())
                    .unwrap_or_default()
                    .to_string();
                let is_error = record
                    .get("is_error")
                    .and_then(|e| e.as_bool())
                    .unwrap_or(false);
                let subtype = record.get("subtype").and_then(|s| s.as_str());
                self.terminal_result = Some(text.clone());
                sink(ModelEventPayload {
                    level: if is_error { "error" } else { "info" }.into(),
                    model_event_kind: if subtype == Some("success") && !is_error {
                        ModelEventKind::ResultSuccess
                    } else {
                        ModelEventKind::Result
                    },
                    event_type: ModelEventType::Result,
                    message: None,
                    summary: None,
                    result_message: Some(text),
                });
            }
            Some("system") => sink(ModelEventPayload {
                level: "info".into(),
                model_event_kind: ModelEventKind::System,
                event_type: ModelEventType::Unknown,
                message: None,
                summary: record
                    .get("subtype")
                    .and_then(|s| s.as_str())
                    .map(String::from),
                result_message: None,
            }),
            _ => sink(ModelEventPayload::unknown(Some(truncate(trimmed, 200)))),
        }
    }

    fn is_terminal_stream(&self) -> bool {
        true
    }

    fn terminal_result_text(&self) -> Option<String> {
        self.terminal_result.clone()
    }

    fn reset(&mut self) {
        self.terminal_result = None;
    }
}

fn normalize_assistant(record: &Value) -> ModelEventPayload {
    let blocks = record
        .pointer("/message/content")
        .and_then(|c| c.as_array())
        .cloned()
        .unwrap_or_default();
    let mut items = Vec::new();
    let mut summary = None;
    let mut has_tool_use = false;
    for block in blocks {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("text") => {
                let text = block
                    .get("text")
                    .and_then(|t| t.as_str())
                    .unwrap_or_default()
                    .to_string();
                if summary.is_none() && !text.trim().is_empty() {
                    summary = Some(truncate(text.trim(), 200));
                }
                items.push(MessageItem::Text { content: text });
            }
            Some("tool_use") => {
                has_tool_use = true;
                items.push(MessageItem::ToolUse { content: block });
            }
            Some("tool_result") => items.push(MessageItem::ToolResult { content: block }),
            _ => items.push(MessageItem::Unknown { content: block }),
        }
    }
    ModelEventPayload {
        level: "info".into(),
        model_event_kind: ModelEventKind::AssistantMessage,
        event_type: if has_tool_use {
            ModelEventType::ToolUse
        } else {
            ModelEventType::Message
        },
        message: Some(items),
        summary,
        result_message: None,
    }
}

/// `user` records carry tool results back to the model; surface them under
/// the assistant_tool_result kind when any are present.
fn normalize_tool_results(record: &Value) -> Option<ModelEventPayload> {
    let blocks = record
        .pointer("/message/content")
        .and_then(|c| c.as_array())?;
    let items: Vec<MessageItem> = blocks
        .iter()
        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("tool_result"))
        .map(|b| MessageItem::ToolResult { content: b.clone() })
        .collect();
    if items.is_empty() {
        return None;
    }
    Some(ModelEventPayload {
        level: "info".into(),
        model_event_kind: ModelEventKind::AssistantToolResult,
        event_type: ModelEventType::ToolUse,
        message: Some(items),
        summary: None,
        result_message: None,
    })
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        let mut end = max_len;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observe_all(adapter: &mut ClaudeAdapter, line: &str) -> Vec<ModelEventPayload> {
        let mut out = Vec::new();
        adapter.observe_line(line, &mut |p| out.push(p));
        out
    }

    #[test]
    fn test_build_command_streams_json() {
        let adapter = ClaudeAdapter::new();
        let cmd = adapter.build_command("execute", "do the thing", None);
        assert!(cmd.args.contains(&"--output-format".to_string()));
        assert!(cmd.args.contains(&"stream-json".to_string()));
        assert_eq!(cmd.stdin.as_deref(), Some("do the thing"));
    }

    #[test]
    fn test_build_command_passes_schema_path() {
        let adapter = ClaudeAdapter::new();
        let path = std::path::PathBuf::from("/runs/r1/execute_schema.json");
        let cmd = adapter.build_command("execute", "p", Some(path.as_path()));
        let idx = cmd.args.iter().position(|a| a == "--json-schema").unwrap();
        assert_eq!(cmd.args[idx + 1], "/runs/r1/execute_schema.json");
    }

    #[test]
    fn test_assistant_text_normalizes_to_message() {
        let mut adapter = ClaudeAdapter::new();
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hello world"}]}}"#;
        let events = observe_all(&mut adapter, line);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].model_event_kind, ModelEventKind::AssistantMessage);
        assert_eq!(events[0].event_type, ModelEventType::Message);
        assert_eq!(events[0].summary.as_deref(), Some("Hello world"));
    }

    #[test]
    fn test_assistant_tool_use_normalizes_to_tool_use() {
        let mut adapter = ClaudeAdapter::new();
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"tu1","name":"Bash","input":{"command":"ls"}}]}}"#;
        let events = observe_all(&mut adapter, line);
        assert_eq!(events[0].event_type, ModelEventType::ToolUse);
        match &events[0].message.as_ref().unwrap()[0] {
            MessageItem::ToolUse { content } => {
                assert_eq!(content["name"], "Bash");
                assert_eq!(content["id"], "tu1");
            }
            other => panic!("Expected ToolUse, got {:?}", other),
        }
    }

    #[test]
    fn test_user_tool_result_normalizes() {
        let mut adapter = ClaudeAdapter::new();
        let line = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"tu1","content":"ok"}]}}"#;
        let events = observe_all(&mut adapter, line);
        assert_eq!(
            events[0].model_event_kind,
            ModelEventKind::AssistantToolResult
        );
    }

    #[test]
    fn test_result_record_is_terminal() {
        let mut adapter = ClaudeAdapter::new();
        let line = r#"{"type":"result","subtype":"success","result":"{\"status\":\"succeeded\"}","is_error":false}"#;
        let events = observe_all(&mut adapter, line);
        assert_eq!(events[0].model_event_kind, ModelEventKind::ResultSuccess);
        assert!(adapter.is_terminal_stream());
        assert_eq!(
            adapter.terminal_result_text().as_deref(),
            Some("{\"status\":\"succeeded\"}")
        );
        adapter.reset();
        assert!(adapter.terminal_result_text().is_none());
    }

    #[test]
    fn test_error_result_keeps_result_kind() {
        let mut adapter = ClaudeAdapter::new();
        let line = r#"{"type":"result","subtype":"error_during_execution","result":"boom","is_error":true}"#;
        let events = observe_all(&mut adapter, line);
        assert_eq!(events[0].model_event_kind, ModelEventKind::Result);
        assert_eq!(events[0].level, "error");
    }

    #[test]
    fn test_non_json_line_maps_to_unknown() {
        let mut adapter = ClaudeAdapter::new();
        let events = observe_all(&mut adapter, "plain progress text");
        assert_eq!(events[0].model_event_kind, ModelEventKind::Unknown);
        assert_eq!(events[0].summary.as_deref(), Some("plain progress text"));
    }

    #[test]
    fn test_blank_lines_are_skipped() {
        let mut adapter = ClaudeAdapter::new();
        assert!(observe_all(&mut adapter, "   ").is_empty());
    }
}
