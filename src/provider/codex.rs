//! Adapter for an exec-style provider that prints NDJSON progress records
//! and leaves its final answer in the captured stdout. Unlike the
//! stream-json adapter there is no distinguished terminal record; the
//! runner parses the full captured text.

use std::path::Path;

use serde_json::Value;

use super::{
    MessageItem, ModelEventKind, ModelEventPayload, ModelEventType, ProviderAdapter,
    ProviderCommand,
};

pub struct CodexAdapter {
    command: String,
}

impl CodexAdapter {
    pub fn new() -> Self {
        Self {
            command: std::env::var("CODEX_CMD").unwrap_or_else(|_| "codex".to_string()),
        }
    }
}

impl Default for CodexAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderAdapter for CodexAdapter {
    fn name(&self) -> &'static str {
        "codex"
    }

    fn build_command(
        &self,
        _phase: &str,
        prompt: &str,
        schema_path: Option<&Path>,
    ) -> ProviderCommand {
        let mut env = Vec::new();
        if let Some(path) = schema_path {
            env.push((
                "DROVER_SCHEMA_FILE".to_string(),
                path.to_string_lossy().to_string(),
            ));
        }
        ProviderCommand {
            program: self.command.clone(),
            args: vec!["exec".to_string(), "--json".to_string(), "-".to_string()],
            stdin: Some(prompt.to_string()),
            env,
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
        let text = record
            .get("text")
            .or_else(|| record.get("message"))
            .and_then(|t| t.as_str())
            .map(String::from);
        match record.get("type").and_then(|t| t.as_str()) {
            Some("agent_message") | Some("message") => sink(ModelEventPayload {
                level: "info".into(),
                model_event_kind: ModelEventKind::AssistantMessage,
                event_type: ModelEventType::Message,
                message: text.clone().map(|t| vec![MessageItem::Text { content: t }]),
                summary: text.map(|t| truncate(&t, 200)),
                result_message: None,
            }),
            Some("tool_result") => sink(ModelEventPayload {
                level: "info".into(),
                model_event_kind: ModelEventKind::AssistantToolResult,
                event_type: ModelEventType::ToolUse,
                message: Some(vec![MessageItem::ToolResult { content: record }]),
                summary: None,
                result_message: None,
            }),
            Some("result") => sink(ModelEventPayload {
                level: "info".into(),
                model_event_kind: ModelEventKind::Result,
                event_type: ModelEventType::Result,
                message: None,
                summary: None,
                result_message: text,
            }),
            _ => sink(ModelEventPayload::unknown(Some(truncate(trimmed, 200)))),
        }
    }

    fn is_terminal_stream(&self) -> bool {
        false
    }

    fn terminal_result_text(&self) -> Option<String> {
        None
    }

    fn reset(&mut self) {}
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

    fn observe_all(adapter: &mut CodexAdapter, line: &str) -> Vec<ModelEventPayload> {
        let mut out = Vec::new();
        adapter.observe_line(line, &mut |p| out.push(p));
        out
    }

    #[test]
    fn test_build_command_reads_prompt_from_stdin() {
        let adapter = CodexAdapter::new();
        let cmd = adapter.build_command("execute", "plan the work", None);
        assert_eq!(cmd.args, vec!["exec", "--json", "-"]);
        assert_eq!(cmd.stdin.as_deref(), Some("plan the work"));
        assert!(cmd.env.is_empty());
    }

    #[test]
    fn test_schema_travels_via_environment() {
        let adapter = CodexAdapter::new();
        let path = std::path::PathBuf::from("/runs/r1/execute_schema.json");
        let cmd = adapter.build_command("execute", "p", Some(path.as_path()));
        assert_eq!(
            cmd.env,
            vec![(
                "DROVER_SCHEMA_FILE".to_string(),
                "/runs/r1/execute_schema.json".to_string()
            )]
        );
    }

    #[test]
    fn test_message_record_normalizes() {
        let mut adapter = CodexAdapter::new();
        let events = observe_all(&mut adapter, r#"{"type":"agent_message","text":"thinking"}"#);
        assert_eq!(events[0].model_event_kind, ModelEventKind::AssistantMessage);
        assert_eq!(events[0].summary.as_deref(), Some("thinking"));
    }

    #[test]
    fn test_untyped_json_maps_to_unknown() {
        let mut adapter = CodexAdapter::new();
        let events = observe_all(&mut adapter, r#"{"progress":0.5}"#);
        assert_eq!(events[0].model_event_kind, ModelEventKind::Unknown);
    }

    #[test]
    fn test_full_capture_semantics() {
        let adapter = CodexAdapter::new();
        assert!(!adapter.is_terminal_stream());
        assert!(adapter.terminal_result_text().is_none());
    }
}
