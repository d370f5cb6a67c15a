//! Streaming envelopes: the wire records emitted for one run of the
//! execute pipeline and forwarded (re-sequenced) by the run-streaming
//! endpoint.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::now_iso;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    StateChange,
    Event,
    Action,
    ToolResult,
    Artifact,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Producer {
    System,
    Model,
}

/// One wire record. `sequence` is strictly monotonic within a run on the
/// producer side and rewritten per-response by the streaming endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub run_id: String,
    pub sequence: u64,
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub phase: String,
    pub producer: Producer,
    pub payload: Value,
}

impl Envelope {
    pub fn new(
        run_id: &str,
        sequence: u64,
        kind: EnvelopeKind,
        phase: &str,
        producer: Producer,
        payload: Value,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            sequence,
            timestamp: now_iso(),
            kind,
            phase: phase.to_string(),
            producer,
            payload,
        }
    }

    pub fn state_change(run_id: &str, sequence: u64, phase: &str, from: &str, to: &str) -> Self {
        Self::new(
            run_id,
            sequence,
            EnvelopeKind::StateChange,
            phase,
            Producer::System,
            serde_json::json!({"from": from, "to": to}),
        )
    }

    pub fn system_event(
        run_id: &str,
        sequence: u64,
        phase: &str,
        level: &str,
        message: &str,
        data: Option<Value>,
    ) -> Self {
        let mut payload = serde_json::json!({"level": level, "message": message});
        if let Some(data) = data {
            payload["data"] = data;
        }
        Self::new(run_id, sequence, EnvelopeKind::Event, phase, Producer::System, payload)
    }

    pub fn model_event(run_id: &str, sequence: u64, phase: &str, payload: Value) -> Self {
        Self::new(run_id, sequence, EnvelopeKind::Event, phase, Producer::Model, payload)
    }

    pub fn action(
        run_id: &str,
        sequence: u64,
        phase: &str,
        action_id: &str,
        step_id: &str,
        tool: &str,
        arguments: Value,
    ) -> Self {
        Self::new(
            run_id,
            sequence,
            EnvelopeKind::Action,
            phase,
            Producer::Model,
            serde_json::json!({
                "action_id": action_id,
                "step_id": step_id,
                "tool": tool,
                "arguments": arguments,
                "idempotency_key": action_idempotency_key(step_id, tool, action_id),
            }),
        )
    }

    pub fn tool_result(
        run_id: &str,
        sequence: u64,
        phase: &str,
        action_id: &str,
        ok: bool,
        output: Value,
    ) -> Self {
        Self::new(
            run_id,
            sequence,
            EnvelopeKind::ToolResult,
            phase,
            Producer::Model,
            serde_json::json!({"action_id": action_id, "ok": ok, "output": output}),
        )
    }

    pub fn artifact(
        run_id: &str,
        sequence: u64,
        phase: &str,
        name: &str,
        format: &str,
        content: Value,
    ) -> Self {
        Self::new(
            run_id,
            sequence,
            EnvelopeKind::Artifact,
            phase,
            Producer::System,
            serde_json::json!({"name": name, "format": format, "content": content}),
        )
    }

    pub fn error(run_id: &str, sequence: u64, phase: &str, code: &str, message: &str) -> Self {
        Self::new(
            run_id,
            sequence,
            EnvelopeKind::Error,
            phase,
            Producer::System,
            serde_json::json!({"code": code, "message": message}),
        )
    }

    /// One NDJSON line, newline included.
    pub fn to_ndjson_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        line.push('\n');
        line
    }
}

/// Deterministic idempotency key for an action: derived from the
/// `(step_id, tool, action_id)` triple.
pub fn action_idempotency_key(step_id: &str, tool: &str, action_id: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(step_id.as_bytes());
    hasher.update(b"|");
    hasher.update(tool.as_bytes());
    hasher.update(b"|");
    hasher.update(action_id.as_bytes());
    format!("{:x}", hasher.finalize())[..16].to_string()
}

/// Rewrite an upstream envelope value for replay on a streamed response:
/// the wire `sequence` becomes `local_sequence` and any original sequence is
/// preserved under `payload.source_sequence`.
pub fn resequence_for_replay(mut envelope: Value, local_sequence: u64) -> Value {
    let source = envelope.get("sequence").cloned();
    envelope["sequence"] = serde_json::json!(local_sequence);
    if let Some(source) = source {
        if !envelope["payload"].is_object() {
            envelope["payload"] = serde_json::json!({});
        }
        envelope["payload"]["source_sequence"] = source;
    }
    envelope
}

/// Extract the user-visible result string from a terminal attempt output.
///
/// Preference order: the report's markdown message, the execute summary,
/// a top-level `output`, a top-level `error`; otherwise the whole object
/// serialized.
pub fn extract_user_output(output: &Value) -> String {
    let candidates = [
        output.pointer("/phase_outputs/report/message_markdown"),
        output.pointer("/phase_outputs/execute/summary"),
        output.get("output"),
        output.get("error"),
    ];
    for candidate in candidates.into_iter().flatten() {
        if let Some(s) = candidate.as_str() {
            return s.to_string();
        }
    }
    serde_json::to_string(output).unwrap_or_else(|_| "{}".to_string())
}
