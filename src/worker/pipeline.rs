//! The phase pipeline: mode selection, the lean and full phase sequences,
//! idempotency dedup, and envelope emission for one task attempt.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::envelope::Envelope;
use crate::errors::RunnerError;
use crate::prompts::PromptLibrary;
use crate::provider::{MessageItem, ModelEventPayload, ProviderAdapter};
use crate::store::models::{Task, TaskMode};
use crate::store::now_iso;

use super::client::{GatewayClient, LeasedTask};
use super::output::extract_phase_output;
use super::process::run_provider_command;

/// What the worker reports through `/tasks/:id/complete`.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub succeeded: bool,
    pub blocked: bool,
    pub output_json: Value,
    pub final_phase: String,
    pub error_message: Option<String>,
}

/// Per-attempt mutable state threaded through the phases.
struct RunContext {
    task: Task,
    attempt_id: i64,
    run_id: String,
    run_dir: PathBuf,
    sequence: u64,
    phase_outputs: Map<String, Value>,
    mode: Value,
    dedupe: Option<Value>,
    /// tool_use id → emitted action id, for pairing tool results.
    pending_actions: HashMap<String, String>,
}

pub struct PhaseRunner<'a> {
    cfg: &'a WorkerConfig,
    client: &'a GatewayClient,
    prompts: &'a PromptLibrary,
}

impl<'a> PhaseRunner<'a> {
    pub fn new(cfg: &'a WorkerConfig, client: &'a GatewayClient, prompts: &'a PromptLibrary) -> Self {
        Self {
            cfg,
            client,
            prompts,
        }
    }

    /// Drive one attempt end to end. Never returns an error: failures are
    /// folded into a failed outcome so the caller completes exactly once.
    pub async fn run(
        &self,
        adapter: &mut Box<dyn ProviderAdapter>,
        lease: &LeasedTask,
        run_id: &str,
        run_dir: PathBuf,
    ) -> PipelineOutcome {
        let mut ctx = RunContext {
            task: lease.task.clone(),
            attempt_id: lease.attempt_id,
            run_id: run_id.to_string(),
            run_dir,
            sequence: 0,
            phase_outputs: Map::new(),
            mode: Value::Null,
            dedupe: None,
            pending_actions: HashMap::new(),
        };

        let opening = Envelope::state_change(&ctx.run_id, ctx.sequence, "runtime", "pending", "running");
        self.emit(&mut ctx, opening).await;

        match self.drive(&mut ctx, adapter).await {
            Ok(outcome) => {
                let to = if outcome.blocked {
                    "failed"
                } else if outcome.succeeded {
                    "succeeded"
                } else {
                    "failed"
                };
                let closing =
                    Envelope::state_change(&ctx.run_id, ctx.sequence, "runtime", "running", to);
                self.emit(&mut ctx, closing).await;
                outcome
            }
            Err(err) => {
                let phase = err.phase().unwrap_or("runtime").to_string();
                let message = err.to_string();
                self.post_system_event(&mut ctx, "runtime", "error", &message, None)
                    .await;
                let closing =
                    Envelope::state_change(&ctx.run_id, ctx.sequence, "runtime", "running", "failed");
                self.emit(&mut ctx, closing).await;
                PipelineOutcome {
                    succeeded: false,
                    blocked: false,
                    output_json: self.assemble_output(&ctx),
                    final_phase: phase,
                    error_message: Some(message),
                }
            }
        }
    }

    async fn drive(
        &self,
        ctx: &mut RunContext,
        adapter: &mut Box<dyn ProviderAdapter>,
    ) -> Result<PipelineOutcome, RunnerError> {
        let configured = ctx.task.declared_mode();
        let (effective, classifier_output) = match configured {
            TaskMode::Lean => (TaskMode::Lean, None),
            TaskMode::Full => (TaskMode::Full, None),
            TaskMode::Auto => {
                let prompt = self.build_prompt(ctx, "classifier", &self.prompts.classifier);
                let output = self.run_provider_phase(ctx, adapter, "classifier", &prompt, None).await?;
                (effective_mode(&output), Some(output))
            }
        };
        ctx.mode = json!({
            "configured": configured.as_str(),
            "effective": effective.as_str(),
        });
        if let Some(classifier) = classifier_output {
            ctx.mode["classifier"] = classifier;
        }

        let mut idempotency_key: Option<String> = None;
        let mut schema_path: Option<PathBuf> = None;

        if effective == TaskMode::Full {
            // interpret
            let prompt = self.build_prompt(ctx, "interpret", &self.prompts.interpret);
            let interpret = self.run_provider_phase(ctx, adapter, "interpret", &prompt, None).await?;
            ctx.phase_outputs.insert("interpret".into(), interpret.clone());
            match interpret_block_decision(&interpret) {
                BlockDecision::Block(clarifications) => {
                    ctx.phase_outputs.insert(
                        "report".into(),
                        json!({
                            "message_markdown": "Blocked: the task needs clarification before it can run.",
                            "clarifications_needed": clarifications,
                        }),
                    );
                    self.post_system_event(
                        ctx,
                        "interpret",
                        "warn",
                        "task blocked for clarification",
                        None,
                    )
                    .await;
                    return Ok(PipelineOutcome {
                        succeeded: false,
                        blocked: true,
                        output_json: self.assemble_output(ctx),
                        final_phase: "interpret".into(),
                        error_message: Some("Blocked for clarification".into()),
                    });
                }
                BlockDecision::Warn => {
                    self.post_system_event(
                        ctx,
                        "interpret",
                        "warn",
                        "inconsistent clarification signals; continuing",
                        Some(interpret.clone()),
                    )
                    .await;
                }
                BlockDecision::Proceed => {}
            }

            // plan
            let prompt = self.build_prompt(ctx, "plan", &self.prompts.plan);
            let plan = self.run_provider_phase(ctx, adapter, "plan", &prompt, None).await?;
            ctx.phase_outputs.insert("plan".into(), plan.clone());
            if let Some(schema) = strict_execute_schema(&plan) {
                let path = ctx.run_dir.join("execute_schema.json");
                let rendered = serde_json::to_string_pretty(&schema)
                    .map_err(|e| RunnerError::Other(e.into()))?;
                tokio::fs::write(&path, rendered)
                    .await
                    .map_err(|e| RunnerError::Other(e.into()))?;
                schema_path = Some(path);
            }

            // policy
            let prompt = self.build_prompt(ctx, "policy", &self.prompts.policy);
            let policy = self.run_provider_phase(ctx, adapter, "policy", &prompt, None).await?;
            ctx.phase_outputs.insert("policy".into(), policy.clone());

            let key_fields = policy
                .pointer("/idempotency/key_fields")
                .and_then(|f| f.as_array())
                .map(|fields| {
                    fields
                        .iter()
                        .filter_map(|f| f.as_str().map(String::from))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            let interpret = ctx
                .phase_outputs
                .get("interpret")
                .cloned()
                .unwrap_or(Value::Null);
            let source = idempotency_source(&ctx.task, &interpret);
            let canonical = canonical_key_string(&source, &key_fields);
            let hash = sha256_hex(&canonical);
            idempotency_key = Some(hash.clone());

            let marker_key = format!("idempotency:{}", hash);
            let marker = self
                .client
                .get_state(&marker_key)
                .await
                .map_err(RunnerError::Other)?;
            let hit = marker
                .map(|entry| entry.value.get("status").and_then(|s| s.as_str()) == Some("done"))
                .unwrap_or(false);
            if hit {
                ctx.dedupe = Some(json!({"reused": true, "key": hash.as_str()}));
                self.post_system_event(
                    ctx,
                    "policy",
                    "info",
                    "idempotent work already completed; skipping execution",
                    Some(json!({"key": hash.as_str()})),
                )
                .await;
                let closing = Envelope::artifact(
                    &ctx.run_id,
                    ctx.sequence,
                    "policy",
                    "result",
                    "json",
                    json!({"dedupe": {"reused": true, "key": hash.as_str()}}),
                );
                self.emit(ctx, closing).await;
                return Ok(PipelineOutcome {
                    succeeded: true,
                    blocked: false,
                    output_json: self.assemble_output(ctx),
                    final_phase: "policy".into(),
                    error_message: None,
                });
            }
        }

        let outcome = self.run_tail_phases(ctx, adapter, schema_path).await?;

        if outcome.succeeded {
            if let Some(hash) = idempotency_key {
                let marker = json!({
                    "status": "done",
                    "completed_at": now_iso(),
                    "task_id": ctx.task.id,
                    "run_id": ctx.run_id,
                });
                if let Err(e) = self
                    .client
                    .set_state(&format!("idempotency:{}", hash), marker)
                    .await
                {
                    tracing::warn!(error = %format!("{:#}", e), "failed to store idempotency marker");
                }
            }
        }
        Ok(outcome)
    }

    /// execute → verify → report, shared by both modes.
    async fn run_tail_phases(
        &self,
        ctx: &mut RunContext,
        adapter: &mut Box<dyn ProviderAdapter>,
        schema_path: Option<PathBuf>,
    ) -> Result<PipelineOutcome, RunnerError> {
        let prompt = self.build_prompt(ctx, "execute", &self.prompts.execute);
        let execute = self
            .run_provider_phase(ctx, adapter, "execute", &prompt, schema_path.as_deref())
            .await?;
        let execute_status = execute.get("status").and_then(|s| s.as_str());
        if execute_status != Some("succeeded") && execute_status != Some("failed") {
            return Err(RunnerError::OutputParse {
                phase: "execute".into(),
                reason: "output must declare status succeeded|failed".into(),
            });
        }
        ctx.phase_outputs.insert("execute".into(), execute.clone());

        let verify = match ctx.task.success_criteria.as_deref().map(str::trim) {
            Some(criteria) if !criteria.is_empty() => {
                let prompt = self.build_prompt(ctx, "verify", &self.prompts.verify);
                let verify = self.run_provider_phase(ctx, adapter, "verify", &prompt, None).await?;
                if !verify.get("pass").map(|p| p.is_boolean()).unwrap_or(false) {
                    return Err(RunnerError::OutputParse {
                        phase: "verify".into(),
                        reason: "output must declare a boolean pass".into(),
                    });
                }
                verify
            }
            // No criteria: the verify result is synthesized from the execute
            // status without a provider call.
            _ => json!({
                "pass": execute_status == Some("succeeded"),
                "synthesized": true,
            }),
        };
        ctx.phase_outputs.insert("verify".into(), verify.clone());

        let prompt = self.build_prompt(ctx, "report", &self.prompts.report);
        let report = self.run_provider_phase(ctx, adapter, "report", &prompt, None).await?;
        ctx.phase_outputs.insert("report".into(), report.clone());

        let pass = verify.get("pass").and_then(|p| p.as_bool()).unwrap_or(false);
        if pass {
            let artifact = Envelope::artifact(
                &ctx.run_id,
                ctx.sequence,
                "report",
                "result",
                "json",
                report,
            );
            self.emit(ctx, artifact).await;
        }
        Ok(PipelineOutcome {
            succeeded: pass,
            blocked: false,
            output_json: self.assemble_output(ctx),
            final_phase: "report".into(),
            error_message: if pass {
                None
            } else {
                Some("verification did not pass".into())
            },
        })
    }

    /// One provider subprocess call for one phase, with streaming
    /// observation and output extraction.
    async fn run_provider_phase(
        &self,
        ctx: &mut RunContext,
        adapter: &mut Box<dyn ProviderAdapter>,
        phase: &str,
        prompt: &str,
        schema_path: Option<&std::path::Path>,
    ) -> Result<Value, RunnerError> {
        adapter.reset();
        self.post_system_event(ctx, phase, "info", "phase_started", None).await;

        let command = adapter.build_command(phase, prompt, schema_path);
        let timeout = Duration::from_millis(self.cfg.phase_timeout_ms);
        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();

        let run_dir = ctx.run_dir.clone();
        let proc = run_provider_command(&command, &run_dir, timeout, Some(line_tx));
        tokio::pin!(proc);

        let captured = loop {
            tokio::select! {
                line = line_rx.recv() => {
                    if let Some(line) = line {
                        self.handle_stream_line(ctx, adapter, phase, &line).await;
                    }
                }
                result = &mut proc => break result?,
            }
        };
        while let Ok(line) = line_rx.try_recv() {
            self.handle_stream_line(ctx, adapter, phase, &line).await;
        }
        self.close_pending_actions(ctx, phase).await;

        if captured.timed_out {
            return Err(RunnerError::PhaseTimeout {
                phase: phase.to_string(),
                timeout_ms: self.cfg.phase_timeout_ms,
            });
        }
        match captured.exit_code {
            Some(0) => {}
            Some(code) => {
                self.post_system_event(
                    ctx,
                    phase,
                    "error",
                    "provider exited with an error",
                    Some(json!({"exit_code": code, "stderr": tail(&captured.stderr, 2_000)})),
                )
                .await;
                return Err(RunnerError::NonZeroExit {
                    phase: phase.to_string(),
                    exit_code: code,
                });
            }
            None => {
                return Err(RunnerError::NonZeroExit {
                    phase: phase.to_string(),
                    exit_code: -1,
                });
            }
        }

        let text = if adapter.is_terminal_stream() {
            adapter
                .terminal_result_text()
                .unwrap_or_else(|| captured.stdout.clone())
        } else {
            captured.stdout.clone()
        };
        let output = extract_phase_output(&text).map_err(|reason| RunnerError::OutputParse {
            phase: phase.to_string(),
            reason,
        })?;

        self.post_system_event(ctx, phase, "info", "phase_completed", None).await;
        Ok(output)
    }

    /// Normalize one stream line and, for the execute phase with streaming
    /// enabled, forward the derived envelopes to the event log.
    async fn handle_stream_line(
        &self,
        ctx: &mut RunContext,
        adapter: &mut Box<dyn ProviderAdapter>,
        phase: &str,
        line: &str,
    ) {
        let mut payloads: Vec<ModelEventPayload> = Vec::new();
        adapter.observe_line(line, &mut |p| payloads.push(p));
        if !(self.cfg.stream_job_logs && phase == "execute") {
            return;
        }
        for payload in payloads {
            let envelopes = self.derive_stream_envelopes(ctx, phase, &payload);
            for envelope in envelopes {
                self.emit(ctx, envelope).await;
            }
        }
    }

    /// A model event envelope for the payload, plus action / tool_result
    /// envelopes for any tool traffic inside it.
    fn derive_stream_envelopes(
        &self,
        ctx: &mut RunContext,
        phase: &str,
        payload: &ModelEventPayload,
    ) -> Vec<Envelope> {
        let mut envelopes = Vec::new();
        let value = serde_json::to_value(payload).unwrap_or(Value::Null);
        envelopes.push(Envelope::model_event(&ctx.run_id, 0, phase, value));

        for item in payload.message.iter().flatten() {
            match item {
                MessageItem::ToolUse { content } => {
                    let tool_use_id = content
                        .get("id")
                        .and_then(|i| i.as_str())
                        .map(String::from)
                        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
                    let action_id = Uuid::new_v4().simple().to_string();
                    ctx.pending_actions.insert(tool_use_id, action_id.clone());
                    envelopes.push(Envelope::action(
                        &ctx.run_id,
                        0,
                        phase,
                        &action_id,
                        phase,
                        content.get("name").and_then(|n| n.as_str()).unwrap_or("unknown"),
                        content.get("input").cloned().unwrap_or(Value::Null),
                    ));
                }
                MessageItem::ToolResult { content } => {
                    let tool_use_id = content
                        .get("tool_use_id")
                        .and_then(|i| i.as_str())
                        .unwrap_or_default();
                    if let Some(action_id) = ctx.pending_actions.remove(tool_use_id) {
                        let ok = !content
                            .get("is_error")
                            .and_then(|e| e.as_bool())
                            .unwrap_or(false);
                        envelopes.push(Envelope::tool_result(
                            &ctx.run_id,
                            0,
                            phase,
                            &action_id,
                            ok,
                            content.get("content").cloned().unwrap_or(Value::Null),
                        ));
                    }
                }
                _ => {}
            }
        }
        envelopes
    }

    /// Every emitted action gets exactly one tool_result; close out any the
    /// stream never answered.
    async fn close_pending_actions(&self, ctx: &mut RunContext, phase: &str) {
        let orphans: Vec<String> = ctx.pending_actions.drain().map(|(_, v)| v).collect();
        for action_id in orphans {
            let envelope = Envelope::tool_result(
                &ctx.run_id,
                ctx.sequence,
                phase,
                &action_id,
                false,
                json!({"error": "stream closed before a tool result arrived"}),
            );
            self.emit(ctx, envelope).await;
        }
    }

    fn build_prompt(&self, ctx: &RunContext, phase: &str, base: &str) -> String {
        let mut prompt = base.trim_end().to_string();
        prompt.push_str("\n\n## Task\n");
        prompt.push_str(&ctx.task.prompt);
        if let Some(criteria) = ctx.task.success_criteria.as_deref() {
            if !criteria.trim().is_empty() {
                prompt.push_str("\n\n## Success criteria\n");
                prompt.push_str(criteria.trim());
            }
        }
        if phase != "classifier" && !ctx.phase_outputs.is_empty() {
            prompt.push_str("\n\n## Prior phase outputs\n```json\n");
            prompt.push_str(
                &serde_json::to_string_pretty(&ctx.phase_outputs).unwrap_or_default(),
            );
            prompt.push_str("\n```\n");
        }
        prompt
    }

    fn assemble_output(&self, ctx: &RunContext) -> Value {
        let mut output = json!({
            "mode": ctx.mode,
            "phase_outputs": Value::Object(ctx.phase_outputs.clone()),
            "run_dir": ctx.run_dir.to_string_lossy(),
        });
        if let Some(dedupe) = &ctx.dedupe {
            output["dedupe"] = dedupe.clone();
        }
        output
    }

    /// Send an envelope to the event log with the next run sequence.
    async fn emit(&self, ctx: &mut RunContext, mut envelope: Envelope) {
        envelope.sequence = ctx.sequence;
        ctx.sequence += 1;
        let message = match envelope.kind {
            crate::envelope::EnvelopeKind::StateChange => "state_change",
            crate::envelope::EnvelopeKind::Action => "action",
            crate::envelope::EnvelopeKind::ToolResult => "tool_result",
            crate::envelope::EnvelopeKind::Artifact => "artifact",
            crate::envelope::EnvelopeKind::Error => "error",
            crate::envelope::EnvelopeKind::Event => "model_event",
        };
        let phase = envelope.phase.clone();
        let data = json!({"envelope": envelope});
        if let Err(e) = self
            .client
            .post_event(&ctx.task.id, Some(ctx.attempt_id), &phase, "info", message, data)
            .await
        {
            tracing::warn!(error = %format!("{:#}", e), "failed to post envelope event");
        }
    }

    async fn post_system_event(
        &self,
        ctx: &mut RunContext,
        phase: &str,
        level: &str,
        message: &str,
        data: Option<Value>,
    ) {
        if let Err(e) = self
            .client
            .post_event(
                &ctx.task.id,
                Some(ctx.attempt_id),
                phase,
                level,
                message,
                data.unwrap_or(Value::Object(Default::default())),
            )
            .await
        {
            tracing::warn!(error = %format!("{:#}", e), "failed to post event");
        }
    }
}

// ── Pure decision helpers ─────────────────────────────────────────────

/// Anything the classifier declares other than "full" collapses to lean.
pub fn effective_mode(classifier_output: &Value) -> TaskMode {
    match classifier_output.get("mode").and_then(|m| m.as_str()) {
        Some("full") => TaskMode::Full,
        _ => TaskMode::Lean,
    }
}

#[derive(Debug, PartialEq)]
pub enum BlockDecision {
    Block(Value),
    Warn,
    Proceed,
}

/// Only `route == "blocked_for_clarification"` together with
/// `critical_blocker == true` blocks; a lone signal is a warning.
pub fn interpret_block_decision(interpret: &Value) -> BlockDecision {
    let wants_block =
        interpret.get("route").and_then(|r| r.as_str()) == Some("blocked_for_clarification");
    let critical = interpret
        .get("critical_blocker")
        .and_then(|c| c.as_bool())
        .unwrap_or(false);
    match (wants_block, critical) {
        (true, true) => BlockDecision::Block(
            interpret
                .get("clarifications_needed")
                .cloned()
                .unwrap_or_else(|| json!([])),
        ),
        (true, false) | (false, true) => BlockDecision::Warn,
        (false, false) => BlockDecision::Proceed,
    }
}

/// The plan may override the execute output contract; a schema is honored
/// only with `execute_output_strict=true` and `execute_output_format="json"`.
pub fn strict_execute_schema(plan: &Value) -> Option<Value> {
    let strict = plan
        .get("execute_output_strict")
        .and_then(|s| s.as_bool())
        .unwrap_or(false);
    let json_format = plan.get("execute_output_format").and_then(|f| f.as_str()) == Some("json");
    let schema = plan.get("execute_output_schema")?;
    if strict && json_format && schema.is_object() {
        Some(schema.clone())
    } else {
        None
    }
}

/// The canonical source the idempotency key fields resolve against.
pub fn idempotency_source(task: &Task, interpret: &Value) -> Value {
    json!({
        "task": {
            "id": task.id,
            "type": task.task_type,
            "title": task.title,
            "prompt": task.prompt,
        },
        "interpret": {
            "objective": interpret.get("objective").cloned().unwrap_or(Value::Null),
        },
    })
}

/// Canonical string per the dedup key formula: the `|`-joined
/// `<path>=<json-value-or-null>` pairs when at least one listed path
/// resolves, else the fallback over the five well-known fields.
pub fn canonical_key_string(source: &Value, key_fields: &[String]) -> String {
    let resolved: Vec<(String, Option<&Value>)> = key_fields
        .iter()
        .map(|path| (path.clone(), resolve_dot_path(source, path)))
        .collect();
    let any_defined = resolved
        .iter()
        .any(|(_, v)| v.map(|v| !v.is_null()).unwrap_or(false));

    if !key_fields.is_empty() && any_defined {
        resolved
            .iter()
            .map(|(path, value)| {
                let encoded = match value {
                    Some(v) => serde_json::to_string(v).unwrap_or_else(|_| "null".to_string()),
                    None => "null".to_string(),
                };
                format!("{}={}", path, encoded)
            })
            .collect::<Vec<_>>()
            .join("|")
    } else {
        let get = |pointer: &str| {
            source
                .pointer(pointer)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        format!(
            "{}|{}|{}|{}|{}",
            get("/task/id"),
            get("/task/type"),
            get("/task/title"),
            get("/task/prompt"),
            get("/interpret/objective"),
        )
    }
}

fn resolve_dot_path<'v>(source: &'v Value, path: &str) -> Option<&'v Value> {
    let mut current = source;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Last `max` bytes of a string, snapped to a char boundary.
fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}
