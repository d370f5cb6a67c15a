//! The run-streaming route: create a task, then forward its event timeline
//! as NDJSON envelopes until the task reaches a terminal status or the
//! response deadline elapses.

use std::time::{Duration, Instant};

use axum::{Json, body::Body, extract::State, http::header, response::Response};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::envelope::{Envelope, extract_user_output, resequence_for_replay};
use crate::store::models::{Task, TaskEvent};

use super::api::{ApiError, SharedState, parse_new_task};

/// Events fetched per poll. Keeps a single poll bounded while the 1 s
/// cadence drains any backlog quickly.
const POLL_EVENT_CAP: i64 = 200;
const POLL_INTERVAL: Duration = Duration::from_millis(1_000);

pub async fn run_task(
    State(state): State<SharedState>,
    Json(body): Json<Value>,
) -> Result<Response, ApiError> {
    let input = parse_new_task(&body)?;
    let max_attempts = state.config.max_attempts;
    let task = state
        .db
        .call(move |store| store.create_task(input, max_attempts))
        .await?;

    let (tx, rx) = mpsc::channel::<String>(64);
    tokio::spawn(pump_run_stream(state, task, tx));

    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|line| (Ok::<_, std::convert::Infallible>(line), rx))
    });
    let response = Response::builder()
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::Internal(e.into()))?;
    Ok(response)
}

/// Drive one streaming response. Sends one NDJSON line per envelope; the
/// local sequence starts at 0 with the intake record and increases by
/// exactly 1 per line.
pub(crate) async fn pump_run_stream(state: SharedState, task: Task, tx: mpsc::Sender<String>) {
    let deadline = Instant::now() + Duration::from_millis(state.config.run_deadline_ms);
    let mut sequence: u64 = 0;
    let mut last_event_id: i64 = 0;
    let task_id = task.id.clone();

    let intake = Envelope::system_event(
        &task_id,
        sequence,
        "intake",
        "info",
        "task accepted",
        Some(serde_json::json!({"task_id": task_id, "title": task.title})),
    );
    if tx.send(intake.to_ndjson_line()).await.is_err() {
        return;
    }
    sequence += 1;

    loop {
        let lookup = task_id.clone();
        let current = match state.db.call(move |store| store.get_task(&lookup)).await {
            Ok(task) => task,
            Err(e) => {
                // Transient store failure: keep polling until the deadline.
                tracing::error!(error = %format!("{:#}", e), "run stream poll failed");
                if Instant::now() >= deadline {
                    let err = Envelope::error(
                        &task_id,
                        sequence,
                        "runtime",
                        "RUN_WAIT_TIMEOUT",
                        "run did not finish before the streaming deadline",
                    );
                    let _ = tx.send(err.to_ndjson_line()).await;
                    return;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }
        };
        let current = match current {
            Some(task) => task,
            None => {
                let err = Envelope::error(
                    &task_id,
                    sequence,
                    "runtime",
                    "TASK_NOT_FOUND",
                    "task disappeared while streaming",
                );
                let _ = tx.send(err.to_ndjson_line()).await;
                return;
            }
        };

        if forward_new_events(&state, &task_id, &mut last_event_id, &mut sequence, &tx)
            .await
            .is_err()
        {
            return;
        }

        if current.status.is_terminal() {
            // Drain anything the worker appended between the poll and the
            // status read, then emit the terminal artifact.
            if forward_new_events(&state, &task_id, &mut last_event_id, &mut sequence, &tx)
                .await
                .is_err()
            {
                return;
            }
            let lookup = task_id.clone();
            let output = state
                .db
                .call(move |store| store.list_attempts(&lookup))
                .await
                .ok()
                .and_then(|attempts| attempts.last().map(|a| a.output_json.clone()))
                .unwrap_or(Value::Object(Default::default()));
            let artifact = Envelope::artifact(
                &task_id,
                sequence,
                "report",
                "result",
                "markdown",
                Value::String(extract_user_output(&output)),
            );
            let _ = tx.send(artifact.to_ndjson_line()).await;
            return;
        }

        if Instant::now() >= deadline {
            let err = Envelope::error(
                &task_id,
                sequence,
                "runtime",
                "RUN_WAIT_TIMEOUT",
                "run did not finish before the streaming deadline",
            );
            let _ = tx.send(err.to_ndjson_line()).await;
            return;
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Forward events with id beyond `last_event_id`, rewriting sequences.
/// Returns Err when the client went away.
async fn forward_new_events(
    state: &SharedState,
    task_id: &str,
    last_event_id: &mut i64,
    sequence: &mut u64,
    tx: &mpsc::Sender<String>,
) -> Result<(), ()> {
    loop {
        let lookup = task_id.to_string();
        let after = *last_event_id;
        let events = match state
            .db
            .call(move |store| store.list_events_after(&lookup, after, POLL_EVENT_CAP))
            .await
        {
            Ok(events) => events,
            Err(e) => {
                tracing::error!(error = %format!("{:#}", e), "event poll failed");
                return Ok(());
            }
        };
        if events.is_empty() {
            return Ok(());
        }
        for event in &events {
            *last_event_id = event.id;
            let line = render_event_line(task_id, event, *sequence);
            *sequence += 1;
            if tx.send(line).await.is_err() {
                return Err(());
            }
        }
    }
}

/// One NDJSON line for a stored event: replay an embedded envelope with a
/// rewritten sequence, or synthesize a system event envelope.
fn render_event_line(task_id: &str, event: &TaskEvent, sequence: u64) -> String {
    if let Some(envelope) = event.data.get("envelope") {
        if envelope.is_object() {
            let replayed = resequence_for_replay(envelope.clone(), sequence);
            let mut line = serde_json::to_string(&replayed).unwrap_or_else(|_| "{}".to_string());
            line.push('\n');
            return line;
        }
    }
    Envelope::system_event(
        task_id,
        sequence,
        &event.phase,
        event.level.as_str(),
        &event.message,
        Some(event.data.clone()),
    )
    .to_ndjson_line()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::GatewayConfig;
    use crate::gateway::api::AppState;
    use crate::store::models::{CompletionResult, EventLevel, NewTask};
    use crate::store::{DbHandle, Store};

    fn test_state(run_deadline_ms: u64) -> SharedState {
        Arc::new(AppState {
            db: DbHandle::new(Store::open_in_memory().unwrap()),
            config: GatewayConfig {
                db_path: ":memory:".into(),
                port: 0,
                lease_ttl_ms: 60_000,
                max_attempts: 3,
                run_deadline_ms,
            },
        })
    }

    async fn collect_lines(mut rx: mpsc::Receiver<String>) -> Vec<Value> {
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(serde_json::from_str(&line).unwrap());
        }
        lines
    }

    #[tokio::test]
    async fn test_stream_of_completed_task_ends_with_artifact() {
        let state = test_state(1_800_000);
        let task = {
            let store = state.db.lock_sync();
            let task = store
                .create_task(
                    NewTask {
                        prompt: "say hi".into(),
                        ..Default::default()
                    },
                    3,
                )
                .unwrap();
            store.claim_next_task("w1", 60_000).unwrap().unwrap();
            store.start_attempt(&task.id, "w1").unwrap().unwrap();
            store
                .append_event(
                    Some(task.id.as_str()),
                    None,
                    "execute",
                    EventLevel::Info,
                    "model output",
                    &serde_json::json!({"envelope": {
                        "run_id": "r1", "sequence": 9, "type": "event",
                        "phase": "execute", "producer": "model",
                        "payload": {"note": "streamed"}
                    }}),
                )
                .unwrap();
            store
                .complete_attempt(
                    &task.id,
                    "w1",
                    CompletionResult {
                        succeeded: true,
                        blocked: false,
                        output_json: serde_json::json!({
                            "phase_outputs": {"report": {"message_markdown": "done"}}
                        }),
                        final_phase: "report".into(),
                        error_message: None,
                        worker_exit_code: Some(0),
                        finished_at: None,
                    },
                )
                .unwrap();
            store.get_task(&task.id).unwrap().unwrap()
        };

        let (tx, rx) = mpsc::channel(64);
        pump_run_stream(state, task, tx).await;
        let lines = collect_lines(rx).await;

        // Sequences are 0..n with no gaps.
        for (i, line) in lines.iter().enumerate() {
            assert_eq!(line["sequence"], i as u64, "line {} out of sequence", i);
        }
        assert_eq!(lines[0]["phase"], "intake");
        assert_eq!(lines[0]["sequence"], 0);

        // The embedded envelope was replayed with its source sequence kept.
        let replayed = lines
            .iter()
            .find(|l| l["payload"]["note"] == "streamed")
            .expect("replayed envelope");
        assert_eq!(replayed["payload"]["source_sequence"], 9);
        assert_eq!(replayed["producer"], "model");

        let last = lines.last().unwrap();
        assert_eq!(last["type"], "artifact");
        assert_eq!(last["payload"]["name"], "result");
        assert_eq!(last["payload"]["content"], "done");
    }

    #[tokio::test]
    async fn test_stream_deadline_emits_timeout_error() {
        let state = test_state(1);
        let task = {
            let store = state.db.lock_sync();
            store
                .create_task(
                    NewTask {
                        prompt: "never runs".into(),
                        ..Default::default()
                    },
                    3,
                )
                .unwrap()
        };
        let (tx, rx) = mpsc::channel(64);
        pump_run_stream(state, task, tx).await;
        let lines = collect_lines(rx).await;
        let last = lines.last().unwrap();
        assert_eq!(last["type"], "error");
        assert_eq!(last["payload"]["code"], "RUN_WAIT_TIMEOUT");
    }
}
