use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::Value;

use crate::config::GatewayConfig;
use crate::store::DbHandle;
use crate::store::models::{
    CompleteOutcome, CompletionResult, EventLevel, NewTask, TaskMode, TaskStatus,
};

use super::run_stream;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub config: GatewayConfig,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

/// The closed set of error kinds at the gateway boundary. Internal causes
/// are logged but never leak into the response body.
pub enum ApiError {
    Validation(String),
    NotFound(String),
    Conflict(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(err) => {
                tracing::error!(error = %format!("{:#}", err), "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/tasks/queue", post(queue_task))
        .route("/tasks/run", post(run_stream::run_task))
        .route("/tasks/lease", post(lease_task))
        .route("/tasks", get(list_tasks))
        .route("/tasks/:id", get(get_task))
        .route("/tasks/:id/attempts", get(list_task_attempts))
        .route(
            "/tasks/:id/events",
            get(list_task_events).post(append_task_event),
        )
        .route("/tasks/:id/heartbeat", post(heartbeat_task))
        .route("/tasks/:id/complete", post(complete_task))
        .route("/events", get(list_events))
        .route("/state/:key", get(get_state).post(set_state))
}

// ── Body helpers ──────────────────────────────────────────────────────

/// Trimmed string member, or a validation error when present but not a string.
fn body_str(body: &Value, key: &str) -> Result<Option<String>, ApiError> {
    match body.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(_) => Err(ApiError::Validation(format!("{} must be a string", key))),
    }
}

fn body_i64(body: &Value, key: &str) -> Result<Option<i64>, ApiError> {
    match body.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| ApiError::Validation(format!("{} must be an integer", key))),
    }
}

fn body_bool(body: &Value, key: &str) -> Result<Option<bool>, ApiError> {
    match body.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(ApiError::Validation(format!("{} must be a boolean", key))),
    }
}

fn require_worker_id(body: &Value) -> Result<String, ApiError> {
    match body_str(body, "worker_id")? {
        Some(id) if !id.is_empty() => Ok(id),
        _ => Err(ApiError::Validation("worker_id is required".into())),
    }
}

fn lease_ttl_from(body: &Value, config: &GatewayConfig) -> Result<u64, ApiError> {
    match body_i64(body, "lease_ttl_ms")? {
        Some(ttl) if ttl > 0 => Ok(ttl as u64),
        Some(ttl) => Err(ApiError::Validation(format!(
            "lease_ttl_ms must be a positive integer, got {}",
            ttl
        ))),
        None => Ok(config.lease_ttl_ms),
    }
}

/// Validate a queue/run request body into a `NewTask`. Shared by the two
/// task-creating routes.
pub(super) fn parse_new_task(body: &Value) -> Result<NewTask, ApiError> {
    let prompt = match body_str(body, "prompt")? {
        Some(p) if !p.is_empty() => p,
        _ => return Err(ApiError::Validation("prompt is required".into())),
    };
    let success_criteria = match body_str(body, "success_criteria")? {
        Some(s) if s.is_empty() => {
            return Err(ApiError::Validation(
                "success_criteria must be a non-empty string".into(),
            ));
        }
        other => other,
    };
    let priority = body_i64(body, "priority")?;
    if let Some(p) = priority {
        if !(1..=5).contains(&p) {
            return Err(ApiError::Validation(format!(
                "priority must be in [1..5], got {}",
                p
            )));
        }
    }
    let mode = match body_str(body, "mode")? {
        Some(m) => Some(m.parse::<TaskMode>().map_err(ApiError::Validation)?),
        None => None,
    };

    let mut task_request = serde_json::json!({
        "mode": mode.unwrap_or(TaskMode::Auto).as_str(),
    });
    if let Some(metadata) = body.get("metadata") {
        if !metadata.is_null() {
            task_request["metadata"] = metadata.clone();
        }
    }

    Ok(NewTask {
        task_type: body_str(body, "type")?,
        title: body_str(body, "title")?,
        prompt,
        success_criteria,
        priority,
        max_attempts: None,
        task_request,
    })
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> Json<Value> {
    Json(serde_json::json!({"ok": true}))
}

async fn queue_task(
    State(state): State<SharedState>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let input = parse_new_task(&body)?;
    let max_attempts = state.config.max_attempts;
    let task = state
        .db
        .call(move |store| store.create_task(input, max_attempts))
        .await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({"task_id": task.id}))))
}

#[derive(Deserialize)]
struct ListTasksQuery {
    status: Option<String>,
}

async fn list_tasks(
    State(state): State<SharedState>,
    Query(query): Query<ListTasksQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(raw.parse::<TaskStatus>().map_err(ApiError::Validation)?),
        None => None,
    };
    let tasks = state.db.call(move |store| store.list_tasks(status)).await?;
    Ok(Json(serde_json::json!({"tasks": tasks})))
}

async fn get_task(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let task = state
        .db
        .call(move |store| store.get_task(&lookup))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Task {} not found", id)))?;
    Ok(Json(task))
}

async fn list_task_attempts(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let attempts = state
        .db
        .call(move |store| {
            if store.get_task(&lookup)?.is_none() {
                return Ok(None);
            }
            store.list_attempts(&lookup).map(Some)
        })
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Task {} not found", id)))?;
    Ok(Json(serde_json::json!({"attempts": attempts})))
}

enum LeaseOutcome {
    Empty,
    Claimed(Box<crate::store::models::Task>, crate::store::models::StartedAttempt),
    Conflict,
}

async fn lease_task(
    State(state): State<SharedState>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let worker_id = require_worker_id(&body)?;
    let ttl = lease_ttl_from(&body, &state.config)?;

    let leased = state
        .db
        .call(move |store| {
            let task = match store.claim_next_task(&worker_id, ttl)? {
                Some(task) => task,
                None => return Ok(LeaseOutcome::Empty),
            };
            // The lease is ours, so the start can only lose to an expiry
            // sweep between the two calls.
            let started = match store.start_attempt(&task.id, &worker_id)? {
                Some(started) => started,
                None => return Ok(LeaseOutcome::Conflict),
            };
            match store.get_task(&task.id)? {
                Some(task) => Ok(LeaseOutcome::Claimed(Box::new(task), started)),
                None => Ok(LeaseOutcome::Conflict),
            }
        })
        .await?;

    match leased {
        LeaseOutcome::Claimed(task, started) => Ok(Json(serde_json::json!({
            "task": task,
            "attempt_no": started.attempt_no,
            "attempt_id": started.attempt_id,
            "lease_expires_at": started.lease_expires_at,
        }))),
        LeaseOutcome::Empty => Ok(Json(serde_json::json!({"task": null}))),
        LeaseOutcome::Conflict => Err(ApiError::Conflict("lease was lost before start".into())),
    }
}

async fn heartbeat_task(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let worker_id = require_worker_id(&body)?;
    let ttl = lease_ttl_from(&body, &state.config)?;
    // A stale heartbeat is cooperative: the worker learns about the lost
    // lease from complete, never from here.
    state
        .db
        .call(move |store| store.heartbeat(&id, &worker_id, ttl))
        .await?;
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn append_task_event(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    require_worker_id(&body)?;
    let phase = match body_str(&body, "phase")? {
        Some(p) if !p.is_empty() => p,
        _ => return Err(ApiError::Validation("phase is required".into())),
    };
    let level = match body_str(&body, "level")? {
        Some(l) => l.parse::<EventLevel>().map_err(ApiError::Validation)?,
        None => EventLevel::Info,
    };
    let message = match body_str(&body, "message")? {
        Some(m) if !m.is_empty() => m,
        _ => return Err(ApiError::Validation("message is required".into())),
    };
    let attempt_id = body_i64(&body, "attempt_id")?;
    let data = body.get("data").cloned().unwrap_or(Value::Object(Default::default()));

    let lookup = id.clone();
    let appended = state
        .db
        .call(move |store| {
            if store.get_task(&lookup)?.is_none() {
                return Ok(false);
            }
            store.append_event(Some(lookup.as_str()), attempt_id, &phase, level, &message, &data)?;
            Ok(true)
        })
        .await?;
    if !appended {
        return Err(ApiError::NotFound(format!("Task {} not found", id)));
    }
    Ok(Json(serde_json::json!({"ok": true})))
}

async fn complete_task(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let worker_id = require_worker_id(&body)?;
    let succeeded = body_bool(&body, "succeeded")?
        .ok_or_else(|| ApiError::Validation("succeeded is required".into()))?;
    let blocked = body_bool(&body, "blocked")?.unwrap_or(false);
    let result = CompletionResult {
        succeeded,
        blocked,
        output_json: body
            .get("output_json")
            .cloned()
            .unwrap_or(Value::Object(Default::default())),
        final_phase: body_str(&body, "final_phase")?.unwrap_or_else(|| "runtime".to_string()),
        error_message: body_str(&body, "error_message")?,
        worker_exit_code: body_i64(&body, "worker_exit_code")?,
        finished_at: body_str(&body, "finished_at")?,
    };

    let lookup = id.clone();
    let outcome = state
        .db
        .call(move |store| store.complete_attempt(&lookup, &worker_id, result))
        .await?;
    match outcome {
        CompleteOutcome::Completed(status) | CompleteOutcome::StaleLease(status) => {
            Ok(Json(serde_json::json!({"ok": true, "status": status})))
        }
        CompleteOutcome::NotFound => Err(ApiError::NotFound(format!("Task {} not found", id))),
    }
}

#[derive(Deserialize)]
struct ListEventsQuery {
    limit: Option<i64>,
    task_id: Option<String>,
}

async fn list_task_events(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<ListEventsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(100);
    let lookup = id.clone();
    let events = state
        .db
        .call(move |store| {
            if store.get_task(&lookup)?.is_none() {
                return Ok(None);
            }
            store.list_events(limit, Some(lookup.as_str())).map(Some)
        })
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Task {} not found", id)))?;
    Ok(Json(serde_json::json!({"events": events})))
}

async fn list_events(
    State(state): State<SharedState>,
    Query(query): Query<ListEventsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(100);
    let task_id = query.task_id;
    let events = state
        .db
        .call(move |store| store.list_events(limit, task_id.as_deref()))
        .await?;
    Ok(Json(serde_json::json!({"events": events})))
}

async fn get_state(
    State(state): State<SharedState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = key.clone();
    let entry = state
        .db
        .call(move |store| store.get_state(&lookup))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("State key '{}' not found", key)))?;
    Ok(Json(entry))
}

async fn set_state(
    State(state): State<SharedState>,
    Path(key): Path<String>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let value = body
        .get("value")
        .cloned()
        .ok_or_else(|| ApiError::Validation("value is required".into()))?;
    let entry = state
        .db
        .call(move |store| store.set_state(&key, &value))
        .await?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "key": entry.key,
        "value": entry.value,
        "updated_at": entry.updated_at,
    })))
}

// ── Tests ─────────────────────────────────────────────────────────────
