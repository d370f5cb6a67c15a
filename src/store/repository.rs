//! Lifecycle repository over the embedded store.
//!
//! Every mutating method opens exactly one transaction and either commits
//! all writes (task row + attempt row + event rows) or none. The `DbHandle`
//! mutex already guarantees single-threaded access, so the methods use
//! `unchecked_transaction` on a shared connection reference.

use anyhow::{Context, Result};
use rusqlite::{OptionalExtension, Transaction, params};
use serde_json::Value;
use uuid::Uuid;

use super::models::*;
use super::{Store, iso_after_ms, now_iso};

const TASK_COLUMNS: &str = "id, task_type, title, prompt, success_criteria, task_request, \
     priority, attempt_count, max_attempts, status, lease_owner, lease_expires_at, \
     last_error, created_at, updated_at";

const EVENT_COLUMNS: &str = "id, task_id, attempt_id, phase, level, message, data_json, created_at";

const ATTEMPT_COLUMNS: &str = "id, task_id, attempt_no, status, lease_owner, lease_expires_at, \
     phase, output_json, started_at, finished_at";

/// Phase recorded on repository-generated lifecycle events.
const LIFECYCLE_PHASE: &str = "queue";

impl Store {
    // ── Task lifecycle ────────────────────────────────────────────────

    pub fn create_task(&self, input: NewTask, default_max_attempts: u32) -> Result<Task> {
        let now = now_iso();
        let id = Uuid::new_v4().simple().to_string();

        let title = match input.title.as_deref().map(str::trim) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => "Untitled task".to_string(),
        };
        let priority = input.priority.unwrap_or(3).clamp(1, 5);
        let max_attempts = input
            .max_attempts
            .unwrap_or(default_max_attempts as i64)
            .max(1);
        let task_type = input.task_type.unwrap_or_else(|| "generic".to_string());
        let task_request = serde_json::to_string(&input.task_request)
            .context("Failed to serialize task_request")?;

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO tasks (id, task_type, title, prompt, success_criteria, task_request,
                                priority, max_attempts, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'queued', ?9, ?9)",
            params![
                id,
                task_type,
                title,
                input.prompt,
                input.success_criteria,
                task_request,
                priority,
                max_attempts,
                now
            ],
        )
        .context("Failed to insert task")?;
        Self::append_event_tx(
            &tx,
            Some(id.as_str()),
            None,
            LIFECYCLE_PHASE,
            EventLevel::Info,
            "task_created",
            &serde_json::json!({"title": title, "priority": priority}),
            &now,
        )?;
        tx.commit().context("Failed to commit task creation")?;

        self.get_task(&id)?
            .context("Task not found after insert")
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS))
            .context("Failed to prepare get_task")?;
        let row = stmt
            .query_row(params![id], Self::map_task_row)
            .optional()
            .context("Failed to query task")?;
        row.map(TaskRow::into_task).transpose()
    }

    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        let sql = match status {
            Some(_) => format!(
                "SELECT {} FROM tasks WHERE status = ?1 ORDER BY priority ASC, created_at ASC, id ASC",
                TASK_COLUMNS
            ),
            None => format!(
                "SELECT {} FROM tasks ORDER BY priority ASC, created_at ASC, id ASC",
                TASK_COLUMNS
            ),
        };
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_tasks")?;
        let rows = match status {
            Some(s) => stmt.query_map(params![s.as_str()], Self::map_task_row),
            None => stmt.query_map([], Self::map_task_row),
        }
        .context("Failed to query tasks")?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.context("Failed to read task row")?.into_task()?);
        }
        Ok(tasks)
    }

    /// Requeue or fail every task whose lease expired before `now`.
    /// Returns the number of recovered tasks.
    pub fn recover_expired_leases(&self) -> Result<usize> {
        let now = now_iso();
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let recovered = Self::recover_expired_leases_tx(&tx, &now)?;
        tx.commit().context("Failed to commit lease recovery")?;
        Ok(recovered)
    }

    fn recover_expired_leases_tx(tx: &Transaction<'_>, now: &str) -> Result<usize> {
        let expired: Vec<(String, i64, i64)> = {
            let mut stmt = tx
                .prepare(
                    "SELECT id, attempt_count, max_attempts FROM tasks
                     WHERE status IN ('leased', 'running') AND lease_expires_at < ?1",
                )
                .context("Failed to prepare expiry scan")?;
            let rows = stmt
                .query_map(params![now], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })
                .context("Failed to scan expired leases")?;
            rows.collect::<std::result::Result<_, _>>()
                .context("Failed to read expired lease row")?
        };

        for (task_id, attempt_count, max_attempts) in &expired {
            let new_count = attempt_count + 1;
            let new_status = if new_count >= *max_attempts {
                TaskStatus::Failed
            } else {
                TaskStatus::Queued
            };
            tx.execute(
                "UPDATE tasks SET status = ?1, attempt_count = ?2, lease_owner = NULL,
                        lease_expires_at = NULL, last_error = ?3, updated_at = ?4
                 WHERE id = ?5",
                params![
                    new_status.as_str(),
                    new_count,
                    "Lease expired before completion",
                    now,
                    task_id
                ],
            )
            .context("Failed to requeue expired task")?;
            tx.execute(
                "UPDATE task_attempts SET status = 'failed', finished_at = ?1
                 WHERE task_id = ?2 AND status = 'running'",
                params![now, task_id],
            )
            .context("Failed to fail expired attempt")?;
            Self::append_event_tx(
                tx,
                Some(task_id.as_str()),
                None,
                LIFECYCLE_PHASE,
                EventLevel::Warn,
                "lease_expired",
                &serde_json::json!({"attempt_count": new_count, "status": new_status.as_str()}),
                now,
            )?;
        }
        Ok(expired.len())
    }

    /// Claim the highest-priority queued task for `worker_id`, recovering
    /// expired leases first. The claim itself is a conditional update on
    /// `status='queued'`, so two racing workers cannot both win.
    pub fn claim_next_task(&self, worker_id: &str, lease_ttl_ms: u64) -> Result<Option<Task>> {
        let now = now_iso();
        let expires = iso_after_ms(lease_ttl_ms);
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        Self::recover_expired_leases_tx(&tx, &now)?;

        let candidate: Option<String> = tx
            .query_row(
                "SELECT id FROM tasks WHERE status = 'queued'
                 ORDER BY priority ASC, created_at ASC, id ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to scan for a queued task")?;
        let id = match candidate {
            Some(id) => id,
            None => {
                tx.commit().context("Failed to commit claim")?;
                return Ok(None);
            }
        };

        let changed = tx
            .execute(
                "UPDATE tasks SET status = 'leased', lease_owner = ?1,
                        lease_expires_at = ?2, updated_at = ?3
                 WHERE id = ?4 AND status = 'queued'",
                params![worker_id, expires, now, id],
            )
            .context("Failed to lease task")?;
        tx.commit().context("Failed to commit claim")?;

        if changed == 0 {
            return Ok(None);
        }
        self.get_task(&id)
    }

    /// Flip a leased task to running and open its next attempt row.
    /// Returns `None` when the task is not leased by `worker_id`.
    pub fn start_attempt(&self, task_id: &str, worker_id: &str) -> Result<Option<StartedAttempt>> {
        let now = now_iso();
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let changed = tx
            .execute(
                "UPDATE tasks SET status = 'running', updated_at = ?1
                 WHERE id = ?2 AND status = 'leased' AND lease_owner = ?3",
                params![now, task_id, worker_id],
            )
            .context("Failed to mark task running")?;
        if changed == 0 {
            tx.commit().context("Failed to commit no-op start")?;
            return Ok(None);
        }

        let (attempt_count, lease_expires_at): (i64, String) = tx
            .query_row(
                "SELECT attempt_count, lease_expires_at FROM tasks WHERE id = ?1",
                params![task_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("Failed to read task for attempt start")?;
        // attempt_count advances only on completion; the next attempt number
        // is therefore always count + 1 and (task_id, attempt_no) stays unique.
        let attempt_no = attempt_count + 1;

        tx.execute(
            "INSERT INTO task_attempts (task_id, attempt_no, status, lease_owner,
                                        lease_expires_at, started_at)
             VALUES (?1, ?2, 'running', ?3, ?4, ?5)",
            params![task_id, attempt_no, worker_id, lease_expires_at, now],
        )
        .context("Failed to insert attempt")?;
        let attempt_id = tx.last_insert_rowid();

        Self::append_event_tx(
            &tx,
            Some(task_id),
            Some(attempt_id),
            LIFECYCLE_PHASE,
            EventLevel::Info,
            "attempt_started",
            &serde_json::json!({"attempt_no": attempt_no, "worker_id": worker_id}),
            &now,
        )?;
        tx.commit().context("Failed to commit attempt start")?;

        Ok(Some(StartedAttempt {
            attempt_no,
            attempt_id,
            lease_expires_at,
        }))
    }

    /// Extend the lease on a task and its running attempt. Stale heartbeats
    /// are cooperative no-ops; the return value only reports whether the
    /// lease was actually extended.
    pub fn heartbeat(&self, task_id: &str, worker_id: &str, lease_ttl_ms: u64) -> Result<bool> {
        let expires = iso_after_ms(lease_ttl_ms);
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let changed = tx
            .execute(
                "UPDATE tasks SET lease_expires_at = ?1
                 WHERE id = ?2 AND lease_owner = ?3 AND status IN ('leased', 'running')",
                params![expires, task_id, worker_id],
            )
            .context("Failed to heartbeat task")?;
        if changed > 0 {
            tx.execute(
                "UPDATE task_attempts SET lease_expires_at = ?1
                 WHERE task_id = ?2 AND status = 'running'",
                params![expires, task_id],
            )
            .context("Failed to heartbeat attempt")?;
        }
        tx.commit().context("Failed to commit heartbeat")?;
        Ok(changed > 0)
    }

    /// Finalize the running attempt of a task per the worker's result.
    pub fn complete_attempt(
        &self,
        task_id: &str,
        worker_id: &str,
        result: CompletionResult,
    ) -> Result<CompleteOutcome> {
        let now = now_iso();
        let finished = result.finished_at.clone().unwrap_or_else(|| now.clone());
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let current: Option<(String, String, i64)> = tx
            .query_row(
                "SELECT status, COALESCE(lease_owner, ''), max_attempts FROM tasks WHERE id = ?1",
                params![task_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .context("Failed to read task for completion")?;
        let (status_str, owner, max_attempts) = match current {
            Some(c) => c,
            None => {
                tx.commit().context("Failed to commit no-op completion")?;
                return Ok(CompleteOutcome::NotFound);
            }
        };
        let status: TaskStatus = status_str
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
            .context("Corrupt task status in database")?;
        if status.is_terminal() || status == TaskStatus::Queued || owner != worker_id {
            // The prior owner's lease was reclaimed; their completion is a
            // no-op rather than an error.
            tx.commit().context("Failed to commit no-op completion")?;
            return Ok(CompleteOutcome::StaleLease(status));
        }

        let attempt: Option<(i64, i64)> = tx
            .query_row(
                "SELECT id, attempt_no FROM task_attempts
                 WHERE task_id = ?1 AND status = 'running'
                 ORDER BY attempt_no DESC LIMIT 1",
                params![task_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to read running attempt")?;
        let (attempt_id, attempt_no) = match attempt {
            Some(a) => a,
            None => {
                tx.commit().context("Failed to commit no-op completion")?;
                return Ok(CompleteOutcome::StaleLease(status));
            }
        };

        let attempt_status = if result.blocked {
            AttemptStatus::Blocked
        } else if result.succeeded {
            AttemptStatus::Done
        } else {
            AttemptStatus::Failed
        };
        let task_status = if result.blocked {
            TaskStatus::Blocked
        } else if result.succeeded {
            TaskStatus::Done
        } else if attempt_no < max_attempts {
            TaskStatus::Queued
        } else {
            TaskStatus::Failed
        };

        let output = serde_json::to_string(&result.output_json)
            .context("Failed to serialize attempt output")?;
        tx.execute(
            "UPDATE task_attempts SET status = ?1, output_json = ?2, phase = ?3, finished_at = ?4
             WHERE id = ?5",
            params![
                attempt_status.as_str(),
                output,
                result.final_phase,
                finished,
                attempt_id
            ],
        )
        .context("Failed to finalize attempt")?;
        tx.execute(
            "UPDATE tasks SET status = ?1, attempt_count = ?2, lease_owner = NULL,
                    lease_expires_at = NULL, last_error = ?3, updated_at = ?4
             WHERE id = ?5",
            params![
                task_status.as_str(),
                attempt_no,
                result.error_message,
                finished,
                task_id
            ],
        )
        .context("Failed to finalize task")?;

        let (message, level) = match task_status {
            TaskStatus::Done => ("task_completed", EventLevel::Info),
            _ => ("task_failed", EventLevel::Error),
        };
        Self::append_event_tx(
            &tx,
            Some(task_id),
            Some(attempt_id),
            LIFECYCLE_PHASE,
            level,
            message,
            &serde_json::json!({
                "attempt_no": attempt_no,
                "status": task_status.as_str(),
                "blocked": result.blocked,
                "final_phase": result.final_phase,
                "error": result.error_message,
                "worker_exit_code": result.worker_exit_code,
            }),
            &now,
        )?;
        tx.commit().context("Failed to commit completion")?;
        Ok(CompleteOutcome::Completed(task_status))
    }

    // ── Attempts ──────────────────────────────────────────────────────

    pub fn list_attempts(&self, task_id: &str) -> Result<Vec<TaskAttempt>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM task_attempts WHERE task_id = ?1 ORDER BY attempt_no ASC",
                ATTEMPT_COLUMNS
            ))
            .context("Failed to prepare list_attempts")?;
        let rows = stmt
            .query_map(params![task_id], Self::map_attempt_row)
            .context("Failed to query attempts")?;
        let mut attempts = Vec::new();
        for row in rows {
            attempts.push(row.context("Failed to read attempt row")?.into_attempt()?);
        }
        Ok(attempts)
    }

    // ── Events ────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn append_event(
        &self,
        task_id: Option<&str>,
        attempt_id: Option<i64>,
        phase: &str,
        level: EventLevel,
        message: &str,
        data: &Value,
    ) -> Result<i64> {
        let now = now_iso();
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let id = Self::append_event_tx(&tx, task_id, attempt_id, phase, level, message, data, &now)?;
        tx.commit().context("Failed to commit event")?;
        Ok(id)
    }

    #[allow(clippy::too_many_arguments)]
    fn append_event_tx(
        tx: &Transaction<'_>,
        task_id: Option<&str>,
        attempt_id: Option<i64>,
        phase: &str,
        level: EventLevel,
        message: &str,
        data: &Value,
        now: &str,
    ) -> Result<i64> {
        let data_json = serde_json::to_string(data).context("Failed to serialize event data")?;
        tx.execute(
            "INSERT INTO task_events (task_id, attempt_id, phase, level, message, data_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![task_id, attempt_id, phase, level.as_str(), message, data_json, now],
        )
        .context("Failed to insert event")?;
        Ok(tx.last_insert_rowid())
    }

    /// Newest-first event listing, bounded to `[1..500]`.
    pub fn list_events(&self, limit: i64, task_id: Option<&str>) -> Result<Vec<TaskEvent>> {
        let limit = limit.clamp(1, 500);
        let sql = match task_id {
            Some(_) => format!(
                "SELECT {} FROM task_events WHERE task_id = ?1
                 ORDER BY created_at DESC, id DESC LIMIT ?2",
                EVENT_COLUMNS
            ),
            None => format!(
                "SELECT {} FROM task_events ORDER BY created_at DESC, id DESC LIMIT ?1",
                EVENT_COLUMNS
            ),
        };
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_events")?;
        let rows = match task_id {
            Some(id) => stmt.query_map(params![id, limit], Self::map_event_row),
            None => stmt.query_map(params![limit], Self::map_event_row),
        }
        .context("Failed to query events")?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row.context("Failed to read event row")?.into_event()?);
        }
        Ok(events)
    }

    /// Ascending per-task events with id greater than `after_id`. Feeds the
    /// streaming route's poll loop.
    pub fn list_events_after(
        &self,
        task_id: &str,
        after_id: i64,
        cap: i64,
    ) -> Result<Vec<TaskEvent>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM task_events WHERE task_id = ?1 AND id > ?2
                 ORDER BY id ASC LIMIT ?3",
                EVENT_COLUMNS
            ))
            .context("Failed to prepare list_events_after")?;
        let rows = stmt
            .query_map(params![task_id, after_id, cap.max(1)], Self::map_event_row)
            .context("Failed to query events after id")?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row.context("Failed to read event row")?.into_event()?);
        }
        Ok(events)
    }

    // ── Run state ─────────────────────────────────────────────────────

    pub fn get_state(&self, key: &str) -> Result<Option<RunStateEntry>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value, updated_at FROM run_state WHERE key = ?1")
            .context("Failed to prepare get_state")?;
        let row = stmt
            .query_row(params![key], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .optional()
            .context("Failed to query state")?;
        match row {
            Some((key, value, updated_at)) => {
                let value: Value = serde_json::from_str(&value)
                    .with_context(|| format!("Corrupt state JSON under '{}'", key))?;
                Ok(Some(RunStateEntry {
                    key,
                    value,
                    updated_at,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn set_state(&self, key: &str, value: &Value) -> Result<RunStateEntry> {
        let now = now_iso();
        let raw = serde_json::to_string(value).context("Failed to serialize state value")?;
        self.conn
            .execute(
                "INSERT INTO run_state (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, raw, now],
            )
            .context("Failed to upsert state")?;
        Ok(RunStateEntry {
            key: key.to_string(),
            value: value.clone(),
            updated_at: now,
        })
    }

    // ── Status summary ────────────────────────────────────────────────

    pub fn status_counts(&self) -> Result<Vec<(TaskStatus, i64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status ORDER BY status")
            .context("Failed to prepare status_counts")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .context("Failed to query status counts")?;
        let mut counts = Vec::new();
        for row in rows {
            let (status, count) = row.context("Failed to read count row")?;
            let status: TaskStatus = status
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .context("Corrupt task status in database")?;
            counts.push((status, count));
        }
        Ok(counts)
    }

    // ── Row mapping ───────────────────────────────────────────────────

    fn map_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
        Ok(TaskRow {
            id: row.get(0)?,
            task_type: row.get(1)?,
            title: row.get(2)?,
            prompt: row.get(3)?,
            success_criteria: row.get(4)?,
            task_request: row.get(5)?,
            priority: row.get(6)?,
            attempt_count: row.get(7)?,
            max_attempts: row.get(8)?,
            status: row.get(9)?,
            lease_owner: row.get(10)?,
            lease_expires_at: row.get(11)?,
            last_error: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn map_attempt_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AttemptRow> {
        Ok(AttemptRow {
            id: row.get(0)?,
            task_id: row.get(1)?,
            attempt_no: row.get(2)?,
            status: row.get(3)?,
            lease_owner: row.get(4)?,
            lease_expires_at: row.get(5)?,
            phase: row.get(6)?,
            output_json: row.get(7)?,
            started_at: row.get(8)?,
            finished_at: row.get(9)?,
        })
    }

    fn map_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRow> {
        Ok(EventRow {
            id: row.get(0)?,
            task_id: row.get(1)?,
            attempt_id: row.get(2)?,
            phase: row.get(3)?,
            level: row.get(4)?,
            message: row.get(5)?,
            data_json: row.get(6)?,
            created_at: row.get(7)?,
        })
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

/// Intermediate row struct for reading tasks from SQLite before converting
/// status / mode / JSON strings into typed values.
struct TaskRow {
    id: String,
    task_type: String,
    title: String,
    prompt: String,
    success_criteria: Option<String>,
    task_request: String,
    priority: i64,
    attempt_count: i64,
    max_attempts: i64,
    status: String,
    lease_owner: Option<String>,
    lease_expires_at: Option<String>,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TaskRow {
    fn into_task(self) -> Result<Task> {
        let status = self
            .status
            .parse::<TaskStatus>()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse task status")?;
        let task_request: Value = serde_json::from_str(&self.task_request)
            .context("Failed to parse task_request JSON")?;
        Ok(Task {
            id: self.id,
            task_type: self.task_type,
            title: self.title,
            prompt: self.prompt,
            success_criteria: self.success_criteria,
            task_request,
            priority: self.priority,
            attempt_count: self.attempt_count,
            max_attempts: self.max_attempts,
            status,
            lease_owner: self.lease_owner,
            lease_expires_at: self.lease_expires_at,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

struct AttemptRow {
    id: i64,
    task_id: String,
    attempt_no: i64,
    status: String,
    lease_owner: Option<String>,
    lease_expires_at: Option<String>,
    phase: Option<String>,
    output_json: String,
    started_at: String,
    finished_at: Option<String>,
}

impl AttemptRow {
    fn into_attempt(self) -> Result<TaskAttempt> {
        let status = self
            .status
            .parse::<AttemptStatus>()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse attempt status")?;
        let output_json: Value = serde_json::from_str(&self.output_json)
            .context("Failed to parse attempt output JSON")?;
        Ok(TaskAttempt {
            id: self.id,
            task_id: self.task_id,
            attempt_no: self.attempt_no,
            status,
            lease_owner: self.lease_owner,
            lease_expires_at: self.lease_expires_at,
            phase: self.phase,
            output_json,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

struct EventRow {
    id: i64,
    task_id: Option<String>,
    attempt_id: Option<i64>,
    phase: String,
    level: String,
    message: String,
    data_json: String,
    created_at: String,
}

impl EventRow {
    fn into_event(self) -> Result<TaskEvent> {
        let level = self
            .level
            .parse::<EventLevel>()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse event level")?;
        let data: Value =
            serde_json::from_str(&self.data_json).context("Failed to parse event data JSON")?;
        Ok(TaskEvent {
            id: self.id,
            task_id: self.task_id,
            attempt_id: self.attempt_id,
            phase: self.phase,
            level,
            message: self.message,
            data,
            created_at: self.created_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
