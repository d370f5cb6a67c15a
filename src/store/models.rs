use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Leased,
    Running,
    Done,
    Failed,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Leased => "leased",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }

    /// Terminal tasks never carry a lease and receive no further attempts.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Blocked)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "leased" => Ok(Self::Leased),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Running,
    Done,
    Failed,
    Blocked,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            _ => Err(format!("Invalid attempt status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for EventLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid event level: {}", s)),
        }
    }
}

/// Declared execution mode carried in the task request payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    Auto,
    Lean,
    Full,
}

impl TaskMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Lean => "lean",
            Self::Full => "full",
        }
    }
}

impl std::fmt::Display for TaskMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "lean" => Ok(Self::Lean),
            "full" => Ok(Self::Full),
            _ => Err(format!("Invalid mode: {}", s)),
        }
    }
}

/// One unit of durable work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub title: String,
    pub prompt: String,
    pub success_criteria: Option<String>,
    pub task_request: Value,
    pub priority: i64,
    pub attempt_count: i64,
    pub max_attempts: i64,
    pub status: TaskStatus,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Task {
    /// Declared mode from the task request payload, defaulting to `auto`.
    pub fn declared_mode(&self) -> TaskMode {
        self.task_request
            .get("mode")
            .and_then(|m| m.as_str())
            .and_then(|m| m.parse().ok())
            .unwrap_or(TaskMode::Auto)
    }
}

/// One end-to-end execution of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAttempt {
    pub id: i64,
    pub task_id: String,
    pub attempt_no: i64,
    pub status: AttemptStatus,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<String>,
    pub phase: Option<String>,
    pub output_json: Value,
    pub started_at: String,
    pub finished_at: Option<String>,
}

/// Immutable audit entry on a per-task timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub id: i64,
    pub task_id: Option<String>,
    pub attempt_id: Option<i64>,
    pub phase: String,
    pub level: EventLevel,
    pub message: String,
    pub data: Value,
    pub created_at: String,
}

/// One entry in the durable key/value run-state table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStateEntry {
    pub key: String,
    pub value: Value,
    pub updated_at: String,
}

/// Input for task creation. Unset fields take repository defaults.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub task_type: Option<String>,
    pub title: Option<String>,
    pub prompt: String,
    pub success_criteria: Option<String>,
    pub priority: Option<i64>,
    pub max_attempts: Option<i64>,
    pub task_request: Value,
}

/// Terminal result reported by a worker for one attempt.
#[derive(Debug, Clone)]
pub struct CompletionResult {
    pub succeeded: bool,
    pub blocked: bool,
    pub output_json: Value,
    pub final_phase: String,
    pub error_message: Option<String>,
    pub worker_exit_code: Option<i64>,
    pub finished_at: Option<String>,
}

/// Lease + attempt info returned by `start_attempt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartedAttempt {
    pub attempt_no: i64,
    pub attempt_id: i64,
    pub lease_expires_at: String,
}

/// Outcome of `complete_attempt`: applied, stale no-op, or unknown task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompleteOutcome {
    Completed(TaskStatus),
    StaleLease(TaskStatus),
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_roundtrip() {
        for s in &["queued", "leased", "running", "done", "failed", "blocked"] {
            let parsed: TaskStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Blocked.is_terminal());
        assert!(!TaskStatus::Queued.is_terminal());
        assert!(!TaskStatus::Leased.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn test_attempt_status_roundtrip() {
        for s in &["running", "done", "failed", "blocked"] {
            let parsed: AttemptStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("queued".parse::<AttemptStatus>().is_err());
    }

    #[test]
    fn test_event_level_roundtrip() {
        for s in &["info", "warn", "error"] {
            let parsed: EventLevel = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("debug".parse::<EventLevel>().is_err());
    }

    #[test]
    fn test_mode_roundtrip() {
        for s in &["auto", "lean", "full"] {
            let parsed: TaskMode = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("fast".parse::<TaskMode>().is_err());
    }

    #[test]
    fn test_serde_produces_lowercase_strings() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::Queued).unwrap(),
            "\"queued\""
        );
        assert_eq!(serde_json::to_string(&EventLevel::Warn).unwrap(), "\"warn\"");
        assert_eq!(serde_json::to_string(&TaskMode::Full).unwrap(), "\"full\"");
    }

    #[test]
    fn test_declared_mode_defaults_to_auto() {
        let mut task = sample_task();
        assert_eq!(task.declared_mode(), TaskMode::Auto);
        task.task_request = serde_json::json!({"mode": "lean"});
        assert_eq!(task.declared_mode(), TaskMode::Lean);
        task.task_request = serde_json::json!({"mode": "warp"});
        assert_eq!(task.declared_mode(), TaskMode::Auto);
    }

    fn sample_task() -> Task {
        Task {
            id: "t".into(),
            task_type: "generic".into(),
            title: "Untitled task".into(),
            prompt: "say hi".into(),
            success_criteria: None,
            task_request: serde_json::json!({}),
            priority: 3,
            attempt_count: 0,
            max_attempts: 3,
            status: TaskStatus::Queued,
            lease_owner: None,
            lease_expires_at: None,
            last_error: None,
            created_at: "2026-01-01T00:00:00.000Z".into(),
            updated_at: "2026-01-01T00:00:00.000Z".into(),
        }
    }
}
