//! Embedded SQLite store for the task queue.
//!
//! The store owns the schema for tasks, attempts, events, and the run-state
//! table. All lifecycle methods live in [`repository`] and execute inside a
//! single transaction each.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use chrono::{Duration, Utc};
use rusqlite::Connection;

pub mod models;
pub mod repository;

/// Current time as fixed-width ISO-8601 UTC. Fixed-width fields keep
/// lexicographic comparison equivalent to chronological comparison.
pub fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// An instant `ms` milliseconds from now, same fixed-width format.
pub fn iso_after_ms(ms: u64) -> String {
    (Utc::now() + Duration::milliseconds(ms as i64))
        .format("%Y-%m-%dT%H:%M:%S%.3fZ")
        .to_string()
}

/// Shared handle the gateway's request handlers clone freely.
///
/// SQLite work is synchronous, so each repository call runs as a closure on
/// tokio's blocking pool while the async side awaits the outcome. Lock
/// poisoning is recovered, not surfaced: every repository method either
/// commits or rolls back a whole transaction, so a holder that panicked
/// mid-call cannot have left partial writes behind, and the next caller may
/// safely take the guard.
#[derive(Clone)]
pub struct DbHandle {
    store: Arc<Mutex<Store>>,
}

impl DbHandle {
    pub fn new(store: Store) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
        }
    }

    /// Run one repository call from async code. The closure owns its
    /// captures; the result comes back once the blocking pool finishes.
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Store) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            let guard = store.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&guard)
        })
        .await
        .map_err(|e| anyhow!("store call aborted before completing: {}", e))?
    }

    /// Synchronous access for startup, one-shot CLI paths, and tests. Not
    /// for request handlers: it blocks the calling thread.
    pub fn lock_sync(&self) -> MutexGuard<'_, Store> {
        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open the queue database, creating the file and any parent directory
    /// on first use. Pragmas and schema are applied before the handle is
    /// handed out, so `db:migrate` is nothing more than an open.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Cannot create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Cannot open queue database at {}", path.display()))?;
        Self::bootstrap(conn)
    }

    /// A throwaway private database; the test suites live on this.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Cannot open in-memory queue database")?;
        Self::bootstrap(conn)
    }

    fn bootstrap(conn: Connection) -> Result<Self> {
        // WAL keeps readers unblocked during writes; busy_timeout is the
        // bounded retry on lock contention.
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("Connection pragmas were rejected")?;
        let store = Self { conn };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS tasks (
                    id TEXT PRIMARY KEY,
                    task_type TEXT NOT NULL DEFAULT 'generic',
                    title TEXT NOT NULL DEFAULT 'Untitled task',
                    prompt TEXT NOT NULL,
                    success_criteria TEXT,
                    task_request TEXT NOT NULL DEFAULT '{}',
                    priority INTEGER NOT NULL DEFAULT 3,
                    attempt_count INTEGER NOT NULL DEFAULT 0,
                    max_attempts INTEGER NOT NULL DEFAULT 3,
                    status TEXT NOT NULL DEFAULT 'queued',
                    lease_owner TEXT,
                    lease_expires_at TEXT,
                    last_error TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS task_attempts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                    attempt_no INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'running',
                    lease_owner TEXT,
                    lease_expires_at TEXT,
                    phase TEXT,
                    output_json TEXT NOT NULL DEFAULT '{}',
                    started_at TEXT NOT NULL,
                    finished_at TEXT,
                    UNIQUE(task_id, attempt_no)
                );

                CREATE TABLE IF NOT EXISTS task_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    task_id TEXT REFERENCES tasks(id) ON DELETE CASCADE,
                    attempt_id INTEGER,
                    phase TEXT NOT NULL,
                    level TEXT NOT NULL DEFAULT 'info',
                    message TEXT NOT NULL,
                    data_json TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS run_state (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_tasks_claim
                    ON tasks(status, priority, created_at);
                CREATE INDEX IF NOT EXISTS idx_tasks_lease_expiry
                    ON tasks(lease_expires_at);
                CREATE INDEX IF NOT EXISTS idx_events_created
                    ON task_events(created_at DESC);
                CREATE INDEX IF NOT EXISTS idx_events_task
                    ON task_events(task_id, created_at DESC);
                ",
            )
            .context("Schema creation failed")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_creates_schema() -> Result<()> {
        let store = Store::open_in_memory()?;
        let table_count: i32 = store.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table'
             AND name IN ('tasks', 'task_attempts', 'task_events', 'run_state')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 4, "Expected 4 tables to exist");

        let index_count: i32 = store.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='index'
             AND name IN ('idx_tasks_claim', 'idx_tasks_lease_expiry', 'idx_events_created', 'idx_events_task')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(index_count, 4, "Expected 4 indexes to exist");
        Ok(())
    }

    #[test]
    fn test_migrations_are_idempotent() -> Result<()> {
        let store = Store::open_in_memory()?;
        store.run_migrations()?;
        store.run_migrations()?;
        Ok(())
    }

    #[test]
    fn test_now_iso_is_fixed_width_and_sortable() {
        let a = now_iso();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = now_iso();
        assert_eq!(a.len(), "2026-01-01T00:00:00.000Z".len());
        assert_eq!(a.len(), b.len());
        assert!(a <= b, "timestamps must sort lexicographically: {} vs {}", a, b);
    }

    #[test]
    fn test_iso_after_sorts_after_now() {
        let now = now_iso();
        let later = iso_after_ms(60_000);
        assert!(later > now);
    }
}
