//! Task inspection and creation commands.

use anyhow::{Result, anyhow};
use serde_json::json;

use drover::store::models::{NewTask, TaskMode, TaskStatus};

use super::db::open_store;

pub fn cmd_tasks_list(status: Option<&str>) -> Result<()> {
    let status = match status {
        Some(raw) => Some(
            raw.parse::<TaskStatus>()
                .map_err(|e| anyhow!(e))?,
        ),
        None => None,
    };
    let store = open_store()?;
    let tasks = store.list_tasks(status)?;

    println!();
    if tasks.is_empty() {
        println!("No tasks found.");
        println!();
        return Ok(());
    }
    println!(
        "{:<34} {:<8} {:<4} {:<9} Title",
        "Id", "Status", "Pri", "Attempts"
    );
    for task in &tasks {
        println!(
            "{:<34} {:<8} {:<4} {:<9} {}",
            task.id,
            task.status.as_str(),
            task.priority,
            format!("{}/{}", task.attempt_count, task.max_attempts),
            task.title
        );
    }
    println!();
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn cmd_tasks_create(
    prompt: &str,
    title: Option<&str>,
    task_type: Option<&str>,
    mode: Option<&str>,
    priority: Option<i64>,
    success_criteria: Option<&str>,
) -> Result<()> {
    if prompt.trim().is_empty() {
        return Err(anyhow!("prompt must not be empty"));
    }
    let mode = match mode {
        Some(raw) => raw.parse::<TaskMode>().map_err(|e| anyhow!(e))?,
        None => TaskMode::Auto,
    };
    let store = open_store()?;
    let max_attempts = drover::config::GatewayConfig::from_env()?.max_attempts;
    let task = store.create_task(
        NewTask {
            task_type: task_type.map(String::from),
            title: title.map(String::from),
            prompt: prompt.to_string(),
            success_criteria: success_criteria.map(String::from),
            priority,
            max_attempts: None,
            task_request: json!({"mode": mode.as_str()}),
        },
        max_attempts,
    )?;
    println!("Created task {} ({})", task.id, task.title);
    Ok(())
}

pub fn cmd_tasks_show(id: &str) -> Result<()> {
    let store = open_store()?;
    let task = store
        .get_task(id)?
        .ok_or_else(|| anyhow!("Task {} not found", id))?;
    println!("{}", serde_json::to_string_pretty(&task)?);

    let attempts = store.list_attempts(id)?;
    if !attempts.is_empty() {
        println!();
        println!("Attempts:");
        for attempt in &attempts {
            println!(
                "  #{} {} phase={} started={} finished={}",
                attempt.attempt_no,
                attempt.status.as_str(),
                attempt.phase.as_deref().unwrap_or("-"),
                attempt.started_at,
                attempt.finished_at.as_deref().unwrap_or("-"),
            );
        }
    }
    Ok(())
}

pub fn cmd_events_tail(limit: i64, task_id: Option<&str>) -> Result<()> {
    let store = open_store()?;
    let mut events = store.list_events(limit, task_id)?;
    events.reverse(); // oldest first reads naturally in a terminal
    for event in &events {
        println!(
            "{}  [{:<5}] {:<10} {}  {}",
            event.created_at,
            event.level.as_str(),
            event.phase,
            event.task_id.as_deref().unwrap_or("-"),
            event.message
        );
    }
    Ok(())
}
