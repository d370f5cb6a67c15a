//! Store maintenance and status commands.

use anyhow::Result;

use drover::config::GatewayConfig;
use drover::store::Store;

pub fn open_store() -> Result<Store> {
    let config = GatewayConfig::from_env()?;
    Store::open(&config.db_path)
}

pub fn cmd_migrate() -> Result<()> {
    let config = GatewayConfig::from_env()?;
    Store::open(&config.db_path)?;
    println!("Schema up to date at {}", config.db_path.display());
    Ok(())
}

pub fn cmd_status() -> Result<()> {
    let store = open_store()?;
    let counts = store.status_counts()?;

    println!();
    if counts.is_empty() {
        println!("No tasks in the queue.");
    } else {
        println!("{:<10} Count", "Status");
        println!("{:<10} -----", "------");
        for (status, count) in &counts {
            println!("{:<10} {}", status.as_str(), count);
        }
    }

    let events = store.list_events(10, None)?;
    println!();
    if events.is_empty() {
        println!("No events recorded.");
    } else {
        println!("Recent events:");
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
    }
    println!();
    Ok(())
}
