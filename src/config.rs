//! Environment-driven configuration for the gateway and worker processes.
//!
//! Every numeric variable falls back to its documented default when unset;
//! a value that is present but not a positive integer is a startup error.

use std::path::PathBuf;

use anyhow::{Result, anyhow};

fn env_string(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_positive_u64(key: &str, default: u64) -> Result<u64> {
    match std::env::var(key) {
        Ok(raw) => {
            let value: i64 = raw
                .trim()
                .parse()
                .map_err(|_| anyhow!("{} must be an integer, got '{}'", key, raw))?;
            if value <= 0 {
                return Err(anyhow!("{} must be positive, got {}", key, value));
            }
            Ok(value as u64)
        }
        Err(_) => Ok(default),
    }
}

/// Configuration for the HTTP gateway process.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub db_path: PathBuf,
    pub port: u16,
    /// Default lease TTL applied when a lease request omits `lease_ttl_ms`.
    pub lease_ttl_ms: u64,
    pub max_attempts: u32,
    /// Wall-clock deadline for the `/tasks/run` streaming response.
    pub run_deadline_ms: u64,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let port = env_positive_u64("QUEUE_API_PORT", 7070)?;
        if port > u16::MAX as u64 {
            return Err(anyhow!("QUEUE_API_PORT must fit in a port number, got {}", port));
        }
        Ok(Self {
            db_path: PathBuf::from(env_string("QUEUE_DB_PATH", "./data/queue.sqlite")),
            port: port as u16,
            lease_ttl_ms: env_positive_u64("QUEUE_LEASE_TTL_MS", 120_000)?,
            max_attempts: env_positive_u64("QUEUE_MAX_ATTEMPTS", 3)? as u32,
            run_deadline_ms: env_positive_u64("QUEUE_RUN_DEADLINE_MS", 1_800_000)?,
        })
    }
}

/// Configuration for the worker (phase runner) process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub api_base_url: String,
    pub worker_id: String,
    pub provider: String,
    pub poll_ms: u64,
    pub lease_ttl_ms: u64,
    pub phase_timeout_ms: u64,
    pub runs_dir: PathBuf,
    pub prompts_dir: PathBuf,
    /// Forward provider stream records to the event log during `execute`.
    pub stream_job_logs: bool,
    /// Process a single task and exit (scripted smoke tests).
    pub once: bool,
}

impl WorkerConfig {
    pub fn from_env(provider: Option<&str>, stream_job_logs: bool, once: bool) -> Result<Self> {
        let worker_id = match std::env::var("WORKER_ID") {
            Ok(v) if !v.trim().is_empty() => v,
            _ => {
                let host = env_string("HOSTNAME", "worker");
                format!("{}-{}", host, std::process::id())
            }
        };
        Ok(Self {
            api_base_url: env_string("WORKER_API_BASE_URL", "http://localhost:7070"),
            worker_id,
            provider: provider.unwrap_or("claude").to_string(),
            poll_ms: env_positive_u64("WORKER_POLL_MS", 2_000)?,
            lease_ttl_ms: env_positive_u64("WORKER_LEASE_TTL_MS", 120_000)?,
            phase_timeout_ms: env_positive_u64("WORKER_PHASE_TIMEOUT_MS", 600_000)?,
            runs_dir: PathBuf::from(env_string("WORKER_RUNS_DIR", "./runs")),
            prompts_dir: PathBuf::from(env_string("WORKER_PROMPTS_DIR", "./prompts")),
            stream_job_logs,
            once,
        })
    }

    /// Heartbeat cadence: a third of the lease TTL, floored at one second.
    pub fn heartbeat_interval_ms(&self) -> u64 {
        (self.lease_ttl_ms / 3).max(1_000)
    }
}
