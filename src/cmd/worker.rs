//! `drover worker` — start a phase-runner loop.

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use drover::config::WorkerConfig;
use drover::worker::Worker;

pub async fn cmd_worker(provider: &str, stream_job_logs: bool, once: bool) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = WorkerConfig::from_env(Some(provider), stream_job_logs, once)?;
    Worker::new(cfg)?.run().await
}
