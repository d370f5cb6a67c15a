//! Worker process: the supervisory loop that leases tasks from the
//! gateway, drives the phase pipeline against one subprocess at a time,
//! and reports completion exactly once per attempt.

use anyhow::{Context, Result, anyhow};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::prompts::PromptLibrary;
use crate::provider::adapter_for;

pub mod client;
pub mod output;
pub mod pipeline;
pub mod process;

use client::{GatewayClient, LeasedTask};
use pipeline::PhaseRunner;

pub struct Worker {
    cfg: WorkerConfig,
    client: GatewayClient,
    prompts: PromptLibrary,
}

impl Worker {
    pub fn new(cfg: WorkerConfig) -> Result<Self> {
        // Fail fast on an unknown provider instead of on the first lease.
        adapter_for(&cfg.provider)
            .ok_or_else(|| anyhow!("Unknown provider '{}'", cfg.provider))?;
        let client = GatewayClient::new(&cfg.api_base_url, &cfg.worker_id);
        let prompts = PromptLibrary::load(&cfg.prompts_dir);
        Ok(Self {
            cfg,
            client,
            prompts,
        })
    }

    /// The outer poll loop. Runs until ctrl-c (or after one processed task
    /// with `--once`).
    pub async fn run(&self) -> Result<()> {
        tracing::info!(
            worker_id = %self.cfg.worker_id,
            provider = %self.cfg.provider,
            api = %self.cfg.api_base_url,
            "worker started"
        );
        loop {
            match self.client.lease(self.cfg.lease_ttl_ms).await {
                Ok(Some(lease)) => {
                    self.process(lease).await;
                    if self.cfg.once {
                        return Ok(());
                    }
                }
                Ok(None) => {
                    tokio::time::sleep(std::time::Duration::from_millis(self.cfg.poll_ms)).await;
                }
                Err(e) => {
                    tracing::warn!(error = %format!("{:#}", e), "lease poll failed");
                    tokio::time::sleep(std::time::Duration::from_millis(self.cfg.poll_ms)).await;
                }
            }
        }
    }

    /// Handle one leased task: run directory, heartbeat timer, pipeline,
    /// then complete.
    async fn process(&self, lease: LeasedTask) {
        let run_id = Uuid::new_v4().simple().to_string();
        let run_dir = self.cfg.runs_dir.join(&run_id);
        let task_id = lease.task.id.clone();
        tracing::info!(task_id = %task_id, run_id = %run_id, attempt_no = lease.attempt_no, "processing task");

        if let Err(e) = tokio::fs::create_dir_all(&run_dir)
            .await
            .context("Failed to create run directory")
        {
            tracing::error!(error = %format!("{:#}", e), "run setup failed");
            let message = format!("{:#}", e);
            let _ = self
                .client
                .complete(
                    &task_id,
                    false,
                    false,
                    serde_json::json!({}),
                    "runtime",
                    Some(message.as_str()),
                    None,
                )
                .await;
            return;
        }

        let heartbeat = {
            let client = self.client.clone();
            let task_id = task_id.clone();
            let ttl = self.cfg.lease_ttl_ms;
            let interval = std::time::Duration::from_millis(self.cfg.heartbeat_interval_ms());
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // immediate first tick
                loop {
                    ticker.tick().await;
                    if let Err(e) = client.heartbeat(&task_id, ttl).await {
                        tracing::warn!(task_id = %task_id, error = %format!("{:#}", e), "heartbeat failed");
                    }
                }
            })
        };

        let mut adapter = adapter_for(&self.cfg.provider)
            .expect("provider validated at construction");
        let runner = PhaseRunner::new(&self.cfg, &self.client, &self.prompts);
        let outcome = runner.run(&mut adapter, &lease, &run_id, run_dir).await;

        let status = self
            .client
            .complete(
                &task_id,
                outcome.succeeded,
                outcome.blocked,
                outcome.output_json,
                &outcome.final_phase,
                outcome.error_message.as_deref(),
                Some(0),
            )
            .await;
        heartbeat.abort();

        match status {
            Ok(status) => {
                tracing::info!(task_id = %task_id, status = %status, "task completed");
            }
            Err(e) => {
                // The lease will expire and the task requeues on its own.
                tracing::error!(task_id = %task_id, error = %format!("{:#}", e), "failed to report completion");
            }
        }
    }
}
