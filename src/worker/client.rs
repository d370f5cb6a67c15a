//! HTTP client for the worker side of the gateway contract.

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_json::Value;

use crate::store::models::{RunStateEntry, Task};

/// A lease response: the claimed task plus its freshly-opened attempt.
#[derive(Debug, Clone, Deserialize)]
pub struct LeasedTask {
    pub task: Task,
    pub attempt_no: i64,
    pub attempt_id: i64,
}

#[derive(Debug, Deserialize)]
struct LeaseResponse {
    task: Option<Task>,
    attempt_no: Option<i64>,
    attempt_id: Option<i64>,
}

#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    base: String,
    worker_id: String,
}

impl GatewayClient {
    pub fn new(base_url: &str, worker_id: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base_url.trim_end_matches('/').to_string(),
            worker_id: worker_id.to_string(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub async fn health(&self) -> Result<bool> {
        let resp = self.http.get(self.url("/health")).send().await?;
        Ok(resp.status().is_success())
    }

    pub async fn lease(&self, lease_ttl_ms: u64) -> Result<Option<LeasedTask>> {
        let resp = self
            .http
            .post(self.url("/tasks/lease"))
            .json(&serde_json::json!({
                "worker_id": self.worker_id,
                "lease_ttl_ms": lease_ttl_ms,
            }))
            .send()
            .await?
            .error_for_status()?
            .json::<LeaseResponse>()
            .await
            .context("Failed to decode lease response")?;
        match resp.task {
            Some(task) => {
                let attempt_no = resp
                    .attempt_no
                    .ok_or_else(|| anyhow!("lease response missing attempt_no"))?;
                let attempt_id = resp
                    .attempt_id
                    .ok_or_else(|| anyhow!("lease response missing attempt_id"))?;
                Ok(Some(LeasedTask {
                    task,
                    attempt_no,
                    attempt_id,
                }))
            }
            None => Ok(None),
        }
    }

    pub async fn heartbeat(&self, task_id: &str, lease_ttl_ms: u64) -> Result<()> {
        self.http
            .post(self.url(&format!("/tasks/{}/heartbeat", task_id)))
            .json(&serde_json::json!({
                "worker_id": self.worker_id,
                "lease_ttl_ms": lease_ttl_ms,
            }))
            .send()
            .await?
            .error_for_status()
            .context("Heartbeat rejected")?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn post_event(
        &self,
        task_id: &str,
        attempt_id: Option<i64>,
        phase: &str,
        level: &str,
        message: &str,
        data: Value,
    ) -> Result<()> {
        self.http
            .post(self.url(&format!("/tasks/{}/events", task_id)))
            .json(&serde_json::json!({
                "worker_id": self.worker_id,
                "attempt_id": attempt_id,
                "phase": phase,
                "level": level,
                "message": message,
                "data": data,
            }))
            .send()
            .await?
            .error_for_status()
            .context("Event ingest rejected")?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn complete(
        &self,
        task_id: &str,
        succeeded: bool,
        blocked: bool,
        output_json: Value,
        final_phase: &str,
        error_message: Option<&str>,
        worker_exit_code: Option<i64>,
    ) -> Result<String> {
        let resp = self
            .http
            .post(self.url(&format!("/tasks/{}/complete", task_id)))
            .json(&serde_json::json!({
                "worker_id": self.worker_id,
                "succeeded": succeeded,
                "blocked": blocked,
                "output_json": output_json,
                "final_phase": final_phase,
                "error_message": error_message,
                "worker_exit_code": worker_exit_code,
            }))
            .send()
            .await?
            .error_for_status()
            .context("Completion rejected")?
            .json::<Value>()
            .await?;
        Ok(resp
            .get("status")
            .and_then(|s| s.as_str())
            .unwrap_or("unknown")
            .to_string())
    }

    pub async fn get_state(&self, key: &str) -> Result<Option<RunStateEntry>> {
        let resp = self
            .http
            .get(self.url(&format!("/state/{}", key)))
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let entry = resp
            .error_for_status()?
            .json::<RunStateEntry>()
            .await
            .context("Failed to decode state entry")?;
        Ok(Some(entry))
    }

    pub async fn set_state(&self, key: &str, value: Value) -> Result<()> {
        self.http
            .post(self.url(&format!("/state/{}", key)))
            .json(&serde_json::json!({"value": value}))
            .send()
            .await?
            .error_for_status()
            .context("State write rejected")?;
        Ok(())
    }
}
