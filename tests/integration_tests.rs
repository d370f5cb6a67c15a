//! Integration tests for drover.
//!
//! CLI smoke tests run the real binary against a temp store; the
//! end-to-end test drives a live gateway and worker with a scripted
//! stand-in for the provider CLI.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

fn drover() -> Command {
    Command::cargo_bin("drover").unwrap()
}

fn db_path(dir: &TempDir) -> String {
    dir.path().join("queue.sqlite").to_string_lossy().to_string()
}

// =============================================================================
// Basic CLI tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        drover().arg("--help").assert().success();
    }

    #[test]
    fn test_version() {
        drover().arg("--version").assert().success();
    }

    #[test]
    fn test_migrate_creates_store() {
        let dir = TempDir::new().unwrap();
        drover()
            .env("QUEUE_DB_PATH", db_path(&dir))
            .arg("db:migrate")
            .assert()
            .success()
            .stdout(predicate::str::contains("Schema up to date"));
        assert!(dir.path().join("queue.sqlite").exists());
    }

    #[test]
    fn test_status_on_empty_store() {
        let dir = TempDir::new().unwrap();
        drover()
            .env("QUEUE_DB_PATH", db_path(&dir))
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No tasks in the queue"));
    }

    #[test]
    fn test_create_list_show_tail() {
        let dir = TempDir::new().unwrap();
        let db = db_path(&dir);

        drover()
            .env("QUEUE_DB_PATH", &db)
            .args([
                "tasks:create",
                "--prompt",
                "say hi",
                "--title",
                "Greeting",
                "--mode",
                "lean",
                "--priority",
                "2",
            ])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created task"));

        drover()
            .env("QUEUE_DB_PATH", &db)
            .args(["tasks:list", "--status", "queued"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Greeting"));

        drover()
            .env("QUEUE_DB_PATH", &db)
            .args(["events:tail", "--limit", "5"])
            .assert()
            .success()
            .stdout(predicate::str::contains("task_created"));
    }

    #[test]
    fn test_create_rejects_bad_mode() {
        let dir = TempDir::new().unwrap();
        drover()
            .env("QUEUE_DB_PATH", db_path(&dir))
            .args(["tasks:create", "--prompt", "p", "--mode", "warp"])
            .assert()
            .failure();
    }

    #[test]
    fn test_non_positive_env_is_startup_error() {
        let dir = TempDir::new().unwrap();
        drover()
            .env("QUEUE_DB_PATH", db_path(&dir))
            .env("QUEUE_MAX_ATTEMPTS", "0")
            .arg("status")
            .assert()
            .failure()
            .stderr(predicate::str::contains("QUEUE_MAX_ATTEMPTS"));
    }

    #[test]
    fn test_worker_rejects_unknown_provider() {
        drover()
            .args(["worker", "--provider", "imaginary", "--once"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown provider"));
    }
}

// =============================================================================
// End-to-end: gateway + worker + scripted provider
// =============================================================================

#[cfg(unix)]
mod end_to_end {
    use super::*;
    use std::sync::Arc;

    use drover::config::{GatewayConfig, WorkerConfig};
    use drover::gateway::{AppState, build_router};
    use drover::store::{DbHandle, Store};
    use drover::worker::Worker;

    const FAKE_PROVIDER: &str = r#"#!/bin/sh
prompt=$(cat)
emit() { printf '%s\n' "$1"; }
case "$prompt" in
*"mode classifier"*)
  emit '{"type":"result","subtype":"success","result":"{\"mode\":\"lean\"}","is_error":false}'
  ;;
*"interpretation stage"*)
  case "$prompt" in
  *AMBIGUOUS*)
    emit '{"type":"result","subtype":"success","result":"{\"objective\":\"unclear\",\"route\":\"blocked_for_clarification\",\"critical_blocker\":true,\"clarifications_needed\":[\"need account id\"]}","is_error":false}'
    ;;
  *)
    emit '{"type":"result","subtype":"success","result":"{\"objective\":\"greet\",\"route\":\"proceed\",\"critical_blocker\":false}","is_error":false}'
    ;;
  esac
  ;;
*"planning stage"*)
  emit '{"type":"result","subtype":"success","result":"{\"steps\":[{\"id\":\"step-1\",\"description\":\"greet\"}],\"execute_output_format\":\"text\",\"execute_output_strict\":false}","is_error":false}'
  ;;
*"policy stage"*)
  emit '{"type":"result","subtype":"success","result":"{\"idempotency\":{\"key_fields\":[\"task.prompt\"]}}","is_error":false}'
  ;;
*"execution stage"*)
  emit '{"type":"assistant","message":{"content":[{"type":"tool_use","id":"tu1","name":"Bash","input":{"command":"echo hi"}}]}}'
  emit '{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"tu1","content":"hi"}]}}'
  emit '{"type":"result","subtype":"success","result":"{\"status\":\"succeeded\",\"summary\":\"said hi\"}","is_error":false}'
  ;;
*"verification stage"*)
  emit '{"type":"result","subtype":"success","result":"{\"pass\":true,\"reasons\":[\"output observed\"]}","is_error":false}'
  ;;
*"reporting stage"*)
  emit '{"type":"result","subtype":"success","result":"{\"message_markdown\":\"done\"}","is_error":false}'
  ;;
*)
  emit '{"type":"result","subtype":"success","result":"{\"status\":\"succeeded\"}","is_error":false}'
  ;;
esac
"#;

    fn write_fake_provider(dir: &TempDir) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.path().join("fake-claude");
        std::fs::write(&path, FAKE_PROVIDER).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().to_string()
    }

    async fn start_gateway() -> (String, Arc<AppState>) {
        let state = Arc::new(AppState {
            db: DbHandle::new(Store::open_in_memory().unwrap()),
            config: GatewayConfig {
                db_path: ":memory:".into(),
                port: 0,
                lease_ttl_ms: 30_000,
                max_attempts: 3,
                run_deadline_ms: 60_000,
            },
        });
        let router = build_router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{}", addr), state)
    }

    fn worker_config(base: &str, dir: &TempDir) -> WorkerConfig {
        WorkerConfig {
            api_base_url: base.to_string(),
            worker_id: "w-test".to_string(),
            provider: "claude".to_string(),
            poll_ms: 50,
            lease_ttl_ms: 30_000,
            phase_timeout_ms: 15_000,
            runs_dir: dir.path().join("runs"),
            prompts_dir: dir.path().join("prompts"),
            stream_job_logs: true,
            once: true,
        }
    }

    async fn run_worker_once(base: &str, dir: &TempDir) {
        let worker = Worker::new(worker_config(base, dir)).unwrap();
        worker.run().await.unwrap();
    }

    async fn get_json(client: &reqwest::Client, url: &str) -> Value {
        client.get(url).send().await.unwrap().json().await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_worker_drives_pipelines_end_to_end() {
        let dir = TempDir::new().unwrap();
        let script = write_fake_provider(&dir);
        std::env::set_var("CLAUDE_CMD", &script);

        let (base, _state) = start_gateway().await;
        let client = reqwest::Client::new();

        // ── Lean pipeline via auto classification ─────────────────────
        let created: Value = client
            .post(format!("{}/tasks/queue", base))
            .json(&serde_json::json!({
                "prompt": "say hi",
                "mode": "auto",
                "success_criteria": "the greeting is printed"
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let task_id = created["task_id"].as_str().unwrap().to_string();

        run_worker_once(&base, &dir).await;

        let task = get_json(&client, &format!("{}/tasks/{}", base, task_id)).await;
        assert_eq!(task["status"], "done");
        assert_eq!(task["attempt_count"], 1);

        let attempts = get_json(&client, &format!("{}/tasks/{}/attempts", base, task_id)).await;
        let output = &attempts["attempts"][0]["output_json"];
        assert_eq!(output["mode"]["configured"], "auto");
        assert_eq!(output["mode"]["effective"], "lean");
        assert_eq!(output["mode"]["classifier"]["mode"], "lean");
        assert_eq!(output["phase_outputs"]["execute"]["status"], "succeeded");
        assert_eq!(output["phase_outputs"]["verify"]["pass"], true);
        assert_eq!(output["phase_outputs"]["report"]["message_markdown"], "done");

        // Streamed envelopes made it into the event log with the
        // action / tool_result pairing intact.
        let events = get_json(
            &client,
            &format!("{}/tasks/{}/events?limit=500", base, task_id),
        )
        .await;
        let envelopes: Vec<&Value> = events["events"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|e| e["data"].get("envelope"))
            .collect();
        assert!(!envelopes.is_empty(), "expected envelope events");

        let actions: Vec<&Value> = envelopes
            .iter()
            .filter(|e| e["type"] == "action")
            .copied()
            .collect();
        let results: Vec<&Value> = envelopes
            .iter()
            .filter(|e| e["type"] == "tool_result")
            .copied()
            .collect();
        assert_eq!(actions.len(), 1);
        assert_eq!(results.len(), 1);
        assert_eq!(
            actions[0]["payload"]["action_id"],
            results[0]["payload"]["action_id"]
        );
        assert_eq!(results[0]["payload"]["ok"], true);
        assert!(envelopes.iter().any(|e| e["type"] == "artifact"));
        assert!(
            envelopes
                .iter()
                .any(|e| e["type"] == "state_change" && e["payload"]["to"] == "succeeded")
        );

        // ── Streaming run endpoint ────────────────────────────────────
        let worker_task = {
            let cfg = worker_config(&base, &dir);
            tokio::spawn(async move {
                Worker::new(cfg).unwrap().run().await.unwrap();
            })
        };

        let streamed = client
            .post(format!("{}/tasks/run", base))
            .json(&serde_json::json!({"prompt": "say hi again", "mode": "lean"}))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        worker_task.await.unwrap();

        let lines: Vec<Value> = streamed
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert!(lines.len() >= 2);
        for (i, line) in lines.iter().enumerate() {
            assert_eq!(line["sequence"], i as u64, "response sequence must be gapless");
        }
        assert_eq!(lines[0]["phase"], "intake");
        let last = lines.last().unwrap();
        assert_eq!(last["type"], "artifact");
        assert_eq!(last["payload"]["content"], "done");

        // ── Full pipeline, then an idempotent short-circuit ───────────
        let created: Value = client
            .post(format!("{}/tasks/queue", base))
            .json(&serde_json::json!({"prompt": "greet the user", "mode": "full"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let first_id = created["task_id"].as_str().unwrap().to_string();
        run_worker_once(&base, &dir).await;

        let first = get_json(&client, &format!("{}/tasks/{}", base, first_id)).await;
        assert_eq!(first["status"], "done");
        let attempts = get_json(&client, &format!("{}/tasks/{}/attempts", base, first_id)).await;
        let output = &attempts["attempts"][0]["output_json"];
        assert_eq!(output["phase_outputs"]["interpret"]["objective"], "greet");
        assert_eq!(output["phase_outputs"]["execute"]["status"], "succeeded");
        assert!(output.get("dedupe").is_none());

        let created: Value = client
            .post(format!("{}/tasks/queue", base))
            .json(&serde_json::json!({"prompt": "greet the user", "mode": "full"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let second_id = created["task_id"].as_str().unwrap().to_string();
        run_worker_once(&base, &dir).await;

        let second = get_json(&client, &format!("{}/tasks/{}", base, second_id)).await;
        assert_eq!(second["status"], "done");
        let attempts = get_json(&client, &format!("{}/tasks/{}/attempts", base, second_id)).await;
        let output = &attempts["attempts"][0]["output_json"];
        assert_eq!(output["dedupe"]["reused"], true);
        assert!(
            output["phase_outputs"].get("execute").is_none(),
            "dedupe hit must skip execution"
        );

        // ── Critical blocker from interpret ───────────────────────────
        let created: Value = client
            .post(format!("{}/tasks/queue", base))
            .json(&serde_json::json!({"prompt": "AMBIGUOUS request", "mode": "full"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let blocked_id = created["task_id"].as_str().unwrap().to_string();
        run_worker_once(&base, &dir).await;

        let blocked = get_json(&client, &format!("{}/tasks/{}", base, blocked_id)).await;
        assert_eq!(blocked["status"], "blocked");
        let attempts = get_json(&client, &format!("{}/tasks/{}/attempts", base, blocked_id)).await;
        assert_eq!(attempts["attempts"][0]["status"], "blocked");
        assert_eq!(attempts["attempts"][0]["phase"], "interpret");
        let output = &attempts["attempts"][0]["output_json"];
        assert_eq!(
            output["phase_outputs"]["report"]["clarifications_needed"][0],
            "need account id"
        );
    }
}
