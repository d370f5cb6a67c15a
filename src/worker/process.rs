//! Provider subprocess lifecycle: spawn, feed stdin, collect both output
//! streams line by line, and enforce the per-phase timeout with a
//! termination signal followed by a hard kill.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::errors::RunnerError;
use crate::provider::ProviderCommand;

/// Grace period between the termination signal and the hard kill.
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

/// Byte-level line assembly. Keeps a trailing partial line until the next
/// chunk arrives; read chunk boundaries are not assumed to align with UTF-8
/// character boundaries.
#[derive(Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every newline-terminated line completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop(); // the newline
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// The residual partial line, emitted on stream close.
    pub fn take_residual(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Some(line)
    }
}

/// Run one provider invocation to completion or timeout. Completed stdout
/// lines are forwarded on `line_tx` as they arrive (the adapter's line
/// observer hangs off the receiving side).
pub async fn run_provider_command(
    command: &ProviderCommand,
    cwd: &Path,
    timeout: Duration,
    line_tx: Option<mpsc::UnboundedSender<String>>,
) -> Result<CapturedOutput, RunnerError> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .current_dir(cwd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if command.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);
    for (key, value) in &command.env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn().map_err(|source| RunnerError::SpawnFailed {
        command: command.program.clone(),
        source,
    })?;

    if let Some(input) = &command.stdin {
        if let Some(mut stdin) = child.stdin.take() {
            let input = input.clone();
            // Write in a task so a provider that fills its stdout pipe
            // before draining stdin cannot deadlock the runner.
            tokio::spawn(async move {
                let _ = stdin.write_all(input.as_bytes()).await;
                let _ = stdin.shutdown().await;
            });
        }
    }

    let stdout_task = {
        let stdout = child.stdout.take();
        let line_tx = line_tx.clone();
        tokio::spawn(async move { drain_stream(stdout, line_tx).await })
    };
    let stderr_task = {
        let stderr = child.stderr.take();
        tokio::spawn(async move { drain_stream(stderr, None).await })
    };

    let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => {
            let status = status.map_err(|source| RunnerError::SpawnFailed {
                command: command.program.clone(),
                source,
            })?;
            (status.code(), false)
        }
        Err(_) => {
            terminate(&mut child).await;
            (None, true)
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();
    Ok(CapturedOutput {
        stdout,
        stderr,
        exit_code,
        timed_out,
    })
}

async fn drain_stream<R>(reader: Option<R>, line_tx: Option<mpsc::UnboundedSender<String>>) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut reader = match reader {
        Some(r) => r,
        None => return String::new(),
    };
    let mut captured = String::new();
    let mut buffer = LineBuffer::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for line in buffer.push(&chunk[..n]) {
                    captured.push_str(&line);
                    captured.push('\n');
                    if let Some(tx) = &line_tx {
                        let _ = tx.send(line);
                    }
                }
            }
        }
    }
    if let Some(residual) = buffer.take_residual() {
        captured.push_str(&residual);
        captured.push('\n');
        if let Some(tx) = &line_tx {
            let _ = tx.send(residual);
        }
    }
    captured
}

/// Termination ladder: SIGTERM, a short grace period, then SIGKILL.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
                return;
            }
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_splits_on_newlines() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.push(b"one\ntwo\nthr"), vec!["one", "two"]);
        assert_eq!(buf.push(b"ee\n"), vec!["three"]);
        assert!(buf.take_residual().is_none());
    }

    #[test]
    fn test_line_buffer_keeps_partial_line() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"no newline yet").is_empty());
        assert_eq!(buf.take_residual().as_deref(), Some("no newline yet"));
        assert!(buf.take_residual().is_none());
    }

    #[test]
    fn test_line_buffer_strips_carriage_returns() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.push(b"windows\r\n"), vec!["windows"]);
    }

    #[test]
    fn test_line_buffer_survives_split_utf8() {
        // "héllo\n" with the two-byte é split across chunks.
        let bytes = "h\u{e9}llo\n".as_bytes();
        let mut buf = LineBuffer::new();
        assert!(buf.push(&bytes[..2]).is_empty());
        assert_eq!(buf.push(&bytes[2..]), vec!["h\u{e9}llo"]);
    }

    fn shell(script: &str, stdin: Option<&str>) -> ProviderCommand {
        ProviderCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            stdin: stdin.map(String::from),
            env: Vec::new(),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_captures_stdout_and_exit_code() {
        let cmd = shell("printf 'a\\nb\\n'; exit 0", None);
        let out = run_provider_command(&cmd, Path::new("."), Duration::from_secs(5), None)
            .await
            .unwrap();
        assert_eq!(out.stdout, "a\nb\n");
        assert_eq!(out.exit_code, Some(0));
        assert!(!out.timed_out);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_forwards_lines_to_observer_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cmd = shell("printf 'one\\ntwo'", None);
        let out = run_provider_command(&cmd, Path::new("."), Duration::from_secs(5), Some(tx))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("one"));
        // Residual partial line is emitted on close.
        assert_eq!(rx.recv().await.as_deref(), Some("two"));
        assert_eq!(out.stdout, "one\ntwo\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdin_reaches_child() {
        let cmd = shell("cat", Some("fed via stdin"));
        let out = run_provider_command(&cmd, Path::new("."), Duration::from_secs(5), None)
            .await
            .unwrap();
        assert_eq!(out.stdout, "fed via stdin\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_and_stderr_capture() {
        let cmd = shell("echo oops >&2; exit 3", None);
        let out = run_provider_command(&cmd, Path::new("."), Duration::from_secs(5), None)
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stderr, "oops\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_child() {
        let cmd = shell("sleep 30", None);
        let started = std::time::Instant::now();
        let out = run_provider_command(&cmd, Path::new("."), Duration::from_millis(200), None)
            .await
            .unwrap();
        assert!(out.timed_out);
        assert!(out.exit_code.is_none());
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "termination must not wait for the child's natural exit"
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let cmd = ProviderCommand {
            program: "definitely-not-a-real-binary-9f2".to_string(),
            args: vec![],
            stdin: None,
            env: Vec::new(),
        };
        let err = run_provider_command(&cmd, Path::new("."), Duration::from_secs(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::SpawnFailed { .. }));
    }
}
