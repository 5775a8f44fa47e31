//! A [`HookRunner`] that shells out to an external command.
//!
//! The event is written to the command's stdin as a single JSON document.
//! A non-zero exit, a spawn failure, or running past the timeout counts as
//! a hook failure.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use super::{HookRunner, SubagentEndedEvent};

/// Runs `program args...` once per ended run.
#[derive(Debug, Clone)]
pub struct CommandHookRunner {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandHookRunner {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Build from an argv-style list (`["notify", "--quiet"]`). Returns
    /// `None` for an empty list.
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone(), args.to_vec()))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl HookRunner for CommandHookRunner {
    fn has_hooks(&self) -> bool {
        true
    }

    async fn run_subagent_ended(&self, event: &SubagentEndedEvent) -> Result<()> {
        let payload = serde_json::to_vec(event).context("failed to encode subagent_ended event")?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("TETHER_HOOK", "subagent_ended")
            .env("TETHER_RUN_ID", &event.run_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn hook command {:?}", self.program))?;

        // The payload can exceed the pipe buffer, so the write runs under the
        // same timeout as the wait.
        let stdin_pipe = child.stdin.take();
        let run_id = event.run_id.as_str();
        let write_stdin = async move {
            if let Some(mut stdin) = stdin_pipe {
                if let Err(e) = stdin.write_all(&payload).await {
                    tracing::warn!(run_id = %run_id, error = %e, "failed to write event to hook stdin");
                }
            }
        };

        let mut stderr_pipe = child.stderr.take();
        let read_stderr = async {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stderr_pipe {
                pipe.read_to_end(&mut buf).await.ok();
            }
            String::from_utf8_lossy(&buf).into_owned()
        };

        let (status, stderr) = match tokio::time::timeout(self.timeout, async {
            let (status, stderr, ()) = tokio::join!(child.wait(), read_stderr, write_stdin);
            (status, stderr)
        })
        .await
        {
            Ok((status, stderr)) => (
                status.with_context(|| format!("failed to wait for hook command {:?}", self.program))?,
                stderr,
            ),
            Err(_elapsed) => {
                bail!(
                    "hook command {:?} timed out after {:?}",
                    self.program,
                    self.timeout
                );
            }
        };

        if !status.success() {
            bail!(
                "hook command {:?} exited with {}: {}",
                self.program,
                status,
                stderr.trim()
            );
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn event() -> SubagentEndedEvent {
        SubagentEndedEvent {
            run_id: "run-1".into(),
            child_session_key: "agent:main:subagent:test".into(),
            requester_session_key: "agent:main:main".into(),
            task: "task".into(),
            label: None,
            outcome: None,
            ended_at: Some(3),
        }
    }

    #[test]
    fn empty_argv_has_no_runner() {
        assert!(CommandHookRunner::from_argv(&[]).is_none());
    }

    #[tokio::test]
    async fn successful_command_is_ok() {
        let runner = CommandHookRunner::from_argv(&["cat".to_string()]).unwrap();
        runner.run_subagent_ended(&event()).await.unwrap();
    }

    #[tokio::test]
    async fn stdin_carries_the_event_json() {
        let tmp = tempfile::TempDir::new().unwrap();
        let out = tmp.path().join("event.json");
        let script = format!("cat > {}", out.display());
        let runner = CommandHookRunner::new("sh", vec!["-c".into(), script]);
        runner.run_subagent_ended(&event()).await.unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert_eq!(written["runId"], "run-1");
        assert_eq!(written["childSessionKey"], "agent:main:subagent:test");
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let runner = CommandHookRunner::new("sh", vec!["-c".into(), "echo nope >&2; exit 3".into()]);
        let err = runner.run_subagent_ended(&event()).await.unwrap_err();
        assert!(err.to_string().contains("nope"), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let runner = CommandHookRunner::new("sleep", vec!["5".into()])
            .with_timeout(Duration::from_millis(100));
        let err = runner.run_subagent_ended(&event()).await.unwrap_err();
        assert!(err.to_string().contains("timed out after 100ms"), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn timeout_covers_an_unread_oversized_payload() {
        let mut big = event();
        big.task = "x".repeat(1 << 20);
        let runner = CommandHookRunner::new("sleep", vec!["3".into()])
            .with_timeout(Duration::from_millis(200));

        let started = std::time::Instant::now();
        let err = runner.run_subagent_ended(&big).await.unwrap_err();
        assert!(err.to_string().contains("timed out"), "unexpected error: {err}");
        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    }
}
