//! The AI invocation seam.
//!
//! [`TaskExecutor`] is the only way the orchestrator reaches an LLM. The
//! production implementation, [`CommandExecutor`], pipes a prompt document
//! into an external CLI and returns its stdout. Tests substitute scripted
//! executors.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::errors::ExecutorError;

/// Abstraction over AI task execution.
/// Real implementation: `CommandExecutor`.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run `prompt` with `context` and return the raw output.
    ///
    /// Implementations should honour `timeout`; the orchestrator also wraps
    /// the call in its own timeout and drops the future when it expires.
    async fn execute_task(
        &self,
        prompt: &str,
        context: &Map<String, Value>,
        timeout: Duration,
    ) -> Result<String, ExecutorError>;
}

/// Render the document sent to an executor: context as JSON, then the prompt.
pub fn render_prompt(prompt: &str, context: &Map<String, Value>) -> String {
    if context.is_empty() {
        return prompt.to_string();
    }
    let context_json =
        serde_json::to_string_pretty(context).unwrap_or_else(|_| "{}".to_string());
    format!("## CONTEXT\n```json\n{}\n```\n\n## TASK\n{}", context_json, prompt)
}

/// Runs an external command per task, prompt on stdin, answer on stdout.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    command: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandExecutor {
    pub fn new(command: &str, args: Vec<String>) -> Self {
        Self {
            command: command.to_string(),
            args,
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    async fn run(&self, document: String) -> Result<String, ExecutorError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExecutorError::CapabilityUnavailable(format!(
                    "executor command '{}' not found",
                    self.command
                ))
            } else {
                ExecutorError::Failed(format!("failed to spawn '{}': {}", self.command, e))
            }
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(document.as_bytes())
                .await
                .map_err(|e| ExecutorError::Failed(format!("failed to write prompt: {}", e)))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| ExecutorError::Failed(format!("failed to close stdin: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ExecutorError::Failed(format!("failed to wait for executor: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExecutorError::Failed(format!(
                "executor exited with code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl TaskExecutor for CommandExecutor {
    async fn execute_task(
        &self,
        prompt: &str,
        context: &Map<String, Value>,
        timeout: Duration,
    ) -> Result<String, ExecutorError> {
        let document = render_prompt(prompt, context);
        debug!(command = %self.command, prompt_chars = document.len(), "spawning executor");
        // Dropping the future on timeout drops the child, which kills it.
        match tokio::time::timeout(timeout, self.run(document)).await {
            Ok(result) => result,
            Err(_) => Err(ExecutorError::TimedOut(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn render_prompt_without_context_is_prompt() {
        assert_eq!(render_prompt("do it", &Map::new()), "do it");
    }

    #[test]
    fn render_prompt_includes_context_json() {
        let mut ctx = Map::new();
        ctx.insert("design".into(), json!("a design"));
        let doc = render_prompt("write code", &ctx);
        assert!(doc.contains("\"design\": \"a design\""));
        assert!(doc.ends_with("write code"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_executor_echoes_stdin() {
        let exec = CommandExecutor::new("cat", vec![]);
        let out = exec
            .execute_task("hello", &Map::new(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn missing_command_is_capability_unavailable() {
        let exec = CommandExecutor::new("pipewright-no-such-binary-xyz", vec![]);
        let err = exec
            .execute_task("hello", &Map::new(), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(err.is_capability_unavailable());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_failure() {
        let exec = CommandExecutor::new("sh", vec!["-c".into(), "echo nope >&2; exit 3".into()]);
        let err = exec
            .execute_task("hello", &Map::new(), Duration::from_secs(10))
            .await
            .unwrap_err();
        match err {
            ExecutorError::Failed(msg) => {
                assert!(msg.contains("code 3"));
                assert!(msg.contains("nope"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_command_times_out() {
        let exec = CommandExecutor::new("sleep", vec!["5".into()]);
        let start = std::time::Instant::now();
        let err = exec
            .execute_task("", &Map::new(), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::TimedOut(_)));
        assert!(start.elapsed() < Duration::from_secs(3));
    }
}
