//! Per-kind task execution.
//!
//! AI-backed kinds go through the [`TaskExecutor`] seam under a timeout;
//! file operations and test-context preparation run locally against the
//! session and its workspace.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Map, Value, json};

use crate::errors::ExecutorError;
use crate::executor::TaskExecutor;
use crate::session::Session;
use crate::task::{FileAction, Task, TaskKind};

/// Execute `task` against `session` and return its output.
pub(crate) async fn dispatch(
    executor: &dyn TaskExecutor,
    task: &Task,
    session: &Session,
    timeout: Duration,
) -> Result<String, ExecutorError> {
    match &task.kind {
        TaskKind::AiQuery { prompt } => {
            let context = session.context_for(&task.context_keys);
            call_executor(executor, prompt, &context, timeout).await
        }
        TaskKind::ToolGeneration { tool_name, .. } => {
            let mut context = session.context_for(&task.context_keys);
            context.insert("tool_name".to_string(), Value::String(tool_name.clone()));
            call_executor(executor, &task.payload(), &context, timeout).await
        }
        TaskKind::FileOperation { action } => run_file_action(action, session),
        TaskKind::TestContextPrep { keys } => Ok(prepare_test_context(keys, session)),
    }
}

/// Call the executor, abandoning the call when `timeout` elapses.
async fn call_executor(
    executor: &dyn TaskExecutor,
    prompt: &str,
    context: &Map<String, Value>,
    timeout: Duration,
) -> Result<String, ExecutorError> {
    match tokio::time::timeout(timeout, executor.execute_task(prompt, context, timeout)).await {
        Ok(result) => result,
        Err(_) => Err(ExecutorError::TimedOut(timeout)),
    }
}

fn resolve(workspace: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

fn run_file_action(action: &FileAction, session: &Session) -> Result<String, ExecutorError> {
    match action {
        FileAction::WriteFromKey { path, key } => {
            let value = session.get(key).ok_or_else(|| {
                ExecutorError::Failed(format!("session key '{}' is not set", key))
            })?;
            let contents = match value {
                Value::String(s) => s.clone(),
                other => serde_json::to_string_pretty(other)
                    .map_err(|e| ExecutorError::Failed(format!("failed to encode '{}': {}", key, e)))?,
            };
            let target = resolve(&session.workspace, path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ExecutorError::Failed(format!("failed to create {}: {}", parent.display(), e))
                })?;
            }
            std::fs::write(&target, &contents).map_err(|e| {
                ExecutorError::Failed(format!("failed to write {}: {}", target.display(), e))
            })?;
            Ok(target.display().to_string())
        }
        FileAction::ReadFile { path } => {
            let target = resolve(&session.workspace, path);
            std::fs::read_to_string(&target).map_err(|e| {
                ExecutorError::Failed(format!("failed to read {}: {}", target.display(), e))
            })
        }
    }
}

fn prepare_test_context(keys: &[String], session: &Session) -> String {
    let context = session.context_for(keys);
    let missing: Vec<&String> = keys.iter().filter(|k| !context.contains_key(*k)).collect();
    let bundle = json!({
        "context": context,
        "missing": missing,
    });
    serde_json::to_string_pretty(&bundle).unwrap_or_else(|_| bundle.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Records the prompt and context of every call.
    struct Recorder {
        calls: Mutex<Vec<(String, Map<String, Value>)>>,
    }

    #[async_trait]
    impl TaskExecutor for Recorder {
        async fn execute_task(
            &self,
            prompt: &str,
            context: &Map<String, Value>,
            _timeout: Duration,
        ) -> Result<String, ExecutorError> {
            self.calls
                .lock()
                .unwrap()
                .push((prompt.to_string(), context.clone()));
            Ok("done".to_string())
        }
    }

    fn recorder() -> Recorder {
        Recorder {
            calls: Mutex::new(Vec::new()),
        }
    }

    #[tokio::test]
    async fn ai_query_receives_filtered_context() {
        let mut session = Session::new(PathBuf::from("/ws"));
        session.data.insert("design".into(), json!("doc"));
        session.data.insert("secret".into(), json!("hidden"));
        let task = Task::ai_query("t", "write code").with_context_keys(["design"]);

        let exec = recorder();
        let out = dispatch(&exec, &task, &session, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out, "done");

        let calls = exec.calls.lock().unwrap();
        assert_eq!(calls[0].0, "write code");
        assert!(calls[0].1.contains_key("design"));
        assert!(!calls[0].1.contains_key("secret"));
    }

    #[tokio::test]
    async fn tool_generation_adds_tool_name() {
        let session = Session::new(PathBuf::from("/ws"));
        let task = Task::new(
            "gen",
            TaskKind::ToolGeneration {
                tool_name: "word_count".into(),
                prompt: "count words".into(),
            },
        );
        let exec = recorder();
        dispatch(&exec, &task, &session, Duration::from_secs(5))
            .await
            .unwrap();
        let calls = exec.calls.lock().unwrap();
        assert!(calls[0].0.contains("word_count"));
        assert_eq!(calls[0].1.get("tool_name"), Some(&json!("word_count")));
    }

    #[tokio::test]
    async fn write_then_read_file_locally() {
        let dir = tempdir().unwrap();
        let mut session = Session::new(dir.path().to_path_buf());
        session.data.insert("code".into(), json!("print('hi')\n"));
        session.data.insert("design".into(), json!({"name": "x"}));
        let exec = recorder();

        let write = Task::new(
            "w",
            TaskKind::FileOperation {
                action: FileAction::WriteFromKey {
                    path: PathBuf::from("out/tool.py"),
                    key: "code".into(),
                },
            },
        );
        dispatch(&exec, &write, &session, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out/tool.py")).unwrap(),
            "print('hi')\n"
        );

        let write_json = Task::new(
            "wj",
            TaskKind::FileOperation {
                action: FileAction::WriteFromKey {
                    path: PathBuf::from("design.json"),
                    key: "design".into(),
                },
            },
        );
        dispatch(&exec, &write_json, &session, Duration::from_secs(5))
            .await
            .unwrap();
        let written: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("design.json")).unwrap())
                .unwrap();
        assert_eq!(written, json!({"name": "x"}));

        let read = Task::new(
            "r",
            TaskKind::FileOperation {
                action: FileAction::ReadFile {
                    path: PathBuf::from("out/tool.py"),
                },
            },
        );
        let out = dispatch(&exec, &read, &session, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out, "print('hi')\n");
        assert!(exec.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_operation_failures_are_reported() {
        let dir = tempdir().unwrap();
        let session = Session::new(dir.path().to_path_buf());
        let exec = recorder();

        let missing_key = Task::new(
            "w",
            TaskKind::FileOperation {
                action: FileAction::WriteFromKey {
                    path: PathBuf::from("a.txt"),
                    key: "nope".into(),
                },
            },
        );
        let err = dispatch(&exec, &missing_key, &session, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope"));

        let missing_file = Task::new(
            "r",
            TaskKind::FileOperation {
                action: FileAction::ReadFile {
                    path: PathBuf::from("absent.txt"),
                },
            },
        );
        assert!(
            dispatch(&exec, &missing_file, &session, Duration::from_secs(5))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_context_prep_reports_missing_keys() {
        let mut session = Session::new(PathBuf::from("/ws"));
        session.data.insert("code".into(), json!("def f(): pass"));
        let task = Task::new(
            "prep",
            TaskKind::TestContextPrep {
                keys: vec!["code".into(), "tool_spec".into()],
            },
        );
        let exec = recorder();
        let out = dispatch(&exec, &task, &session, Duration::from_secs(5))
            .await
            .unwrap();
        let bundle: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(bundle["context"]["code"], "def f(): pass");
        assert_eq!(bundle["missing"], json!(["tool_spec"]));
    }
}
