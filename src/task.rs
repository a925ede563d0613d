//! Task definitions and results.
//!
//! A [`Task`] is the atomic unit of work in a stage. What it does is encoded
//! in a typed [`TaskKind`] rather than in sentinel payload strings, so the
//! dispatcher can match on the variant.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::util::{duration_secs, opt_duration_secs};

/// Default per-task timeout when neither the task nor the config sets one.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

/// Local file operations that never reach the AI executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FileAction {
    /// Write the session value stored under `key` to `path`.
    WriteFromKey { path: PathBuf, key: String },
    /// Read `path` and return its contents as the task output.
    ReadFile { path: PathBuf },
}

/// What a task does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Free-form query to the AI executor.
    AiQuery { prompt: String },
    /// File operation executed in the workspace.
    FileOperation { action: FileAction },
    /// AI query that produces a named tool.
    ToolGeneration { tool_name: String, prompt: String },
    /// Bundle existing session values into a test-generation context.
    TestContextPrep { keys: Vec<String> },
}

impl TaskKind {
    /// Whether this kind is executed by the external AI seam.
    pub fn uses_executor(&self) -> bool {
        matches!(self, Self::AiQuery { .. } | Self::ToolGeneration { .. })
    }

    /// Short lowercase label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::AiQuery { .. } => "ai_query",
            Self::FileOperation { .. } => "file_operation",
            Self::ToolGeneration { .. } => "tool_generation",
            Self::TestContextPrep { .. } => "test_context_prep",
        }
    }
}

/// A single unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique within a pipeline run
    pub id: String,
    /// What to do
    pub kind: TaskKind,
    /// Session keys exposed to the task as context
    #[serde(default)]
    pub context_keys: Vec<String>,
    /// Session key the output is written to on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_key: Option<String>,
    /// Whether failure aborts the remaining tasks
    #[serde(default = "default_required")]
    pub required: bool,
    /// Per-task timeout; `None` uses the configured default
    #[serde(
        default,
        rename = "timeout_secs",
        with = "opt_duration_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
}

fn default_required() -> bool {
    true
}

impl Task {
    /// Create a required task with no context or save key.
    pub fn new(id: &str, kind: TaskKind) -> Self {
        Self {
            id: id.to_string(),
            kind,
            context_keys: Vec::new(),
            save_key: None,
            required: true,
            timeout: None,
        }
    }

    /// Create an AI query task.
    pub fn ai_query(id: &str, prompt: &str) -> Self {
        Self::new(
            id,
            TaskKind::AiQuery {
                prompt: prompt.to_string(),
            },
        )
    }

    pub fn with_context_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.context_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn save_as(mut self, key: &str) -> Self {
        self.save_key = Some(key.to_string());
        self
    }

    /// Mark the task as optional: failure is logged and execution continues.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The textual payload of the task.
    pub fn payload(&self) -> String {
        match &self.kind {
            TaskKind::AiQuery { prompt } => prompt.clone(),
            TaskKind::ToolGeneration { tool_name, prompt } => {
                format!("Generate the tool '{}'.\n\n{}", tool_name, prompt)
            }
            TaskKind::FileOperation { action } => match action {
                FileAction::WriteFromKey { path, key } => {
                    format!("write {} from {}", path.display(), key)
                }
                FileAction::ReadFile { path } => format!("read {}", path.display()),
            },
            TaskKind::TestContextPrep { keys } => format!("prepare test context: {}", keys.join(", ")),
        }
    }

    /// Effective timeout given a configured default.
    pub fn effective_timeout(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }
}

/// Outcome of executing a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "duration_secs", with = "duration_secs")]
    pub duration: Duration,
}

impl TaskResult {
    pub fn success(task_id: &str, output: &str, duration: Duration) -> Self {
        Self {
            task_id: task_id.to_string(),
            success: true,
            output: output.to_string(),
            error: None,
            duration,
        }
    }

    pub fn failure(task_id: &str, error: &str, duration: Duration) -> Self {
        Self {
            task_id: task_id.to_string(),
            success: false,
            output: String::new(),
            error: Some(error.to_string()),
            duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_fields() {
        let task = Task::ai_query("design", "Design the tool")
            .with_context_keys(["requirements"])
            .save_as("design_doc")
            .optional()
            .with_timeout(Duration::from_secs(5));

        assert_eq!(task.id, "design");
        assert_eq!(task.context_keys, vec!["requirements"]);
        assert_eq!(task.save_key.as_deref(), Some("design_doc"));
        assert!(!task.required);
        assert_eq!(task.effective_timeout(DEFAULT_TASK_TIMEOUT), Duration::from_secs(5));
    }

    #[test]
    fn effective_timeout_falls_back_to_default() {
        let task = Task::ai_query("t", "p");
        assert_eq!(task.effective_timeout(Duration::from_secs(9)), Duration::from_secs(9));
    }

    #[test]
    fn task_deserializes_with_defaults() {
        let json = r#"{
            "id": "gen",
            "kind": {"type": "tool_generation", "tool_name": "grep", "prompt": "search files"},
            "save_key": "tool_code",
            "timeout_secs": 12.5
        }"#;
        let task: Task = serde_json::from_str(json).unwrap();
        assert!(task.required);
        assert!(task.context_keys.is_empty());
        assert_eq!(task.timeout, Some(Duration::from_millis(12_500)));
        assert!(task.kind.uses_executor());
        assert!(task.payload().contains("grep"));
    }

    #[test]
    fn file_operation_kind_is_tagged() {
        let json = r#"{
            "id": "save",
            "kind": {"type": "file_operation", "action": {"op": "write_from_key", "path": "out/tool.py", "key": "tool_code"}}
        }"#;
        let task: Task = serde_json::from_str(json).unwrap();
        assert_eq!(task.kind.label(), "file_operation");
        assert!(!task.kind.uses_executor());
        match task.kind {
            TaskKind::FileOperation {
                action: FileAction::WriteFromKey { path, key },
            } => {
                assert_eq!(path, PathBuf::from("out/tool.py"));
                assert_eq!(key, "tool_code");
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn task_result_constructors() {
        let ok = TaskResult::success("a", "out", Duration::from_secs(1));
        assert!(ok.success);
        assert!(ok.error.is_none());

        let bad = TaskResult::failure("b", "boom", Duration::ZERO);
        assert!(!bad.success);
        assert_eq!(bad.error.as_deref(), Some("boom"));
        assert!(bad.output.is_empty());
    }
}
