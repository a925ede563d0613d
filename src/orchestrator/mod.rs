//! Sequential task orchestration.
//!
//! [`Orchestrator::run_pipeline`] executes a task list in declaration order
//! against a [`SessionHandle`], checkpointing after every task so a restart
//! resumes right after the last completed one.

mod dispatch;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::artifacts;
use crate::errors::PipelineError;
use crate::executor::TaskExecutor;
use crate::session::{SessionHandle, SessionManager, SessionStatus};
use crate::storage;
use crate::task::{DEFAULT_TASK_TIMEOUT, Task, TaskResult};

/// One line of the per-session task log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskLogRecord {
    pub task_id: String,
    pub success: bool,
    pub output_length: usize,
    pub duration_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl From<&TaskResult> for TaskLogRecord {
    fn from(result: &TaskResult) -> Self {
        Self {
            task_id: result.task_id.clone(),
            success: result.success,
            output_length: result.output.len(),
            duration_secs: result.duration.as_secs_f64(),
            error: result.error.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Runs task lists through a [`TaskExecutor`].
#[derive(Clone)]
pub struct Orchestrator {
    executor: Arc<dyn TaskExecutor>,
    sessions: SessionManager,
    task_timeout: Duration,
}

impl Orchestrator {
    pub fn new(executor: Arc<dyn TaskExecutor>, sessions: SessionManager) -> Self {
        Self {
            executor,
            sessions,
            task_timeout: DEFAULT_TASK_TIMEOUT,
        }
    }

    /// Timeout for tasks that do not set their own.
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Index of the first task to run: one past the last task already
    /// recorded as completed, or 0.
    pub fn resume_index(handle: &SessionHandle, tasks: &[Task]) -> usize {
        tasks
            .iter()
            .rposition(|t| handle.session().is_task_completed(&t.id))
            .map_or(0, |i| i + 1)
    }

    /// Execute `tasks` in order, resuming after already completed ones.
    ///
    /// A failed required task marks the session failed and aborts the list
    /// with a [`PipelineError`] carrying every result produced so far. A
    /// failed optional task is logged and skipped, unless the executor
    /// reported its capability as unavailable, which stops the list as well.
    pub async fn run_pipeline(
        &self,
        handle: &mut SessionHandle,
        tasks: &[Task],
    ) -> Result<HashMap<String, TaskResult>, PipelineError> {
        let session_id = handle.id();
        let start = Self::resume_index(handle, tasks);
        if start > 0 {
            info!(%session_id, skipped = start, "resuming task list after completed tasks");
        }

        let mut results: HashMap<String, TaskResult> = HashMap::new();

        for task in &tasks[start..] {
            let timeout = task.effective_timeout(self.task_timeout);
            debug!(%session_id, task_id = %task.id, kind = task.kind.label(), ?timeout, "executing task");

            let started = Instant::now();
            let outcome =
                dispatch::dispatch(self.executor.as_ref(), task, handle.session(), timeout).await;
            let elapsed = started.elapsed();

            match outcome {
                Ok(output) => {
                    let result = TaskResult::success(&task.id, &output, elapsed);
                    if let Some(key) = &task.save_key {
                        handle.set_data(key, artifacts::output_value(&output));
                    }
                    handle.add_completed_task(&task.id);
                    self.log_task(handle, &result);
                    info!(%session_id, task_id = %task.id, output_length = result.output.len(), "task completed");
                    results.insert(task.id.clone(), result);
                }
                Err(err) => {
                    let message = err.to_string();
                    let result = TaskResult::failure(&task.id, &message, elapsed);
                    self.log_task(handle, &result);
                    results.insert(task.id.clone(), result);

                    let fatal = task.required || err.is_capability_unavailable();
                    if fatal {
                        warn!(%session_id, task_id = %task.id, error = %message, "required task failed");
                        handle.update_status(SessionStatus::Failed);
                        return Err(PipelineError::new(
                            &task.id,
                            &message,
                            err.is_capability_unavailable(),
                            results,
                        ));
                    }
                    warn!(%session_id, task_id = %task.id, error = %message, "optional task failed, continuing");
                }
            }
        }

        handle.update_status(SessionStatus::Completed);
        Ok(results)
    }

    fn log_task(&self, handle: &SessionHandle, result: &TaskResult) {
        let path = self.sessions.task_log_path(handle.id());
        if !storage::append_json_line(&TaskLogRecord::from(result), &path) {
            warn!(session_id = %handle.id(), task_id = %result.task_id, "failed to append task log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ExecutorError;
    use async_trait::async_trait;
    use crate::artifacts::{Artifact, ToolSpecification};
    use serde_json::{Map, Value, json};
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Answers `output:<prompt>`; fails prompts listed in `fail`.
    struct ScriptedExecutor {
        calls: Mutex<Vec<String>>,
        fail: HashSet<String>,
        unavailable: bool,
    }

    impl ScriptedExecutor {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail: HashSet::new(),
                unavailable: false,
            }
        }

        fn failing(prompts: &[&str]) -> Self {
            Self {
                fail: prompts.iter().map(|p| p.to_string()).collect(),
                ..Self::new()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TaskExecutor for ScriptedExecutor {
        async fn execute_task(
            &self,
            prompt: &str,
            _context: &Map<String, Value>,
            _timeout: Duration,
        ) -> Result<String, ExecutorError> {
            self.calls.lock().unwrap().push(prompt.to_string());
            if self.unavailable {
                return Err(ExecutorError::CapabilityUnavailable("sdk missing".into()));
            }
            if self.fail.contains(prompt) {
                return Err(ExecutorError::Failed(format!("{} exploded", prompt)));
            }
            Ok(format!("output:{}", prompt))
        }
    }

    struct SlowExecutor;

    #[async_trait]
    impl TaskExecutor for SlowExecutor {
        async fn execute_task(
            &self,
            _prompt: &str,
            _context: &Map<String, Value>,
            _timeout: Duration,
        ) -> Result<String, ExecutorError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("late".into())
        }
    }

    /// Answers every prompt with a tool specification document.
    struct DesignExecutor;

    #[async_trait]
    impl TaskExecutor for DesignExecutor {
        async fn execute_task(
            &self,
            _prompt: &str,
            _context: &Map<String, Value>,
            _timeout: Duration,
        ) -> Result<String, ExecutorError> {
            let spec = ToolSpecification::new("word_count", "Count words in a text");
            Ok(format!("```json\n{}\n```", spec.to_value()))
        }
    }

    fn four_tasks() -> Vec<Task> {
        (1..=4)
            .map(|i| Task::ai_query(&format!("T{}", i), &format!("p{}", i)).save_as(&format!("k{}", i)))
            .collect()
    }

    #[tokio::test]
    async fn runs_all_tasks_in_order_and_completes() {
        let dir = tempdir().unwrap();
        let mgr = SessionManager::new(dir.path());
        let exec = Arc::new(ScriptedExecutor::new());
        let orch = Orchestrator::new(exec.clone(), mgr.clone());
        let mut handle = mgr.create_session();

        let results = orch.run_pipeline(&mut handle, &four_tasks()).await.unwrap();

        assert_eq!(results.len(), 4);
        assert_eq!(exec.calls(), vec!["p1", "p2", "p3", "p4"]);
        assert_eq!(handle.session().status, SessionStatus::Completed);
        assert_eq!(handle.session().get("k3"), Some(&json!("output:p3")));

        let reloaded = mgr.load_session(&handle.id().to_string()).unwrap();
        assert_eq!(reloaded.session().completed_tasks, vec!["T1", "T2", "T3", "T4"]);
    }

    #[tokio::test]
    async fn json_output_is_readable_as_artifact() {
        let dir = tempdir().unwrap();
        let mgr = SessionManager::new(dir.path());
        let orch = Orchestrator::new(Arc::new(DesignExecutor), mgr.clone());
        let mut handle = mgr.create_session();
        let tasks = vec![Task::ai_query("design", "design a word counter").save_as("tool_spec")];

        let results = orch.run_pipeline(&mut handle, &tasks).await.unwrap();
        assert!(results["design"].output.starts_with("```json"));

        let reloaded = mgr.load_session(&handle.id().to_string()).unwrap();
        let spec = reloaded
            .session()
            .get_typed::<ToolSpecification>("tool_spec")
            .unwrap();
        assert_eq!(spec.name, "word_count");
        assert_eq!(spec.version, ToolSpecification::VERSION);
    }

    #[tokio::test]
    async fn resume_skips_completed_tasks() {
        let dir = tempdir().unwrap();
        let mgr = SessionManager::new(dir.path());
        let exec = Arc::new(ScriptedExecutor::new());
        let orch = Orchestrator::new(exec.clone(), mgr.clone());
        let mut handle = mgr.create_session();
        handle.add_completed_task("T1");
        handle.add_completed_task("T2");

        let results = orch.run_pipeline(&mut handle, &four_tasks()).await.unwrap();

        assert_eq!(exec.calls(), vec!["p3", "p4"]);
        assert_eq!(results.len(), 2);
        assert!(results.contains_key("T3"));
        assert_eq!(handle.session().completed_tasks, vec!["T1", "T2", "T3", "T4"]);
    }

    #[tokio::test]
    async fn required_failure_carries_partial_results() {
        let dir = tempdir().unwrap();
        let mgr = SessionManager::new(dir.path());
        let exec = Arc::new(ScriptedExecutor::failing(&["p3"]));
        let orch = Orchestrator::new(exec.clone(), mgr.clone());
        let mut handle = mgr.create_session();

        let err = orch
            .run_pipeline(&mut handle, &four_tasks())
            .await
            .unwrap_err();

        assert_eq!(err.task_id, "T3");
        assert!(!err.capability_unavailable);
        assert_eq!(err.successful_results().count(), 2);
        assert!(err.partial_results["T1"].success);
        assert!(!err.partial_results["T3"].success);
        assert_eq!(exec.calls(), vec!["p1", "p2", "p3"]);

        let reloaded = mgr.load_session(&handle.id().to_string()).unwrap();
        assert_eq!(reloaded.session().status, SessionStatus::Failed);
        assert_eq!(reloaded.session().completed_tasks, vec!["T1", "T2"]);
    }

    #[tokio::test]
    async fn optional_failure_continues() {
        let dir = tempdir().unwrap();
        let mgr = SessionManager::new(dir.path());
        let exec = Arc::new(ScriptedExecutor::failing(&["p2"]));
        let orch = Orchestrator::new(exec.clone(), mgr.clone());
        let mut handle = mgr.create_session();

        let mut tasks = four_tasks();
        tasks[1] = tasks[1].clone().optional();
        let results = orch.run_pipeline(&mut handle, &tasks).await.unwrap();

        assert!(!results["T2"].success);
        assert!(results["T4"].success);
        assert_eq!(exec.calls().len(), 4);
        assert!(!handle.session().is_task_completed("T2"));
        assert!(handle.session().get("k2").is_none());
    }

    #[tokio::test]
    async fn capability_unavailable_is_fatal_even_for_optional_tasks() {
        let dir = tempdir().unwrap();
        let mgr = SessionManager::new(dir.path());
        let exec = Arc::new(ScriptedExecutor {
            unavailable: true,
            ..ScriptedExecutor::new()
        });
        let orch = Orchestrator::new(exec.clone(), mgr.clone());
        let mut handle = mgr.create_session();

        let tasks = vec![Task::ai_query("opt", "p").optional(), Task::ai_query("next", "q")];
        let err = orch.run_pipeline(&mut handle, &tasks).await.unwrap_err();
        assert!(err.capability_unavailable);
        assert_eq!(exec.calls().len(), 1);
        assert_eq!(handle.session().status, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn hung_task_times_out() {
        let dir = tempdir().unwrap();
        let mgr = SessionManager::new(dir.path());
        let orch = Orchestrator::new(Arc::new(SlowExecutor), mgr.clone());
        let mut handle = mgr.create_session();

        let tasks = vec![Task::ai_query("slow", "p").with_timeout(Duration::from_millis(100))];
        let start = Instant::now();
        let err = orch.run_pipeline(&mut handle, &tasks).await.unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(err.message.contains("timed out"));
    }

    #[tokio::test]
    async fn task_log_records_every_executed_task() {
        let dir = tempdir().unwrap();
        let mgr = SessionManager::new(dir.path());
        let exec = Arc::new(ScriptedExecutor::failing(&["p2"]));
        let orch = Orchestrator::new(exec, mgr.clone());
        let mut handle = mgr.create_session();

        let tasks = vec![Task::ai_query("a", "p1"), Task::ai_query("b", "p2").optional()];
        orch.run_pipeline(&mut handle, &tasks).await.unwrap();

        let records: Vec<TaskLogRecord> =
            storage::read_json_lines(&mgr.task_log_path(handle.id()));
        assert_eq!(records.len(), 2);
        assert!(records[0].success);
        assert_eq!(records[0].output_length, "output:p1".len());
        assert!(!records[1].success);
        assert!(records[1].error.as_deref().unwrap().contains("exploded"));
    }

    #[test]
    fn resume_index_uses_last_completed_task() {
        let dir = tempdir().unwrap();
        let mgr = SessionManager::new(dir.path());
        let mut handle = mgr.create_session();
        let tasks = four_tasks();
        assert_eq!(Orchestrator::resume_index(&handle, &tasks), 0);

        handle.add_completed_task("T3");
        assert_eq!(Orchestrator::resume_index(&handle, &tasks), 3);
    }
}
