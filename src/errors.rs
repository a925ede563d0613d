//! Typed error hierarchy for the pipeline orchestrator.
//!
//! These types cover the failure classes of a run:
//! - `ConfigError`: static definition problems, detected before any task runs
//! - `ExecutorError`: failures of the external task executor seam
//! - `SessionError`: session lookup and decoding failures
//! - `PipelineError`: a required task failed; carries the partial results
//! - `ExecutionError`: a pipeline run could not start
//! - `AnalysisError`: a failure diagnosis or code fix could not be produced

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

use crate::task::TaskResult;

/// Static configuration errors in a pipeline definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Dependency cycle detected among stages: {}", stages.join(", "))]
    CycleDetected { stages: Vec<String> },

    #[error("Stage '{stage}' depends on unknown stage '{dependency}'")]
    UnknownDependency { stage: String, dependency: String },

    #[error("Duplicate stage id: {id}")]
    DuplicateStage { id: String },

    #[error("Duplicate task id: {id}")]
    DuplicateTask { id: String },

    #[error("Stage id must not be empty")]
    EmptyStageId,

    /// Stage ids name files under the state directory.
    #[error("Stage id '{id}' must not contain path separators or '..'")]
    InvalidStageId { id: String },
}

/// Errors returned by a [`TaskExecutor`](crate::executor::TaskExecutor).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    /// The backing capability (binary, SDK, credentials) is missing.
    /// Non-retryable; the whole pipeline stops.
    #[error("Capability unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("Task execution failed: {0}")]
    Failed(String),

    #[error("Task timed out after {}s", .0.as_secs_f64())]
    TimedOut(Duration),
}

impl ExecutorError {
    pub fn is_capability_unavailable(&self) -> bool {
        matches!(self, Self::CapabilityUnavailable(_))
    }
}

/// Errors from session lookup.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session {id} not found")]
    NotFound { id: String },

    #[error("Session {id} could not be decoded: {reason}")]
    Corrupt { id: String, reason: String },
}

/// A required task failed and aborted its task list.
///
/// `partial_results` holds every result produced before (and including) the
/// failing task so callers can inspect what succeeded.
#[derive(Debug, Clone, Error)]
#[error("Required task '{task_id}' failed: {message}")]
pub struct PipelineError {
    pub task_id: String,
    pub message: String,
    pub capability_unavailable: bool,
    pub partial_results: HashMap<String, TaskResult>,
}

impl PipelineError {
    pub fn new(
        task_id: &str,
        message: &str,
        capability_unavailable: bool,
        partial_results: HashMap<String, TaskResult>,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            message: message.to_string(),
            capability_unavailable,
            partial_results,
        }
    }

    /// Results of tasks that completed successfully before the abort.
    pub fn successful_results(&self) -> impl Iterator<Item = &TaskResult> {
        self.partial_results.values().filter(|r| r.success)
    }
}

/// Reasons a parallel pipeline run cannot start.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Invalid pipeline definition: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Errors from the feedback loop's diagnosis and fix collaborators.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("Unusable analyst output: {0}")]
    Unparseable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_cycle_lists_stages() {
        let err = ConfigError::CycleDetected {
            stages: vec!["a".into(), "b".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("cycle"));
        assert!(msg.contains("a, b"));
    }

    #[test]
    fn config_error_unknown_dependency_carries_names() {
        let err = ConfigError::UnknownDependency {
            stage: "design".into(),
            dependency: "ghost".into(),
        };
        match &err {
            ConfigError::UnknownDependency { stage, dependency } => {
                assert_eq!(stage, "design");
                assert_eq!(dependency, "ghost");
            }
            _ => panic!("Expected UnknownDependency"),
        }
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn execution_error_wraps_config_error() {
        let err: ExecutionError = ConfigError::DuplicateStage { id: "a".into() }.into();
        assert!(matches!(err, ExecutionError::Config(_)));
        assert!(err.to_string().contains("Duplicate stage id: a"));
    }

    #[test]
    fn executor_error_capability_is_distinguishable() {
        assert!(ExecutorError::CapabilityUnavailable("no sdk".into()).is_capability_unavailable());
        assert!(!ExecutorError::Failed("boom".into()).is_capability_unavailable());
        assert!(!ExecutorError::TimedOut(Duration::from_secs(1)).is_capability_unavailable());
    }

    #[test]
    fn executor_error_timeout_mentions_seconds() {
        let err = ExecutorError::TimedOut(Duration::from_millis(1500));
        assert!(err.to_string().contains("1.5s"));
    }

    #[test]
    fn pipeline_error_exposes_successful_partials() {
        let mut partial = HashMap::new();
        partial.insert("t1".to_string(), TaskResult::success("t1", "ok", Duration::ZERO));
        partial.insert(
            "t2".to_string(),
            TaskResult::failure("t2", "bad", Duration::ZERO),
        );
        let err = PipelineError::new("t2", "bad", false, partial);
        assert_eq!(err.successful_results().count(), 1);
        assert!(err.to_string().contains("t2"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ConfigError::EmptyStageId);
        assert_std_error(&ConfigError::InvalidStageId { id: "../x".into() });
        assert_std_error(&ExecutorError::Failed("x".into()));
        assert_std_error(&SessionError::NotFound { id: "x".into() });
        assert_std_error(&PipelineError::new("t", "m", false, HashMap::new()));
        assert_std_error(&ExecutionError::from(ConfigError::EmptyStageId));
        assert_std_error(&AnalysisError::Unparseable("x".into()));
    }
}
