//! Stage and pipeline definitions.
//!
//! A [`Stage`] groups tasks under a name and declares which stages must
//! succeed before it runs and which session keys it produces. A
//! [`PipelineDefinition`] is the static DAG of stages plus the initial
//! session data.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::task::Task;
use crate::util::{duration_secs, opt_duration_secs};

/// Outcome status of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    Failed,
    Skipped,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageStatus::Success => write!(f, "success"),
            StageStatus::Failed => write!(f, "failed"),
            StageStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// A named group of tasks, a node of the pipeline DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Session keys this stage publishes once it succeeds
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Overrides the per-stage timeout of the executor
    #[serde(
        default,
        rename = "timeout_secs",
        with = "opt_duration_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
}

impl Stage {
    pub fn new(id: &str, name: &str, tasks: Vec<Task>, depends_on: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            tasks,
            depends_on,
            outputs: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }

    /// Keys merged into the shared session when the stage succeeds: the
    /// declared outputs, or the tasks' save keys when none are declared.
    pub fn output_keys(&self) -> Vec<String> {
        if !self.outputs.is_empty() {
            return self.outputs.clone();
        }
        let mut keys: Vec<String> = Vec::new();
        for key in self.tasks.iter().filter_map(|t| t.save_key.as_ref()) {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        keys
    }
}

/// Result of executing (or skipping) a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage_id: String,
    pub status: StageStatus,
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "duration_secs", with = "duration_secs")]
    pub duration: Duration,
    #[serde(default)]
    pub task_timings: BTreeMap<String, f64>,
    /// Success carried over from an earlier run of the same session
    #[serde(default)]
    pub resumed: bool,
    /// The failure came from a missing executor capability
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub capability_unavailable: bool,
}

impl StageResult {
    pub fn success(
        stage_id: &str,
        outputs: Map<String, Value>,
        duration: Duration,
        task_timings: BTreeMap<String, f64>,
    ) -> Self {
        Self {
            stage_id: stage_id.to_string(),
            status: StageStatus::Success,
            outputs,
            error: None,
            duration,
            task_timings,
            resumed: false,
            capability_unavailable: false,
        }
    }

    pub fn failure(stage_id: &str, error: &str, duration: Duration) -> Self {
        Self {
            stage_id: stage_id.to_string(),
            status: StageStatus::Failed,
            outputs: Map::new(),
            error: Some(error.to_string()),
            duration,
            task_timings: BTreeMap::new(),
            resumed: false,
            capability_unavailable: false,
        }
    }

    pub fn skipped(stage_id: &str, reason: &str) -> Self {
        Self {
            stage_id: stage_id.to_string(),
            status: StageStatus::Skipped,
            outputs: Map::new(),
            error: Some(reason.to_string()),
            duration: Duration::ZERO,
            task_timings: BTreeMap::new(),
            resumed: false,
            capability_unavailable: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StageStatus::Success
    }
}

/// A complete pipeline: named stages plus the initial session data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub initial_data: Map<String, Value>,
    /// Resume this session instead of creating a new one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl PipelineDefinition {
    pub fn new(name: &str, stages: Vec<Stage>) -> Self {
        Self {
            name: name.to_string(),
            stages,
            initial_data: Map::new(),
            session_id: None,
        }
    }

    pub fn with_initial_data(mut self, key: &str, value: Value) -> Self {
        self.initial_data.insert(key.to_string(), value);
        self
    }

    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    /// Load a definition from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline definition: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse pipeline definition: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("Invalid pipeline definition JSON")
    }

    pub fn stage(&self, id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == id)
    }

    pub fn stage_map(&self) -> HashMap<&str, &Stage> {
        self.stages.iter().map(|s| (s.id.as_str(), s)).collect()
    }

    pub fn task_count(&self) -> usize {
        self.stages.iter().map(|s| s.tasks.len()).sum()
    }
}
