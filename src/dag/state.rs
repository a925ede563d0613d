//! Execution state reported by the parallel executor.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::builder::ParallelGroup;
use crate::stage::{StageResult, StageStatus};
use crate::util::duration_secs;

/// Events emitted while a pipeline runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    LevelStarted {
        level: usize,
        stages: Vec<String>,
    },
    StageStarted {
        stage_id: String,
        level: usize,
    },
    /// A stage finished (success or failure) or was carried over on resume.
    StageCompleted {
        result: Box<StageResult>,
    },
    StageSkipped {
        stage_id: String,
        reason: String,
    },
    LevelCompleted {
        level: usize,
        succeeded: usize,
        failed: usize,
        skipped: usize,
    },
    PipelineCompleted {
        success: bool,
        completed: usize,
        failed: usize,
        skipped: usize,
    },
}

/// Outcome of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub session_id: Uuid,
    pub pipeline_name: String,
    pub total_stages: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    #[serde(default)]
    pub stage_results: BTreeMap<String, StageResult>,
    #[serde(default)]
    pub groups: Vec<ParallelGroup>,
    /// Wall-clock duration of the run
    #[serde(rename = "total_duration_secs", with = "duration_secs")]
    pub total_duration: Duration,
    /// Sum of the durations of the stages executed in this run
    #[serde(rename = "sum_stage_duration_secs", with = "duration_secs")]
    pub sum_stage_duration: Duration,
    /// Set when the run stopped early because a capability was unavailable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

impl ExecutionStatus {
    pub fn new(session_id: Uuid, pipeline_name: &str, total_stages: usize) -> Self {
        Self {
            session_id,
            pipeline_name: pipeline_name.to_string(),
            total_stages,
            completed: 0,
            failed: 0,
            skipped: 0,
            stage_results: BTreeMap::new(),
            groups: Vec::new(),
            total_duration: Duration::ZERO,
            sum_stage_duration: Duration::ZERO,
            aborted: None,
        }
    }

    pub fn add_result(&mut self, result: StageResult) {
        match result.status {
            StageStatus::Success => self.completed += 1,
            StageStatus::Failed => self.failed += 1,
            StageStatus::Skipped => self.skipped += 1,
        }
        if !result.resumed {
            self.sum_stage_duration += result.duration;
        }
        self.stage_results.insert(result.stage_id.clone(), result);
    }

    pub fn result(&self, stage_id: &str) -> Option<&StageResult> {
        self.stage_results.get(stage_id)
    }

    pub fn all_success(&self) -> bool {
        self.completed == self.total_stages
    }

    /// Sum of stage durations over wall-clock duration.
    pub fn speedup(&self) -> f64 {
        let wall = self.total_duration.as_secs_f64();
        if wall <= 0.0 {
            return 1.0;
        }
        self.sum_stage_duration.as_secs_f64() / wall
    }

    pub fn completion_percentage(&self) -> f64 {
        if self.total_stages == 0 {
            return 100.0;
        }
        (self.completed as f64 / self.total_stages as f64) * 100.0
    }
}

/// Tracks execution timing.
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
