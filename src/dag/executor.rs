//! Level-by-level parallel execution of a pipeline definition.
//!
//! Each level of the DAG is fanned out with `tokio::spawn` and joined before
//! the next level starts. Every stage runs its task list on a stage-scoped
//! working copy of the session; only its output keys are merged into the
//! shared session once the whole list has succeeded.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tracing::{debug, error, info, warn};

use super::builder::StageGraph;
use super::state::{ExecutionStatus, ExecutionTimer, PipelineEvent};
use crate::checkpoint::{CheckpointMetadata, GitCheckpointer};
use crate::errors::{ExecutionError, SessionError};
use crate::orchestrator::Orchestrator;
use crate::session::{Session, SessionHandle, SessionStatus, StageRecord};
use crate::stage::{PipelineDefinition, Stage, StageResult, StageStatus};
use crate::storage;
use crate::task::TaskResult;

/// Default wall-clock budget of one stage.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(1800);

/// Execution policy of the parallel executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Timeout of a stage that does not set its own
    pub stage_timeout: Duration,
    /// Maximum stages running at once inside a level
    pub max_parallel: usize,
    /// Skip every remaining stage after a level with a failure
    pub fail_fast: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
            max_parallel: 4,
            fail_fast: false,
        }
    }
}

/// How a spawned stage ended.
enum StageOutcome {
    Finished(Result<HashMap<String, TaskResult>, crate::errors::PipelineError>),
    TimedOut(Duration),
}

/// Runs pipeline definitions level by level.
pub struct PipelineExecutor {
    orchestrator: Orchestrator,
    config: ExecutorConfig,
    checkpoint: Option<(GitCheckpointer, Vec<String>)>,
    event_tx: Option<mpsc::Sender<PipelineEvent>>,
}

impl PipelineExecutor {
    pub fn new(orchestrator: Orchestrator, config: ExecutorConfig) -> Self {
        Self {
            orchestrator,
            config,
            checkpoint: None,
            event_tx: None,
        }
    }

    /// Commit a git checkpoint of `patterns` after every successful stage.
    pub fn with_checkpoints(mut self, checkpointer: GitCheckpointer, patterns: Vec<String>) -> Self {
        self.checkpoint = Some((checkpointer, patterns));
        self
    }

    /// Set the event channel for progress updates.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<PipelineEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// First stage of a session that has not succeeded yet.
    pub fn resume_session(&self, session_id: &str) -> Result<Option<String>, SessionError> {
        let handle = self.orchestrator.sessions().load_session(session_id)?;
        Ok(handle.session().next_stage())
    }

    /// Validate `def`, then run it level by level.
    ///
    /// Uses the session named by `def.session_id` when set, otherwise
    /// creates one seeded with `def.initial_data`. Stages that already
    /// succeeded in that session are carried over, not re-run.
    pub async fn execute_pipeline(
        &self,
        def: &PipelineDefinition,
    ) -> Result<ExecutionStatus, ExecutionError> {
        let timer = ExecutionTimer::start();
        let graph = StageGraph::build(def)?;
        let groups = graph.parallel_groups();

        let sessions = self.orchestrator.sessions();
        let mut handle = match &def.session_id {
            Some(id) => sessions.load_session(id)?,
            None => sessions.create_session(),
        };
        for (key, value) in &def.initial_data {
            if handle.session().get(key).is_none() {
                handle.set_data(key, value.clone());
            }
        }
        handle.set_stage_order(graph.topological_order(), Some(def.name.clone()));
        if handle.session().status != SessionStatus::Active {
            handle.update_status(SessionStatus::Active);
        }

        let session_id = handle.id();
        info!(%session_id, pipeline = %def.name, stages = def.stages.len(), levels = groups.len(), "starting pipeline");

        let mut status = ExecutionStatus::new(session_id, &def.name, def.stages.len());
        status.groups = groups.clone();
        let shared = Arc::new(Mutex::new(handle));
        let results_path = sessions.results_path(session_id);
        let mut halt: Option<String> = None;

        for group in &groups {
            let stages: Vec<&Stage> = group
                .stages
                .iter()
                .filter_map(|id| graph.stage(id))
                .collect();

            if let Some(reason) = &halt {
                let mut handle = shared.lock().await;
                for stage in &stages {
                    let result = StageResult::skipped(&stage.id, reason);
                    handle.record_stage(&stage.id, record_of(&result));
                    self.emit_event(PipelineEvent::StageSkipped {
                        stage_id: stage.id.clone(),
                        reason: reason.clone(),
                    })
                    .await;
                    status.add_result(result);
                }
                continue;
            }

            self.emit_event(PipelineEvent::LevelStarted {
                level: group.level,
                stages: group.stages.clone(),
            })
            .await;

            let level_results = self
                .execute_level(group.level, &stages, &shared, &status.stage_results)
                .await;

            let (mut succeeded, mut failed, mut skipped) = (0, 0, 0);
            for stage in &stages {
                let Some(result) = level_results.get(&stage.id) else {
                    continue;
                };
                match result.status {
                    StageStatus::Success => succeeded += 1,
                    StageStatus::Failed => failed += 1,
                    StageStatus::Skipped => skipped += 1,
                }
                status.add_result(result.clone());
            }

            self.emit_event(PipelineEvent::LevelCompleted {
                level: group.level,
                succeeded,
                failed,
                skipped,
            })
            .await;
            info!(%session_id, level = group.level, succeeded, failed, skipped, "level completed");

            status.total_duration = timer.elapsed();
            if !storage::save_json(&status, &results_path) {
                warn!(%session_id, "failed to persist intermediate results");
            }

            if let Some(reason) = level_results.values().find_map(capability_failure) {
                error!(%session_id, error = %reason, "capability unavailable, aborting pipeline");
                status.aborted = Some(reason.clone());
                halt = Some(format!("pipeline aborted: {}", reason));
            } else if self.config.fail_fast && failed > 0 {
                halt = Some("fail-fast: an earlier stage failed".to_string());
            }
        }

        {
            let mut handle = shared.lock().await;
            let final_status = if status.all_success() {
                SessionStatus::Completed
            } else {
                SessionStatus::Failed
            };
            handle.update_status(final_status);
        }

        status.total_duration = timer.elapsed();
        storage::save_json(&status, &results_path);

        self.emit_event(PipelineEvent::PipelineCompleted {
            success: status.all_success(),
            completed: status.completed,
            failed: status.failed,
            skipped: status.skipped,
        })
        .await;
        info!(
            %session_id,
            completed = status.completed,
            failed = status.failed,
            skipped = status.skipped,
            duration_secs = status.total_duration.as_secs_f64(),
            speedup = status.speedup(),
            "pipeline finished"
        );

        Ok(status)
    }

    /// Run every stage of one level concurrently and wait for all of them.
    ///
    /// Stages already recorded as successful are reported with
    /// `resumed = true`; stages with a dependency that did not succeed are
    /// skipped without being started. Every other stage runs under its own
    /// timeout, and a timeout yields a failed result instead of blocking the
    /// level.
    pub async fn execute_level(
        &self,
        level: usize,
        stages: &[&Stage],
        shared: &Arc<Mutex<SessionHandle>>,
        previous: &BTreeMap<String, StageResult>,
    ) -> HashMap<String, StageResult> {
        let sessions = self.orchestrator.sessions().clone();
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let mut results: HashMap<String, StageResult> = HashMap::new();

        // Only committed data from earlier levels is visible to this level.
        let snapshot: Session = {
            let mut handle = shared.lock().await;
            if let Some(first) = stages.iter().find(|s| !handle.session().stage_succeeded(&s.id)) {
                handle.update_stage(&first.id);
            }
            handle.session().clone()
        };

        let mut handles = Vec::new();
        for &stage in stages {
            if snapshot.stage_succeeded(&stage.id) {
                let result = resumed_result(stage, &snapshot);
                debug!(stage_id = %stage.id, "stage already succeeded, skipping execution");
                self.emit_event(PipelineEvent::StageCompleted {
                    result: Box::new(result.clone()),
                })
                .await;
                results.insert(stage.id.clone(), result);
                continue;
            }

            let unmet = stage.depends_on.iter().find(|dep| {
                !previous.get(*dep).is_some_and(StageResult::is_success)
                    && !snapshot.stage_succeeded(dep)
            });
            if let Some(dep) = unmet {
                let reason = format!("dependency '{}' did not succeed", dep);
                info!(stage_id = %stage.id, %reason, "skipping stage");
                let result = StageResult::skipped(&stage.id, &reason);
                shared.lock().await.record_stage(&stage.id, record_of(&result));
                self.emit_event(PipelineEvent::StageSkipped {
                    stage_id: stage.id.clone(),
                    reason,
                })
                .await;
                results.insert(stage.id.clone(), result);
                continue;
            }

            let stage = stage.clone();
            let mut working = sessions.stage_handle(&snapshot, &stage.id);
            let orchestrator = self.orchestrator.clone();
            let semaphore = semaphore.clone();
            let event_tx = self.event_tx.clone();
            let timeout = stage.timeout.unwrap_or(self.config.stage_timeout);

            handles.push(tokio::spawn(async move {
                // The stage clock starts once a slot is free.
                let _permit = semaphore.acquire_owned().await.ok();
                if let Some(tx) = &event_tx {
                    tx.send(PipelineEvent::StageStarted {
                        stage_id: stage.id.clone(),
                        level,
                    })
                    .await
                    .ok();
                }
                info!(stage_id = %stage.id, level, ?timeout, tasks = stage.tasks.len(), "stage started");

                let started = Instant::now();
                let outcome = match tokio::time::timeout(
                    timeout,
                    orchestrator.run_pipeline(&mut working, &stage.tasks),
                )
                .await
                {
                    Ok(result) => StageOutcome::Finished(result),
                    Err(_) => StageOutcome::TimedOut(timeout),
                };
                (stage, working, outcome, started.elapsed())
            }));
        }

        for joined in join_all(handles).await {
            let (stage, mut working, outcome, elapsed) = match joined {
                Ok(parts) => parts,
                Err(e) => {
                    error!(error = %e, "stage task panicked");
                    continue;
                }
            };

            let result = match outcome {
                StageOutcome::Finished(Ok(task_results)) => {
                    let outputs = working.session().context_for(&stage.output_keys());
                    StageResult::success(&stage.id, outputs, elapsed, timings(&task_results))
                }
                StageOutcome::Finished(Err(err)) => {
                    let mut result = StageResult::failure(&stage.id, &err.to_string(), elapsed);
                    result.task_timings = timings(&err.partial_results);
                    result.capability_unavailable = err.capability_unavailable;
                    result
                }
                StageOutcome::TimedOut(limit) => StageResult::failure(
                    &stage.id,
                    &format!("timed out after {}s", limit.as_secs_f64()),
                    elapsed,
                ),
            };

            let record = record_of(&result);
            working.record_stage(&stage.id, record.clone());

            if result.is_success() {
                let completed: Vec<String> = stage
                    .tasks
                    .iter()
                    .filter(|t| working.session().is_task_completed(&t.id))
                    .map(|t| t.id.clone())
                    .collect();
                let session_id = {
                    let mut handle = shared.lock().await;
                    handle.commit_stage(&stage.id, &result.outputs, &completed, record);
                    handle.id()
                };
                info!(stage_id = %stage.id, duration_secs = elapsed.as_secs_f64(), "stage succeeded");
                self.checkpoint_stage(session_id, &stage, completed).await;
            } else {
                warn!(stage_id = %stage.id, error = result.error.as_deref().unwrap_or(""), "stage failed");
                shared.lock().await.record_stage(&stage.id, record);
            }

            self.emit_event(PipelineEvent::StageCompleted {
                result: Box::new(result.clone()),
            })
            .await;
            results.insert(stage.id.clone(), result);
        }

        // A panicked stage still needs an outcome.
        for &stage in stages {
            if !results.contains_key(&stage.id) {
                let result = StageResult::failure(&stage.id, "stage task panicked", Duration::ZERO);
                shared.lock().await.record_stage(&stage.id, record_of(&result));
                results.insert(stage.id.clone(), result);
            }
        }

        results
    }

    /// git2 is blocking, so the commit runs on the blocking pool with no
    /// session lock held.
    async fn checkpoint_stage(&self, session_id: uuid::Uuid, stage: &Stage, completed: Vec<String>) {
        let Some((checkpointer, patterns)) = &self.checkpoint else {
            return;
        };
        let checkpointer = checkpointer.clone();
        let patterns = patterns.clone();
        let stage_name = stage.display_name().to_string();
        let metadata = CheckpointMetadata {
            task_id: stage.tasks.last().map(|t| t.id.clone()),
            completed_tasks: completed,
        };
        let created = tokio::task::spawn_blocking(move || {
            checkpointer.create_checkpoint(session_id, &stage_name, &patterns, &metadata)
        })
        .await;
        if let Err(e) = created {
            warn!(stage_id = %stage.id, error = %e, "checkpoint task failed");
        }
    }

    async fn emit_event(&self, event: PipelineEvent) {
        if let Some(ref tx) = self.event_tx {
            tx.send(event).await.ok();
        }
    }
}

fn timings(results: &HashMap<String, TaskResult>) -> BTreeMap<String, f64> {
    results
        .iter()
        .map(|(id, r)| (id.clone(), r.duration.as_secs_f64()))
        .collect()
}

fn record_of(result: &StageResult) -> StageRecord {
    StageRecord {
        status: result.status,
        duration_secs: result.duration.as_secs_f64(),
        error: result.error.clone(),
        finished_at: Utc::now(),
        task_timings: result.task_timings.clone(),
    }
}

fn resumed_result(stage: &Stage, session: &Session) -> StageResult {
    let record = session.stage_results.get(&stage.id);
    let duration = record.map_or(Duration::ZERO, |r| {
        Duration::try_from_secs_f64(r.duration_secs).unwrap_or(Duration::ZERO)
    });
    let timings = record.map(|r| r.task_timings.clone()).unwrap_or_default();
    let outputs: serde_json::Map<String, Value> = session.context_for(&stage.output_keys());
    let mut result = StageResult::success(&stage.id, outputs, duration, timings);
    result.resumed = true;
    result
}

fn capability_failure(result: &StageResult) -> Option<String> {
    if result.capability_unavailable {
        result.error.clone()
    } else {
        None
    }
}
