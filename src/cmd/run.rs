//! Pipeline execution: `pipewright run`, `resume` and `groups`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use pipewright::checkpoint::GitCheckpointer;
use pipewright::config::PipewrightConfig;
use pipewright::dag::{ExecutionStatus, ExecutorConfig, PipelineEvent, PipelineExecutor, find_parallel_groups};
use pipewright::executor::TaskExecutor;
use pipewright::orchestrator::Orchestrator;
use pipewright::session::{SessionManager, SessionStatus};
use pipewright::stage::{PipelineDefinition, StageStatus};

/// CLI overrides for a run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub session: Option<String>,
    pub max_parallel: Option<usize>,
    pub stage_timeout: Option<u64>,
    pub fail_fast: bool,
    pub checkpoint: bool,
}

pub async fn cmd_run(workspace: &Path, definition: &Path, opts: RunOptions) -> Result<()> {
    let config = PipewrightConfig::new(workspace)?;
    print_warnings(&config);

    let mut def = PipelineDefinition::load(definition)?;
    if let Some(id) = opts.session {
        def.session_id = Some(id);
    }

    let mut exec_config = config.executor_config();
    if let Some(n) = opts.max_parallel {
        exec_config.max_parallel = n.max(1);
    }
    if let Some(secs) = opts.stage_timeout {
        exec_config.stage_timeout = Duration::from_secs(secs);
    }
    exec_config.fail_fast |= opts.fail_fast;
    let checkpoint = opts.checkpoint || config.toml.checkpoint.enabled;

    execute(&config, &mut def, exec_config, checkpoint, None).await
}

pub async fn cmd_resume(workspace: &Path, session_id: &str, definition: Option<&Path>) -> Result<()> {
    let config = PipewrightConfig::new(workspace)?;
    print_warnings(&config);

    let sessions = SessionManager::new(&config.workspace);
    let handle = sessions
        .load_session(session_id)
        .with_context(|| format!("Cannot resume session {}", session_id))?;
    let session = handle.session();

    if session.status == SessionStatus::Completed
        || (session.next_stage().is_none() && !session.stage_order.is_empty())
    {
        println!(
            "Session {} has nothing left to run ({}).",
            session.id,
            session.status
        );
        return Ok(());
    }

    let definition = definition
        .context("--definition is required to resume a session that has not finished")?;
    let mut def = PipelineDefinition::load(definition)?;
    if let Some(recorded) = &session.pipeline_name
        && recorded != &def.name
    {
        println!(
            "{} session was started by pipeline '{}', resuming with '{}'",
            style("Warning:").yellow().bold(),
            recorded,
            def.name
        );
    }
    def.session_id = Some(session.id.to_string());

    let exec_config = config.executor_config();
    let checkpoint = config.toml.checkpoint.enabled;
    execute(&config, &mut def, exec_config, checkpoint, Some(session_id)).await
}

pub fn cmd_groups(definition: &Path) -> Result<()> {
    let def = PipelineDefinition::load(definition)?;
    let groups = find_parallel_groups(&def).context("Invalid pipeline definition")?;

    println!();
    println!("{}", style(format!("Pipeline '{}'", def.name)).bold().cyan());
    println!(
        "  {} stages, {} tasks, {} levels",
        def.stages.len(),
        def.task_count(),
        groups.len()
    );
    println!();
    for group in &groups {
        println!("  Level {}: {}", group.level, group.stages.join(", "));
    }
    println!();
    Ok(())
}

async fn execute(
    config: &PipewrightConfig,
    def: &mut PipelineDefinition,
    exec_config: ExecutorConfig,
    checkpoint: bool,
    resume: Option<&str>,
) -> Result<()> {
    config.toml.apply_stage_overrides(def);

    let sessions = SessionManager::new(&config.workspace);
    let executor: Arc<dyn TaskExecutor> = Arc::new(config.command_executor());
    let orchestrator =
        Orchestrator::new(executor, sessions.clone()).with_task_timeout(config.task_timeout());

    let (tx, rx) = mpsc::channel(64);
    let mut pipeline = PipelineExecutor::new(orchestrator, exec_config).with_event_channel(tx);
    if checkpoint {
        pipeline = pipeline.with_checkpoints(
            GitCheckpointer::new(&sessions),
            config.toml.checkpoint.patterns.clone(),
        );
    }

    if let Some(id) = resume
        && let Some(stage) = pipeline.resume_session(id)?
    {
        println!("Resuming session {} at stage '{}'", id, stage);
    }

    println!();
    println!("{}", style(format!("Running pipeline '{}'", def.name)).bold().cyan());
    let printer = tokio::spawn(print_events(rx));
    let result = pipeline.execute_pipeline(def).await;
    // Closes the event channel so the printer drains and exits.
    drop(pipeline);
    let _ = printer.await;

    let status = result.context("Pipeline did not start")?;
    print_summary(&status);

    if let Some(reason) = &status.aborted {
        anyhow::bail!("Pipeline aborted: {}", reason);
    }
    if !status.all_success() {
        anyhow::bail!(
            "Pipeline finished with {} failed and {} skipped stage(s); resume with 'pipewright resume {} --definition <file>'",
            status.failed,
            status.skipped,
            status.session_id
        );
    }
    Ok(())
}

async fn print_events(mut rx: mpsc::Receiver<PipelineEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            PipelineEvent::LevelStarted { level, stages } => {
                println!();
                println!("{} {}", style(format!("Level {}", level)).bold(), stages.join(", "));
            }
            PipelineEvent::StageStarted { stage_id, .. } => {
                println!("  {} {}", style("▶").cyan(), stage_id);
            }
            PipelineEvent::StageCompleted { result } => match result.status {
                StageStatus::Success if result.resumed => {
                    println!("  {} {} {}", style("✓").green(), result.stage_id, style("(resumed)").dim());
                }
                StageStatus::Success => {
                    println!(
                        "  {} {} {}",
                        style("✓").green(),
                        result.stage_id,
                        style(format!("{:.1}s", result.duration.as_secs_f64())).dim()
                    );
                }
                _ => {
                    println!(
                        "  {} {}: {}",
                        style("✗").red(),
                        result.stage_id,
                        result.error.as_deref().unwrap_or("failed")
                    );
                }
            },
            PipelineEvent::StageSkipped { stage_id, reason } => {
                println!("  {} {} {}", style("-").yellow(), stage_id, style(reason).dim());
            }
            PipelineEvent::LevelCompleted { .. } | PipelineEvent::PipelineCompleted { .. } => {}
        }
    }
}

fn print_summary(status: &ExecutionStatus) {
    println!();
    println!("{}", style("Summary").bold().cyan());
    println!("  Session:   {}", status.session_id);
    println!(
        "  Stages:    {} succeeded, {} failed, {} skipped of {}",
        status.completed, status.failed, status.skipped, status.total_stages
    );
    println!(
        "  Duration:  {:.1}s (speedup {:.2}x)",
        status.total_duration.as_secs_f64(),
        status.speedup()
    );
    println!();
}

fn print_warnings(config: &PipewrightConfig) {
    for warning in config.validate() {
        println!("{} {}", style("Warning:").yellow().bold(), warning);
    }
}
