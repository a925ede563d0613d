//! Session inspection: `pipewright sessions` and `pipewright status`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use pipewright::dag::ExecutionStatus;
use pipewright::orchestrator::TaskLogRecord;
use pipewright::session::{SessionManager, SessionStatus};
use pipewright::stage::StageStatus;
use pipewright::storage;

pub fn cmd_sessions(workspace: &Path) -> Result<()> {
    let sessions = SessionManager::new(workspace);
    let summaries = sessions.list_sessions();

    if summaries.is_empty() {
        println!("No sessions found in {}", sessions.sessions_dir().display());
        return Ok(());
    }

    println!();
    println!(
        "{:<36}  {:<9}  {:<20}  {:<16}  {:>5}  {}",
        "ID", "STATUS", "PIPELINE", "STAGE", "TASKS", "UPDATED"
    );
    for s in summaries {
        let status = match s.status {
            SessionStatus::Completed => style(s.status.to_string()).green(),
            SessionStatus::Failed => style(s.status.to_string()).red(),
            SessionStatus::Active => style(s.status.to_string()).yellow(),
        };
        println!(
            "{:<36}  {:<9}  {:<20}  {:<16}  {:>5}  {}",
            s.id,
            status,
            s.pipeline_name.as_deref().unwrap_or("-"),
            s.current_stage.as_deref().unwrap_or("-"),
            s.completed_tasks,
            s.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!();
    Ok(())
}

pub fn cmd_status(workspace: &Path, session_id: &str) -> Result<()> {
    let sessions = SessionManager::new(workspace);
    let handle = sessions
        .load_session(session_id)
        .with_context(|| format!("Cannot show session {}", session_id))?;
    let session = handle.session();

    println!();
    println!("{}", style(format!("Session {}", session.id)).bold().cyan());
    if let Some(name) = &session.pipeline_name {
        println!("  Pipeline:        {}", name);
    }
    println!("  Status:          {}", session.status);
    println!("  Created:         {}", session.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Updated:         {}", session.updated_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Current stage:   {}", session.current_stage.as_deref().unwrap_or("-"));
    println!("  Completed tasks: {}", session.completed_tasks.len());
    println!("  Data keys:       {}", session.data.len());
    if let Some(next) = session.next_stage() {
        println!("  Next stage:      {}", next);
    }

    if !session.stage_order.is_empty() {
        println!();
        println!("{}", style("Stages").bold());
        for stage_id in &session.stage_order {
            match session.stage_results.get(stage_id) {
                Some(record) => {
                    let marker = match record.status {
                        StageStatus::Success => style("✓").green(),
                        StageStatus::Failed => style("✗").red(),
                        StageStatus::Skipped => style("-").yellow(),
                    };
                    print!("  {} {} ({}, {:.1}s)", marker, stage_id, record.status, record.duration_secs);
                    match &record.error {
                        Some(error) => println!(": {}", error),
                        None => println!(),
                    }
                }
                None => println!("  {} {} (pending)", style("·").dim(), stage_id),
            }
        }
    }

    if let Some(status) = storage::load_typed::<ExecutionStatus>(&sessions.results_path(session.id)) {
        println!();
        println!(
            "  Last run: {:.0}% complete, {:.1}s wall clock, speedup {:.2}x",
            status.completion_percentage(),
            status.total_duration.as_secs_f64(),
            status.speedup()
        );
        if let Some(reason) = &status.aborted {
            println!("  Aborted: {}", style(reason).red());
        }
    }

    let log: Vec<TaskLogRecord> = storage::read_json_lines(&sessions.task_log_path(session.id));
    if !log.is_empty() {
        let failed = log.iter().filter(|r| !r.success).count();
        println!("  Task log: {} entries, {} failed", log.len(), failed);
    }
    println!();
    Ok(())
}
