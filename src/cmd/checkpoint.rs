//! Git checkpoint history and rollback.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use uuid::Uuid;

use pipewright::checkpoint::GitCheckpointer;
use pipewright::session::SessionManager;

pub fn cmd_checkpoints(workspace: &Path, session_id: &str) -> Result<()> {
    let id = Uuid::parse_str(session_id)
        .with_context(|| format!("Invalid session id '{}'", session_id))?;
    let checkpointer = GitCheckpointer::new(&SessionManager::new(workspace));
    let history = checkpointer.history(id);

    if history.is_empty() {
        println!("No checkpoints recorded for session {}", id);
        return Ok(());
    }

    println!();
    println!("{}", style(format!("Checkpoints for session {}", id)).bold().cyan());
    for record in history {
        let short = record.commit_hash.get(..8).unwrap_or(record.commit_hash.as_str());
        println!(
            "  {}  {}  {}",
            style(short).yellow(),
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.stage_name
        );
    }
    println!();
    Ok(())
}

pub fn cmd_rollback(workspace: &Path, commit: &str) -> Result<()> {
    let checkpointer = GitCheckpointer::new(&SessionManager::new(workspace));
    if !checkpointer.rollback_to_checkpoint(commit) {
        anyhow::bail!(
            "Rollback to {} failed; is {} a git repository containing that commit?",
            commit,
            workspace.display()
        );
    }
    println!(
        "{} working tree reset to {} (uncommitted changes were stashed)",
        style("Rolled back:").green().bold(),
        commit
    );
    Ok(())
}
