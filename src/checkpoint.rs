//! Git-backed checkpoints.
//!
//! Checkpointing is best-effort: a workspace that is not a git repository,
//! or that has nothing to commit, yields `None` and the pipeline carries on.
//! The state directory is never staged.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use git2::{ErrorCode, IndexAddOption, Repository, ResetType, Signature, StashFlags};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::session::SessionManager;
use crate::storage;

const MAX_LISTED_TASKS: usize = 5;

/// Extra context recorded in a checkpoint commit message.
#[derive(Debug, Clone, Default)]
pub struct CheckpointMetadata {
    pub task_id: Option<String>,
    pub completed_tasks: Vec<String>,
}

/// One entry of a session's checkpoint history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub commit_hash: String,
    pub stage_name: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Build the commit message of a checkpoint.
pub fn checkpoint_message(
    session_id: Uuid,
    stage_name: &str,
    metadata: &CheckpointMetadata,
    timestamp: DateTime<Utc>,
) -> String {
    let mut lines = vec![
        format!("[pipewright] checkpoint: {}", stage_name),
        String::new(),
        format!("Session: {}", session_id),
    ];
    if let Some(task_id) = &metadata.task_id {
        lines.push(format!("Task: {}", task_id));
    }
    if !metadata.completed_tasks.is_empty() {
        let shown: Vec<&str> = metadata
            .completed_tasks
            .iter()
            .take(MAX_LISTED_TASKS)
            .map(String::as_str)
            .collect();
        let mut listed = shown.join(", ");
        let hidden = metadata.completed_tasks.len().saturating_sub(MAX_LISTED_TASKS);
        if hidden > 0 {
            listed.push_str(&format!(" ... and {} more", hidden));
        }
        lines.push(format!("Completed: {}", listed));
    }
    lines.push(format!("Timestamp: {}", timestamp.to_rfc3339()));
    lines.join("\n")
}

/// Commits workspace snapshots and rolls back to them.
#[derive(Clone)]
pub struct GitCheckpointer {
    repo_dir: PathBuf,
    sessions: SessionManager,
}

impl GitCheckpointer {
    pub fn new(sessions: &SessionManager) -> Self {
        Self {
            repo_dir: sessions.workspace().to_path_buf(),
            sessions: sessions.clone(),
        }
    }

    /// Commit the files matching `patterns` and record the commit in the
    /// session's history. `None` when there is no repository, nothing to
    /// commit, or git failed.
    pub fn create_checkpoint(
        &self,
        session_id: Uuid,
        stage_name: &str,
        patterns: &[String],
        metadata: &CheckpointMetadata,
    ) -> Option<String> {
        let repo = match Repository::open(&self.repo_dir) {
            Ok(repo) => repo,
            Err(e) => {
                debug!(path = %self.repo_dir.display(), error = %e, "not a git repository, skipping checkpoint");
                return None;
            }
        };

        let timestamp = Utc::now();
        let message = checkpoint_message(session_id, stage_name, metadata, timestamp);
        match commit_snapshot(&repo, patterns, &message) {
            Ok(Some(hash)) => {
                let record = CheckpointRecord {
                    commit_hash: hash.clone(),
                    stage_name: stage_name.to_string(),
                    timestamp,
                    message,
                };
                let path = self.sessions.checkpoint_history_path(session_id);
                if !storage::append_json_line(&record, &path) {
                    warn!(%session_id, "failed to record checkpoint history");
                }
                info!(%session_id, stage = stage_name, commit = %hash, "checkpoint created");
                Some(hash)
            }
            Ok(None) => {
                debug!(%session_id, stage = stage_name, "no changes to checkpoint");
                None
            }
            Err(e) => {
                warn!(%session_id, stage = stage_name, error = %e, "checkpoint failed");
                None
            }
        }
    }

    /// Stash uncommitted changes, then hard-reset to `commit_hash`.
    pub fn rollback_to_checkpoint(&self, commit_hash: &str) -> bool {
        let mut repo = match Repository::open(&self.repo_dir) {
            Ok(repo) => repo,
            Err(e) => {
                warn!(error = %e, "rollback requires a git repository");
                return false;
            }
        };
        match rollback(&mut repo, commit_hash) {
            Ok(()) => {
                info!(commit = commit_hash, "rolled back to checkpoint");
                true
            }
            Err(e) => {
                warn!(commit = commit_hash, error = %e, "rollback failed");
                false
            }
        }
    }

    /// Checkpoints of a session, most recent first.
    pub fn history(&self, session_id: Uuid) -> Vec<CheckpointRecord> {
        let mut records: Vec<CheckpointRecord> =
            storage::read_json_lines(&self.sessions.checkpoint_history_path(session_id));
        records.reverse();
        records
    }

    pub fn latest_checkpoint(&self, session_id: Uuid) -> Option<CheckpointRecord> {
        self.history(session_id).into_iter().next()
    }
}

fn signature(repo: &Repository) -> Result<Signature<'static>> {
    match repo.signature() {
        Ok(sig) => Ok(sig.to_owned()),
        Err(_) => Signature::now("pipewright", "pipewright@localhost")
            .context("Failed to build git signature"),
    }
}

fn is_state_path(path: &Path) -> bool {
    path.components()
        .next()
        .is_some_and(|c| c.as_os_str() == crate::session::STATE_DIR)
}

/// Stage `patterns` and commit when the tree differs from HEAD.
fn commit_snapshot(repo: &Repository, patterns: &[String], message: &str) -> Result<Option<String>> {
    let mut index = repo.index().context("Failed to open git index")?;
    let mut skip_state = |path: &Path, _matched: &[u8]| -> i32 {
        if is_state_path(path) { 1 } else { 0 }
    };
    index
        .add_all(
            patterns.iter().map(String::as_str),
            IndexAddOption::DEFAULT,
            Some(&mut skip_state as &mut git2::IndexMatchedPath),
        )
        .context("Failed to stage files")?;
    index.write().context("Failed to write git index")?;

    let tree_id = index.write_tree().context("Failed to write tree")?;
    let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());

    let unchanged = match &parent {
        Some(commit) => commit.tree_id() == tree_id,
        None => index.is_empty(),
    };
    if unchanged {
        return Ok(None);
    }

    let tree = repo.find_tree(tree_id)?;
    let sig = signature(repo)?;
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
    let commit_id = repo
        .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
        .context("Failed to create checkpoint commit")?;
    Ok(Some(commit_id.to_string()))
}

fn rollback(repo: &mut Repository, commit_hash: &str) -> Result<()> {
    let sig = signature(repo)?;
    match repo.stash_save(
        &sig,
        &format!("[pipewright] before rollback to {}", commit_hash),
        Some(StashFlags::DEFAULT),
    ) {
        Ok(oid) => info!(stash = %oid, "stashed uncommitted changes"),
        Err(e) if e.code() == ErrorCode::NotFound => {}
        Err(e) => return Err(e).context("Failed to stash uncommitted changes"),
    }

    let target = repo
        .revparse_single(commit_hash)
        .with_context(|| format!("Unknown commit: {}", commit_hash))?;
    repo.reset(&target, ResetType::Hard, None)
        .context("Failed to reset to checkpoint")?;
    Ok(())
}
