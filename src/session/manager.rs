use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Session, SessionStatus, StageRecord};
use crate::artifacts::Artifact;
use crate::errors::SessionError;
use crate::storage;

/// Name of the state directory inside a workspace.
pub const STATE_DIR: &str = ".pipewright";

/// Lightweight listing entry for resume tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub current_stage: Option<String>,
    pub completed_tasks: usize,
    pub pipeline_name: Option<String>,
}

impl From<&Session> for SessionSummary {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id,
            created_at: s.created_at,
            updated_at: s.updated_at,
            status: s.status,
            current_stage: s.current_stage.clone(),
            completed_tasks: s.completed_tasks.len(),
            pipeline_name: s.pipeline_name.clone(),
        }
    }
}

/// A session bound to the file it checkpoints to.
///
/// Every mutator persists the full session before returning and reports
/// whether the write succeeded. The in-memory state is updated either way.
pub struct SessionHandle {
    session: Session,
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl SessionHandle {
    fn new(session: Session, path: PathBuf, write_lock: Arc<Mutex<()>>) -> Self {
        Self {
            session,
            path,
            write_lock,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn id(&self) -> Uuid {
        self.session.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn into_session(self) -> Session {
        self.session
    }

    /// Persist the full session. Safe to call from concurrent stages: writes
    /// through one manager are serialized.
    pub fn save_checkpoint(&self) -> bool {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let ok = storage::save_json(&self.session, &self.path);
        if ok {
            debug!(session_id = %self.session.id, path = %self.path.display(), "checkpoint saved");
        } else {
            warn!(session_id = %self.session.id, path = %self.path.display(), "checkpoint save failed");
        }
        ok
    }

    pub fn add_completed_task(&mut self, task_id: &str) -> bool {
        self.session.push_completed(task_id);
        self.session.touch();
        self.save_checkpoint()
    }

    pub fn update_stage(&mut self, stage_id: &str) -> bool {
        self.session.current_stage = Some(stage_id.to_string());
        self.session.touch();
        self.save_checkpoint()
    }

    pub fn update_status(&mut self, status: SessionStatus) -> bool {
        self.session.status = status;
        self.session.touch();
        self.save_checkpoint()
    }

    pub fn set_data(&mut self, key: &str, value: Value) -> bool {
        self.session.data.insert(key.to_string(), value);
        self.session.touch();
        self.save_checkpoint()
    }

    pub fn set_typed<A: Artifact>(&mut self, key: &str, artifact: &A) -> bool {
        self.set_data(key, artifact.to_value())
    }

    pub fn record_stage(&mut self, stage_id: &str, record: StageRecord) -> bool {
        self.session.stage_results.insert(stage_id.to_string(), record);
        self.session.touch();
        self.save_checkpoint()
    }

    pub fn set_stage_order(&mut self, order: Vec<String>, pipeline_name: Option<String>) -> bool {
        self.session.stage_order = order;
        if pipeline_name.is_some() {
            self.session.pipeline_name = pipeline_name;
        }
        self.session.touch();
        self.save_checkpoint()
    }

    /// Commit a finished stage in one write: merged outputs, its completed
    /// tasks, and its record.
    pub fn commit_stage(
        &mut self,
        stage_id: &str,
        outputs: &serde_json::Map<String, Value>,
        completed_tasks: &[String],
        record: StageRecord,
    ) -> bool {
        for (key, value) in outputs {
            self.session.data.insert(key.clone(), value.clone());
        }
        for task_id in completed_tasks {
            self.session.push_completed(task_id);
        }
        self.session.stage_results.insert(stage_id.to_string(), record);
        self.session.touch();
        self.save_checkpoint()
    }
}

/// Creates, loads and lists sessions stored under a workspace.
#[derive(Clone)]
pub struct SessionManager {
    workspace: PathBuf,
    state_dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl SessionManager {
    pub fn new(workspace: &Path) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            state_dir: workspace.join(STATE_DIR),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.state_dir.join("sessions")
    }

    pub fn session_path(&self, id: Uuid) -> PathBuf {
        self.sessions_dir().join(format!("{}.json", id))
    }

    pub fn stage_path(&self, id: Uuid, stage_id: &str) -> PathBuf {
        self.state_dir
            .join("stages")
            .join(format!("{}_{}.json", id, stage_id))
    }

    /// Aggregate stage results of the latest run, rewritten after every level.
    pub fn results_path(&self, id: Uuid) -> PathBuf {
        self.state_dir.join("results").join(format!("{}.json", id))
    }

    pub fn task_log_path(&self, id: Uuid) -> PathBuf {
        self.state_dir.join("logs").join(id.to_string()).join("tasks.jsonl")
    }

    pub fn feedback_dir(&self, id: Uuid) -> PathBuf {
        self.state_dir.join("feedback").join(id.to_string())
    }

    pub fn checkpoint_history_path(&self, id: Uuid) -> PathBuf {
        self.state_dir.join("checkpoints").join(format!("{}.jsonl", id))
    }

    /// Create and persist a new active session.
    pub fn create_session(&self) -> SessionHandle {
        let session = Session::new(self.workspace.clone());
        let path = self.session_path(session.id);
        let handle = SessionHandle::new(session, path, self.write_lock.clone());
        handle.save_checkpoint();
        handle
    }

    /// Load a session by id.
    pub fn load_session(&self, id: &str) -> Result<SessionHandle, SessionError> {
        let uuid = Uuid::parse_str(id.trim()).map_err(|_| SessionError::NotFound { id: id.to_string() })?;
        let path = self.session_path(uuid);
        if !path.exists() {
            return Err(SessionError::NotFound { id: id.to_string() });
        }
        let map = storage::load_json(&path);
        let session: Session =
            serde_json::from_value(Value::Object(map)).map_err(|e| SessionError::Corrupt {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        Ok(SessionHandle::new(session, path, self.write_lock.clone()))
    }

    /// Summaries of every readable session, newest first.
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let Ok(entries) = fs::read_dir(self.sessions_dir()) else {
            return Vec::new();
        };
        let mut summaries: Vec<SessionSummary> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|p| storage::load_typed::<Session>(&p))
            .map(|s| SessionSummary::from(&s))
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries
    }

    /// Stage-scoped working copy of `parent`.
    ///
    /// Starts from the parent's committed data. If an earlier run left a
    /// working copy for this stage, its completed tasks and the keys it
    /// produced are carried over so the stage resumes instead of restarting.
    pub fn stage_handle(&self, parent: &Session, stage_id: &str) -> SessionHandle {
        let path = self.stage_path(parent.id, stage_id);
        let mut working = parent.clone();
        working.status = SessionStatus::Active;
        working.current_stage = Some(stage_id.to_string());
        working.stage_results.clear();

        if let Some(previous) = storage::load_typed::<Session>(&path)
            && previous.id == parent.id
        {
            for task_id in &previous.completed_tasks {
                working.push_completed(task_id);
            }
            for (key, value) in previous.data {
                working.data.entry(key).or_insert(value);
            }
            debug!(session_id = %parent.id, stage_id, completed = working.completed_tasks.len(), "resuming stage working copy");
        }

        SessionHandle::new(working, path, self.write_lock.clone())
    }
}
