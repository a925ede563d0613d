//! Persisted execution context for one pipeline run.
//!
//! A [`Session`] records status, the stage being worked on, every completed
//! task id, the key/value data produced by tasks, and the per-stage outcome.
//! It is only mutated through a [`SessionHandle`], which checkpoints the full
//! session to disk before each mutator returns.

mod manager;

pub use manager::{STATE_DIR, SessionHandle, SessionManager, SessionSummary};

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::artifacts::Artifact;
use crate::stage::StageStatus;

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Active,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Persisted outcome of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub status: StageStatus,
    #[serde(default)]
    pub duration_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub task_timings: BTreeMap<String, f64>,
}

/// The persisted, resumable execution context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    /// Ordered, duplicate-free list of completed task ids
    #[serde(default)]
    pub completed_tasks: Vec<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub workspace: PathBuf,
    #[serde(default)]
    pub stage_results: BTreeMap<String, StageRecord>,
    /// Topological order of the stages of the definition being run
    #[serde(default)]
    pub stage_order: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_name: Option<String>,
}

impl Session {
    /// A fresh active session rooted at `workspace`.
    pub fn new(workspace: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            status: SessionStatus::Active,
            current_stage: None,
            completed_tasks: Vec::new(),
            data: Map::new(),
            workspace,
            stage_results: BTreeMap::new(),
            stage_order: Vec::new(),
            pipeline_name: None,
        }
    }

    pub fn is_task_completed(&self, task_id: &str) -> bool {
        self.completed_tasks.iter().any(|t| t == task_id)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Decode a typed artifact stored under `key`.
    pub fn get_typed<A: Artifact>(&self, key: &str) -> Option<A> {
        self.data.get(key).and_then(A::from_value)
    }

    /// Session data restricted to `keys`; absent keys are omitted.
    pub fn context_for(&self, keys: &[String]) -> Map<String, Value> {
        keys.iter()
            .filter_map(|k| self.data.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }

    pub fn stage_status(&self, stage_id: &str) -> Option<StageStatus> {
        self.stage_results.get(stage_id).map(|r| r.status)
    }

    pub fn stage_succeeded(&self, stage_id: &str) -> bool {
        self.stage_status(stage_id) == Some(StageStatus::Success)
    }

    /// First stage in the recorded order that has not succeeded yet.
    ///
    /// `None` when the session is completed or every stage succeeded.
    pub fn next_stage(&self) -> Option<String> {
        if self.status == SessionStatus::Completed {
            return None;
        }
        self.stage_order
            .iter()
            .find(|id| !self.stage_succeeded(id))
            .cloned()
    }

    pub(crate) fn push_completed(&mut self, task_id: &str) -> bool {
        if self.is_task_completed(task_id) {
            return false;
        }
        self.completed_tasks.push(task_id.to_string());
        true
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(status: StageStatus) -> StageRecord {
        StageRecord {
            status,
            duration_secs: 1.0,
            error: None,
            finished_at: Utc::now(),
            task_timings: BTreeMap::new(),
        }
    }

    #[test]
    fn new_session_is_active_and_empty() {
        let s = Session::new(PathBuf::from("/ws"));
        assert_eq!(s.status, SessionStatus::Active);
        assert!(s.completed_tasks.is_empty());
        assert!(s.data.is_empty());
        assert!(!s.status.is_terminal());
    }

    #[test]
    fn push_completed_is_idempotent() {
        let mut s = Session::new(PathBuf::from("/ws"));
        assert!(s.push_completed("t1"));
        assert!(!s.push_completed("t1"));
        assert_eq!(s.completed_tasks, vec!["t1"]);
    }

    #[test]
    fn context_for_filters_keys() {
        let mut s = Session::new(PathBuf::from("/ws"));
        s.data.insert("a".into(), json!(1));
        s.data.insert("b".into(), json!(2));
        let ctx = s.context_for(&["a".to_string(), "missing".to_string()]);
        assert_eq!(ctx.len(), 1);
        assert_eq!(ctx.get("a"), Some(&json!(1)));
    }

    #[test]
    fn next_stage_skips_successful_stages() {
        let mut s = Session::new(PathBuf::from("/ws"));
        s.stage_order = vec!["a".into(), "b".into(), "c".into()];
        assert_eq!(s.next_stage().as_deref(), Some("a"));

        s.stage_results.insert("a".into(), record(StageStatus::Success));
        s.stage_results.insert("b".into(), record(StageStatus::Failed));
        assert_eq!(s.next_stage().as_deref(), Some("b"));

        s.stage_results.insert("b".into(), record(StageStatus::Success));
        s.stage_results.insert("c".into(), record(StageStatus::Success));
        assert!(s.next_stage().is_none());
    }

    #[test]
    fn completed_session_has_no_next_stage() {
        let mut s = Session::new(PathBuf::from("/ws"));
        s.stage_order = vec!["a".into()];
        s.status = SessionStatus::Completed;
        assert!(s.next_stage().is_none());
    }

    #[test]
    fn session_serialization_is_stable() {
        let mut s = Session::new(PathBuf::from("/ws"));
        s.push_completed("t1");
        s.data.insert("k".into(), json!("v"));
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"status\":\"active\""));
        let restored: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, s);
    }
}
