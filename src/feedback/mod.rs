//! The bounded test, diagnose, patch, retest cycle.
//!
//! [`FeedbackLoop::run`] drives one (test file, code file) pair:
//!
//! 1. run the tests; stop with `Success` when nothing fails
//! 2. diagnose every failure, dropping the ones classified as test issues
//! 3. generate fixes cumulatively: each fix starts from the previous fix's output
//! 4. back up the code file, then write each fix
//!
//! An iteration that generates or applies no fix stops the loop with
//! `NoProgress`; running out of iterations ends in `FailedExhausted`. Tests
//! are only re-run between iterations, not between fixes.

pub mod analyst;
pub mod runner;

pub use analyst::{AiFailureAnalyst, Diagnosis, FailureAnalyst, FixType};
pub use runner::{CommandTestRunner, TestFailure, TestResult, TestRunner};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::artifacts::TestFileSet;
use crate::session::{SessionManager, SessionStatus};
use crate::storage;

/// Default iteration budget per pair.
pub const DEFAULT_MAX_ITERATIONS: u32 = 3;

/// A fix written to a code file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeFix {
    pub file_path: PathBuf,
    pub original_code: String,
    pub fixed_code: String,
    pub test_file: PathBuf,
    pub failure_reason: String,
    pub fix_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<PathBuf>,
    pub timestamp: DateTime<Utc>,
}

/// One pass of the loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationResult {
    pub iteration: u32,
    pub test_result: TestResult,
    #[serde(default)]
    pub fixes_applied: Vec<CodeFix>,
    pub success: bool,
}

/// Terminal state of a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackStatus {
    Success,
    FailedExhausted,
    NoProgress,
}

impl std::fmt::Display for FeedbackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedbackStatus::Success => write!(f, "success"),
            FeedbackStatus::FailedExhausted => write!(f, "failed (iterations exhausted)"),
            FeedbackStatus::NoProgress => write!(f, "failed (no progress)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackOutcome {
    pub test_file: PathBuf,
    pub code_file: PathBuf,
    pub status: FeedbackStatus,
    pub iterations: u32,
    pub total_fixes: usize,
    pub final_test_result: TestResult,
}

impl FeedbackOutcome {
    pub fn is_success(&self) -> bool {
        self.status == FeedbackStatus::Success
    }
}

/// Aggregate of a batch run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total_pairs: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub total_iterations: u32,
    pub total_fixes: usize,
    pub outcomes: Vec<FeedbackOutcome>,
}

impl BatchSummary {
    fn add(&mut self, outcome: FeedbackOutcome) {
        self.total_pairs += 1;
        if outcome.is_success() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.total_iterations += outcome.iterations;
        self.total_fixes += outcome.total_fixes;
        self.outcomes.push(outcome);
    }

    /// Status of a session that ran nothing but this batch.
    pub fn session_status(&self) -> SessionStatus {
        if self.failed == 0 {
            SessionStatus::Completed
        } else {
            SessionStatus::Failed
        }
    }
}

/// Runs the feedback cycle and logs it under one directory.
pub struct FeedbackLoop {
    runner: Arc<dyn TestRunner>,
    analyst: Arc<dyn FailureAnalyst>,
    max_iterations: u32,
    log_dir: PathBuf,
}

impl FeedbackLoop {
    pub fn new(runner: Arc<dyn TestRunner>, analyst: Arc<dyn FailureAnalyst>, log_dir: PathBuf) -> Self {
        Self {
            runner,
            analyst,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            log_dir,
        }
    }

    /// Loop logging into the feedback directory of a session.
    pub fn for_session(
        runner: Arc<dyn TestRunner>,
        analyst: Arc<dyn FailureAnalyst>,
        sessions: &SessionManager,
        session_id: Uuid,
    ) -> Self {
        Self::new(runner, analyst, sessions.feedback_dir(session_id))
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn iterations_log(&self) -> PathBuf {
        self.log_dir.join("iterations.jsonl")
    }

    pub fn fixes_log(&self) -> PathBuf {
        self.log_dir.join("fixes.jsonl")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.log_dir.join("backups")
    }

    /// Drive one pair until its tests pass, no progress is possible, or
    /// the iteration budget runs out.
    pub async fn run(&self, test_file: &Path, code_file: &Path) -> FeedbackOutcome {
        let mut total_fixes = 0;
        let mut last_result: Option<TestResult> = None;

        for iteration in 1..=self.max_iterations {
            let test_result = self.runner.run_tests(test_file).await;
            info!(
                iteration,
                test_file = %test_file.display(),
                passed = test_result.passed,
                failed = test_result.failed,
                errors = test_result.errors,
                "test run finished"
            );

            if test_result.is_success() {
                self.log_iteration(iteration, &test_result, Vec::new(), true);
                return self.outcome(test_file, code_file, FeedbackStatus::Success, iteration, total_fixes, test_result);
            }

            let fixes = self.fix_failures(test_file, code_file, &test_result).await;
            let applied = fixes.len();
            total_fixes += applied;
            self.log_iteration(iteration, &test_result, fixes, false);

            if applied == 0 {
                warn!(iteration, code_file = %code_file.display(), "no fix could be applied, stopping");
                return self.outcome(test_file, code_file, FeedbackStatus::NoProgress, iteration, total_fixes, test_result);
            }
            last_result = Some(test_result);
        }

        let final_result = last_result
            .unwrap_or_else(|| TestResult::error(test_file, "no test run", std::time::Duration::ZERO));
        warn!(
            max_iterations = self.max_iterations,
            test_file = %test_file.display(),
            "iteration budget exhausted"
        );
        self.outcome(
            test_file,
            code_file,
            FeedbackStatus::FailedExhausted,
            self.max_iterations,
            total_fixes,
            final_result,
        )
    }

    /// Run every pair in turn; one pair's failure does not stop the others.
    pub async fn run_batch(&self, pairs: &[(PathBuf, PathBuf)]) -> BatchSummary {
        let mut summary = BatchSummary::default();
        for (test_file, code_file) in pairs {
            let outcome = self.run(test_file, code_file).await;
            info!(test_file = %test_file.display(), status = %outcome.status, "pair finished");
            summary.add(outcome);
        }
        summary
    }

    /// Run every test file of a generated file set against its code file.
    pub async fn run_file_set(&self, files: &TestFileSet) -> BatchSummary {
        self.run_batch(&files.pairs()).await
    }

    /// Diagnose, generate and apply the fixes of one iteration.
    async fn fix_failures(&self, test_file: &Path, code_file: &Path, test_result: &TestResult) -> Vec<CodeFix> {
        let code = match tokio::fs::read_to_string(code_file).await {
            Ok(code) => code,
            Err(e) => {
                warn!(code_file = %code_file.display(), error = %e, "cannot read code file");
                return Vec::new();
            }
        };

        let mut diagnosed = Vec::new();
        for failure in &test_result.failures {
            match self.analyst.diagnose_failure(failure, &code).await {
                Ok(d) if d.fix_type == FixType::TestIssue => {
                    info!(test = %failure.test_name, root_cause = %d.root_cause, "failure is a test issue, not patching");
                }
                Ok(d) => diagnosed.push((failure, d)),
                Err(e) => warn!(test = %failure.test_name, error = %e, "diagnosis failed, skipping failure"),
            }
        }

        let mut generated = Vec::new();
        let mut current = code;
        for (failure, diagnosis) in diagnosed {
            match self.analyst.generate_fix(&current, &diagnosis).await {
                Ok(fixed) if fixed.trim() == current.trim() => {
                    debug!(test = %failure.test_name, "fix left the code unchanged");
                }
                Ok(fixed) => {
                    generated.push(CodeFix {
                        file_path: code_file.to_path_buf(),
                        original_code: current.clone(),
                        fixed_code: fixed.clone(),
                        test_file: test_file.to_path_buf(),
                        failure_reason: format!("{}: {}", failure.test_name, failure.error_message),
                        fix_description: if diagnosis.fix_suggestion.is_empty() {
                            diagnosis.root_cause.clone()
                        } else {
                            diagnosis.fix_suggestion.clone()
                        },
                        backup_path: None,
                        timestamp: Utc::now(),
                    });
                    current = fixed;
                }
                Err(e) => warn!(test = %failure.test_name, error = %e, "fix generation failed, skipping failure"),
            }
        }

        let mut applied = Vec::new();
        for mut fix in generated {
            let Some(backup) = self.backup(code_file, &fix.original_code) else {
                break;
            };
            if let Err(e) = std::fs::write(code_file, &fix.fixed_code) {
                warn!(code_file = %code_file.display(), error = %e, "failed to write fix");
                break;
            }
            fix.backup_path = Some(backup);
            if !storage::append_json_line(&fix, &self.fixes_log()) {
                warn!("failed to append fix log");
            }
            applied.push(fix);
        }
        applied
    }

    /// Copy `contents` to the next free `<name>.backup.<n>`.
    fn backup(&self, code_file: &Path, contents: &str) -> Option<PathBuf> {
        let dir = self.backups_dir();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(dir = %dir.display(), error = %e, "cannot create backup directory");
            return None;
        }
        let name = code_file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "code".to_string());
        let prefix = format!("{}.backup.", name);
        let next = std::fs::read_dir(&dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter_map(|e| {
                        e.file_name()
                            .to_string_lossy()
                            .strip_prefix(&prefix)
                            .and_then(|n| n.parse::<u32>().ok())
                    })
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0)
            + 1;

        let path = dir.join(format!("{}{}", prefix, next));
        match std::fs::write(&path, contents) {
            Ok(()) => {
                debug!(backup = %path.display(), "code backed up");
                Some(path)
            }
            Err(e) => {
                warn!(backup = %path.display(), error = %e, "backup failed, not applying fix");
                None
            }
        }
    }

    fn log_iteration(&self, iteration: u32, test_result: &TestResult, fixes_applied: Vec<CodeFix>, success: bool) {
        let record = IterationResult {
            iteration,
            test_result: test_result.clone(),
            fixes_applied,
            success,
        };
        if !storage::append_json_line(&record, &self.iterations_log()) {
            warn!(iteration, "failed to append iteration log");
        }
    }

    fn outcome(
        &self,
        test_file: &Path,
        code_file: &Path,
        status: FeedbackStatus,
        iterations: u32,
        total_fixes: usize,
        final_test_result: TestResult,
    ) -> FeedbackOutcome {
        FeedbackOutcome {
            test_file: test_file.to_path_buf(),
            code_file: code_file.to_path_buf(),
            status,
            iterations,
            total_fixes,
            final_test_result,
        }
    }
}
