//! Test-driven repair of generated code: `pipewright feedback`.

use anyhow::{Context, Result};
use console::style;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pipewright::artifacts::TestFileSet;
use pipewright::config::PipewrightConfig;
use pipewright::executor::TaskExecutor;
use pipewright::feedback::{AiFailureAnalyst, FeedbackLoop, FeedbackOutcome};
use pipewright::session::SessionManager;

pub async fn cmd_feedback(
    workspace: &Path,
    tests: &[PathBuf],
    code: &[PathBuf],
    max_iterations: Option<u32>,
    session_id: Option<&str>,
    file_set: Option<&str>,
) -> Result<()> {
    if tests.len() != code.len() {
        anyhow::bail!(
            "Got {} --test and {} --code arguments; pass them in pairs",
            tests.len(),
            code.len()
        );
    }

    let config = PipewrightConfig::new(workspace)?;
    let sessions = SessionManager::new(&config.workspace);
    let owns_session = session_id.is_none();
    let mut handle = match session_id {
        Some(id) => sessions
            .load_session(id)
            .with_context(|| format!("Cannot attach feedback logs to session {}", id))?,
        None => sessions.create_session(),
    };

    let mut pairs: Vec<(PathBuf, PathBuf)> = tests.iter().cloned().zip(code.iter().cloned()).collect();
    if let Some(key) = file_set {
        let files = handle
            .session()
            .get_typed::<TestFileSet>(key)
            .with_context(|| format!("Session {} holds no test file set under '{}'", handle.id(), key))?;
        pairs.extend(
            files
                .pairs()
                .into_iter()
                .map(|(test_file, code_file)| (config.workspace.join(test_file), config.workspace.join(code_file))),
        );
    }

    let executor: Arc<dyn TaskExecutor> = Arc::new(config.command_executor());
    let analyst = AiFailureAnalyst::new(executor, config.task_timeout());
    let feedback = FeedbackLoop::for_session(
        Arc::new(config.test_runner()),
        Arc::new(analyst),
        &sessions,
        handle.id(),
    )
    .with_max_iterations(max_iterations.unwrap_or(config.toml.defaults.max_iterations));

    println!();
    println!(
        "{} (session {})",
        style("Feedback loop").bold().cyan(),
        handle.id()
    );

    let summary = feedback.run_batch(&pairs).await;
    if owns_session {
        handle.update_status(summary.session_status());
    }
    for outcome in &summary.outcomes {
        print_outcome(outcome);
    }

    println!();
    println!(
        "  {} of {} pair(s) passing, {} iteration(s), {} fix(es) applied",
        summary.succeeded, summary.total_pairs, summary.total_iterations, summary.total_fixes
    );
    println!("  Logs: {}", sessions.feedback_dir(handle.id()).display());
    println!();

    if summary.failed > 0 {
        anyhow::bail!("{} pair(s) still failing", summary.failed);
    }
    Ok(())
}

fn print_outcome(outcome: &FeedbackOutcome) {
    let marker = if outcome.is_success() {
        style("✓").green()
    } else {
        style("✗").red()
    };
    let result = &outcome.final_test_result;
    println!(
        "  {} {} -> {}: {} after {} iteration(s) ({} passed, {} failed, {} errors)",
        marker,
        outcome.test_file.display(),
        outcome.code_file.display(),
        outcome.status,
        outcome.iterations,
        result.passed,
        result.failed,
        result.errors
    );
    if !outcome.is_success() {
        for failure in result.failures.iter().take(5) {
            println!("      {} {}", style(&failure.test_name).dim(), failure.error_message);
        }
    }
}
