//! Running test files and parsing their results.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::util::{duration_secs, truncate_chars};

/// Tracebacks kept per failure.
pub const MAX_TRACEBACK_CHARS: usize = 2000;

static SUMMARY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^=*\s*(.*?)\s+in\s+([\d.]+)s\b").unwrap());

static COUNT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d+) (passed|failed|errors?|skipped)\b").unwrap());

static FAILED_LINE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(FAILED|ERROR) (\S+)(?: - (.*))?$").unwrap());

static SECTION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^_{3,} (.+?) _{3,}$").unwrap());

/// A single failing test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestFailure {
    pub test_name: String,
    pub error_message: String,
    #[serde(default)]
    pub traceback: String,
}

/// Outcome of one test run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub test_file: PathBuf,
    pub passed: u32,
    pub failed: u32,
    pub errors: u32,
    pub skipped: u32,
    #[serde(rename = "duration_secs", with = "duration_secs")]
    pub duration: Duration,
    #[serde(default)]
    pub failures: Vec<TestFailure>,
}

impl TestResult {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.errors == 0
    }

    /// A run that could not happen: one error with a synthetic failure.
    pub fn error(test_file: &Path, message: &str, duration: Duration) -> Self {
        Self {
            test_file: test_file.to_path_buf(),
            passed: 0,
            failed: 0,
            errors: 1,
            skipped: 0,
            duration,
            failures: vec![TestFailure {
                test_name: test_file.display().to_string(),
                error_message: message.to_string(),
                traceback: String::new(),
            }],
        }
    }
}

/// Runs a test file. Never fails: problems become an errored [`TestResult`].
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn run_tests(&self, test_file: &Path) -> TestResult;
}

/// Runs an external test command (pytest by default) on a test file.
#[derive(Debug, Clone)]
pub struct CommandTestRunner {
    command: String,
    args: Vec<String>,
    timeout: Duration,
    working_dir: Option<PathBuf>,
}

impl CommandTestRunner {
    pub fn new(command: &str, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command: command.to_string(),
            args,
            timeout,
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }
}

#[async_trait]
impl TestRunner for CommandTestRunner {
    async fn run_tests(&self, test_file: &Path) -> TestResult {
        let started = Instant::now();
        if !test_file.exists() {
            return TestResult::error(
                test_file,
                &format!("Test file not found: {}", test_file.display()),
                started.elapsed(),
            );
        }

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .arg(test_file)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        debug!(command = %self.command, test_file = %test_file.display(), "running tests");
        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(command = %self.command, error = %e, "failed to start test runner");
                return TestResult::error(
                    test_file,
                    &format!("Failed to run '{}': {}", self.command, e),
                    started.elapsed(),
                );
            }
        };

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return TestResult::error(
                    test_file,
                    &format!("Test runner failed: {}", e),
                    started.elapsed(),
                );
            }
            Err(_) => {
                warn!(test_file = %test_file.display(), timeout_secs = self.timeout.as_secs(), "test run timed out");
                return TestResult::error(
                    test_file,
                    &format!("Tests timed out after {}s", self.timeout.as_secs()),
                    started.elapsed(),
                );
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            text.push('\n');
            text.push_str(&stderr);
        }

        let mut result = parse_pytest_output(test_file, &text, started.elapsed());
        if !output.status.success() && result.is_success() {
            // Non-zero exit without counted failures: collection error,
            // no tests collected, crashed interpreter...
            let lines: Vec<&str> = text.lines().collect();
            let tail = lines[lines.len().saturating_sub(20)..].join("\n");
            result.errors += 1;
            result.failures.push(TestFailure {
                test_name: test_file.display().to_string(),
                error_message: format!(
                    "Test command exited with code {}",
                    output.status.code().unwrap_or(-1)
                ),
                traceback: truncate_chars(&tail, MAX_TRACEBACK_CHARS),
            });
        }
        result
    }
}

/// Parse pytest output into a [`TestResult`].
///
/// Counts come from the final summary line, failures from the
/// `FAILED node - message` lines of the short test summary, tracebacks from
/// the `___ name ___` sections.
pub fn parse_pytest_output(test_file: &Path, output: &str, duration: Duration) -> TestResult {
    let mut result = TestResult {
        test_file: test_file.to_path_buf(),
        passed: 0,
        failed: 0,
        errors: 0,
        skipped: 0,
        duration,
        failures: Vec::new(),
    };

    for line in output.lines().rev() {
        let Some(caps) = SUMMARY_REGEX.captures(line.trim()) else {
            continue;
        };
        let counts = &caps[1];
        if !COUNT_REGEX.is_match(counts) {
            continue;
        }
        for count in COUNT_REGEX.captures_iter(counts) {
            let n: u32 = count[1].parse().unwrap_or(0);
            match &count[2] {
                "passed" => result.passed = n,
                "failed" => result.failed = n,
                "skipped" => result.skipped = n,
                _ => result.errors = n,
            }
        }
        if let Ok(secs) = caps[2].parse::<f64>()
            && let Ok(d) = Duration::try_from_secs_f64(secs)
        {
            result.duration = d;
        }
        break;
    }

    let tracebacks = traceback_sections(output);
    for line in output.lines() {
        let Some(caps) = FAILED_LINE_REGEX.captures(line.trim_end()) else {
            continue;
        };
        let node_id = &caps[2];
        let test_name = node_id
            .split_once("::")
            .map_or(node_id, |(_, name)| name)
            .to_string();
        let section_key = test_name.replace("::", ".");
        let traceback = tracebacks
            .get(&section_key)
            .or_else(|| tracebacks.get(&test_name))
            .map(|t| truncate_chars(t, MAX_TRACEBACK_CHARS))
            .unwrap_or_default();
        result.failures.push(TestFailure {
            test_name,
            error_message: caps.get(3).map_or("", |m| m.as_str()).to_string(),
            traceback,
        });
    }

    if result.failures.is_empty() && !result.is_success() {
        // Counted failures without a short summary (e.g. run without -r).
        result.failures.push(TestFailure {
            test_name: test_file.display().to_string(),
            error_message: format!("{} failed, {} errors", result.failed, result.errors),
            traceback: truncate_chars(output, MAX_TRACEBACK_CHARS),
        });
    }

    result
}

/// `___ name ___` sections of the FAILURES/ERRORS blocks, keyed by name.
fn traceback_sections(output: &str) -> HashMap<String, String> {
    let mut sections = HashMap::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in output.lines() {
        let trimmed = line.trim_end();
        if let Some(caps) = SECTION_REGEX.captures(trimmed) {
            if let Some((name, body)) = current.take() {
                sections.insert(name, body.join("\n"));
            }
            current = Some((caps[1].to_string(), Vec::new()));
            continue;
        }
        if trimmed.starts_with('=') {
            if let Some((name, body)) = current.take() {
                sections.insert(name, body.join("\n"));
            }
            continue;
        }
        if let Some((_, body)) = current.as_mut() {
            body.push(line);
        }
    }
    if let Some((name, body)) = current {
        sections.insert(name, body.join("\n"));
    }
    sections
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAILING_OUTPUT: &str = "\
============================= test session starts ==============================
collected 3 items

test_tool.py::test_add PASSED                                            [ 33%]
test_tool.py::test_sub FAILED                                            [ 66%]
test_tool.py::TestMul::test_mul FAILED                                   [100%]

=================================== FAILURES ===================================
___________________________________ test_sub ___________________________________
test_tool.py:8: in test_sub
    assert sub(3, 1) == 2
E   assert 4 == 2
______________________________ TestMul.test_mul ________________________________
test_tool.py:12: in test_mul
    assert mul(2, 2) == 4
E   NameError: name 'mul' is not defined
=========================== short test summary info ============================
FAILED test_tool.py::test_sub - assert 4 == 2
FAILED test_tool.py::TestMul::test_mul - NameError: name 'mul' is not defined
========================= 2 failed, 1 passed in 0.05s ==========================
";

    #[test]
    fn parses_counts_failures_and_tracebacks() {
        let result = parse_pytest_output(Path::new("test_tool.py"), FAILING_OUTPUT, Duration::ZERO);
        assert_eq!(result.passed, 1);
        assert_eq!(result.failed, 2);
        assert_eq!(result.errors, 0);
        assert!((result.duration.as_secs_f64() - 0.05).abs() < 1e-6);
        assert!(!result.is_success());

        assert_eq!(result.failures.len(), 2);
        assert_eq!(result.failures[0].test_name, "test_sub");
        assert_eq!(result.failures[0].error_message, "assert 4 == 2");
        assert!(result.failures[0].traceback.contains("E   assert 4 == 2"));
        assert_eq!(result.failures[1].test_name, "TestMul::test_mul");
        assert!(result.failures[1].traceback.contains("NameError"));
    }

    #[test]
    fn parses_all_passing_run() {
        let output = "collected 2 items\n\ntest_a.py ..                [100%]\n\n===== 2 passed, 1 skipped in 0.01s =====\n";
        let result = parse_pytest_output(Path::new("test_a.py"), output, Duration::ZERO);
        assert_eq!(result.passed, 2);
        assert_eq!(result.skipped, 1);
        assert!(result.is_success());
        assert!(result.failures.is_empty());
    }

    #[test]
    fn parses_errors_and_quiet_summary() {
        let output = "ERROR test_b.py - ImportError: cannot import name 'tool'\n1 error in 0.20s\n";
        let result = parse_pytest_output(Path::new("test_b.py"), output, Duration::ZERO);
        assert_eq!(result.errors, 1);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].test_name, "test_b.py");
        assert!(result.failures[0].error_message.contains("ImportError"));
    }

    #[test]
    fn counted_failures_without_summary_get_a_record() {
        let output = "test_c.py F.\n=== 1 failed, 1 passed in 0.02s ===\n";
        let result = parse_pytest_output(Path::new("test_c.py"), output, Duration::ZERO);
        assert_eq!(result.failed, 1);
        assert_eq!(result.failures.len(), 1);
        assert!(result.failures[0].error_message.contains("1 failed"));
    }

    #[test]
    fn long_tracebacks_are_truncated() {
        let body: String = (0..500).map(|i| format!("line {}\n", i)).collect();
        let output = format!(
            "=== FAILURES ===\n___ test_x ___\n{}=== short test summary info ===\nFAILED t.py::test_x - boom\n=== 1 failed in 1.00s ===\n",
            body
        );
        let result = parse_pytest_output(Path::new("t.py"), &output, Duration::ZERO);
        let tb = &result.failures[0].traceback;
        assert!(tb.ends_with("... [truncated]"));
        assert!(tb.chars().count() <= MAX_TRACEBACK_CHARS + "... [truncated]".len());
    }

    #[tokio::test]
    async fn missing_test_file_is_an_error_result() {
        let runner = CommandTestRunner::new("pytest", vec![], Duration::from_secs(5));
        let result = runner.run_tests(Path::new("/definitely/not/here_test.py")).await;
        assert_eq!(result.errors, 1);
        assert_eq!(result.failures.len(), 1);
        assert!(result.failures[0].error_message.contains("not found"));
    }

    #[tokio::test]
    async fn missing_runner_binary_is_an_error_result() {
        let dir = tempfile::tempdir().unwrap();
        let test_file = dir.path().join("test_x.py");
        std::fs::write(&test_file, "def test_x(): pass\n").unwrap();
        let runner = CommandTestRunner::new("pipewright-no-such-runner", vec![], Duration::from_secs(5));
        let result = runner.run_tests(&test_file).await;
        assert_eq!(result.errors, 1);
        assert!(result.failures[0].error_message.contains("Failed to run"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_output_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let test_file = dir.path().join("test_x.py");
        std::fs::write(&test_file, "").unwrap();
        let script = "echo 'FAILED test_x.py::test_one - assert False'; echo '=== 1 failed, 3 passed in 0.10s ==='; exit 1";
        let runner = CommandTestRunner::new(
            "sh",
            vec!["-c".into(), script.into(), "sh".into()],
            Duration::from_secs(5),
        );
        let result = runner.run_tests(&test_file).await;
        assert_eq!(result.failed, 1);
        assert_eq!(result.passed, 3);
        assert_eq!(result.failures[0].test_name, "test_one");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_without_counts_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let test_file = dir.path().join("test_x.py");
        std::fs::write(&test_file, "").unwrap();
        let runner = CommandTestRunner::new(
            "sh",
            vec!["-c".into(), "echo 'no tests ran'; exit 5".into(), "sh".into()],
            Duration::from_secs(5),
        );
        let result = runner.run_tests(&test_file).await;
        assert_eq!(result.errors, 1);
        assert!(result.failures[0].error_message.contains("code 5"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hung_test_run_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let test_file = dir.path().join("test_x.py");
        std::fs::write(&test_file, "").unwrap();
        let runner = CommandTestRunner::new(
            "sh",
            vec!["-c".into(), "sleep 10".into(), "sh".into()],
            Duration::from_millis(200),
        );
        let result = runner.run_tests(&test_file).await;
        assert_eq!(result.errors, 1);
        assert!(result.failures[0].error_message.contains("timed out"));
    }
}
