//! Workspace configuration read from `.pipewright/config.toml`.
//!
//! Settings are layered: file, then environment, then CLI flags. A missing
//! file yields the defaults below.
//!
//! ```toml
//! [defaults]
//! task_timeout_secs = 300
//! stage_timeout_secs = 1800
//! max_parallel = 4
//! fail_fast = false
//! max_iterations = 3
//!
//! [executor]
//! command = "claude"
//! args = ["--print"]
//!
//! [tests]
//! command = "pytest"
//! args = ["-v", "--tb=short"]
//! timeout_secs = 600
//!
//! [checkpoint]
//! enabled = false
//! patterns = ["*"]
//!
//! [stages.overrides."generate-*"]
//! timeout_secs = 3600
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dag::ExecutorConfig;
use crate::executor::CommandExecutor;
use crate::feedback::CommandTestRunner;
use crate::session::STATE_DIR;
use crate::stage::PipelineDefinition;

pub const CONFIG_FILE: &str = "config.toml";

pub const ENV_EXECUTOR_CMD: &str = "PIPEWRIGHT_EXECUTOR_CMD";
pub const ENV_TEST_CMD: &str = "PIPEWRIGHT_TEST_CMD";
pub const ENV_MAX_PARALLEL: &str = "PIPEWRIGHT_MAX_PARALLEL";

/// Defaults applied to every pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Per-task timeout when the task does not set one
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    /// Per-stage timeout when neither the stage nor an override sets one
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: u64,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default)]
    pub fail_fast: bool,
    /// Feedback loop iteration budget
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_task_timeout() -> u64 {
    300
}

fn default_stage_timeout() -> u64 {
    1800
}

fn default_max_parallel() -> usize {
    4
}

fn default_max_iterations() -> u32 {
    3
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            task_timeout_secs: default_task_timeout(),
            stage_timeout_secs: default_stage_timeout(),
            max_parallel: default_max_parallel(),
            fail_fast: false,
            max_iterations: default_max_iterations(),
        }
    }
}

/// The command behind the task executor seam.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorSection {
    #[serde(default = "default_executor_command")]
    pub command: String,
    #[serde(default = "default_executor_args")]
    pub args: Vec<String>,
}

fn default_executor_command() -> String {
    "claude".to_string()
}

fn default_executor_args() -> Vec<String> {
    vec!["--print".to_string()]
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            command: default_executor_command(),
            args: default_executor_args(),
        }
    }
}

/// The test command used by the feedback loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestsSection {
    #[serde(default = "default_test_command")]
    pub command: String,
    #[serde(default = "default_test_args")]
    pub args: Vec<String>,
    #[serde(default = "default_test_timeout")]
    pub timeout_secs: u64,
}

fn default_test_command() -> String {
    "pytest".to_string()
}

fn default_test_args() -> Vec<String> {
    vec!["-v".to_string(), "--tb=short".to_string()]
}

fn default_test_timeout() -> u64 {
    600
}

impl Default for TestsSection {
    fn default() -> Self {
        Self {
            command: default_test_command(),
            args: default_test_args(),
            timeout_secs: default_test_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSection {
    #[serde(default)]
    pub enabled: bool,
    /// Pathspecs staged into each checkpoint commit
    #[serde(default = "default_checkpoint_patterns")]
    pub patterns: Vec<String>,
}

fn default_checkpoint_patterns() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            enabled: false,
            patterns: default_checkpoint_patterns(),
        }
    }
}

/// Settings for stages whose id matches a glob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StagesConfig {
    /// Pattern-based overrides (e.g. "generate-*" -> StageOverride)
    #[serde(default)]
    pub overrides: BTreeMap<String, StageOverride>,
}

/// The complete config.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipewrightToml {
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub tests: TestsSection,
    #[serde(default)]
    pub checkpoint: CheckpointSection,
    #[serde(default)]
    pub stages: StagesConfig,
}

impl PipewrightToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config.toml")
    }

    /// Load `config.toml` from a state directory, or the defaults when absent.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let config_path = state_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Apply environment overrides read through `lookup`.
    ///
    /// A command variable may carry arguments (`"cat -n"`); they replace the
    /// configured args. An unparseable `PIPEWRIGHT_MAX_PARALLEL` is ignored.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some((command, args)) = lookup(ENV_EXECUTOR_CMD).as_deref().and_then(split_command) {
            self.executor.command = command;
            self.executor.args = args;
        }
        if let Some((command, args)) = lookup(ENV_TEST_CMD).as_deref().and_then(split_command) {
            self.tests.command = command;
            self.tests.args = args;
        }
        if let Some(n) = lookup(ENV_MAX_PARALLEL).and_then(|v| v.trim().parse::<usize>().ok()) {
            self.defaults.max_parallel = n;
        }
    }

    /// Timeout configured for a stage id by the first matching override, in
    /// sorted pattern order.
    pub fn stage_timeout_override(&self, stage_id: &str) -> Option<Duration> {
        self.stages
            .overrides
            .iter()
            .filter(|(pattern, _)| pattern_matches(pattern, stage_id))
            .find_map(|(_, o)| o.timeout_secs)
            .map(Duration::from_secs)
    }

    /// Fill in stage timeouts from the overrides. Timeouts set on the stage
    /// itself win.
    pub fn apply_stage_overrides(&self, def: &mut PipelineDefinition) {
        for stage in &mut def.stages {
            if stage.timeout.is_none() {
                stage.timeout = self.stage_timeout_override(&stage.id);
            }
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.defaults.task_timeout_secs == 0 {
            warnings.push("defaults.task_timeout_secs is 0: every task will time out".to_string());
        }
        if self.defaults.stage_timeout_secs == 0 {
            warnings.push("defaults.stage_timeout_secs is 0: every stage will time out".to_string());
        }
        if self.defaults.max_parallel == 0 {
            warnings.push("defaults.max_parallel is 0: it will be treated as 1".to_string());
        }
        if self.defaults.max_iterations == 0 {
            warnings.push("defaults.max_iterations is 0: the feedback loop always runs once".to_string());
        }
        if self.executor.command.trim().is_empty() {
            warnings.push("executor.command is empty".to_string());
        }
        if self.tests.command.trim().is_empty() {
            warnings.push("tests.command is empty".to_string());
        }
        if self.tests.timeout_secs == 0 {
            warnings.push("tests.timeout_secs is 0: every test run will time out".to_string());
        }
        if self.checkpoint.enabled && self.checkpoint.patterns.is_empty() {
            warnings.push("checkpoint.patterns is empty: checkpoints will stage nothing".to_string());
        }

        for (pattern, override_cfg) in &self.stages.overrides {
            if override_cfg.timeout_secs == Some(0) {
                warnings.push(format!("Zero timeout_secs in override for pattern '{}'", pattern));
            }
        }

        warnings
    }
}

fn split_command(value: &str) -> Option<(String, Vec<String>)> {
    let mut parts = value.split_whitespace().map(str::to_string);
    let command = parts.next()?;
    Some((command, parts.collect()))
}

/// Check if a pattern matches a stage id, ignoring case.
/// - `*` matches any sequence of characters
/// - `?` matches any single character
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let name: Vec<char> = name.to_lowercase().chars().collect();
    glob_match(&pattern, &name)
}

fn glob_match(pattern: &[char], text: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some(('*', rest)) => (0..=text.len()).any(|i| glob_match(rest, &text[i..])),
        Some(('?', rest)) => !text.is_empty() && glob_match(rest, &text[1..]),
        Some((c, rest)) => text.first() == Some(c) && glob_match(rest, &text[1..]),
    }
}

/// Configuration resolved for one workspace, CLI flags applied last.
#[derive(Debug, Clone)]
pub struct PipewrightConfig {
    pub workspace: PathBuf,
    pub state_dir: PathBuf,
    pub toml: PipewrightToml,
}

impl PipewrightConfig {
    /// Load the workspace's config file and apply the environment.
    pub fn new(workspace: &Path) -> Result<Self> {
        let workspace = workspace
            .canonicalize()
            .with_context(|| format!("Failed to resolve workspace {}", workspace.display()))?;
        let state_dir = workspace.join(STATE_DIR);
        let mut toml = PipewrightToml::load_or_default(&state_dir)?;
        toml.apply_env();

        Ok(Self {
            workspace,
            state_dir,
            toml,
        })
    }

    pub fn config_path(&self) -> PathBuf {
        self.state_dir.join(CONFIG_FILE)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.defaults.task_timeout_secs)
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            stage_timeout: Duration::from_secs(self.toml.defaults.stage_timeout_secs),
            max_parallel: self.toml.defaults.max_parallel.max(1),
            fail_fast: self.toml.defaults.fail_fast,
        }
    }

    pub fn command_executor(&self) -> CommandExecutor {
        CommandExecutor::new(&self.toml.executor.command, self.toml.executor.args.clone())
            .with_working_dir(self.workspace.clone())
    }

    pub fn test_runner(&self) -> CommandTestRunner {
        CommandTestRunner::new(
            &self.toml.tests.command,
            self.toml.tests.args.clone(),
            Duration::from_secs(self.toml.tests.timeout_secs),
        )
        .with_working_dir(self.workspace.clone())
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
