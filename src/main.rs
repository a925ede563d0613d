use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "pipewright")]
#[command(version, about = "Dependency-aware, checkpointable pipeline orchestrator")]
pub struct Cli {
    /// Workspace holding the `.pipewright` state directory (defaults to cwd)
    #[arg(long, global = true)]
    pub workspace: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a pipeline definition
    Run {
        /// Pipeline definition (JSON)
        definition: PathBuf,

        /// Continue an existing session instead of creating one
        #[arg(long)]
        session: Option<String>,

        /// Maximum concurrent stages inside a level
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Default stage timeout in seconds
        #[arg(long)]
        stage_timeout: Option<u64>,

        /// Skip every remaining stage after a level with a failure
        #[arg(long)]
        fail_fast: bool,

        /// Commit a git checkpoint after every successful stage
        #[arg(long)]
        checkpoint: bool,
    },
    /// Resume an interrupted session
    Resume {
        session_id: String,

        /// Pipeline definition; required unless the session is already finished
        #[arg(long)]
        definition: Option<PathBuf>,
    },
    /// List sessions, newest first
    Sessions,
    /// Show the state of one session
    Status { session_id: String },
    /// Print the parallel groups of a pipeline definition
    Groups { definition: PathBuf },
    /// Run the test/fix feedback loop on code and test file pairs
    Feedback {
        /// Test file (repeat together with --code for a batch)
        #[arg(long = "test", required_unless_present = "file_set")]
        tests: Vec<PathBuf>,

        /// Code file under test
        #[arg(long = "code", required_unless_present = "file_set")]
        code: Vec<PathBuf>,

        #[arg(long)]
        max_iterations: Option<u32>,

        /// Session whose feedback directory receives the logs
        #[arg(long)]
        session: Option<String>,

        /// Session key holding a generated test file set to check as well
        #[arg(long, requires = "session")]
        file_set: Option<String>,
    },
    /// List git checkpoints of a session
    Checkpoints { session_id: String },
    /// Hard-reset the working tree to a checkpoint commit
    Rollback { commit: String },
    /// View or initialize configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default config.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    pipewright::logging::init(cli.verbose, cli.log_format == LogFormat::Json);

    let workspace = match cli.workspace.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run {
            definition,
            session,
            max_parallel,
            stage_timeout,
            fail_fast,
            checkpoint,
        } => {
            let opts = cmd::RunOptions {
                session: session.clone(),
                max_parallel: *max_parallel,
                stage_timeout: *stage_timeout,
                fail_fast: *fail_fast,
                checkpoint: *checkpoint,
            };
            cmd::cmd_run(&workspace, definition, opts).await?;
        }
        Commands::Resume {
            session_id,
            definition,
        } => cmd::cmd_resume(&workspace, session_id, definition.as_deref()).await?,
        Commands::Sessions => cmd::cmd_sessions(&workspace)?,
        Commands::Status { session_id } => cmd::cmd_status(&workspace, session_id)?,
        Commands::Groups { definition } => cmd::cmd_groups(definition)?,
        Commands::Feedback {
            tests,
            code,
            max_iterations,
            session,
            file_set,
        } => {
            cmd::cmd_feedback(
                &workspace,
                tests,
                code,
                *max_iterations,
                session.as_deref(),
                file_set.as_deref(),
            )
            .await?
        }
        Commands::Checkpoints { session_id } => cmd::cmd_checkpoints(&workspace, session_id)?,
        Commands::Rollback { commit } => cmd::cmd_rollback(&workspace, commit)?,
        Commands::Config { command } => cmd::cmd_config(&workspace, command.clone())?,
    }

    Ok(())
}
