//! Configuration view, validation and init: `pipewright config`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use pipewright::config::{CONFIG_FILE, PipewrightConfig, PipewrightToml};
use pipewright::session::STATE_DIR;

use super::super::ConfigCommands;

pub fn cmd_config(workspace: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let state_dir = workspace.join(STATE_DIR);
    let config_path = state_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("{}", style("Pipewright Configuration").bold().cyan());
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No config.toml at {}; showing defaults.", config_path.display());
            }
            println!();

            let config = PipewrightConfig::new(workspace)?;
            let rendered =
                toml::to_string_pretty(&config.toml).context("Failed to render configuration")?;
            println!("Effective values (with environment overrides):");
            println!();
            println!("{}", rendered.trim_end());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            let toml = PipewrightToml::load_or_default(&state_dir)?;
            let warnings = toml.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("config.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            PipewrightToml::default().save(&config_path)?;

            println!("Created config.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [executor] command, args");
            println!("  - [defaults] timeouts, max_parallel, fail_fast");
            println!("  - [stages.overrides.\"pattern-*\"] for stage-specific timeouts");
            println!();
        }
    }

    Ok(())
}
