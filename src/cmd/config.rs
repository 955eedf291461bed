//! Configuration view and validation commands: `condense config`.

use anyhow::{Context, Result};
use condense::config::{CONFIG_FILE, CondenseConfig, CondenseToml};

use super::super::ConfigCommands;

pub fn cmd_config(config: &CondenseConfig, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_file();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Condense Configuration");
            println!("======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} found at {}", CONFIG_FILE, config_path.display());
                println!("Using defaults. Run 'condense config init' to create one.");
            }
            println!();
            println!("Effective values (with env/CLI overrides):");
            println!();
            let rendered = toml::to_string_pretty(&config.toml)
                .context("Failed to render configuration")?;
            println!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No {} found. Using defaults (valid).", CONFIG_FILE);
                return Ok(());
            }

            let toml = CondenseToml::load(&config_path)?;
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
                println!("{} already exists at {}", CONFIG_FILE, config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            CondenseToml::default().save(&config_path)?;

            println!("Created {} at {}", CONFIG_FILE, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [thresholds] chunked, hierarchical");
            println!("  - [compaction] target_chunk_tokens, map_concurrency, max_passes");
            println!("  - [overview] concurrency, diagrams, section budgets");
            println!("  - [[providers]] order, models and pricing");
            println!();
        }
    }

    Ok(())
}
