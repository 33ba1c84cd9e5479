//! `2kc config` subcommands.

use std::path::Path;

use crate::cli::ConfigCommand;
use crate::config::Config;
use crate::error::ConfigError;

pub fn run_config_command(
    command: ConfigCommand,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    let path = match config_path {
        Some(p) => p.to_path_buf(),
        None => Config::default_path()?,
    };

    match command {
        ConfigCommand::Init => {
            if path.exists() {
                return Err(ConfigError::AlreadyExists {
                    path: path.display().to_string(),
                }
                .into());
            }
            Config::default().save(&path)?;
            println!("Wrote default config to {}", path.display());
        }
        ConfigCommand::Show => {
            let config = Config::load(Some(&path))?;
            println!("{}", serde_json::to_string_pretty(&config.redacted_json())?);
        }
    }
    Ok(())
}
