//! `2kc server` subcommands.

use std::path::Path;

use rand::Rng;

use crate::cli::{ServerCommand, TokenCommand};
use crate::config::Config;
use crate::daemon::Daemon;
use crate::error::ConfigError;
use crate::server;

pub async fn run_server_command(
    command: ServerCommand,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    match command {
        ServerCommand::Start => {
            let config = Config::load(config_path)?;
            if config.server.auth_token.is_none() {
                return Err(ConfigError::MissingAuthToken.into());
            }
            let daemon = Daemon::from_home()?;
            let pid = daemon.start(config_path)?;
            println!(
                "Server started (pid {pid}) on {}:{}, logging to {}",
                config.server.host,
                config.server.port,
                daemon.log_path().display(),
            );
        }
        ServerCommand::Stop => {
            let pid = Daemon::from_home()?.stop()?;
            println!("Server stopped (pid {pid})");
        }
        ServerCommand::Status => {
            let config = Config::load(config_path)?;
            match Daemon::from_home()?.status()? {
                Some(pid) => {
                    println!("Server running (pid {pid})");
                    match probe_health(&config).await {
                        Ok(uptime) => println!("Health: ok, uptime {uptime}s"),
                        Err(e) => println!("Health: unreachable ({e})"),
                    }
                }
                None => println!("Server is not running"),
            }
        }
        ServerCommand::Token(TokenCommand::Generate) => {
            let path = match config_path {
                Some(p) => p.to_path_buf(),
                None => Config::default_path()?,
            };
            let mut config = Config::load(Some(&path))?;
            let token = generate_token();
            config.server.auth_token = Some(token.clone());
            config.save(&path)?;
            println!("{token}");
            eprintln!("Stored in {} (mode 0600)", path.display());
        }
        ServerCommand::Run => {
            let config = Config::load(config_path)?;
            server::serve(&config).await?;
        }
    }
    Ok(())
}

/// Generate a cryptographically random token (32 bytes, hex-encoded).
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    bytes.iter().fold(String::with_capacity(64), |mut s, b| {
        use std::fmt::Write;
        let _ = write!(s, "{b:02x}");
        s
    })
}

/// Unauthenticated `/health` probe with a short deadline.
async fn probe_health(config: &Config) -> anyhow::Result<u64> {
    let url = format!(
        "http://{}:{}/health",
        config.server.host, config.server.port
    );
    let response = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(2))
        .build()?
        .get(url)
        .send()
        .await?;
    let body: serde_json::Value = response.json().await?;
    Ok(body["uptime"].as_u64().unwrap_or(0))
}
