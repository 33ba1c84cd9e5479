//! 2kc - Main entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use twokeychains::{
    cli::{
        Cli, Command, ServerCommand, run_config_command, run_request_command, run_secrets_command,
        run_server_command,
    },
    config::Config,
    service::create_service,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The foreground server is chatty by default; CLI commands are quiet.
    let default_filter = match &cli.command {
        Command::Server(ServerCommand::Run) => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config_path = cli.config.as_deref();

    match cli.command {
        Command::Secrets(command) => {
            let config = Config::load(config_path)?;
            let service = create_service(&config)?;
            run_secrets_command(command, service).await
        }
        Command::Request(args) => {
            let config = Config::load(config_path)?;
            let code = run_request_command(args, &config).await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Command::Config(command) => run_config_command(command, config_path),
        Command::Server(command) => run_server_command(command, config_path).await,
    }
}
