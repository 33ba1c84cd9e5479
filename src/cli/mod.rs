//! CLI command handling.
//!
//! Subcommands:
//! - `secrets {list,add,remove}` — manage the local store
//! - `request` — the end-to-end access attempt (request, approval, inject)
//! - `config {init,show}` — configuration management
//! - `server {start,stop,status,token generate}` — broker server lifecycle

mod config_cmd;
mod request;
mod secrets;
mod server_cmd;

pub use config_cmd::run_config_command;
pub use request::{run_request_command, run_request_with};
pub use secrets::run_secrets_command;
pub use server_cmd::run_server_command;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "2kc")]
#[command(about = "Local secret broker: justified, approved, single-use secret injection")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file path (defaults to ~/.2kc/config.json)
    #[arg(short, long, global = true)]
    pub config: Option<std::path::PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Manage stored secrets
    #[command(subcommand)]
    Secrets(SecretsCommand),

    /// Request access to secrets and run a command with them injected
    #[command(
        long_about = "Creates an access request, waits for approval when the \
                      policy demands it, and runs the command with the granted \
                      secrets in its environment.\nExample:\n  \
                      2kc request deploy-key --reason \"ship release\" --task T-42 \
                      --env DEPLOY_KEY --cmd ./deploy.sh"
    )]
    Request(RequestArgs),

    /// Manage configuration
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Manage the broker server
    #[command(subcommand)]
    Server(ServerCommand),
}

#[derive(Subcommand, Debug)]
pub enum SecretsCommand {
    /// List stored secrets (never values)
    List,

    /// Add a secret; reads the value from stdin when --value is omitted
    Add {
        /// Human slug for the secret (lowercase alphanumeric and dashes)
        reference: String,

        /// Secret value; prefer stdin to keep it out of shell history
        #[arg(long)]
        value: Option<String>,

        /// Tag to attach (repeatable)
        #[arg(long = "tag", value_name = "TAG")]
        tags: Vec<String>,
    },

    /// Remove a secret by ref or uuid
    Remove {
        /// Ref or uuid of the secret
        secret: String,
    },
}

#[derive(Args, Debug)]
pub struct RequestArgs {
    /// Secrets to request, by ref or uuid
    #[arg(required = true, value_name = "SECRET")]
    pub secrets: Vec<String>,

    /// Why the access is needed
    #[arg(long)]
    pub reason: String,

    /// Task reference the access belongs to
    #[arg(long = "task")]
    pub task_ref: String,

    /// Env var that receives the first requested secret verbatim
    #[arg(long = "env", value_name = "VAR")]
    pub env_var: Option<String>,

    /// Grant duration in seconds
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub duration: Option<u64>,

    /// Command to run with the secrets injected (everything after --cmd)
    #[arg(long = "cmd", num_args = 1.., allow_hyphen_values = true, required = true)]
    pub command: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Create a default config file
    Init,

    /// Print the config with sensitive fields redacted
    Show,
}

#[derive(Subcommand, Debug)]
pub enum ServerCommand {
    /// Start the broker server as a detached background process
    Start,

    /// Stop the background server
    Stop,

    /// Show whether the server is running
    Status,

    /// Bearer token management
    #[command(subcommand)]
    Token(TokenCommand),

    /// Run the server in the foreground (used internally by `start`)
    #[command(hide = true)]
    Run,
}

#[derive(Subcommand, Debug)]
pub enum TokenCommand {
    /// Generate a bearer token and store it in the config
    Generate,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn request_captures_trailing_command_with_flags() {
        let cli = Cli::parse_from([
            "2kc", "request", "deploy-key", "--reason", "ship", "--task", "T-1", "--env", "KEY",
            "--duration", "60", "--cmd", "printenv", "KEY",
        ]);
        let Command::Request(args) = cli.command else {
            panic!("expected request command");
        };
        assert_eq!(args.secrets, vec!["deploy-key"]);
        assert_eq!(args.env_var.as_deref(), Some("KEY"));
        assert_eq!(args.duration, Some(60));
        assert_eq!(args.command, vec!["printenv", "KEY"]);
    }

    #[test]
    fn request_command_may_contain_hyphen_args() {
        let cli = Cli::parse_from([
            "2kc", "request", "k", "--reason", "r", "--task", "t", "--cmd", "ls", "-la",
        ]);
        let Command::Request(args) = cli.command else {
            panic!("expected request command");
        };
        assert_eq!(args.command, vec!["ls", "-la"]);
    }

    #[test]
    fn zero_duration_is_rejected_at_parse_time() {
        let result = Cli::try_parse_from([
            "2kc", "request", "k", "--reason", "r", "--task", "t", "--duration", "0", "--cmd",
            "true",
        ]);
        assert!(result.is_err());
    }
}
