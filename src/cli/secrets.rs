//! `2kc secrets` subcommands.

use std::io::Read;
use std::sync::Arc;

use crate::cli::SecretsCommand;
use crate::service::SecretService;

pub async fn run_secrets_command(
    command: SecretsCommand,
    service: Arc<dyn SecretService>,
) -> anyhow::Result<()> {
    match command {
        SecretsCommand::List => {
            let secrets = service.list_secrets().await?;
            if secrets.is_empty() {
                println!("No secrets stored.");
                return Ok(());
            }
            for secret in secrets {
                println!("{}  {}  [{}]", secret.uuid, secret.slug, secret.tags.join(", "));
            }
        }
        SecretsCommand::Add {
            reference,
            value,
            tags,
        } => {
            let value = match value {
                Some(v) => v,
                None => read_value_from_stdin()?,
            };
            let uuid = service.add_secret(&reference, &value, tags).await?;
            println!("Added '{reference}' as {uuid}");
        }
        SecretsCommand::Remove { secret } => {
            let listing = service.resolve_secret(&secret).await?;
            service.remove_secret(listing.uuid).await?;
            println!("Removed '{}' ({})", listing.slug, listing.uuid);
        }
    }
    Ok(())
}

/// Read the secret value from stdin, dropping one trailing newline.
fn read_value_from_stdin() -> anyhow::Result<String> {
    eprintln!("Reading secret value from stdin (end with EOF)...");
    let mut value = String::new();
    std::io::stdin().read_to_string(&mut value)?;
    let value = value.strip_suffix('\n').unwrap_or(&value).to_string();
    if value.is_empty() {
        anyhow::bail!("secret value must not be empty");
    }
    Ok(value)
}
