//! The end-to-end access attempt behind `2kc request`.
//!
//! Sequence: resolve secrets, create the request, obtain a grant validity
//! signal (driving the approval workflow in standalone mode), inject, and
//! forward the child's output and exit code. Four audit events are emitted
//! in program order; their delivery is best-effort.

use std::io::Write;
use std::sync::Arc;

use crate::audit::Auditor;
use crate::channel::{ApprovalChannel, DiscordChannel};
use crate::cli::RequestArgs;
use crate::config::Config;
use crate::error::{GrantError, InjectError, ServiceError, StoreError, WorkflowError};
use crate::service::create_service;

/// Run one access attempt. `Ok(code)` carries the process exit code (the
/// child's, with a signalled child mapping to 1); hard failures before the
/// child ran come back as errors.
pub async fn run_request_command(args: RequestArgs, config: &Config) -> anyhow::Result<i32> {
    let service = create_service(config)?;
    let channel: Option<Arc<dyn ApprovalChannel>> = config
        .discord
        .as_ref()
        .map(|d| Arc::new(DiscordChannel::new(d)) as Arc<dyn ApprovalChannel>);
    let auditor = Auditor::new(channel);
    run_request_with(service, &auditor, args).await
}

/// Orchestrator body, parameterized over the facade and audit sink.
pub async fn run_request_with(
    service: Arc<dyn crate::service::SecretService>,
    auditor: &Auditor,
    args: RequestArgs,
) -> anyhow::Result<i32> {
    let mut uuids = Vec::with_capacity(args.secrets.len());
    for input in &args.secrets {
        let listing = service
            .resolve_secret(input)
            .await
            .map_err(|e| anyhow::anyhow!(user_message(&e)))?;
        uuids.push(listing.uuid);
    }

    let request = service
        .create_request(uuids, &args.reason, &args.task_ref, args.duration)
        .await
        .map_err(|e| anyhow::anyhow!(user_message(&e)))?;
    auditor
        .emit(
            request.id,
            "Request created",
            &format!(
                "secrets={} reason=\"{}\" task={} duration={}s",
                request.secret_uuids.len(),
                request.reason,
                request.task_ref,
                request.duration_seconds,
            ),
        )
        .await;

    let approved = service
        .validate_grant(request.id)
        .await
        .map_err(|e| anyhow::anyhow!(user_message(&e)))?;
    auditor
        .emit(
            request.id,
            if approved { "Approval approved" } else { "Approval denied" },
            &format!("request={}", request.id),
        )
        .await;

    if !approved {
        eprintln!("Access denied: request {} was not approved", request.id);
        return Ok(1);
    }

    // Metadata only; the value never appears in the audit trail.
    auditor
        .emit(
            request.id,
            "Secret injected",
            &format!(
                "env={} command={:?}",
                args.env_var.as_deref().unwrap_or("-"),
                args.command,
            ),
        )
        .await;

    let outcome = service
        .inject(request.id, args.env_var.clone(), args.command.clone())
        .await;

    match outcome {
        Ok(output) => {
            auditor
                .emit(
                    request.id,
                    "Grant used",
                    &format!("exitCode={:?}", output.exit_code),
                )
                .await;

            // Child output is forwarded verbatim, already redacted.
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            let _ = std::io::stdout().flush();
            let _ = std::io::stderr().flush();

            Ok(output.exit_code.unwrap_or(1))
        }
        Err(e) => Err(anyhow::anyhow!(user_message(&e))),
    }
}

/// Rewrite common failures into user-facing messages.
fn user_message(err: &ServiceError) -> String {
    match err {
        ServiceError::Store(StoreError::NotFound { lookup })
        | ServiceError::Workflow(WorkflowError::Store(StoreError::NotFound { lookup }))
        | ServiceError::Inject(InjectError::Store(StoreError::NotFound { lookup })) => {
            format!("Secret UUID not found: {lookup}")
        }
        ServiceError::Grant(GrantError::NotValid { id })
        | ServiceError::Inject(InjectError::GrantNotValid { id }) => {
            format!("Grant expired: {id}")
        }
        // Client-mode errors arrive as flattened server messages.
        ServiceError::Server(message) if message.contains("Grant is not valid") => {
            format!("Grant expired: {message}")
        }
        ServiceError::Server(message) if message.contains("not found") => {
            format!("Secret UUID not found: {message}")
        }
        other => other.to_string(),
    }
}
