//! Error types for the secret broker.
//!
//! Each component has its own error enum; the service facade folds them into
//! [`ServiceError`] at the capability boundary. Library code propagates these
//! with `?`; only the binary converts to `anyhow` for display.

use thiserror::Error;
use uuid::Uuid;

/// Errors from the file-backed secret store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The ref slug does not match the accepted grammar.
    #[error("Invalid secret ref '{reference}': {reason}")]
    InvalidRef { reference: String, reason: String },

    /// A secret with this ref already exists.
    #[error("A secret with ref '{reference}' already exists")]
    DuplicateRef { reference: String },

    /// No secret matches the lookup. The message preserves whether the
    /// lookup went through the uuid or the ref path.
    #[error("Secret not found: {lookup}")]
    NotFound { lookup: String },

    /// The store file exists but does not parse. Never silently replaced
    /// with an empty store.
    #[error("Secret store at {path} is corrupted: {reason}")]
    Corrupted { path: String, reason: String },

    /// Underlying filesystem failure.
    #[error("Secret store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from access-request validation.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("Request must name at least one secret")]
    NoSecrets,

    /// `reason` or `taskRef` was empty after trimming.
    #[error("Request field '{field}' must not be empty")]
    EmptyField { field: &'static str },

    #[error("Duration must be at least {min} seconds, got {got}")]
    DurationTooShort { min: u64, got: u64 },

    #[error("Duration must be at most {max} seconds, got {got}")]
    DurationTooLong { max: u64, got: u64 },
}

/// Errors from grant-manager operations.
#[derive(Debug, Error)]
pub enum GrantError {
    /// Grant creation requires an approved request.
    #[error("Request {id} is not approved")]
    NotApproved { id: Uuid },

    #[error("Grant not found: {id}")]
    NotFound { id: Uuid },

    /// The grant exists but is used, revoked, or expired.
    #[error("Grant is not valid: {id}")]
    NotValid { id: Uuid },

    #[error("Grant already revoked: {id}")]
    AlreadyRevoked { id: Uuid },
}

/// Errors from an approval channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The remote API answered with a non-success status.
    #[error("Channel API error ({status}): {body}")]
    Api { status: u16, body: String },

    /// Transport-level failure reaching the channel.
    #[error("Channel transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// The channel answered 2xx but the payload was not understood.
    #[error("Malformed channel response: {reason}")]
    MalformedResponse { reason: String },
}

/// Errors from the approval workflow.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Approval channel failure: {0}")]
    Channel(#[from] ChannelError),

    /// Approval is required by policy but no channel is configured.
    #[error("Approval required but no approval channel is configured")]
    ChannelUnavailable,
}

/// Errors from the injector.
#[derive(Debug, Error)]
pub enum InjectError {
    #[error("Command must not be empty")]
    EmptyCommand,

    #[error("Grant is not valid: {id}")]
    GrantNotValid { id: Uuid },

    #[error("Grant not found: {id}")]
    GrantNotFound { id: Uuid },

    /// An env var carried a full-value placeholder resolving to a secret
    /// outside the grant.
    #[error(
        "Env var {var} holds placeholder '{placeholder}' resolving to {uuid}, \
         which is not covered by the grant"
    )]
    PlaceholderOutOfScope {
        var: String,
        placeholder: String,
        uuid: Uuid,
    },

    #[error("Failed to spawn '{command}': {reason}")]
    SpawnFailure { command: String, reason: String },

    /// Raw (pre-redaction) output exceeded the per-pipe cap; the child was
    /// killed.
    #[error("Child {stream} exceeded the {limit} byte output cap")]
    BufferExceeded { stream: &'static str, limit: usize },

    /// The run timer fired; the child was killed.
    #[error("Child process timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors surfaced by the service facade, either realization.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Grant(#[from] GrantError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Inject(#[from] InjectError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Could not reach the server at all (client mode).
    #[error("{0}")]
    Transport(String),

    /// The server rejected the bearer token (client mode).
    #[error("{0}")]
    Auth(String),

    /// The server answered with an error payload (client mode).
    #[error("{0}")]
    Server(String),
}

/// Errors from configuration loading and persistence.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config at {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Config at {path} is not valid JSON: {reason}")]
    Parse { path: String, reason: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("server.authToken is not configured; run '2kc server token generate' first")]
    MissingAuthToken,

    #[error("Could not determine the user home directory")]
    NoHomeDir,

    #[error("Config file already exists at {path}")]
    AlreadyExists { path: String },

    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the HTTP server lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from daemon supervision (PID file, detached spawn).
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Server already running with pid {pid}")]
    AlreadyRunning { pid: i32 },

    #[error("Server is not running")]
    NotRunning,

    #[error("PID file at {path} is unreadable: {reason}")]
    BadPidFile { path: String, reason: String },

    #[error("Failed to spawn server process: {0}")]
    Spawn(std::io::Error),

    #[error("Daemon I/O error: {0}")]
    Io(#[from] std::io::Error),
}
