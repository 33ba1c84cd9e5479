//! HTTP surface over the in-process facade.
//!
//! Same operations as [`SecretService`](crate::service::SecretService), JSON
//! bodies, bearer auth on everything except `/health`. Errors serialize as
//! `{error, statusCode}`; 5xx responses never leak the internal message.

mod auth;

pub use auth::validate_auth_token;

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{
    ConfigError, GrantError, InjectError, ServerError, ServiceError, StoreError, WorkflowError,
};
use crate::inject::InjectOutput;
use crate::request::AccessRequest;
use crate::service::{Health, LocalService, SecretService};
use crate::store::SecretListing;

/// Shared state behind every route.
pub struct ServerState {
    pub service: LocalService,
    pub token: String,
}

/// JSON error envelope.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.message,
            "statusCode": self.status.as_u16(),
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            // Internal details stay in the log, not on the wire.
            tracing::error!(error = %err, "internal server error");
            return ApiError::new(
                status,
                status.canonical_reason().unwrap_or("Internal Server Error"),
            );
        }
        ApiError::new(status, err.to_string())
    }
}

fn status_for(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::Store(e) => store_status(e),
        ServiceError::Request(_) => StatusCode::BAD_REQUEST,
        ServiceError::Grant(e) => match e {
            GrantError::NotFound { .. } => StatusCode::NOT_FOUND,
            GrantError::NotApproved { .. } => StatusCode::FORBIDDEN,
            GrantError::NotValid { .. } | GrantError::AlreadyRevoked { .. } => {
                StatusCode::CONFLICT
            }
        },
        ServiceError::Workflow(e) => match e {
            WorkflowError::Store(e) => store_status(e),
            WorkflowError::Channel(_) | WorkflowError::ChannelUnavailable => {
                StatusCode::BAD_GATEWAY
            }
        },
        ServiceError::Inject(e) => match e {
            InjectError::EmptyCommand | InjectError::PlaceholderOutOfScope { .. } => {
                StatusCode::BAD_REQUEST
            }
            InjectError::GrantNotFound { .. } => StatusCode::NOT_FOUND,
            InjectError::GrantNotValid { .. } => StatusCode::CONFLICT,
            InjectError::SpawnFailure { .. }
            | InjectError::BufferExceeded { .. }
            | InjectError::Timeout { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            InjectError::Store(e) => store_status(e),
        },
        ServiceError::Config(_)
        | ServiceError::Transport(_)
        | ServiceError::Auth(_)
        | ServiceError::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn store_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        StoreError::InvalidRef { .. } | StoreError::DuplicateRef { .. } => StatusCode::BAD_REQUEST,
        StoreError::Corrupted { .. } | StoreError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug, Deserialize)]
struct AddSecretBody {
    #[serde(rename = "ref")]
    slug: String,
    value: String,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRequestBody {
    secret_uuids: Vec<Uuid>,
    reason: String,
    task_ref: String,
    duration: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InjectBody {
    request_id: Uuid,
    env_var_name: Option<String>,
    command: Vec<String>,
}

async fn health(State(state): State<Arc<ServerState>>) -> Result<Json<Health>, ApiError> {
    Ok(Json(state.service.health().await?))
}

async fn list_secrets(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<SecretListing>>, ApiError> {
    Ok(Json(state.service.list_secrets().await?))
}

async fn add_secret(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<AddSecretBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let uuid = state
        .service
        .add_secret(&body.slug, &body.value, body.tags)
        .await?;
    Ok(Json(json!({ "uuid": uuid })))
}

async fn get_metadata(
    State(state): State<Arc<ServerState>>,
    Path(uuid): Path<Uuid>,
) -> Result<Json<SecretListing>, ApiError> {
    Ok(Json(state.service.get_metadata(uuid).await?))
}

async fn resolve_secret(
    State(state): State<Arc<ServerState>>,
    Path(ref_or_uuid): Path<String>,
) -> Result<Json<SecretListing>, ApiError> {
    Ok(Json(state.service.resolve_secret(&ref_or_uuid).await?))
}

async fn remove_secret(
    State(state): State<Arc<ServerState>>,
    Path(uuid): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.service.remove_secret(uuid).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_request(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<CreateRequestBody>,
) -> Result<Json<AccessRequest>, ApiError> {
    let request = state
        .service
        .create_request(body.secret_uuids, &body.reason, &body.task_ref, body.duration)
        .await?;
    Ok(Json(request))
}

async fn validate_grant(
    State(state): State<Arc<ServerState>>,
    Path(request_id): Path<Uuid>,
) -> Result<Json<bool>, ApiError> {
    Ok(Json(state.service.validate_grant(request_id).await?))
}

async fn inject(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<InjectBody>,
) -> Result<Json<InjectOutput>, ApiError> {
    let output = state
        .service
        .inject(body.request_id, body.env_var_name, body.command)
        .await?;
    Ok(Json(output))
}

async fn not_found() -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "Not Found")
}

/// Assemble the full router. Protected routes sit behind the bearer
/// middleware; `/health` does not.
pub fn router(state: Arc<ServerState>) -> Router {
    let api = Router::new()
        .route("/api/secrets", get(list_secrets).post(add_secret))
        .route(
            "/api/secrets/{uuid}",
            get(get_metadata).delete(remove_secret),
        )
        .route("/api/secrets/resolve/{ref_or_uuid}", get(resolve_secret))
        .route("/api/requests", post(create_request))
        .route("/api/grants/{request_id}", get(validate_grant))
        .route("/api/inject", post(inject))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::auth_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(api)
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the server in the foreground until SIGINT/SIGTERM. A missing auth
/// token is a hard startup failure.
pub async fn serve(config: &Config) -> Result<(), ServerError> {
    let token = config
        .server
        .auth_token
        .clone()
        .ok_or(ConfigError::MissingAuthToken)?;
    let service = LocalService::from_config(config)?;
    let state = Arc::new(ServerState { service, token });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ServerError::Bind {
            addr: addr.clone(),
            source: e,
        })?;

    tracing::info!("broker server listening on {addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("broker server stopped");
    Ok(())
}

/// Resolves on SIGINT or, on unix, SIGTERM. Running injector children are
/// not signalled; only the accept loop winds down.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(_) => return ctrl_c.await,
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}
