//! Service facade: one capability surface, two realizations.
//!
//! `standalone` mode composes the components in-process; `client` mode
//! serializes every call over HTTP to a running server. Callers other than
//! the server itself only ever see [`SecretService`].

mod client;
mod local;

pub use client::HttpService;
pub use local::LocalService;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{Config, Mode};
use crate::error::ServiceError;
use crate::inject::InjectOutput;
use crate::request::AccessRequest;
use crate::store::SecretListing;

/// `/health` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
    /// Seconds since the serving process started.
    pub uptime: u64,
    pub pid: u32,
}

/// Uniform broker operation surface.
#[async_trait]
pub trait SecretService: Send + Sync {
    async fn health(&self) -> Result<Health, ServiceError>;

    async fn list_secrets(&self) -> Result<Vec<SecretListing>, ServiceError>;

    async fn add_secret(
        &self,
        slug: &str,
        value: &str,
        tags: Vec<String>,
    ) -> Result<Uuid, ServiceError>;

    async fn remove_secret(&self, uuid: Uuid) -> Result<(), ServiceError>;

    async fn get_metadata(&self, uuid: Uuid) -> Result<SecretListing, ServiceError>;

    async fn resolve_secret(&self, ref_or_uuid: &str) -> Result<SecretListing, ServiceError>;

    async fn create_request(
        &self,
        secret_uuids: Vec<Uuid>,
        reason: &str,
        task_ref: &str,
        duration_seconds: Option<u64>,
    ) -> Result<AccessRequest, ServiceError>;

    /// Whether the request currently holds a valid grant. In standalone
    /// mode a pending request is first driven through the approval workflow
    /// and, on approval, granted.
    async fn validate_grant(&self, request_id: Uuid) -> Result<bool, ServiceError>;

    /// Run a command with the request's granted secrets injected.
    async fn inject(
        &self,
        request_id: Uuid,
        env_var_name: Option<String>,
        command: Vec<String>,
    ) -> Result<InjectOutput, ServiceError>;
}

/// Build the facade realization selected by `config.mode`. Client mode
/// requires the bearer token up front.
pub fn create_service(config: &Config) -> Result<Arc<dyn SecretService>, ServiceError> {
    match config.mode {
        Mode::Standalone => Ok(Arc::new(LocalService::from_config(config)?)),
        Mode::Client => Ok(Arc::new(HttpService::from_config(config)?)),
    }
}
