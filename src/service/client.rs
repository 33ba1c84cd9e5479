//! HTTP client facade realization.
//!
//! Serializes every facade call as JSON over HTTP against a running broker
//! server, with bearer authentication and a 30 second per-call deadline.
//! Transport failures are translated into messages that tell the operator
//! what to do next.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ConfigError, ServiceError};
use crate::inject::InjectOutput;
use crate::request::AccessRequest;
use crate::service::{Health, SecretService};
use crate::store::SecretListing;

const CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct AddedSecret {
    uuid: Uuid,
}

/// Facade over the wire. Requires the bearer token at construction.
pub struct HttpService {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpService {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let token = config
            .server
            .auth_token
            .clone()
            .ok_or(ConfigError::MissingAuthToken)?;
        Ok(Self::new(
            format!("http://{}:{}", config.server.host, config.server.port),
            token,
        ))
    }

    pub fn new(base_url: String, token: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url,
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn transport_error(&self, e: reqwest::Error, op: &str) -> ServiceError {
        if e.is_timeout() {
            ServiceError::Transport(format!(
                "Request timed out after {}s: {op}",
                CALL_TIMEOUT.as_secs()
            ))
        } else if e.is_connect() {
            ServiceError::Transport(format!(
                "Server not running at {}. Start it with '2kc server start'.",
                self.base_url
            ))
        } else {
            ServiceError::Transport(format!("Transport failure during {op}: {e}"))
        }
    }

    /// Map error statuses to domain messages; pass 2xx through.
    async fn check(
        &self,
        response: reqwest::Response,
        op: &str,
    ) -> Result<reqwest::Response, ServiceError> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ServiceError::Auth(
                "Authentication failed: the server rejected the bearer token. \
                 Check server.authToken in your config."
                    .to_string(),
            ));
        }
        if !status.is_success() {
            let message = response
                .json::<ErrorBody>()
                .await
                .map(|b| b.error)
                .unwrap_or_else(|_| status.to_string());
            return Err(ServiceError::Server(format!("{op} failed: {message}")));
        }
        Ok(response)
    }

    async fn get(&self, path: &str, op: &str) -> Result<reqwest::Response, ServiceError> {
        let response = self
            .http
            .get(self.url(path))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| self.transport_error(e, op))?;
        self.check(response, op).await
    }

    async fn post(
        &self,
        path: &str,
        body: &serde_json::Value,
        op: &str,
    ) -> Result<reqwest::Response, ServiceError> {
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e, op))?;
        self.check(response, op).await
    }

    async fn parse<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
        op: &str,
    ) -> Result<T, ServiceError> {
        response
            .json()
            .await
            .map_err(|e| ServiceError::Server(format!("{op} returned a malformed body: {e}")))
    }
}

#[async_trait]
impl SecretService for HttpService {
    async fn health(&self) -> Result<Health, ServiceError> {
        let response = self.get("/health", "health check").await?;
        Self::parse(response, "health check").await
    }

    async fn list_secrets(&self) -> Result<Vec<SecretListing>, ServiceError> {
        let response = self.get("/api/secrets", "list secrets").await?;
        Self::parse(response, "list secrets").await
    }

    async fn add_secret(
        &self,
        slug: &str,
        value: &str,
        tags: Vec<String>,
    ) -> Result<Uuid, ServiceError> {
        let body = json!({ "ref": slug, "value": value, "tags": tags });
        let response = self.post("/api/secrets", &body, "add secret").await?;
        let added: AddedSecret = Self::parse(response, "add secret").await?;
        Ok(added.uuid)
    }

    async fn remove_secret(&self, uuid: Uuid) -> Result<(), ServiceError> {
        let op = "remove secret";
        let response = self
            .http
            .delete(self.url(&format!("/api/secrets/{uuid}")))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| self.transport_error(e, op))?;
        self.check(response, op).await?;
        Ok(())
    }

    async fn get_metadata(&self, uuid: Uuid) -> Result<SecretListing, ServiceError> {
        let op = "get secret metadata";
        let response = self.get(&format!("/api/secrets/{uuid}"), op).await?;
        Self::parse(response, op).await
    }

    async fn resolve_secret(&self, ref_or_uuid: &str) -> Result<SecretListing, ServiceError> {
        let op = "resolve secret";
        let response = self
            .get(&format!("/api/secrets/resolve/{ref_or_uuid}"), op)
            .await?;
        Self::parse(response, op).await
    }

    async fn create_request(
        &self,
        secret_uuids: Vec<Uuid>,
        reason: &str,
        task_ref: &str,
        duration_seconds: Option<u64>,
    ) -> Result<AccessRequest, ServiceError> {
        let op = "create request";
        let mut body = json!({
            "secretUuids": secret_uuids,
            "reason": reason,
            "taskRef": task_ref,
        });
        if let Some(duration) = duration_seconds {
            body["duration"] = json!(duration);
        }
        let response = self.post("/api/requests", &body, op).await?;
        Self::parse(response, op).await
    }

    async fn validate_grant(&self, request_id: Uuid) -> Result<bool, ServiceError> {
        let op = "validate grant";
        let response = self.get(&format!("/api/grants/{request_id}"), op).await?;
        Self::parse(response, op).await
    }

    async fn inject(
        &self,
        request_id: Uuid,
        env_var_name: Option<String>,
        command: Vec<String>,
    ) -> Result<InjectOutput, ServiceError> {
        let op = "inject";
        let body = json!({
            "requestId": request_id,
            "envVarName": env_var_name,
            "command": command,
        });
        let response = self.post("/api/inject", &body, op).await?;
        Self::parse(response, op).await
    }
}
