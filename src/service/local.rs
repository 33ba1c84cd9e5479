//! In-process facade realization.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use uuid::Uuid;

use crate::channel::{ApprovalChannel, DiscordChannel};
use crate::config::Config;
use crate::error::{ConfigError, GrantError, ServiceError};
use crate::grant::GrantManager;
use crate::inject::{InjectOptions, InjectOutput, Injector};
use crate::request::{AccessRequest, RequestLog, RequestStatus};
use crate::service::{Health, SecretService};
use crate::store::{SecretListing, SecretStore};
use crate::workflow::{ApprovalPolicy, Workflow};

/// Direct composition of store, log, workflow, grant manager, and injector.
/// Shared by the standalone CLI and the HTTP server.
pub struct LocalService {
    store: Arc<SecretStore>,
    log: RequestLog,
    grants: Arc<GrantManager>,
    workflow: Workflow,
    injector: Injector,
    /// request id -> issued grant id.
    grants_by_request: Mutex<HashMap<Uuid, Uuid>>,
    /// Serializes workflow-drive + grant issue per facade, so one request
    /// can never yield two grants under concurrent validation.
    approval_gate: tokio::sync::Mutex<()>,
    started_at: Instant,
}

impl LocalService {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let channel: Option<Arc<dyn ApprovalChannel>> = config
            .discord
            .as_ref()
            .map(|d| Arc::new(DiscordChannel::new(d)) as Arc<dyn ApprovalChannel>);
        let policy = ApprovalPolicy::new(
            config.require_approval.clone(),
            config.default_require_approval,
        );
        let store = Arc::new(SecretStore::new(config.store_path()?));
        Ok(Self::new(
            store,
            channel,
            policy,
            Duration::from_millis(config.approval_timeout_ms),
        ))
    }

    pub fn new(
        store: Arc<SecretStore>,
        channel: Option<Arc<dyn ApprovalChannel>>,
        policy: ApprovalPolicy,
        approval_timeout: Duration,
    ) -> Self {
        let grants = Arc::new(GrantManager::new());
        Self {
            workflow: Workflow::new(Arc::clone(&store), channel, policy, approval_timeout),
            injector: Injector::new(Arc::clone(&store), Arc::clone(&grants)),
            store,
            log: RequestLog::new(),
            grants,
            grants_by_request: Mutex::new(HashMap::new()),
            approval_gate: tokio::sync::Mutex::new(()),
            started_at: Instant::now(),
        }
    }

    fn grant_of(&self, request_id: Uuid) -> Option<Uuid> {
        self.grants_by_request
            .lock()
            .expect("grant map lock")
            .get(&request_id)
            .copied()
    }

    /// Snapshot of the request log, for diagnostics.
    pub fn requests(&self) -> Vec<AccessRequest> {
        self.log.all()
    }
}

#[async_trait]
impl SecretService for LocalService {
    async fn health(&self) -> Result<Health, ServiceError> {
        Ok(Health {
            status: "ok".to_string(),
            uptime: self.started_at.elapsed().as_secs(),
            pid: std::process::id(),
        })
    }

    async fn list_secrets(&self) -> Result<Vec<SecretListing>, ServiceError> {
        Ok(self.store.list()?)
    }

    async fn add_secret(
        &self,
        slug: &str,
        value: &str,
        tags: Vec<String>,
    ) -> Result<Uuid, ServiceError> {
        Ok(self.store.add(slug, value, tags)?)
    }

    async fn remove_secret(&self, uuid: Uuid) -> Result<(), ServiceError> {
        Ok(self.store.remove(uuid)?)
    }

    async fn get_metadata(&self, uuid: Uuid) -> Result<SecretListing, ServiceError> {
        Ok(self.store.get_metadata(uuid)?)
    }

    async fn resolve_secret(&self, ref_or_uuid: &str) -> Result<SecretListing, ServiceError> {
        Ok(self.store.resolve(ref_or_uuid)?)
    }

    async fn create_request(
        &self,
        secret_uuids: Vec<Uuid>,
        reason: &str,
        task_ref: &str,
        duration_seconds: Option<u64>,
    ) -> Result<AccessRequest, ServiceError> {
        let request = AccessRequest::new(secret_uuids, reason, task_ref, duration_seconds)?;
        self.log.append(request.clone());
        tracing::debug!(request = %request.id, "access request created");
        Ok(request)
    }

    async fn validate_grant(&self, request_id: Uuid) -> Result<bool, ServiceError> {
        // Fast path: a grant was already issued for this request.
        if let Some(grant_id) = self.grant_of(request_id) {
            return Ok(self.grants.validate_grant(grant_id));
        }

        let _gate = self.approval_gate.lock().await;
        // Re-check under the gate; a concurrent caller may have just won.
        if let Some(grant_id) = self.grant_of(request_id) {
            return Ok(self.grants.validate_grant(grant_id));
        }

        let Some(mut request) = self.log.get(request_id) else {
            return Ok(false);
        };

        if request.status == RequestStatus::Pending {
            let outcome = self.workflow.process_request(&mut request).await;
            self.log.set_status(request_id, request.status);
            outcome?;
        }

        if request.status != RequestStatus::Approved {
            return Ok(false);
        }

        self.grants.cleanup();
        let grant = self.grants.create_grant(&request)?;
        self.grants_by_request
            .lock()
            .expect("grant map lock")
            .insert(request_id, grant.id);
        Ok(self.grants.validate_grant(grant.id))
    }

    async fn inject(
        &self,
        request_id: Uuid,
        env_var_name: Option<String>,
        command: Vec<String>,
    ) -> Result<InjectOutput, ServiceError> {
        let grant_id = self
            .grant_of(request_id)
            .ok_or(ServiceError::Grant(GrantError::NotFound { id: request_id }))?;
        let output = self
            .injector
            .inject(
                grant_id,
                &command,
                InjectOptions {
                    env_var_name,
                    ..Default::default()
                },
            )
            .await?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn service() -> (TempDir, LocalService) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SecretStore::new(dir.path().join("secrets.json")));
        let service = LocalService::new(
            store,
            None,
            ApprovalPolicy::default(),
            Duration::from_secs(1),
        );
        (dir, service)
    }

    #[tokio::test]
    async fn end_to_end_auto_approval_and_injection() {
        let (_dir, service) = service();
        let uuid = service
            .add_secret("deploy-key", "super-secret-value", vec!["dev".to_string()])
            .await
            .unwrap();

        let request = service
            .create_request(vec![uuid], "ship", "T-1", Some(60))
            .await
            .unwrap();

        assert!(service.validate_grant(request.id).await.unwrap());
        // Idempotent while the grant stays valid.
        assert!(service.validate_grant(request.id).await.unwrap());

        let out = service
            .inject(
                request.id,
                Some("KEY".to_string()),
                vec!["sh".into(), "-c".into(), "echo \"$KEY\"".into()],
            )
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.stdout, "[REDACTED]\n");

        // The grant is single-use: validation now fails.
        assert!(!service.validate_grant(request.id).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_request_validates_false() {
        let (_dir, service) = service();
        assert!(!service.validate_grant(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn inject_without_grant_fails() {
        let (_dir, service) = service();
        let err = service
            .inject(Uuid::new_v4(), None, vec!["true".to_string()])
            .await;
        assert!(matches!(
            err,
            Err(ServiceError::Grant(GrantError::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (_dir, service) = service();
        let health = service.health().await.unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.pid, std::process::id());
    }
}
