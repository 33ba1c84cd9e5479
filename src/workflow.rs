//! Approval workflow: tag policy resolution and channel drive.
//!
//! The workflow owns the request while processing and writes exactly one
//! terminal status back. Any failure along the way marks the request denied
//! before the error is re-raised.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::channel::{ApprovalChannel, Verdict};
use crate::error::WorkflowError;
use crate::request::{AccessRequest, RequestStatus};
use crate::store::{SecretListing, SecretStore};

/// Tag-based approval policy.
///
/// Per secret, the first tag with an explicit entry decides (an explicit
/// `false` opts out even when the default is `true`); a secret with no
/// listed tag falls back to the default. Across secrets the results OR:
/// one secret needing approval is enough.
#[derive(Debug, Clone, Default)]
pub struct ApprovalPolicy {
    require_approval: HashMap<String, bool>,
    default_require_approval: bool,
}

impl ApprovalPolicy {
    pub fn new(require_approval: HashMap<String, bool>, default_require_approval: bool) -> Self {
        Self {
            require_approval,
            default_require_approval,
        }
    }

    fn secret_needs_approval(&self, tags: &[String]) -> bool {
        for tag in tags {
            if let Some(&required) = self.require_approval.get(tag) {
                return required;
            }
        }
        self.default_require_approval
    }

    /// Whether any of the given secrets requires human approval.
    pub fn needs_approval(&self, secrets: &[SecretListing]) -> bool {
        secrets.iter().any(|s| self.secret_needs_approval(&s.tags))
    }
}

/// Drives a pending request to a terminal status.
pub struct Workflow {
    store: Arc<SecretStore>,
    channel: Option<Arc<dyn ApprovalChannel>>,
    policy: ApprovalPolicy,
    approval_timeout: Duration,
}

impl Workflow {
    pub fn new(
        store: Arc<SecretStore>,
        channel: Option<Arc<dyn ApprovalChannel>>,
        policy: ApprovalPolicy,
        approval_timeout: Duration,
    ) -> Self {
        Self {
            store,
            channel,
            policy,
            approval_timeout,
        }
    }

    /// Resolve the policy for the request's secrets and, when needed, put
    /// the request in front of a human. Mutates `request.status` exactly
    /// once.
    pub async fn process_request(
        &self,
        request: &mut AccessRequest,
    ) -> Result<Verdict, WorkflowError> {
        let mut secrets = Vec::with_capacity(request.secret_uuids.len());
        for uuid in &request.secret_uuids {
            match self.store.get_metadata(*uuid) {
                Ok(listing) => secrets.push(listing),
                Err(e) => {
                    request.status = RequestStatus::Denied;
                    return Err(e.into());
                }
            }
        }

        if !self.policy.needs_approval(&secrets) {
            request.status = RequestStatus::Approved;
            tracing::debug!(request = %request.id, "auto-approved, no tagged secret requires approval");
            return Ok(Verdict::Approved);
        }

        let Some(channel) = &self.channel else {
            request.status = RequestStatus::Denied;
            return Err(WorkflowError::ChannelUnavailable);
        };

        let summary = build_summary(request, &secrets);
        let verdict = async {
            let message_id = channel.send_approval_request(&summary).await?;
            channel
                .wait_for_response(&message_id, self.approval_timeout)
                .await
        }
        .await;

        match verdict {
            Ok(verdict) => {
                request.status = verdict.into();
                tracing::info!(request = %request.id, verdict = verdict.as_str(), "approval verdict");
                Ok(verdict)
            }
            Err(e) => {
                request.status = RequestStatus::Denied;
                Err(e.into())
            }
        }
    }
}

/// Human-readable channel post: all uuids and slugs, the justification, and
/// the requested window.
fn build_summary(request: &AccessRequest, secrets: &[SecretListing]) -> String {
    let names = secrets
        .iter()
        .map(|s| format!("`{}` ({})", s.slug, s.uuid))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "**Secret access request** `{id}`\n\
         Secrets: {names}\n\
         Reason: {reason}\n\
         Task: {task}\n\
         Duration: {duration}s\n\
         React \u{2705} to approve or \u{274c} to deny.",
        id = request.id,
        names = names,
        reason = request.reason,
        task = request.task_ref,
        duration = request.duration_seconds,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::TempDir;
    use uuid::Uuid;

    use crate::error::ChannelError;

    fn listing(tags: &[&str]) -> SecretListing {
        SecretListing {
            uuid: Uuid::new_v4(),
            slug: "any".to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn policy(entries: &[(&str, bool)], default: bool) -> ApprovalPolicy {
        ApprovalPolicy::new(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            default,
        )
    }

    #[test]
    fn untagged_secrets_follow_the_default() {
        let p = policy(&[("production", true)], false);
        assert!(!p.needs_approval(&[listing(&["dev"])]));

        let p = policy(&[], true);
        assert!(p.needs_approval(&[listing(&[])]));
    }

    #[test]
    fn or_semantics_across_secrets() {
        let p = policy(&[("production", true)], false);
        assert!(p.needs_approval(&[listing(&["dev"]), listing(&["production"])]));
        assert!(!p.needs_approval(&[listing(&["dev"]), listing(&["dev"])]));
    }

    #[test]
    fn explicit_false_opts_out_of_the_default() {
        let p = policy(&[("scratch", false)], true);
        assert!(!p.needs_approval(&[listing(&["scratch"])]));
        // But it does not cancel another secret's explicit true.
        let p = policy(&[("scratch", false), ("production", true)], true);
        assert!(p.needs_approval(&[listing(&["scratch"]), listing(&["production"])]));
    }

    #[test]
    fn first_listed_tag_wins_within_a_secret() {
        let p = policy(&[("a", false), ("b", true)], false);
        assert!(!p.needs_approval(&[listing(&["a", "b"])]));
        assert!(p.needs_approval(&[listing(&["b", "a"])]));
    }

    /// Channel stub recording calls and returning a scripted verdict.
    struct StubChannel {
        verdict: Verdict,
        sends: Mutex<Vec<String>>,
    }

    impl StubChannel {
        fn new(verdict: Verdict) -> Self {
            Self {
                verdict,
                sends: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ApprovalChannel for StubChannel {
        async fn send_approval_request(&self, summary: &str) -> Result<String, ChannelError> {
            self.sends.lock().unwrap().push(summary.to_string());
            Ok("msg-1".to_string())
        }

        async fn wait_for_response(
            &self,
            _message_id: &str,
            _timeout: Duration,
        ) -> Result<Verdict, ChannelError> {
            Ok(self.verdict)
        }

        async fn send_notification(&self, _text: &str) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    fn seeded_store(tags: &[&str]) -> (TempDir, Arc<SecretStore>, Uuid) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SecretStore::new(dir.path().join("secrets.json")));
        let uuid = store
            .add(
                "deploy-key",
                "v",
                tags.iter().map(|t| t.to_string()).collect(),
            )
            .unwrap();
        (dir, store, uuid)
    }

    #[tokio::test]
    async fn auto_approval_skips_the_channel() {
        let (_dir, store, uuid) = seeded_store(&["dev"]);
        let channel = Arc::new(StubChannel::new(Verdict::Denied));
        let workflow = Workflow::new(
            store,
            Some(channel.clone()),
            policy(&[("production", true)], false),
            Duration::from_secs(1),
        );

        let mut req = AccessRequest::new(vec![uuid], "ship", "T-1", Some(60)).unwrap();
        let verdict = workflow.process_request(&mut req).await.unwrap();

        assert_eq!(verdict, Verdict::Approved);
        assert_eq!(req.status, RequestStatus::Approved);
        assert!(channel.sends.lock().unwrap().is_empty(), "channel was consulted");
    }

    #[tokio::test]
    async fn tagged_secret_goes_through_the_channel() {
        let (_dir, store, uuid) = seeded_store(&["production"]);
        let channel = Arc::new(StubChannel::new(Verdict::Approved));
        let workflow = Workflow::new(
            store,
            Some(channel.clone()),
            policy(&[("production", true)], false),
            Duration::from_secs(1),
        );

        let mut req = AccessRequest::new(vec![uuid], "ship", "T-1", Some(60)).unwrap();
        let verdict = workflow.process_request(&mut req).await.unwrap();

        assert_eq!(verdict, Verdict::Approved);
        assert_eq!(req.status, RequestStatus::Approved);

        let sends = channel.sends.lock().unwrap();
        assert_eq!(sends.len(), 1, "exactly one approval request");
        assert!(sends[0].contains("deploy-key"));
        assert!(sends[0].contains(&uuid.to_string()));
        assert!(sends[0].contains("ship"));
    }

    #[tokio::test]
    async fn denial_is_terminal() {
        let (_dir, store, uuid) = seeded_store(&["production"]);
        let workflow = Workflow::new(
            store,
            Some(Arc::new(StubChannel::new(Verdict::Denied))),
            policy(&[("production", true)], false),
            Duration::from_secs(1),
        );

        let mut req = AccessRequest::new(vec![uuid], "ship", "T-1", Some(60)).unwrap();
        assert_eq!(workflow.process_request(&mut req).await.unwrap(), Verdict::Denied);
        assert_eq!(req.status, RequestStatus::Denied);
    }

    #[tokio::test]
    async fn unknown_secret_denies_and_reraises() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SecretStore::new(dir.path().join("secrets.json")));
        let workflow = Workflow::new(store, None, ApprovalPolicy::default(), Duration::from_secs(1));

        let mut req = AccessRequest::new(vec![Uuid::new_v4()], "r", "t", None).unwrap();
        let err = workflow.process_request(&mut req).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Store(_)));
        assert_eq!(req.status, RequestStatus::Denied);
    }

    #[tokio::test]
    async fn approval_without_channel_denies() {
        let (_dir, store, uuid) = seeded_store(&["production"]);
        let workflow = Workflow::new(
            store,
            None,
            policy(&[("production", true)], false),
            Duration::from_secs(1),
        );

        let mut req = AccessRequest::new(vec![uuid], "r", "t", None).unwrap();
        let err = workflow.process_request(&mut req).await.unwrap_err();
        assert!(matches!(err, WorkflowError::ChannelUnavailable));
        assert_eq!(req.status, RequestStatus::Denied);
    }

    #[tokio::test]
    async fn channel_failure_denies_and_reraises() {
        struct FailingChannel;

        #[async_trait]
        impl ApprovalChannel for FailingChannel {
            async fn send_approval_request(&self, _: &str) -> Result<String, ChannelError> {
                Err(ChannelError::Api {
                    status: 500,
                    body: "boom".to_string(),
                })
            }
            async fn wait_for_response(
                &self,
                _: &str,
                _: Duration,
            ) -> Result<Verdict, ChannelError> {
                unreachable!("send already failed")
            }
            async fn send_notification(&self, _: &str) -> Result<(), ChannelError> {
                Ok(())
            }
        }

        let (_dir, store, uuid) = seeded_store(&["production"]);
        let workflow = Workflow::new(
            store,
            Some(Arc::new(FailingChannel)),
            policy(&[("production", true)], false),
            Duration::from_secs(1),
        );

        let mut req = AccessRequest::new(vec![uuid], "r", "t", None).unwrap();
        let err = workflow.process_request(&mut req).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Channel(_)));
        assert_eq!(req.status, RequestStatus::Denied);
    }
}
