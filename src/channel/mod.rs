//! Approval channel capability.
//!
//! A channel is the out-of-band surface a human uses to approve or deny an
//! access request. Implementations provide three operations: post a request
//! summary, poll for a verdict, and deliver fire-and-forget audit
//! notifications.

mod discord;

pub use discord::DiscordChannel;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::request::RequestStatus;

/// Outcome of a human approval poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Approved,
    Denied,
    /// The deadline elapsed without a reaction either way.
    Timeout,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Approved => "approved",
            Verdict::Denied => "denied",
            Verdict::Timeout => "timeout",
        }
    }
}

impl From<Verdict> for RequestStatus {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Approved => RequestStatus::Approved,
            Verdict::Denied => RequestStatus::Denied,
            Verdict::Timeout => RequestStatus::Timeout,
        }
    }
}

/// Out-of-band human approval capability.
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    /// Post a human-readable request summary. The returned opaque message id
    /// is the handle [`wait_for_response`](Self::wait_for_response) polls.
    async fn send_approval_request(&self, summary: &str) -> Result<String, ChannelError>;

    /// Block (cooperatively) until a verdict is observable or the deadline
    /// elapses.
    async fn wait_for_response(
        &self,
        message_id: &str,
        timeout: Duration,
    ) -> Result<Verdict, ChannelError>;

    /// Fire-and-forget audit notification. Failures surface as errors; the
    /// orchestrator demotes them to warnings.
    async fn send_notification(&self, text: &str) -> Result<(), ChannelError>;
}
