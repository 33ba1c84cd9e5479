//! Audit trail for access attempts.
//!
//! Events are formatted `[2kc] [<ISO timestamp>] [<requestId>] <event>:
//! <details>` and delivered to the notification channel when one is
//! configured. Delivery is best-effort: a failure becomes a stderr warning
//! and never aborts the main flow.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use uuid::Uuid;

use crate::channel::ApprovalChannel;

pub struct Auditor {
    channel: Option<Arc<dyn ApprovalChannel>>,
}

impl Auditor {
    pub fn new(channel: Option<Arc<dyn ApprovalChannel>>) -> Self {
        Self { channel }
    }

    /// Emit one audit event. Details carry metadata only, never secret
    /// values.
    pub async fn emit(&self, request_id: Uuid, event: &str, details: &str) {
        let line = format_event(request_id, event, details);
        tracing::info!(target: "audit", "{line}");

        if let Some(channel) = &self.channel {
            if let Err(e) = channel.send_notification(&line).await {
                eprintln!("[audit] Warning: {e}");
            }
        }
    }
}

fn format_event(request_id: Uuid, event: &str, details: &str) -> String {
    format!(
        "[2kc] [{}] [{}] {}: {}",
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        request_id,
        event,
        details,
    )
}
