//! Access requests and the in-memory request log.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RequestError;

pub const MIN_DURATION_SECS: u64 = 30;
pub const MAX_DURATION_SECS: u64 = 3600;
pub const DEFAULT_DURATION_SECS: u64 = 300;

/// Lifecycle status of an access request. Created `pending`; the workflow
/// moves it exactly once to a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Denied,
    Timeout,
    Expired,
}

/// An attempt to access one or more secrets, with justification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRequest {
    pub id: Uuid,
    /// Ordered, deduplicated, non-empty.
    pub secret_uuids: Vec<Uuid>,
    pub reason: String,
    pub task_ref: String,
    pub duration_seconds: u64,
    pub requested_at: DateTime<Utc>,
    pub status: RequestStatus,
}

impl AccessRequest {
    /// Validate and build a new pending request.
    pub fn new(
        secret_uuids: Vec<Uuid>,
        reason: &str,
        task_ref: &str,
        duration_seconds: Option<u64>,
    ) -> Result<Self, RequestError> {
        let mut deduped: Vec<Uuid> = Vec::with_capacity(secret_uuids.len());
        for uuid in secret_uuids {
            if !deduped.contains(&uuid) {
                deduped.push(uuid);
            }
        }
        if deduped.is_empty() {
            return Err(RequestError::NoSecrets);
        }

        let reason = reason.trim();
        if reason.is_empty() {
            return Err(RequestError::EmptyField { field: "reason" });
        }
        let task_ref = task_ref.trim();
        if task_ref.is_empty() {
            return Err(RequestError::EmptyField { field: "taskRef" });
        }

        let duration = duration_seconds.unwrap_or(DEFAULT_DURATION_SECS);
        if duration < MIN_DURATION_SECS {
            return Err(RequestError::DurationTooShort {
                min: MIN_DURATION_SECS,
                got: duration,
            });
        }
        if duration > MAX_DURATION_SECS {
            return Err(RequestError::DurationTooLong {
                max: MAX_DURATION_SECS,
                got: duration,
            });
        }

        Ok(Self {
            id: Uuid::new_v4(),
            secret_uuids: deduped,
            reason: reason.to_string(),
            task_ref: task_ref.to_string(),
            duration_seconds: duration,
            requested_at: Utc::now(),
            status: RequestStatus::Pending,
        })
    }
}

/// Append-only in-memory request log. Reads hand out copies so callers can
/// never alias the internal state.
#[derive(Default)]
pub struct RequestLog {
    entries: Mutex<Vec<AccessRequest>>,
}

impl RequestLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, request: AccessRequest) {
        self.entries.lock().expect("request log lock").push(request);
    }

    /// Snapshot of all requests.
    pub fn all(&self) -> Vec<AccessRequest> {
        self.entries.lock().expect("request log lock").clone()
    }

    pub fn get(&self, id: Uuid) -> Option<AccessRequest> {
        self.entries
            .lock()
            .expect("request log lock")
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Requests whose secret set contains the given uuid.
    pub fn find_by_secret(&self, uuid: Uuid) -> Vec<AccessRequest> {
        self.entries
            .lock()
            .expect("request log lock")
            .iter()
            .filter(|r| r.secret_uuids.contains(&uuid))
            .cloned()
            .collect()
    }

    /// Record a status transition. Returns false when the id is unknown.
    pub fn set_status(&self, id: Uuid, status: RequestStatus) -> bool {
        let mut entries = self.entries.lock().expect("request log lock");
        match entries.iter_mut().find(|r| r.id == id) {
            Some(request) => {
                request.status = status;
                true
            }
            None => false,
        }
    }
}
