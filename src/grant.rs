//! Time-bound, single-use access grants.
//!
//! A grant moves `fresh -> (used | revoked)` through operations; expiry is
//! implicit in wall-clock time passing `expires_at`. The manager is the sole
//! owner of grant state; every read hands out a copy. A single coarse mutex
//! is enough: there are no cross-grant invariants and every critical section
//! is a map access plus one field write.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::GrantError;
use crate::request::{AccessRequest, RequestStatus};

/// A single-use capability to inject a fixed set of secrets into one child
/// process before `expires_at`.
#[derive(Debug, Clone)]
pub struct Grant {
    pub id: Uuid,
    pub request_id: Uuid,
    /// Copied from the request by value; grants never alias request state.
    pub secret_uuids: Vec<Uuid>,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Grant {
    /// Valid iff unexpired, unused, and unrevoked at `now`.
    fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now <= self.expires_at && !self.used && self.revoked_at.is_none()
    }
}

/// Owner of all grants. In-memory only; expired grants are reaped by
/// [`cleanup`](GrantManager::cleanup).
#[derive(Default)]
pub struct GrantManager {
    grants: Mutex<HashMap<Uuid, Grant>>,
}

impl GrantManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a grant for an approved request. The window starts now and
    /// lasts the request's duration.
    pub fn create_grant(&self, request: &AccessRequest) -> Result<Grant, GrantError> {
        if request.status != RequestStatus::Approved {
            return Err(GrantError::NotApproved { id: request.id });
        }

        let now = Utc::now();
        let grant = Grant {
            id: Uuid::new_v4(),
            request_id: request.id,
            secret_uuids: request.secret_uuids.clone(),
            granted_at: now,
            expires_at: now + Duration::seconds(request.duration_seconds as i64),
            used: false,
            revoked_at: None,
        };

        tracing::debug!(grant = %grant.id, request = %request.id, "grant created");
        self.grants
            .lock()
            .expect("grant map lock")
            .insert(grant.id, grant.clone());
        Ok(grant)
    }

    /// True iff the grant exists and is currently valid.
    pub fn validate_grant(&self, id: Uuid) -> bool {
        let now = Utc::now();
        self.grants
            .lock()
            .expect("grant map lock")
            .get(&id)
            .is_some_and(|g| g.is_valid_at(now))
    }

    /// Consume the grant. Fails if it is missing or no longer valid; `used`
    /// only ever transitions false -> true.
    pub fn mark_used(&self, id: Uuid) -> Result<(), GrantError> {
        let now = Utc::now();
        let mut grants = self.grants.lock().expect("grant map lock");
        let grant = grants.get_mut(&id).ok_or(GrantError::NotFound { id })?;
        if !grant.is_valid_at(now) {
            return Err(GrantError::NotValid { id });
        }
        grant.used = true;
        tracing::debug!(grant = %id, "grant used");
        Ok(())
    }

    /// Revoke the grant. `revoked_at` only ever transitions None -> Some.
    pub fn revoke_grant(&self, id: Uuid) -> Result<(), GrantError> {
        let mut grants = self.grants.lock().expect("grant map lock");
        let grant = grants.get_mut(&id).ok_or(GrantError::NotFound { id })?;
        if grant.revoked_at.is_some() {
            return Err(GrantError::AlreadyRevoked { id });
        }
        grant.revoked_at = Some(Utc::now());
        tracing::debug!(grant = %id, "grant revoked");
        Ok(())
    }

    /// Drop every grant past its expiry. Safe on an empty map.
    pub fn cleanup(&self) {
        let now = Utc::now();
        self.grants
            .lock()
            .expect("grant map lock")
            .retain(|_, g| now <= g.expires_at);
    }

    /// Copy of a grant, if present. Mutating the copy has no effect on the
    /// manager's state.
    pub fn get_grant(&self, id: Uuid) -> Option<Grant> {
        self.grants.lock().expect("grant map lock").get(&id).cloned()
    }

    /// Copy of a grant's secret set, if present.
    pub fn get_grant_secrets(&self, id: Uuid) -> Option<Vec<Uuid>> {
        self.grants
            .lock()
            .expect("grant map lock")
            .get(&id)
            .map(|g| g.secret_uuids.clone())
    }

    #[cfg(test)]
    pub(crate) fn insert_for_test(&self, grant: Grant) {
        self.grants
            .lock()
            .expect("grant map lock")
            .insert(grant.id, grant);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approved_request(duration: u64) -> AccessRequest {
        let mut req =
            AccessRequest::new(vec![Uuid::new_v4()], "reason", "task", Some(duration)).unwrap();
        req.status = RequestStatus::Approved;
        req
    }

    fn expired_grant() -> Grant {
        let past = Utc::now() - Duration::seconds(120);
        Grant {
            id: Uuid::new_v4(),
            request_id: Uuid::new_v4(),
            secret_uuids: vec![Uuid::new_v4()],
            granted_at: past,
            expires_at: past + Duration::seconds(30),
            used: false,
            revoked_at: None,
        }
    }

    #[test]
    fn requires_approved_request() {
        let manager = GrantManager::new();
        let pending = AccessRequest::new(vec![Uuid::new_v4()], "r", "t", None).unwrap();
        assert!(matches!(
            manager.create_grant(&pending),
            Err(GrantError::NotApproved { .. })
        ));
    }

    #[test]
    fn fresh_grant_is_valid_and_window_matches_duration() {
        let manager = GrantManager::new();
        let req = approved_request(60);
        let grant = manager.create_grant(&req).unwrap();

        assert!(!grant.used);
        assert!(grant.revoked_at.is_none());
        assert_eq!(grant.expires_at - grant.granted_at, Duration::seconds(60));
        assert!(manager.validate_grant(grant.id));
    }

    #[test]
    fn mark_used_is_exclusive() {
        let manager = GrantManager::new();
        let grant = manager.create_grant(&approved_request(60)).unwrap();

        manager.mark_used(grant.id).unwrap();
        assert!(!manager.validate_grant(grant.id));
        assert!(matches!(
            manager.mark_used(grant.id),
            Err(GrantError::NotValid { .. })
        ));
    }

    #[test]
    fn revoke_invalidates_and_double_revoke_fails() {
        let manager = GrantManager::new();
        let grant = manager.create_grant(&approved_request(60)).unwrap();

        manager.revoke_grant(grant.id).unwrap();
        assert!(!manager.validate_grant(grant.id));
        assert!(matches!(
            manager.revoke_grant(grant.id),
            Err(GrantError::AlreadyRevoked { .. })
        ));
        // A revoked grant cannot be consumed.
        assert!(matches!(
            manager.mark_used(grant.id),
            Err(GrantError::NotValid { .. })
        ));
    }

    #[test]
    fn expired_grant_is_invalid_but_present_until_cleanup() {
        let manager = GrantManager::new();
        let grant = expired_grant();
        let id = grant.id;
        manager.insert_for_test(grant);

        assert!(!manager.validate_grant(id));
        assert!(matches!(
            manager.mark_used(id),
            Err(GrantError::NotValid { .. })
        ));
        assert!(manager.get_grant(id).is_some());

        manager.cleanup();
        assert!(manager.get_grant(id).is_none());
    }

    #[test]
    fn cleanup_on_empty_map_is_safe() {
        GrantManager::new().cleanup();
    }

    #[test]
    fn reads_hand_out_copies() {
        let manager = GrantManager::new();
        let grant = manager.create_grant(&approved_request(60)).unwrap();

        let mut copy = manager.get_grant(grant.id).unwrap();
        copy.used = true;
        assert!(manager.validate_grant(grant.id), "copy mutation leaked");

        let mut secrets = manager.get_grant_secrets(grant.id).unwrap();
        secrets.clear();
        assert_eq!(
            manager.get_grant_secrets(grant.id).unwrap().len(),
            1,
            "secrets copy mutation leaked"
        );
    }

    #[test]
    fn missing_grant_operations_fail_not_found() {
        let manager = GrantManager::new();
        let ghost = Uuid::new_v4();
        assert!(!manager.validate_grant(ghost));
        assert!(matches!(
            manager.mark_used(ghost),
            Err(GrantError::NotFound { .. })
        ));
        assert!(matches!(
            manager.revoke_grant(ghost),
            Err(GrantError::NotFound { .. })
        ));
        assert!(manager.get_grant(ghost).is_none());
    }
}
