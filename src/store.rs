//! File-backed secret store.
//!
//! A single JSON document at `~/.2kc/secrets.json` maps opaque v4 uuids and
//! human ref slugs to values and tags. Every mutation is a full
//! read-modify-write of the document with the file mode forced back to
//! `0600`; a parse failure surfaces as [`StoreError::Corrupted`] rather than
//! being papered over with an empty store.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

/// Accepted ref grammar: lowercase alphanumeric with interior dashes.
static REF_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$").expect("valid ref pattern"));

#[cfg(unix)]
const STORE_FILE_MODE: u32 = 0o600;

/// A stored secret. `value` never leaves the store through listing or
/// metadata operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretEntry {
    pub uuid: Uuid,
    #[serde(rename = "ref")]
    pub slug: String,
    pub value: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The value-free shape exposed by every listing and metadata operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretListing {
    pub uuid: Uuid,
    #[serde(rename = "ref")]
    pub slug: String,
    pub tags: Vec<String>,
}

impl From<&SecretEntry> for SecretListing {
    fn from(entry: &SecretEntry) -> Self {
        Self {
            uuid: entry.uuid,
            slug: entry.slug.clone(),
            tags: entry.tags.clone(),
        }
    }
}

/// A resolved ref-or-uuid carrying the raw value. Used only by the injector
/// for placeholder substitution.
#[derive(Debug, Clone)]
pub struct ResolvedSecret {
    pub uuid: Uuid,
    pub value: String,
}

/// On-disk document shape.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDocument {
    secrets: Vec<SecretEntry>,
}

/// Returns true when the input parses as an RFC 4122 v4 uuid.
pub fn is_uuid_v4(input: &str) -> bool {
    Uuid::parse_str(input).is_ok_and(|u| u.get_version_num() == 4)
}

/// File-backed secret store. Operations are synchronous and serialized by
/// read-modify-write over the backing file.
pub struct SecretStore {
    path: PathBuf,
}

impl SecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Validate a ref slug. Rejects uuid-v4 literals so the ref and uuid
    /// namespaces cannot collide in `resolve`.
    fn validate_slug(slug: &str) -> Result<(), StoreError> {
        if !REF_PATTERN.is_match(slug) {
            return Err(StoreError::InvalidRef {
                reference: slug.to_string(),
                reason: "must be lowercase alphanumeric with interior dashes".to_string(),
            });
        }
        if is_uuid_v4(slug) {
            return Err(StoreError::InvalidRef {
                reference: slug.to_string(),
                reason: "must not be a uuid".to_string(),
            });
        }
        Ok(())
    }

    /// Add a secret. Returns the generated uuid.
    pub fn add(
        &self,
        slug: &str,
        value: &str,
        tags: Vec<String>,
    ) -> Result<Uuid, StoreError> {
        Self::validate_slug(slug)?;

        let mut doc = self.load()?;
        if doc.secrets.iter().any(|s| s.slug == slug) {
            return Err(StoreError::DuplicateRef {
                reference: slug.to_string(),
            });
        }

        let now = Utc::now();
        let uuid = Uuid::new_v4();
        doc.secrets.push(SecretEntry {
            uuid,
            slug: slug.to_string(),
            value: value.to_string(),
            tags,
            created_at: now,
            updated_at: now,
        });
        self.save(&doc)?;

        tracing::debug!(%uuid, slug, "secret added");
        Ok(uuid)
    }

    pub fn remove(&self, uuid: Uuid) -> Result<(), StoreError> {
        let mut doc = self.load()?;
        let before = doc.secrets.len();
        doc.secrets.retain(|s| s.uuid != uuid);
        if doc.secrets.len() == before {
            return Err(StoreError::NotFound {
                lookup: format!("uuid {uuid}"),
            });
        }
        self.save(&doc)?;

        tracing::debug!(%uuid, "secret removed");
        Ok(())
    }

    /// All secrets as listing items, insertion order.
    pub fn list(&self) -> Result<Vec<SecretListing>, StoreError> {
        Ok(self.load()?.secrets.iter().map(SecretListing::from).collect())
    }

    pub fn get_metadata(&self, uuid: Uuid) -> Result<SecretListing, StoreError> {
        let doc = self.load()?;
        doc.secrets
            .iter()
            .find(|s| s.uuid == uuid)
            .map(SecretListing::from)
            .ok_or(StoreError::NotFound {
                lookup: format!("uuid {uuid}"),
            })
    }

    pub fn get_by_ref(&self, slug: &str) -> Result<SecretListing, StoreError> {
        let doc = self.load()?;
        doc.secrets
            .iter()
            .find(|s| s.slug == slug)
            .map(SecretListing::from)
            .ok_or_else(|| StoreError::NotFound {
                lookup: format!("ref '{slug}'"),
            })
    }

    pub fn get_value(&self, uuid: Uuid) -> Result<String, StoreError> {
        let doc = self.load()?;
        doc.secrets
            .iter()
            .find(|s| s.uuid == uuid)
            .map(|s| s.value.clone())
            .ok_or(StoreError::NotFound {
                lookup: format!("uuid {uuid}"),
            })
    }

    pub fn get_value_by_ref(&self, slug: &str) -> Result<String, StoreError> {
        let doc = self.load()?;
        doc.secrets
            .iter()
            .find(|s| s.slug == slug)
            .map(|s| s.value.clone())
            .ok_or_else(|| StoreError::NotFound {
                lookup: format!("ref '{slug}'"),
            })
    }

    /// Resolve a ref-or-uuid to a listing item. Uuid-shaped input dispatches
    /// to the uuid path, everything else to the ref path; the not-found
    /// message records which path was taken.
    pub fn resolve(&self, ref_or_uuid: &str) -> Result<SecretListing, StoreError> {
        match Uuid::parse_str(ref_or_uuid) {
            Ok(uuid) if uuid.get_version_num() == 4 => self.get_metadata(uuid),
            _ => self.get_by_ref(ref_or_uuid),
        }
    }

    /// Same dispatch as [`resolve`](Self::resolve) but returns the value.
    pub fn resolve_ref(&self, ref_or_uuid: &str) -> Result<ResolvedSecret, StoreError> {
        let doc = self.load()?;
        let entry = match Uuid::parse_str(ref_or_uuid) {
            Ok(uuid) if uuid.get_version_num() == 4 => doc
                .secrets
                .iter()
                .find(|s| s.uuid == uuid)
                .ok_or(StoreError::NotFound {
                    lookup: format!("uuid {uuid}"),
                })?,
            _ => doc
                .secrets
                .iter()
                .find(|s| s.slug == ref_or_uuid)
                .ok_or_else(|| StoreError::NotFound {
                    lookup: format!("ref '{ref_or_uuid}'"),
                })?,
        };
        Ok(ResolvedSecret {
            uuid: entry.uuid,
            value: entry.value.clone(),
        })
    }

    fn load(&self) -> Result<StoreDocument, StoreError> {
        if !self.path.exists() {
            return Ok(StoreDocument::default());
        }
        let raw = fs::read_to_string(&self.path)?;
        serde_json::from_str(&raw).map_err(|e| StoreError::Corrupted {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })
    }

    fn save(&self, doc: &StoreDocument) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(doc).map_err(|e| StoreError::Corrupted {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })?;
        fs::write(&self.path, raw)?;
        self.restrict_mode()?;
        Ok(())
    }

    #[cfg(unix)]
    fn restrict_mode(&self) -> Result<(), StoreError> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&self.path, fs::Permissions::from_mode(STORE_FILE_MODE))?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn restrict_mode(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
