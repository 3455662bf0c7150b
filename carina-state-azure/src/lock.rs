//! Lock information for state backend locking
//!
//! The lock record lives in the metadata of the state blob itself, next to the
//! lease that actually enforces exclusion.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::{BackendError, BackendResult};

/// Metadata name holding the serialized lock record
pub const LOCK_METADATA_KEY: &str = "carinalockinfo";

/// Blob metadata, name to value
pub type Metadata = BTreeMap<String, String>;

/// Information about a state lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique identifier for this lock
    pub id: String,
    /// The operation being performed (e.g., "apply", "destroy", "plan")
    pub operation: String,
    /// Who acquired the lock (username@hostname)
    pub who: String,
    /// When the lock was created
    pub created: DateTime<Utc>,
    /// Version of the backend that took the lock
    #[serde(default)]
    pub version: String,
    /// State key the lock was taken on, filled in when acquired
    #[serde(default)]
    pub path: String,
}

impl LockInfo {
    /// Create a new lock for an operation with a random ID
    pub fn new(operation: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), operation)
    }

    /// Create a new lock with a caller-chosen ID
    pub fn with_id(id: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            operation: operation.into(),
            who: get_lock_owner(),
            created: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            path: String::new(),
        }
    }

    /// Lease ID used on the storage service for this lock
    pub fn lease_id(&self) -> String {
        lease_id_for(&self.id)
    }

    /// Read the lock record stored in blob metadata, if any
    pub fn from_metadata(metadata: &Metadata) -> BackendResult<Option<Self>> {
        let Some(raw) = metadata.get(LOCK_METADATA_KEY) else {
            return Ok(None);
        };
        if raw.is_empty() {
            return Ok(None);
        }
        serde_json::from_str(raw)
            .map(Some)
            .map_err(|e| BackendError::Serialization(format!("Failed to parse lock info: {}", e)))
    }

    /// Store this lock record into blob metadata
    pub fn write_metadata(&self, metadata: &mut Metadata) -> BackendResult<()> {
        let json = serde_json::to_string(self)
            .map_err(|e| BackendError::Serialization(format!("Failed to serialize lock: {}", e)))?;
        metadata.insert(LOCK_METADATA_KEY.to_string(), escape_non_ascii(&json));
        Ok(())
    }

    /// Remove any lock record from blob metadata
    pub fn clear_metadata(metadata: &mut Metadata) -> bool {
        metadata.remove(LOCK_METADATA_KEY).is_some()
    }
}

/// Map a lock ID onto a lease ID
///
/// The storage service only accepts GUID lease IDs. UUID lock IDs are used
/// verbatim, anything else is mapped through a name-based UUID so the same
/// lock ID always yields the same lease.
pub fn lease_id_for(lock_id: &str) -> String {
    match Uuid::parse_str(lock_id) {
        Ok(id) => id.hyphenated().to_string(),
        Err(_) => Uuid::new_v5(&Uuid::NAMESPACE_OID, lock_id.as_bytes())
            .hyphenated()
            .to_string(),
    }
}

/// Metadata values travel as HTTP headers, so they must be ASCII.
/// JSON allows any character inside a string to be written as `\uXXXX`.
fn escape_non_ascii(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                let _ = write!(out, "\\u{:04x}", unit);
            }
        }
    }
    out
}

/// Get the lock owner string (username@hostname)
fn get_lock_owner() -> String {
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{}@{}", username, hostname)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_info_new() {
        let lock = LockInfo::new("apply");
        assert_eq!(lock.operation, "apply");
        assert!(!lock.id.is_empty());
        assert!(!lock.who.is_empty());
        assert_eq!(lock.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_lock_owner_format() {
        let who = get_lock_owner();
        assert!(who.contains('@'));
    }

    #[test]
    fn test_lease_id_for_uuid_is_verbatim() {
        let id = Uuid::new_v4().to_string();
        assert_eq!(lease_id_for(&id), id);
    }

    #[test]
    fn test_lease_id_for_arbitrary_token() {
        let a = lease_id_for("L1");
        assert!(Uuid::parse_str(&a).is_ok());
        assert_eq!(a, lease_id_for("L1"));
        assert_ne!(a, lease_id_for("L2"));
    }

    #[test]
    fn test_metadata_round_trip() {
        let mut lock = LockInfo::with_id("L1", "apply");
        lock.path = "env:/prod/terraform.tfstate".to_string();

        let mut metadata = Metadata::new();
        metadata.insert("owner".to_string(), "platform".to_string());
        lock.write_metadata(&mut metadata).unwrap();

        let read = LockInfo::from_metadata(&metadata).unwrap().unwrap();
        assert_eq!(read, lock);
        assert_eq!(metadata.get("owner").map(String::as_str), Some("platform"));

        assert!(LockInfo::clear_metadata(&mut metadata));
        assert!(LockInfo::from_metadata(&metadata).unwrap().is_none());
        assert!(!LockInfo::clear_metadata(&mut metadata));
    }

    #[test]
    fn test_metadata_is_readable_ascii() {
        let mut lock = LockInfo::with_id("L1", "déploiement ✓");
        lock.who = "jöhn@host".to_string();

        let mut metadata = Metadata::new();
        lock.write_metadata(&mut metadata).unwrap();

        let raw = &metadata[LOCK_METADATA_KEY];
        assert!(raw.is_ascii());
        assert!(raw.contains("\"id\":\"L1\""));

        let read = LockInfo::from_metadata(&metadata).unwrap().unwrap();
        assert_eq!(read.operation, "déploiement ✓");
        assert_eq!(read.who, "jöhn@host");
    }

    #[test]
    fn test_metadata_garbage_is_serialization_error() {
        let mut metadata = Metadata::new();
        metadata.insert(LOCK_METADATA_KEY.to_string(), "{not json".to_string());
        assert!(matches!(
            LockInfo::from_metadata(&metadata),
            Err(BackendError::Serialization(_))
        ));
    }
}
