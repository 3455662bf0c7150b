//! State backend trait and error types

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::lock::LockInfo;
use crate::state::{Fingerprint, StateContent};

/// Errors that can occur when interacting with a state backend
#[derive(Debug, Error)]
pub enum BackendError {
    /// Ambiguous or incomplete configuration (credential scheme, settings)
    #[error("Backend configuration error: {0}")]
    Configuration(String),

    /// The identity provider or the storage service rejected the credential
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The workspace name cannot be mapped to a state key
    #[error("Invalid workspace name {name:?}: {reason}")]
    InvalidWorkspace { name: String, reason: String },

    /// The backend type is not supported
    #[error("Unsupported backend type: {0}")]
    UnsupportedBackend(String),

    /// The state is locked by another process
    #[error("{}", locked_message(.key, .holder.as_ref()))]
    Locked {
        key: String,
        holder: Option<LockInfo>,
    },

    /// No lock is held on the state object (for unlock/force-unlock operations)
    #[error("Lock not found on {key} (lock ID: {lock_id})")]
    LockNotFound { key: String, lock_id: String },

    /// Lock ID mismatch when trying to release
    #[error("Lock ID mismatch on {key}: expected {expected}, got {actual}")]
    LockMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    /// The state changed since the caller last read it
    #[error(
        "State {key} was modified concurrently: expected fingerprint {}, found {}",
        display_fingerprint(.expected.as_ref()),
        display_fingerprint(.actual.as_ref())
    )]
    Conflict {
        key: String,
        expected: Option<Fingerprint>,
        actual: Option<Fingerprint>,
    },

    /// A storage request did not complete before its deadline
    #[error("Timed out after {after:?} during {operation} on {key}")]
    Timeout {
        operation: &'static str,
        key: String,
        after: Duration,
    },

    /// Transport or service failure
    #[error("Storage error on {key} (HTTP {status}, {}): {message}", .code.as_deref().unwrap_or("no error code"))]
    Storage {
        key: String,
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// State content is corrupted or invalid
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BackendError {
    /// Create a Locked error naming the current holder, if known
    pub fn locked(key: impl Into<String>, holder: Option<LockInfo>) -> Self {
        Self::Locked {
            key: key.into(),
            holder,
        }
    }

    /// Create an unsupported backend error
    pub fn unsupported_backend(backend_type: impl Into<String>) -> Self {
        Self::UnsupportedBackend(backend_type.into())
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create an authentication error
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication(message.into())
    }

    /// Create an invalid workspace error
    pub fn invalid_workspace(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidWorkspace {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error is expected under contention (lock held or stale read)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Locked { .. } | Self::Conflict { .. })
    }

    /// Whether the caller may retry the same request with backoff
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Storage { status, .. } => *status == 0 || *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

fn locked_message(key: &str, holder: Option<&LockInfo>) -> String {
    match holder {
        Some(lock) => format!(
            "State {} is locked by {} since {} (lock ID: {}, operation: {})",
            key, lock.who, lock.created, lock.id, lock.operation
        ),
        None => format!(
            "State {} is leased by another process that has not recorded its lock info yet",
            key
        ),
    }
}

fn display_fingerprint(fingerprint: Option<&Fingerprint>) -> String {
    fingerprint
        .map(|f| f.to_string())
        .unwrap_or_else(|| "<none>".to_string())
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Trait for state storage backends
///
/// Every operation is scoped to a workspace. The default workspace is named
/// [`DEFAULT_WORKSPACE`](crate::key::DEFAULT_WORKSPACE).
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Read the current state of a workspace
    ///
    /// Returns `None` if no state exists (first-time use)
    async fn read_state(&self, workspace: &str) -> BackendResult<Option<StateContent>>;

    /// Write the state of a workspace
    ///
    /// `expected` is the fingerprint returned by the last `read_state`. When it
    /// no longer matches the stored content the write fails with
    /// [`BackendError::Conflict`] and nothing is written.
    async fn write_state(
        &self,
        workspace: &str,
        data: Bytes,
        expected: Option<&Fingerprint>,
    ) -> BackendResult<Fingerprint>;

    /// Acquire the lock of a workspace, returning the lock ID
    ///
    /// Fails with [`BackendError::Locked`] if another holder owns the lock
    async fn lock(&self, workspace: &str, info: &LockInfo) -> BackendResult<String>;

    /// Release a lock previously acquired with `lock_id`
    async fn unlock(&self, workspace: &str, lock_id: &str) -> BackendResult<()>;

    /// Force release the lock of a workspace regardless of its holder
    ///
    /// This is an administrative operation that should be used with caution
    async fn force_unlock(&self, workspace: &str, lock_id: &str) -> BackendResult<()>;

    /// List all workspaces, `default` first
    async fn workspaces(&self) -> BackendResult<Vec<String>>;

    /// Delete the state of a non-default workspace
    async fn delete_workspace(&self, workspace: &str) -> BackendResult<()>;
}
