//! Blob storage capability used by the state store and the lock manager
//!
//! [`BlobClient`] is the narrow set of conditional blob and lease operations the
//! backend needs. [`AzureBlobClient`] speaks the Azure Blob REST protocol,
//! [`MemoryBlobClient`] keeps everything in process with the same lease and
//! precondition rules.

mod memory;
mod rest;

pub use memory::MemoryBlobClient;
pub use rest::AzureBlobClient;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::backend::BackendError;
use crate::lock::Metadata;

/// Service error codes the backend reacts to
pub mod codes {
    pub const BLOB_NOT_FOUND: &str = "BlobNotFound";
    pub const CONTAINER_NOT_FOUND: &str = "ContainerNotFound";
    pub const BLOB_ALREADY_EXISTS: &str = "BlobAlreadyExists";
    pub const CONDITION_NOT_MET: &str = "ConditionNotMet";
    pub const LEASE_ALREADY_PRESENT: &str = "LeaseAlreadyPresent";
    pub const LEASE_IS_BREAKING: &str = "LeaseIsBreakingAndCannotBeAcquired";
    pub const LEASE_IS_BROKEN: &str = "LeaseIsBrokenAndCannotBeRenewed";
    pub const LEASE_ID_MISMATCH_WITH_LEASE_OPERATION: &str = "LeaseIdMismatchWithLeaseOperation";
    pub const LEASE_NOT_PRESENT_WITH_LEASE_OPERATION: &str = "LeaseNotPresentWithLeaseOperation";
    pub const LEASE_ID_MISSING: &str = "LeaseIdMissing";
    pub const LEASE_ID_MISMATCH_WITH_BLOB_OPERATION: &str = "LeaseIdMismatchWithBlobOperation";
    pub const LEASE_NOT_PRESENT_WITH_BLOB_OPERATION: &str = "LeaseNotPresentWithBlobOperation";
    pub const AUTHENTICATION_FAILED: &str = "AuthenticationFailed";
}

/// Error returned by the storage service (or the transport in front of it)
#[derive(Debug, Clone, Error)]
#[error("HTTP {status} {}: {message}", .code.as_deref().unwrap_or("(no error code)"))]
pub struct BlobError {
    /// HTTP status, `0` when the request never got a response
    pub status: u16,
    /// Service error code (`x-ms-error-code`)
    pub code: Option<String>,
    pub message: String,
}

impl BlobError {
    pub fn new(status: u16, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: Some(code.to_string()),
            message: message.into(),
        }
    }

    /// Failure below the HTTP layer (connection, TLS, body decoding)
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: 0,
            code: None,
            message: message.into(),
        }
    }

    pub fn has_code(&self, code: &str) -> bool {
        self.code.as_deref() == Some(code)
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }

    /// The blob already carries a lease held by someone else
    pub fn is_lease_already_present(&self) -> bool {
        self.has_code(codes::LEASE_ALREADY_PRESENT) || self.has_code(codes::LEASE_IS_BREAKING)
    }

    /// A lease operation named a lease ID other than the active one
    pub fn is_lease_mismatch(&self) -> bool {
        self.has_code(codes::LEASE_ID_MISMATCH_WITH_LEASE_OPERATION)
            || self.has_code(codes::LEASE_ID_MISMATCH_WITH_BLOB_OPERATION)
    }

    /// A write was refused because the blob is leased and no (or the wrong) lease ID was sent
    pub fn is_write_blocked_by_lease(&self) -> bool {
        self.has_code(codes::LEASE_ID_MISSING)
            || self.has_code(codes::LEASE_ID_MISMATCH_WITH_BLOB_OPERATION)
    }

    /// There is no active lease to operate on
    pub fn is_lease_not_present(&self) -> bool {
        self.has_code(codes::LEASE_NOT_PRESENT_WITH_LEASE_OPERATION)
            || self.has_code(codes::LEASE_NOT_PRESENT_WITH_BLOB_OPERATION)
            || self.has_code(codes::LEASE_IS_BROKEN)
    }

    /// An `If-Match`/`If-None-Match` precondition failed
    pub fn is_precondition_failed(&self) -> bool {
        self.has_code(codes::CONDITION_NOT_MET) || self.has_code(codes::BLOB_ALREADY_EXISTS)
    }

    pub fn is_auth_failure(&self) -> bool {
        self.status == 401 || self.status == 403
    }

    /// Convert into a backend error for the given key
    pub fn into_backend(self, key: &str) -> BackendError {
        if self.is_auth_failure() {
            return BackendError::authentication(format!("{} (on {})", self, key));
        }
        BackendError::Storage {
            key: key.to_string(),
            status: self.status,
            code: self.code,
            message: self.message,
        }
    }
}

/// Result type for blob operations
pub type BlobResult<T> = Result<T, BlobError>;

/// Lease state of a blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeaseState {
    #[default]
    Available,
    Leased,
    Expired,
    Breaking,
    Broken,
}

impl LeaseState {
    pub fn parse(value: &str) -> Self {
        match value {
            "leased" => Self::Leased,
            "expired" => Self::Expired,
            "breaking" => Self::Breaking,
            "broken" => Self::Broken,
            _ => Self::Available,
        }
    }

    /// Whether someone currently holds the lease
    pub fn is_held(&self) -> bool {
        matches!(self, Self::Leased | Self::Breaking)
    }
}

/// How long an acquired lease lasts without renewal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseDuration {
    Infinite,
    Fixed(Duration),
}

impl LeaseDuration {
    /// Value of the `x-ms-lease-duration` header
    pub fn header_value(&self) -> String {
        match self {
            Self::Infinite => "-1".to_string(),
            Self::Fixed(duration) => duration.as_secs().to_string(),
        }
    }

    /// How often a holder renews the lease, `None` for infinite leases
    pub fn renew_interval(&self) -> Option<Duration> {
        match self {
            Self::Infinite => None,
            Self::Fixed(duration) => Some(*duration / 3),
        }
    }
}

impl Default for LeaseDuration {
    fn default() -> Self {
        Self::Fixed(Duration::from_secs(60))
    }
}

/// Lease operation on a blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAction {
    Acquire {
        proposed_id: String,
        duration: LeaseDuration,
    },
    Renew {
        lease_id: String,
    },
    Release {
        lease_id: String,
    },
    Break {
        period: Duration,
    },
}

impl LeaseAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Acquire { .. } => "acquire",
            Self::Renew { .. } => "renew",
            Self::Release { .. } => "release",
            Self::Break { .. } => "break",
        }
    }
}

/// Precondition attached to a write
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WriteCondition {
    #[default]
    None,
    /// Only write if the current ETag matches
    IfMatch(String),
    /// Only write if the blob does not exist
    IfNotExists,
}

/// System and user properties of a blob
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlobProperties {
    pub etag: String,
    pub content_length: u64,
    pub content_md5: Option<Vec<u8>>,
    pub lease_state: LeaseState,
    pub metadata: Metadata,
}

/// Content and properties of a blob
#[derive(Debug, Clone)]
pub struct Blob {
    pub data: Bytes,
    pub properties: BlobProperties,
}

/// Request to upload a whole block blob
#[derive(Debug, Clone)]
pub struct PutBlob {
    pub data: Bytes,
    pub content_md5: [u8; 16],
    pub content_type: &'static str,
    /// Replaces all existing metadata
    pub metadata: Metadata,
    pub condition: WriteCondition,
    pub lease_id: Option<String>,
}

/// Conditional blob and lease operations within one container
#[async_trait]
pub trait BlobClient: Send + Sync {
    /// Download a blob with its properties
    async fn get_blob(&self, key: &str) -> BlobResult<Blob>;

    /// Read properties and metadata without the content
    async fn get_properties(&self, key: &str) -> BlobResult<BlobProperties>;

    /// Upload a blob, returning its new ETag
    async fn put_blob(&self, key: &str, request: PutBlob) -> BlobResult<String>;

    /// Replace the metadata of a blob
    async fn set_metadata(
        &self,
        key: &str,
        metadata: &Metadata,
        lease_id: Option<&str>,
    ) -> BlobResult<()>;

    /// Delete a blob
    async fn delete_blob(&self, key: &str, lease_id: Option<&str>) -> BlobResult<()>;

    /// Perform a lease operation
    async fn lease(&self, key: &str, action: LeaseAction) -> BlobResult<()>;

    /// Names of the blobs starting with `prefix`
    async fn list_blobs(&self, prefix: &str) -> BlobResult<Vec<String>>;
}
