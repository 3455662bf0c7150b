//! In-process blob client for development and tests

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;

use super::{
    Blob, BlobClient, BlobError, BlobProperties, BlobResult, LeaseAction, LeaseDuration,
    LeaseState, PutBlob, WriteCondition, codes,
};
use crate::lock::Metadata;

#[derive(Debug, Clone, Default)]
enum Lease {
    #[default]
    None,
    Active {
        id: String,
        duration: Option<Duration>,
        expires: Option<Instant>,
    },
    Broken,
}

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Bytes,
    content_md5: Option<Vec<u8>>,
    etag: String,
    metadata: Metadata,
    lease: Lease,
}

impl StoredBlob {
    fn lease_state(&self) -> LeaseState {
        match &self.lease {
            Lease::None => LeaseState::Available,
            Lease::Broken => LeaseState::Broken,
            Lease::Active { expires, .. } => match expires {
                Some(at) if *at <= Instant::now() => LeaseState::Expired,
                _ => LeaseState::Leased,
            },
        }
    }

    /// ID of the lease, if it is still within its duration
    fn active_lease(&self) -> Option<&str> {
        match (&self.lease, self.lease_state()) {
            (Lease::Active { id, .. }, LeaseState::Leased) => Some(id.as_str()),
            _ => None,
        }
    }

    fn properties(&self) -> BlobProperties {
        BlobProperties {
            etag: self.etag.clone(),
            content_length: self.data.len() as u64,
            content_md5: self.content_md5.clone(),
            lease_state: self.lease_state(),
            metadata: self.metadata.clone(),
        }
    }

    /// Writes to a leased blob must present the active lease ID
    fn check_write(&self, lease_id: Option<&str>) -> BlobResult<()> {
        match (self.active_lease(), lease_id) {
            (Some(_), None) => Err(BlobError::new(
                412,
                codes::LEASE_ID_MISSING,
                "There is currently a lease on the blob and no lease ID was specified in the request.",
            )),
            (Some(active), Some(given)) if active != given => Err(BlobError::new(
                412,
                codes::LEASE_ID_MISMATCH_WITH_BLOB_OPERATION,
                "The lease ID specified did not match the lease ID for the blob.",
            )),
            (None, Some(given)) => match &self.lease {
                Lease::Active { id, .. } if id == given => Ok(()),
                _ => Err(BlobError::new(
                    412,
                    codes::LEASE_NOT_PRESENT_WITH_BLOB_OPERATION,
                    "There is currently no lease on the blob.",
                )),
            },
            _ => Ok(()),
        }
    }
}

/// Blob client that keeps blobs in memory
///
/// Lease expiry, lease ID checks and ETag preconditions follow the rules of the
/// Azure Blob service, so code exercised against it behaves the same against
/// a real account. Fixed lease durations are not range-checked, which lets
/// tests use sub-second leases.
#[derive(Debug, Default)]
pub struct MemoryBlobClient {
    blobs: Mutex<BTreeMap<String, StoredBlob>>,
    next_etag: AtomicU64,
    failing_writes: Mutex<HashSet<String>>,
    latency: Mutex<Option<Duration>>,
}

impl MemoryBlobClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write to `key` fail with a server error
    pub fn fail_writes_to(&self, key: impl Into<String>) {
        lock(&self.failing_writes).insert(key.into());
    }

    /// Delay every operation, to exercise deadlines
    pub fn set_latency(&self, latency: Option<Duration>) {
        *lock(&self.latency) = latency;
    }

    /// Replace the content of a blob without touching its recorded MD5
    pub fn replace_content(&self, key: &str, data: impl Into<Bytes>) -> bool {
        match lock(&self.blobs).get_mut(key) {
            Some(blob) => {
                blob.data = data.into();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.blobs).contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.blobs).keys().cloned().collect()
    }

    fn etag(&self) -> String {
        format!("\"0x{:X}\"", self.next_etag.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn simulate_latency(&self) {
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_failure(&self, key: &str) -> BlobResult<()> {
        if lock(&self.failing_writes).contains(key) {
            return Err(BlobError::new(500, "InternalError", "injected write failure"));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn not_found() -> BlobError {
    BlobError::new(404, codes::BLOB_NOT_FOUND, "The specified blob does not exist.")
}

#[async_trait]
impl BlobClient for MemoryBlobClient {
    async fn get_blob(&self, key: &str) -> BlobResult<Blob> {
        self.simulate_latency().await;
        let blobs = lock(&self.blobs);
        let blob = blobs.get(key).ok_or_else(not_found)?;
        Ok(Blob {
            data: blob.data.clone(),
            properties: blob.properties(),
        })
    }

    async fn get_properties(&self, key: &str) -> BlobResult<BlobProperties> {
        self.simulate_latency().await;
        let blobs = lock(&self.blobs);
        blobs.get(key).map(StoredBlob::properties).ok_or_else(not_found)
    }

    async fn put_blob(&self, key: &str, request: PutBlob) -> BlobResult<String> {
        self.simulate_latency().await;
        self.check_failure(key)?;
        let etag = self.etag();
        let mut blobs = lock(&self.blobs);

        let lease = match blobs.get(key) {
            Some(existing) => {
                match &request.condition {
                    WriteCondition::IfMatch(expected) if *expected != existing.etag => {
                        return Err(BlobError::new(
                            412,
                            codes::CONDITION_NOT_MET,
                            "The condition specified using HTTP conditional header(s) is not met.",
                        ));
                    }
                    WriteCondition::IfNotExists => {
                        return Err(BlobError::new(
                            409,
                            codes::BLOB_ALREADY_EXISTS,
                            "The specified blob already exists.",
                        ));
                    }
                    _ => {}
                }
                existing.check_write(request.lease_id.as_deref())?;
                existing.lease.clone()
            }
            None => {
                if matches!(request.condition, WriteCondition::IfMatch(_)) {
                    return Err(BlobError::new(
                        412,
                        codes::CONDITION_NOT_MET,
                        "The condition specified using HTTP conditional header(s) is not met.",
                    ));
                }
                if request.lease_id.is_some() {
                    return Err(BlobError::new(
                        412,
                        codes::LEASE_NOT_PRESENT_WITH_BLOB_OPERATION,
                        "There is currently no lease on the blob.",
                    ));
                }
                Lease::None
            }
        };

        blobs.insert(
            key.to_string(),
            StoredBlob {
                data: request.data,
                content_md5: Some(request.content_md5.to_vec()),
                etag: etag.clone(),
                metadata: request.metadata,
                lease,
            },
        );
        Ok(etag)
    }

    async fn set_metadata(
        &self,
        key: &str,
        metadata: &Metadata,
        lease_id: Option<&str>,
    ) -> BlobResult<()> {
        self.simulate_latency().await;
        self.check_failure(key)?;
        let etag = self.etag();
        let mut blobs = lock(&self.blobs);
        let blob = blobs.get_mut(key).ok_or_else(not_found)?;
        blob.check_write(lease_id)?;
        blob.metadata = metadata.clone();
        blob.etag = etag;
        Ok(())
    }

    async fn delete_blob(&self, key: &str, lease_id: Option<&str>) -> BlobResult<()> {
        self.simulate_latency().await;
        self.check_failure(key)?;
        let mut blobs = lock(&self.blobs);
        let blob = blobs.get(key).ok_or_else(not_found)?;
        blob.check_write(lease_id)?;
        blobs.remove(key);
        Ok(())
    }

    async fn lease(&self, key: &str, action: LeaseAction) -> BlobResult<()> {
        self.simulate_latency().await;
        let mut blobs = lock(&self.blobs);
        let blob = blobs.get_mut(key).ok_or_else(not_found)?;
        let state = blob.lease_state();
        let current_id = match &blob.lease {
            Lease::Active { id, .. } => Some(id.clone()),
            _ => None,
        };

        match action {
            LeaseAction::Acquire {
                proposed_id,
                duration,
            } => {
                if state == LeaseState::Leased && current_id.as_deref() != Some(&proposed_id) {
                    return Err(BlobError::new(
                        409,
                        codes::LEASE_ALREADY_PRESENT,
                        "There is already a lease present.",
                    ));
                }
                let duration = match duration {
                    LeaseDuration::Infinite => None,
                    LeaseDuration::Fixed(d) => Some(d),
                };
                blob.lease = Lease::Active {
                    id: proposed_id,
                    duration,
                    expires: duration.map(|d| Instant::now() + d),
                };
            }
            LeaseAction::Renew { lease_id } => match (&mut blob.lease, state) {
                (
                    Lease::Active {
                        id,
                        duration,
                        expires,
                    },
                    LeaseState::Leased | LeaseState::Expired,
                ) if *id == lease_id => {
                    // Renewal restarts the original duration
                    *expires = duration.map(|d| Instant::now() + d);
                }
                (Lease::Active { .. }, _) => {
                    return Err(BlobError::new(
                        409,
                        codes::LEASE_ID_MISMATCH_WITH_LEASE_OPERATION,
                        "The lease ID specified did not match the lease ID for the blob.",
                    ));
                }
                (Lease::Broken, _) => {
                    return Err(BlobError::new(
                        409,
                        codes::LEASE_IS_BROKEN,
                        "The lease ID matched, but the lease has been broken explicitly and cannot be renewed.",
                    ));
                }
                (Lease::None, _) => {
                    return Err(BlobError::new(
                        409,
                        codes::LEASE_NOT_PRESENT_WITH_LEASE_OPERATION,
                        "There is currently no lease on the blob.",
                    ));
                }
            },
            LeaseAction::Release { lease_id } => match current_id {
                Some(id) if id == lease_id => blob.lease = Lease::None,
                Some(_) => {
                    return Err(BlobError::new(
                        409,
                        codes::LEASE_ID_MISMATCH_WITH_LEASE_OPERATION,
                        "The lease ID specified did not match the lease ID for the blob.",
                    ));
                }
                None => {
                    return Err(BlobError::new(
                        409,
                        codes::LEASE_NOT_PRESENT_WITH_LEASE_OPERATION,
                        "There is currently no lease on the blob.",
                    ));
                }
            },
            LeaseAction::Break { .. } => {
                if state != LeaseState::Leased {
                    return Err(BlobError::new(
                        409,
                        codes::LEASE_NOT_PRESENT_WITH_LEASE_OPERATION,
                        "There is currently no lease on the blob.",
                    ));
                }
                blob.lease = Lease::Broken;
            }
        }
        Ok(())
    }

    async fn list_blobs(&self, prefix: &str) -> BlobResult<Vec<String>> {
        self.simulate_latency().await;
        Ok(lock(&self.blobs)
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}
