//! Blob state store
//!
//! Reads and writes state content at a mapped key. Writes are conditional on
//! the ETag observed while checking the caller's fingerprint, so two writers
//! racing on the same stale fingerprint cannot both succeed.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, info, instrument};

use crate::backend::{BackendError, BackendResult};
use crate::blob::{BlobClient, BlobError, BlobProperties, PutBlob, WriteCondition};
use crate::deadline::RequestDeadline;
use crate::key::snapshot_key;
use crate::lock::{LockInfo, Metadata};
use crate::state::{Fingerprint, StateContent};

const STATE_CONTENT_TYPE: &str = "application/json";

/// What the stored state must look like for a write to proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition<'a> {
    /// Overwrite whatever is stored
    Any,
    /// The key must not hold any state yet
    Absent,
    /// The stored state must have this fingerprint
    Matches(&'a Fingerprint),
}

impl<'a> From<Option<&'a Fingerprint>> for Precondition<'a> {
    /// A fingerprint from the last read, or `None` when that read found nothing
    fn from(expected: Option<&'a Fingerprint>) -> Self {
        match expected {
            Some(fingerprint) => Self::Matches(fingerprint),
            None => Self::Absent,
        }
    }
}

impl Precondition<'_> {
    fn expected(&self) -> Option<Fingerprint> {
        match self {
            Self::Matches(fingerprint) => Some(**fingerprint),
            Self::Any | Self::Absent => None,
        }
    }

    fn holds(&self, actual: Option<&Fingerprint>) -> bool {
        match self {
            Self::Any => true,
            Self::Absent => actual.is_none(),
            Self::Matches(expected) => actual == Some(*expected),
        }
    }
}

/// The stored object as seen before a write
struct Current {
    etag: String,
    /// `None` for an empty placeholder object
    fingerprint: Option<Fingerprint>,
    metadata: Metadata,
    /// Content, when it had to be downloaded to compute the fingerprint
    data: Option<Bytes>,
}

/// Get, put and delete of state content on a blob container
pub struct StateStore {
    client: Arc<dyn BlobClient>,
    deadline: RequestDeadline,
    snapshot: bool,
}

impl StateStore {
    /// With `snapshot` set, the previous content is copied to a sibling key
    /// before every overwrite
    pub fn new(client: Arc<dyn BlobClient>, deadline: RequestDeadline, snapshot: bool) -> Self {
        Self {
            client,
            deadline,
            snapshot,
        }
    }

    /// Read the state at `key`
    ///
    /// A missing or zero-length object reads as `None`.
    #[instrument(skip(self))]
    pub async fn get(&self, key: &str) -> BackendResult<Option<StateContent>> {
        let blob = match self
            .deadline
            .run("get blob", key, self.client.get_blob(key))
            .await?
        {
            Ok(blob) => blob,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into_backend(key)),
        };

        if blob.data.is_empty() {
            return Ok(None);
        }
        let content = StateContent::new(blob.data);
        verify_checksum(key, &content, &blob.properties)?;
        debug!(key, size = content.len(), fingerprint = %content.fingerprint, "read state");
        Ok(Some(content))
    }

    /// Write the state at `key`, returning its new fingerprint
    ///
    /// `lease_id` must be given while the object is leased. Metadata already on
    /// the object, such as a lock record, is kept.
    #[instrument(skip(self, data), fields(size = data.len()))]
    pub async fn put(
        &self,
        key: &str,
        data: Bytes,
        expected: Precondition<'_>,
        lease_id: Option<&str>,
    ) -> BackendResult<Fingerprint> {
        let current = self.current(key).await?;
        let actual = current.as_ref().and_then(|c| c.fingerprint);
        if !expected.holds(actual.as_ref()) {
            return Err(BackendError::Conflict {
                key: key.to_string(),
                expected: expected.expected(),
                actual,
            });
        }

        if self.snapshot {
            if let Some(current) = current.as_ref().filter(|c| c.fingerprint.is_some()) {
                self.write_snapshot(key, current).await?;
            }
        }

        let fingerprint = Fingerprint::of(&data);
        let (condition, metadata) = match current {
            Some(current) => (WriteCondition::IfMatch(current.etag), current.metadata),
            None => (WriteCondition::IfNotExists, Metadata::new()),
        };
        let request = PutBlob {
            data,
            content_md5: *fingerprint.as_bytes(),
            content_type: STATE_CONTENT_TYPE,
            metadata,
            condition,
            lease_id: lease_id.map(str::to_string),
        };

        match self
            .deadline
            .run("put blob", key, self.client.put_blob(key, request))
            .await?
        {
            Ok(_) => {
                debug!(key, %fingerprint, "wrote state");
                Ok(fingerprint)
            }
            Err(e) if e.is_precondition_failed() => {
                // Lost a race after the fingerprint check
                let actual = self
                    .current(key)
                    .await
                    .ok()
                    .flatten()
                    .and_then(|c| c.fingerprint);
                Err(BackendError::Conflict {
                    key: key.to_string(),
                    expected: expected.expected(),
                    actual,
                })
            }
            Err(e) => Err(self.write_error(key, e).await),
        }
    }

    /// Remove the state at `key`; a missing object is not an error
    #[instrument(skip(self))]
    pub async fn delete(&self, key: &str, lease_id: Option<&str>) -> BackendResult<()> {
        match self
            .deadline
            .run("delete blob", key, self.client.delete_blob(key, lease_id))
            .await?
        {
            Ok(()) => {
                info!(key, "deleted state");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(self.write_error(key, e).await),
        }
    }

    /// Keys starting with `prefix`
    #[instrument(skip(self))]
    pub async fn list(&self, prefix: &str) -> BackendResult<Vec<String>> {
        self.deadline
            .run("list blobs", prefix, self.client.list_blobs(prefix))
            .await?
            .map_err(|e| e.into_backend(prefix))
    }

    async fn current(&self, key: &str) -> BackendResult<Option<Current>> {
        let properties = match self
            .deadline
            .run("get blob properties", key, self.client.get_properties(key))
            .await?
        {
            Ok(properties) => properties,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into_backend(key)),
        };

        if properties.content_length == 0 {
            return Ok(Some(Current {
                etag: properties.etag,
                fingerprint: None,
                metadata: properties.metadata,
                data: None,
            }));
        }

        if let Some(fingerprint) = properties
            .content_md5
            .as_deref()
            .and_then(Fingerprint::from_digest)
        {
            return Ok(Some(Current {
                etag: properties.etag,
                fingerprint: Some(fingerprint),
                metadata: properties.metadata,
                data: None,
            }));
        }

        // Objects uploaded without an MD5 have to be hashed locally
        let blob = match self
            .deadline
            .run("get blob", key, self.client.get_blob(key))
            .await?
        {
            Ok(blob) => blob,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into_backend(key)),
        };
        Ok(Some(Current {
            etag: blob.properties.etag,
            fingerprint: (!blob.data.is_empty()).then(|| Fingerprint::of(&blob.data)),
            metadata: blob.properties.metadata,
            data: Some(blob.data),
        }))
    }

    async fn write_snapshot(&self, key: &str, current: &Current) -> BackendResult<()> {
        let data = match &current.data {
            Some(data) => data.clone(),
            None => match self
                .deadline
                .run("get blob", key, self.client.get_blob(key))
                .await?
            {
                Ok(blob) if blob.properties.etag == current.etag => blob.data,
                Ok(_) => {
                    return Err(BackendError::Conflict {
                        key: key.to_string(),
                        expected: current.fingerprint,
                        actual: None,
                    });
                }
                Err(e) => return Err(e.into_backend(key)),
            },
        };

        let snapshot = snapshot_key(key, Utc::now());
        let request = PutBlob {
            content_md5: *Fingerprint::of(&data).as_bytes(),
            data,
            content_type: STATE_CONTENT_TYPE,
            metadata: Metadata::new(),
            condition: WriteCondition::IfNotExists,
            lease_id: None,
        };
        self.deadline
            .run("put snapshot", &snapshot, self.client.put_blob(&snapshot, request))
            .await?
            .map_err(|e| e.into_backend(&snapshot))?;
        info!(key, snapshot = %snapshot, "saved state snapshot");
        Ok(())
    }

    /// Translate a refused write, naming the lock holder when a lease blocked it
    async fn write_error(&self, key: &str, error: BlobError) -> BackendError {
        if !error.is_write_blocked_by_lease() {
            return error.into_backend(key);
        }
        let holder = match self
            .deadline
            .run("get blob properties", key, self.client.get_properties(key))
            .await
        {
            Ok(Ok(properties)) => LockInfo::from_metadata(&properties.metadata).ok().flatten(),
            _ => None,
        };
        BackendError::locked(key, holder)
    }
}

fn verify_checksum(
    key: &str,
    content: &StateContent,
    properties: &BlobProperties,
) -> BackendResult<()> {
    let Some(recorded) = properties.content_md5.as_deref() else {
        return Ok(());
    };
    if recorded != content.fingerprint.as_bytes() {
        return Err(BackendError::InvalidState(format!(
            "checksum mismatch on {}: stored MD5 {}, content hashes to {}",
            key,
            hex::encode(recorded),
            content.fingerprint
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::blob::{LeaseAction, LeaseDuration, MemoryBlobClient};

    fn store(snapshot: bool) -> (Arc<MemoryBlobClient>, StateStore) {
        let client = Arc::new(MemoryBlobClient::new());
        let store = StateStore::new(client.clone(), RequestDeadline::default(), snapshot);
        (client, store)
    }

    #[tokio::test]
    async fn test_get_never_written() {
        let (_, store) = store(false);
        assert!(store.get("prod.tfstate").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let (_, store) = store(false);
        let fingerprint = store
            .put("prod.tfstate", Bytes::from_static(b"v1"), Precondition::Absent, None)
            .await
            .unwrap();
        assert_eq!(fingerprint, Fingerprint::of(b"v1"));

        let content = store.get("prod.tfstate").await.unwrap().unwrap();
        assert_eq!(content.data, Bytes::from_static(b"v1"));
        assert_eq!(content.fingerprint, fingerprint);
    }

    #[tokio::test]
    async fn test_stale_fingerprint_conflicts() {
        let (_, store) = store(false);
        let v1 = store
            .put("state", Bytes::from_static(b"v1"), Precondition::Absent, None)
            .await
            .unwrap();
        let v2 = store
            .put("state", Bytes::from_static(b"v2"), Precondition::Matches(&v1), None)
            .await
            .unwrap();

        let err = store
            .put("state", Bytes::from_static(b"v3"), Precondition::Matches(&v1), None)
            .await
            .unwrap_err();
        match err {
            BackendError::Conflict {
                expected, actual, ..
            } => {
                assert_eq!(expected, Some(v1));
                assert_eq!(actual, Some(v2));
            }
            other => panic!("unexpected {:?}", other),
        }
        let content = store.get("state").await.unwrap().unwrap();
        assert_eq!(content.data, Bytes::from_static(b"v2"));
    }

    #[tokio::test]
    async fn test_absent_precondition_on_existing_state() {
        let (_, store) = store(false);
        store
            .put("state", Bytes::from_static(b"v1"), Precondition::Absent, None)
            .await
            .unwrap();
        let err = store
            .put("state", Bytes::from_static(b"v2"), Precondition::Absent, None)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        store
            .put("state", Bytes::from_static(b"v2"), Precondition::Any, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_puts_with_same_fingerprint() {
        let (_, store) = store(false);
        let v1 = store
            .put("state", Bytes::from_static(b"v1"), Precondition::Absent, None)
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            store.put("state", Bytes::from_static(b"a"), Precondition::Matches(&v1), None),
            store.put("state", Bytes::from_static(b"b"), Precondition::Matches(&v1), None),
        );
        let successes = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(successes, 1);
        let failure = if a.is_err() { a } else { b };
        assert!(matches!(failure, Err(BackendError::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_snapshot_before_overwrite() {
        let (client, store) = store(true);
        let v1 = store
            .put("prod.tfstate", Bytes::from_static(b"v1"), Precondition::Absent, None)
            .await
            .unwrap();
        // Nothing to snapshot on the first write
        assert_eq!(client.keys(), vec!["prod.tfstate"]);

        store
            .put("prod.tfstate", Bytes::from_static(b"v2"), Precondition::Matches(&v1), None)
            .await
            .unwrap();
        let keys = client.keys();
        assert_eq!(keys.len(), 2);
        let snapshot = keys
            .iter()
            .find(|k| k.starts_with("prod.tfstate.") && k.ends_with(".backup"))
            .unwrap();
        let saved = store.get(snapshot).await.unwrap().unwrap();
        assert_eq!(saved.data, Bytes::from_static(b"v1"));
    }

    #[tokio::test]
    async fn test_snapshot_failure_aborts_write() {
        let (client, store) = store(true);
        let v1 = store
            .put("state", Bytes::from_static(b"v1"), Precondition::Absent, None)
            .await
            .unwrap();

        let failing = StateStore::new(
            Arc::new(FailingSnapshots(client.clone())),
            RequestDeadline::default(),
            true,
        );
        let err = failing
            .put("state", Bytes::from_static(b"v2"), Precondition::Matches(&v1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Storage { status: 500, .. }));

        let content = store.get("state").await.unwrap().unwrap();
        assert_eq!(content.data, Bytes::from_static(b"v1"));
    }

    /// Fails every write to a snapshot key
    struct FailingSnapshots(Arc<MemoryBlobClient>);

    #[async_trait::async_trait]
    impl BlobClient for FailingSnapshots {
        async fn get_blob(&self, key: &str) -> crate::blob::BlobResult<crate::blob::Blob> {
            self.0.get_blob(key).await
        }

        async fn get_properties(&self, key: &str) -> crate::blob::BlobResult<BlobProperties> {
            self.0.get_properties(key).await
        }

        async fn put_blob(&self, key: &str, request: PutBlob) -> crate::blob::BlobResult<String> {
            if key.ends_with(".backup") {
                return Err(BlobError::new(500, "InternalError", "snapshot failed"));
            }
            self.0.put_blob(key, request).await
        }

        async fn set_metadata(
            &self,
            key: &str,
            metadata: &Metadata,
            lease_id: Option<&str>,
        ) -> crate::blob::BlobResult<()> {
            self.0.set_metadata(key, metadata, lease_id).await
        }

        async fn delete_blob(
            &self,
            key: &str,
            lease_id: Option<&str>,
        ) -> crate::blob::BlobResult<()> {
            self.0.delete_blob(key, lease_id).await
        }

        async fn lease(&self, key: &str, action: LeaseAction) -> crate::blob::BlobResult<()> {
            self.0.lease(key, action).await
        }

        async fn list_blobs(&self, prefix: &str) -> crate::blob::BlobResult<Vec<String>> {
            self.0.list_blobs(prefix).await
        }
    }

    #[tokio::test]
    async fn test_injected_write_failure_is_storage_error() {
        let (client, store) = store(false);
        client.fail_writes_to("state");
        let err = store
            .put("state", Bytes::from_static(b"v1"), Precondition::Absent, None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(store.get("state").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_checksum_mismatch() {
        let (client, store) = store(false);
        store
            .put("state", Bytes::from_static(b"v1"), Precondition::Absent, None)
            .await
            .unwrap();
        assert!(client.replace_content("state", Bytes::from_static(b"tampered")));

        let err = store.get("state").await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_empty_placeholder_reads_as_absent() {
        let (client, store) = store(false);
        client
            .put_blob(
                "state",
                PutBlob {
                    data: Bytes::new(),
                    content_md5: *Fingerprint::of(b"").as_bytes(),
                    content_type: STATE_CONTENT_TYPE,
                    metadata: Metadata::new(),
                    condition: WriteCondition::IfNotExists,
                    lease_id: None,
                },
            )
            .await
            .unwrap();
        assert!(store.get("state").await.unwrap().is_none());

        // First write over a placeholder succeeds with no fingerprint
        store
            .put("state", Bytes::from_static(b"v1"), Precondition::Absent, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_put_keeps_metadata_and_respects_lease() {
        let (client, store) = store(false);
        store
            .put("state", Bytes::from_static(b"v1"), Precondition::Absent, None)
            .await
            .unwrap();

        let holder = LockInfo::with_id("L1", "apply");
        let lease_id = holder.lease_id();
        client
            .lease(
                "state",
                LeaseAction::Acquire {
                    proposed_id: lease_id.clone(),
                    duration: LeaseDuration::Infinite,
                },
            )
            .await
            .unwrap();
        let mut metadata = Metadata::new();
        holder.write_metadata(&mut metadata).unwrap();
        client
            .set_metadata("state", &metadata, Some(&lease_id))
            .await
            .unwrap();

        // Without the lease ID the write is refused and names the holder
        let err = store
            .put("state", Bytes::from_static(b"v2"), Precondition::Any, None)
            .await
            .unwrap_err();
        match err {
            BackendError::Locked { holder: Some(h), .. } => assert_eq!(h.id, "L1"),
            other => panic!("unexpected {:?}", other),
        }

        store
            .put("state", Bytes::from_static(b"v2"), Precondition::Any, Some(&lease_id))
            .await
            .unwrap();
        let properties = client.get_properties("state").await.unwrap();
        assert_eq!(
            LockInfo::from_metadata(&properties.metadata).unwrap().unwrap().id,
            "L1"
        );
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (client, store) = store(false);
        store
            .put("state", Bytes::from_static(b"v1"), Precondition::Absent, None)
            .await
            .unwrap();
        store.delete("state", None).await.unwrap();
        assert!(!client.contains("state"));
        store.delete("state", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_list() {
        let (_, store) = store(false);
        for key in ["env:/a/state", "env:/b/state", "state"] {
            store
                .put(key, Bytes::from_static(b"x"), Precondition::Absent, None)
                .await
                .unwrap();
        }
        let mut keys = store.list("env:/").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["env:/a/state", "env:/b/state"]);
    }

    #[tokio::test]
    async fn test_deadline() {
        let (client, _) = store(false);
        client.set_latency(Some(Duration::from_millis(200)));
        let store = StateStore::new(
            client.clone(),
            RequestDeadline::new(Duration::from_millis(20)),
            false,
        );
        let err = store.get("state").await.unwrap_err();
        assert!(matches!(err, BackendError::Timeout { .. }));
    }
}
