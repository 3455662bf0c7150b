//! Lease-based distributed locking
//!
//! A lock is a blob lease on the state object itself plus a lock record in the
//! object's metadata. The lease is the source of truth for exclusion: acquire
//! fails from the service's own "already leased" answer, never from metadata.
//!
//! Acquire takes the lease first and writes the record second. Between the two
//! steps another caller sees a lease without a record, reported as
//! [`BackendError::Locked`] with no holder.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, BackendResult};
use crate::blob::{
    BlobClient, BlobProperties, LeaseAction, LeaseDuration, PutBlob, WriteCondition,
};
use crate::deadline::RequestDeadline;
use crate::lock::{LockInfo, Metadata, lease_id_for};
use crate::state::Fingerprint;

/// A lease this process holds
struct HeldLease {
    lease_id: String,
    heartbeat: Option<JoinHandle<()>>,
}

impl Drop for HeldLease {
    fn drop(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
    }
}

/// Acquires, renews and releases locks on state objects
pub struct LeaseLocker {
    client: Arc<dyn BlobClient>,
    deadline: RequestDeadline,
    duration: LeaseDuration,
    held: DashMap<String, HeldLease>,
}

impl LeaseLocker {
    pub fn new(
        client: Arc<dyn BlobClient>,
        deadline: RequestDeadline,
        duration: LeaseDuration,
    ) -> Self {
        Self {
            client,
            deadline,
            duration,
            held: DashMap::new(),
        }
    }

    /// Lease ID to present when writing `key`, if this process holds its lock
    pub fn held_lease(&self, key: &str) -> Option<String> {
        self.held.get(key).map(|held| held.lease_id.clone())
    }

    /// Lock `key` for `info.id`
    ///
    /// Creates an empty placeholder object when nothing is stored at `key`
    /// yet. Losing the race for the lease fails immediately with
    /// [`BackendError::Locked`]; there is no waiting or retry.
    pub async fn acquire(&self, key: &str, info: &LockInfo) -> BackendResult<String> {
        let lease_id = info.lease_id();
        self.ensure_exists(key).await?;

        let action = LeaseAction::Acquire {
            proposed_id: lease_id.clone(),
            duration: self.duration,
        };
        match self
            .deadline
            .run("acquire lease", key, self.client.lease(key, action))
            .await?
        {
            Ok(()) => {}
            Err(e) if e.is_lease_already_present() => {
                let holder = self.holder(key).await;
                debug!(key, holder = ?holder.as_ref().map(|h| &h.id), "lease already present");
                return Err(BackendError::locked(key, holder));
            }
            Err(e) => return Err(e.into_backend(key)),
        }

        if let Err(e) = self.record(key, info, &lease_id).await {
            self.release_quietly(key, &lease_id).await;
            return Err(e);
        }

        let heartbeat = self.duration.renew_interval().map(|every| {
            tokio::spawn(heartbeat(
                self.client.clone(),
                self.deadline,
                key.to_string(),
                lease_id.clone(),
                every,
            ))
        });
        self.held.insert(
            key.to_string(),
            HeldLease {
                lease_id,
                heartbeat,
            },
        );

        info!(
            key,
            lock_id = %info.id,
            who = %info.who,
            operation = %info.operation,
            "acquired lock"
        );
        Ok(info.id.clone())
    }

    /// Release the lock on `key` held under `lock_id`
    ///
    /// A different `lock_id` fails with [`BackendError::LockMismatch`] and
    /// leaves the lock in place.
    pub async fn release(&self, key: &str, lock_id: &str) -> BackendResult<()> {
        let lease_id = lease_id_for(lock_id);
        let properties = self.locked_properties(key, lock_id).await?;
        let holder = LockInfo::from_metadata(&properties.metadata)?;

        if let Some(holder) = &holder {
            if holder.id != lock_id {
                return Err(mismatch(key, &holder.id, lock_id));
            }
        }

        let mut metadata = properties.metadata;
        LockInfo::clear_metadata(&mut metadata);
        match self
            .deadline
            .run(
                "clear lock info",
                key,
                self.client.set_metadata(key, &metadata, Some(&lease_id)),
            )
            .await?
        {
            Ok(()) => {}
            Err(e) if e.is_lease_mismatch() || e.is_write_blocked_by_lease() => {
                return Err(mismatch(key, &holder_id(holder.as_ref()), lock_id));
            }
            Err(e) if e.is_lease_not_present() => {
                self.held.remove(key);
                return Err(not_found(key, lock_id));
            }
            Err(e) => return Err(e.into_backend(key)),
        }

        // Stop renewing before the lease goes away, restore on failure
        let held = self.held.remove(key);
        let action = LeaseAction::Release {
            lease_id: lease_id.clone(),
        };
        let result = match self
            .deadline
            .run("release lease", key, self.client.lease(key, action))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) if e.is_lease_not_present() => Ok(()),
            Ok(Err(e)) if e.is_lease_mismatch() => {
                Err(mismatch(key, &holder_id(holder.as_ref()), lock_id))
            }
            Ok(Err(e)) => Err(e.into_backend(key)),
            Err(e) => Err(e),
        };
        if result.is_err() {
            if let Some((key, held)) = held {
                self.held.insert(key, held);
            }
            return result;
        }

        info!(key, lock_id, "released lock");
        Ok(())
    }

    /// Break the lock on `key` whoever holds it
    ///
    /// For recovering from a crashed holder. `lock_id` is only compared for
    /// the log line.
    pub async fn force_release(&self, key: &str, lock_id: &str) -> BackendResult<()> {
        let properties = self.locked_properties(key, lock_id).await?;
        let holder = LockInfo::from_metadata(&properties.metadata).ok().flatten();
        match &holder {
            Some(holder) if holder.id != lock_id => warn!(
                key,
                lock_id,
                holder = %holder.id,
                who = %holder.who,
                "force-unlocking a lock held under a different ID"
            ),
            _ => warn!(key, lock_id, "force-unlocking"),
        }

        let action = LeaseAction::Break {
            period: std::time::Duration::ZERO,
        };
        match self
            .deadline
            .run("break lease", key, self.client.lease(key, action))
            .await?
        {
            Ok(()) => {}
            Err(e) if e.is_lease_not_present() || e.is_not_found() => {
                return Err(not_found(key, lock_id));
            }
            Err(e) => return Err(e.into_backend(key)),
        }
        self.held.remove(key);

        // A broken lease no longer guards writes
        let mut metadata = properties.metadata;
        if LockInfo::clear_metadata(&mut metadata) {
            self.deadline
                .run(
                    "clear lock info",
                    key,
                    self.client.set_metadata(key, &metadata, None),
                )
                .await?
                .map_err(|e| e.into_backend(key))?;
        }

        info!(key, lock_id, "force-unlocked");
        Ok(())
    }

    /// Current lock record of `key`, `None` when it is not leased
    pub async fn current(&self, key: &str) -> BackendResult<Option<LockInfo>> {
        let properties = match self
            .deadline
            .run("get blob properties", key, self.client.get_properties(key))
            .await?
        {
            Ok(properties) => properties,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into_backend(key)),
        };
        if !properties.lease_state.is_held() {
            return Ok(None);
        }
        LockInfo::from_metadata(&properties.metadata)
    }

    /// Properties of `key`, failing with `LockNotFound` unless it is leased
    async fn locked_properties(&self, key: &str, lock_id: &str) -> BackendResult<BlobProperties> {
        let properties = match self
            .deadline
            .run("get blob properties", key, self.client.get_properties(key))
            .await?
        {
            Ok(properties) => properties,
            Err(e) if e.is_not_found() => return Err(not_found(key, lock_id)),
            Err(e) => return Err(e.into_backend(key)),
        };
        if !properties.lease_state.is_held() {
            self.held.remove(key);
            return Err(not_found(key, lock_id));
        }
        Ok(properties)
    }

    /// Create an empty object so a lease can be attached to it
    async fn ensure_exists(&self, key: &str) -> BackendResult<()> {
        match self
            .deadline
            .run("get blob properties", key, self.client.get_properties(key))
            .await?
        {
            Ok(_) => return Ok(()),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into_backend(key)),
        }

        let placeholder = PutBlob {
            data: Bytes::new(),
            content_md5: *Fingerprint::of(b"").as_bytes(),
            content_type: "application/json",
            metadata: Metadata::new(),
            condition: WriteCondition::IfNotExists,
            lease_id: None,
        };
        match self
            .deadline
            .run("create placeholder", key, self.client.put_blob(key, placeholder))
            .await?
        {
            Ok(_) => {
                debug!(key, "created empty state object to hold the lease");
                Ok(())
            }
            // Someone else created it first
            Err(e) if e.is_precondition_failed() => Ok(()),
            Err(e) => Err(e.into_backend(key)),
        }
    }

    /// Write the lock record under the freshly acquired lease
    async fn record(&self, key: &str, info: &LockInfo, lease_id: &str) -> BackendResult<()> {
        let properties = self
            .deadline
            .run("get blob properties", key, self.client.get_properties(key))
            .await?
            .map_err(|e| e.into_backend(key))?;

        let mut record = info.clone();
        record.path = key.to_string();
        let mut metadata = properties.metadata;
        record.write_metadata(&mut metadata)?;

        self.deadline
            .run(
                "write lock info",
                key,
                self.client.set_metadata(key, &metadata, Some(lease_id)),
            )
            .await?
            .map_err(|e| e.into_backend(key))
    }

    async fn release_quietly(&self, key: &str, lease_id: &str) {
        let action = LeaseAction::Release {
            lease_id: lease_id.to_string(),
        };
        match self
            .deadline
            .run("release lease", key, self.client.lease(key, action))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(key, error = %e, "failed to release lease after failed lock"),
            Err(e) => warn!(key, error = %e, "failed to release lease after failed lock"),
        }
    }

    /// Lock record of `key`, if one can be read
    async fn holder(&self, key: &str) -> Option<LockInfo> {
        match self
            .deadline
            .run("get blob properties", key, self.client.get_properties(key))
            .await
        {
            Ok(Ok(properties)) => LockInfo::from_metadata(&properties.metadata).ok().flatten(),
            _ => None,
        }
    }
}

/// Renew a lease until the task is aborted or the lease is lost
async fn heartbeat(
    client: Arc<dyn BlobClient>,
    deadline: RequestDeadline,
    key: String,
    lease_id: String,
    every: std::time::Duration,
) {
    let mut interval = tokio::time::interval(every);
    // The first tick completes immediately
    interval.tick().await;
    loop {
        interval.tick().await;
        let action = LeaseAction::Renew {
            lease_id: lease_id.clone(),
        };
        match deadline
            .run("renew lease", &key, client.lease(&key, action))
            .await
        {
            Ok(Ok(())) => debug!(key = %key, "renewed lease"),
            Ok(Err(e)) if e.is_lease_mismatch() || e.is_lease_not_present() || e.is_not_found() => {
                warn!(key = %key, error = %e, "lease lost, stopping renewal");
                return;
            }
            Ok(Err(e)) => warn!(key = %key, error = %e, "failed to renew lease"),
            Err(e) => warn!(key = %key, error = %e, "failed to renew lease"),
        }
    }
}

fn holder_id(holder: Option<&LockInfo>) -> String {
    holder
        .map(|h| h.id.clone())
        .unwrap_or_else(|| "<unrecorded>".to_string())
}

fn mismatch(key: &str, expected: &str, actual: &str) -> BackendError {
    BackendError::LockMismatch {
        key: key.to_string(),
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}

fn not_found(key: &str, lock_id: &str) -> BackendError {
    BackendError::LockNotFound {
        key: key.to_string(),
        lock_id: lock_id.to_string(),
    }
}
