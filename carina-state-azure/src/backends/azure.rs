//! Azure Blob Storage backend for state storage

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

use crate::auth::CredentialHandle;
use crate::backend::{BackendError, BackendResult, StateBackend};
use crate::blob::{AzureBlobClient, BlobClient};
use crate::config::{AzureSettings, BackendConfig};
use crate::deadline::RequestDeadline;
use crate::key::{DEFAULT_WORKSPACE, KeyMapper};
use crate::lease::LeaseLocker;
use crate::lock::LockInfo;
use crate::state::{Fingerprint, StateContent};
use crate::store::StateStore;

/// State backend on one container of an Azure storage account
///
/// Each workspace is one blob. Its lock is a lease on that same blob, so the
/// state and its lock are always addressed by the same key.
pub struct AzureBackend {
    keys: KeyMapper,
    store: StateStore,
    locker: LeaseLocker,
}

impl AzureBackend {
    /// Create a new AzureBackend from configuration
    pub async fn from_config(config: &BackendConfig) -> BackendResult<Self> {
        let settings = AzureSettings::from_config(config)?;
        Self::from_settings(&settings).await
    }

    /// Resolve credentials and connect to the configured container
    ///
    /// An ambiguous or incomplete credential configuration is rejected before
    /// any request is made.
    pub async fn from_settings(settings: &AzureSettings) -> BackendResult<Self> {
        let scheme = settings.credentials.select()?;
        let base = settings.environment.blob_endpoint(
            &settings.storage_account_name,
            settings.endpoint.as_deref(),
        )?;

        let http = reqwest::Client::builder()
            .user_agent(concat!("carina-state-azure/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                BackendError::configuration(format!("failed to build HTTP client: {}", e))
            })?;
        // Token acquisition gets the same deadline as storage requests
        let credential = CredentialHandle::resolve(
            scheme,
            &settings.storage_account_name,
            &settings.environment,
            &http,
            RequestDeadline::new(settings.timeout),
        )
        .await?;

        info!(
            account = %settings.storage_account_name,
            container = %settings.container_name,
            endpoint = %base,
            scheme = credential.scheme_name(),
            "using Azure blob state backend"
        );

        let client = AzureBlobClient::new(
            http,
            base,
            settings.container_name.clone(),
            Arc::new(credential),
        );
        Self::with_client(settings, Arc::new(client))
    }

    /// Build the backend on an existing blob client
    pub fn with_client(
        settings: &AzureSettings,
        client: Arc<dyn BlobClient>,
    ) -> BackendResult<Self> {
        let keys = KeyMapper::new(
            settings.key.clone(),
            settings.workspace_key_prefix.clone(),
        )?;
        let deadline = RequestDeadline::new(settings.timeout);
        Ok(Self {
            keys,
            store: StateStore::new(client.clone(), deadline, settings.snapshot),
            locker: LeaseLocker::new(client, deadline, settings.lease_duration),
        })
    }

    /// Storage key used for a workspace
    pub fn state_key(&self, workspace: &str) -> BackendResult<String> {
        self.keys.state_key(workspace)
    }

    /// The current lock of a workspace, if any
    pub async fn lock_info(&self, workspace: &str) -> BackendResult<Option<LockInfo>> {
        let key = self.keys.state_key(workspace)?;
        self.locker.current(&key).await
    }
}

#[async_trait]
impl StateBackend for AzureBackend {
    async fn read_state(&self, workspace: &str) -> BackendResult<Option<StateContent>> {
        let key = self.keys.state_key(workspace)?;
        self.store.get(&key).await
    }

    async fn write_state(
        &self,
        workspace: &str,
        data: Bytes,
        expected: Option<&Fingerprint>,
    ) -> BackendResult<Fingerprint> {
        let key = self.keys.state_key(workspace)?;
        let lease_id = self.locker.held_lease(&key);
        self.store
            .put(&key, data, expected.into(), lease_id.as_deref())
            .await
    }

    async fn lock(&self, workspace: &str, info: &LockInfo) -> BackendResult<String> {
        let key = self.keys.state_key(workspace)?;
        self.locker.acquire(&key, info).await
    }

    async fn unlock(&self, workspace: &str, lock_id: &str) -> BackendResult<()> {
        let key = self.keys.state_key(workspace)?;
        self.locker.release(&key, lock_id).await
    }

    async fn force_unlock(&self, workspace: &str, lock_id: &str) -> BackendResult<()> {
        let key = self.keys.state_key(workspace)?;
        self.locker.force_release(&key, lock_id).await
    }

    async fn workspaces(&self) -> BackendResult<Vec<String>> {
        let keys = self.store.list(&self.keys.listing_prefix()).await?;
        let named: BTreeSet<String> = keys
            .iter()
            .filter_map(|key| self.keys.workspace_from_key(key))
            .filter(|name| name != DEFAULT_WORKSPACE)
            .collect();

        let mut workspaces = vec![DEFAULT_WORKSPACE.to_string()];
        workspaces.extend(named);
        Ok(workspaces)
    }

    async fn delete_workspace(&self, workspace: &str) -> BackendResult<()> {
        if workspace == DEFAULT_WORKSPACE {
            return Err(BackendError::configuration(
                "the default workspace cannot be deleted",
            ));
        }
        let key = self.keys.state_key(workspace)?;
        let lease_id = self.locker.held_lease(&key);
        self.store.delete(&key, lease_id.as_deref()).await
    }
}
