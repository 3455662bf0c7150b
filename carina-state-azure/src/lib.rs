//! Carina State Management on Azure Blob Storage
//!
//! This crate stores Carina infrastructure state in an Azure storage account
//! container, one blob per workspace, with lease-based locking for safe
//! concurrent access from independent processes.
//!
//! # Overview
//!
//! - **StateBackend**: the operations the orchestrator calls (read, write,
//!   lock, unlock, workspace management)
//! - **StateContent** / **Fingerprint**: state payload and the content hash
//!   used for optimistic concurrency on write
//! - **LockInfo**: the lock record kept in the state blob's metadata
//! - **CredentialHandle**: one of six authentication schemes, resolved once
//!   per backend
//!
//! # Example
//!
//! ```ignore
//! use carina_state_azure::{create_backend, BackendConfig, LockInfo};
//!
//! let config = BackendConfig::new("azurerm")
//!     .with_attribute("storage_account_name", "tfaccount")
//!     .with_attribute("container_name", "tfstate")
//!     .with_attribute("key", "prod.tfstate")
//!     .with_attribute("use_msi", true)
//!     .with_attribute("tenant_id", "...")
//!     .with_attribute("subscription_id", "...");
//!
//! let backend = create_backend(&config).await?;
//!
//! // Acquire lock before modifying state
//! let lock_id = backend.lock("prod", &LockInfo::new("apply")).await?;
//!
//! // Read current state
//! let current = backend.read_state("prod").await?;
//!
//! // ... modify resources ...
//!
//! // Write updated state against the fingerprint that was read
//! let expected = current.as_ref().map(|c| &c.fingerprint);
//! backend.write_state("prod", new_state, expected).await?;
//!
//! // Release lock
//! backend.unlock("prod", &lock_id).await?;
//! ```

pub mod auth;
pub mod backend;
pub mod backends;
pub mod blob;
pub mod config;
pub mod deadline;
pub mod environment;
pub mod key;
pub mod lease;
pub mod lock;
pub mod state;
pub mod store;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use auth::{CredentialConfig, CredentialHandle, CredentialScheme};
pub use backend::{BackendError, BackendResult, StateBackend};
pub use backends::{AzureBackend, create_backend};
pub use blob::{BlobClient, MemoryBlobClient};
pub use config::{AzureSettings, BackendConfig};
pub use environment::CloudEnvironment;
pub use key::{DEFAULT_WORKSPACE, KeyMapper};
pub use lock::LockInfo;
pub use state::{Fingerprint, StateContent};
