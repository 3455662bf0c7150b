//! Backend implementations for state storage

mod azure;

pub use azure::AzureBackend;

use crate::backend::{BackendError, BackendResult, StateBackend};
use crate::config::BackendConfig;

/// Create a backend from configuration
///
/// This function dispatches to the appropriate backend implementation
/// based on the backend_type in the configuration.
pub async fn create_backend(config: &BackendConfig) -> BackendResult<Box<dyn StateBackend>> {
    match config.backend_type.as_str() {
        "azurerm" | "azure" => {
            let backend = AzureBackend::from_config(config).await?;
            Ok(Box::new(backend))
        }
        other => Err(BackendError::unsupported_backend(other)),
    }
}
