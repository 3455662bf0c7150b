//! Per-request deadlines for storage calls

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::backend::{BackendError, BackendResult};

/// Default time a single storage request may take
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound applied to every storage or token request
///
/// A request that runs past the deadline is dropped, which cancels it, and
/// surfaces as [`BackendError::Timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestDeadline {
    after: Duration,
}

impl RequestDeadline {
    pub fn new(after: Duration) -> Self {
        Self { after }
    }

    /// Run a network call, mapping an elapsed deadline to a timeout error
    ///
    /// The inner result is returned untouched so callers can still classify
    /// service errors.
    pub async fn run<T, F>(&self, operation: &'static str, key: &str, fut: F) -> BackendResult<T>
    where
        F: Future<Output = T>,
    {
        match tokio::time::timeout(self.after, fut).await {
            Ok(result) => Ok(result),
            Err(_) => {
                warn!(operation, key, after = ?self.after, "request timed out");
                Err(BackendError::Timeout {
                    operation,
                    key: key.to_string(),
                    after: self.after,
                })
            }
        }
    }
}

impl Default for RequestDeadline {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}
