//! Mapping from workspace names to state blob keys
//!
//! The default workspace lives at the configured key. Every other workspace
//! `W` lives at `<prefix>/W/<key>`, so listing `<prefix>/` enumerates the
//! workspaces that have ever been written.

use chrono::{DateTime, Utc};

use crate::backend::{BackendError, BackendResult};

/// Name of the workspace that maps to the configured key unchanged
pub const DEFAULT_WORKSPACE: &str = "default";

/// Default prefix for non-default workspace keys
pub const DEFAULT_WORKSPACE_KEY_PREFIX: &str = "env:";

/// Maximum length of a workspace name
const MAX_WORKSPACE_LEN: usize = 90;

/// Derives state blob keys for workspaces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMapper {
    base_key: String,
    prefix: String,
}

impl KeyMapper {
    pub fn new(base_key: impl Into<String>, prefix: impl Into<String>) -> BackendResult<Self> {
        let base_key = base_key.into();
        let prefix = prefix.into();

        if base_key.is_empty() {
            return Err(BackendError::configuration("key must not be empty"));
        }
        if base_key.starts_with('/') || base_key.ends_with('/') {
            return Err(BackendError::configuration(format!(
                "key must not begin or end with '/': {}",
                base_key
            )));
        }
        if prefix.is_empty() {
            return Err(BackendError::configuration(
                "workspace_key_prefix must not be empty",
            ));
        }
        if prefix.starts_with('/') || prefix.ends_with('/') {
            return Err(BackendError::configuration(format!(
                "workspace_key_prefix must not begin or end with '/': {}",
                prefix
            )));
        }

        Ok(Self { base_key, prefix })
    }

    /// Key of the state blob for a workspace
    pub fn state_key(&self, workspace: &str) -> BackendResult<String> {
        if workspace == DEFAULT_WORKSPACE {
            return Ok(self.base_key.clone());
        }
        validate_workspace(workspace)?;
        Ok(format!("{}/{}/{}", self.prefix, workspace, self.base_key))
    }

    /// Prefix under which every non-default workspace key lives
    pub fn listing_prefix(&self) -> String {
        format!("{}/", self.prefix)
    }

    /// Recover the workspace name from a listed key
    ///
    /// Keys under the prefix that are not exactly `<prefix>/W/<key>`, such as
    /// snapshots, yield `None`.
    pub fn workspace_from_key(&self, key: &str) -> Option<String> {
        let rest = key.strip_prefix(&self.listing_prefix())?;
        let (workspace, tail) = rest.split_once('/')?;
        if tail != self.base_key || validate_workspace(workspace).is_err() {
            return None;
        }
        Some(workspace.to_string())
    }
}

/// Check that a name is usable as a single key segment
pub fn validate_workspace(name: &str) -> BackendResult<()> {
    if name.is_empty() {
        return Err(BackendError::invalid_workspace(name, "name must not be empty"));
    }
    if name.len() > MAX_WORKSPACE_LEN {
        return Err(BackendError::invalid_workspace(
            name,
            format!("name must be at most {} characters", MAX_WORKSPACE_LEN),
        ));
    }
    if name == "." || name == ".." {
        return Err(BackendError::invalid_workspace(
            name,
            "name must not be a relative path component",
        ));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(BackendError::invalid_workspace(
            name,
            format!("character {:?} is not allowed", c),
        ));
    }
    Ok(())
}

/// Sibling key that keeps a copy of `key` taken at `at`
pub fn snapshot_key(key: &str, at: DateTime<Utc>) -> String {
    format!("{}.{}.backup", key, at.format("%Y%m%dT%H%M%S%.3fZ"))
}
