//! Azure cloud environments (public and sovereign clouds)

use url::Url;

use crate::backend::{BackendError, BackendResult};

/// Resource scope requested for storage data-plane tokens
pub const STORAGE_SCOPE: &str = "https://storage.azure.com/.default";

/// Resource identifier used by the instance metadata endpoint
pub const STORAGE_RESOURCE: &str = "https://storage.azure.com/";

/// Endpoints of one Azure cloud
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudEnvironment {
    pub name: &'static str,
    /// DNS suffix of storage endpoints, e.g. `core.windows.net`
    pub storage_suffix: &'static str,
    /// Identity provider host, e.g. `https://login.microsoftonline.com`
    pub authority_host: &'static str,
}

impl CloudEnvironment {
    pub const PUBLIC: Self = Self {
        name: "public",
        storage_suffix: "core.windows.net",
        authority_host: "https://login.microsoftonline.com",
    };

    pub const US_GOVERNMENT: Self = Self {
        name: "usgovernment",
        storage_suffix: "core.usgovcloudapi.net",
        authority_host: "https://login.microsoftonline.us",
    };

    pub const CHINA: Self = Self {
        name: "china",
        storage_suffix: "core.chinacloudapi.cn",
        authority_host: "https://login.chinacloudapi.cn",
    };

    /// Look up an environment by name (case-insensitive)
    pub fn from_name(name: &str) -> BackendResult<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "public" | "azurecloud" | "azurepubliccloud" => Ok(Self::PUBLIC),
            "usgovernment" | "azureusgovernment" | "azureusgovernmentcloud" => {
                Ok(Self::US_GOVERNMENT)
            }
            "china" | "azurechina" | "azurechinacloud" => Ok(Self::CHINA),
            "german" | "azuregermancloud" => Err(BackendError::configuration(
                "the German cloud has been closed, use \"public\" instead",
            )),
            other => Err(BackendError::configuration(format!(
                "unknown environment {:?}, expected one of: public, usgovernment, china",
                other
            ))),
        }
    }

    /// Blob service base URL for an account
    ///
    /// `endpoint` overrides the derived URL, for Azure Stack or emulators.
    pub fn blob_endpoint(&self, account: &str, endpoint: Option<&str>) -> BackendResult<Url> {
        let raw = match endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://{}.blob.{}", account, self.storage_suffix),
        };
        Url::parse(&raw)
            .map_err(|e| BackendError::configuration(format!("invalid endpoint {:?}: {}", raw, e)))
    }

    /// Token endpoint of a tenant
    pub fn token_endpoint(&self, tenant_id: &str) -> String {
        format!("{}/{}/oauth2/v2.0/token", self.authority_host, tenant_id)
    }
}

impl Default for CloudEnvironment {
    fn default() -> Self {
        Self::PUBLIC
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name() {
        assert_eq!(CloudEnvironment::from_name("public").unwrap(), CloudEnvironment::PUBLIC);
        assert_eq!(CloudEnvironment::from_name("").unwrap(), CloudEnvironment::PUBLIC);
        assert_eq!(
            CloudEnvironment::from_name("AzureUSGovernmentCloud").unwrap(),
            CloudEnvironment::US_GOVERNMENT
        );
        assert_eq!(CloudEnvironment::from_name("china").unwrap(), CloudEnvironment::CHINA);
        assert!(CloudEnvironment::from_name("german").is_err());
        assert!(CloudEnvironment::from_name("mars").is_err());
    }

    #[test]
    fn test_blob_endpoint() {
        let url = CloudEnvironment::PUBLIC
            .blob_endpoint("tfaccount", None)
            .unwrap();
        assert_eq!(url.as_str(), "https://tfaccount.blob.core.windows.net/");

        let url = CloudEnvironment::CHINA.blob_endpoint("tfaccount", None).unwrap();
        assert_eq!(url.host_str(), Some("tfaccount.blob.core.chinacloudapi.cn"));
    }

    #[test]
    fn test_blob_endpoint_override() {
        let url = CloudEnvironment::PUBLIC
            .blob_endpoint("devstoreaccount1", Some("http://127.0.0.1:10000/devstoreaccount1/"))
            .unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:10000/devstoreaccount1");

        assert!(
            CloudEnvironment::PUBLIC
                .blob_endpoint("a", Some("not a url"))
                .is_err()
        );
    }

    #[test]
    fn test_token_endpoint() {
        assert_eq!(
            CloudEnvironment::US_GOVERNMENT.token_endpoint("tenant"),
            "https://login.microsoftonline.us/tenant/oauth2/v2.0/token"
        );
    }
}
