//! Backend configuration
//!
//! [`BackendConfig`] is the untyped attribute map handed over by the
//! configuration layer. [`AzureSettings`] is the validated view of it, with
//! defaults applied and `ARM_*` environment variables filling in absent
//! credential attributes. Once the configuration names a credential scheme,
//! only that scheme's secrets are taken from the environment.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;

use crate::auth::CredentialConfig;
use crate::backend::{BackendError, BackendResult};
use crate::blob::LeaseDuration;
use crate::deadline::DEFAULT_TIMEOUT;
use crate::environment::CloudEnvironment;
use crate::key::DEFAULT_WORKSPACE_KEY_PREFIX;

/// Attributes whose values are never printed
const SENSITIVE_ATTRIBUTES: &[&str] = &[
    "access_key",
    "sas_token",
    "client_secret",
    "client_certificate_password",
    "oidc_token",
    "oidc_request_token",
];

const MIN_LEASE_SECS: i64 = 15;
const MAX_LEASE_SECS: i64 = 60;

/// Configuration for a state backend
#[derive(Clone, Default)]
pub struct BackendConfig {
    /// Backend type (e.g., "azurerm")
    pub backend_type: String,
    /// Backend-specific attributes
    pub attributes: HashMap<String, Value>,
}

impl BackendConfig {
    pub fn new(backend_type: impl Into<String>) -> Self {
        Self {
            backend_type: backend_type.into(),
            attributes: HashMap::new(),
        }
    }

    /// Builder-style attribute setter
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Get a string attribute value
    pub fn get_string(&self, key: &str) -> Option<&str> {
        match self.attributes.get(key) {
            Some(Value::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Get a boolean attribute value
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.attributes.get(key) {
            Some(Value::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Get a boolean attribute with a default value
    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).unwrap_or(default)
    }

    /// Get an integer attribute value
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.attributes.get(key) {
            Some(Value::Number(n)) => n.as_i64(),
            _ => None,
        }
    }
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.attributes.keys().collect();
        names.sort();
        let mut map = f.debug_map();
        for name in names {
            if SENSITIVE_ATTRIBUTES.contains(&name.as_str()) {
                map.entry(name, &"<redacted>");
            } else {
                map.entry(name, &self.attributes[name]);
            }
        }
        map.finish()?;
        write!(f, " ({})", self.backend_type)
    }
}

/// Validated settings of the Azure backend
#[derive(Debug, Clone)]
pub struct AzureSettings {
    pub storage_account_name: String,
    pub container_name: String,
    /// Base key of the default workspace's state
    pub key: String,
    pub workspace_key_prefix: String,
    /// Keep a copy of the previous state before each overwrite
    pub snapshot: bool,
    /// Blob service URL overriding the one derived from the environment
    pub endpoint: Option<String>,
    pub environment: CloudEnvironment,
    pub credentials: CredentialConfig,
    pub lease_duration: LeaseDuration,
    /// Deadline of each storage request
    pub timeout: Duration,
}

impl AzureSettings {
    /// Read settings from the configuration and the process environment
    pub fn from_config(config: &BackendConfig) -> BackendResult<Self> {
        Self::from_config_with_env(config, |name| std::env::var(name).ok())
    }

    /// Read settings, looking up environment fallbacks with `env`
    pub fn from_config_with_env<F>(config: &BackendConfig, env: F) -> BackendResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let source = Source {
            config,
            env: &env,
            explicit: explicit_schemes(config),
        };

        let storage_account_name = source.required("storage_account_name")?;
        let container_name = source.required("container_name")?;
        let key = source.required("key")?;

        let workspace_key_prefix = config
            .get_string("workspace_key_prefix")
            .unwrap_or(DEFAULT_WORKSPACE_KEY_PREFIX)
            .to_string();

        let environment = match source.string("environment", &["ARM_ENVIRONMENT"]) {
            Some(name) => CloudEnvironment::from_name(&name)?,
            None => CloudEnvironment::default(),
        };

        let credentials = CredentialConfig {
            access_key: source.scheme_string(Scheme::SharedKey, "access_key", "ARM_ACCESS_KEY"),
            sas_token: source.scheme_string(Scheme::SasToken, "sas_token", "ARM_SAS_TOKEN"),
            use_oidc: source.scheme_flag(Scheme::Oidc, "use_oidc", "ARM_USE_OIDC")?,
            oidc_token: source.scheme_string(Scheme::Oidc, "oidc_token", "ARM_OIDC_TOKEN"),
            oidc_token_file_path: source
                .scheme_string(
                    Scheme::Oidc,
                    "oidc_token_file_path",
                    "ARM_OIDC_TOKEN_FILE_PATH",
                )
                .map(PathBuf::from),
            oidc_request_url: source.string(
                "oidc_request_url",
                &["ARM_OIDC_REQUEST_URL", "ACTIONS_ID_TOKEN_REQUEST_URL"],
            ),
            oidc_request_token: source.string(
                "oidc_request_token",
                &["ARM_OIDC_REQUEST_TOKEN", "ACTIONS_ID_TOKEN_REQUEST_TOKEN"],
            ),
            use_msi: source.scheme_flag(Scheme::ManagedIdentity, "use_msi", "ARM_USE_MSI")?,
            msi_endpoint: source.string("msi_endpoint", &["ARM_MSI_ENDPOINT"]),
            client_id: source.string("client_id", &["ARM_CLIENT_ID"]),
            client_secret: source.scheme_string(
                Scheme::ClientSecret,
                "client_secret",
                "ARM_CLIENT_SECRET",
            ),
            client_certificate_path: source
                .scheme_string(
                    Scheme::ClientCertificate,
                    "client_certificate_path",
                    "ARM_CLIENT_CERTIFICATE_PATH",
                )
                .map(PathBuf::from),
            client_certificate_password: source.scheme_string(
                Scheme::ClientCertificate,
                "client_certificate_password",
                "ARM_CLIENT_CERTIFICATE_PASSWORD",
            ),
            tenant_id: source.string("tenant_id", &["ARM_TENANT_ID"]),
            subscription_id: source.string("subscription_id", &["ARM_SUBSCRIPTION_ID"]),
        };

        let lease_duration = match config.get_i64("lease_duration") {
            None => LeaseDuration::default(),
            Some(-1) => LeaseDuration::Infinite,
            Some(secs) if (MIN_LEASE_SECS..=MAX_LEASE_SECS).contains(&secs) => {
                LeaseDuration::Fixed(Duration::from_secs(secs as u64))
            }
            Some(secs) => {
                return Err(BackendError::configuration(format!(
                    "lease_duration must be -1 or between {} and {} seconds, got {}",
                    MIN_LEASE_SECS, MAX_LEASE_SECS, secs
                )));
            }
        };

        let timeout = match config.get_i64("timeout_seconds") {
            None => DEFAULT_TIMEOUT,
            Some(secs) if secs > 0 => Duration::from_secs(secs as u64),
            Some(secs) => {
                return Err(BackendError::configuration(format!(
                    "timeout_seconds must be positive, got {}",
                    secs
                )));
            }
        };

        Ok(Self {
            storage_account_name,
            container_name,
            key,
            workspace_key_prefix,
            snapshot: config.get_bool_or("snapshot", false),
            endpoint: source.string("endpoint", &["ARM_ENDPOINT"]),
            environment,
            credentials,
            lease_duration,
            timeout,
        })
    }
}

/// Credential schemes, as named by their selecting attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    SharedKey,
    SasToken,
    Oidc,
    ManagedIdentity,
    ClientSecret,
    ClientCertificate,
}

/// Schemes the configuration itself selects, ignoring the environment
fn explicit_schemes(config: &BackendConfig) -> Vec<Scheme> {
    let set = |name: &str| config.get_string(name).is_some_and(|v| !v.trim().is_empty());
    let enabled = |name: &str| config.get_bool(name) == Some(true);

    let mut schemes = Vec::new();
    if set("access_key") {
        schemes.push(Scheme::SharedKey);
    }
    if set("sas_token") {
        schemes.push(Scheme::SasToken);
    }
    if enabled("use_oidc") || set("oidc_token") || set("oidc_token_file_path") {
        schemes.push(Scheme::Oidc);
    }
    if enabled("use_msi") {
        schemes.push(Scheme::ManagedIdentity);
    }
    if set("client_secret") {
        schemes.push(Scheme::ClientSecret);
    }
    if set("client_certificate_path") {
        schemes.push(Scheme::ClientCertificate);
    }
    schemes
}

/// Attribute lookup with environment fallback
struct Source<'a, F> {
    config: &'a BackendConfig,
    env: &'a F,
    explicit: Vec<Scheme>,
}

impl<F> Source<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn required(&self, name: &str) -> BackendResult<String> {
        self.config
            .get_string(name)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                BackendError::configuration(format!("Missing required attribute: {}", name))
            })
    }

    fn string(&self, name: &str, vars: &[&str]) -> Option<String> {
        if let Some(value) = self.config.get_string(name) {
            return Some(value.to_string());
        }
        vars.iter()
            .filter_map(|var| (self.env)(var))
            .find(|value| !value.trim().is_empty())
    }

    fn env_allowed(&self, scheme: Scheme) -> bool {
        self.explicit.is_empty() || self.explicit.contains(&scheme)
    }

    /// Secret of `scheme`, read from the environment only when no other
    /// scheme is configured
    fn scheme_string(&self, scheme: Scheme, name: &str, var: &str) -> Option<String> {
        if self.env_allowed(scheme) {
            self.string(name, &[var])
        } else {
            self.config.get_string(name).map(str::to_string)
        }
    }

    fn scheme_flag(&self, scheme: Scheme, name: &str, var: &str) -> BackendResult<bool> {
        if self.env_allowed(scheme) {
            self.flag(name, var)
        } else {
            Ok(self.config.get_bool(name).unwrap_or(false))
        }
    }

    fn flag(&self, name: &str, var: &str) -> BackendResult<bool> {
        if let Some(value) = self.config.get_bool(name) {
            return Ok(value);
        }
        match (self.env)(var).as_deref().map(str::trim) {
            None | Some("") => Ok(false),
            Some(v) if v.eq_ignore_ascii_case("true") || v == "1" => Ok(true),
            Some(v) if v.eq_ignore_ascii_case("false") || v == "0" => Ok(false),
            Some(v) => Err(BackendError::configuration(format!(
                "{} must be true or false, got {:?}",
                var, v
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::CredentialScheme;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn base_config() -> BackendConfig {
        BackendConfig::new("azurerm")
            .with_attribute("storage_account_name", "tfaccount")
            .with_attribute("container_name", "tfcontainer")
            .with_attribute("key", "state")
            .with_attribute("snapshot", false)
            .with_attribute("access_key", "QUNDRVNTX0tFWQ0K")
    }

    #[test]
    fn test_get_attributes() {
        let config = base_config()
            .with_attribute("lease_duration", 30)
            .with_attribute("use_msi", true);
        assert_eq!(config.get_string("container_name"), Some("tfcontainer"));
        assert_eq!(config.get_string("lease_duration"), None);
        assert_eq!(config.get_i64("lease_duration"), Some(30));
        assert_eq!(config.get_bool("use_msi"), Some(true));
        assert!(config.get_bool_or("use_oidc", true));
    }

    #[test]
    fn test_settings_from_config() {
        let settings = AzureSettings::from_config_with_env(&base_config(), no_env).unwrap();
        assert_eq!(settings.storage_account_name, "tfaccount");
        assert_eq!(settings.container_name, "tfcontainer");
        assert_eq!(settings.key, "state");
        assert_eq!(settings.workspace_key_prefix, "env:");
        assert!(!settings.snapshot);
        assert_eq!(settings.environment, CloudEnvironment::PUBLIC);
        assert_eq!(settings.lease_duration, LeaseDuration::default());
        assert_eq!(settings.timeout, DEFAULT_TIMEOUT);
        assert_eq!(
            settings.credentials.access_key.as_deref(),
            Some("QUNDRVNTX0tFWQ0K")
        );
    }

    #[test]
    fn test_missing_required_attribute() {
        let mut config = base_config();
        config.attributes.remove("container_name");
        let err = AzureSettings::from_config_with_env(&config, no_env).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Backend configuration error: Missing required attribute: container_name"
        );
    }

    #[test]
    fn test_environment_fallbacks() {
        let mut config = base_config();
        config.attributes.remove("access_key");
        let env = |name: &str| match name {
            "ARM_CLIENT_ID" => Some("client".to_string()),
            "ARM_CLIENT_SECRET" => Some("secret".to_string()),
            "ARM_TENANT_ID" => Some("tenant".to_string()),
            "ARM_SUBSCRIPTION_ID" => Some("subscription".to_string()),
            "ARM_ENVIRONMENT" => Some("china".to_string()),
            "ARM_USE_MSI" => Some("false".to_string()),
            "ACTIONS_ID_TOKEN_REQUEST_URL" => Some("https://ci.example/token".to_string()),
            _ => None,
        };
        let settings = AzureSettings::from_config_with_env(&config, env).unwrap();
        assert_eq!(settings.environment, CloudEnvironment::CHINA);
        assert_eq!(settings.credentials.client_id.as_deref(), Some("client"));
        assert_eq!(settings.credentials.client_secret.as_deref(), Some("secret"));
        assert!(!settings.credentials.use_msi);
        assert_eq!(
            settings.credentials.oidc_request_url.as_deref(),
            Some("https://ci.example/token")
        );
        assert!(matches!(
            settings.credentials.select().unwrap(),
            CredentialScheme::ServicePrincipalSecret { .. }
        ));
    }

    #[test]
    fn test_ci_token_endpoint_keeps_access_key() {
        let env = |name: &str| match name {
            "ACTIONS_ID_TOKEN_REQUEST_URL" => Some("https://ci.example/token".to_string()),
            "ACTIONS_ID_TOKEN_REQUEST_TOKEN" => Some("ci-token".to_string()),
            _ => None,
        };
        let settings = AzureSettings::from_config_with_env(&base_config(), env).unwrap();
        assert!(matches!(
            settings.credentials.select().unwrap(),
            CredentialScheme::SharedKey { .. }
        ));
    }

    #[test]
    fn test_configured_scheme_ignores_other_secrets_in_environment() {
        let env = |name: &str| match name {
            "ARM_CLIENT_ID" => Some("client".to_string()),
            "ARM_TENANT_ID" => Some("tenant".to_string()),
            "ARM_CLIENT_SECRET" => Some("secret".to_string()),
            "ARM_CLIENT_CERTIFICATE_PATH" => Some("/tmp/client.pfx".to_string()),
            "ARM_SAS_TOKEN" => Some("sv=2020-08-04&sig=abc".to_string()),
            "ARM_USE_MSI" => Some("true".to_string()),
            "ARM_USE_OIDC" => Some("true".to_string()),
            _ => None,
        };
        let settings = AzureSettings::from_config_with_env(&base_config(), env).unwrap();
        let credentials = &settings.credentials;
        assert!(credentials.client_secret.is_none());
        assert!(credentials.client_certificate_path.is_none());
        assert!(credentials.sas_token.is_none());
        assert!(!credentials.use_msi);
        assert!(!credentials.use_oidc);
        // Identifiers still come from the environment
        assert_eq!(credentials.client_id.as_deref(), Some("client"));
        assert!(matches!(
            credentials.select().unwrap(),
            CredentialScheme::SharedKey { .. }
        ));
    }

    #[test]
    fn test_configured_scheme_reads_own_secrets_from_environment() {
        let mut config = base_config().with_attribute("use_oidc", true);
        config.attributes.remove("access_key");
        let env = |name: &str| match name {
            "ARM_CLIENT_ID" => Some("client".to_string()),
            "ARM_TENANT_ID" => Some("tenant".to_string()),
            "ARM_SUBSCRIPTION_ID" => Some("subscription".to_string()),
            "ARM_OIDC_TOKEN" => Some("federated".to_string()),
            "ARM_ACCESS_KEY" => Some("ZnJvbS1lbnY=".to_string()),
            _ => None,
        };
        let settings = AzureSettings::from_config_with_env(&config, env).unwrap();
        assert!(settings.credentials.access_key.is_none());
        assert_eq!(settings.credentials.oidc_token.as_deref(), Some("federated"));
        assert!(matches!(
            settings.credentials.select().unwrap(),
            CredentialScheme::Oidc { .. }
        ));
    }

    #[test]
    fn test_attribute_wins_over_environment() {
        let env = |name: &str| match name {
            "ARM_ACCESS_KEY" => Some("ZnJvbS1lbnY=".to_string()),
            _ => None,
        };
        let settings = AzureSettings::from_config_with_env(&base_config(), env).unwrap();
        assert_eq!(
            settings.credentials.access_key.as_deref(),
            Some("QUNDRVNTX0tFWQ0K")
        );
    }

    #[test]
    fn test_invalid_flag_in_environment() {
        let env = |name: &str| match name {
            "ARM_USE_OIDC" => Some("maybe".to_string()),
            _ => None,
        };
        let mut config = base_config();
        config.attributes.remove("access_key");
        assert!(AzureSettings::from_config_with_env(&config, env).is_err());
    }

    #[test]
    fn test_lease_duration() {
        let config = base_config().with_attribute("lease_duration", -1);
        let settings = AzureSettings::from_config_with_env(&config, no_env).unwrap();
        assert_eq!(settings.lease_duration, LeaseDuration::Infinite);

        let config = base_config().with_attribute("lease_duration", 15);
        let settings = AzureSettings::from_config_with_env(&config, no_env).unwrap();
        assert_eq!(
            settings.lease_duration,
            LeaseDuration::Fixed(Duration::from_secs(15))
        );

        for invalid in [0, 14, 61] {
            let config = base_config().with_attribute("lease_duration", invalid);
            assert!(AzureSettings::from_config_with_env(&config, no_env).is_err());
        }
    }

    #[test]
    fn test_timeout_seconds() {
        let config = base_config().with_attribute("timeout_seconds", 5);
        let settings = AzureSettings::from_config_with_env(&config, no_env).unwrap();
        assert_eq!(settings.timeout, Duration::from_secs(5));

        let config = base_config().with_attribute("timeout_seconds", 0);
        assert!(AzureSettings::from_config_with_env(&config, no_env).is_err());
    }

    #[test]
    fn test_unknown_environment() {
        let config = base_config().with_attribute("environment", "german");
        assert!(matches!(
            AzureSettings::from_config_with_env(&config, no_env),
            Err(BackendError::Configuration(_))
        ));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = base_config().with_attribute("client_secret", "super-secret");
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("QUNDRVNTX0tFWQ0K"));
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("tfcontainer"));
        assert!(rendered.contains("azurerm"));

        let settings = AzureSettings::from_config_with_env(&config, no_env).unwrap();
        let rendered = format!("{:?}", settings);
        assert!(!rendered.contains("QUNDRVNTX0tFWQ0K"));
        assert!(!rendered.contains("super-secret"));
    }
}
