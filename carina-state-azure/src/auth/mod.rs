//! Credential resolution
//!
//! A configuration may describe exactly one of six authentication schemes.
//! [`CredentialConfig::select`] picks the scheme without touching the network
//! and rejects ambiguous or incomplete configurations.
//! [`CredentialHandle::resolve`] then turns the scheme into a handle that can
//! authorize storage requests, acquiring a first token for the schemes backed
//! by the identity provider.

mod certificate;
mod sas;
mod shared_key;
mod token;

pub use certificate::ClientCertificate;
pub use sas::SasCredential;
pub use shared_key::SharedKeyCredential;
pub use token::{OidcAssertion, TokenCredential, TokenSource};

use std::fmt;
use std::path::PathBuf;

use reqwest::header::{AUTHORIZATION, HeaderValue};
use tracing::debug;

use crate::backend::{BackendError, BackendResult};
use crate::deadline::RequestDeadline;
use crate::environment::CloudEnvironment;

/// Raw credential fields of a backend configuration
#[derive(Clone, Default)]
pub struct CredentialConfig {
    pub access_key: Option<String>,
    pub sas_token: Option<String>,
    pub use_oidc: bool,
    pub oidc_token: Option<String>,
    pub oidc_token_file_path: Option<PathBuf>,
    pub oidc_request_url: Option<String>,
    pub oidc_request_token: Option<String>,
    pub use_msi: bool,
    pub msi_endpoint: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub client_certificate_path: Option<PathBuf>,
    pub client_certificate_password: Option<String>,
    pub tenant_id: Option<String>,
    pub subscription_id: Option<String>,
}

impl fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn redacted<T>(value: &Option<T>) -> &'static str {
            if value.is_some() { "<redacted>" } else { "<unset>" }
        }
        f.debug_struct("CredentialConfig")
            .field("access_key", &redacted(&self.access_key))
            .field("sas_token", &redacted(&self.sas_token))
            .field("use_oidc", &self.use_oidc)
            .field("oidc_token", &redacted(&self.oidc_token))
            .field("oidc_token_file_path", &self.oidc_token_file_path)
            .field("oidc_request_url", &self.oidc_request_url)
            .field("oidc_request_token", &redacted(&self.oidc_request_token))
            .field("use_msi", &self.use_msi)
            .field("msi_endpoint", &self.msi_endpoint)
            .field("client_id", &self.client_id)
            .field("client_secret", &redacted(&self.client_secret))
            .field("client_certificate_path", &self.client_certificate_path)
            .field(
                "client_certificate_password",
                &redacted(&self.client_certificate_password),
            )
            .field("tenant_id", &self.tenant_id)
            .field("subscription_id", &self.subscription_id)
            .finish()
    }
}

/// The authentication scheme selected from a configuration
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialScheme {
    SharedKey {
        access_key: String,
    },
    SasToken {
        token: String,
    },
    Oidc {
        tenant_id: String,
        client_id: String,
        subscription_id: String,
        assertion: OidcAssertion,
    },
    ManagedIdentity {
        tenant_id: String,
        subscription_id: String,
        client_id: Option<String>,
        endpoint: Option<String>,
    },
    ServicePrincipalSecret {
        tenant_id: String,
        client_id: String,
        subscription_id: String,
        client_secret: String,
    },
    ServicePrincipalCertificate {
        tenant_id: String,
        client_id: String,
        subscription_id: String,
        path: PathBuf,
        password: Option<String>,
    },
}

impl CredentialScheme {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SharedKey { .. } => "shared key",
            Self::SasToken { .. } => "SAS token",
            Self::Oidc { .. } => "OIDC",
            Self::ManagedIdentity { .. } => "managed identity",
            Self::ServicePrincipalSecret { .. } => "service principal (client secret)",
            Self::ServicePrincipalCertificate { .. } => "service principal (client certificate)",
        }
    }

    /// Tenant of the identity, for schemes that authenticate against one
    pub fn tenant_id(&self) -> Option<&str> {
        match self {
            Self::SharedKey { .. } | Self::SasToken { .. } => None,
            Self::Oidc { tenant_id, .. }
            | Self::ManagedIdentity { tenant_id, .. }
            | Self::ServicePrincipalSecret { tenant_id, .. }
            | Self::ServicePrincipalCertificate { tenant_id, .. } => Some(tenant_id),
        }
    }

    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            Self::SharedKey { .. } | Self::SasToken { .. } => None,
            Self::Oidc {
                subscription_id, ..
            }
            | Self::ManagedIdentity {
                subscription_id, ..
            }
            | Self::ServicePrincipalSecret {
                subscription_id, ..
            }
            | Self::ServicePrincipalCertificate {
                subscription_id, ..
            } => Some(subscription_id),
        }
    }
}

impl fmt::Debug for CredentialScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CredentialScheme({})", self.name())
    }
}

impl CredentialConfig {
    /// Pick the single configured authentication scheme
    ///
    /// Configuring more than one scheme is an error rather than a silent
    /// precedence choice, as is a scheme with missing fields.
    pub fn select(&self) -> BackendResult<CredentialScheme> {
        // A token exchange endpoint alone does not select OIDC: CI runners
        // export one for every job
        let oidc_configured =
            self.use_oidc || present(&self.oidc_token) || self.oidc_token_file_path.is_some();

        let mut configured = Vec::new();
        if present(&self.access_key) {
            configured.push("access_key");
        }
        if present(&self.sas_token) {
            configured.push("sas_token");
        }
        if oidc_configured {
            configured.push("use_oidc");
        }
        if self.use_msi {
            configured.push("use_msi");
        }
        if present(&self.client_secret) {
            configured.push("client_secret");
        }
        if self.client_certificate_path.is_some() {
            configured.push("client_certificate_path");
        }

        if configured.len() > 1 {
            return Err(BackendError::configuration(format!(
                "multiple credential schemes configured ({}), configure exactly one",
                configured.join(", ")
            )));
        }

        if present(&self.client_certificate_password) && self.client_certificate_path.is_none() {
            return Err(BackendError::configuration(
                "client_certificate_password is set but client_certificate_path is missing",
            ));
        }

        let Some(scheme) = configured.first() else {
            if present(&self.client_id) || present(&self.tenant_id) {
                return Err(BackendError::configuration(
                    "incomplete service principal: client_id/tenant_id are set but no credential \
                     material was given, set client_secret or client_certificate_path \
                     (or use_oidc / use_msi)",
                ));
            }
            return Err(BackendError::configuration(
                "no credentials configured, set one of: access_key, sas_token, use_oidc, \
                 use_msi, client_secret, client_certificate_path",
            ));
        };

        match *scheme {
            "access_key" => Ok(CredentialScheme::SharedKey {
                access_key: value(&self.access_key),
            }),
            "sas_token" => Ok(CredentialScheme::SasToken {
                token: value(&self.sas_token),
            }),
            "use_oidc" => {
                let assertion = self.oidc_assertion();
                let mut missing = self.missing_identifiers(true);
                if assertion.is_none() {
                    missing.push("oidc_token, oidc_token_file_path or oidc_request_url + oidc_request_token");
                }
                match assertion {
                    Some(assertion) if missing.is_empty() => Ok(CredentialScheme::Oidc {
                        tenant_id: value(&self.tenant_id),
                        client_id: value(&self.client_id),
                        subscription_id: value(&self.subscription_id),
                        assertion,
                    }),
                    _ => Err(missing_fields("OIDC", &missing)),
                }
            }
            "use_msi" => {
                require("managed identity", &self.missing_identifiers(false))?;
                Ok(CredentialScheme::ManagedIdentity {
                    tenant_id: value(&self.tenant_id),
                    subscription_id: value(&self.subscription_id),
                    client_id: non_empty(&self.client_id),
                    endpoint: non_empty(&self.msi_endpoint),
                })
            }
            "client_secret" => {
                require("client secret authentication", &self.missing_identifiers(true))?;
                Ok(CredentialScheme::ServicePrincipalSecret {
                    tenant_id: value(&self.tenant_id),
                    client_id: value(&self.client_id),
                    subscription_id: value(&self.subscription_id),
                    client_secret: value(&self.client_secret),
                })
            }
            _ => {
                require(
                    "client certificate authentication",
                    &self.missing_identifiers(true),
                )?;
                Ok(CredentialScheme::ServicePrincipalCertificate {
                    tenant_id: value(&self.tenant_id),
                    client_id: value(&self.client_id),
                    subscription_id: value(&self.subscription_id),
                    path: self.client_certificate_path.clone().unwrap_or_default(),
                    password: non_empty(&self.client_certificate_password),
                })
            }
        }
    }

    fn missing_identifiers(&self, needs_client: bool) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !present(&self.tenant_id) {
            missing.push("tenant_id");
        }
        if needs_client && !present(&self.client_id) {
            missing.push("client_id");
        }
        if !present(&self.subscription_id) {
            missing.push("subscription_id");
        }
        missing
    }

    fn oidc_assertion(&self) -> Option<OidcAssertion> {
        if let Some(token) = non_empty(&self.oidc_token) {
            return Some(OidcAssertion::Token(token));
        }
        if let Some(path) = &self.oidc_token_file_path {
            return Some(OidcAssertion::File(path.clone()));
        }
        match (non_empty(&self.oidc_request_url), non_empty(&self.oidc_request_token)) {
            (Some(url), Some(token)) => Some(OidcAssertion::Request { url, token }),
            _ => None,
        }
    }
}

fn present(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn value(value: &Option<String>) -> String {
    non_empty(value).unwrap_or_default()
}

fn require(scheme: &str, missing: &[&str]) -> BackendResult<()> {
    if missing.is_empty() {
        return Ok(());
    }
    Err(missing_fields(scheme, missing))
}

fn missing_fields(scheme: &str, missing: &[&str]) -> BackendError {
    BackendError::configuration(format!("{} requires: {}", scheme, missing.join(", ")))
}

/// Resolved authentication material for one backend instance
///
/// Shared read-only by every storage request of the backend. The material is
/// never logged: `Debug` only names the scheme.
pub enum CredentialHandle {
    SharedKey(SharedKeyCredential),
    SasToken(SasCredential),
    OidcToken(TokenCredential),
    ManagedIdentity(TokenCredential),
    ServicePrincipalSecret(TokenCredential),
    ServicePrincipalCertificate(TokenCredential),
}

impl CredentialHandle {
    /// Turn a selected scheme into a usable handle
    ///
    /// Schemes backed by the identity provider acquire a token here, so bad
    /// credentials surface as [`BackendError::Authentication`] before any
    /// state operation. The round trip is bounded by `deadline` and failures
    /// are not retried.
    pub async fn resolve(
        scheme: CredentialScheme,
        account: &str,
        environment: &CloudEnvironment,
        http: &reqwest::Client,
        deadline: RequestDeadline,
    ) -> BackendResult<Self> {
        debug!(
            scheme = scheme.name(),
            account,
            environment = environment.name,
            tenant = ?scheme.tenant_id(),
            subscription = ?scheme.subscription_id(),
            "resolving credentials"
        );

        let handle = match scheme {
            CredentialScheme::SharedKey { access_key } => {
                return Ok(Self::SharedKey(SharedKeyCredential::new(account, &access_key)?));
            }
            CredentialScheme::SasToken { token } => {
                return Ok(Self::SasToken(SasCredential::parse(&token)?));
            }
            CredentialScheme::Oidc {
                tenant_id,
                client_id,
                assertion,
                ..
            } => Self::OidcToken(TokenCredential::new(
                TokenSource::Oidc {
                    tenant_id,
                    client_id,
                    assertion,
                },
                environment.clone(),
                http.clone(),
            )),
            CredentialScheme::ManagedIdentity {
                client_id,
                endpoint,
                ..
            } => Self::ManagedIdentity(TokenCredential::new(
                TokenSource::ManagedIdentity { client_id, endpoint },
                environment.clone(),
                http.clone(),
            )),
            CredentialScheme::ServicePrincipalSecret {
                tenant_id,
                client_id,
                client_secret,
                ..
            } => Self::ServicePrincipalSecret(TokenCredential::new(
                TokenSource::ClientSecret {
                    tenant_id,
                    client_id,
                    client_secret,
                },
                environment.clone(),
                http.clone(),
            )),
            CredentialScheme::ServicePrincipalCertificate {
                tenant_id,
                client_id,
                path,
                password,
                ..
            } => {
                let certificate = ClientCertificate::load(&path, password.as_deref())?;
                Self::ServicePrincipalCertificate(TokenCredential::new(
                    TokenSource::ClientCertificate {
                        tenant_id,
                        client_id,
                        certificate,
                    },
                    environment.clone(),
                    http.clone(),
                ))
            }
        };

        if let Some(credential) = handle.token_credential() {
            deadline
                .run("acquire token", account, credential.token())
                .await??;
        }
        Ok(handle)
    }

    pub fn scheme_name(&self) -> &'static str {
        match self {
            Self::SharedKey(_) => "shared key",
            Self::SasToken(_) => "SAS token",
            Self::OidcToken(_) => "OIDC",
            Self::ManagedIdentity(_) => "managed identity",
            Self::ServicePrincipalSecret(_) => "service principal (client secret)",
            Self::ServicePrincipalCertificate(_) => "service principal (client certificate)",
        }
    }

    fn token_credential(&self) -> Option<&TokenCredential> {
        match self {
            Self::SharedKey(_) | Self::SasToken(_) => None,
            Self::OidcToken(c)
            | Self::ManagedIdentity(c)
            | Self::ServicePrincipalSecret(c)
            | Self::ServicePrincipalCertificate(c) => Some(c),
        }
    }

    /// Add authentication to a fully built storage request
    ///
    /// Must run after every other header has been set, since shared key
    /// signatures cover the headers.
    pub async fn authorize(&self, request: &mut reqwest::Request) -> BackendResult<()> {
        match self {
            Self::SharedKey(credential) => credential.sign(request),
            Self::SasToken(credential) => {
                credential.apply(request.url_mut());
                Ok(())
            }
            Self::OidcToken(credential)
            | Self::ManagedIdentity(credential)
            | Self::ServicePrincipalSecret(credential)
            | Self::ServicePrincipalCertificate(credential) => {
                let token = credential.token().await?;
                let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
                    BackendError::authentication("identity provider returned a malformed token")
                })?;
                request.headers_mut().insert(AUTHORIZATION, value);
                Ok(())
            }
        }
    }
}

impl fmt::Debug for CredentialHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CredentialHandle({})", self.scheme_name())
    }
}
