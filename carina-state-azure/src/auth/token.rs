//! Bearer tokens from the identity provider
//!
//! Covers the client secret, client certificate, OIDC federation and managed
//! identity flows. Tokens are cached per credential and refreshed shortly
//! before they expire.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use super::certificate::ClientCertificate;
use crate::backend::{BackendError, BackendResult};
use crate::environment::{CloudEnvironment, STORAGE_RESOURCE, STORAGE_SCOPE};

const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";
const OIDC_AUDIENCE: &str = "api://AzureADTokenExchange";
const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_API_VERSION: &str = "2018-02-01";

/// Lifetime assumed when the provider omits `expires_in`
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Tokens this close to expiry are refreshed before use
const REFRESH_MARGIN_SECS: i64 = 5 * 60;

/// Where the federated identity token for OIDC comes from
#[derive(Clone, PartialEq, Eq)]
pub enum OidcAssertion {
    /// Token given inline
    Token(String),
    /// File holding the token, re-read on every refresh
    File(PathBuf),
    /// Token exchange endpoint of a CI provider
    Request { url: String, token: String },
}

impl fmt::Debug for OidcAssertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token(_) => f.write_str("Token(<redacted>)"),
            Self::File(path) => f.debug_tuple("File").field(path).finish(),
            Self::Request { url, .. } => f
                .debug_struct("Request")
                .field("url", url)
                .field("token", &"<redacted>")
                .finish(),
        }
    }
}

impl OidcAssertion {
    async fn resolve(&self, http: &reqwest::Client) -> BackendResult<String> {
        let token = match self {
            Self::Token(token) => token.clone(),
            Self::File(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
                BackendError::authentication(format!(
                    "failed to read OIDC token file {}: {}",
                    path.display(),
                    e
                ))
            })?,
            Self::Request { url, token } => {
                #[derive(Deserialize)]
                struct RequestTokenResponse {
                    value: String,
                }

                let response = http
                    .get(url)
                    .query(&[("audience", OIDC_AUDIENCE)])
                    .bearer_auth(token)
                    .send()
                    .await
                    .map_err(|e| {
                        BackendError::authentication(format!("OIDC token request failed: {}", e))
                    })?;
                let status = response.status();
                if !status.is_success() {
                    return Err(BackendError::authentication(format!(
                        "OIDC token request returned HTTP {}",
                        status.as_u16()
                    )));
                }
                let body: RequestTokenResponse = response.json().await.map_err(|e| {
                    BackendError::authentication(format!("invalid OIDC token response: {}", e))
                })?;
                body.value
            }
        };

        let token = token.trim().to_string();
        if token.is_empty() {
            return Err(BackendError::authentication("OIDC token is empty"));
        }
        Ok(token)
    }
}

/// Flow used to obtain a storage token
pub enum TokenSource {
    ClientSecret {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
    ClientCertificate {
        tenant_id: String,
        client_id: String,
        certificate: ClientCertificate,
    },
    Oidc {
        tenant_id: String,
        client_id: String,
        assertion: OidcAssertion,
    },
    ManagedIdentity {
        client_id: Option<String>,
        endpoint: Option<String>,
    },
}

impl TokenSource {
    fn name(&self) -> &'static str {
        match self {
            Self::ClientSecret { .. } => "client secret",
            Self::ClientCertificate { .. } => "client certificate",
            Self::Oidc { .. } => "OIDC",
            Self::ManagedIdentity { .. } => "managed identity",
        }
    }
}

#[derive(Clone)]
struct AccessToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(REFRESH_MARGIN_SECS) < self.expires_at
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
}

impl TokenResponse {
    /// `expires_in` is a number from the identity provider, a string from IMDS
    fn expires_in_secs(&self) -> i64 {
        match &self.expires_in {
            Some(serde_json::Value::Number(n)) => n.as_i64(),
            Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
        .unwrap_or(DEFAULT_EXPIRES_IN_SECS)
    }
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: Option<String>,
    error_description: Option<String>,
}

/// A token-based credential with a refreshing cache
pub struct TokenCredential {
    source: TokenSource,
    environment: CloudEnvironment,
    http: reqwest::Client,
    cache: Mutex<Option<AccessToken>>,
}

impl TokenCredential {
    pub fn new(source: TokenSource, environment: CloudEnvironment, http: reqwest::Client) -> Self {
        Self {
            source,
            environment,
            http,
            cache: Mutex::new(None),
        }
    }

    /// A storage access token, fetched again when close to expiry
    pub async fn token(&self) -> BackendResult<String> {
        let mut cache = self.cache.lock().await;
        if let Some(token) = cache.as_ref().filter(|t| t.is_fresh(Utc::now())) {
            return Ok(token.token.clone());
        }

        debug!(source = self.source.name(), "requesting storage access token");
        let response = self.request().await?;
        let expires_at = Utc::now() + Duration::seconds(response.expires_in_secs());
        let token = response.access_token;
        *cache = Some(AccessToken {
            token: token.clone(),
            expires_at,
        });
        Ok(token)
    }

    async fn request(&self) -> BackendResult<TokenResponse> {
        let request = match &self.source {
            TokenSource::ClientSecret {
                tenant_id,
                client_id,
                client_secret,
            } => self.http.post(self.environment.token_endpoint(tenant_id)).form(&[
                ("grant_type", "client_credentials"),
                ("scope", STORAGE_SCOPE),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
            ]),
            TokenSource::ClientCertificate {
                tenant_id,
                client_id,
                certificate,
            } => {
                let endpoint = self.environment.token_endpoint(tenant_id);
                let assertion = certificate.assertion(&endpoint, client_id)?;
                self.client_assertion_request(endpoint, client_id, &assertion)
            }
            TokenSource::Oidc {
                tenant_id,
                client_id,
                assertion,
            } => {
                let assertion = assertion.resolve(&self.http).await?;
                let endpoint = self.environment.token_endpoint(tenant_id);
                self.client_assertion_request(endpoint, client_id, &assertion)
            }
            TokenSource::ManagedIdentity {
                client_id,
                endpoint,
            } => {
                let mut query = vec![
                    ("api-version", IMDS_API_VERSION),
                    ("resource", STORAGE_RESOURCE),
                ];
                if let Some(client_id) = client_id {
                    query.push(("client_id", client_id.as_str()));
                }
                self.http
                    .get(endpoint.as_deref().unwrap_or(IMDS_ENDPOINT))
                    .header("Metadata", "true")
                    .query(&query)
            }
        };

        let response = request.send().await.map_err(|e| {
            BackendError::authentication(format!(
                "{} token request failed: {}",
                self.source.name(),
                e
            ))
        })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| {
            BackendError::authentication(format!("failed to read token response: {}", e))
        })?;
        if !status.is_success() {
            return Err(BackendError::authentication(format!(
                "{} token request returned HTTP {}{}",
                self.source.name(),
                status.as_u16(),
                describe_error(&body)
            )));
        }
        serde_json::from_slice(&body)
            .map_err(|e| BackendError::authentication(format!("invalid token response: {}", e)))
    }

    fn client_assertion_request(
        &self,
        endpoint: String,
        client_id: &str,
        assertion: &str,
    ) -> reqwest::RequestBuilder {
        self.http.post(endpoint).form(&[
            ("grant_type", "client_credentials"),
            ("scope", STORAGE_SCOPE),
            ("client_id", client_id),
            ("client_assertion_type", CLIENT_ASSERTION_TYPE),
            ("client_assertion", assertion),
        ])
    }
}

fn describe_error(body: &[u8]) -> String {
    match serde_json::from_slice::<TokenErrorResponse>(body) {
        Ok(TokenErrorResponse {
            error: Some(error),
            error_description,
        }) => match error_description {
            Some(description) => format!(": {}: {}", error, description),
            None => format!(": {}", error),
        },
        _ => String::new(),
    }
}

impl fmt::Debug for TokenCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCredential")
            .field("source", &self.source.name())
            .field("environment", &self.environment.name)
            .finish_non_exhaustive()
    }
}
