//! Client certificate credentials
//!
//! The certificate file is a PEM bundle holding the certificate and its RSA
//! private key. The key may be PKCS#1, PKCS#8 or password-protected PKCS#8.

use std::fmt;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use pkcs8::EncryptedPrivateKeyInfo;
use serde::Serialize;
use sha1::{Digest, Sha1};

use crate::backend::{BackendError, BackendResult};

/// Lifetime of a signed client assertion
const ASSERTION_LIFETIME_SECS: i64 = 10 * 60;

/// A loaded certificate and the key that signs client assertions
pub struct ClientCertificate {
    key: EncodingKey,
    /// Base64url SHA-1 thumbprint of the DER certificate
    thumbprint: String,
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    aud: &'a str,
    iss: &'a str,
    sub: &'a str,
    jti: String,
    nbf: i64,
    exp: i64,
}

impl ClientCertificate {
    pub fn load(path: &Path, password: Option<&str>) -> BackendResult<Self> {
        let contents = std::fs::read(path).map_err(|e| {
            BackendError::configuration(format!(
                "failed to read client certificate {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_pem(&contents, password).map_err(|e| match e {
            BackendError::Configuration(message) => BackendError::configuration(format!(
                "client certificate {}: {}",
                path.display(),
                message
            )),
            other => other,
        })
    }

    pub fn from_pem(contents: &[u8], password: Option<&str>) -> BackendResult<Self> {
        let blocks = pem::parse_many(contents)
            .map_err(|e| BackendError::configuration(format!("invalid PEM: {}", e)))?;

        let certificate = blocks
            .iter()
            .find(|block| block.tag() == "CERTIFICATE")
            .ok_or_else(|| BackendError::configuration("no CERTIFICATE block found"))?;

        let key_pem = match blocks.iter().find(|block| block.tag().ends_with("PRIVATE KEY")) {
            None => return Err(BackendError::configuration("no private key found")),
            Some(block) if block.tag() == "ENCRYPTED PRIVATE KEY" => {
                let password = password.ok_or_else(|| {
                    BackendError::configuration(
                        "private key is encrypted but client_certificate_password is not set",
                    )
                })?;
                let encrypted =
                    EncryptedPrivateKeyInfo::try_from(block.contents()).map_err(|e| {
                        BackendError::configuration(format!("invalid encrypted key: {}", e))
                    })?;
                let decrypted = encrypted.decrypt(password).map_err(|_| {
                    BackendError::configuration("failed to decrypt private key, check the password")
                })?;
                pem::encode(&pem::Pem::new("PRIVATE KEY", decrypted.as_bytes().to_vec()))
            }
            Some(block) => pem::encode(block),
        };

        let key = EncodingKey::from_rsa_pem(key_pem.as_bytes())
            .map_err(|e| BackendError::configuration(format!("unsupported private key: {}", e)))?;
        let thumbprint = URL_SAFE_NO_PAD.encode(Sha1::digest(certificate.contents()));

        Ok(Self { key, thumbprint })
    }

    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    /// Sign a client assertion JWT for the token endpoint `audience`
    pub fn assertion(&self, audience: &str, client_id: &str) -> BackendResult<String> {
        let mut header = Header::new(Algorithm::RS256);
        header.x5t = Some(self.thumbprint.clone());

        let now = Utc::now().timestamp();
        let claims = AssertionClaims {
            aud: audience,
            iss: client_id,
            sub: client_id,
            jti: uuid::Uuid::new_v4().to_string(),
            nbf: now,
            exp: now + ASSERTION_LIFETIME_SECS,
        };

        jsonwebtoken::encode(&header, &claims, &self.key).map_err(|e| {
            BackendError::authentication(format!("failed to sign client assertion: {}", e))
        })
    }
}

impl fmt::Debug for ClientCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCertificate")
            .field("thumbprint", &self.thumbprint)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const THUMBPRINT: &str = "DK6aL9zXOoAgwevDFia_KtfQrWs";

    fn fixture(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures")
            .join(name)
    }

    #[test]
    fn test_load_plain_key() {
        let cert = ClientCertificate::load(&fixture("client.pem"), None).unwrap();
        assert_eq!(cert.thumbprint(), THUMBPRINT);
    }

    #[test]
    fn test_load_encrypted_key() {
        let cert =
            ClientCertificate::load(&fixture("client-encrypted.pem"), Some("hunter2")).unwrap();
        assert_eq!(cert.thumbprint(), THUMBPRINT);
    }

    #[test]
    fn test_encrypted_key_needs_password() {
        let err = ClientCertificate::load(&fixture("client-encrypted.pem"), None).unwrap_err();
        assert!(err.to_string().contains("client_certificate_password"));

        let err =
            ClientCertificate::load(&fixture("client-encrypted.pem"), Some("wrong")).unwrap_err();
        assert!(err.to_string().contains("decrypt"));
    }

    #[test]
    fn test_missing_file() {
        let err = ClientCertificate::load(Path::new("/nonexistent/sp.pem"), None).unwrap_err();
        assert!(matches!(err, BackendError::Configuration(_)));
    }

    #[test]
    fn test_missing_key_block() {
        let contents = std::fs::read_to_string(fixture("client.pem")).unwrap();
        let end = "-----END CERTIFICATE-----";
        let cert_only = &contents[..contents.find(end).unwrap() + end.len()];
        let err = ClientCertificate::from_pem(cert_only.as_bytes(), None).unwrap_err();
        assert!(err.to_string().contains("no private key"));
    }

    #[test]
    fn test_assertion() {
        let cert = ClientCertificate::load(&fixture("client.pem"), None).unwrap();
        let audience = "https://login.microsoftonline.com/tenant/oauth2/v2.0/token";
        let jwt = cert.assertion(audience, "client").unwrap();

        let header = jsonwebtoken::decode_header(&jwt).unwrap();
        assert_eq!(header.alg, Algorithm::RS256);
        assert_eq!(header.x5t.as_deref(), Some(THUMBPRINT));

        let payload = jwt.split('.').nth(1).unwrap();
        let claims: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).unwrap()).unwrap();
        assert_eq!(claims["aud"], audience);
        assert_eq!(claims["iss"], "client");
        assert_eq!(claims["sub"], "client");
        assert_eq!(
            claims["exp"].as_i64().unwrap() - claims["nbf"].as_i64().unwrap(),
            ASSERTION_LIFETIME_SECS
        );
    }

    #[test]
    fn test_debug_hides_key() {
        let cert = ClientCertificate::load(&fixture("client.pem"), None).unwrap();
        let rendered = format!("{:?}", cert);
        assert!(rendered.contains(THUMBPRINT));
        assert!(!rendered.contains("PRIVATE"));
    }
}
