//! Storage account shared key request signing

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use sha2::Sha256;
use url::Url;

use crate::backend::{BackendError, BackendResult};

type HmacSha256 = Hmac<Sha256>;

/// Standard headers covered by the signature, in signing order
const SIGNED_HEADERS: [&str; 11] = [
    "content-encoding",
    "content-language",
    "content-length",
    "content-md5",
    "content-type",
    "date",
    "if-modified-since",
    "if-match",
    "if-none-match",
    "if-unmodified-since",
    "range",
];

/// Account name and decoded account key
pub struct SharedKeyCredential {
    account: String,
    key: Vec<u8>,
}

impl SharedKeyCredential {
    pub fn new(account: &str, access_key: &str) -> BackendResult<Self> {
        let key = STANDARD
            .decode(access_key.trim())
            .map_err(|_| BackendError::configuration("access_key must be base64 encoded"))?;
        Ok(Self {
            account: account.to_string(),
            key,
        })
    }

    /// Add the `Authorization: SharedKey` header
    pub fn sign(&self, request: &mut reqwest::Request) -> BackendResult<()> {
        let content_length = request
            .body()
            .and_then(|body| body.as_bytes())
            .map(|bytes| bytes.len())
            .unwrap_or(0);
        let string_to_sign = self.string_to_sign(
            request.method().as_str(),
            request.url(),
            request.headers(),
            content_length,
        );

        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| BackendError::configuration(format!("invalid access_key: {}", e)))?;
        mac.update(string_to_sign.as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());

        let value = HeaderValue::from_str(&format!("SharedKey {}:{}", self.account, signature))
            .map_err(|_| {
                BackendError::configuration("storage account name is not valid header text")
            })?;
        request.headers_mut().insert(AUTHORIZATION, value);
        Ok(())
    }

    fn string_to_sign(
        &self,
        method: &str,
        url: &Url,
        headers: &HeaderMap,
        content_length: usize,
    ) -> String {
        let mut out = String::new();
        out.push_str(method);
        out.push('\n');

        for name in SIGNED_HEADERS {
            let value = if name == "content-length" {
                // Zero length is signed as an empty string
                if content_length == 0 {
                    String::new()
                } else {
                    content_length.to_string()
                }
            } else {
                header_str(headers, name).to_string()
            };
            out.push_str(&value);
            out.push('\n');
        }

        out.push_str(&canonicalized_headers(headers));
        out.push_str(&canonicalized_resource(&self.account, url));
        out
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

fn canonicalized_headers(headers: &HeaderMap) -> String {
    let mut ms_headers: BTreeMap<&str, &str> = BTreeMap::new();
    for (name, value) in headers {
        let name = name.as_str();
        if name.starts_with("x-ms-") {
            ms_headers.insert(name, value.to_str().unwrap_or("").trim());
        }
    }
    ms_headers
        .into_iter()
        .map(|(name, value)| format!("{}:{}\n", name, value))
        .collect()
}

fn canonicalized_resource(account: &str, url: &Url) -> String {
    let mut out = format!("/{}{}", account, url.path());

    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in url.query_pairs() {
        params
            .entry(name.to_lowercase())
            .or_default()
            .push(value.into_owned());
    }
    for (name, mut values) in params {
        values.sort();
        out.push('\n');
        out.push_str(&name);
        out.push(':');
        out.push_str(&values.join(","));
    }
    out
}
