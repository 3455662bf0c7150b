//! Azure Blob Storage REST client
//!
//! Talks to a single container of a storage account. Every request carries
//! `x-ms-date` and `x-ms-version` and is then authorized by the resolved
//! credential, which for shared key signs the final header set.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use reqwest::header::{
    CONTENT_LENGTH, CONTENT_TYPE, ETAG, HeaderMap, HeaderName, HeaderValue, IF_MATCH,
    IF_NONE_MATCH,
};
use reqwest::{Method, Request, RequestBuilder, Response};
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use super::{
    Blob, BlobClient, BlobError, BlobProperties, BlobResult, LeaseAction, LeaseState, PutBlob,
    WriteCondition,
};
use crate::auth::CredentialHandle;
use crate::lock::Metadata;

/// Storage service API version sent with every request
pub const API_VERSION: &str = "2021-08-06";

const METADATA_PREFIX: &str = "x-ms-meta-";

const CONTENT_MD5: &str = "content-md5";

/// [`BlobClient`] backed by the Azure Blob REST API
pub struct AzureBlobClient {
    http: reqwest::Client,
    base: Url,
    container: String,
    credential: Arc<CredentialHandle>,
}

impl AzureBlobClient {
    /// `base` is the blob service endpoint of the account
    pub fn new(
        http: reqwest::Client,
        base: Url,
        container: impl Into<String>,
        credential: Arc<CredentialHandle>,
    ) -> Self {
        Self {
            http,
            base,
            container: container.into(),
            credential,
        }
    }

    fn container_url(&self) -> BlobResult<Url> {
        self.url_for(&[])
    }

    fn blob_url(&self, key: &str) -> BlobResult<Url> {
        let segments: Vec<&str> = key.split('/').collect();
        self.url_for(&segments)
    }

    fn url_for(&self, segments: &[&str]) -> BlobResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| {
                BlobError::transport(format!("endpoint {} cannot hold a path", self.base))
            })?
            .pop_if_empty()
            .push(&self.container)
            .extend(segments);
        Ok(url)
    }

    /// Stamp service headers and authorize a built request
    async fn prepare(&self, builder: RequestBuilder) -> BlobResult<Request> {
        let mut request = builder
            .build()
            .map_err(|e| BlobError::transport(format!("failed to build request: {}", e)))?;

        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let headers = request.headers_mut();
        headers.insert(
            "x-ms-date",
            HeaderValue::from_str(&date).map_err(|e| BlobError::transport(e.to_string()))?,
        );
        headers.insert("x-ms-version", HeaderValue::from_static(API_VERSION));

        self.credential
            .authorize(&mut request)
            .await
            .map_err(|e| BlobError::new(401, "CredentialUnavailable", e.to_string()))?;
        Ok(request)
    }

    async fn send(&self, builder: RequestBuilder) -> BlobResult<Response> {
        let request = self.prepare(builder).await?;
        // Only the path is logged: SAS credentials live in the query string
        debug!(method = %request.method(), path = request.url().path(), "blob request");

        let response = self
            .http
            .execute(request)
            .await
            .map_err(|e| BlobError::transport(e.to_string()))?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(error_from_response(response).await)
    }

    fn list_page_request(&self, prefix: &str, marker: Option<&str>) -> BlobResult<RequestBuilder> {
        let mut url = self.container_url()?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("restype", "container")
                .append_pair("comp", "list")
                .append_pair("prefix", prefix);
            if let Some(marker) = marker {
                query.append_pair("marker", marker);
            }
        }
        Ok(self.http.get(url))
    }
}

fn with_query(mut url: Url, comp: &str) -> Url {
    url.query_pairs_mut().append_pair("comp", comp);
    url
}

fn metadata_headers(metadata: &Metadata) -> BlobResult<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in metadata {
        let header = format!("{}{}", METADATA_PREFIX, name);
        let header_name = HeaderName::from_bytes(header.as_bytes()).map_err(|_| {
            BlobError::new(
                400,
                "InvalidMetadata",
                format!("invalid metadata name {:?}", name),
            )
        })?;
        // HeaderValue accepts obs-text, the service does not
        if !value.is_ascii() {
            return Err(BlobError::new(
                400,
                "InvalidMetadata",
                format!("metadata {:?} is not ASCII", name),
            ));
        }
        let header_value = HeaderValue::from_str(value).map_err(|_| {
            BlobError::new(400, "InvalidMetadata", format!("invalid metadata value for {:?}", name))
        })?;
        headers.insert(header_name, header_value);
    }
    Ok(headers)
}

fn lease_id_header(builder: RequestBuilder, lease_id: Option<&str>) -> RequestBuilder {
    match lease_id {
        Some(lease_id) => builder.header("x-ms-lease-id", lease_id),
        None => builder,
    }
}

fn lease_headers(builder: RequestBuilder, action: &LeaseAction) -> RequestBuilder {
    let builder = builder.header("x-ms-lease-action", action.name());
    match action {
        LeaseAction::Acquire {
            proposed_id,
            duration,
        } => builder
            .header("x-ms-lease-duration", duration.header_value())
            .header("x-ms-proposed-lease-id", proposed_id),
        LeaseAction::Renew { lease_id } | LeaseAction::Release { lease_id } => {
            builder.header("x-ms-lease-id", lease_id)
        }
        LeaseAction::Break { period } => {
            builder.header("x-ms-lease-break-period", period.as_secs().to_string())
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Properties and metadata from blob response headers
fn parse_properties(headers: &HeaderMap) -> BlobProperties {
    let metadata = headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str().strip_prefix(METADATA_PREFIX)?;
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            Some((name.to_string(), value))
        })
        .collect();

    BlobProperties {
        etag: header(headers, ETAG.as_str()).unwrap_or_default().to_string(),
        content_length: header(headers, CONTENT_LENGTH.as_str())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        content_md5: header(headers, CONTENT_MD5).and_then(|v| STANDARD.decode(v).ok()),
        lease_state: header(headers, "x-ms-lease-state")
            .map(LeaseState::parse)
            .unwrap_or_default(),
        metadata,
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
}

async fn error_from_response(response: Response) -> BlobError {
    let status = response.status();
    let code = header(response.headers(), "x-ms-error-code").map(str::to_string);
    let body = response.text().await.unwrap_or_default();
    let parsed = parse_error_body(&body);

    let message = parsed
        .message
        .map(|m| m.lines().next().unwrap_or_default().to_string())
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
    BlobError {
        status: status.as_u16(),
        code: code.or(parsed.code),
        message,
    }
}

fn parse_error_body(body: &str) -> ErrorBody {
    quick_xml::de::from_str(strip_bom(body)).unwrap_or_default()
}

fn strip_bom(body: &str) -> &str {
    body.trim_start_matches('\u{feff}')
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EnumerationResults {
    #[serde(default)]
    blobs: BlobList,
    #[serde(default)]
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BlobList {
    #[serde(rename = "Blob", default)]
    items: Vec<BlobItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlobItem {
    name: String,
}

/// Blob names of one listing page and the marker of the next page
fn parse_list_page(body: &str) -> BlobResult<(Vec<String>, Option<String>)> {
    let page: EnumerationResults = quick_xml::de::from_str(strip_bom(body))
        .map_err(|e| BlobError::transport(format!("invalid list response: {}", e)))?;
    let names = page.blobs.items.into_iter().map(|item| item.name).collect();
    let marker = page.next_marker.filter(|m| !m.is_empty());
    Ok((names, marker))
}

#[async_trait]
impl BlobClient for AzureBlobClient {
    #[instrument(skip(self), fields(container = %self.container))]
    async fn get_blob(&self, key: &str) -> BlobResult<Blob> {
        let response = self.send(self.http.get(self.blob_url(key)?)).await?;
        let properties = parse_properties(response.headers());
        let data = response
            .bytes()
            .await
            .map_err(|e| BlobError::transport(format!("failed to read blob body: {}", e)))?;
        Ok(Blob { data, properties })
    }

    #[instrument(skip(self), fields(container = %self.container))]
    async fn get_properties(&self, key: &str) -> BlobResult<BlobProperties> {
        let response = self.send(self.http.head(self.blob_url(key)?)).await?;
        Ok(parse_properties(response.headers()))
    }

    #[instrument(skip(self, request), fields(container = %self.container, size = request.data.len()))]
    async fn put_blob(&self, key: &str, request: PutBlob) -> BlobResult<String> {
        let mut builder = self
            .http
            .put(self.blob_url(key)?)
            .header("x-ms-blob-type", "BlockBlob")
            .header(CONTENT_TYPE, request.content_type)
            .header(CONTENT_MD5, STANDARD.encode(request.content_md5))
            .headers(metadata_headers(&request.metadata)?);
        builder = match &request.condition {
            WriteCondition::None => builder,
            WriteCondition::IfMatch(etag) => builder.header(IF_MATCH, etag),
            WriteCondition::IfNotExists => builder.header(IF_NONE_MATCH, "*"),
        };
        builder = lease_id_header(builder, request.lease_id.as_deref());

        let response = self.send(builder.body(request.data)).await?;
        Ok(header(response.headers(), ETAG.as_str())
            .unwrap_or_default()
            .to_string())
    }

    #[instrument(skip(self, metadata), fields(container = %self.container))]
    async fn set_metadata(
        &self,
        key: &str,
        metadata: &Metadata,
        lease_id: Option<&str>,
    ) -> BlobResult<()> {
        let url = with_query(self.blob_url(key)?, "metadata");
        let builder = self.http.put(url).headers(metadata_headers(metadata)?);
        self.send(lease_id_header(builder, lease_id)).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(container = %self.container))]
    async fn delete_blob(&self, key: &str, lease_id: Option<&str>) -> BlobResult<()> {
        let builder = self.http.delete(self.blob_url(key)?);
        self.send(lease_id_header(builder, lease_id)).await?;
        Ok(())
    }

    #[instrument(skip(self, action), fields(container = %self.container, action = action.name()))]
    async fn lease(&self, key: &str, action: LeaseAction) -> BlobResult<()> {
        let url = with_query(self.blob_url(key)?, "lease");
        let builder = lease_headers(self.http.request(Method::PUT, url), &action);
        self.send(builder).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(container = %self.container))]
    async fn list_blobs(&self, prefix: &str) -> BlobResult<Vec<String>> {
        let mut names = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let request = self.list_page_request(prefix, marker.as_deref())?;
            let body = self
                .send(request)
                .await?
                .text()
                .await
                .map_err(|e| BlobError::transport(format!("failed to read list response: {}", e)))?;
            let (page, next) = parse_list_page(&body)?;
            names.extend(page);
            match next {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        Ok(names)
    }
}
