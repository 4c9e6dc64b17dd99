//! Blob storage access

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, header};
use tracing::debug;

use super::{BlobProperties, BlobRef, FetchError};
use crate::credential::TokenCredential;

/// Scope for blob data-plane tokens
const STORAGE_SCOPE: &str = "https://storage.azure.com/.default";

/// Blob service REST API version
const STORAGE_API_VERSION: &str = "2021-08-06";

/// Remote blob store contract
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Metadata of a blob; always a network call
    async fn get_metadata(&self, blob: &BlobRef) -> Result<BlobProperties, FetchError>;

    /// Full content of a blob
    async fn download(&self, blob: &BlobRef) -> Result<Bytes, FetchError>;
}

/// Blob store over the storage REST API with bearer-token auth
pub struct AzureBlobStore {
    client: Client,
    credential: Arc<dyn TokenCredential>,
}

impl std::fmt::Debug for AzureBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureBlobStore").finish_non_exhaustive()
    }
}

impl AzureBlobStore {
    /// Create a store authenticating with `credential`
    #[must_use]
    pub fn new(client: Client, credential: Arc<dyn TokenCredential>) -> Self {
        Self { client, credential }
    }

    async fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, FetchError> {
        let token = self.credential.token(STORAGE_SCOPE).await?;
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        Ok(request
            .bearer_auth(token)
            .header("x-ms-date", date)
            .header("x-ms-version", STORAGE_API_VERSION))
    }

    async fn send(&self, request: RequestBuilder, url: &str) -> Result<Response, FetchError> {
        let response = self
            .authorized(request)
            .await?
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(FetchError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            })
        }
    }
}

#[async_trait]
impl BlobStore for AzureBlobStore {
    async fn get_metadata(&self, blob: &BlobRef) -> Result<BlobProperties, FetchError> {
        let url = blob.url()?;
        let response = self.send(self.client.head(url.clone()), url.as_str()).await?;
        let headers = response.headers();

        let last_modified = headers
            .get(header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| FetchError::InvalidMetadata("missing Last-Modified".to_string()))?;
        let last_modified = parse_http_date(last_modified)?;

        let content_length = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let etag = headers
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        debug!(blob = %blob, %last_modified, "Fetched blob metadata");
        Ok(BlobProperties {
            last_modified,
            content_length,
            etag,
        })
    }

    async fn download(&self, blob: &BlobRef) -> Result<Bytes, FetchError> {
        let url = blob.url()?;
        let response = self.send(self.client.get(url.clone()), url.as_str()).await?;
        let data = response
            .bytes()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;
        debug!(blob = %blob, size = data.len(), "Downloaded blob");
        Ok(data)
    }
}

/// Parse an HTTP date (`Tue, 15 Nov 1994 08:12:31 GMT`)
pub(crate) fn parse_http_date(value: &str) -> Result<DateTime<Utc>, FetchError> {
    DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| FetchError::InvalidMetadata(format!("bad Last-Modified '{value}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_http_dates() {
        let parsed = parse_http_date("Tue, 15 Nov 1994 08:12:31 GMT").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(1994, 11, 15, 8, 12, 31).unwrap());
    }

    #[test]
    fn rejects_garbage_dates() {
        assert!(matches!(
            parse_http_date("yesterday"),
            Err(FetchError::InvalidMetadata(_))
        ));
    }
}
