//! Remote data files
//!
//! Data files live in cloud blob storage. [`BlobCache`] sits in front of a
//! [`BlobStore`] and serves the local copy for as long as the remote object
//! has not been modified since it was downloaded.

mod blob_cache;
mod blob_store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::credential::CredentialError;

pub use blob_cache::{BlobCache, BlobCacheStats};
pub use blob_store::{AzureBlobStore, BlobStore};

/// Remote metadata or content fetch failures
#[derive(Debug, Error)]
pub enum FetchError {
    /// The store answered with a non-success status
    #[error("Blob request for {url} failed with HTTP {status}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Requested URL
        url: String,
    },

    /// The store could not be reached
    #[error("Blob store unreachable: {0}")]
    Network(String),

    /// The store's response lacked required metadata
    #[error("Invalid blob metadata: {0}")]
    InvalidMetadata(String),

    /// The blob reference does not form a valid URL
    #[error("Invalid blob location: {0}")]
    InvalidLocation(String),

    /// No token could be obtained for the store
    #[error(transparent)]
    Credential(#[from] CredentialError),
}

/// Location of one blob
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobRef {
    /// Storage account URL, e.g. `https://acct.blob.core.windows.net`
    pub account_url: String,
    /// Container name
    pub container: String,
    /// Blob name, may contain `/`
    pub filename: String,
}

impl BlobRef {
    /// Create a reference
    #[must_use]
    pub fn new(account_url: impl Into<String>, container: &str, filename: &str) -> Self {
        Self {
            account_url: account_url.into(),
            container: container.to_string(),
            filename: filename.to_string(),
        }
    }

    /// Cache key covering all three parts
    #[must_use]
    pub fn cache_key(&self) -> String {
        format!("{}_{}_{}", self.account_url, self.container, self.filename)
    }

    /// Blob URL with each path segment percent-encoded
    pub fn url(&self) -> Result<Url, FetchError> {
        let mut url = Url::parse(&self.account_url)
            .map_err(|e| FetchError::InvalidLocation(format!("{}: {e}", self.account_url)))?;
        url.path_segments_mut()
            .map_err(|()| FetchError::InvalidLocation(self.account_url.clone()))?
            .pop_if_empty()
            .push(&self.container)
            .extend(self.filename.split('/'));
        Ok(url)
    }
}

impl std::fmt::Display for BlobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.container, self.filename)
    }
}

/// Remote blob metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobProperties {
    /// Last modification time
    pub last_modified: DateTime<Utc>,
    /// Size in bytes
    #[serde(default)]
    pub content_length: Option<u64>,
    /// Entity tag
    #[serde(default)]
    pub etag: Option<String>,
}

impl BlobProperties {
    /// Properties with only a modification time
    #[must_use]
    pub fn modified_at(last_modified: DateTime<Utc>) -> Self {
        Self {
            last_modified,
            content_length: None,
            etag: None,
        }
    }
}
