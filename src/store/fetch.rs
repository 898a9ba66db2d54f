//! Retrieval of handed-off payloads through signed URLs.
//!
//! The remote side of a handoff usually has no read permission on the
//! payload store, so it only ever sees a time-bounded URL. Failures here are
//! kept distinct from store failures: an expired URL can be reissued, a
//! missing record cannot.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::{StatusCode, Url};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::object::MemoryObjectStorage;
use super::StoreError;
use crate::payload::WorkflowPayload;

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("Signed URL expired: {url}")]
    Expired { url: String },
    #[error("Signed URL signature rejected: {url}")]
    InvalidSignature { url: String },
    #[error("Payload not found behind {url}")]
    NotFound { url: String },
    #[error("Network error fetching {url}: {message}")]
    Network { url: String, message: String },
    #[error("Malformed signed URL: {message}")]
    MalformedUrl { message: String },
    #[error("Failed to decode payload: {0}")]
    Decode(#[from] serde_json::Error),
}

impl RetrievalError {
    /// Whether asking the producer for a fresh URL could fix this.
    pub fn is_reissuable(&self) -> bool {
        matches!(
            self,
            RetrievalError::Expired { .. } | RetrievalError::Network { .. }
        )
    }
}

/// Drop the query string so signatures never end up in logs or errors.
pub fn redact_url(url: &str) -> String {
    match url.split_once('?') {
        Some((base, _)) => base.to_string(),
        None => url.to_string(),
    }
}

#[async_trait]
pub trait PayloadFetcher: Send + Sync {
    /// Raw bytes behind a signed URL.
    async fn fetch_bytes(&self, url: &str) -> Result<Bytes, RetrievalError>;

    async fn fetch(&self, url: &str) -> Result<WorkflowPayload, RetrievalError> {
        let bytes = self.fetch_bytes(url).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Resolves `memory://` URLs issued by a [`MemoryObjectStorage`], checking
/// signature and expiry exactly as a real object store would.
#[derive(Debug, Clone)]
pub struct StorageUrlFetcher {
    storage: Arc<MemoryObjectStorage>,
}

impl StorageUrlFetcher {
    pub fn new(storage: Arc<MemoryObjectStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl PayloadFetcher for StorageUrlFetcher {
    async fn fetch_bytes(&self, url: &str) -> Result<Bytes, RetrievalError> {
        let redacted = redact_url(url);
        let parsed = Url::parse(url).map_err(|e| RetrievalError::MalformedUrl {
            message: e.to_string(),
        })?;
        if parsed.scheme() != "memory" {
            return Err(RetrievalError::MalformedUrl {
                message: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }
        if parsed.host_str() != Some(self.storage.bucket()) {
            return Err(RetrievalError::NotFound { url: redacted });
        }

        let path = parsed.path().trim_start_matches('/').to_string();
        let mut expires = None;
        let mut signature = None;
        for (name, value) in parsed.query_pairs() {
            match name.as_ref() {
                "expires" => expires = value.parse::<i64>().ok(),
                "sig" => signature = Some(value.into_owned()),
                _ => {}
            }
        }
        let (Some(expires), Some(signature)) = (expires, signature) else {
            return Err(RetrievalError::MalformedUrl {
                message: "missing expires or sig parameter".to_string(),
            });
        };

        if !self.storage.signer().verify(&path, expires, &signature) {
            warn!(url = %redacted, "Rejected signed URL with bad signature");
            return Err(RetrievalError::InvalidSignature { url: redacted });
        }
        if Utc::now().timestamp() > expires {
            return Err(RetrievalError::Expired { url: redacted });
        }

        match self.storage.read_object(&path) {
            Ok(bytes) => {
                debug!(url = %redacted, size = bytes.len(), "Fetched payload via signed URL");
                Ok(bytes)
            }
            Err(StoreError::ObjectNotFound { .. }) => {
                Err(RetrievalError::NotFound { url: redacted })
            }
            Err(e) => Err(RetrievalError::Network {
                url: redacted,
                message: e.to_string(),
            }),
        }
    }
}

/// Fetches presigned `http(s)://` URLs, e.g. S3 presigned GETs.
#[derive(Debug, Clone)]
pub struct HttpPayloadFetcher {
    client: reqwest::Client,
}

impl HttpPayloadFetcher {
    pub fn new(timeout: Duration) -> Result<Self, RetrievalError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RetrievalError::Network {
                url: String::new(),
                message: format!("failed to build http client: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PayloadFetcher for HttpPayloadFetcher {
    async fn fetch_bytes(&self, url: &str) -> Result<Bytes, RetrievalError> {
        let redacted = redact_url(url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RetrievalError::Network {
                url: redacted.clone(),
                message: e.to_string(),
            })?;

        match response.status() {
            status if status.is_success() => {
                response.bytes().await.map_err(|e| RetrievalError::Network {
                    url: redacted,
                    message: e.to_string(),
                })
            }
            // S3 answers an expired presigned GET with 403 AccessDenied.
            StatusCode::FORBIDDEN => Err(RetrievalError::Expired { url: redacted }),
            StatusCode::NOT_FOUND => Err(RetrievalError::NotFound { url: redacted }),
            status => Err(RetrievalError::Network {
                url: redacted,
                message: format!("unexpected status {status}"),
            }),
        }
    }
}
