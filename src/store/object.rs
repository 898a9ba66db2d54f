//! Object storage backends for the payload store.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use super::StoreError;

type HmacSha256 = Hmac<Sha256>;

/// Minimal object storage surface the payload store needs.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Write an object, replacing any existing one at `path`.
    async fn put(&self, path: &str, data: Bytes) -> Result<(), StoreError>;

    /// Read an object. Missing objects are `StoreError::ObjectNotFound`.
    async fn get(&self, path: &str) -> Result<Bytes, StoreError>;

    /// Time-bounded URL a reader without store credentials can fetch.
    async fn signed_url(&self, path: &str, ttl: Duration) -> Result<String, StoreError>;
}

/// HMAC-SHA256 signer for retrieval URLs.
#[derive(Clone)]
pub struct UrlSigner {
    secret: Vec<u8>,
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner").finish_non_exhaustive()
    }
}

impl UrlSigner {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    fn mac(&self, path: &str, expires: i64) -> Result<HmacSha256, StoreError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|e| StoreError::Signing {
            message: format!("failed to initialize hmac: {e}"),
        })?;
        mac.update(path.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }

    pub fn sign(&self, path: &str, expires: i64) -> Result<String, StoreError> {
        let bytes = self.mac(path, expires)?.finalize().into_bytes();
        Ok(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn verify(&self, path: &str, expires: i64, signature: &str) -> bool {
        let Ok(decoded) = URL_SAFE_NO_PAD.decode(signature) else {
            return false;
        };
        match self.mac(path, expires) {
            Ok(mac) => mac.verify_slice(&decoded).is_ok(),
            Err(_) => false,
        }
    }
}

/// In-memory object storage with real signed `memory://` URLs.
///
/// Thread-safe via `RwLock`. Used by the local topology and tests.
#[derive(Debug)]
pub struct MemoryObjectStorage {
    bucket: String,
    objects: RwLock<HashMap<String, Bytes>>,
    signer: UrlSigner,
}

impl MemoryObjectStorage {
    pub fn new(bucket: impl Into<String>, signing_secret: impl AsRef<[u8]>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(HashMap::new()),
            signer: UrlSigner::new(signing_secret),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn signer(&self) -> &UrlSigner {
        &self.signer
    }

    /// Sign a URL with an explicit expiry instant.
    pub fn presign_until(
        &self,
        path: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<String, StoreError> {
        let expires = expires_at.timestamp();
        let sig = self.signer.sign(path, expires)?;
        Ok(format!(
            "memory://{}/{}?expires={expires}&sig={sig}",
            self.bucket, path
        ))
    }

    pub fn object_count(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub(crate) fn read_object(&self, path: &str) -> Result<Bytes, StoreError> {
        let objects = self.objects.read().map_err(|_| StoreError::Backend {
            message: "lock poisoned".into(),
        })?;
        objects
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::ObjectNotFound {
                path: path.to_string(),
            })
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn put(&self, path: &str, data: Bytes) -> Result<(), StoreError> {
        self.objects
            .write()
            .map_err(|_| StoreError::Backend {
                message: "lock poisoned".into(),
            })?
            .insert(path.to_string(), data);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Bytes, StoreError> {
        self.read_object(path)
    }

    async fn signed_url(&self, path: &str, ttl: Duration) -> Result<String, StoreError> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| StoreError::Signing {
            message: format!("invalid ttl: {e}"),
        })?;
        self.presign_until(path, Utc::now() + ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signer_verifies_own_signature() {
        let signer = UrlSigner::new("secret");
        let sig = signer.sign("payloads/a.json", 1_700_000_000).unwrap();
        assert!(signer.verify("payloads/a.json", 1_700_000_000, &sig));
        assert!(!signer.verify("payloads/b.json", 1_700_000_000, &sig));
        assert!(!signer.verify("payloads/a.json", 1_700_000_001, &sig));
        assert!(!UrlSigner::new("other").verify("payloads/a.json", 1_700_000_000, &sig));
        assert!(!signer.verify("payloads/a.json", 1_700_000_000, "not base64!"));
    }

    #[tokio::test]
    async fn test_memory_storage_overwrites() {
        let storage = MemoryObjectStorage::new("bucket", "secret");
        storage.put("k", Bytes::from_static(b"one")).await.unwrap();
        storage.put("k", Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(storage.get("k").await.unwrap(), Bytes::from_static(b"two"));
        assert_eq!(storage.object_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_storage_missing_object() {
        let storage = MemoryObjectStorage::new("bucket", "secret");
        let err = storage.get("absent").await.unwrap_err();
        assert!(matches!(err, StoreError::ObjectNotFound { .. }));
    }

    #[tokio::test]
    async fn test_signed_url_shape() {
        let storage = MemoryObjectStorage::new("bucket", "secret");
        let url = storage
            .signed_url("payloads/x.json", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(url.starts_with("memory://bucket/payloads/x.json?expires="));
        assert!(url.contains("&sig="));
    }
}
