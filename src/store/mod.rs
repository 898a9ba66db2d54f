//! Task payload store
//!
//! Moves workflow state out of the orchestration channel. Records are
//! addressed by `(taskType, key)` where the key is the data-source run id or
//! the asset id depending on the step. Writes are last-write-wins; each key
//! belongs to exactly one logical step instance so no CAS is needed.

pub mod fetch;
pub mod object;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::payload::{TaskType, WorkflowPayload};

pub use fetch::{redact_url, HttpPayloadFetcher, PayloadFetcher, RetrievalError, StorageUrlFetcher};
pub use object::{MemoryObjectStorage, ObjectStorage, UrlSigner};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("No {task_type} record stored under key '{key}'")]
    NotFound { task_type: String, key: String },
    #[error("Object not found: {path}")]
    ObjectNotFound { path: String },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Storage backend error: {message}")]
    Backend { message: String },
    #[error("URL signing error: {message}")]
    Signing { message: String },
}

/// Metadata describing one stored handoff record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task_type: TaskType,
    pub key: String,
    pub path: String,
    pub size: usize,
    pub stored_at: DateTime<Utc>,
}

/// Payload store over any [`ObjectStorage`] backend.
#[derive(Clone)]
pub struct PayloadStore {
    storage: Arc<dyn ObjectStorage>,
    prefix: String,
}

impl std::fmt::Debug for PayloadStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl PayloadStore {
    pub fn new(storage: Arc<dyn ObjectStorage>, prefix: impl Into<String>) -> Self {
        Self {
            storage,
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    /// Object path for a record: `{prefix}/{TaskTypeTask}/{key}.json`.
    pub fn path(&self, task_type: TaskType, key: &str) -> String {
        let key: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        if self.prefix.is_empty() {
            format!("{}/{}.json", task_type.record_name(), key)
        } else {
            format!("{}/{}/{}.json", self.prefix, task_type.record_name(), key)
        }
    }

    pub async fn put(
        &self,
        task_type: TaskType,
        key: &str,
        payload: &WorkflowPayload,
    ) -> Result<TaskRecord, StoreError> {
        let path = self.path(task_type, key);
        let data = Bytes::from(serde_json::to_vec(payload)?);
        let size = data.len();
        self.storage.put(&path, data).await?;

        debug!(
            task_type = %task_type,
            key = %key,
            asset_id = %payload.asset_id,
            size,
            "Stored task payload"
        );

        Ok(TaskRecord {
            task_type,
            key: key.to_string(),
            path,
            size,
            stored_at: Utc::now(),
        })
    }

    pub async fn get_bytes(&self, task_type: TaskType, key: &str) -> Result<Bytes, StoreError> {
        let path = self.path(task_type, key);
        match self.storage.get(&path).await {
            Err(StoreError::ObjectNotFound { .. }) => Err(StoreError::NotFound {
                task_type: task_type.record_name(),
                key: key.to_string(),
            }),
            other => other,
        }
    }

    pub async fn get(&self, task_type: TaskType, key: &str) -> Result<WorkflowPayload, StoreError> {
        let bytes = self.get_bytes(task_type, key).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Signed retrieval URL for a record, valid for `ttl`.
    pub async fn presign(
        &self,
        task_type: TaskType,
        key: &str,
        ttl: Duration,
    ) -> Result<String, StoreError> {
        let path = self.path(task_type, key);
        self.storage.signed_url(&path, ttl).await
    }
}
