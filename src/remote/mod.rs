//! Remote service seams
//!
//! The catalog, crawler, profiling and asset-record services are external
//! collaborators. Handlers reach them only through these traits so tests and
//! the local topology can substitute the in-memory fakes in [`memory`].

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::payload::{AssetStatus, ErrorSummary, RecipeRef, RunStatus};

pub use memory::{
    MemoryAssetRepository, MemoryCatalogService, MemoryCrawlerService, MemoryProfilingService,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("{service} throttled the request: {message}")]
    Throttled { service: String, message: String },
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },
    #[error("{service} unavailable: {message}")]
    Unavailable { service: String, message: String },
    #[error("Resource not found: {resource}")]
    NotFound { resource: String },
    #[error("Access denied: {message}")]
    AccessDenied { message: String },
    #[error("Request rejected: {message}")]
    Validation { message: String },
    #[error("Resource already exists: {resource}")]
    AlreadyExists { resource: String },
    #[error("Conflicting operation in progress: {resource}")]
    Conflict { resource: String },
    #[error("Service error: {message}")]
    Service { message: String },
}

/// How the orchestration layer should react to a [`RemoteError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry the step with backoff.
    Transient,
    /// Fail the step; no retry will help.
    Permanent,
    /// The work was already done or is underway; handlers adopt it.
    Duplicate,
}

impl RemoteError {
    pub fn classify(&self) -> ErrorClass {
        match self {
            RemoteError::Throttled { .. }
            | RemoteError::Timeout { .. }
            | RemoteError::Unavailable { .. } => ErrorClass::Transient,
            RemoteError::AlreadyExists { .. } | RemoteError::Conflict { .. } => {
                ErrorClass::Duplicate
            }
            RemoteError::NotFound { .. }
            | RemoteError::AccessDenied { .. }
            | RemoteError::Validation { .. }
            | RemoteError::Service { .. } => ErrorClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.classify() == ErrorClass::Transient
    }

    /// Error name reported in a task failure.
    pub fn error_name(&self) -> &'static str {
        match self {
            RemoteError::Throttled { .. } => "ThrottlingException",
            RemoteError::Timeout { .. } => "TimeoutException",
            RemoteError::Unavailable { .. } => "ServiceUnavailableException",
            RemoteError::NotFound { .. } => "ResourceNotFoundException",
            RemoteError::AccessDenied { .. } => "AccessDeniedException",
            RemoteError::Validation { .. } => "ValidationException",
            RemoteError::AlreadyExists { .. } => "AlreadyExistsException",
            RemoteError::Conflict { .. } => "ConflictException",
            RemoteError::Service { .. } => "InternalServerException",
        }
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        RemoteError::NotFound {
            resource: resource.into(),
        }
    }
}

/// Await a remote call, turning an elapsed deadline into a transient
/// [`RemoteError::Timeout`].
pub async fn with_timeout<T, F>(
    operation: &str,
    timeout: Duration,
    call: F,
) -> Result<T, RemoteError>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout {
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSummary {
    pub id: String,
    pub name: String,
    pub domain_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataSourceKind {
    Glue,
    Redshift,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DataSourceConfiguration {
    Glue {
        database: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        table: Option<String>,
    },
    Redshift {
        resource_arn: String,
        database: String,
        schema: String,
        table: String,
    },
}

impl DataSourceConfiguration {
    pub fn kind(&self) -> DataSourceKind {
        match self {
            DataSourceConfiguration::Glue { .. } => DataSourceKind::Glue,
            DataSourceConfiguration::Redshift { .. } => DataSourceKind::Redshift,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceSpec {
    pub project_id: String,
    pub name: String,
    pub configuration: DataSourceConfiguration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceSummary {
    pub id: String,
    pub name: String,
    pub project_id: String,
    pub kind: DataSourceKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceRun {
    pub id: String,
    pub data_source_id: String,
    pub status: RunStatus,
}

#[async_trait]
pub trait CatalogService: Send + Sync {
    async fn find_project(
        &self,
        domain_id: &str,
        name: &str,
    ) -> Result<Option<ProjectSummary>, RemoteError>;

    async fn create_project(
        &self,
        domain_id: &str,
        name: &str,
    ) -> Result<ProjectSummary, RemoteError>;

    async fn find_data_source(
        &self,
        domain_id: &str,
        project_id: &str,
        name: &str,
    ) -> Result<Option<DataSourceSummary>, RemoteError>;

    async fn create_data_source(
        &self,
        domain_id: &str,
        spec: &DataSourceSpec,
    ) -> Result<DataSourceSummary, RemoteError>;

    async fn get_data_source(
        &self,
        domain_id: &str,
        data_source_id: &str,
    ) -> Result<DataSourceSummary, RemoteError>;

    /// Start a run. A run already in progress is [`RemoteError::Conflict`].
    async fn start_data_source_run(
        &self,
        domain_id: &str,
        data_source_id: &str,
    ) -> Result<DataSourceRun, RemoteError>;

    async fn get_data_source_run(
        &self,
        domain_id: &str,
        run_id: &str,
    ) -> Result<DataSourceRun, RemoteError>;

    async fn latest_data_source_run(
        &self,
        domain_id: &str,
        data_source_id: &str,
    ) -> Result<Option<DataSourceRun>, RemoteError>;
}

// ---------------------------------------------------------------------------
// Crawler / catalog tables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSpec {
    pub name: String,
    pub jdbc_url: String,
    pub region: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CrawlTarget {
    ObjectStore { path: String },
    Jdbc { connection_name: String, path: String },
}

impl CrawlTarget {
    /// Table name a crawler derives from its target: the last path segment.
    pub fn table_name(&self) -> String {
        let path = match self {
            CrawlTarget::ObjectStore { path } => path.trim_start_matches("s3://"),
            CrawlTarget::Jdbc { path, .. } => path.as_str(),
        };
        let segment = path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default();
        let stem = segment.split('.').next().unwrap_or(segment);
        stem.chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlerSpec {
    pub name: String,
    pub database: String,
    pub target: CrawlTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlerState {
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub tables: Vec<String>,
}

#[async_trait]
pub trait CrawlerService: Send + Sync {
    async fn create_connection(&self, spec: &ConnectionSpec) -> Result<(), RemoteError>;

    async fn delete_connection(&self, name: &str) -> Result<(), RemoteError>;

    async fn create_database(&self, name: &str) -> Result<(), RemoteError>;

    async fn create_crawler(&self, spec: &CrawlerSpec) -> Result<(), RemoteError>;

    /// Start a crawl. An in-flight crawl is [`RemoteError::Conflict`].
    async fn start_crawler(&self, name: &str) -> Result<(), RemoteError>;

    async fn get_crawler_state(&self, name: &str) -> Result<CrawlerState, RemoteError>;

    async fn delete_crawler(&self, name: &str) -> Result<(), RemoteError>;
}

// ---------------------------------------------------------------------------
// Profiling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetSpec {
    pub name: String,
    pub database: String,
    pub table: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileJobSpec {
    pub name: String,
    pub dataset_name: String,
    pub output_location: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipeJobSpec {
    pub name: String,
    pub dataset_name: String,
    pub recipe: RecipeRef,
    pub output_location: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRun {
    pub id: String,
    pub job_name: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[async_trait]
pub trait ProfilingService: Send + Sync {
    async fn create_dataset(&self, spec: &DatasetSpec) -> Result<(), RemoteError>;

    async fn create_profile_job(&self, spec: &ProfileJobSpec) -> Result<(), RemoteError>;

    async fn create_recipe_job(&self, spec: &RecipeJobSpec) -> Result<(), RemoteError>;

    /// Start a job run. An in-flight run is [`RemoteError::Conflict`].
    async fn start_job_run(&self, job_name: &str) -> Result<JobRun, RemoteError>;

    async fn get_job_run(&self, job_name: &str, run_id: &str) -> Result<JobRun, RemoteError>;

    async fn latest_job_run(&self, job_name: &str) -> Result<Option<JobRun>, RemoteError>;
}

// ---------------------------------------------------------------------------
// Asset records
// ---------------------------------------------------------------------------

/// The user-visible asset record: only terminal outcomes are written here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRecord {
    pub asset_id: String,
    pub status: AssetStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSummary>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait AssetRepository: Send + Sync {
    async fn save(&self, record: AssetRecord) -> Result<(), RemoteError>;

    async fn get(&self, asset_id: &str) -> Result<Option<AssetRecord>, RemoteError>;
}
