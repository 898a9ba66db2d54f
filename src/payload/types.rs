use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::connection::Connection;
use super::status::{AssetStatus, RunStatus};

/// Payload validation failures. Raised before any remote call is attempted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Missing required payload field: {0}")]
    MissingField(&'static str),
    #[error("Invalid payload field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("Asset id changed during step: expected {expected}, got {actual}")]
    AssetIdChanged { expected: String, actual: String },
    #[error("Status regression from {from} to {to}")]
    StatusRegression { from: AssetStatus, to: AssetStatus },
    #[error("Payload for asset {asset_id} is terminal ({status})")]
    TerminalPayload { asset_id: String, status: AssetStatus },
    #[error("Handoff payload for asset {asset_id} still carries a continuation token")]
    TokenLeaked { asset_id: String },
}

/// Every step type known to the hub and spoke pipelines.
///
/// Doubles as the `taskType` half of payload store addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    CreateProject,
    CreateDataSource,
    RunDataSource,
    VerifyDataSource,
    SpokeHandoff,
    Start,
    Connection,
    DataSet,
    GlueCrawler,
    ProfileDataSet,
    ProfileJob,
    RecipeJob,
    Cleanup,
    SpokeResponse,
    Complete,
    Failed,
}

impl TaskType {
    pub const ALL: [TaskType; 16] = [
        TaskType::CreateProject,
        TaskType::CreateDataSource,
        TaskType::RunDataSource,
        TaskType::VerifyDataSource,
        TaskType::SpokeHandoff,
        TaskType::Start,
        TaskType::Connection,
        TaskType::DataSet,
        TaskType::GlueCrawler,
        TaskType::ProfileDataSet,
        TaskType::ProfileJob,
        TaskType::RecipeJob,
        TaskType::Cleanup,
        TaskType::SpokeResponse,
        TaskType::Complete,
        TaskType::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::CreateProject => "CreateProject",
            TaskType::CreateDataSource => "CreateDataSource",
            TaskType::RunDataSource => "RunDataSource",
            TaskType::VerifyDataSource => "VerifyDataSource",
            TaskType::SpokeHandoff => "SpokeHandoff",
            TaskType::Start => "Start",
            TaskType::Connection => "Connection",
            TaskType::DataSet => "DataSet",
            TaskType::GlueCrawler => "GlueCrawler",
            TaskType::ProfileDataSet => "ProfileDataSet",
            TaskType::ProfileJob => "ProfileJob",
            TaskType::RecipeJob => "RecipeJob",
            TaskType::Cleanup => "Cleanup",
            TaskType::SpokeResponse => "SpokeResponse",
            TaskType::Complete => "Complete",
            TaskType::Failed => "Failed",
        }
    }

    /// Name used for payload store records, e.g. `RunDataSourceTask`.
    pub fn record_name(self) -> String {
        format!("{}Task", self.as_str())
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskType::Complete | TaskType::Failed)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog coordinates, filled in as the hub pipeline progresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CatalogRef {
    pub domain_id: String,
    pub project_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source_id: Option<String>,
}

/// Optional cleaning recipe applied by the spoke's RecipeJob step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipeRef {
    pub name: String,
    #[serde(default = "default_recipe_version")]
    pub version: String,
}

fn default_recipe_version() -> String {
    "LATEST_PUBLISHED".to_string()
}

/// Error attached to a failed workflow and surfaced on the asset record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorSummary {
    pub error: String,
    pub cause: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<TaskType>,
}

/// Orchestration bookkeeping. Tokens here are written only by the
/// orchestration layer; handlers read them but never mint new ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hub_task_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_source_run_status: Option<RunStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glue_database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glue_table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawler_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawler_status: Option<RunStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_dataset_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_job_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_job_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_job_status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_output_location: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe_job_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe_job_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe_job_status: Option<RunStatus>,

    #[serde(default)]
    pub cleaned_up: bool,
    #[serde(default)]
    pub poll_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorSummary>,
}

/// State threaded through every step of both pipelines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowPayload {
    #[serde(alias = "taskId")]
    pub asset_id: String,
    pub catalog: CatalogRef,
    pub connection: Connection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe: Option<RecipeRef>,
    #[serde(default)]
    pub execution: Execution,
    #[serde(default)]
    pub status: AssetStatus,
}

impl WorkflowPayload {
    pub fn new(asset_id: impl Into<String>, catalog: CatalogRef, connection: Connection) -> Self {
        Self {
            asset_id: asset_id.into(),
            catalog,
            connection,
            recipe: None,
            execution: Execution {
                started_at: Some(Utc::now()),
                ..Default::default()
            },
            status: AssetStatus::Pending,
        }
    }

    pub fn with_recipe(mut self, recipe: RecipeRef) -> Self {
        self.recipe = Some(recipe);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Validate the fields every step needs regardless of its position.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.asset_id.trim().is_empty() {
            return Err(ValidationError::MissingField("assetId"));
        }
        self.connection.validate()
    }

    pub fn domain_id(&self) -> Result<&str, ValidationError> {
        non_empty(&self.catalog.domain_id, "catalog.domainId")
    }

    pub fn project_name(&self) -> Result<&str, ValidationError> {
        non_empty(&self.catalog.project_name, "catalog.projectName")
    }

    pub fn project_id(&self) -> Result<&str, ValidationError> {
        self.catalog
            .project_id
            .as_deref()
            .ok_or(ValidationError::MissingField("catalog.projectId"))
    }

    pub fn data_source_id(&self) -> Result<&str, ValidationError> {
        self.catalog
            .data_source_id
            .as_deref()
            .ok_or(ValidationError::MissingField("catalog.dataSourceId"))
    }

    pub fn data_source_run_id(&self) -> Result<&str, ValidationError> {
        self.execution
            .data_source_run_id
            .as_deref()
            .ok_or(ValidationError::MissingField("execution.dataSourceRunId"))
    }

    pub fn task_token(&self) -> Result<&str, ValidationError> {
        self.execution
            .task_token
            .as_deref()
            .ok_or(ValidationError::MissingField("execution.taskToken"))
    }

    /// Move the status forward, rejecting regressions.
    pub fn set_status(&mut self, next: AssetStatus) -> Result<(), ValidationError> {
        if !self.status.can_advance_to(next) {
            return Err(ValidationError::StatusRegression {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    pub fn touch(&mut self) {
        self.execution.updated_at = Some(Utc::now());
    }

    /// Copy suitable for crossing the account boundary: no continuation token
    /// of either side survives.
    pub fn for_handoff(&self) -> Self {
        let mut copy = self.clone();
        copy.execution.task_token = None;
        copy.execution.hub_task_token = None;
        copy
    }

    pub fn carries_token(&self) -> bool {
        self.execution.task_token.is_some() || self.execution.hub_task_token.is_some()
    }

    /// Explicit retry of the data-source run: clears the run sub-status and
    /// poll counter so RunDataSource starts a fresh run. `status` is untouched.
    pub fn reset_for_retry(&mut self) {
        self.execution.data_source_run_id = None;
        self.execution.data_source_run_status = None;
        self.execution.poll_count = 0;
        self.touch();
    }

    /// Name prefix used for every remote resource created for this asset.
    pub fn resource_prefix(&self) -> String {
        self.asset_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect()
    }
}

fn non_empty<'a>(value: &'a str, field: &'static str) -> Result<&'a str, ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::MissingField(field))
    } else {
        Ok(value)
    }
}
