//! Spoke-side handlers: connection, catalog database, crawler, profiling and
//! the response back to the hub.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{naming, HandlerError, HandlerOutcome, TaskHandler};
use crate::context::ProvisionerContext;
use crate::payload::{
    AssetStatus, Connection, RunStatus, TaskType, ValidationError, WorkflowPayload,
};
use crate::pipeline::StepOutcome;
use crate::relay::{CompletionDetail, HandoffDetail, RelayEnvelope};
use crate::remote::{
    ConnectionSpec, CrawlTarget, CrawlerSpec, DatasetSpec, JobRun, ProfileJobSpec, RecipeJobSpec,
    RemoteError,
};

/// Treat "already exists" as success for idempotent creates.
fn created_or_existing(result: Result<(), RemoteError>) -> Result<bool, RemoteError> {
    match result {
        Ok(()) => Ok(true),
        Err(RemoteError::AlreadyExists { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Treat "not found" as success for idempotent deletes.
fn deleted_or_absent(result: Result<(), RemoteError>) -> Result<bool, RemoteError> {
    match result {
        Ok(()) => Ok(true),
        Err(RemoteError::NotFound { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

fn required<'a>(
    value: &'a Option<String>,
    field: &'static str,
) -> Result<&'a str, ValidationError> {
    value.as_deref().ok_or(ValidationError::MissingField(field))
}

/// Relay entry point on the spoke: turns a handoff event into the payload the
/// spoke pipeline starts from.
pub struct StartHandler {
    ctx: Arc<ProvisionerContext>,
}
handler_ctor!(StartHandler);

impl StartHandler {
    pub async fn start(&self, detail: &HandoffDetail) -> Result<WorkflowPayload, HandlerError> {
        let mut payload = self.ctx.fetcher.fetch(&detail.full_payload_signed_url).await?;

        if payload.asset_id != detail.asset_id {
            return Err(ValidationError::AssetIdChanged {
                expected: detail.asset_id.clone(),
                actual: payload.asset_id,
            }
            .into());
        }
        if payload.carries_token() {
            warn!(asset_id = %payload.asset_id, "Rejecting handoff payload carrying a task token");
            return Err(ValidationError::TokenLeaked {
                asset_id: payload.asset_id,
            }
            .into());
        }
        if payload.is_terminal() {
            return Err(ValidationError::TerminalPayload {
                asset_id: payload.asset_id,
                status: payload.status,
            }
            .into());
        }
        payload.validate()?;

        let now = Utc::now();
        payload.execution.started_at = Some(now);
        payload.execution.updated_at = Some(now);
        info!(
            asset_id = %payload.asset_id,
            run_id = %detail.data_source_run_id,
            "Accepted handoff from hub"
        );
        Ok(payload)
    }
}

/// Ensures a JDBC connection for warehouse sources.
pub struct ConnectionHandler {
    ctx: Arc<ProvisionerContext>,
}
handler_ctor!(ConnectionHandler);

#[async_trait]
impl TaskHandler for ConnectionHandler {
    fn task_type(&self) -> TaskType {
        TaskType::Connection
    }

    async fn process(&self, mut payload: WorkflowPayload) -> Result<HandlerOutcome, HandlerError> {
        let Connection::WarehouseSource(source) = &payload.connection else {
            return Ok(HandlerOutcome::completed(payload, StepOutcome::Skipped));
        };

        let spec = ConnectionSpec {
            name: naming::connection_name(&payload),
            jdbc_url: source.jdbc_url()?,
            region: source.region.clone(),
        };
        let created = created_or_existing(
            self.ctx
                .remote("create_connection", self.ctx.crawler.create_connection(&spec))
                .await,
        )?;

        info!(connection = %spec.name, created, "Connection ready");
        payload.execution.connection_name = Some(spec.name);
        payload.touch();
        Ok(HandlerOutcome::completed(payload, StepOutcome::Succeeded))
    }
}

/// Ensures the catalog database the crawler writes into.
pub struct DataSetHandler {
    ctx: Arc<ProvisionerContext>,
}
handler_ctor!(DataSetHandler);

#[async_trait]
impl TaskHandler for DataSetHandler {
    fn task_type(&self) -> TaskType {
        TaskType::DataSet
    }

    async fn process(&self, mut payload: WorkflowPayload) -> Result<HandlerOutcome, HandlerError> {
        if let Connection::CatalogTableSource(source) = &payload.connection {
            let (database, table) = (source.database.clone(), source.table.clone());
            debug!(database = %database, table = %table, "Adopting existing catalog table");
            payload.execution.glue_database = Some(database);
            payload.execution.glue_table = Some(table);
            payload.touch();
            return Ok(HandlerOutcome::completed(payload, StepOutcome::Skipped));
        }

        let database = naming::glue_database_name(&payload);
        let created = created_or_existing(
            self.ctx
                .remote("create_database", self.ctx.crawler.create_database(&database))
                .await,
        )?;

        info!(database = %database, created, "Catalog database ready");
        payload.execution.glue_database = Some(database);
        payload.touch();
        Ok(HandlerOutcome::completed(payload, StepOutcome::Succeeded))
    }
}

/// Creates and starts the crawler, then polls it until the table appears.
pub struct GlueCrawlerHandler {
    ctx: Arc<ProvisionerContext>,
}
handler_ctor!(GlueCrawlerHandler);

impl GlueCrawlerHandler {
    fn target(payload: &WorkflowPayload) -> Result<CrawlTarget, ValidationError> {
        match &payload.connection {
            Connection::ObjectStoreSource(source) => Ok(CrawlTarget::ObjectStore {
                path: source.crawl_path(),
            }),
            Connection::WarehouseSource(source) => Ok(CrawlTarget::Jdbc {
                connection_name: required(
                    &payload.execution.connection_name,
                    "execution.connectionName",
                )?
                .to_string(),
                path: format!("{}/{}/{}", source.database, source.schema, source.table),
            }),
            Connection::CatalogTableSource(_) => Err(ValidationError::InvalidField {
                field: "connection",
                reason: "catalog table sources are not crawled".to_string(),
            }),
        }
    }

    async fn launch(&self, mut payload: WorkflowPayload) -> Result<HandlerOutcome, HandlerError> {
        let spec = CrawlerSpec {
            name: naming::crawler_name(&payload),
            database: required(&payload.execution.glue_database, "execution.glueDatabase")?
                .to_string(),
            target: Self::target(&payload)?,
        };
        let crawler = &self.ctx.crawler;

        created_or_existing(
            self.ctx.remote("create_crawler", crawler.create_crawler(&spec)).await,
        )?;
        match self.ctx.remote("start_crawler", crawler.start_crawler(&spec.name)).await {
            Ok(()) => info!(crawler = %spec.name, "Crawler started"),
            Err(RemoteError::Conflict { .. }) => {
                info!(crawler = %spec.name, "Crawler already running")
            }
            Err(e) => return Err(e.into()),
        }

        payload.execution.crawler_name = Some(spec.name);
        payload.execution.crawler_status = Some(RunStatus::Running);
        payload.touch();
        Ok(HandlerOutcome::completed(payload, StepOutcome::Running))
    }

    async fn poll(&self, mut payload: WorkflowPayload) -> Result<HandlerOutcome, HandlerError> {
        let name = required(&payload.execution.crawler_name, "execution.crawlerName")?.to_string();
        let state = self
            .ctx
            .remote("get_crawler_state", self.ctx.crawler.get_crawler_state(&name))
            .await?;

        match state.status {
            None | Some(RunStatus::Running) => {
                debug!(crawler = %name, "Crawler still running");
                payload.touch();
                Ok(HandlerOutcome::completed(payload, StepOutcome::Running))
            }
            Some(RunStatus::Succeeded) => {
                let table = state.tables.into_iter().next().ok_or_else(|| HandlerError::RunFailed {
                    resource: format!("crawler {name}"),
                    message: "crawl finished without producing a table".to_string(),
                })?;
                info!(crawler = %name, table = %table, "Crawler finished");
                payload.execution.glue_table = Some(table);
                payload.execution.crawler_status = Some(RunStatus::Succeeded);
                payload.touch();
                Ok(HandlerOutcome::completed(payload, StepOutcome::Succeeded))
            }
            Some(RunStatus::Failed) => Err(HandlerError::RunFailed {
                resource: format!("crawler {name}"),
                message: "crawler reported FAILED".to_string(),
            }),
        }
    }
}

#[async_trait]
impl TaskHandler for GlueCrawlerHandler {
    fn task_type(&self) -> TaskType {
        TaskType::GlueCrawler
    }

    async fn process(&self, payload: WorkflowPayload) -> Result<HandlerOutcome, HandlerError> {
        if matches!(payload.connection, Connection::CatalogTableSource(_)) {
            return Ok(HandlerOutcome::completed(payload, StepOutcome::Skipped));
        }
        match payload.execution.crawler_status {
            None => self.launch(payload).await,
            Some(RunStatus::Running) => self.poll(payload).await,
            Some(RunStatus::Succeeded) => {
                Ok(HandlerOutcome::completed(payload, StepOutcome::Succeeded))
            }
            Some(RunStatus::Failed) => Err(HandlerError::RunFailed {
                resource: "crawler".to_string(),
                message: "crawler previously reported FAILED".to_string(),
            }),
        }
    }
}

/// Ensures the profiling dataset over the crawled table.
pub struct ProfileDataSetHandler {
    ctx: Arc<ProvisionerContext>,
}
handler_ctor!(ProfileDataSetHandler);

#[async_trait]
impl TaskHandler for ProfileDataSetHandler {
    fn task_type(&self) -> TaskType {
        TaskType::ProfileDataSet
    }

    async fn process(&self, mut payload: WorkflowPayload) -> Result<HandlerOutcome, HandlerError> {
        let spec = DatasetSpec {
            name: naming::dataset_name(&payload),
            database: required(&payload.execution.glue_database, "execution.glueDatabase")?
                .to_string(),
            table: required(&payload.execution.glue_table, "execution.glueTable")?.to_string(),
        };
        let created = created_or_existing(
            self.ctx
                .remote("create_dataset", self.ctx.profiling.create_dataset(&spec))
                .await,
        )?;

        info!(dataset = %spec.name, created, "Profiling dataset ready");
        payload.execution.profile_dataset_name = Some(spec.name);
        payload.touch();
        Ok(HandlerOutcome::completed(payload, StepOutcome::Succeeded))
    }
}

/// Which job-run slot of the execution bookkeeping a polled job writes to.
#[derive(Debug, Clone, Copy)]
enum JobSlot {
    Profile,
    Recipe,
}

impl JobSlot {
    fn state(self, payload: &WorkflowPayload) -> (Option<&str>, Option<RunStatus>) {
        let e = &payload.execution;
        match self {
            JobSlot::Profile => (e.profile_job_run_id.as_deref(), e.profile_job_status),
            JobSlot::Recipe => (e.recipe_job_run_id.as_deref(), e.recipe_job_status),
        }
    }

    fn record(self, payload: &mut WorkflowPayload, job_name: &str, run: &JobRun) {
        let e = &mut payload.execution;
        match self {
            JobSlot::Profile => {
                e.profile_job_name = Some(job_name.to_string());
                e.profile_job_run_id = Some(run.id.clone());
                e.profile_job_status = Some(run.status);
                if run.status == RunStatus::Succeeded {
                    e.profile_output_location = run.output_location.clone();
                }
            }
            JobSlot::Recipe => {
                e.recipe_job_name = Some(job_name.to_string());
                e.recipe_job_run_id = Some(run.id.clone());
                e.recipe_job_status = Some(run.status);
            }
        }
        payload.touch();
    }
}

/// Start-or-poll shared by the profile and recipe job steps.
async fn drive_job(
    ctx: &ProvisionerContext,
    slot: JobSlot,
    job_name: &str,
    mut payload: WorkflowPayload,
) -> Result<HandlerOutcome, HandlerError> {
    let profiling = &ctx.profiling;
    let (run_id, status) = slot.state(&payload);
    let run_id = run_id.map(str::to_string);
    let run = match (run_id, status) {
        (Some(_), Some(RunStatus::Succeeded)) => {
            return Ok(HandlerOutcome::completed(payload, StepOutcome::Succeeded));
        }
        (Some(run_id), Some(RunStatus::Running)) => {
            ctx.remote("get_job_run", profiling.get_job_run(job_name, &run_id))
                .await?
        }
        _ => match ctx.remote("start_job_run", profiling.start_job_run(job_name)).await {
            Ok(run) => {
                info!(job = %job_name, run_id = %run.id, "Job run started");
                run
            }
            Err(conflict @ RemoteError::Conflict { .. }) => {
                info!(job = %job_name, "Job run already in progress, adopting latest");
                ctx.remote("latest_job_run", profiling.latest_job_run(job_name))
                    .await?
                    .ok_or(conflict)?
            }
            Err(e) => return Err(e.into()),
        },
    };

    slot.record(&mut payload, job_name, &run);
    match run.status {
        RunStatus::Running => Ok(HandlerOutcome::completed(payload, StepOutcome::Running)),
        RunStatus::Succeeded => {
            info!(job = %job_name, run_id = %run.id, "Job run finished");
            Ok(HandlerOutcome::completed(payload, StepOutcome::Succeeded))
        }
        RunStatus::Failed => Err(HandlerError::RunFailed {
            resource: format!("job {job_name} run {}", run.id),
            message: run
                .error_message
                .unwrap_or_else(|| "job run reported FAILED".to_string()),
        }),
    }
}

/// Ensures the profile job and drives one run of it to completion.
pub struct ProfileJobHandler {
    ctx: Arc<ProvisionerContext>,
}
handler_ctor!(ProfileJobHandler);

#[async_trait]
impl TaskHandler for ProfileJobHandler {
    fn task_type(&self) -> TaskType {
        TaskType::ProfileJob
    }

    async fn process(&self, payload: WorkflowPayload) -> Result<HandlerOutcome, HandlerError> {
        let spec = ProfileJobSpec {
            name: naming::profile_job_name(&payload),
            dataset_name: required(
                &payload.execution.profile_dataset_name,
                "execution.profileDatasetName",
            )?
            .to_string(),
            output_location: format!(
                "{}/{}/profile/",
                self.ctx.settings.output_root,
                payload.resource_prefix()
            ),
        };
        if payload.execution.profile_job_run_id.is_none() {
            created_or_existing(
                self.ctx
                    .remote("create_profile_job", self.ctx.profiling.create_profile_job(&spec))
                    .await,
            )?;
        }
        drive_job(&self.ctx, JobSlot::Profile, &spec.name, payload).await
    }
}

/// Runs the optional recipe (cleaning) job.
pub struct RecipeJobHandler {
    ctx: Arc<ProvisionerContext>,
}
handler_ctor!(RecipeJobHandler);

#[async_trait]
impl TaskHandler for RecipeJobHandler {
    fn task_type(&self) -> TaskType {
        TaskType::RecipeJob
    }

    async fn process(&self, payload: WorkflowPayload) -> Result<HandlerOutcome, HandlerError> {
        let Some(recipe) = payload.recipe.clone() else {
            return Ok(HandlerOutcome::completed(payload, StepOutcome::Skipped));
        };
        let spec = RecipeJobSpec {
            name: naming::recipe_job_name(&payload),
            dataset_name: required(
                &payload.execution.profile_dataset_name,
                "execution.profileDatasetName",
            )?
            .to_string(),
            recipe,
            output_location: format!(
                "{}/{}/cleaned/",
                self.ctx.settings.output_root,
                payload.resource_prefix()
            ),
        };
        if payload.execution.recipe_job_run_id.is_none() {
            created_or_existing(
                self.ctx
                    .remote("create_recipe_job", self.ctx.profiling.create_recipe_job(&spec))
                    .await,
            )?;
        }
        drive_job(&self.ctx, JobSlot::Recipe, &spec.name, payload).await
    }
}

/// Removes the temporary crawler and connection.
pub struct CleanupHandler {
    ctx: Arc<ProvisionerContext>,
}
handler_ctor!(CleanupHandler);

#[async_trait]
impl TaskHandler for CleanupHandler {
    fn task_type(&self) -> TaskType {
        TaskType::Cleanup
    }

    async fn process(&self, mut payload: WorkflowPayload) -> Result<HandlerOutcome, HandlerError> {
        let crawler = &self.ctx.crawler;
        if let Some(name) = payload.execution.crawler_name.clone() {
            let deleted = deleted_or_absent(
                self.ctx.remote("delete_crawler", crawler.delete_crawler(&name)).await,
            )?;
            debug!(crawler = %name, deleted, "Crawler cleaned up");
        }
        if let Some(name) = payload.execution.connection_name.clone() {
            let deleted =
                deleted_or_absent(
                    self.ctx.remote("delete_connection", crawler.delete_connection(&name)).await,
                )?;
            debug!(connection = %name, deleted, "Connection cleaned up");
        }

        payload.execution.cleaned_up = true;
        payload.touch();
        Ok(HandlerOutcome::completed(payload, StepOutcome::Succeeded))
    }
}

async fn publish_response(
    ctx: &ProvisionerContext,
    payload: &WorkflowPayload,
    detail_type: &str,
) -> Result<String, HandlerError> {
    let response = payload.for_handoff();
    ctx.store
        .put(TaskType::SpokeResponse, &payload.asset_id, &response)
        .await?;
    let url = ctx
        .store
        .presign(TaskType::SpokeResponse, &payload.asset_id, ctx.settings.signed_url_ttl)
        .await?;
    let envelope = RelayEnvelope::new(
        &ctx.relay.spoke_source,
        detail_type,
        &CompletionDetail {
            asset_id: payload.asset_id.clone(),
            full_payload_signed_url: url,
            data_source_run_id: payload.execution.data_source_run_id.clone(),
        },
    )?;
    let event_id = envelope.id.clone();
    ctx.publisher.publish(envelope).await?;
    Ok(event_id)
}

/// Stores the enriched payload and tells the hub it is ready.
pub struct SpokeResponseHandler {
    ctx: Arc<ProvisionerContext>,
}
handler_ctor!(SpokeResponseHandler);

#[async_trait]
impl TaskHandler for SpokeResponseHandler {
    fn task_type(&self) -> TaskType {
        TaskType::SpokeResponse
    }

    async fn process(&self, mut payload: WorkflowPayload) -> Result<HandlerOutcome, HandlerError> {
        payload.touch();
        let event_id =
            publish_response(&self.ctx, &payload, &self.ctx.relay.completed_detail_type).await?;
        info!(event_id = %event_id, "Reported enrichment completion to hub");
        Ok(HandlerOutcome::completed(payload, StepOutcome::Succeeded))
    }
}

#[derive(Debug, Default)]
pub struct SpokeCompleteHandler;

#[async_trait]
impl TaskHandler for SpokeCompleteHandler {
    fn task_type(&self) -> TaskType {
        TaskType::Complete
    }

    async fn process(&self, mut payload: WorkflowPayload) -> Result<HandlerOutcome, HandlerError> {
        payload.set_status(AssetStatus::Complete)?;
        debug!(asset_id = %payload.asset_id, "Spoke execution complete");
        Ok(HandlerOutcome::completed(payload, StepOutcome::Succeeded))
    }
}

/// Marks the spoke run FAILED and tells the hub, so its suspended handoff
/// fails promptly instead of timing out.
pub struct SpokeFailedHandler {
    ctx: Arc<ProvisionerContext>,
}
handler_ctor!(SpokeFailedHandler);

#[async_trait]
impl TaskHandler for SpokeFailedHandler {
    fn task_type(&self) -> TaskType {
        TaskType::Failed
    }

    async fn process(&self, mut payload: WorkflowPayload) -> Result<HandlerOutcome, HandlerError> {
        payload.set_status(AssetStatus::Failed)?;
        let event_id =
            publish_response(&self.ctx, &payload, &self.ctx.relay.failed_detail_type).await?;
        warn!(
            event_id = %event_id,
            error = ?payload.execution.error,
            "Reported enrichment failure to hub",
        );
        Ok(HandlerOutcome::completed(payload, StepOutcome::Succeeded))
    }
}
