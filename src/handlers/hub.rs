//! Hub-side handlers: catalog project, data source, run verification and the
//! handoff to the spoke.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use super::{naming, HandlerError, HandlerOutcome, TaskHandler};
use crate::context::ProvisionerContext;
use crate::payload::{AssetStatus, Connection, ErrorSummary, RunStatus, TaskType, WorkflowPayload};
use crate::pipeline::StepOutcome;
use crate::relay::{HandoffDetail, RelayEnvelope};
use crate::remote::{AssetRecord, DataSourceConfiguration, DataSourceSpec, RemoteError};

/// Finds the catalog project by name or creates it.
pub struct CreateProjectHandler {
    ctx: Arc<ProvisionerContext>,
}
handler_ctor!(CreateProjectHandler);

#[async_trait]
impl TaskHandler for CreateProjectHandler {
    fn task_type(&self) -> TaskType {
        TaskType::CreateProject
    }

    async fn process(&self, mut payload: WorkflowPayload) -> Result<HandlerOutcome, HandlerError> {
        payload.validate()?;
        let domain_id = payload.domain_id()?.to_string();
        let name = payload.project_name()?.to_string();
        let catalog = &self.ctx.catalog;

        let existing = self
            .ctx
            .remote("find_project", catalog.find_project(&domain_id, &name))
            .await?;
        let project = match existing {
            Some(project) => {
                debug!(project_id = %project.id, "Reusing existing project");
                project
            }
            None => match self
                .ctx
                .remote("create_project", catalog.create_project(&domain_id, &name))
                .await
            {
                Ok(project) => project,
                Err(RemoteError::AlreadyExists { .. }) => self
                    .ctx
                    .remote("find_project", catalog.find_project(&domain_id, &name))
                    .await?
                    .ok_or_else(|| RemoteError::not_found(format!("project {name}")))?,
                Err(e) => return Err(e.into()),
            },
        };

        info!(project_id = %project.id, project_name = %name, "Project ready");
        payload.catalog.project_id = Some(project.id);
        payload.set_status(AssetStatus::InProgress)?;
        Ok(HandlerOutcome::completed(payload, StepOutcome::Succeeded))
    }
}

/// Creates the catalog data source matching the payload's connection.
pub struct CreateDataSourceHandler {
    ctx: Arc<ProvisionerContext>,
}
handler_ctor!(CreateDataSourceHandler);

impl CreateDataSourceHandler {
    fn configuration(payload: &WorkflowPayload) -> Result<DataSourceConfiguration, HandlerError> {
        Ok(match &payload.connection {
            Connection::ObjectStoreSource(_) => DataSourceConfiguration::Glue {
                database: naming::glue_database_name(payload),
                table: None,
            },
            Connection::CatalogTableSource(source) => DataSourceConfiguration::Glue {
                database: source.database.clone(),
                table: Some(source.table.clone()),
            },
            Connection::WarehouseSource(source) => DataSourceConfiguration::Redshift {
                resource_arn: source.resource_arn()?,
                database: source.database.clone(),
                schema: source.schema.clone(),
                table: source.table.clone(),
            },
        })
    }
}

#[async_trait]
impl TaskHandler for CreateDataSourceHandler {
    fn task_type(&self) -> TaskType {
        TaskType::CreateDataSource
    }

    async fn process(&self, mut payload: WorkflowPayload) -> Result<HandlerOutcome, HandlerError> {
        let domain_id = payload.domain_id()?.to_string();
        let project_id = payload.project_id()?.to_string();
        let spec = DataSourceSpec {
            project_id: project_id.clone(),
            name: naming::data_source_name(&payload),
            configuration: Self::configuration(&payload)?,
        };
        let catalog = &self.ctx.catalog;

        let find = || catalog.find_data_source(&domain_id, &project_id, &spec.name);
        let data_source = match self.ctx.remote("find_data_source", find()).await? {
            Some(existing) => existing,
            None => match self
                .ctx
                .remote("create_data_source", catalog.create_data_source(&domain_id, &spec))
                .await
            {
                Ok(created) => created,
                Err(RemoteError::AlreadyExists { .. }) => self
                    .ctx
                    .remote("find_data_source", find())
                    .await?
                    .ok_or_else(|| RemoteError::not_found(format!("data source {}", spec.name)))?,
                Err(e) => return Err(e.into()),
            },
        };

        info!(
            data_source_id = %data_source.id,
            kind = ?data_source.kind,
            "Data source ready"
        );
        payload.catalog.data_source_id = Some(data_source.id);
        payload.touch();
        Ok(HandlerOutcome::completed(payload, StepOutcome::Succeeded))
    }
}

/// Starts a data-source run, adopting one that is already in flight.
pub struct RunDataSourceHandler {
    ctx: Arc<ProvisionerContext>,
}
handler_ctor!(RunDataSourceHandler);

#[async_trait]
impl TaskHandler for RunDataSourceHandler {
    fn task_type(&self) -> TaskType {
        TaskType::RunDataSource
    }

    async fn process(&self, mut payload: WorkflowPayload) -> Result<HandlerOutcome, HandlerError> {
        let domain_id = payload.domain_id()?.to_string();
        let data_source_id = payload.data_source_id()?.to_string();

        if let (Some(run_id), Some(status)) = (
            payload.execution.data_source_run_id.as_deref(),
            payload.execution.data_source_run_status,
        ) {
            if matches!(status, RunStatus::Running | RunStatus::Succeeded) {
                info!(run_id = %run_id, status = %status, "Run already recorded, replaying");
                return Ok(HandlerOutcome::completed(payload, StepOutcome::Succeeded));
            }
            info!(run_id = %run_id, "Recorded run failed, retrying with a fresh run");
            payload.reset_for_retry();
        }

        let catalog = &self.ctx.catalog;
        let run = match self
            .ctx
            .remote(
                "start_data_source_run",
                catalog.start_data_source_run(&domain_id, &data_source_id),
            )
            .await
        {
            Ok(run) => run,
            Err(conflict @ RemoteError::Conflict { .. }) => {
                info!(data_source_id = %data_source_id, "Run already in progress, adopting latest");
                self.ctx
                    .remote(
                        "latest_data_source_run",
                        catalog.latest_data_source_run(&domain_id, &data_source_id),
                    )
                    .await?
                    .ok_or(conflict)?
            }
            Err(e) => return Err(e.into()),
        };

        info!(run_id = %run.id, status = %run.status, "Data source run started");
        payload.execution.data_source_run_id = Some(run.id);
        payload.execution.data_source_run_status = Some(run.status);
        payload.execution.poll_count = 0;
        payload.touch();
        Ok(HandlerOutcome::completed(payload, StepOutcome::Succeeded))
    }
}

/// Polls the data-source run; drives the hub's status loop.
pub struct VerifyDataSourceHandler {
    ctx: Arc<ProvisionerContext>,
}
handler_ctor!(VerifyDataSourceHandler);

#[async_trait]
impl TaskHandler for VerifyDataSourceHandler {
    fn task_type(&self) -> TaskType {
        TaskType::VerifyDataSource
    }

    async fn process(&self, mut payload: WorkflowPayload) -> Result<HandlerOutcome, HandlerError> {
        let domain_id = payload.domain_id()?.to_string();
        let data_source_id = payload.data_source_id()?.to_string();
        let run_id = payload.data_source_run_id()?.to_string();
        let catalog = &self.ctx.catalog;

        // A data source deleted out from under the run surfaces as NotFound.
        self.ctx
            .remote("get_data_source", catalog.get_data_source(&domain_id, &data_source_id))
            .await?;
        let run = self
            .ctx
            .remote("get_data_source_run", catalog.get_data_source_run(&domain_id, &run_id))
            .await?;

        payload.execution.data_source_run_status = Some(run.status);
        match run.status {
            RunStatus::Running => {
                payload.execution.poll_count += 1;
                payload.touch();
                debug!(
                    run_id = %run_id,
                    poll_count = payload.execution.poll_count,
                    "Run still in progress",
                );
                Ok(HandlerOutcome::completed(payload, StepOutcome::Running))
            }
            RunStatus::Succeeded => {
                payload.set_status(AssetStatus::Verified)?;
                info!(run_id = %run_id, "Data source run verified");
                Ok(HandlerOutcome::completed(payload, StepOutcome::Succeeded))
            }
            RunStatus::Failed => Err(HandlerError::RunFailed {
                resource: format!("data source run {run_id}"),
                message: format!("data source {data_source_id} reported FAILED"),
            }),
        }
    }
}

/// Hands the payload to the spoke and suspends until the spoke reports back.
///
/// Two records are written under the run id: a token-free copy the spoke can
/// fetch through a signed URL, and a hub-private stash carrying this step's
/// token for the hub relay consumer.
pub struct SpokeHandoffHandler {
    ctx: Arc<ProvisionerContext>,
}
handler_ctor!(SpokeHandoffHandler);

#[async_trait]
impl TaskHandler for SpokeHandoffHandler {
    fn task_type(&self) -> TaskType {
        TaskType::SpokeHandoff
    }

    async fn process(&self, payload: WorkflowPayload) -> Result<HandlerOutcome, HandlerError> {
        let token = payload.task_token()?.to_string();
        let run_id = payload.data_source_run_id()?.to_string();
        let store = &self.ctx.store;

        let handoff = payload.for_handoff();
        store.put(TaskType::RunDataSource, &run_id, &handoff).await?;

        let mut stash = handoff.clone();
        stash.execution.hub_task_token = Some(token);
        store.put(TaskType::SpokeHandoff, &run_id, &stash).await?;

        let url = store
            .presign(TaskType::RunDataSource, &run_id, self.ctx.settings.signed_url_ttl)
            .await?;
        let envelope = RelayEnvelope::new(
            &self.ctx.relay.hub_source,
            &self.ctx.relay.handoff_detail_type,
            &HandoffDetail {
                asset_id: payload.asset_id.clone(),
                full_payload_signed_url: url,
                data_source_run_id: run_id.clone(),
            },
        )?;
        let event_id = envelope.id.clone();
        self.ctx.publisher.publish(envelope).await?;

        info!(run_id = %run_id, event_id = %event_id, "Handed payload to spoke");
        Ok(HandlerOutcome::Suspended { payload })
    }
}

fn asset_record(payload: &WorkflowPayload) -> AssetRecord {
    AssetRecord {
        asset_id: payload.asset_id.clone(),
        status: payload.status,
        project_id: payload.catalog.project_id.clone(),
        data_source_id: payload.catalog.data_source_id.clone(),
        error: payload.execution.error.clone(),
        updated_at: Utc::now(),
    }
}

/// Marks the asset COMPLETE in the asset repository.
pub struct HubCompleteHandler {
    ctx: Arc<ProvisionerContext>,
}
handler_ctor!(HubCompleteHandler);

#[async_trait]
impl TaskHandler for HubCompleteHandler {
    fn task_type(&self) -> TaskType {
        TaskType::Complete
    }

    async fn process(&self, mut payload: WorkflowPayload) -> Result<HandlerOutcome, HandlerError> {
        payload.set_status(AssetStatus::Complete)?;
        payload.execution.error = None;
        self.ctx
            .remote("save_asset", self.ctx.assets.save(asset_record(&payload)))
            .await?;
        info!("Asset provisioning complete");
        Ok(HandlerOutcome::completed(payload, StepOutcome::Succeeded))
    }
}

/// Marks the asset FAILED and records why.
pub struct HubFailedHandler {
    ctx: Arc<ProvisionerContext>,
}
handler_ctor!(HubFailedHandler);

#[async_trait]
impl TaskHandler for HubFailedHandler {
    fn task_type(&self) -> TaskType {
        TaskType::Failed
    }

    async fn process(&self, mut payload: WorkflowPayload) -> Result<HandlerOutcome, HandlerError> {
        payload.set_status(AssetStatus::Failed)?;
        if payload.execution.error.is_none() {
            payload.execution.error = Some(ErrorSummary {
                error: "UnknownError".to_string(),
                cause: "workflow failed without an error summary".to_string(),
                failed_step: None,
            });
        }
        self.ctx
            .remote("save_asset", self.ctx.assets.save(asset_record(&payload)))
            .await?;
        info!(error = ?payload.execution.error, "Asset provisioning failed");
        Ok(HandlerOutcome::completed(payload, StepOutcome::Succeeded))
    }
}
