//! Task handlers
//!
//! One handler per pipeline state. A handler performs one idempotent unit of
//! remote work and reports how the step ended; [`run_task`] owns the token
//! and turns that report into exactly one gateway signal.

macro_rules! handler_ctor {
    ($name:ident) => {
        impl $name {
            pub fn new(ctx: Arc<ProvisionerContext>) -> Self {
                Self { ctx }
            }
        }
    };
}

pub mod hub;
pub mod spoke;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn, Instrument};

use crate::callback::{
    token_hint, CallbackError, CallbackOutcome, ErrorInfo, TaskOutput, TaskTokenGateway,
};
use crate::context::ProvisionerContext;
use crate::payload::{AssetStatus, TaskType, ValidationError, WorkflowPayload};
use crate::pipeline::{PipelineKind, StepOutcome};
use crate::relay::PublishError;
use crate::remote::{ErrorClass, RemoteError};
use crate::store::{RetrievalError, StoreError};
use crate::telemetry::create_workflow_span;

pub use hub::{
    CreateDataSourceHandler, CreateProjectHandler, HubCompleteHandler, HubFailedHandler,
    RunDataSourceHandler, SpokeHandoffHandler, VerifyDataSourceHandler,
};
pub use spoke::{
    CleanupHandler, ConnectionHandler, DataSetHandler, GlueCrawlerHandler, ProfileDataSetHandler,
    ProfileJobHandler, RecipeJobHandler, SpokeCompleteHandler, SpokeFailedHandler,
    SpokeResponseHandler, StartHandler,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The step is done for this visit; its token should be completed.
    Completed {
        payload: WorkflowPayload,
        outcome: StepOutcome,
    },
    /// The step waits for an external party to redeem its token.
    Suspended { payload: WorkflowPayload },
}

impl HandlerOutcome {
    pub fn completed(payload: WorkflowPayload, outcome: StepOutcome) -> Self {
        HandlerOutcome::Completed { payload, outcome }
    }

    pub fn payload(&self) -> &WorkflowPayload {
        match self {
            HandlerOutcome::Completed { payload, .. } | HandlerOutcome::Suspended { payload } => {
                payload
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Invalid payload: {0}")]
    Validation(#[from] ValidationError),
    #[error("Remote call failed: {0}")]
    Remote(#[from] RemoteError),
    #[error("{resource} failed: {message}")]
    RunFailed { resource: String, message: String },
    #[error("Payload store error: {0}")]
    Store(#[from] StoreError),
    #[error("Payload retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),
    #[error("Event publish error: {0}")]
    Publish(#[from] PublishError),
    #[error("Task token callback error: {0}")]
    Callback(#[from] CallbackError),
    #[error("Failed to build event: {0}")]
    Encode(#[from] serde_json::Error),
}

impl HandlerError {
    /// Permanent errors fail the step through the gateway; nothing else does.
    pub fn is_permanent(&self) -> bool {
        match self {
            HandlerError::Remote(e) => e.classify() == ErrorClass::Permanent,
            HandlerError::RunFailed { .. } => true,
            HandlerError::Store(e) => matches!(
                e,
                StoreError::NotFound { .. } | StoreError::Serialization(_)
            ),
            HandlerError::Retrieval(e) => !e.is_reissuable(),
            HandlerError::Encode(_) => true,
            HandlerError::Validation(_)
            | HandlerError::Publish(_)
            | HandlerError::Callback(_) => false,
        }
    }

    /// Errors worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            // Create conflicts that escaped adoption are retried.
            HandlerError::Remote(e) => {
                matches!(e.classify(), ErrorClass::Transient | ErrorClass::Duplicate)
            }
            HandlerError::Store(e) => matches!(e, StoreError::Backend { .. }),
            HandlerError::Retrieval(e) => e.is_reissuable(),
            HandlerError::Publish(_) => true,
            HandlerError::Callback(e) => matches!(e, CallbackError::Substrate { .. }),
            _ => false,
        }
    }

    pub fn error_name(&self) -> &'static str {
        match self {
            HandlerError::Validation(_) => "ValidationError",
            HandlerError::Remote(e) => e.error_name(),
            HandlerError::RunFailed { .. } => "RunFailed",
            HandlerError::Store(_) => "PayloadStoreError",
            HandlerError::Retrieval(_) => "PayloadRetrievalError",
            HandlerError::Publish(_) => "EventPublishError",
            HandlerError::Callback(_) => "TaskCallbackError",
            HandlerError::Encode(_) => "EncodingError",
        }
    }

    pub fn error_info(&self) -> ErrorInfo {
        ErrorInfo::new(self.error_name(), self.to_string())
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn task_type(&self) -> TaskType;

    async fn process(&self, payload: WorkflowPayload) -> Result<HandlerOutcome, HandlerError>;
}

/// How a [`run_task`] invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskDisposition {
    /// The token was completed with this outcome.
    Completed { outcome: StepOutcome },
    /// No signal was sent; someone else will redeem the token.
    Suspended,
    /// The token was failed with this error.
    Failed { error: ErrorInfo },
    /// The payload was already terminal; the handler did not run.
    Skipped { status: AssetStatus },
    /// The token had already been redeemed.
    Duplicate,
}

/// Run one handler invocation under its continuation token.
pub async fn run_task(
    handler: &dyn TaskHandler,
    gateway: &dyn TaskTokenGateway,
    payload: WorkflowPayload,
) -> Result<TaskDisposition, HandlerError> {
    let task_type = handler.task_type();
    let token = payload.task_token()?.to_string();
    let span = create_workflow_span("run_task", &payload.asset_id, Some(task_type.as_str()), None);

    async move {
        if payload.is_terminal() {
            info!(status = %payload.status, "Payload is terminal, skipping handler");
            return Ok(TaskDisposition::Skipped { status: payload.status });
        }

        let asset_id = payload.asset_id.clone();
        let hub_token = payload.execution.hub_task_token.clone();
        debug!(token = %token_hint(&token), "Invoking handler");

        match handler.process(payload).await {
            Ok(HandlerOutcome::Completed { mut payload, outcome }) => {
                ensure_same_asset(&asset_id, &payload)?;
                payload.execution.task_token = Some(token.clone());
                payload.execution.hub_task_token = hub_token;
                info!(outcome = %outcome, status = %payload.status, "Step completed");
                let signal = gateway.complete(&token, TaskOutput { payload, outcome }).await?;
                Ok(disposition(signal, TaskDisposition::Completed { outcome }))
            }
            Ok(HandlerOutcome::Suspended { payload }) => {
                ensure_same_asset(&asset_id, &payload)?;
                info!("Step suspended awaiting callback");
                Ok(TaskDisposition::Suspended)
            }
            Err(e) if e.is_permanent() => {
                let error = e.error_info();
                warn!(error = %e, "Step failed permanently");
                let signal = gateway.fail(&token, error.clone()).await?;
                Ok(disposition(signal, TaskDisposition::Failed { error }))
            }
            Err(e) => {
                warn!(
                    error = %e,
                    transient = e.is_transient(),
                    "Step returned an error to its caller",
                );
                Err(e)
            }
        }
    }
    .instrument(span)
    .await
}

fn ensure_same_asset(expected: &str, payload: &WorkflowPayload) -> Result<(), ValidationError> {
    if payload.asset_id != expected {
        return Err(ValidationError::AssetIdChanged {
            expected: expected.to_string(),
            actual: payload.asset_id.clone(),
        });
    }
    Ok(())
}

fn disposition(signal: CallbackOutcome, accepted: TaskDisposition) -> TaskDisposition {
    match signal {
        CallbackOutcome::Accepted => accepted,
        CallbackOutcome::TokenAlreadyConsumed => {
            info!("Task token already consumed, treating as duplicate delivery");
            TaskDisposition::Duplicate
        }
    }
}

/// Remote resource names derived from the asset. Stable across retries so
/// every create call is idempotent by name.
pub mod naming {
    use crate::payload::WorkflowPayload;

    pub fn data_source_name(payload: &WorkflowPayload) -> String {
        format!("{}-source", payload.resource_prefix())
    }

    pub fn glue_database_name(payload: &WorkflowPayload) -> String {
        format!("{}_db", payload.resource_prefix().replace('-', "_"))
    }

    pub fn connection_name(payload: &WorkflowPayload) -> String {
        format!("{}-connection", payload.resource_prefix())
    }

    pub fn crawler_name(payload: &WorkflowPayload) -> String {
        format!("{}-crawler", payload.resource_prefix())
    }

    pub fn dataset_name(payload: &WorkflowPayload) -> String {
        format!("{}-dataset", payload.resource_prefix())
    }

    pub fn profile_job_name(payload: &WorkflowPayload) -> String {
        format!("{}-profile-job", payload.resource_prefix())
    }

    pub fn recipe_job_name(payload: &WorkflowPayload) -> String {
        format!("{}-recipe-job", payload.resource_prefix())
    }
}

/// Handlers for one side of the system, keyed by the state they serve.
#[derive(Clone)]
pub struct HandlerSet {
    kind: PipelineKind,
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
    start: Option<Arc<StartHandler>>,
}

impl std::fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut states: Vec<&TaskType> = self.handlers.keys().collect();
        states.sort_by_key(|t| t.as_str());
        f.debug_struct("HandlerSet")
            .field("kind", &self.kind)
            .field("states", &states)
            .finish()
    }
}

impl HandlerSet {
    pub fn hub(ctx: Arc<ProvisionerContext>) -> Self {
        let handlers = PipelineKind::Hub
            .definition()
            .states()
            .into_iter()
            .filter_map(|state| hub_handler(state, &ctx).map(|h| (state, h)))
            .collect();
        Self {
            kind: PipelineKind::Hub,
            handlers,
            start: None,
        }
    }

    pub fn spoke(ctx: Arc<ProvisionerContext>) -> Self {
        let handlers = PipelineKind::Spoke
            .definition()
            .states()
            .into_iter()
            .filter_map(|state| spoke_handler(state, &ctx).map(|h| (state, h)))
            .collect();
        Self {
            kind: PipelineKind::Spoke,
            handlers,
            start: Some(Arc::new(StartHandler::new(ctx))),
        }
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    pub fn get(&self, state: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&state).cloned()
    }

    /// The spoke's relay entry point.
    pub fn start(&self) -> Option<Arc<StartHandler>> {
        self.start.clone()
    }
}

fn hub_handler(state: TaskType, ctx: &Arc<ProvisionerContext>) -> Option<Arc<dyn TaskHandler>> {
    let ctx = ctx.clone();
    let handler: Arc<dyn TaskHandler> = match state {
        TaskType::CreateProject => Arc::new(CreateProjectHandler::new(ctx)),
        TaskType::CreateDataSource => Arc::new(CreateDataSourceHandler::new(ctx)),
        TaskType::RunDataSource => Arc::new(RunDataSourceHandler::new(ctx)),
        TaskType::VerifyDataSource => Arc::new(VerifyDataSourceHandler::new(ctx)),
        TaskType::SpokeHandoff => Arc::new(SpokeHandoffHandler::new(ctx)),
        TaskType::Complete => Arc::new(HubCompleteHandler::new(ctx)),
        TaskType::Failed => Arc::new(HubFailedHandler::new(ctx)),
        _ => return None,
    };
    Some(handler)
}

fn spoke_handler(state: TaskType, ctx: &Arc<ProvisionerContext>) -> Option<Arc<dyn TaskHandler>> {
    let ctx = ctx.clone();
    let handler: Arc<dyn TaskHandler> = match state {
        TaskType::Connection => Arc::new(ConnectionHandler::new(ctx)),
        TaskType::DataSet => Arc::new(DataSetHandler::new(ctx)),
        TaskType::GlueCrawler => Arc::new(GlueCrawlerHandler::new(ctx)),
        TaskType::ProfileDataSet => Arc::new(ProfileDataSetHandler::new(ctx)),
        TaskType::ProfileJob => Arc::new(ProfileJobHandler::new(ctx)),
        TaskType::RecipeJob => Arc::new(RecipeJobHandler::new(ctx)),
        TaskType::Cleanup => Arc::new(CleanupHandler::new(ctx)),
        TaskType::SpokeResponse => Arc::new(SpokeResponseHandler::new(ctx)),
        TaskType::Complete => Arc::new(SpokeCompleteHandler),
        TaskType::Failed => Arc::new(SpokeFailedHandler::new(ctx)),
        _ => return None,
    };
    Some(handler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{MemoryTaskTokenGateway, TaskSignal};
    use crate::payload::{CatalogRef, Connection, ObjectStoreSource};

    enum Behaviour {
        Succeed,
        RenameAsset,
        Suspend,
        Fail(RemoteError),
    }

    struct StubHandler {
        behaviour: Behaviour,
    }

    #[async_trait]
    impl TaskHandler for StubHandler {
        fn task_type(&self) -> TaskType {
            TaskType::CreateProject
        }

        async fn process(
            &self,
            mut payload: WorkflowPayload,
        ) -> Result<HandlerOutcome, HandlerError> {
            // Handlers must not be able to mint or drop tokens.
            payload.execution.task_token = None;
            match &self.behaviour {
                Behaviour::Succeed => {
                    Ok(HandlerOutcome::completed(payload, StepOutcome::Succeeded))
                }
                Behaviour::RenameAsset => {
                    payload.asset_id = "A2".to_string();
                    Ok(HandlerOutcome::completed(payload, StepOutcome::Succeeded))
                }
                Behaviour::Suspend => Ok(HandlerOutcome::Suspended { payload }),
                Behaviour::Fail(e) => Err(e.clone().into()),
            }
        }
    }

    fn payload_with(token: Option<&str>) -> WorkflowPayload {
        let mut payload = WorkflowPayload::new(
            "A1",
            CatalogRef {
                domain_id: "D1".into(),
                project_name: "P1".into(),
                ..Default::default()
            },
            Connection::ObjectStoreSource(
                ObjectStoreSource::from_uri("s3://bucket/key.csv", "us-east-1").unwrap(),
            ),
        );
        payload.execution.task_token = token.map(str::to_string);
        payload
    }

    #[tokio::test]
    async fn test_missing_token_is_validation_error() {
        let gateway = MemoryTaskTokenGateway::new("hub");
        let handler = StubHandler { behaviour: Behaviour::Succeed };
        let err = run_task(&handler, &gateway, payload_with(None)).await.unwrap_err();
        assert!(matches!(
            err,
            HandlerError::Validation(ValidationError::MissingField("execution.taskToken"))
        ));
    }

    #[tokio::test]
    async fn test_completed_restores_token_and_signals() {
        let gateway = MemoryTaskTokenGateway::new("hub");
        let pending = gateway.issue();
        let handler = StubHandler { behaviour: Behaviour::Succeed };

        let disposition = run_task(&handler, &gateway, payload_with(Some(&pending.token)))
            .await
            .unwrap();
        assert_eq!(disposition, TaskDisposition::Completed { outcome: StepOutcome::Succeeded });

        match pending.receiver.await.unwrap() {
            TaskSignal::Success(output) => {
                assert_eq!(
                    output.payload.execution.task_token.as_deref(),
                    Some(pending.token.as_str()),
                );
                assert_eq!(output.outcome, StepOutcome::Succeeded);
            }
            other => panic!("unexpected signal: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_asset_id_change_rejected() {
        let gateway = MemoryTaskTokenGateway::new("hub");
        let pending = gateway.issue();
        let handler = StubHandler { behaviour: Behaviour::RenameAsset };

        let err = run_task(&handler, &gateway, payload_with(Some(&pending.token)))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Validation(ValidationError::AssetIdChanged { .. })));
        assert!(!gateway.is_consumed(&pending.token));
    }

    #[tokio::test]
    async fn test_terminal_payload_skipped() {
        let gateway = MemoryTaskTokenGateway::new("hub");
        let pending = gateway.issue();
        let mut payload = payload_with(Some(&pending.token));
        payload.status = AssetStatus::Complete;
        let handler = StubHandler { behaviour: Behaviour::Succeed };

        let disposition = run_task(&handler, &gateway, payload).await.unwrap();
        assert_eq!(disposition, TaskDisposition::Skipped { status: AssetStatus::Complete });
        assert!(!gateway.is_consumed(&pending.token));
    }

    #[tokio::test]
    async fn test_permanent_error_fails_token() {
        let gateway = MemoryTaskTokenGateway::new("hub");
        let pending = gateway.issue();
        let handler = StubHandler {
            behaviour: Behaviour::Fail(RemoteError::not_found("data source DS1")),
        };

        let disposition = run_task(&handler, &gateway, payload_with(Some(&pending.token)))
            .await
            .unwrap();
        let TaskDisposition::Failed { error } = disposition else {
            panic!("expected failure disposition");
        };
        assert_eq!(error.error, "ResourceNotFoundException");
        assert!(matches!(pending.receiver.await.unwrap(), TaskSignal::Failure(_)));
    }

    #[tokio::test]
    async fn test_transient_error_returned_without_signal() {
        let gateway = MemoryTaskTokenGateway::new("hub");
        let pending = gateway.issue();
        let handler = StubHandler {
            behaviour: Behaviour::Fail(RemoteError::Throttled {
                service: "catalog".into(),
                message: "slow down".into(),
            }),
        };

        let err = run_task(&handler, &gateway, payload_with(Some(&pending.token)))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(!gateway.is_consumed(&pending.token));
    }

    #[test]
    fn test_escaped_conflict_is_retried_not_failed() {
        let conflict = HandlerError::from(RemoteError::Conflict {
            resource: "data source DS1 run".into(),
        });
        assert!(conflict.is_transient());
        assert!(!conflict.is_permanent());

        let missing = HandlerError::from(RemoteError::not_found("project P1"));
        assert!(!missing.is_transient());
        assert!(missing.is_permanent());
    }

    #[tokio::test]
    async fn test_suspended_sends_nothing() {
        let gateway = MemoryTaskTokenGateway::new("hub");
        let pending = gateway.issue();
        let handler = StubHandler { behaviour: Behaviour::Suspend };

        let disposition = run_task(&handler, &gateway, payload_with(Some(&pending.token)))
            .await
            .unwrap();
        assert_eq!(disposition, TaskDisposition::Suspended);
        assert_eq!(gateway.outstanding(), 1);
    }

    #[tokio::test]
    async fn test_redelivered_step_is_duplicate() {
        let gateway = MemoryTaskTokenGateway::new("hub");
        let pending = gateway.issue();
        let handler = StubHandler { behaviour: Behaviour::Succeed };

        run_task(&handler, &gateway, payload_with(Some(&pending.token))).await.unwrap();
        let again = run_task(&handler, &gateway, payload_with(Some(&pending.token))).await.unwrap();
        assert_eq!(again, TaskDisposition::Duplicate);
    }
}
