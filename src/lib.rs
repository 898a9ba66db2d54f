// Asset Provisioner Library - Hub/spoke data asset provisioning
// This exposes the core components for testing and integration

pub mod callback;
pub mod config;
pub mod context;
pub mod handlers;
pub mod payload;
pub mod pipeline;
pub mod relay;
pub mod remote;
pub mod simulation;
pub mod store;
pub mod telemetry;

// Re-export key types for easy access
pub use callback::{CallbackError, CallbackOutcome, ErrorInfo, TaskOutput, TaskTokenGateway};
pub use config::ProvisionerConfig;
pub use context::{HandlerSettings, ProvisionerContext};
pub use handlers::{
    run_task, HandlerError, HandlerOutcome, HandlerSet, TaskDisposition, TaskHandler,
};
pub use payload::{AssetStatus, Connection, RunStatus, TaskType, ValidationError, WorkflowPayload};
pub use pipeline::{ExecutionReport, LocalExecutor, PipelineKind, PipelineLauncher, StepOutcome};
pub use relay::{HubRelayConsumer, RelayEnvelope, RelayEvent, SpokeRelayConsumer};
pub use remote::{ErrorClass, RemoteError};
pub use simulation::{object_store_payload, LocalTopology, MemoryServices};
pub use store::{PayloadFetcher, PayloadStore, RetrievalError, StoreError};
pub use telemetry::{create_workflow_span, generate_correlation_id, init_telemetry};
