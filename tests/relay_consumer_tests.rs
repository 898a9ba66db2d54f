//! Relay consumer behaviour under at-least-once delivery.
//!
//! The gateway and launcher are mocked with mockall so each test pins down
//! exactly which callbacks an event is allowed to trigger.

use async_trait::async_trait;
use mockall::mock;
use std::sync::Arc;
use std::time::Duration;

use asset_provisioner::callback::{
    CallbackError, CallbackOutcome, ErrorInfo, MemoryTaskTokenGateway, TaskOutput, TaskTokenGateway,
};
use asset_provisioner::config::{ProvisionerConfig, RelayConfig};
use asset_provisioner::context::{HandlerSettings, ProvisionerContext};
use asset_provisioner::handlers::HandlerSet;
use asset_provisioner::payload::{ErrorSummary, TaskType, WorkflowPayload};
use asset_provisioner::pipeline::{ExecutorError, PipelineLauncher, StepOutcome};
use asset_provisioner::relay::{
    CompletionDetail, HandoffDetail, HubRelayConsumer, MemoryEventBus, RelayConsumer,
    RelayDisposition, RelayEnvelope, RelayError, SpokeRelayConsumer,
};
use asset_provisioner::store::{MemoryObjectStorage, PayloadStore, StorageUrlFetcher};
use asset_provisioner::{object_store_payload, MemoryServices};

mock! {
    pub Gateway {}

    #[async_trait]
    impl TaskTokenGateway for Gateway {
        async fn complete(
            &self,
            token: &str,
            output: TaskOutput,
        ) -> Result<CallbackOutcome, CallbackError>;
        async fn fail(
            &self,
            token: &str,
            error: ErrorInfo,
        ) -> Result<CallbackOutcome, CallbackError>;
    }
}

mock! {
    pub Launcher {}

    #[async_trait]
    impl PipelineLauncher for Launcher {
        async fn launch(&self, payload: WorkflowPayload) -> Result<String, ExecutorError>;
    }
}

const HUB_TOKEN: &str = "hub-token-0001";

/// One side's context: `own` is its payload store, `peer` the storage it
/// can only read through signed URLs.
struct Side {
    context: Arc<ProvisionerContext>,
    peer: Arc<MemoryObjectStorage>,
}

fn side(bucket: &str, peer_bucket: &str) -> Side {
    let config = ProvisionerConfig::default();
    let services = MemoryServices::default();
    let own = Arc::new(MemoryObjectStorage::new(bucket, "own-secret"));
    let peer = Arc::new(MemoryObjectStorage::new(peer_bucket, "peer-secret"));
    let (bus, _inbox) = MemoryEventBus::channel("unused");
    let context = Arc::new(ProvisionerContext {
        catalog: services.catalog,
        crawler: services.crawler,
        profiling: services.profiling,
        assets: services.assets,
        store: PayloadStore::new(own, "payloads"),
        fetcher: Arc::new(StorageUrlFetcher::new(peer.clone())),
        publisher: Arc::new(bus),
        relay: RelayConfig::default(),
        settings: HandlerSettings::from_config(&config),
    });
    Side { context, peer }
}

fn payload() -> WorkflowPayload {
    let mut payload =
        object_store_payload("A1", "D1", "P1", "s3://bucket/key.csv", "us-east-1").unwrap();
    payload.execution.data_source_run_id = Some("R1".into());
    payload
}

/// Hub with its stash written and the spoke's response stored on the peer.
async fn hub_with_response(response: &WorkflowPayload) -> (Side, String) {
    let hub = side("hub-bucket", "spoke-bucket");
    let mut stash = payload();
    stash.execution.hub_task_token = Some(HUB_TOKEN.into());
    hub.context.store.put(TaskType::SpokeHandoff, "R1", &stash).await.unwrap();

    let spoke_store = PayloadStore::new(hub.peer.clone(), "payloads");
    spoke_store.put(TaskType::SpokeResponse, "A1", response).await.unwrap();
    let url = spoke_store
        .presign(TaskType::SpokeResponse, "A1", Duration::from_secs(60))
        .await
        .unwrap();
    (hub, url)
}

fn completion(detail_type: &str, url: &str, run_id: Option<&str>) -> RelayEnvelope {
    let relay = RelayConfig::default();
    RelayEnvelope::new(
        relay.spoke_source,
        detail_type,
        &CompletionDetail {
            asset_id: "A1".into(),
            full_payload_signed_url: url.into(),
            data_source_run_id: run_id.map(str::to_string),
        },
    )
    .unwrap()
}

#[tokio::test]
async fn test_completion_resumes_hub_step_once() {
    let (hub, url) = hub_with_response(&payload()).await;
    let mut gateway = MockGateway::new();
    gateway
        .expect_complete()
        .withf(|token, output| {
            token == HUB_TOKEN
                && output.outcome == StepOutcome::Succeeded
                && output.payload.execution.hub_task_token.is_none()
        })
        .times(1)
        .returning(|_, _| Ok(CallbackOutcome::Accepted));
    let consumer = HubRelayConsumer::new(hub.context.clone(), Arc::new(gateway));

    let envelope = completion(&RelayConfig::default().completed_detail_type, &url, Some("R1"));
    assert_eq!(consumer.handle(envelope.clone()).await.unwrap(), RelayDisposition::Dispatched);
    // Redelivery of the same event id never reaches the gateway.
    assert_eq!(consumer.handle(envelope).await.unwrap(), RelayDisposition::Duplicate);
}

#[tokio::test]
async fn test_second_completion_event_is_absorbed_by_gateway() {
    let (hub, url) = hub_with_response(&payload()).await;
    let gateway = Arc::new(MemoryTaskTokenGateway::new("hub"));
    let pending = gateway.issue();
    let mut stash = payload();
    stash.execution.hub_task_token = Some(pending.token.clone());
    hub.context.store.put(TaskType::SpokeHandoff, "R1", &stash).await.unwrap();

    let consumer = HubRelayConsumer::new(hub.context.clone(), gateway.clone());
    let completed = RelayConfig::default().completed_detail_type;

    let first = consumer.handle(completion(&completed, &url, Some("R1"))).await.unwrap();
    let second = consumer.handle(completion(&completed, &url, Some("R1"))).await.unwrap();

    assert_eq!(first, RelayDisposition::Dispatched);
    assert_eq!(second, RelayDisposition::Duplicate);
    assert!(pending.receiver.await.is_ok());
}

#[tokio::test]
async fn test_run_id_falls_back_to_payload() {
    let (hub, url) = hub_with_response(&payload()).await;
    let mut gateway = MockGateway::new();
    gateway
        .expect_complete()
        .withf(|token, _| token == HUB_TOKEN)
        .times(1)
        .returning(|_, _| Ok(CallbackOutcome::Accepted));
    let consumer = HubRelayConsumer::new(hub.context.clone(), Arc::new(gateway));

    let envelope = completion(&RelayConfig::default().completed_detail_type, &url, None);
    assert_eq!(consumer.handle(envelope).await.unwrap(), RelayDisposition::Dispatched);
}

#[tokio::test]
async fn test_failure_event_fails_hub_step_with_spoke_error() {
    let mut response = payload();
    response.execution.error = Some(ErrorSummary {
        error: "RunFailed".into(),
        cause: "crawler reported FAILED".into(),
        failed_step: Some(TaskType::GlueCrawler),
    });
    let (hub, url) = hub_with_response(&response).await;

    let mut gateway = MockGateway::new();
    gateway.expect_complete().never();
    gateway
        .expect_fail()
        .withf(|token, error| {
            token == HUB_TOKEN
                && error.error == "RunFailed"
                && error.cause.starts_with("spoke step GlueCrawler")
        })
        .times(1)
        .returning(|_, _| Ok(CallbackOutcome::Accepted));
    let consumer = HubRelayConsumer::new(hub.context.clone(), Arc::new(gateway));

    let envelope = completion(&RelayConfig::default().failed_detail_type, &url, Some("R1"));
    assert_eq!(consumer.handle(envelope).await.unwrap(), RelayDisposition::Dispatched);
}

#[tokio::test]
async fn test_unroutable_event_is_ignored() {
    let hub = side("hub-bucket", "spoke-bucket");
    let consumer = HubRelayConsumer::new(hub.context.clone(), Arc::new(MockGateway::new()));

    let envelope =
        RelayEnvelope::new("someone.else", "Enrichment Completed", &serde_json::json!({})).unwrap();
    assert_eq!(consumer.handle(envelope).await.unwrap(), RelayDisposition::Ignored);
}

#[tokio::test]
async fn test_mismatched_asset_is_rejected() {
    let mut response = payload();
    response.asset_id = "A2".into();
    let (hub, url) = hub_with_response(&response).await;
    let consumer = HubRelayConsumer::new(hub.context.clone(), Arc::new(MockGateway::new()));

    let envelope = completion(&RelayConfig::default().completed_detail_type, &url, Some("R1"));
    let err = consumer.handle(envelope).await.unwrap_err();
    assert!(matches!(err, RelayError::Validation(_)));
    assert!(!err.is_reissuable());
}

fn spoke_consumer(spoke: &Side, launcher: MockLauncher) -> SpokeRelayConsumer {
    let start = HandlerSet::spoke(spoke.context.clone()).start().unwrap();
    SpokeRelayConsumer::new(start, Arc::new(launcher), RelayConfig::default())
}

async fn handoff(spoke: &Side, handed_off: &WorkflowPayload) -> RelayEnvelope {
    let hub_store = PayloadStore::new(spoke.peer.clone(), "payloads");
    hub_store.put(TaskType::RunDataSource, "R1", handed_off).await.unwrap();
    let url = hub_store
        .presign(TaskType::RunDataSource, "R1", Duration::from_secs(60))
        .await
        .unwrap();
    let relay = RelayConfig::default();
    RelayEnvelope::new(
        relay.hub_source,
        relay.handoff_detail_type,
        &HandoffDetail {
            asset_id: "A1".into(),
            full_payload_signed_url: url,
            data_source_run_id: "R1".into(),
        },
    )
    .unwrap()
}

#[tokio::test]
async fn test_handoff_launches_one_spoke_execution() {
    let spoke = side("spoke-bucket", "hub-bucket");
    let mut launcher = MockLauncher::new();
    launcher
        .expect_launch()
        .withf(|payload| payload.asset_id == "A1" && !payload.carries_token())
        .times(1)
        .returning(|_| Ok("exec-1".to_string()));
    let consumer = spoke_consumer(&spoke, launcher);

    let envelope = handoff(&spoke, &payload()).await;
    assert_eq!(consumer.handle(envelope.clone()).await.unwrap(), RelayDisposition::Dispatched);
    assert_eq!(consumer.handle(envelope).await.unwrap(), RelayDisposition::Duplicate);
}

#[tokio::test]
async fn test_handoff_carrying_token_is_rejected() {
    let spoke = side("spoke-bucket", "hub-bucket");
    let mut launcher = MockLauncher::new();
    launcher.expect_launch().never();
    let consumer = spoke_consumer(&spoke, launcher);

    let mut leaked = payload();
    leaked.execution.hub_task_token = Some(HUB_TOKEN.into());
    let err = consumer.handle(handoff(&spoke, &leaked).await).await.unwrap_err();
    assert!(matches!(err, RelayError::Validation(_)));
}

#[tokio::test]
async fn test_expired_handoff_url_is_reissuable() {
    let spoke = side("spoke-bucket", "hub-bucket");
    let mut launcher = MockLauncher::new();
    launcher.expect_launch().never();
    let consumer = spoke_consumer(&spoke, launcher);

    let hub_store = PayloadStore::new(spoke.peer.clone(), "payloads");
    hub_store.put(TaskType::RunDataSource, "R1", &payload()).await.unwrap();
    let path = hub_store.path(TaskType::RunDataSource, "R1");
    let url = spoke
        .peer
        .presign_until(&path, chrono::Utc::now() - chrono::Duration::seconds(5))
        .unwrap();
    let relay = RelayConfig::default();
    let envelope = RelayEnvelope::new(
        relay.hub_source,
        relay.handoff_detail_type,
        &HandoffDetail {
            asset_id: "A1".into(),
            full_payload_signed_url: url,
            data_source_run_id: "R1".into(),
        },
    )
    .unwrap();

    let err = consumer.handle(envelope.clone()).await.unwrap_err();
    assert!(err.is_reissuable());
    // A failed event is not remembered, so redelivery is attempted again.
    assert!(consumer.handle(envelope).await.unwrap_err().is_reissuable());
}
