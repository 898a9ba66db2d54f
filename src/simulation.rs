//! Local hub/spoke topology
//!
//! Wires both sides in one process: a payload store per account, an event
//! bus per account with a pump feeding its relay consumer, a token gateway
//! and executor per side, and shared in-memory remote services. Each side
//! can read the other's payloads only through signed URLs.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::callback::{MemoryTaskTokenGateway, TaskTokenGateway};
use crate::config::ProvisionerConfig;
use crate::context::{HandlerSettings, ProvisionerContext};
use crate::handlers::HandlerSet;
use crate::payload::{CatalogRef, Connection, ObjectStoreSource, ValidationError, WorkflowPayload};
use crate::pipeline::{ExecutionReport, ExecutorError, LocalExecutor, PipelineLauncher};
use crate::relay::{spawn_pump, HubRelayConsumer, MemoryEventBus, RelayConsumer, SpokeRelayConsumer};
use crate::remote::memory::{
    MemoryAssetRepository, MemoryCatalogService, MemoryCrawlerService, MemoryProfilingService,
};
use crate::store::{MemoryObjectStorage, PayloadStore, StorageUrlFetcher};

type ReportReceiver = mpsc::UnboundedReceiver<Result<ExecutionReport, ExecutorError>>;

/// In-memory remote services, exposed for fault injection.
#[derive(Debug, Clone, Default)]
pub struct MemoryServices {
    pub catalog: Arc<MemoryCatalogService>,
    pub crawler: Arc<MemoryCrawlerService>,
    pub profiling: Arc<MemoryProfilingService>,
    pub assets: Arc<MemoryAssetRepository>,
}

/// Build an `s3://` object-store payload in PENDING state.
pub fn object_store_payload(
    asset_id: &str,
    domain_id: &str,
    project_name: &str,
    uri: &str,
    region: &str,
) -> Result<WorkflowPayload, ValidationError> {
    let source = ObjectStoreSource::from_uri(uri, region)?;
    Ok(WorkflowPayload::new(
        asset_id,
        CatalogRef {
            domain_id: domain_id.to_string(),
            project_name: project_name.to_string(),
            ..Default::default()
        },
        Connection::ObjectStoreSource(source),
    ))
}

fn signing_secret(config: &ProvisionerConfig) -> Vec<u8> {
    match &config.store.signing_secret {
        Some(secret) => secret.as_bytes().to_vec(),
        None => rand::rng().random::<[u8; 32]>().to_vec(),
    }
}

pub struct LocalTopology {
    config: ProvisionerConfig,
    services: MemoryServices,
    hub_storage: Arc<MemoryObjectStorage>,
    spoke_storage: Arc<MemoryObjectStorage>,
    hub_bus: Arc<MemoryEventBus>,
    spoke_bus: Arc<MemoryEventBus>,
    hub_context: Arc<ProvisionerContext>,
    spoke_context: Arc<ProvisionerContext>,
    hub_executor: LocalExecutor,
    spoke_executor: LocalExecutor,
    spoke_reports: Mutex<ReportReceiver>,
    pumps: Vec<JoinHandle<()>>,
}

impl LocalTopology {
    /// Build both sides and start the relay pumps. Must be called inside a
    /// Tokio runtime.
    pub fn start(config: ProvisionerConfig) -> Self {
        Self::with_services(config, MemoryServices::default())
    }

    pub fn with_services(config: ProvisionerConfig, services: MemoryServices) -> Self {
        let hub_storage = Arc::new(MemoryObjectStorage::new(
            config.store.bucket.clone(),
            signing_secret(&config),
        ));
        let spoke_storage = Arc::new(MemoryObjectStorage::new(
            format!("{}-{}", config.store.bucket, config.spoke.account_id),
            signing_secret(&config),
        ));

        let (hub_bus, hub_inbox) = MemoryEventBus::channel(config.hub.event_bus_name.clone());
        let (spoke_bus, spoke_inbox) = MemoryEventBus::channel(config.spoke.event_bus_name.clone());
        let hub_bus = Arc::new(hub_bus);
        let spoke_bus = Arc::new(spoke_bus);

        let settings = HandlerSettings::from_config(&config);
        let context = |storage: &Arc<MemoryObjectStorage>,
                       peer_storage: &Arc<MemoryObjectStorage>,
                       publisher: &Arc<MemoryEventBus>| {
            Arc::new(ProvisionerContext {
                catalog: services.catalog.clone(),
                crawler: services.crawler.clone(),
                profiling: services.profiling.clone(),
                assets: services.assets.clone(),
                store: PayloadStore::new(storage.clone(), config.store.prefix.clone()),
                fetcher: Arc::new(StorageUrlFetcher::new(peer_storage.clone())),
                publisher: publisher.clone(),
                relay: config.relay.clone(),
                settings: settings.clone(),
            })
        };
        // Each side publishes onto the other side's bus.
        let hub_context = context(&hub_storage, &spoke_storage, &spoke_bus);
        let spoke_context = context(&spoke_storage, &hub_storage, &hub_bus);

        let hub_gateway = Arc::new(MemoryTaskTokenGateway::new("hub"));
        let spoke_gateway = Arc::new(MemoryTaskTokenGateway::new("spoke"));

        let hub_executor = LocalExecutor::new(
            HandlerSet::hub(hub_context.clone()),
            hub_gateway.clone(),
            config.executor.clone(),
        );
        let (report_tx, report_rx) = mpsc::unbounded_channel();
        let spoke_handlers = HandlerSet::spoke(spoke_context.clone());
        let spoke_start = spoke_handlers.start();
        let spoke_executor =
            LocalExecutor::new(spoke_handlers, spoke_gateway.clone(), config.executor.clone())
                .with_reports(report_tx);

        let hub_consumer: Arc<dyn RelayConsumer> = Arc::new(HubRelayConsumer::new(
            hub_context.clone(),
            hub_gateway as Arc<dyn TaskTokenGateway>,
        ));
        let mut pumps = vec![spawn_pump(hub_bus.name(), hub_inbox, hub_consumer)];
        if let Some(start) = spoke_start {
            let launcher: Arc<dyn PipelineLauncher> = Arc::new(spoke_executor.clone());
            let spoke_consumer: Arc<dyn RelayConsumer> =
                Arc::new(SpokeRelayConsumer::new(start, launcher, config.relay.clone()));
            pumps.push(spawn_pump(spoke_bus.name(), spoke_inbox, spoke_consumer));
        }

        info!(
            hub_bus = %hub_bus.name(),
            spoke_bus = %spoke_bus.name(),
            "Local topology started"
        );
        Self {
            config,
            services,
            hub_storage,
            spoke_storage,
            hub_bus,
            spoke_bus,
            hub_context,
            spoke_context,
            hub_executor,
            spoke_executor,
            spoke_reports: Mutex::new(report_rx),
            pumps,
        }
    }

    /// Run the hub pipeline for `payload` to a terminal state. The spoke leg
    /// runs on its own tasks, driven by relay events.
    pub async fn provision(
        &self,
        payload: WorkflowPayload,
    ) -> Result<ExecutionReport, ExecutorError> {
        self.hub_executor.execute(payload).await
    }

    /// Next finished spoke execution, if one finishes within `wait`.
    pub async fn next_spoke_report(
        &self,
        wait: Duration,
    ) -> Option<Result<ExecutionReport, ExecutorError>> {
        let mut reports = self.spoke_reports.lock().await;
        tokio::time::timeout(wait, reports.recv()).await.ok().flatten()
    }

    pub fn config(&self) -> &ProvisionerConfig {
        &self.config
    }

    pub fn services(&self) -> &MemoryServices {
        &self.services
    }

    pub fn hub_storage(&self) -> &Arc<MemoryObjectStorage> {
        &self.hub_storage
    }

    pub fn spoke_storage(&self) -> &Arc<MemoryObjectStorage> {
        &self.spoke_storage
    }

    /// Bus the hub receives on.
    pub fn hub_bus(&self) -> &Arc<MemoryEventBus> {
        &self.hub_bus
    }

    /// Bus the spoke receives on.
    pub fn spoke_bus(&self) -> &Arc<MemoryEventBus> {
        &self.spoke_bus
    }

    pub fn hub_context(&self) -> &Arc<ProvisionerContext> {
        &self.hub_context
    }

    pub fn spoke_context(&self) -> &Arc<ProvisionerContext> {
        &self.spoke_context
    }

    pub fn hub_gateway(&self) -> &Arc<MemoryTaskTokenGateway> {
        self.hub_executor.gateway()
    }

    pub fn spoke_gateway(&self) -> &Arc<MemoryTaskTokenGateway> {
        self.spoke_executor.gateway()
    }

    pub fn spoke_executor(&self) -> &LocalExecutor {
        &self.spoke_executor
    }
}

impl Drop for LocalTopology {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;
    use crate::payload::{AssetStatus, TaskType};

    fn fast_config() -> ProvisionerConfig {
        ProvisionerConfig {
            executor: ExecutorConfig::fast(),
            ..Default::default()
        }
    }

    #[test]
    fn test_object_store_payload_rejects_bad_uri() {
        assert!(object_store_payload("A1", "D1", "P1", "bucket/key.csv", "us-east-1").is_err());
    }

    #[tokio::test]
    async fn test_happy_path_completes_both_sides() {
        let topology = LocalTopology::start(fast_config());
        let payload =
            object_store_payload("A1", "D1", "P1", "s3://bucket/key.csv", "us-east-1").unwrap();

        let report = topology.provision(payload).await.unwrap();
        assert!(report.succeeded(), "hub ended in {}", report.final_state);
        assert_eq!(report.payload.status, AssetStatus::Complete);
        assert_eq!(report.payload.catalog.data_source_id.as_deref(), Some("DS1"));
        assert_eq!(report.payload.execution.data_source_run_id.as_deref(), Some("R1"));

        let spoke = topology
            .next_spoke_report(Duration::from_secs(5))
            .await
            .expect("spoke report")
            .unwrap();
        assert_eq!(spoke.final_state, TaskType::Complete);
        assert_eq!(topology.hub_bus().published().len(), 1);
        assert_eq!(topology.spoke_bus().published().len(), 1);
    }

    #[tokio::test]
    async fn test_each_side_publishes_to_the_other() {
        let topology = LocalTopology::start(fast_config());
        let payload = object_store_payload(
            "A2",
            "D1",
            "P1",
            "s3://bucket/data/key.csv",
            "us-east-1",
        )
        .unwrap();
        topology.provision(payload).await.unwrap();

        let handoff = &topology.spoke_bus().published()[0];
        assert_eq!(handoff.source, topology.config().relay.hub_source);
        let response = &topology.hub_bus().published()[0];
        assert_eq!(response.source, topology.config().relay.spoke_source);
    }
}
