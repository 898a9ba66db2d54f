use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ProvisionerConfig, RelayConfig};
use crate::relay::EventPublisher;
use crate::remote::{
    with_timeout, AssetRepository, CatalogService, CrawlerService, ProfilingService, RemoteError,
};
use crate::store::{PayloadFetcher, PayloadStore};

/// Knobs handlers read at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerSettings {
    pub signed_url_ttl: Duration,
    pub remote_call_timeout: Duration,
    /// Root under which profiling and recipe output is written.
    pub output_root: String,
}

impl HandlerSettings {
    pub fn from_config(config: &ProvisionerConfig) -> Self {
        Self {
            signed_url_ttl: config.store.signed_url_ttl(),
            remote_call_timeout: config.executor.remote_call_timeout(),
            output_root: format!("s3://{}/enrichment-output", config.store.bucket),
        }
    }
}

/// Every collaborator one side (hub or spoke) needs, built once at startup
/// and shared behind an `Arc`.
#[derive(Clone)]
pub struct ProvisionerContext {
    pub catalog: Arc<dyn CatalogService>,
    pub crawler: Arc<dyn CrawlerService>,
    pub profiling: Arc<dyn ProfilingService>,
    pub assets: Arc<dyn AssetRepository>,
    pub store: PayloadStore,
    pub fetcher: Arc<dyn PayloadFetcher>,
    /// Publishes to the *other* side's bus.
    pub publisher: Arc<dyn EventPublisher>,
    pub relay: RelayConfig,
    pub settings: HandlerSettings,
}

impl std::fmt::Debug for ProvisionerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionerContext")
            .field("store", &self.store)
            .field("relay", &self.relay)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ProvisionerContext {
    /// Await a remote call under the configured deadline.
    pub async fn remote<T, F>(&self, operation: &str, call: F) -> Result<T, RemoteError>
    where
        F: Future<Output = Result<T, RemoteError>>,
    {
        with_timeout(operation, self.settings.remote_call_timeout, call).await
    }
}
