use anyhow::{bail, Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

pub const CONFIG_FILE: &str = "asset-provisioner.toml";
pub const RC_FILE: &str = ".asset-provisioner-rc";
pub const ENV_PREFIX: &str = "ASSET_PROVISIONER";

/// Main configuration structure for the provisioner
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// Catalog (hub) account
    pub hub: AccountConfig,
    /// Data-source (spoke) account
    pub spoke: AccountConfig,
    /// Payload store settings
    pub store: StoreConfig,
    /// Event relay settings
    pub relay: RelayConfig,
    /// Local executor settings
    pub executor: ExecutorConfig,
    /// Observability settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AccountConfig {
    pub account_id: String,
    pub region: String,
    /// Bus this account receives relay events on
    pub event_bus_name: String,
}

impl AccountConfig {
    fn hub() -> Self {
        Self {
            account_id: "111111111111".to_string(),
            region: "us-east-1".to_string(),
            event_bus_name: "datalake-hub-bus".to_string(),
        }
    }

    fn spoke() -> Self {
        Self {
            account_id: "222222222222".to_string(),
            region: "us-east-1".to_string(),
            event_bus_name: "datalake-spoke-bus".to_string(),
        }
    }
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self::hub()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub bucket: String,
    pub prefix: String,
    pub signed_url_ttl_seconds: u64,
    /// HMAC secret for signed URLs; a random one is generated when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signing_secret: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            bucket: "datalake-task-payloads".to_string(),
            prefix: "payloads".to_string(),
            signed_url_ttl_seconds: 900,
            signing_secret: None,
        }
    }
}

impl StoreConfig {
    pub fn signed_url_ttl(&self) -> Duration {
        Duration::from_secs(self.signed_url_ttl_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    pub hub_source: String,
    pub spoke_source: String,
    pub handoff_detail_type: String,
    pub completed_detail_type: String,
    pub failed_detail_type: String,
    /// How long a seen event id is remembered for deduplication
    pub dedupe_ttl_seconds: u64,
    pub dedupe_capacity: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            hub_source: "datalake.hub.orchestration".to_string(),
            spoke_source: "datalake.spoke.enrichment".to_string(),
            handoff_detail_type: "Enrichment Requested".to_string(),
            completed_detail_type: "Enrichment Completed".to_string(),
            failed_detail_type: "Enrichment Failed".to_string(),
            dedupe_ttl_seconds: 3600,
            dedupe_capacity: 10_000,
        }
    }
}

impl RelayConfig {
    pub fn dedupe_ttl(&self) -> Duration {
        Duration::from_secs(self.dedupe_ttl_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Upper bound on waiting for a step's token to be redeemed
    pub step_timeout_seconds: u64,
    /// Delay between visits of a polling step
    pub poll_interval_millis: u64,
    /// Attempts per step before a transient error becomes fatal
    pub max_attempts: u32,
    /// First retry delay; each later retry doubles it
    pub base_backoff_millis: u64,
    /// Ceiling on a single retry delay
    pub max_backoff_millis: u64,
    /// Hard cap on state transitions per execution
    pub max_transitions: u32,
    pub remote_call_timeout_seconds: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            step_timeout_seconds: 3600,
            poll_interval_millis: 30_000,
            max_attempts: 3,
            base_backoff_millis: 2_000,
            max_backoff_millis: 60_000,
            max_transitions: 500,
            remote_call_timeout_seconds: 30,
        }
    }
}

impl ExecutorConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_millis)
    }

    pub fn remote_call_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_call_timeout_seconds)
    }

    /// Settings for fast in-process runs (simulation, tests).
    pub fn fast() -> Self {
        Self {
            step_timeout_seconds: 10,
            poll_interval_millis: 5,
            max_attempts: 3,
            base_backoff_millis: 5,
            max_backoff_millis: 50,
            max_transitions: 200,
            remote_call_timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level used when RUST_LOG is unset
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones
    pub json: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json: true,
        }
    }
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            hub: AccountConfig::hub(),
            spoke: AccountConfig::spoke(),
            store: StoreConfig::default(),
            relay: RelayConfig::default(),
            executor: ExecutorConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl ProvisionerConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (asset-provisioner.toml, .asset-provisioner-rc)
    /// 3. Environment variables (ASSET_PROVISIONER_STORE__BUCKET, ...)
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("."), None)
    }

    /// Load with files looked up in `dir`. `env` replaces the process
    /// environment as the variable source when given.
    pub fn load_from(dir: &Path, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = Config::builder().add_source(
            Config::try_from(&Self::default()).context("Failed to seed default configuration")?,
        );

        let toml_path = dir.join(CONFIG_FILE);
        if toml_path.exists() {
            builder = builder.add_source(File::from(toml_path).format(FileFormat::Toml));
        }

        let rc_path = dir.join(RC_FILE);
        if rc_path.exists() {
            builder = builder.add_source(File::from(rc_path).format(FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let config = builder.build().context("Failed to build configuration")?;
        let loaded: ProvisionerConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<()> {
        if self.store.bucket.trim().is_empty() {
            bail!("store.bucket must not be empty");
        }
        if self.store.signed_url_ttl_seconds == 0 {
            bail!("store.signed_url_ttl_seconds must be positive");
        }
        if self.executor.max_attempts == 0 {
            bail!("executor.max_attempts must be at least 1");
        }
        if self.executor.max_backoff_millis < self.executor.base_backoff_millis {
            bail!("executor.max_backoff_millis must not be below executor.base_backoff_millis");
        }
        if self.executor.max_transitions == 0 {
            bail!("executor.max_transitions must be at least 1");
        }
        if self.relay.hub_source == self.relay.spoke_source {
            bail!("relay.hub_source and relay.spoke_source must differ");
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ProvisionerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.relay.handoff_detail_type, "Enrichment Requested");
        assert_eq!(config.store.signed_url_ttl(), Duration::from_secs(900));
    }

    #[test]
    fn test_invalid_attempts_rejected() {
        let mut config = ProvisionerConfig::default();
        config.executor.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_ceiling_below_base_rejected() {
        let mut config = ProvisionerConfig::default();
        config.executor.max_backoff_millis = config.executor.base_backoff_millis - 1;
        assert!(config.validate().is_err());
        assert!(ProvisionerConfig {
            executor: ExecutorConfig::fast(),
            ..Default::default()
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn test_default_accounts_are_distinct() {
        let config = ProvisionerConfig::default();
        assert_ne!(config.hub.account_id, config.spoke.account_id);
        assert_ne!(config.hub.event_bus_name, config.spoke.event_bus_name);
    }
}
