use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

use asset_provisioner::config::{ExecutorConfig, ProvisionerConfig};
use asset_provisioner::payload::{RecipeRef, RunStatus};
use asset_provisioner::relay::{RelayEnvelope, RelayEvent};
use asset_provisioner::remote::AssetRepository;
use asset_provisioner::store::{HttpPayloadFetcher, PayloadFetcher};
use asset_provisioner::{init_telemetry, object_store_payload, LocalTopology, PipelineKind};

#[derive(Parser)]
#[command(name = "asset-provisioner")]
#[command(about = "Hub/spoke data asset provisioning")]
#[command(long_about = "Registers data assets in a central catalog (hub) and enriches them in the \
                       account that owns the data (spoke). Use 'asset-provisioner simulate' to run \
                       both pipelines in-process against in-memory services.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a pipeline's transition table
    Transitions {
        /// Pipeline to print: hub or spoke
        #[arg(long, default_value = "hub")]
        pipeline: String,
    },
    /// Provision one object-store asset through the local hub/spoke topology
    Simulate {
        #[arg(long, default_value = "A1")]
        asset_id: String,
        #[arg(long, default_value = "D1")]
        domain: String,
        #[arg(long, default_value = "P1")]
        project: String,
        /// Source object, e.g. s3://bucket/key.csv
        #[arg(long)]
        source: String,
        #[arg(long, default_value = "us-east-1")]
        region: String,
        /// Cleaning recipe applied by the spoke's recipe job
        #[arg(long)]
        recipe: Option<String>,
        /// Make the data-source run fail to exercise the failure path
        #[arg(long)]
        fail_verify: bool,
        /// Use the configured executor timings instead of fast local ones
        #[arg(long)]
        configured_timing: bool,
    },
    /// Classify a relay event envelope read from a JSON file
    ClassifyEvent {
        #[arg(long)]
        file: PathBuf,
    },
    /// Fetch a payload through a presigned HTTP(S) URL
    Fetch {
        url: String,
        #[arg(long, default_value = "30")]
        timeout_seconds: u64,
    },
    /// Print the effective configuration as TOML
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    ProvisionerConfig::load_env_file()?;
    let config = ProvisionerConfig::load()?;
    init_telemetry(&config.observability)?;

    match cli.command {
        Commands::Transitions { pipeline } => transitions_command(&pipeline),
        Commands::Simulate {
            asset_id,
            domain,
            project,
            source,
            region,
            recipe,
            fail_verify,
            configured_timing,
        } => tokio::runtime::Runtime::new()?.block_on(async {
            let options = SimulateOptions {
                asset_id,
                domain,
                project,
                source,
                region,
                recipe,
                fail_verify,
                configured_timing,
            };
            simulate_command(config, options).await
        }),
        Commands::ClassifyEvent { file } => classify_event_command(&config, &file),
        Commands::Fetch { url, timeout_seconds } => tokio::runtime::Runtime::new()?
            .block_on(async { fetch_command(&url, timeout_seconds).await }),
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn transitions_command(pipeline: &str) -> Result<()> {
    let kind: PipelineKind = pipeline.parse()?;
    print!("{}", kind.definition().render());
    Ok(())
}

struct SimulateOptions {
    asset_id: String,
    domain: String,
    project: String,
    source: String,
    region: String,
    recipe: Option<String>,
    fail_verify: bool,
    configured_timing: bool,
}

async fn simulate_command(mut config: ProvisionerConfig, options: SimulateOptions) -> Result<()> {
    if !options.configured_timing {
        config.executor = ExecutorConfig::fast();
    }
    let mut payload = object_store_payload(
        &options.asset_id,
        &options.domain,
        &options.project,
        &options.source,
        &options.region,
    )?;
    if let Some(name) = options.recipe {
        payload = payload.with_recipe(RecipeRef {
            name,
            version: "LATEST_PUBLISHED".to_string(),
        });
    }

    let topology = LocalTopology::start(config);
    if options.fail_verify {
        topology
            .services()
            .catalog
            .script_runs(&[RunStatus::Running, RunStatus::Failed]);
    }

    let report = topology.provision(payload).await?;
    if !options.fail_verify {
        match topology.next_spoke_report(Duration::from_secs(5)).await {
            Some(Ok(spoke)) => println!(
                "spoke: {} ({} steps)",
                spoke.final_state,
                spoke.visited.len(),
            ),
            Some(Err(e)) => println!("spoke: error: {e}"),
            None => println!("spoke: no report"),
        }
    }
    println!(
        "hub: {} ({} steps)",
        report.final_state,
        report.visited.len()
    );
    println!("{}", serde_json::to_string_pretty(&report.payload)?);
    match topology.services().assets.get(&report.payload.asset_id).await? {
        Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
        None => println!("asset record: none"),
    }

    if !report.succeeded() && !options.fail_verify {
        bail!("asset {} ended in {}", report.payload.asset_id, report.final_state);
    }
    Ok(())
}

fn classify_event_command(config: &ProvisionerConfig, file: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read event file {}", file.display()))?;
    let envelope: RelayEnvelope =
        serde_json::from_str(&raw).context("Failed to parse event envelope")?;
    let event = RelayEvent::classify(&envelope, &config.relay);
    println!("{}", event.name());
    if let RelayEvent::Unhandled { reason, .. } = &event {
        println!("reason: {reason}");
    }
    Ok(())
}

async fn fetch_command(url: &str, timeout_seconds: u64) -> Result<()> {
    let fetcher = HttpPayloadFetcher::new(Duration::from_secs(timeout_seconds))?;
    let payload = fetcher.fetch(url).await?;
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}
