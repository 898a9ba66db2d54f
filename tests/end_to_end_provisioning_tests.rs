//! End-to-end provisioning through the local hub/spoke topology.
//!
//! Both pipelines run in-process against in-memory services; the only link
//! between the two sides is the relay events and signed payload URLs.

use std::time::Duration;

use asset_provisioner::config::{ExecutorConfig, ProvisionerConfig};
use asset_provisioner::payload::{
    AssetStatus, CatalogRef, CatalogTableSource, Connection, RecipeRef, RunStatus, TaskType,
    WarehouseSource, WorkflowPayload,
};
use asset_provisioner::remote::{AssetRepository, DataSourceConfiguration, RemoteError};
use asset_provisioner::{object_store_payload, ExecutionReport, LocalTopology};

fn fast_config() -> ProvisionerConfig {
    ProvisionerConfig {
        executor: ExecutorConfig::fast(),
        ..Default::default()
    }
}

fn csv_payload(asset_id: &str) -> WorkflowPayload {
    object_store_payload(asset_id, "D1", "P1", "s3://bucket/key.csv", "us-east-1").unwrap()
}

async fn spoke_report(topology: &LocalTopology) -> ExecutionReport {
    topology
        .next_spoke_report(Duration::from_secs(5))
        .await
        .expect("spoke execution should finish")
        .expect("spoke execution should not error")
}

#[tokio::test]
async fn test_object_store_asset_is_provisioned() {
    let topology = LocalTopology::start(fast_config());

    let report = topology.provision(csv_payload("A1")).await.unwrap();

    assert_eq!(report.final_state, TaskType::Complete);
    assert_eq!(report.payload.status, AssetStatus::Complete);
    assert_eq!(report.payload.catalog.project_id.as_deref(), Some("proj-1"));
    assert_eq!(report.payload.catalog.data_source_id.as_deref(), Some("DS1"));
    assert_eq!(report.payload.execution.data_source_run_id.as_deref(), Some("R1"));
    assert_eq!(report.payload.execution.data_source_run_status, Some(RunStatus::Succeeded));
    assert!(report.payload.execution.error.is_none());

    // Verify polled at least once while the run was RUNNING.
    let verify_visits = report
        .visited
        .iter()
        .filter(|s| **s == TaskType::VerifyDataSource)
        .count();
    assert!(verify_visits >= 2, "visited: {:?}", report.visited);

    let record = topology.services().assets.get("A1").await.unwrap().unwrap();
    assert_eq!(record.status, AssetStatus::Complete);
    assert_eq!(record.data_source_id.as_deref(), Some("DS1"));

    let spoke = spoke_report(&topology).await;
    assert_eq!(spoke.final_state, TaskType::Complete);
    assert!(spoke.payload.execution.cleaned_up);
    assert!(spoke.payload.execution.glue_table.is_some());
    assert!(spoke.payload.execution.profile_output_location.is_some());
    assert!(spoke.visited.contains(&TaskType::RecipeJob));
}

#[tokio::test]
async fn test_spoke_never_sees_hub_token() {
    let topology = LocalTopology::start(fast_config());
    topology.provision(csv_payload("A1")).await.unwrap();
    let spoke = spoke_report(&topology).await;

    assert!(spoke.payload.execution.hub_task_token.is_none());

    // The token-free handoff record is what the spoke fetched.
    let handoff = topology
        .hub_context()
        .store
        .get(TaskType::RunDataSource, "R1")
        .await
        .unwrap();
    assert!(!handoff.carries_token());

    // The hub-private stash does carry it, and it never appears on the wire.
    let stash = topology
        .hub_context()
        .store
        .get(TaskType::SpokeHandoff, "R1")
        .await
        .unwrap();
    let hub_token = stash.execution.hub_task_token.expect("stash keeps the hub token");
    for envelope in topology.spoke_bus().published() {
        let wire = serde_json::to_string(&envelope).unwrap();
        assert!(!wire.contains(&hub_token));
    }
    assert!(topology.hub_gateway().is_consumed(&hub_token));
}

#[tokio::test]
async fn test_recipe_job_runs_when_recipe_given() {
    let topology = LocalTopology::start(fast_config());
    let payload = csv_payload("A1").with_recipe(RecipeRef {
        name: "clean-orders".to_string(),
        version: "1".to_string(),
    });

    let report = topology.provision(payload).await.unwrap();
    assert!(report.succeeded());

    let spoke = spoke_report(&topology).await;
    assert!(spoke.payload.execution.recipe_job_run_id.is_some());
    assert_eq!(spoke.payload.execution.recipe_job_status, Some(RunStatus::Succeeded));
    // One profile job and one recipe job.
    assert_eq!(topology.services().profiling.job_creates(), 2);
}

#[tokio::test]
async fn test_catalog_table_source_skips_crawler() {
    let topology = LocalTopology::start(fast_config());
    let payload = WorkflowPayload::new(
        "A3",
        CatalogRef {
            domain_id: "D1".into(),
            project_name: "P1".into(),
            ..Default::default()
        },
        Connection::CatalogTableSource(CatalogTableSource {
            database: "sales".into(),
            table: "orders".into(),
            region: "us-east-1".into(),
        }),
    );

    let report = topology.provision(payload).await.unwrap();
    assert!(report.succeeded());

    let spoke = spoke_report(&topology).await;
    assert_eq!(spoke.final_state, TaskType::Complete);
    assert_eq!(spoke.payload.execution.glue_database.as_deref(), Some("sales"));
    assert_eq!(spoke.payload.execution.glue_table.as_deref(), Some("orders"));
    assert_eq!(topology.services().crawler.crawler_creates(), 0);
    assert_eq!(topology.services().crawler.database_creates(), 0);

    let spec = topology.services().catalog.data_source_spec("DS1").unwrap();
    assert_eq!(
        spec.configuration,
        DataSourceConfiguration::Glue {
            database: "sales".into(),
            table: Some("orders".into()),
        }
    );
}

#[tokio::test]
async fn test_warehouse_source_creates_and_cleans_up_connection() {
    let topology = LocalTopology::start(fast_config());
    let payload = WorkflowPayload::new(
        "A4",
        CatalogRef {
            domain_id: "D1".into(),
            project_name: "P1".into(),
            ..Default::default()
        },
        Connection::WarehouseSource(WarehouseSource {
            cluster_identifier: Some("analytics".into()),
            account_id: Some("222222222222".into()),
            database: "dev".into(),
            schema: "public".into(),
            table: "orders".into(),
            region: "us-east-1".into(),
        }),
    );

    let report = topology.provision(payload).await.unwrap();
    assert!(report.succeeded());

    let spoke = spoke_report(&topology).await;
    let connection = spoke.payload.execution.connection_name.clone().unwrap();
    assert_eq!(topology.services().crawler.connection_creates(), 1);
    assert!(!topology.services().crawler.has_connection(&connection));

    match topology.services().catalog.data_source_spec("DS1").unwrap().configuration {
        DataSourceConfiguration::Redshift { resource_arn, .. } => {
            assert_eq!(
                resource_arn,
                "arn:aws:redshift:us-east-1:222222222222:dbname:analytics/dev",
            );
        }
        other => panic!("unexpected configuration: {other:?}"),
    }
}

#[tokio::test]
async fn test_transient_errors_are_retried() {
    let topology = LocalTopology::start(fast_config());
    let catalog = &topology.services().catalog;
    catalog.fail_next(
        "create_data_source",
        RemoteError::Throttled {
            service: "datazone".into(),
            message: "rate exceeded".into(),
        },
    );
    catalog.fail_next(
        "get_data_source_run",
        RemoteError::Unavailable {
            service: "datazone".into(),
            message: "try again".into(),
        },
    );

    let report = topology.provision(csv_payload("A1")).await.unwrap();

    assert!(report.succeeded(), "ended with {:?}", report.payload.execution.error);
    assert_eq!(catalog.data_source_creates(), 1);
    assert_eq!(catalog.run_starts(), 1);
}

#[tokio::test]
async fn test_concurrent_project_creation_is_absorbed() {
    let topology = LocalTopology::start(fast_config());
    topology.services().catalog.race_project_creation("D1", "P1");

    let report = topology.provision(csv_payload("A1")).await.unwrap();

    assert!(report.succeeded());
    assert!(report.payload.catalog.project_id.is_some());
}

#[tokio::test]
async fn test_two_assets_share_one_project() {
    let topology = LocalTopology::start(fast_config());

    let first = topology.provision(csv_payload("A1")).await.unwrap();
    spoke_report(&topology).await;
    let second = topology
        .provision(
            object_store_payload("A2", "D1", "P1", "s3://bucket/other.csv", "us-east-1").unwrap(),
        )
        .await
        .unwrap();
    spoke_report(&topology).await;

    assert!(first.succeeded() && second.succeeded());
    assert_eq!(first.payload.catalog.project_id, second.payload.catalog.project_id);
    assert_eq!(topology.services().catalog.project_creates(), 1);
    assert_ne!(first.payload.catalog.data_source_id, second.payload.catalog.data_source_id);
}

#[tokio::test]
async fn test_terminal_payload_is_not_reprocessed() {
    let topology = LocalTopology::start(fast_config());
    let mut payload = csv_payload("A1");
    payload.status = AssetStatus::Complete;

    let report = topology.provision(payload).await.unwrap();

    assert_eq!(report.visited, vec![TaskType::CreateProject]);
    assert_eq!(topology.services().catalog.project_creates(), 0);
    assert!(topology.spoke_bus().published().is_empty());
}
