//! Incremental ETL engine: window tracking, paginated fetch/enrich/write, pre-write
//! snapshots with restore-on-failure, cross-table timestamp validation and the job log.

use std::sync::Arc;

use anyhow::{Context, Result};
use ledgerflow_adapters::{GraphqlClient, TransactionTypeTable};
use ledgerflow_core::PipelineTarget;
use ledgerflow_storage::{MemoryWarehouse, PgWarehouse, Warehouse};
use tracing::info;

pub mod config;
pub mod error;
pub mod maintenance;
pub mod schedule;

mod joblog;
mod pager;
mod run;
mod snapshot;
mod validate;
mod window;

pub use config::{ConfigError, EtlConfig};
pub use error::{EtlError, JobLogError};
pub use joblog::JobLog;
pub use pager::{PageLoopOutcome, PageSettings, PageWriter};
pub use run::{EtlRunner, RunSummary};
pub use snapshot::{
    parse_snapshot_time, snapshot_name, RestoreOutcome, SnapshotCounts, SnapshotInfo,
    SnapshotLedger, SnapshotManager,
};
pub use validate::{TableCheck, TimestampValidator, ValidationReport};
pub use window::{plan_window, WindowPlan, WindowTracker};

pub const CRATE_NAME: &str = "ledgerflow-sync";

/// `memory://` selects the in-process warehouse; anything else is a Postgres URL.
pub async fn connect_warehouse(config: &EtlConfig) -> Result<Arc<dyn Warehouse>> {
    if config.uses_memory_warehouse() {
        info!("using in-process memory warehouse");
        return Ok(Arc::new(MemoryWarehouse::new()));
    }
    let warehouse = PgWarehouse::connect(&config.database_url)
        .await
        .context("connecting to postgres warehouse")?;
    Ok(Arc::new(warehouse))
}

pub async fn build_runner(config: EtlConfig) -> Result<EtlRunner> {
    let warehouse = connect_warehouse(&config).await?;
    build_runner_with(config, warehouse)
}

pub fn build_runner_with(config: EtlConfig, warehouse: Arc<dyn Warehouse>) -> Result<EtlRunner> {
    let client = GraphqlClient::new(config.graphql_client_config()).context("building graphql client")?;
    let types = TransactionTypeTable::builtin().context("parsing rules/transaction_types.yaml")?;
    Ok(EtlRunner::new(Arc::new(config), warehouse, Arc::new(client), types))
}

pub async fn run_once_from_env(target: Option<PipelineTarget>) -> Result<RunSummary> {
    let mut config = EtlConfig::from_env().context("reading configuration")?;
    if let Some(target) = target {
        config = config.with_target(target);
    }
    let runner = build_runner(config).await?;
    Ok(runner.run_once().await?)
}
