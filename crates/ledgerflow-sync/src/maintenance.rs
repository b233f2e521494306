//! Operator maintenance over the target tables and the snapshot dataset.

use anyhow::{bail, Context, Result};
use ledgerflow_core::{JobLogEntry, PipelineTarget, TableName};
use ledgerflow_storage::{TableRef, Warehouse};
use tracing::{info, warn};

use crate::config::EtlConfig;
use crate::joblog::JobLog;

#[derive(Debug, Clone)]
pub struct TargetStatus {
    pub target: PipelineTarget,
    pub last_success: Option<JobLogEntry>,
    pub last_entry: Option<JobLogEntry>,
    /// Row count per data table; `None` when the table does not exist yet.
    pub tables: Vec<(TableRef, Option<u64>)>,
}

pub async fn status(job_log: &JobLog, warehouse: &dyn Warehouse, config: &EtlConfig) -> Result<Vec<TargetStatus>> {
    let entries = job_log.entries().await.context("reading job log")?;
    let mut statuses = Vec::new();

    for target in PipelineTarget::ALL {
        let relevant = || entries.iter().filter(|entry| entry.applies_to(target));
        let last_success = relevant()
            .filter(|entry| entry.is_success())
            .max_by_key(|entry| (entry.window.end_ns(), entry.logged_at))
            .cloned();
        let last_entry = relevant().max_by_key(|entry| entry.logged_at).cloned();

        let mut tables = Vec::new();
        for name in target.data_tables() {
            let table = config.table(*name);
            let rows = warehouse
                .table_metadata(&table)
                .await
                .with_context(|| format!("reading metadata of {table}"))?
                .map(|meta| meta.row_count);
            tables.push((table, rows));
        }

        statuses.push(TargetStatus {
            target,
            last_success,
            last_entry,
            tables,
        });
    }
    Ok(statuses)
}

/// Deletes every row of the three target tables and checks they are empty afterwards.
pub async fn truncate_tables(warehouse: &dyn Warehouse, config: &EtlConfig) -> Result<Vec<TableRef>> {
    let mut cleaned = Vec::new();
    for name in TableName::ALL {
        let table = config.table(name);
        if !warehouse.table_exists(&table).await? {
            warn!(%table, "table does not exist; skipping");
            continue;
        }
        info!(%table, "deleting table data");
        warehouse
            .truncate_table(&table)
            .await
            .with_context(|| format!("truncating {table}"))?;
        let remaining = warehouse.row_count(&table).await?;
        if remaining > 0 {
            bail!("table {table} still contains {remaining} rows after delete");
        }
        info!(%table, "table cleaned");
        cleaned.push(table);
    }
    Ok(cleaned)
}

/// Drops the three target tables; missing tables are skipped.
pub async fn drop_tables(warehouse: &dyn Warehouse, config: &EtlConfig) -> Result<Vec<TableRef>> {
    let mut dropped = Vec::new();
    for name in TableName::ALL {
        let table = config.table(name);
        if !warehouse.table_exists(&table).await? {
            warn!(%table, "table does not exist; skipping deletion");
            continue;
        }
        warehouse
            .drop_table(&table)
            .await
            .with_context(|| format!("dropping {table}"))?;
        info!(%table, "table deleted");
        dropped.push(table);
    }
    Ok(dropped)
}
