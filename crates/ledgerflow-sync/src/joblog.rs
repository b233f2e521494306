use std::sync::Arc;

use ledgerflow_core::{job_log_schema, JobLogEntry, PipelineTarget};
use ledgerflow_storage::{ensure_table, TableRef, Warehouse};
use tracing::{error, info};

use crate::error::JobLogError;

/// Append-only ledger of run outcomes. Nothing here updates or deletes a row.
#[derive(Clone)]
pub struct JobLog {
    warehouse: Arc<dyn Warehouse>,
    table: TableRef,
}

impl JobLog {
    pub fn new(warehouse: Arc<dyn Warehouse>, table: TableRef) -> Self {
        Self { warehouse, table }
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    pub async fn ensure(&self) -> Result<bool, JobLogError> {
        Ok(ensure_table(self.warehouse.as_ref(), &self.table, &job_log_schema()).await?)
    }

    pub async fn record(&self, entry: &JobLogEntry) -> Result<(), JobLogError> {
        match self.warehouse.insert_rows(&self.table, &[entry.to_row()]).await {
            Ok(_) => {
                info!(
                    job_id = %entry.job_id,
                    status = entry.status.as_str(),
                    window = %entry.window,
                    "job log updated"
                );
                Ok(())
            }
            Err(err) => {
                error!(job_id = %entry.job_id, error = %err, "failed to update job log");
                Err(err.into())
            }
        }
    }

    /// All entries in insertion order; a missing table reads as an empty log.
    pub async fn entries(&self) -> Result<Vec<JobLogEntry>, JobLogError> {
        if !self.warehouse.table_exists(&self.table).await? {
            return Ok(Vec::new());
        }
        self.warehouse
            .scan_rows(&self.table)
            .await?
            .iter()
            .map(|row| JobLogEntry::from_row(row).map_err(JobLogError::from))
            .collect()
    }

    /// Successful entry with the greatest window end for the target.
    pub async fn last_success(&self, target: PipelineTarget) -> Result<Option<JobLogEntry>, JobLogError> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|entry| entry.is_success() && entry.applies_to(target))
            .max_by_key(|entry| (entry.window.end_ns(), entry.logged_at)))
    }

    /// Start of the earliest window ever ingested successfully for the target.
    pub async fn earliest_success_start(&self, target: PipelineTarget) -> Result<Option<u64>, JobLogError> {
        Ok(self
            .entries()
            .await?
            .iter()
            .filter(|entry| entry.is_success() && entry.applies_to(target))
            .map(|entry| entry.window.start_ns())
            .min())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use ledgerflow_core::TimeWindow;
    use ledgerflow_storage::MemoryWarehouse;

    async fn job_log() -> JobLog {
        let warehouse = Arc::new(MemoryWarehouse::new());
        warehouse.ensure_dataset("ledger").await.unwrap();
        let log = JobLog::new(warehouse, TableRef::new("ledger", "job_log"));
        assert!(log.ensure().await.unwrap());
        log
    }

    fn window(start: u64, end: u64) -> TimeWindow {
        TimeWindow::new(start, end).unwrap()
    }

    #[tokio::test]
    async fn missing_table_reads_as_empty() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let log = JobLog::new(warehouse, TableRef::new("ledger", "job_log"));
        assert!(log.entries().await.unwrap().is_empty());
        assert!(log.last_success(PipelineTarget::Accounts).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn last_success_ignores_errors_and_other_targets() {
        let log = job_log().await;
        let accounts = PipelineTarget::Accounts;
        log.record(&JobLogEntry::success(accounts, window(0, 10), BTreeMap::new()))
            .await
            .unwrap();
        log.record(&JobLogEntry::success(accounts, window(10, 20), BTreeMap::new()))
            .await
            .unwrap();
        log.record(&JobLogEntry::error(accounts, window(20, 30), "boom"))
            .await
            .unwrap();
        log.record(&JobLogEntry::success(
            PipelineTarget::Transactions,
            window(0, 50),
            BTreeMap::new(),
        ))
        .await
        .unwrap();

        let last = log.last_success(accounts).await.unwrap().unwrap();
        assert_eq!(last.window, window(10, 20));
        assert_eq!(log.earliest_success_start(accounts).await.unwrap(), Some(0));
        assert_eq!(log.entries().await.unwrap().len(), 4);

        let txs = log
            .last_success(PipelineTarget::Transactions)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(txs.window.end_ns(), 50);
    }

    #[tokio::test]
    async fn untargeted_entries_apply_to_every_target() {
        let log = job_log().await;
        let mut legacy = JobLogEntry::success(PipelineTarget::Accounts, window(5, 15), BTreeMap::new());
        legacy.pipeline_target = None;
        log.record(&legacy).await.unwrap();

        for target in PipelineTarget::ALL {
            assert_eq!(log.earliest_success_start(target).await.unwrap(), Some(5));
        }
    }
}
