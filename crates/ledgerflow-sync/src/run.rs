use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ledgerflow_adapters::{
    Enricher, NewAccountsEnricher, NewAccountsSource, PageSource, QueryService,
    TransactionHistoryEnricher, TransactionHistorySource, TransactionTypeTable,
};
use ledgerflow_core::{JobLogEntry, PipelineTarget, TableName, TimeWindow};
use ledgerflow_storage::{ensure_table, PageArchive, Warehouse};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::EtlConfig;
use crate::error::EtlError;
use crate::joblog::JobLog;
use crate::pager::{PageLoopOutcome, PageSettings, PageWriter};
use crate::snapshot::{RestoreOutcome, SnapshotLedger, SnapshotManager};
use crate::validate::TimestampValidator;
use crate::window::{WindowPlan, WindowTracker};

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub job_id: Uuid,
    pub target: PipelineTarget,
    pub window: TimeWindow,
    pub is_initial: bool,
    pub rows_written: u64,
    pub pages: u64,
    pub pruned_snapshots: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// One dataset to load: where pages come from, how they are enriched, where they land.
struct Stage {
    table: TableName,
    source: Box<dyn PageSource>,
    enricher: Box<dyn Enricher>,
}

/// Runs the linear pipeline for one target:
/// window → snapshot → fetch/enrich/write → validate → job log.
pub struct EtlRunner {
    config: Arc<EtlConfig>,
    warehouse: Arc<dyn Warehouse>,
    service: Arc<dyn QueryService>,
    transaction_types: TransactionTypeTable,
    job_log: JobLog,
    tracker: WindowTracker,
    snapshots: SnapshotManager,
    validator: TimestampValidator,
    pager: PageWriter,
}

impl EtlRunner {
    pub fn new(
        config: Arc<EtlConfig>,
        warehouse: Arc<dyn Warehouse>,
        service: Arc<dyn QueryService>,
        transaction_types: TransactionTypeTable,
    ) -> Self {
        let job_log = JobLog::new(warehouse.clone(), config.table(TableName::JobLog));
        let tracker = WindowTracker::new(job_log.clone(), config.start_time_ns, config.window_size_ns);
        let snapshots = SnapshotManager::new(
            warehouse.clone(),
            config.dataset_id.clone(),
            config.snapshot_dataset.clone(),
            config.snapshot_retention(),
        );
        let validator =
            TimestampValidator::new(warehouse.clone(), job_log.clone(), config.dataset_id.clone());
        let pager = PageWriter::new(
            warehouse.clone(),
            PageSettings {
                page_size: config.page_size,
                base_offset: config.base_offset,
                page_delay: config.page_delay,
            },
        )
        .with_archive(config.archive_dir.clone().map(PageArchive::new));
        if let Some(archive) = pager.archive() {
            info!(root = %archive.root().display(), "archiving raw pages");
        }

        Self {
            config,
            warehouse,
            service,
            transaction_types,
            job_log,
            tracker,
            snapshots,
            validator,
            pager,
        }
    }

    pub fn config(&self) -> &EtlConfig {
        &self.config
    }

    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.warehouse
    }

    pub fn job_log(&self) -> &JobLog {
        &self.job_log
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    pub async fn run_once(&self) -> Result<RunSummary, EtlError> {
        let target = self.config.pipeline_target;
        let span = info_span!("etl_run", pipeline = %target);
        self.run_target(target).instrument(span).await
    }

    async fn run_target(&self, target: PipelineTarget) -> Result<RunSummary, EtlError> {
        let started_at = Utc::now();
        info!("starting pipeline");

        self.bootstrap().await?;
        let plan = self.tracker.compute_window(target).await?;
        info!(window = %plan.window, is_initial = plan.is_initial, "computed window");

        let mut ledger = SnapshotLedger::new();
        let mut writes_started = false;
        let outcome = match self
            .execute(target, &plan, &mut ledger, &mut writes_started)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => return Err(self.fail(target, &plan, &ledger, writes_started, err).await),
        };

        let counts = BTreeMap::from([(target, outcome.rows_written)]);
        let entry = JobLogEntry::success(target, plan.window, counts);
        if let Err(err) = self.job_log.record(&entry).await {
            let err = EtlError::JobLog(err);
            return Err(self.fail(target, &plan, &ledger, writes_started, err).await);
        }
        info!(rows = outcome.rows_written, job_id = %entry.job_id, "job log updated");

        let pruned_snapshots = if plan.is_initial {
            0
        } else {
            self.prune(target).await
        };

        info!(rows = outcome.rows_written, "pipeline complete");
        Ok(RunSummary {
            job_id: entry.job_id,
            target,
            window: plan.window,
            is_initial: plan.is_initial,
            rows_written: outcome.rows_written,
            pages: outcome.pages,
            pruned_snapshots,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Creates the dataset and the three target tables when missing.
    pub async fn bootstrap(&self) -> Result<(), EtlError> {
        let wrap = |err| EtlError::warehouse("bootstrapping warehouse tables", err);
        self.warehouse
            .ensure_dataset(&self.config.dataset_id)
            .await
            .map_err(wrap)?;
        for name in TableName::ALL {
            ensure_table(self.warehouse.as_ref(), &self.config.table(name), &name.schema())
                .await
                .map_err(wrap)?;
        }
        Ok(())
    }

    async fn execute(
        &self,
        target: PipelineTarget,
        plan: &WindowPlan,
        ledger: &mut SnapshotLedger,
        writes_started: &mut bool,
    ) -> Result<PageLoopOutcome, EtlError> {
        if plan.is_initial {
            info!("initial run detected; skipping snapshots");
        } else {
            for table in target.data_tables() {
                let counts = self.snapshots.create_snapshot(*table).await?;
                ledger.record(*table, counts);
            }
            let mismatched = ledger.mismatched();
            if !mismatched.is_empty() {
                let tables: Vec<String> = mismatched.iter().map(|t| t.as_str().to_string()).collect();
                error!(tables = %tables.join(", "), "aborting: row count mismatch between base table and snapshot");
                return Err(EtlError::SnapshotIntegrity { tables });
            }
        }

        let stages = self.stages(target).await?;
        *writes_started = true;

        let mut total = PageLoopOutcome::default();
        for stage in &stages {
            let table = self.config.table(stage.table);
            let outcome = self
                .pager
                .run(stage.source.as_ref(), &table, &plan.window, stage.enricher.as_ref())
                .await?;
            total.rows_written += outcome.rows_written;
            total.pages += outcome.pages;
        }

        if !plan.is_initial {
            let report = self.validator.check(target, plan.window.end_ns()).await?;
            if !report.is_valid() {
                return Err(EtlError::Validation(report.describe_violations()));
            }
        }
        Ok(total)
    }

    async fn stages(&self, target: PipelineTarget) -> Result<Vec<Stage>, EtlError> {
        let stage = match target {
            PipelineTarget::Accounts => Stage {
                table: TableName::NewAccounts,
                source: Box::new(NewAccountsSource::new(self.service.clone())),
                enricher: Box::new(NewAccountsEnricher::new(self.service.clone())),
            },
            PipelineTarget::Transactions => {
                let source = TransactionHistorySource::new(self.service.clone(), self.known_account_ids().await?);
                info!(accounts = source.account_ids().len(), "loaded account ids for transaction history");
                Stage {
                    table: TableName::TransactionHistory,
                    source: Box::new(source),
                    enricher: Box::new(TransactionHistoryEnricher::new(self.transaction_types.clone())),
                }
            }
        };
        Ok(vec![stage])
    }

    /// Distinct `entity_id`s already present in `new_accounts`.
    async fn known_account_ids(&self) -> Result<Vec<i64>, EtlError> {
        let table = self.config.table(TableName::NewAccounts);
        let rows = self
            .warehouse
            .scan_rows(&table)
            .await
            .map_err(|err| EtlError::warehouse(format!("reading account ids from {table}"), err))?;
        let ids: BTreeSet<i64> = rows
            .iter()
            .filter_map(|row| match row.get("entity_id")? {
                serde_json::Value::Number(n) => n.as_i64(),
                serde_json::Value::String(s) => s.parse().ok(),
                _ => None,
            })
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn fail(
        &self,
        target: PipelineTarget,
        plan: &WindowPlan,
        ledger: &SnapshotLedger,
        writes_started: bool,
        err: EtlError,
    ) -> EtlError {
        error!(error = %err, "pipeline failed");

        if !plan.is_initial && writes_started {
            for table in target.data_tables() {
                let Some(verified) = ledger.restore_point(*table) else {
                    warn!(table = table.as_str(), "skipped restore; no consistent pre-run snapshot");
                    continue;
                };
                match self.snapshots.restore_from_latest(*table, verified).await {
                    Ok(RestoreOutcome::Restored { snapshot, row_count }) => {
                        info!(table = table.as_str(), %snapshot, rows = row_count, "table restored")
                    }
                    Ok(RestoreOutcome::NoSnapshot | RestoreOutcome::NoValidSnapshot) => {
                        warn!(table = table.as_str(), "no valid snapshot available; table left as is")
                    }
                    Err(restore_err) => {
                        error!(table = table.as_str(), error = %restore_err, "restore failed")
                    }
                }
            }
        }

        let entry = JobLogEntry::error(target, plan.window, err.to_string());
        if let Err(log_err) = self.job_log.record(&entry).await {
            error!(error = %log_err, "could not record failure in job log");
        }
        err
    }

    async fn prune(&self, target: PipelineTarget) -> usize {
        let mut pruned = 0;
        for table in target.data_tables() {
            match self.snapshots.prune_expired(*table).await {
                Ok(deleted) => pruned += deleted.len(),
                Err(err) => warn!(table = table.as_str(), error = %err, "snapshot pruning failed"),
            }
        }
        pruned
    }
}
