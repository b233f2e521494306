use std::sync::Arc;

use ledgerflow_core::{PipelineTarget, CONSENSUS_TIMESTAMP};
use ledgerflow_storage::{TableRef, Warehouse};
use tracing::{error, info, warn};

use crate::error::EtlError;
use crate::joblog::JobLog;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableCheck {
    pub table: TableRef,
    /// Observed `[min, max]` consensus timestamps; `None` when the table is empty.
    pub range: Option<(u64, u64)>,
    pub valid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    /// Earliest start of any successful window; `None` means there was nothing to check.
    pub job_min_ns: Option<u64>,
    pub job_end_ns: u64,
    pub tables: Vec<TableCheck>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.tables.iter().all(|check| check.valid)
    }

    pub fn violations(&self) -> impl Iterator<Item = &TableCheck> {
        self.tables.iter().filter(|check| !check.valid)
    }

    pub fn describe_violations(&self) -> String {
        self.violations()
            .map(|check| match check.range {
                Some((min, max)) => format!(
                    "{} has [{min}, {max}] outside [{}, {}]",
                    check.table,
                    self.job_min_ns.unwrap_or_default(),
                    self.job_end_ns
                ),
                None => format!("{} is out of bounds", check.table),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Checks that every data table of a target only holds rows inside
/// `[earliest successful start, current window end]`.
pub struct TimestampValidator {
    warehouse: Arc<dyn Warehouse>,
    job_log: JobLog,
    dataset: String,
}

impl TimestampValidator {
    pub fn new(warehouse: Arc<dyn Warehouse>, job_log: JobLog, dataset: impl Into<String>) -> Self {
        Self {
            warehouse,
            job_log,
            dataset: dataset.into(),
        }
    }

    pub async fn validate(&self, target: PipelineTarget, job_end_ns: u64) -> Result<bool, EtlError> {
        Ok(self.check(target, job_end_ns).await?.is_valid())
    }

    pub async fn check(
        &self,
        target: PipelineTarget,
        job_end_ns: u64,
    ) -> Result<ValidationReport, EtlError> {
        info!(pipeline = %target, "validating timestamp ranges");
        let job_min_ns = self
            .job_log
            .earliest_success_start(target)
            .await
            .map_err(EtlError::JobLog)?;

        let mut report = ValidationReport {
            job_min_ns,
            job_end_ns,
            tables: Vec::new(),
        };
        let Some(job_min) = job_min_ns else {
            warn!(pipeline = %target, "no successful jobs found to validate against");
            return Ok(report);
        };

        for name in target.data_tables() {
            let table = TableRef::new(self.dataset.clone(), name.as_str());
            let range = self
                .warehouse
                .numeric_range(&table, CONSENSUS_TIMESTAMP)
                .await
                .map_err(|err| EtlError::warehouse(format!("reading timestamp range of {table}"), err))?;

            let valid = match range {
                None => {
                    warn!(%table, "no rows found to validate");
                    true
                }
                Some((min, max)) if min < job_min || max > job_end_ns => {
                    error!(%table, min, max, job_min, job_end_ns, "timestamps out of bounds");
                    false
                }
                Some((min, max)) => {
                    info!(%table, min, max, "timestamps are valid");
                    true
                }
            };
            report.tables.push(TableCheck { table, range, valid });
        }
        Ok(report)
    }
}
