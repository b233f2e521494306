use ledgerflow_adapters::QueryError;
use ledgerflow_core::RowDecodeError;
use ledgerflow_storage::{TableRef, WarehouseError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobLogError {
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),
    #[error("undecodable job log row: {0}")]
    Decode(#[from] RowDecodeError),
}

/// Everything that can end a run. Every variant raised after the window is known is
/// recorded as an `error` job log entry before it reaches the caller.
#[derive(Debug, Error)]
pub enum EtlError {
    #[error("cannot determine resume position: {0}")]
    ResumeState(#[source] JobLogError),
    #[error("snapshot row count mismatch for {}", .tables.join(", "))]
    SnapshotIntegrity { tables: Vec<String> },
    #[error("fetch from {table} query failed at offset {offset}: {source}")]
    Fetch {
        table: String,
        offset: u64,
        source: QueryError,
    },
    #[error("enrichment of {table} page at offset {offset} failed: {source}")]
    Enrich {
        table: String,
        offset: u64,
        source: QueryError,
    },
    #[error("write to {table} failed at offset {offset}: {source}")]
    Write {
        table: TableRef,
        offset: u64,
        source: WarehouseError,
    },
    #[error("timestamp validation failed: {0}")]
    Validation(String),
    #[error("snapshot operation on {table} failed: {source}")]
    Snapshot {
        table: TableRef,
        source: WarehouseError,
    },
    #[error("job log write failed: {0}")]
    JobLog(#[source] JobLogError),
    #[error("{context}: {source}")]
    Warehouse {
        context: String,
        source: WarehouseError,
    },
}

impl EtlError {
    pub(crate) fn warehouse(context: impl Into<String>, source: WarehouseError) -> Self {
        EtlError::Warehouse {
            context: context.into(),
            source,
        }
    }
}
