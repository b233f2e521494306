//! Warehouse access for the ledger ETL: table lifecycle, bulk insert, clone primitives,
//! plus an immutable archive for raw query pages.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use ledgerflow_core::{ColumnSpec, ColumnType, Row, TableSchema};
use serde_json::Value;
use thiserror::Error;

mod archive;
mod memory;
mod postgres;

pub use archive::{PageArchive, StoredPage};
pub use memory::MemoryWarehouse;
pub use postgres::PgWarehouse;

pub const CRATE_NAME: &str = "ledgerflow-storage";

/// Fully qualified table address: `dataset.table`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableRef {
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(dataset: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dataset, self.table)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMetadata {
    pub table: TableRef,
    pub row_count: u64,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("dataset {0} not found")]
    DatasetNotFound(String),
    #[error("table {0} not found")]
    TableNotFound(TableRef),
    #[error("table {0} already exists")]
    TableExists(TableRef),
    #[error("row for {table} is missing required column {column}")]
    MissingColumn { table: TableRef, column: String },
    #[error("column {column} of {table} expects {expected:?}, got {found}")]
    TypeMismatch {
        table: TableRef,
        column: String,
        expected: ColumnType,
        found: String,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Backend(String),
}

/// Narrow warehouse contract the pipeline core depends on.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn ensure_dataset(&self, dataset: &str) -> Result<(), WarehouseError>;

    async fn table_exists(&self, table: &TableRef) -> Result<bool, WarehouseError>;

    async fn create_table(&self, table: &TableRef, schema: &TableSchema) -> Result<(), WarehouseError>;

    /// Appends rows (projected onto the table schema) and returns how many were written.
    async fn insert_rows(&self, table: &TableRef, rows: &[Row]) -> Result<usize, WarehouseError>;

    async fn row_count(&self, table: &TableRef) -> Result<u64, WarehouseError>;

    /// Point-in-time copy of `source` into a new table `dest`, column constraints included.
    async fn clone_table(&self, source: &TableRef, dest: &TableRef) -> Result<(), WarehouseError>;

    /// Swaps `live` for a copy of `snapshot` laid out as `schema`. All or nothing: when
    /// the copy fails, `live` is left exactly as it was.
    async fn replace_from_snapshot(
        &self,
        live: &TableRef,
        snapshot: &TableRef,
        schema: &TableSchema,
    ) -> Result<(), WarehouseError>;

    /// Drops the table if it exists.
    async fn drop_table(&self, table: &TableRef) -> Result<(), WarehouseError>;

    async fn truncate_table(&self, table: &TableRef) -> Result<(), WarehouseError>;

    async fn table_metadata(&self, table: &TableRef) -> Result<Option<TableMetadata>, WarehouseError>;

    /// Tables in a dataset; an absent dataset lists as empty.
    async fn list_tables(&self, dataset: &str) -> Result<Vec<TableMetadata>, WarehouseError>;

    async fn scan_rows(&self, table: &TableRef) -> Result<Vec<Row>, WarehouseError>;

    /// `[min, max]` of a column holding decimal integers; `None` for an empty table.
    async fn numeric_range(
        &self,
        table: &TableRef,
        column: &str,
    ) -> Result<Option<(u64, u64)>, WarehouseError>;
}

/// Creates the table when missing. Returns `true` when it was created.
pub async fn ensure_table(
    warehouse: &dyn Warehouse,
    table: &TableRef,
    schema: &TableSchema,
) -> Result<bool, WarehouseError> {
    if warehouse.table_exists(table).await? {
        tracing::debug!(%table, "table already exists; skipping creation");
        return Ok(false);
    }
    warehouse.create_table(table, schema).await?;
    tracing::info!(%table, "created table");
    Ok(true)
}

/// Keeps only schema columns, coerces values to the column types and enforces REQUIRED.
pub fn project_row(table: &TableRef, schema: &TableSchema, row: &Row) -> Result<Row, WarehouseError> {
    let mut projected = Row::new();
    for column in &schema.columns {
        let raw = row.get(&column.name).cloned().unwrap_or(Value::Null);
        let value = coerce_value(table, column, raw)?;
        if value.is_null() && column.is_required() {
            return Err(WarehouseError::MissingColumn {
                table: table.clone(),
                column: column.name.clone(),
            });
        }
        projected.insert(column.name.clone(), value);
    }
    Ok(projected)
}

fn coerce_value(table: &TableRef, column: &ColumnSpec, value: Value) -> Result<Value, WarehouseError> {
    let mismatch = |found: &Value| WarehouseError::TypeMismatch {
        table: table.clone(),
        column: column.name.clone(),
        expected: column.kind,
        found: found.to_string(),
    };

    match (column.kind, value) {
        (_, Value::Null) => Ok(Value::Null),
        (ColumnType::String, Value::String(s)) => Ok(Value::String(s)),
        (ColumnType::String, Value::Number(n)) => Ok(Value::String(n.to_string())),
        (ColumnType::String, Value::Bool(b)) => Ok(Value::String(b.to_string())),
        (ColumnType::Integer, Value::Number(n)) => match n.as_i64() {
            Some(i) => Ok(Value::from(i)),
            None => Err(mismatch(&Value::Number(n))),
        },
        (ColumnType::Integer, Value::String(s)) => match s.trim().parse::<i64>() {
            Ok(i) => Ok(Value::from(i)),
            Err(_) => Err(mismatch(&Value::String(s))),
        },
        (ColumnType::Timestamp, Value::String(s)) => match DateTime::parse_from_rfc3339(&s) {
            Ok(dt) => Ok(Value::String(format_timestamp(dt.with_timezone(&Utc)))),
            Err(_) => Err(mismatch(&Value::String(s))),
        },
        (_, other) => Err(mismatch(&other)),
    }
}

pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_decimal(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}
