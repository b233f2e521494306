use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledgerflow_core::{Row, TableSchema};
use tokio::sync::Mutex;

use crate::{parse_decimal, project_row, TableMetadata, TableRef, Warehouse, WarehouseError};

/// In-process warehouse with the same semantics as the Postgres backend.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    datasets: BTreeSet<String>,
    tables: BTreeMap<TableRef, MemoryTable>,
}

#[derive(Debug, Clone)]
struct MemoryTable {
    schema: TableSchema,
    rows: Vec<Row>,
    created_at: DateTime<Utc>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides a table's creation time; used to age snapshots.
    pub async fn set_created_at(&self, table: &TableRef, created_at: DateTime<Utc>) -> Result<(), WarehouseError> {
        let mut state = self.state.lock().await;
        let entry = state
            .tables
            .get_mut(table)
            .ok_or_else(|| WarehouseError::TableNotFound(table.clone()))?;
        entry.created_at = created_at;
        Ok(())
    }
}

impl MemoryState {
    fn table(&self, table: &TableRef) -> Result<&MemoryTable, WarehouseError> {
        self.tables
            .get(table)
            .ok_or_else(|| WarehouseError::TableNotFound(table.clone()))
    }

    fn metadata(table: &TableRef, entry: &MemoryTable) -> TableMetadata {
        TableMetadata {
            table: table.clone(),
            row_count: entry.rows.len() as u64,
            created_at: Some(entry.created_at),
        }
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn ensure_dataset(&self, dataset: &str) -> Result<(), WarehouseError> {
        self.state.lock().await.datasets.insert(dataset.to_string());
        Ok(())
    }

    async fn table_exists(&self, table: &TableRef) -> Result<bool, WarehouseError> {
        Ok(self.state.lock().await.tables.contains_key(table))
    }

    async fn create_table(&self, table: &TableRef, schema: &TableSchema) -> Result<(), WarehouseError> {
        let mut state = self.state.lock().await;
        if !state.datasets.contains(&table.dataset) {
            return Err(WarehouseError::DatasetNotFound(table.dataset.clone()));
        }
        if state.tables.contains_key(table) {
            return Err(WarehouseError::TableExists(table.clone()));
        }
        state.tables.insert(
            table.clone(),
            MemoryTable {
                schema: schema.clone(),
                rows: Vec::new(),
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn insert_rows(&self, table: &TableRef, rows: &[Row]) -> Result<usize, WarehouseError> {
        let mut state = self.state.lock().await;
        let entry = state
            .tables
            .get_mut(table)
            .ok_or_else(|| WarehouseError::TableNotFound(table.clone()))?;
        // Project everything first so a bad row leaves the table untouched.
        let projected = rows
            .iter()
            .map(|row| project_row(table, &entry.schema, row))
            .collect::<Result<Vec<_>, _>>()?;
        let written = projected.len();
        entry.rows.extend(projected);
        Ok(written)
    }

    async fn row_count(&self, table: &TableRef) -> Result<u64, WarehouseError> {
        let state = self.state.lock().await;
        Ok(state.table(table)?.rows.len() as u64)
    }

    async fn clone_table(&self, source: &TableRef, dest: &TableRef) -> Result<(), WarehouseError> {
        let mut state = self.state.lock().await;
        if !state.datasets.contains(&dest.dataset) {
            return Err(WarehouseError::DatasetNotFound(dest.dataset.clone()));
        }
        if state.tables.contains_key(dest) {
            return Err(WarehouseError::TableExists(dest.clone()));
        }
        let mut copy = state.table(source)?.clone();
        copy.created_at = Utc::now();
        state.tables.insert(dest.clone(), copy);
        Ok(())
    }

    async fn replace_from_snapshot(
        &self,
        live: &TableRef,
        snapshot: &TableRef,
        schema: &TableSchema,
    ) -> Result<(), WarehouseError> {
        let mut state = self.state.lock().await;
        if !state.datasets.contains(&live.dataset) {
            return Err(WarehouseError::DatasetNotFound(live.dataset.clone()));
        }
        let rows = state
            .table(snapshot)?
            .rows
            .iter()
            .map(|row| project_row(live, schema, row))
            .collect::<Result<Vec<_>, _>>()?;
        state.tables.insert(
            live.clone(),
            MemoryTable {
                schema: schema.clone(),
                rows,
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn drop_table(&self, table: &TableRef) -> Result<(), WarehouseError> {
        self.state.lock().await.tables.remove(table);
        Ok(())
    }

    async fn truncate_table(&self, table: &TableRef) -> Result<(), WarehouseError> {
        let mut state = self.state.lock().await;
        let entry = state
            .tables
            .get_mut(table)
            .ok_or_else(|| WarehouseError::TableNotFound(table.clone()))?;
        entry.rows.clear();
        Ok(())
    }

    async fn table_metadata(&self, table: &TableRef) -> Result<Option<TableMetadata>, WarehouseError> {
        let state = self.state.lock().await;
        Ok(state
            .tables
            .get(table)
            .map(|entry| MemoryState::metadata(table, entry)))
    }

    async fn list_tables(&self, dataset: &str) -> Result<Vec<TableMetadata>, WarehouseError> {
        let state = self.state.lock().await;
        Ok(state
            .tables
            .iter()
            .filter(|(table, _)| table.dataset == dataset)
            .map(|(table, entry)| MemoryState::metadata(table, entry))
            .collect())
    }

    async fn scan_rows(&self, table: &TableRef) -> Result<Vec<Row>, WarehouseError> {
        let state = self.state.lock().await;
        Ok(state.table(table)?.rows.clone())
    }

    async fn numeric_range(
        &self,
        table: &TableRef,
        column: &str,
    ) -> Result<Option<(u64, u64)>, WarehouseError> {
        let state = self.state.lock().await;
        let range = state
            .table(table)?
            .rows
            .iter()
            .filter_map(|row| row.get(column).and_then(parse_decimal))
            .fold(None, |acc: Option<(u64, u64)>, v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            });
        Ok(range)
    }
}
