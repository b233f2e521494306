use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use ledgerflow_core::TableName;
use ledgerflow_storage::{TableMetadata, TableRef, Warehouse, WarehouseError};
use tracing::{error, info, warn};

use crate::error::EtlError;

const SNAPSHOT_INFIX: &str = "_snapshot_";
const SNAPSHOT_STAMP: &str = "%Y%m%d%H%M%S%3f";

/// Row counts measured around one clone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotCounts {
    pub base_row_count: u64,
    pub snapshot_row_count: u64,
}

impl SnapshotCounts {
    /// Only a snapshot holding exactly the rows of its source is a safe restore point.
    pub fn is_consistent(&self) -> bool {
        self.base_row_count == self.snapshot_row_count
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub snapshot: TableRef,
    pub source: TableName,
    pub created_at: Option<DateTime<Utc>>,
    pub row_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored { snapshot: TableRef, row_count: u64 },
    NoSnapshot,
    /// Snapshots exist, but none holds the row count verified before the run.
    NoValidSnapshot,
}

/// Per-run record of which tables got a verified pre-write snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotLedger {
    counts: BTreeMap<TableName, SnapshotCounts>,
}

impl SnapshotLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, table: TableName, counts: SnapshotCounts) {
        self.counts.insert(table, counts);
    }

    pub fn counts(&self, table: TableName) -> Option<SnapshotCounts> {
        self.counts.get(&table).copied()
    }

    /// Counts of the verified pre-run snapshot; `None` when there is no safe restore point.
    pub fn restore_point(&self, table: TableName) -> Option<SnapshotCounts> {
        self.counts(table)
            .filter(|counts| table != TableName::JobLog && counts.is_consistent())
    }

    pub fn mismatched(&self) -> Vec<TableName> {
        self.counts
            .iter()
            .filter(|(table, counts)| **table != TableName::JobLog && !counts.is_consistent())
            .map(|(table, _)| *table)
            .collect()
    }
}

pub fn snapshot_name(table: TableName, at: DateTime<Utc>) -> String {
    format!("{}{SNAPSHOT_INFIX}{}", table.as_str(), at.format(SNAPSHOT_STAMP))
}

fn snapshot_prefix(table: TableName) -> String {
    format!("{}{SNAPSHOT_INFIX}", table.as_str())
}

/// Recovers the creation time encoded in a snapshot name.
pub fn parse_snapshot_time(name: &str) -> Option<DateTime<Utc>> {
    let (_, stamp) = name.rsplit_once(SNAPSHOT_INFIX)?;
    if stamp.len() != 17 || !stamp.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let part = |range: std::ops::Range<usize>| stamp[range].parse::<u32>().ok();
    let year = stamp[0..4].parse::<i32>().ok()?;
    let naive = NaiveDate::from_ymd_opt(year, part(4..6)?, part(6..8)?)?.and_hms_milli_opt(
        part(8..10)?,
        part(10..12)?,
        part(12..14)?,
        part(14..17)?,
    )?;
    Some(naive.and_utc())
}

/// Clone-based restore points for the live tables, kept in a separate dataset.
pub struct SnapshotManager {
    warehouse: Arc<dyn Warehouse>,
    dataset: String,
    snapshot_dataset: String,
    retention: Duration,
}

impl SnapshotManager {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        dataset: impl Into<String>,
        snapshot_dataset: impl Into<String>,
        retention: Duration,
    ) -> Self {
        Self {
            warehouse,
            dataset: dataset.into(),
            snapshot_dataset: snapshot_dataset.into(),
            retention,
        }
    }

    fn live(&self, table: TableName) -> TableRef {
        TableRef::new(self.dataset.clone(), table.as_str())
    }

    pub async fn create_snapshot(&self, table: TableName) -> Result<SnapshotCounts, EtlError> {
        self.create_snapshot_at(table, Utc::now()).await
    }

    pub async fn create_snapshot_at(
        &self,
        table: TableName,
        now: DateTime<Utc>,
    ) -> Result<SnapshotCounts, EtlError> {
        let source = self.live(table);
        let wrap = |err: WarehouseError| EtlError::Snapshot {
            table: source.clone(),
            source: err,
        };

        self.warehouse
            .ensure_dataset(&self.snapshot_dataset)
            .await
            .map_err(wrap)?;

        // Names carry millisecond stamps; step forward until one is free.
        let mut stamp = now;
        let mut dest = TableRef::new(self.snapshot_dataset.clone(), snapshot_name(table, stamp));
        while self.warehouse.table_exists(&dest).await.map_err(wrap)? {
            stamp += chrono::Duration::milliseconds(1);
            dest = TableRef::new(self.snapshot_dataset.clone(), snapshot_name(table, stamp));
        }
        let base_row_count = self.warehouse.row_count(&source).await.map_err(wrap)?;
        info!(table = %source, rows = base_row_count, "measured base table before snapshot");

        if let Err(err) = self.warehouse.clone_table(&source, &dest).await {
            error!(table = %source, error = %err, "failed to create snapshot");
            if let Ok(false) = self.warehouse.table_exists(&source).await {
                error!(table = %source, "base table does not exist");
            }
            return Err(wrap(err));
        }
        info!(snapshot = %dest, "snapshot created");

        let snapshot_row_count = self
            .warehouse
            .table_metadata(&dest)
            .await
            .map_err(wrap)?
            .map_or(0, |meta| meta.row_count);
        info!(snapshot = %dest, rows = snapshot_row_count, "snapshot row count");

        if snapshot_row_count == 0 && base_row_count > 0 {
            warn!(
                snapshot = %dest,
                base_rows = base_row_count,
                "snapshot is empty but base table had rows just before it was taken"
            );
        } else if snapshot_row_count == 0 {
            warn!(snapshot = %dest, "snapshot created empty; base table had no rows");
        }

        Ok(SnapshotCounts {
            base_row_count,
            snapshot_row_count,
        })
    }

    /// Snapshots newest first; `table = None` lists every snapshot the pipeline owns.
    pub async fn list_snapshots(&self, table: Option<TableName>) -> Result<Vec<SnapshotInfo>, WarehouseError> {
        let tables = self.warehouse.list_tables(&self.snapshot_dataset).await?;
        let mut snapshots: Vec<SnapshotInfo> = tables
            .into_iter()
            .filter_map(|meta| {
                let source = TableName::ALL
                    .into_iter()
                    .filter(|name| table.map_or(true, |t| t == *name))
                    .find(|name| meta.table.table.starts_with(&snapshot_prefix(*name)))?;
                Some(snapshot_info(meta, source))
            })
            .collect();
        snapshots.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.snapshot.table.cmp(&a.snapshot.table))
        });
        Ok(snapshots)
    }

    /// Replaces the live table with its newest valid snapshot: one whose row count matches
    /// `verified`, the counts `create_snapshot` reported before the run wrote anything.
    /// The swap is atomic, so a failed restore leaves the live table untouched.
    pub async fn restore_from_latest(
        &self,
        table: TableName,
        verified: SnapshotCounts,
    ) -> Result<RestoreOutcome, EtlError> {
        let live = self.live(table);
        let wrap = |err: WarehouseError| EtlError::Snapshot {
            table: live.clone(),
            source: err,
        };

        if !verified.is_consistent() {
            warn!(
                table = %live,
                base_rows = verified.base_row_count,
                snapshot_rows = verified.snapshot_row_count,
                "pre-run snapshot is inconsistent; refusing to restore"
            );
            return Ok(RestoreOutcome::NoValidSnapshot);
        }

        let snapshots = self.list_snapshots(Some(table)).await.map_err(wrap)?;
        if snapshots.is_empty() {
            warn!(table = %live, "no snapshots found; nothing to restore from");
            return Ok(RestoreOutcome::NoSnapshot);
        }
        let Some(latest) = snapshots
            .into_iter()
            .find(|info| info.row_count == verified.snapshot_row_count)
        else {
            warn!(
                table = %live,
                expected_rows = verified.snapshot_row_count,
                "no snapshot holds the verified row count; table left as is"
            );
            return Ok(RestoreOutcome::NoValidSnapshot);
        };

        info!(table = %live, snapshot = %latest.snapshot, "replacing table with snapshot");
        self.warehouse
            .replace_from_snapshot(&live, &latest.snapshot, &table.schema())
            .await
            .map_err(wrap)?;

        let row_count = self.warehouse.row_count(&live).await.map_err(wrap)?;
        info!(table = %live, snapshot = %latest.snapshot, rows = row_count, "restored table from snapshot");
        Ok(RestoreOutcome::Restored {
            snapshot: latest.snapshot,
            row_count,
        })
    }

    pub async fn prune_expired(&self, table: TableName) -> Result<Vec<TableRef>, EtlError> {
        self.prune_expired_at(table, Utc::now()).await
    }

    /// Deletes snapshots older than the retention period. A failed delete is logged and
    /// the rest are still attempted.
    pub async fn prune_expired_at(
        &self,
        table: TableName,
        now: DateTime<Utc>,
    ) -> Result<Vec<TableRef>, EtlError> {
        let snapshots = self
            .list_snapshots(Some(table))
            .await
            .map_err(|err| EtlError::Snapshot {
                table: self.live(table),
                source: err,
            })?;

        let mut deleted = Vec::new();
        for snapshot in snapshots {
            let Some(created_at) = snapshot.created_at else {
                warn!(snapshot = %snapshot.snapshot, "snapshot has no creation time; keeping it");
                continue;
            };
            let expired = (now - created_at)
                .to_std()
                .is_ok_and(|age| age > self.retention);
            if !expired {
                continue;
            }
            match self.warehouse.drop_table(&snapshot.snapshot).await {
                Ok(()) => {
                    info!(snapshot = %snapshot.snapshot, "deleted expired snapshot");
                    deleted.push(snapshot.snapshot);
                }
                Err(err) => error!(snapshot = %snapshot.snapshot, error = %err, "failed to delete snapshot"),
            }
        }
        Ok(deleted)
    }

    /// Drops every pipeline snapshot regardless of age.
    pub async fn purge_all(&self) -> Result<usize, WarehouseError> {
        let snapshots = self.list_snapshots(None).await?;
        for snapshot in &snapshots {
            self.warehouse.drop_table(&snapshot.snapshot).await?;
            info!(snapshot = %snapshot.snapshot, "deleted snapshot");
        }
        Ok(snapshots.len())
    }
}

fn snapshot_info(meta: TableMetadata, source: TableName) -> SnapshotInfo {
    let created_at = meta
        .created_at
        .or_else(|| parse_snapshot_time(&meta.table.table));
    SnapshotInfo {
        snapshot: meta.table,
        source,
        created_at,
        row_count: meta.row_count,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use ledgerflow_core::new_accounts_schema;
    use ledgerflow_storage::MemoryWarehouse;
    use serde_json::json;

    use super::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, h, m, s).unwrap()
    }

    async fn seeded(rows: u64) -> (Arc<MemoryWarehouse>, SnapshotManager) {
        let warehouse = Arc::new(MemoryWarehouse::new());
        warehouse.ensure_dataset("ledger").await.unwrap();
        let table = TableRef::new("ledger", "new_accounts");
        warehouse.create_table(&table, &new_accounts_schema()).await.unwrap();
        let batch: Vec<_> = (0..rows)
            .map(|n| {
                json!({
                    "consensus_timestamp": (1_706_745_600_000_000_000u64 + n).to_string(),
                    "consensus_timestamp_iso8601": "2024-02-01T00:00:00Z",
                    "id": format!("0.0.2@{n}"),
                    "entity_id": n,
                    "initial_transfer_amount": 0,
                })
                .as_object()
                .cloned()
                .unwrap()
            })
            .collect();
        warehouse.insert_rows(&table, &batch).await.unwrap();
        let manager = SnapshotManager::new(
            warehouse.clone(),
            "ledger",
            "snapshots",
            Duration::from_secs(3 * 3_600),
        );
        (warehouse, manager)
    }

    #[test]
    fn snapshot_names_round_trip_their_timestamp() {
        let when = Utc.with_ymd_and_hms(2025, 5, 2, 0, 21, 49).unwrap() + chrono::Duration::milliseconds(564);
        let name = snapshot_name(TableName::NewAccounts, when);
        assert_eq!(name, "new_accounts_snapshot_20250502002149564");
        assert_eq!(parse_snapshot_time(&name), Some(when));
        assert_eq!(parse_snapshot_time("new_accounts_snapshot_abc"), None);
    }

    #[test]
    fn ledger_tracks_restorable_tables() {
        let mut ledger = SnapshotLedger::new();
        ledger.record(
            TableName::NewAccounts,
            SnapshotCounts { base_row_count: 4, snapshot_row_count: 4 },
        );
        ledger.record(
            TableName::TransactionHistory,
            SnapshotCounts { base_row_count: 4, snapshot_row_count: 0 },
        );
        ledger.record(
            TableName::JobLog,
            SnapshotCounts { base_row_count: 1, snapshot_row_count: 0 },
        );

        assert_eq!(
            ledger.restore_point(TableName::NewAccounts),
            Some(SnapshotCounts { base_row_count: 4, snapshot_row_count: 4 })
        );
        assert_eq!(ledger.restore_point(TableName::TransactionHistory), None);
        assert_eq!(ledger.restore_point(TableName::JobLog), None);
        assert_eq!(ledger.mismatched(), vec![TableName::TransactionHistory]);
    }

    #[tokio::test]
    async fn snapshot_then_restore_yields_snapshot_row_count() {
        let (warehouse, manager) = seeded(4).await;
        let counts = manager.create_snapshot(TableName::NewAccounts).await.unwrap();
        assert_eq!(counts, SnapshotCounts { base_row_count: 4, snapshot_row_count: 4 });

        let outcome = manager.restore_from_latest(TableName::NewAccounts, counts).await.unwrap();
        assert!(matches!(outcome, RestoreOutcome::Restored { row_count: 4, .. }));
        let live = TableRef::new("ledger", "new_accounts");
        assert_eq!(warehouse.row_count(&live).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn restored_table_still_rejects_rows_without_required_columns() {
        let (warehouse, manager) = seeded(2).await;
        let counts = manager.create_snapshot(TableName::NewAccounts).await.unwrap();
        manager.restore_from_latest(TableName::NewAccounts, counts).await.unwrap();

        let live = TableRef::new("ledger", "new_accounts");
        let no_id = json!({
            "consensus_timestamp": "1706745600000000009",
            "consensus_timestamp_iso8601": "2024-02-01T00:00:00Z",
            "entity_id": 9,
            "initial_transfer_amount": 0,
        })
        .as_object()
        .cloned()
        .unwrap();
        let err = warehouse.insert_rows(&live, &[no_id]).await.unwrap_err();
        assert!(matches!(err, WarehouseError::MissingColumn { ref column, .. } if column == "id"));
        assert_eq!(warehouse.row_count(&live).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn restore_skips_snapshots_that_do_not_match_verified_counts() {
        let (warehouse, manager) = seeded(2).await;
        let verified = manager
            .create_snapshot_at(TableName::NewAccounts, at(1, 0, 0))
            .await
            .unwrap();
        let live = TableRef::new("ledger", "new_accounts");
        warehouse.truncate_table(&live).await.unwrap();
        manager.create_snapshot_at(TableName::NewAccounts, at(2, 0, 0)).await.unwrap();

        let older = TableRef::new("snapshots", snapshot_name(TableName::NewAccounts, at(1, 0, 0)));
        let newer = TableRef::new("snapshots", snapshot_name(TableName::NewAccounts, at(2, 0, 0)));
        warehouse.set_created_at(&older, at(1, 0, 0)).await.unwrap();
        warehouse.set_created_at(&newer, at(2, 0, 0)).await.unwrap();

        let outcome = manager
            .restore_from_latest(TableName::NewAccounts, verified)
            .await
            .unwrap();
        assert_eq!(outcome, RestoreOutcome::Restored { snapshot: older, row_count: 2 });
    }

    #[tokio::test]
    async fn inconsistent_counts_never_restore() {
        let (warehouse, manager) = seeded(3).await;
        manager.create_snapshot(TableName::NewAccounts).await.unwrap();
        let live = TableRef::new("ledger", "new_accounts");
        warehouse.truncate_table(&live).await.unwrap();

        let lagging = SnapshotCounts { base_row_count: 3, snapshot_row_count: 0 };
        let outcome = manager
            .restore_from_latest(TableName::NewAccounts, lagging)
            .await
            .unwrap();
        assert_eq!(outcome, RestoreOutcome::NoValidSnapshot);
        assert_eq!(warehouse.row_count(&live).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn restore_uses_the_newest_snapshot() {
        let (warehouse, manager) = seeded(2).await;
        manager.create_snapshot_at(TableName::NewAccounts, at(1, 0, 0)).await.unwrap();
        let live = TableRef::new("ledger", "new_accounts");
        warehouse.truncate_table(&live).await.unwrap();
        let verified = manager
            .create_snapshot_at(TableName::NewAccounts, at(2, 0, 0))
            .await
            .unwrap();

        let older = TableRef::new("snapshots", snapshot_name(TableName::NewAccounts, at(1, 0, 0)));
        let newer = TableRef::new("snapshots", snapshot_name(TableName::NewAccounts, at(2, 0, 0)));
        warehouse.set_created_at(&older, at(1, 0, 0)).await.unwrap();
        warehouse.set_created_at(&newer, at(2, 0, 0)).await.unwrap();

        let outcome = manager
            .restore_from_latest(TableName::NewAccounts, verified)
            .await
            .unwrap();
        assert_eq!(outcome, RestoreOutcome::Restored { snapshot: newer, row_count: 0 });
    }

    #[tokio::test]
    async fn restore_without_snapshots_is_a_no_op() {
        let (warehouse, manager) = seeded(3).await;
        let counts = SnapshotCounts { base_row_count: 3, snapshot_row_count: 3 };
        let outcome = manager
            .restore_from_latest(TableName::NewAccounts, counts)
            .await
            .unwrap();
        assert_eq!(outcome, RestoreOutcome::NoSnapshot);
        let live = TableRef::new("ledger", "new_accounts");
        assert_eq!(warehouse.row_count(&live).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn prune_deletes_only_expired_snapshots_of_the_table() {
        let (warehouse, manager) = seeded(1).await;
        for hour in [1, 5] {
            let name = snapshot_name(TableName::NewAccounts, at(hour, 0, 0));
            manager.create_snapshot_at(TableName::NewAccounts, at(hour, 0, 0)).await.unwrap();
            warehouse
                .set_created_at(&TableRef::new("snapshots", name), at(hour, 0, 0))
                .await
                .unwrap();
        }

        let deleted = manager
            .prune_expired_at(TableName::NewAccounts, at(6, 0, 0))
            .await
            .unwrap();
        assert_eq!(
            deleted,
            vec![TableRef::new("snapshots", snapshot_name(TableName::NewAccounts, at(1, 0, 0)))]
        );
        assert_eq!(manager.list_snapshots(None).await.unwrap().len(), 1);
        assert!(manager
            .list_snapshots(Some(TableName::TransactionHistory))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn snapshots_taken_in_the_same_millisecond_get_distinct_names() {
        let (_warehouse, manager) = seeded(1).await;
        manager.create_snapshot_at(TableName::NewAccounts, at(1, 0, 0)).await.unwrap();
        manager.create_snapshot_at(TableName::NewAccounts, at(1, 0, 0)).await.unwrap();

        let mut names: Vec<_> = manager
            .list_snapshots(Some(TableName::NewAccounts))
            .await
            .unwrap()
            .into_iter()
            .map(|info| info.snapshot.table)
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "new_accounts_snapshot_20240201010000000".to_string(),
                "new_accounts_snapshot_20240201010000001".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn purge_removes_every_snapshot() {
        let (_warehouse, manager) = seeded(1).await;
        manager.create_snapshot_at(TableName::NewAccounts, at(1, 0, 0)).await.unwrap();
        manager.create_snapshot_at(TableName::NewAccounts, at(2, 0, 0)).await.unwrap();
        assert_eq!(manager.purge_all().await.unwrap(), 2);
        assert!(manager.list_snapshots(None).await.unwrap().is_empty());
    }
}
