use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ledgerflow_adapters::{Enricher, PageSource};
use ledgerflow_core::TimeWindow;
use ledgerflow_storage::{PageArchive, TableRef, Warehouse};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::EtlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSettings {
    pub page_size: u64,
    pub base_offset: u64,
    pub page_delay: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageLoopOutcome {
    pub rows_written: u64,
    pub pages: u64,
}

/// Drives one dataset through fetch → enrich → insert until a short page arrives.
///
/// Pages already inserted stay inserted when a later page fails; rolling those back is
/// the snapshot manager's job at the run level.
pub struct PageWriter {
    warehouse: Arc<dyn Warehouse>,
    archive: Option<PageArchive>,
    settings: PageSettings,
}

impl PageWriter {
    pub fn new(warehouse: Arc<dyn Warehouse>, settings: PageSettings) -> Self {
        Self {
            warehouse,
            archive: None,
            settings: PageSettings {
                page_size: settings.page_size.max(1),
                ..settings
            },
        }
    }

    pub fn with_archive(mut self, archive: Option<PageArchive>) -> Self {
        self.archive = archive;
        self
    }

    pub fn archive(&self) -> Option<&PageArchive> {
        self.archive.as_ref()
    }

    pub async fn run(
        &self,
        source: &dyn PageSource,
        table: &TableRef,
        window: &TimeWindow,
        enricher: &dyn Enricher,
    ) -> Result<PageLoopOutcome, EtlError> {
        let limit = self.settings.page_size;
        let mut offset = self.settings.base_offset;
        let mut outcome = PageLoopOutcome::default();

        info!(%table, %window, page_size = limit, "starting paginated load");

        loop {
            let span = info_span!("page", %table, offset, limit);
            let fetched = self
                .load_page(source, table, window, enricher, limit, offset)
                .instrument(span)
                .await?;
            let Some((fetched, written)) = fetched else {
                break;
            };

            outcome.pages += 1;
            outcome.rows_written += written;

            if fetched < limit {
                debug!(%table, offset, fetched, "short page; no more results");
                break;
            }
            offset = offset.saturating_add(limit);
            if !self.settings.page_delay.is_zero() {
                tokio::time::sleep(self.settings.page_delay).await;
            }
        }

        info!(
            %table,
            rows = outcome.rows_written,
            pages = outcome.pages,
            "paginated load complete"
        );
        Ok(outcome)
    }

    /// Returns `(rows fetched, rows written)`, or `None` for an empty page.
    async fn load_page(
        &self,
        source: &dyn PageSource,
        table: &TableRef,
        window: &TimeWindow,
        enricher: &dyn Enricher,
        limit: u64,
        offset: u64,
    ) -> Result<Option<(u64, u64)>, EtlError> {
        let source_name = source.table().as_str();
        let batch = source
            .fetch_page(window, limit, offset)
            .await
            .map_err(|source| EtlError::Fetch {
                table: source_name.to_string(),
                offset,
                source,
            })?;
        if batch.is_empty() {
            debug!("empty page; no more results");
            return Ok(None);
        }
        let fetched = batch.len() as u64;
        debug!(rows = fetched, "fetched page");

        if let Some(archive) = &self.archive {
            match archive.store_page(Utc::now(), source_name, &batch).await {
                Ok(stored) => debug!(path = %stored.relative_path.display(), "archived raw page"),
                Err(err) => warn!(error = %err, "could not archive raw page"),
            }
        }

        let enriched = enricher
            .enrich(window, batch)
            .await
            .map_err(|source| EtlError::Enrich {
                table: source_name.to_string(),
                offset,
                source,
            })?;
        let written = self
            .warehouse
            .insert_rows(table, &enriched)
            .await
            .map_err(|source| EtlError::Write {
                table: table.clone(),
                offset,
                source,
            })?;
        info!(rows = written, "inserted page");
        Ok(Some((fetched, written as u64)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use ledgerflow_adapters::{IdentityEnricher, QueryError};
    use ledgerflow_core::{new_accounts_schema, Row, TableName};
    use ledgerflow_storage::MemoryWarehouse;
    use serde_json::json;

    use super::*;

    struct PagedSource {
        pages: Mutex<VecDeque<Result<Vec<Row>, QueryError>>>,
        offsets: Mutex<Vec<u64>>,
    }

    impl PagedSource {
        fn new(pages: Vec<Result<Vec<Row>, QueryError>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                offsets: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PageSource for PagedSource {
        fn table(&self) -> TableName {
            TableName::NewAccounts
        }

        async fn fetch_page(
            &self,
            _window: &TimeWindow,
            _limit: u64,
            offset: u64,
        ) -> Result<Vec<Row>, QueryError> {
            self.offsets.lock().unwrap().push(offset);
            self.pages.lock().unwrap().pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn account(n: u64) -> Row {
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
    }

    fn window() -> TimeWindow {
        TimeWindow::new(1_706_745_600_000_000_000, 1_706_832_000_000_000_000).unwrap()
    }

    async fn setup(page_size: u64, base_offset: u64) -> (Arc<MemoryWarehouse>, TableRef, PageWriter) {
        let warehouse = Arc::new(MemoryWarehouse::new());
        warehouse.ensure_dataset("ledger").await.unwrap();
        let table = TableRef::new("ledger", "new_accounts");
        warehouse.create_table(&table, &new_accounts_schema()).await.unwrap();
        let writer = PageWriter::new(
            warehouse.clone(),
            PageSettings {
                page_size,
                base_offset,
                page_delay: Duration::ZERO,
            },
        );
        (warehouse, table, writer)
    }

    #[tokio::test]
    async fn stops_after_short_page() {
        let (warehouse, table, writer) = setup(3, 0).await;
        let source = PagedSource::new(vec![
            Ok(vec![account(1), account(2), account(3)]),
            Ok(vec![account(4)]),
            Ok(vec![account(5)]),
        ]);

        let outcome = writer
            .run(&source, &table, &window(), &IdentityEnricher)
            .await
            .unwrap();

        assert_eq!(outcome, PageLoopOutcome { rows_written: 4, pages: 2 });
        assert_eq!(*source.offsets.lock().unwrap(), vec![0, 3]);
        assert_eq!(warehouse.row_count(&table).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn empty_page_ends_the_loop_without_writing() {
        let (warehouse, table, writer) = setup(2, 10).await;
        let source = PagedSource::new(vec![Ok(vec![account(1), account(2)]), Ok(Vec::new())]);

        let outcome = writer
            .run(&source, &table, &window(), &IdentityEnricher)
            .await
            .unwrap();

        assert_eq!(outcome.rows_written, 2);
        assert_eq!(*source.offsets.lock().unwrap(), vec![10, 12]);
        assert_eq!(warehouse.row_count(&table).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn fetch_failure_keeps_earlier_pages() {
        let (warehouse, table, writer) = setup(2, 0).await;
        let source = PagedSource::new(vec![
            Ok(vec![account(1), account(2)]),
            Err(QueryError::Message("connection reset".to_string())),
        ]);

        let err = writer
            .run(&source, &table, &window(), &IdentityEnricher)
            .await
            .unwrap_err();

        assert!(matches!(err, EtlError::Fetch { offset: 2, .. }));
        assert_eq!(warehouse.row_count(&table).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn write_failure_is_reported_with_offset() {
        let (_warehouse, table, writer) = setup(5, 0).await;
        let mut bad = account(1);
        bad.remove("id");
        let source = PagedSource::new(vec![Ok(vec![bad])]);

        let err = writer
            .run(&source, &table, &window(), &IdentityEnricher)
            .await
            .unwrap_err();
        assert!(matches!(err, EtlError::Write { offset: 0, .. }));
    }

    #[tokio::test]
    async fn raw_pages_are_archived_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let (_warehouse, table, writer) = setup(5, 0).await;
        let writer = writer.with_archive(Some(PageArchive::new(dir.path())));
        let source = PagedSource::new(vec![Ok(vec![account(1)])]);

        writer
            .run(&source, &table, &window(), &IdentityEnricher)
            .await
            .unwrap();

        let root = writer.archive().unwrap().root();
        assert_eq!(root, dir.path());
        let stamp_dirs: Vec<_> = std::fs::read_dir(root).unwrap().collect();
        assert_eq!(stamp_dirs.len(), 1);
        let table_dir = stamp_dirs[0].as_ref().unwrap().path().join("new_accounts");
        assert_eq!(std::fs::read_dir(table_dir).unwrap().count(), 1);
    }
}
