use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use ledgerflow_core::Row;
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StoredPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub rows: usize,
    pub deduplicated: bool,
}

/// Serialized page bytes and their hex sha256. Rows are JSON objects with sorted keys,
/// so equal pages always encode to equal bytes.
fn encode_page(page: &[Row]) -> serde_json::Result<(Vec<u8>, String)> {
    let bytes = serde_json::to_vec(page)?;
    let hash = hex::encode(Sha256::digest(&bytes));
    Ok((bytes, hash))
}

/// Immutable, content-addressed dump of raw query pages as they arrived from the API:
/// `<root>/<YYYYmmdd_HHMMSS>/<table>/<sha256>.json`.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn page_relative_path(&self, fetched_at: DateTime<Utc>, table: &str, content_hash: &str) -> PathBuf {
        let mut path = PathBuf::from(fetched_at.format("%Y%m%d_%H%M%S").to_string());
        path.push(table);
        path.push(format!("{content_hash}.json"));
        path
    }

    /// Archives one page. A page already present under the same fetch second and table is
    /// not written again and comes back with `deduplicated` set.
    pub async fn store_page(
        &self,
        fetched_at: DateTime<Utc>,
        table: &str,
        page: &[Row],
    ) -> anyhow::Result<StoredPage> {
        let (bytes, content_hash) = encode_page(page).context("serializing raw page")?;
        let relative_path = self.page_relative_path(fetched_at, table, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        let already_archived = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?;
        let deduplicated = already_archived || !publish(&absolute_path, &bytes).await?;

        Ok(StoredPage {
            content_hash,
            relative_path,
            absolute_path,
            rows: page.len(),
            deduplicated,
        })
    }
}

/// Writes `bytes` next to `path` and renames the file into place, so readers never see a
/// partial page. Returns `false` when a concurrent writer published the same page first.
async fn publish(path: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let dir = path
        .parent()
        .with_context(|| format!("archive path {} has no parent", path.display()))?;
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating archive directory {}", dir.display()))?;

    let partial = dir.join(format!(".{}.part", Uuid::new_v4().simple()));
    fs::write(&partial, bytes)
        .await
        .with_context(|| format!("writing partial page {}", partial.display()))?;

    match fs::rename(&partial, path).await {
        Ok(()) => Ok(true),
        Err(err) => {
            let _ = fs::remove_file(&partial).await;
            if err.kind() == std::io::ErrorKind::AlreadyExists {
                return Ok(false);
            }
            Err(err).with_context(|| format!("publishing page {}", path.display()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn account(ts: u64, entity_id: u64) -> Row {
        json!({ "consensus_timestamp": ts.to_string(), "entity_id": entity_id })
            .as_object()
            .cloned()
            .unwrap()
    }

    fn fetched_at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn archived_file_holds_the_page_rows() {
        let dir = tempdir().unwrap();
        let archive = PageArchive::new(dir.path());
        let page = vec![account(1_706_812_890_529_120_002, 1002), account(1_706_812_890_529_120_003, 1003)];

        let stored = archive.store_page(fetched_at(), "new_accounts", &page).await.unwrap();

        let on_disk = std::fs::read(&stored.absolute_path).unwrap();
        let rows: Vec<Row> = serde_json::from_slice(&on_disk).unwrap();
        assert_eq!(rows, page);
        assert_eq!(stored.rows, 2);
        assert_eq!(stored.content_hash, hex::encode(Sha256::digest(&on_disk)));
        assert_eq!(
            stored.relative_path,
            PathBuf::from("20260224_120000")
                .join("new_accounts")
                .join(format!("{}.json", stored.content_hash))
        );
    }

    #[tokio::test]
    async fn identical_pages_deduplicate_and_distinct_pages_do_not() {
        let dir = tempdir().unwrap();
        let archive = PageArchive::new(dir.path());

        let first = archive
            .store_page(fetched_at(), "new_accounts", &[account(1, 1002)])
            .await
            .unwrap();
        let again = archive
            .store_page(fetched_at(), "new_accounts", &[account(1, 1002)])
            .await
            .unwrap();
        let other = archive
            .store_page(fetched_at(), "new_accounts", &[account(2, 1003)])
            .await
            .unwrap();

        assert!(!first.deduplicated);
        assert!(again.deduplicated);
        assert_eq!(first.absolute_path, again.absolute_path);
        assert!(!other.deduplicated);
        assert_ne!(first.content_hash, other.content_hash);

        let table_dir = first.absolute_path.parent().unwrap();
        let names: Vec<_> = std::fs::read_dir(table_dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|name| name.ends_with(".json")));
    }

    #[test]
    fn empty_page_encodes_as_empty_array() {
        let (bytes, hash) = encode_page(&[]).unwrap();
        assert_eq!(bytes, b"[]");
        assert_eq!(hash.len(), 64);
    }
}
