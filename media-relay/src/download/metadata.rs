//! Durable per-download records.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::record::{DownloadRecord, is_valid_id};
use crate::utils::fs;
use crate::{Error, Result};

const RECORD_EXTENSION: &str = "json";

/// Storage for [`DownloadRecord`]s, keyed by id.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<DownloadRecord>>;

    /// Atomically overwrite the record for `record.id`.
    async fn save(&self, record: &DownloadRecord) -> Result<()>;

    /// Delete a record. Deleting a missing record is not an error.
    async fn delete(&self, id: &str) -> Result<()>;

    async fn list(&self) -> Result<Vec<DownloadRecord>>;

    /// Most recently modified records first, at most `limit`.
    async fn recent(&self, limit: usize) -> Result<Vec<DownloadRecord>> {
        let mut records = self.list().await?;
        records.sort_by(|a, b| b.last_modified_at.cmp(&a.last_modified_at));
        records.truncate(limit);
        Ok(records)
    }
}

/// One pretty-printed JSON file per record under the working directory.
#[derive(Debug, Clone)]
pub struct JsonMetadataStore {
    dir: PathBuf,
}

impl JsonMetadataStore {
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::ensure_dir_all_with_op("creating metadata directory", &dir).await?;
        Ok(Self { dir })
    }

    pub fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{RECORD_EXTENSION}"))
    }

    fn checked_path(&self, id: &str) -> Result<PathBuf> {
        if !is_valid_id(id) {
            return Err(Error::not_found("download", id));
        }
        Ok(self.path(id))
    }
}

/// Write `bytes` to a sibling temp file, then rename it over `path`.
fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".record-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| Error::io_path("creating temp record in", dir, e))?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| Error::io_path("writing temp record for", path, e))?;
    tmp.persist(path)
        .map_err(|e| Error::io_path("persisting record", path, e.error))?;
    Ok(())
}

#[async_trait]
impl MetadataStore for JsonMetadataStore {
    async fn load(&self, id: &str) -> Result<Option<DownloadRecord>> {
        if !is_valid_id(id) {
            return Ok(None);
        }
        let path = self.path(id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io_path("reading record", &path, e)),
        }
    }

    async fn save(&self, record: &DownloadRecord) -> Result<()> {
        let path = self.checked_path(&record.id)?;
        let bytes = serde_json::to_vec_pretty(record)?;
        let dir = self.dir.clone();

        tokio::task::spawn_blocking(move || write_atomic(&dir, &path, &bytes))
            .await
            .map_err(|e| Error::Other(format!("record writer task failed: {e}")))??;

        debug!(
            download_id = %record.id,
            status = %record.status,
            current_size = record.current_size_bytes,
            "Saved download record"
        );
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        if !is_valid_id(id) {
            return Ok(());
        }
        fs::remove_file_if_exists("deleting record", &self.path(id)).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DownloadRecord>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| Error::io_path("listing records in", &self.dir, e))?;
        let mut records = Vec::new();

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::io_path("listing records in", &self.dir, e))?
        {
            let path = entry.path();
            let is_record = path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXTENSION)
                && path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .is_some_and(is_valid_id);
            if !is_record {
                continue;
            }

            let parsed = match tokio::fs::read(&path).await {
                Ok(bytes) => serde_json::from_slice::<DownloadRecord>(&bytes).map_err(Error::from),
                Err(e) => Err(Error::io_path("reading record", &path, e)),
            };
            match parsed {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable record"),
            }
        }

        Ok(records)
    }
}
