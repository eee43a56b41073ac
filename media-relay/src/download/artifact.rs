//! Temp artifacts: the engine output produced so far, one file per id.

use std::path::PathBuf;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter, Take};
use tokio_util::io::ReaderStream;

use crate::utils::fs;
use crate::{Error, Result};

const ARTIFACT_EXTENSION: &str = "part";
const WRITE_BUFFER: usize = 64 * 1024;

/// How an artifact is opened for writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Start from empty (fresh start).
    Truncate,
    /// Keep existing bytes and write after them (resume).
    Append,
}

#[derive(Debug, Clone)]
pub struct TempArtifactStore {
    dir: PathBuf,
}

impl TempArtifactStore {
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::ensure_dir_all_with_op("creating artifact directory", &dir).await?;
        Ok(Self { dir })
    }

    pub fn path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{ARTIFACT_EXTENSION}"))
    }

    pub async fn open(&self, id: &str, mode: OpenMode) -> Result<ArtifactWriter> {
        let path = self.path(id);
        let mut options = OpenOptions::new();
        options.create(true);
        match mode {
            OpenMode::Truncate => options.write(true).truncate(true),
            OpenMode::Append => options.append(true),
        };
        let file = options
            .open(&path)
            .await
            .map_err(|e| Error::io_path("opening artifact", &path, e))?;
        let existing = file
            .metadata()
            .await
            .map_err(|e| Error::io_path("inspecting artifact", &path, e))?
            .len();

        Ok(ArtifactWriter {
            inner: BufWriter::with_capacity(WRITE_BUFFER, file),
            path,
            written: existing,
            flushed: existing,
        })
    }

    /// Cut the artifact down to `len` bytes. A shorter file is left alone.
    ///
    /// Returns the resulting size.
    pub async fn truncate_to(&self, id: &str, len: u64) -> Result<u64> {
        let path = self.path(id);
        let file = match OpenOptions::new().write(true).open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::io_path("opening artifact", &path, e)),
        };
        let size = file
            .metadata()
            .await
            .map_err(|e| Error::io_path("inspecting artifact", &path, e))?
            .len();
        if size <= len {
            return Ok(size);
        }
        file.set_len(len)
            .await
            .map_err(|e| Error::io_path("truncating artifact", &path, e))?;
        Ok(len)
    }

    /// Stream the whole artifact.
    pub async fn read(&self, id: &str) -> Result<ReaderStream<File>> {
        let file = self.open_read(id).await?;
        Ok(ReaderStream::with_capacity(file, WRITE_BUFFER))
    }

    /// Stream at most the first `len` bytes of the artifact.
    pub async fn read_prefix(&self, id: &str, len: u64) -> Result<ReaderStream<Take<File>>> {
        let file = self.open_read(id).await?;
        Ok(ReaderStream::with_capacity(file.take(len), WRITE_BUFFER))
    }

    async fn open_read(&self, id: &str) -> Result<File> {
        let path = self.path(id);
        File::open(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::not_found("artifact", id),
            _ => Error::io_path("opening artifact", &path, e),
        })
    }

    /// Size in bytes, `0` when there is no artifact.
    pub async fn size(&self, id: &str) -> Result<u64> {
        fs::file_len_or_zero("inspecting artifact", &self.path(id)).await
    }

    /// Delete the artifact. A missing artifact is not an error.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        fs::remove_file_if_exists("deleting artifact", &self.path(id)).await
    }
}

/// Buffered writer over one artifact.
pub struct ArtifactWriter {
    inner: BufWriter<File>,
    path: PathBuf,
    written: u64,
    flushed: u64,
}

impl ArtifactWriter {
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.inner
            .write_all(chunk)
            .await
            .map_err(|e| Error::io_path("writing artifact", &self.path, e))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Flush buffered bytes to the OS. Returns the flushed size.
    pub async fn flush(&mut self) -> Result<u64> {
        self.inner
            .flush()
            .await
            .map_err(|e| Error::io_path("flushing artifact", &self.path, e))?;
        self.flushed = self.written;
        Ok(self.flushed)
    }

    /// Total bytes in the artifact, including buffered ones.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Bytes known to have reached the file.
    pub fn flushed(&self) -> u64 {
        self.flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    const ID: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    async fn collect<S>(stream: S) -> Vec<u8>
    where
        S: futures::Stream<Item = std::io::Result<bytes::Bytes>>,
    {
        let chunks: Vec<_> = stream.try_collect().await.unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn test_truncate_then_append() {
        let dir = tempfile::tempdir().unwrap();
        let store = TempArtifactStore::new(dir.path()).await.unwrap();

        let mut writer = store.open(ID, OpenMode::Truncate).await.unwrap();
        writer.write(b"hello ").await.unwrap();
        assert_eq!(writer.written(), 6);
        assert_eq!(writer.flush().await.unwrap(), 6);
        drop(writer);

        let mut writer = store.open(ID, OpenMode::Append).await.unwrap();
        assert_eq!(writer.written(), 6);
        writer.write(b"world").await.unwrap();
        writer.flush().await.unwrap();
        drop(writer);

        assert_eq!(store.size(ID).await.unwrap(), 11);
        assert_eq!(collect(store.read(ID).await.unwrap()).await, b"hello world");

        let writer = store.open(ID, OpenMode::Truncate).await.unwrap();
        assert_eq!(writer.written(), 0);
        assert_eq!(store.size(ID).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_truncate_to_and_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = TempArtifactStore::new(dir.path()).await.unwrap();
        tokio::fs::write(store.path(ID), b"0123456789").await.unwrap();

        assert_eq!(store.truncate_to(ID, 20).await.unwrap(), 10);
        assert_eq!(store.truncate_to(ID, 4).await.unwrap(), 4);
        assert_eq!(collect(store.read(ID).await.unwrap()).await, b"0123");
        assert_eq!(collect(store.read_prefix(ID, 2).await.unwrap()).await, b"01");
    }

    #[tokio::test]
    async fn test_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = TempArtifactStore::new(dir.path()).await.unwrap();

        assert_eq!(store.size(ID).await.unwrap(), 0);
        assert_eq!(store.truncate_to(ID, 0).await.unwrap(), 0);
        assert!(!store.delete(ID).await.unwrap());
        assert!(matches!(
            store.read(ID).await,
            Err(Error::NotFound { .. })
        ));
    }
}
