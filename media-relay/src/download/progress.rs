//! Progress tracking between the engine output and its sinks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::artifact::ArtifactWriter;
use super::metadata::MetadataStore;
use super::record::DownloadRecord;
use crate::{Error, Result};

/// Bytes already delivered in an earlier attempt, to be skipped and checked.
struct SkipBudget {
    remaining: u64,
    hasher: Sha256,
    expected: Vec<u8>,
}

/// Counts engine output, mirrors it into the temp artifact and persists the
/// count on a bounded cadence.
///
/// Only flushed byte counts are persisted, so the record never claims bytes
/// the artifact does not hold.
pub struct ProgressTracker {
    writer: ArtifactWriter,
    store: Arc<dyn MetadataStore>,
    record: Arc<Mutex<DownloadRecord>>,
    persist_interval: Duration,
    persist_bytes: u64,
    last_persist_at: Instant,
    last_persisted: u64,
    skip: Option<SkipBudget>,
}

impl ProgressTracker {
    pub fn new(
        writer: ArtifactWriter,
        store: Arc<dyn MetadataStore>,
        record: Arc<Mutex<DownloadRecord>>,
        persist_interval: Duration,
        persist_bytes: u64,
    ) -> Self {
        let last_persisted = writer.flushed();
        Self {
            writer,
            store,
            record,
            persist_interval,
            persist_bytes: persist_bytes.max(1),
            last_persist_at: Instant::now(),
            last_persisted,
            skip: None,
        }
    }

    /// Discard the first `len` engine bytes, checking they hash to
    /// `expected` (the SHA-256 of the bytes already in the artifact).
    pub fn skip_prefix(mut self, len: u64, expected: Vec<u8>) -> Self {
        if len > 0 {
            self.skip = Some(SkipBudget {
                remaining: len,
                hasher: Sha256::new(),
                expected,
            });
        }
        self
    }

    /// Bytes in the artifact, including buffered ones.
    pub fn written(&self) -> u64 {
        self.writer.written()
    }

    /// Take one chunk of engine output.
    ///
    /// Returns the part to forward to the client, `None` when the whole chunk
    /// was skipped.
    pub async fn process(&mut self, mut chunk: Bytes) -> Result<Option<Bytes>> {
        if let Some(skip) = self.skip.as_mut() {
            let take = skip.remaining.min(chunk.len() as u64) as usize;
            let skipped = chunk.split_to(take);
            skip.hasher.update(&skipped);
            skip.remaining -= take as u64;

            if skip.remaining == 0 {
                self.verify_skipped()?;
            }
            if chunk.is_empty() {
                return Ok(None);
            }
        }

        self.writer.write(&chunk).await?;
        if self.checkpoint_due() {
            self.checkpoint().await?;
        }
        Ok(Some(chunk))
    }

    fn verify_skipped(&mut self) -> Result<()> {
        let Some(skip) = self.skip.take() else {
            return Ok(());
        };
        let actual = skip.hasher.finalize();
        if actual.as_slice() != skip.expected.as_slice() {
            return Err(Error::process(
                "non-deterministic transcode output: resumed bytes differ from the saved prefix",
            ));
        }
        debug!(size = self.writer.written(), "Resumed output matches saved prefix");
        Ok(())
    }

    fn checkpoint_due(&self) -> bool {
        self.writer.written().saturating_sub(self.last_persisted) >= self.persist_bytes
            || self.last_persist_at.elapsed() >= self.persist_interval
    }

    /// Flush the artifact and persist the flushed size.
    pub async fn checkpoint(&mut self) -> Result<u64> {
        let flushed = self.writer.flush().await?;
        self.last_persist_at = Instant::now();
        if flushed == self.last_persisted {
            return Ok(flushed);
        }

        let mut record = self.record.lock().await;
        record.advance_to(flushed);
        self.store.save(&record).await?;
        self.last_persisted = flushed;
        trace!(download_id = %record.id, size = flushed, "Progress persisted");
        Ok(flushed)
    }

    /// End of engine output: flush everything and return the final size.
    ///
    /// Fails when the engine produced less than the skipped prefix.
    pub async fn finish(&mut self) -> Result<u64> {
        if let Some(skip) = &self.skip {
            return Err(Error::process(format!(
                "non-deterministic transcode output: ended {} bytes short of the saved prefix",
                skip.remaining
            )));
        }
        self.writer.flush().await
    }
}

/// SHA-256 of a byte sequence, as the tracker expects it.
pub fn prefix_digest(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}
