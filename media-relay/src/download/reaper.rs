//! Retention: evicts downloads older than a fixed window.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::artifact::TempArtifactStore;
use super::metadata::MetadataStore;
use super::registry::DownloadRegistry;

/// Configuration for the reaper.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Age after which a download is evicted (default: 24 hours).
    pub retention: Duration,
    /// Interval between full sweeps (default: 1 hour).
    pub sweep_interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

struct Timer {
    generation: u64,
    token: CancellationToken,
}

/// Per-id eviction timers plus a periodic sweep over everything persisted.
///
/// Eviction force-cancels a registered session first, which stops its
/// engine, then deletes the record and temp artifact.
pub struct Reaper {
    config: ReaperConfig,
    metadata: Arc<dyn MetadataStore>,
    artifacts: TempArtifactStore,
    registry: Arc<DownloadRegistry>,
    timers: DashMap<String, Timer>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

impl Reaper {
    pub fn new(
        config: ReaperConfig,
        metadata: Arc<dyn MetadataStore>,
        artifacts: TempArtifactStore,
        registry: Arc<DownloadRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            metadata,
            artifacts,
            registry,
            timers: DashMap::new(),
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    /// Evict `id` once it is older than the retention window.
    ///
    /// Replaces (and cancels) any timer already scheduled for `id`.
    pub fn schedule(self: &Arc<Self>, id: &str, created_at: DateTime<Utc>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let delay = self.remaining(created_at, Utc::now());
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let token = self.shutdown.child_token();

        if let Some(previous) = self.timers.insert(
            id.to_string(),
            Timer {
                generation,
                token: token.clone(),
            },
        ) {
            previous.token.cancel();
        }

        let reaper = self.clone();
        let id = id.to_string();
        debug!(download_id = %id, ?delay, "Eviction scheduled");
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let own = reaper
                        .timers
                        .remove_if(&id, |_, timer| timer.generation == generation)
                        .is_some();
                    if own {
                        reaper.evict(&id).await;
                    }
                }
            }
        });
    }

    /// Cancel the timer for `id`. Returns whether one was pending.
    pub fn cancel(&self, id: &str) -> bool {
        match self.timers.remove(id) {
            Some((_, timer)) => {
                timer.token.cancel();
                debug!(download_id = %id, "Eviction timer cancelled");
                true
            }
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        self.timers.len()
    }

    /// Cancel every timer and stop the periodic sweep.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.timers.clear();
        debug!("Reaper shut down");
    }

    fn remaining(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        let age = (now - created_at).to_std().unwrap_or_default();
        self.config.retention.saturating_sub(age)
    }

    /// Evict every persisted download older than the retention window.
    ///
    /// Returns how many were evicted.
    pub async fn sweep(&self) -> usize {
        let records = match self.metadata.list().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Failed to list records for sweep");
                return 0;
            }
        };

        let now = Utc::now();
        let mut evicted = 0;
        for record in records {
            if self.remaining(record.created_at, now).is_zero() {
                self.timers.remove(&record.id);
                self.evict(&record.id).await;
                evicted += 1;
            }
        }
        if evicted > 0 {
            info!(evicted, "Retention sweep finished");
        }
        evicted
    }

    /// Sweep now and then every `sweep_interval` until shutdown.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let reaper = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(reaper.config.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = reaper.shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        reaper.sweep().await;
                    }
                }
            }
            debug!("Retention sweep loop stopped");
        })
    }

    async fn evict(&self, id: &str) {
        if let Some(session) = self.registry.get(id) {
            if !session.state().is_terminal() {
                if let Err(e) = session.cancel().await {
                    debug!(download_id = %id, error = %e, "Session ended before eviction");
                }
            }
            self.registry.remove_if_same(id, &session);
        }

        if let Err(e) = self.artifacts.delete(id).await {
            warn!(download_id = %id, error = %e, "Failed to delete expired artifact");
        }
        if let Err(e) = self.metadata.delete(id).await {
            warn!(download_id = %id, error = %e, "Failed to delete expired record");
        }
        info!(download_id = %id, "Expired download evicted");
    }
}
