//! The inbound surface over sessions, records and artifacts.

use std::sync::Arc;

use futures::StreamExt;
use media_types::OutputKind;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::record::{DownloadRecord, DownloadStatus, QualitySelector, download_id, is_valid_id};
use super::reaper::Reaper;
use super::registry::DownloadRegistry;
use super::session::{DownloadSession, DownloadStream, SessionDeps, SessionState, StartMode};
use crate::{Error, Result};

/// A start-or-resume request.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub resource_ref: String,
    pub kind: OutputKind,
    pub quality: QualitySelector,
    /// Id the caller believes this download has. Must match the derived id.
    pub existing_id: Option<String>,
}

/// A record plus its live session state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    #[serde(flatten)]
    pub record: DownloadRecord,
    pub is_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_state: Option<SessionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
}

impl StatusView {
    fn new(record: DownloadRecord, session_state: Option<SessionState>) -> Self {
        let progress = record.progress_ratio();
        Self {
            record,
            is_active: session_state.is_some_and(|s| s.is_active()),
            session_state,
            progress,
        }
    }
}

pub struct DownloadService {
    deps: SessionDeps,
    registry: Arc<DownloadRegistry>,
    reaper: Arc<Reaper>,
    recent_limit: usize,
}

impl DownloadService {
    pub fn new(
        deps: SessionDeps,
        registry: Arc<DownloadRegistry>,
        reaper: Arc<Reaper>,
        recent_limit: usize,
    ) -> Self {
        Self {
            deps,
            registry,
            reaper,
            recent_limit,
        }
    }

    pub fn registry(&self) -> &Arc<DownloadRegistry> {
        &self.registry
    }

    /// Start a download, resume it from its last checkpoint, or re-serve it
    /// when it already completed.
    ///
    /// Malformed references are rejected before anything is opened or
    /// registered.
    pub async fn start_or_resume(&self, request: StartRequest) -> Result<DownloadStream> {
        self.deps.factory.validate(&request.resource_ref)?;
        let id = download_id(&request.resource_ref, request.kind, &request.quality);
        if let Some(existing) = request.existing_id.as_deref()
            && existing != id
        {
            return Err(Error::invalid_resource(format!(
                "id {existing} does not match the requested download"
            )));
        }

        if let Some(session) = self.registry.get(&id) {
            match session.state() {
                SessionState::Paused => {
                    return session.resume().await.map_err(|e| busy_as_conflict(&id, e));
                }
                state if !state.is_terminal() => return Err(Error::conflict(&id)),
                _ => {}
            }
        }

        let (record, mode) = match self.deps.metadata.load(&id).await? {
            Some(record) => match record.status {
                DownloadStatus::Completed => {
                    if let Some(stream) = self.serve_completed(&record).await? {
                        return Ok(stream);
                    }
                    warn!(download_id = %id, "Completed artifact missing or short, restarting");
                    (record, StartMode::Fresh)
                }
                DownloadStatus::Failed => (record, StartMode::Fresh),
                DownloadStatus::Paused | DownloadStatus::InProgress => (record, StartMode::Resume),
            },
            None => {
                let title = self.deps.factory.fallback_title(&request.resource_ref);
                let filename = crate::utils::filename::display_filename(&title, request.kind);
                let record = DownloadRecord::new(
                    request.resource_ref.trim(),
                    request.kind,
                    request.quality.clone(),
                    filename,
                );
                (record, StartMode::Fresh)
            }
        };

        let session = self.register(record, mode == StartMode::Resume)?;
        if session.state() == SessionState::Idle {
            session.start(StartMode::Fresh).await
        } else {
            session.resume().await.map_err(|e| busy_as_conflict(&id, e))
        }
    }

    /// Register a session for `record`, wiring the terminal hooks and the
    /// eviction timer. A paused session someone else registered first is
    /// returned instead.
    fn register(&self, record: DownloadRecord, paused: bool) -> Result<Arc<DownloadSession>> {
        let id = record.id.clone();
        let created_at = record.created_at;
        let deps = self.deps.clone();
        let (session, created) = self.registry.get_or_create(&id, move || {
            if paused {
                DownloadSession::restore(record, deps)
            } else {
                DownloadSession::new(record, deps)
            }
        })?;

        if created {
            let registry = self.registry.clone();
            let reaper = self.reaper.clone();
            session.on_terminal(move |session| {
                registry.remove_if_same(session.id(), session);
                reaper.cancel(session.id());
            });
            self.reaper.schedule(&id, created_at);
        }
        Ok(session)
    }

    async fn serve_completed(&self, record: &DownloadRecord) -> Result<Option<DownloadStream>> {
        let size = self.deps.artifacts.size(&record.id).await?;
        if record.total_size_bytes != Some(size) || size == 0 {
            return Ok(None);
        }
        let body = self.deps.artifacts.read(&record.id).await?;
        info!(download_id = %record.id, size, "Serving completed download from artifact");
        Ok(Some(DownloadStream {
            id: record.id.clone(),
            filename: record.display_filename.clone(),
            content_type: record.content_type.clone(),
            resumed_from: 0,
            total_size: Some(size),
            body: body.boxed(),
        }))
    }

    pub async fn status(&self, id: &str) -> Result<StatusView> {
        if !is_valid_id(id) {
            return Err(Error::not_found("download", id));
        }
        if let Some(session) = self.registry.get(id) {
            let state = session.state();
            if state != SessionState::Cancelled {
                return Ok(StatusView::new(session.record().await, Some(state)));
            }
        }
        let record = self
            .deps
            .metadata
            .load(id)
            .await?
            .ok_or_else(|| Error::not_found("download", id))?;
        Ok(StatusView::new(record, None))
    }

    /// Pause a running download. Pausing an already paused one is a no-op.
    pub async fn pause(&self, id: &str) -> Result<StatusView> {
        match self.registry.get(id) {
            Some(session) => {
                session.pause().await?;
            }
            None => {
                let record = self.load_existing(id).await?;
                if record.status != DownloadStatus::Paused {
                    return Err(Error::invalid_transition(record.status, DownloadStatus::Paused));
                }
            }
        }
        self.status(id).await
    }

    /// Resume a paused download from its last checkpoint.
    pub async fn resume(&self, id: &str) -> Result<DownloadStream> {
        if let Some(session) = self.registry.get(id)
            && !session.state().is_terminal()
        {
            return session.resume().await.map_err(|e| busy_as_conflict(id, e));
        }

        let record = self.load_existing(id).await?;
        match record.status {
            DownloadStatus::Paused | DownloadStatus::InProgress => {
                let session = self.register(record, true)?;
                session.resume().await.map_err(|e| busy_as_conflict(id, e))
            }
            status => Err(Error::invalid_transition(status, DownloadStatus::InProgress)),
        }
    }

    /// Stop the download if it is live and delete its record and artifact.
    pub async fn delete(&self, id: &str) -> Result<()> {
        if !is_valid_id(id) {
            return Err(Error::not_found("download", id));
        }

        let mut found = false;
        if let Some(session) = self.registry.get(id) {
            found = true;
            if let Err(e) = session.cancel().await {
                debug!(download_id = %id, error = %e, "Session already ended, deleting files");
            }
            self.registry.remove_if_same(id, &session);
        }
        self.reaper.cancel(id);

        found |= self.deps.metadata.load(id).await?.is_some();
        found |= self.deps.artifacts.delete(id).await?;
        self.deps.metadata.delete(id).await?;

        if !found {
            return Err(Error::not_found("download", id));
        }
        info!(download_id = %id, "Download deleted");
        Ok(())
    }

    /// Most recently touched downloads.
    pub async fn recent(&self) -> Result<Vec<StatusView>> {
        let records = self.deps.metadata.recent(self.recent_limit).await?;
        Ok(records
            .into_iter()
            .map(|record| {
                let state = self.registry.get(&record.id).map(|s| s.state());
                StatusView::new(record, state)
            })
            .collect())
    }

    /// Stop every live attempt, keeping what it produced as paused.
    pub async fn shutdown(&self) {
        let sessions = self.registry.sessions();
        info!(count = sessions.len(), "Pausing live downloads for shutdown");
        futures::future::join_all(sessions.iter().map(|s| s.cleanup())).await;
        self.reaper.shutdown();
    }

    async fn load_existing(&self, id: &str) -> Result<DownloadRecord> {
        if !is_valid_id(id) {
            return Err(Error::not_found("download", id));
        }
        self.deps
            .metadata
            .load(id)
            .await?
            .ok_or_else(|| Error::not_found("download", id))
    }
}

/// A resume racing another start on the same session is a conflict for the
/// caller.
fn busy_as_conflict(id: &str, e: Error) -> Error {
    match e {
        Error::InvalidStateTransition { ref from, .. }
            if from == SessionState::Starting.as_str() || from == SessionState::Running.as_str() =>
        {
            Error::conflict(id)
        }
        other => other,
    }
}
