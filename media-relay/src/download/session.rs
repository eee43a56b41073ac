//! The per-download state machine.
//!
//! A [`DownloadSession`] owns at most one pipeline attempt at a time. Each
//! attempt runs in its own pump task that replays saved bytes (on resume),
//! then copies engine output through a [`ProgressTracker`] to the client.
//!
//! Whoever takes the attempt out of its slot owns the resulting transition:
//! the pump itself when it ends on its own (completion, failure, client
//! disconnect), or `pause`/`cancel`/`cleanup` after stopping it.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Poll, ready};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::BoxStream;
use media_types::OutputKind;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::artifact::{ArtifactWriter, OpenMode, TempArtifactStore};
use super::metadata::MetadataStore;
use super::progress::ProgressTracker;
use super::record::{DownloadRecord, DownloadStatus};
use crate::pipeline::{Pipeline, PipelineFactory, PipelineRequest};
use crate::utils::filename::display_filename;
use crate::{Error, Result};

const READ_CHUNK: usize = 64 * 1024;

/// Per-session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Persist progress at least this often while bytes flow.
    pub persist_interval: Duration,
    /// Persist progress at least every this many bytes.
    pub persist_bytes: u64,
    /// Chunks buffered between the pump and the client.
    pub client_buffer: usize,
    /// Embed cover art in audio output.
    pub cover_art: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            persist_interval: Duration::from_secs(1),
            persist_bytes: 1024 * 1024,
            client_buffer: 16,
            cover_art: true,
        }
    }
}

/// Shared collaborators of every session.
#[derive(Clone)]
pub struct SessionDeps {
    pub metadata: Arc<dyn MetadataStore>,
    pub artifacts: TempArtifactStore,
    pub factory: Arc<dyn PipelineFactory>,
    pub config: SessionConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// A pipeline attempt is being set up or running.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle, Starting) | (Paused, Starting) => true,
            (Starting, Running) => true,
            (Running, Paused) | (Running, Completed) => true,
            (Idle | Starting | Running | Paused, Cancelled) => true,
            (Starting | Running | Paused, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an attempt starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// From byte zero; the artifact is truncated.
    Fresh,
    /// Replay the saved bytes, then continue after them.
    Resume,
}

/// Why an attempt ended.
#[derive(Debug)]
pub enum AttemptOutcome {
    Completed { size: u64 },
    /// The client went away.
    Disconnected,
    /// Stopped through the attempt's cancellation token.
    Interrupted,
    Failed(Error),
}

/// What the caller that stopped an attempt wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopRequest {
    Pause,
    Cancel,
}

struct Attempt {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<AttemptOutcome>,
}

/// The response side of a started download.
pub struct DownloadStream {
    pub id: String,
    pub filename: String,
    pub content_type: String,
    /// Bytes replayed from an earlier attempt before new output.
    pub resumed_from: u64,
    /// Final size when already known (completed downloads).
    pub total_size: Option<u64>,
    pub body: BoxStream<'static, io::Result<Bytes>>,
}

impl fmt::Debug for DownloadStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadStream")
            .field("id", &self.id)
            .field("filename", &self.filename)
            .field("resumed_from", &self.resumed_from)
            .finish_non_exhaustive()
    }
}

/// Sending half of a client body. Dropping it ends the body; an abort reason
/// set before that turns the end into an error.
struct ClientSink {
    tx: mpsc::Sender<io::Result<Bytes>>,
    abort: Arc<Mutex<Option<String>>>,
}

impl ClientSink {
    fn channel(capacity: usize) -> (Self, BoxStream<'static, io::Result<Bytes>>) {
        let (tx, mut rx) = mpsc::channel(capacity.max(1));
        let abort = Arc::new(Mutex::new(None::<String>));
        let reason = abort.clone();
        let mut finished = false;

        let body = futures::stream::poll_fn(move |cx| {
            if finished {
                return Poll::Ready(None);
            }
            match ready!(rx.poll_recv(cx)) {
                Some(item) => Poll::Ready(Some(item)),
                None => {
                    finished = true;
                    Poll::Ready(reason.lock().take().map(|msg| Err(io::Error::other(msg))))
                }
            }
        })
        .boxed();

        (Self { tx, abort }, body)
    }

    fn abort(self, reason: impl Into<String>) {
        *self.abort.lock() = Some(reason.into());
    }
}

type TerminalHook = Box<dyn Fn(&Arc<DownloadSession>) + Send + Sync>;

pub struct DownloadSession {
    id: String,
    deps: SessionDeps,
    state: watch::Sender<SessionState>,
    record: Arc<tokio::sync::Mutex<DownloadRecord>>,
    attempt: tokio::sync::Mutex<Option<Attempt>>,
    generation: AtomicU64,
    /// Serializes start/pause/resume/cancel.
    op_lock: tokio::sync::Mutex<()>,
    terminal_hooks: Mutex<Vec<TerminalHook>>,
}

impl fmt::Debug for DownloadSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl DownloadSession {
    pub fn new(record: DownloadRecord, deps: SessionDeps) -> Arc<Self> {
        Self::with_state(record, deps, SessionState::Idle)
    }

    /// Rehydrate a session for a persisted, resumable record.
    pub fn restore(record: DownloadRecord, deps: SessionDeps) -> Arc<Self> {
        Self::with_state(record, deps, SessionState::Paused)
    }

    fn with_state(record: DownloadRecord, deps: SessionDeps, state: SessionState) -> Arc<Self> {
        let (state, _) = watch::channel(state);
        Arc::new(Self {
            id: record.id.clone(),
            deps,
            state,
            record: Arc::new(tokio::sync::Mutex::new(record)),
            attempt: tokio::sync::Mutex::new(None),
            generation: AtomicU64::new(0),
            op_lock: tokio::sync::Mutex::new(()),
            terminal_hooks: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub async fn record(&self) -> DownloadRecord {
        self.record.lock().await.clone()
    }

    /// Run `hook` once when the session reaches a terminal state.
    pub fn on_terminal(&self, hook: impl Fn(&Arc<DownloadSession>) + Send + Sync + 'static) {
        self.terminal_hooks.lock().push(Box::new(hook));
    }

    fn transition(&self, next: SessionState) -> Result<()> {
        let mut result = Ok(());
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition_to(next) {
                result = Err(Error::invalid_transition(*current, next));
                return false;
            }
            debug!(download_id = %self.id, from = %current, to = %next, "Session transition");
            *current = next;
            true
        });
        result
    }

    /// Start an attempt and return the client stream.
    ///
    /// Valid from `Idle`, or from `Paused` with [`StartMode::Resume`].
    pub async fn start(self: &Arc<Self>, mode: StartMode) -> Result<DownloadStream> {
        let _op = self.op_lock.lock().await;
        self.start_locked(mode).await
    }

    /// Resume a paused session.
    pub async fn resume(self: &Arc<Self>) -> Result<DownloadStream> {
        let _op = self.op_lock.lock().await;
        let state = self.state();
        if state != SessionState::Paused {
            return Err(Error::invalid_transition(state, SessionState::Running));
        }
        self.start_locked(StartMode::Resume).await
    }

    async fn start_locked(self: &Arc<Self>, mode: StartMode) -> Result<DownloadStream> {
        let state = self.state();
        let allowed = match mode {
            StartMode::Fresh => state == SessionState::Idle,
            StartMode::Resume => matches!(state, SessionState::Idle | SessionState::Paused),
        };
        if !allowed {
            return Err(Error::invalid_transition(state, SessionState::Starting));
        }
        self.transition(SessionState::Starting)?;

        let request = {
            let record = self.record.lock().await;
            PipelineRequest {
                download_id: self.id.clone(),
                resource_ref: record.resource_ref.clone(),
                kind: record.output_kind,
                quality: record.quality_selector.clone(),
                cover_art: self.deps.config.cover_art && record.output_kind == OutputKind::Audio,
            }
        };

        let pipeline = match self.deps.factory.build(&request).await {
            Ok(pipeline) => pipeline,
            Err(e) => {
                warn!(download_id = %self.id, error = %e, "Failed to build pipeline");
                self.fail_before_running(&e).await;
                return Err(e);
            }
        };

        match self.launch(mode, pipeline).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                error!(download_id = %self.id, error = %e, "Failed to launch attempt");
                self.fail_before_running(&e).await;
                Err(e)
            }
        }
    }

    /// Prepare the artifact and record, then spawn the pump.
    async fn launch(self: &Arc<Self>, mode: StartMode, pipeline: Pipeline) -> Result<DownloadStream> {
        let artifacts = &self.deps.artifacts;

        let (resume_from, writer) = match mode {
            StartMode::Fresh => (0, artifacts.open(&self.id, OpenMode::Truncate).await),
            StartMode::Resume => {
                let persisted = self.record.lock().await.current_size_bytes;
                let kept = match artifacts.truncate_to(&self.id, persisted).await {
                    Ok(kept) => kept,
                    Err(e) => {
                        pipeline.resources.teardown().await;
                        return Err(e);
                    }
                };
                (kept, artifacts.open(&self.id, OpenMode::Append).await)
            }
        };
        let writer = match writer {
            Ok(writer) => writer,
            Err(e) => {
                pipeline.resources.teardown().await;
                return Err(e);
            }
        };

        let (filename, content_type) = {
            let mut record = self.record.lock().await;
            match mode {
                StartMode::Fresh => {
                    record.restart();
                    if let Some(title) = pipeline.title.as_deref() {
                        record.display_filename = display_filename(title, record.output_kind);
                    }
                }
                StartMode::Resume => record.reset_progress_to(resume_from),
            }
            record.set_estimated_size(pipeline.estimated_size);
            record.error = None;
            record.set_status(DownloadStatus::InProgress);
            if let Err(e) = self.deps.metadata.save(&record).await {
                drop(record);
                pipeline.resources.teardown().await;
                return Err(e);
            }
            (record.display_filename.clone(), record.content_type.clone())
        };

        let (sink, body) = ClientSink::channel(self.deps.config.client_buffer);
        let cancel = CancellationToken::new();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        // The slot is filled before the pump can finish, so the pump always
        // finds its own attempt when it settles.
        let mut slot = self.attempt.lock().await;
        let handle = tokio::spawn(self.clone().run_attempt(
            generation,
            pipeline,
            writer,
            resume_from,
            sink,
            cancel.clone(),
        ));
        *slot = Some(Attempt {
            generation,
            cancel,
            handle,
        });
        self.transition(SessionState::Running)?;
        drop(slot);

        info!(download_id = %self.id, ?mode, resume_from, "Download attempt started");

        Ok(DownloadStream {
            id: self.id.clone(),
            filename,
            content_type,
            resumed_from: resume_from,
            total_size: None,
            body,
        })
    }

    async fn fail_before_running(self: &Arc<Self>, cause: &Error) {
        {
            let mut record = self.record.lock().await;
            record.error = Some(cause.to_string());
            record.set_status(DownloadStatus::Failed);
            if let Err(e) = self.deps.metadata.save(&record).await {
                warn!(download_id = %self.id, error = %e, "Failed to persist failed status");
            }
        }
        if self.transition(SessionState::Failed).is_ok() {
            self.run_terminal_hooks();
        }
    }

    /// Pause a running download. Idempotent on an already paused session.
    ///
    /// Returns the state the session ended up in; a download that finished
    /// while the pause was in flight stays completed.
    pub async fn pause(self: &Arc<Self>) -> Result<SessionState> {
        let _op = self.op_lock.lock().await;
        match self.state() {
            SessionState::Paused => return Ok(SessionState::Paused),
            SessionState::Running => {}
            other => return Err(Error::invalid_transition(other, SessionState::Paused)),
        }
        Ok(self.stop_attempt(StopRequest::Pause).await)
    }

    /// Stop everything and delete the record and artifact.
    pub async fn cancel(self: &Arc<Self>) -> Result<()> {
        let _op = self.op_lock.lock().await;
        let state = self.state();
        if state.is_terminal() {
            return Err(Error::invalid_transition(state, SessionState::Cancelled));
        }
        let settled = self.stop_attempt(StopRequest::Cancel).await;
        if settled == SessionState::Cancelled {
            Ok(())
        } else {
            Err(Error::invalid_transition(settled, SessionState::Cancelled))
        }
    }

    /// Stop any live attempt and keep what it produced, leaving the session
    /// paused. Safe to call from any trigger, any number of times.
    pub async fn cleanup(self: &Arc<Self>) {
        let _op = self.op_lock.lock().await;
        if self.state() == SessionState::Running {
            self.stop_attempt(StopRequest::Pause).await;
        }
    }

    /// Stop the current attempt (if any) and settle according to `request`.
    async fn stop_attempt(self: &Arc<Self>, request: StopRequest) -> SessionState {
        let attempt = self.attempt.lock().await.take();

        let outcome = match attempt {
            Some(attempt) => {
                attempt.cancel.cancel();
                Some(join_outcome(attempt.handle).await)
            }
            None if self.state() == SessionState::Running => {
                // The pump is settling on its own; wait for it.
                let mut rx = self.state.subscribe();
                let settled = rx
                    .wait_for(|s| *s != SessionState::Running)
                    .await
                    .map(|s| *s)
                    .unwrap_or(SessionState::Failed);
                if request == StopRequest::Pause || settled.is_terminal() {
                    return settled;
                }
                None
            }
            None => None,
        };

        self.settle(outcome, Some(request)).await
    }

    async fn run_attempt(
        self: Arc<Self>,
        generation: u64,
        mut pipeline: Pipeline,
        writer: ArtifactWriter,
        resume_from: u64,
        sink: ClientSink,
        cancel: CancellationToken,
    ) -> AttemptOutcome {
        let outcome = self
            .pump(&mut pipeline, writer, resume_from, &sink.tx, &cancel)
            .await;

        match &outcome {
            AttemptOutcome::Completed { size } => {
                info!(download_id = %self.id, size, "Download completed");
            }
            AttemptOutcome::Disconnected => {
                info!(download_id = %self.id, "Client disconnected, pausing");
            }
            AttemptOutcome::Interrupted => {
                debug!(download_id = %self.id, "Attempt interrupted");
            }
            AttemptOutcome::Failed(e) => {
                error!(download_id = %self.id, error = %e, "Download attempt failed");
            }
        }

        if !matches!(outcome, AttemptOutcome::Completed { .. }) {
            pipeline.resources.teardown().await;
        }

        // If the slot still holds this attempt nobody stopped it: the pump
        // owns the transition. Otherwise the stopper settles with our outcome.
        let owned = {
            let mut slot = self.attempt.lock().await;
            match slot.as_ref() {
                Some(attempt) if attempt.generation == generation => slot.take().is_some(),
                _ => false,
            }
        };

        let reason = match &outcome {
            AttemptOutcome::Completed { .. } => None,
            AttemptOutcome::Failed(e) => Some(format!("download failed: {e}")),
            _ => Some("download stopped".to_string()),
        };

        if !owned {
            if let Some(reason) = reason {
                sink.abort(reason);
            }
            return outcome;
        }

        let settled = self.settle(Some(outcome), None).await;
        match reason {
            Some(reason) => sink.abort(reason),
            None if settled != SessionState::Completed => sink.abort("download did not complete"),
            None => drop(sink),
        }
        AttemptOutcome::Interrupted
    }

    /// Copy replayed bytes and then engine output to the client.
    async fn pump(
        &self,
        pipeline: &mut Pipeline,
        writer: ArtifactWriter,
        resume_from: u64,
        tx: &mpsc::Sender<io::Result<Bytes>>,
        cancel: &CancellationToken,
    ) -> AttemptOutcome {
        let mut tracker = ProgressTracker::new(
            writer,
            self.deps.metadata.clone(),
            self.record.clone(),
            self.deps.config.persist_interval,
            self.deps.config.persist_bytes,
        );

        if resume_from > 0 {
            match self.replay(resume_from, tx, cancel).await {
                Ok(digest) => tracker = tracker.skip_prefix(resume_from, digest),
                Err(outcome) => return outcome,
            }
        }

        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let outcome = loop {
            buf.reserve(READ_CHUNK);
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => break AttemptOutcome::Interrupted,
                _ = tx.closed() => break AttemptOutcome::Disconnected,
                read = pipeline.output.read_buf(&mut buf) => read,
            };

            match read {
                Err(e) => {
                    break AttemptOutcome::Failed(Error::process(format!(
                        "reading engine output: {e}"
                    )));
                }
                Ok(0) => {
                    let finished = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break AttemptOutcome::Interrupted,
                        finished = pipeline.resources.finish() => finished,
                    };
                    let finished = match finished {
                        Ok(()) => tracker.finish().await,
                        Err(e) => Err(e),
                    };
                    break match finished {
                        Ok(size) => AttemptOutcome::Completed { size },
                        Err(e) => AttemptOutcome::Failed(e),
                    };
                }
                Ok(_) => {
                    let chunk = buf.split().freeze();
                    let forward = match tracker.process(chunk).await {
                        Ok(Some(forward)) => forward,
                        Ok(None) => continue,
                        Err(e) => break AttemptOutcome::Failed(e),
                    };
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break AttemptOutcome::Interrupted,
                        sent = tx.send(Ok(forward)) => {
                            if sent.is_err() {
                                break AttemptOutcome::Disconnected;
                            }
                        }
                    }
                }
            }
        };

        if !matches!(outcome, AttemptOutcome::Completed { .. }) {
            if let Err(e) = tracker.checkpoint().await {
                warn!(download_id = %self.id, error = %e, "Failed to persist final progress");
            }
        }
        outcome
    }

    /// Send the saved prefix to the client, returning its SHA-256.
    async fn replay(
        &self,
        len: u64,
        tx: &mpsc::Sender<io::Result<Bytes>>,
        cancel: &CancellationToken,
    ) -> std::result::Result<Vec<u8>, AttemptOutcome> {
        let mut stream = self
            .deps
            .artifacts
            .read_prefix(&self.id, len)
            .await
            .map_err(AttemptOutcome::Failed)?;
        let mut hasher = Sha256::new();
        let mut replayed = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AttemptOutcome::Interrupted),
                next = stream.next() => next,
            };
            let chunk = match next {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    let path = self.deps.artifacts.path(&self.id);
                    return Err(AttemptOutcome::Failed(Error::io_path(
                        "replaying artifact",
                        &path,
                        e,
                    )));
                }
            };
            hasher.update(&chunk);
            replayed += chunk.len() as u64;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AttemptOutcome::Interrupted),
                sent = tx.send(Ok(chunk)) => {
                    if sent.is_err() {
                        return Err(AttemptOutcome::Disconnected);
                    }
                }
            }
        }

        if replayed != len {
            return Err(AttemptOutcome::Failed(Error::Other(format!(
                "artifact holds {replayed} bytes, expected {len}"
            ))));
        }
        debug!(download_id = %self.id, bytes = replayed, "Replayed saved output");
        Ok(hasher.finalize().to_vec())
    }

    /// Apply an attempt outcome and persist the result before returning.
    async fn settle(
        self: &Arc<Self>,
        outcome: Option<AttemptOutcome>,
        request: Option<StopRequest>,
    ) -> SessionState {
        let next = match (request, outcome) {
            (Some(StopRequest::Cancel), _) => {
                self.delete_persisted().await;
                SessionState::Cancelled
            }
            (_, Some(AttemptOutcome::Completed { size })) => {
                let mut record = self.record.lock().await;
                record.advance_to(size);
                record.set_total_size(size);
                record.error = None;
                record.set_status(DownloadStatus::Completed);
                self.save_logged(&record).await;
                SessionState::Completed
            }
            (_, Some(AttemptOutcome::Failed(e))) => {
                let mut record = self.record.lock().await;
                record.error = Some(e.to_string());
                record.set_status(DownloadStatus::Failed);
                self.save_logged(&record).await;
                SessionState::Failed
            }
            (_, Some(AttemptOutcome::Disconnected | AttemptOutcome::Interrupted)) | (_, None) => {
                let mut record = self.record.lock().await;
                record.set_status(DownloadStatus::Paused);
                self.save_logged(&record).await;
                SessionState::Paused
            }
        };

        if let Err(e) = self.transition(next) {
            warn!(download_id = %self.id, error = %e, "Ignoring late transition");
            return self.state();
        }
        if next.is_terminal() {
            self.run_terminal_hooks();
        }
        next
    }

    async fn save_logged(&self, record: &DownloadRecord) {
        if let Err(e) = self.deps.metadata.save(record).await {
            error!(download_id = %self.id, error = %e, "Failed to persist download record");
        }
    }

    async fn delete_persisted(&self) {
        if let Err(e) = self.deps.artifacts.delete(&self.id).await {
            warn!(download_id = %self.id, error = %e, "Failed to delete artifact");
        }
        if let Err(e) = self.deps.metadata.delete(&self.id).await {
            warn!(download_id = %self.id, error = %e, "Failed to delete record");
        }
        info!(download_id = %self.id, "Download cancelled, files removed");
    }

    fn run_terminal_hooks(self: &Arc<Self>) {
        let hooks = std::mem::take(&mut *self.terminal_hooks.lock());
        for hook in hooks {
            hook(self);
        }
    }
}

async fn join_outcome(handle: JoinHandle<AttemptOutcome>) -> AttemptOutcome {
    handle.await.unwrap_or_else(|e| {
        AttemptOutcome::Failed(Error::Other(format!("download task failed: {e}")))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use SessionState::*;

        assert!(Idle.can_transition_to(Starting));
        assert!(Paused.can_transition_to(Starting));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Failed));

        assert!(!Completed.can_transition_to(Paused));
        assert!(!Cancelled.can_transition_to(Starting));
        assert!(!Idle.can_transition_to(Paused));
        assert!(!Paused.can_transition_to(Completed));
    }

    #[test]
    fn test_state_flags() {
        assert!(SessionState::Running.is_active());
        assert!(SessionState::Starting.is_active());
        assert!(!SessionState::Paused.is_active());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Paused.is_terminal());
    }

    #[tokio::test]
    async fn test_resume_requires_paused() {
        let env = crate::testing::TestEnv::new(1024).await;
        let record = DownloadRecord::new(
            "https://x.com/a",
            OutputKind::Audio,
            crate::download::record::QualitySelector::highest(),
            "a.mp3",
        );
        let session = DownloadSession::new(record, env.deps.clone());

        let err = session.resume().await.unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
        assert!(matches!(session.pause().await, Err(Error::InvalidStateTransition { .. })));
        assert_eq!(env.factory.build_count(), 0);
    }

    #[tokio::test]
    async fn test_terminal_hook_runs_once() {
        let env = crate::testing::TestEnv::new(1024).await;
        let record = DownloadRecord::new(
            "https://x.com/b",
            OutputKind::Audio,
            crate::download::record::QualitySelector::highest(),
            "b.mp3",
        );
        let session = DownloadSession::restore(record, env.deps.clone());
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        session.on_terminal(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        session.cancel().await.unwrap();
        assert!(session.cancel().await.is_err());
        session.cleanup().await;

        assert_eq!(session.state(), SessionState::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_client_sink_abort_ends_with_error() {
        let (sink, mut body) = ClientSink::channel(4);
        sink.tx.send(Ok(Bytes::from_static(b"a"))).await.unwrap();
        sink.abort("download paused");

        assert_eq!(body.next().await.unwrap().unwrap(), Bytes::from_static(b"a"));
        let err = body.next().await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "download paused");
        assert!(body.next().await.is_none());
    }

    #[tokio::test]
    async fn test_client_sink_drop_ends_cleanly() {
        let (sink, mut body) = ClientSink::channel(4);
        sink.tx.send(Ok(Bytes::from_static(b"a"))).await.unwrap();
        drop(sink);

        assert!(body.next().await.unwrap().is_ok());
        assert!(body.next().await.is_none());
    }
}
