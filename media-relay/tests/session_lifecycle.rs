//! End-to-end download lifecycles against the fake pipeline factory.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use media_types::OutputKind;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use media_relay::Error;
use media_relay::download::{
    DownloadRecord, DownloadRegistry, DownloadService, DownloadStatus, DownloadStream,
    MetadataStore, QualitySelector, Reaper, ReaperConfig, SessionDeps, SessionState, StartRequest,
    download_id,
};
use media_relay::testing::{FakePipelineFactory, TestEnv};

const RESOURCE: &str = "https://media.example.com/watch/abc";

fn service_with(deps: SessionDeps) -> DownloadService {
    let registry = Arc::new(DownloadRegistry::new());
    let reaper = Reaper::new(
        ReaperConfig::default(),
        deps.metadata.clone(),
        deps.artifacts.clone(),
        registry.clone(),
    );
    DownloadService::new(deps, registry, reaper, 20)
}

fn service(env: &TestEnv) -> DownloadService {
    service_with(env.deps.clone())
}

fn request() -> StartRequest {
    StartRequest {
        resource_ref: RESOURCE.to_string(),
        kind: OutputKind::Audio,
        quality: QualitySelector::highest(),
        existing_id: None,
    }
}

fn gated(len: usize, chunk: usize) -> (Arc<Semaphore>, FakePipelineFactory) {
    let gate = Arc::new(Semaphore::new(0));
    let factory = FakePipelineFactory::new(len)
        .with_chunk_size(chunk)
        .with_gate(gate.clone());
    (gate, factory)
}

/// Read exactly `len` bytes from the body.
async fn read_exact(stream: &mut DownloadStream, len: usize) -> Vec<u8> {
    let mut received = Vec::with_capacity(len);
    while received.len() < len {
        let chunk = stream.body.next().await.expect("body ended early").unwrap();
        received.extend_from_slice(&chunk);
    }
    received
}

/// Read the body to its end, panicking on an error item.
async fn read_all(mut stream: DownloadStream) -> Vec<u8> {
    let mut received = Vec::new();
    while let Some(chunk) = stream.body.next().await {
        received.extend_from_slice(&chunk.unwrap());
    }
    received
}

#[tokio::test]
async fn pause_then_resume_is_byte_identical() {
    let (gate, factory) = gated(100_000, 10_000);
    let env = TestEnv::with_factory(factory).await;
    let service = service(&env);
    let expected = env.factory.expected_output();

    let mut first = service.start_or_resume(request()).await.unwrap();
    let id = first.id.clone();
    assert_eq!(id, download_id(RESOURCE, OutputKind::Audio, &QualitySelector::highest()));
    assert_eq!(first.resumed_from, 0);

    gate.add_permits(4);
    let head = read_exact(&mut first, 40_000).await;
    assert_eq!(head, expected[..40_000]);

    let paused = service.pause(&id).await.unwrap();
    assert_eq!(paused.record.status, DownloadStatus::Paused);
    assert_eq!(paused.record.current_size_bytes, 40_000);
    assert!(!paused.is_active);
    assert!(env.factory.all_torn_down());

    // The interrupted body ends with an error, not a clean EOF.
    let tail = first.body.next().await.unwrap();
    assert!(tail.is_err());
    assert!(first.body.next().await.is_none());

    // Pausing twice is fine.
    service.pause(&id).await.unwrap();

    gate.add_permits(1_000);
    let second = service.resume(&id).await.unwrap();
    assert_eq!(second.resumed_from, 40_000);
    let full = read_all(second).await;
    assert_eq!(full, expected);

    let done = service.status(&id).await.unwrap();
    assert_eq!(done.record.status, DownloadStatus::Completed);
    assert_eq!(done.record.total_size_bytes, Some(100_000));
    assert_eq!(done.record.current_size_bytes, 100_000);
    assert!(done.record.completed_at.is_some());
    assert_eq!(env.factory.build_count(), 2);
    assert!(service.registry().is_empty());
}

#[tokio::test]
async fn cancel_deletes_record_and_artifact() {
    let (gate, factory) = gated(50_000, 5_000);
    let env = TestEnv::with_factory(factory).await;
    let service = service(&env);

    let mut stream = service.start_or_resume(request()).await.unwrap();
    let id = stream.id.clone();
    gate.add_permits(3);
    read_exact(&mut stream, 15_000).await;

    service.delete(&id).await.unwrap();

    // The body ends with an error that does not claim a pause.
    let tail = stream.body.next().await.unwrap().unwrap_err();
    assert_eq!(tail.to_string(), "download stopped");
    assert!(stream.body.next().await.is_none());

    assert!(matches!(service.status(&id).await, Err(Error::NotFound { .. })));
    assert!(!env.deps.artifacts.path(&id).exists());
    assert!(env.deps.metadata.load(&id).await.unwrap().is_none());
    assert!(env.factory.all_torn_down());
    assert!(service.registry().is_empty());
}

#[tokio::test]
async fn second_request_for_active_download_conflicts() {
    let (gate, factory) = gated(20_000, 4_000);
    let env = TestEnv::with_factory(factory).await;
    let service = service(&env);

    let stream = service.start_or_resume(request()).await.unwrap();
    let err = service.start_or_resume(request()).await.unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));
    assert_eq!(env.factory.build_count(), 1);
    assert_eq!(service.registry().len(), 1);

    gate.add_permits(100);
    assert_eq!(read_all(stream).await.len(), 20_000);
}

#[tokio::test]
async fn racing_stop_triggers_leave_nothing_behind() {
    for _ in 0..10 {
        let (gate, factory) = gated(50_000, 5_000);
        let env = TestEnv::with_factory(factory).await;
        let service = service(&env);

        let mut stream = service.start_or_resume(request()).await.unwrap();
        let id = stream.id.clone();
        let session = service.registry().get(&id).unwrap();
        gate.add_permits(2);
        read_exact(&mut stream, 10_000).await;

        let (_, _, deleted, _) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(
                async move { drop(stream) },
                service.pause(&id),
                service.delete(&id),
                session.cleanup(),
            )
        })
        .await
        .expect("stop triggers deadlocked");
        deleted.unwrap();

        assert_eq!(session.state(), SessionState::Cancelled);
        assert!(env.deps.metadata.load(&id).await.unwrap().is_none());
        assert!(!env.deps.artifacts.path(&id).exists());
        assert!(service.registry().is_empty());
        assert!(env.factory.all_torn_down());
    }
}

#[tokio::test]
async fn client_disconnect_pauses_and_releases_pipeline() {
    let (gate, factory) = gated(80_000, 8_000);
    let env = TestEnv::with_factory(factory).await;
    let service = service(&env);

    let mut stream = service.start_or_resume(request()).await.unwrap();
    let id = stream.id.clone();
    let session = service.registry().get(&id).unwrap();
    let mut state = session.subscribe();

    gate.add_permits(2);
    read_exact(&mut stream, 8_000).await;
    drop(stream);

    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == SessionState::Paused),
    )
    .await
    .expect("session did not pause")
    .unwrap();

    assert!(env.factory.all_torn_down());
    let record = env.deps.metadata.load(&id).await.unwrap().unwrap();
    assert_eq!(record.status, DownloadStatus::Paused);
    assert!(record.current_size_bytes >= 8_000);
    assert!(record.current_size_bytes <= env.deps.artifacts.size(&id).await.unwrap());
}

#[tokio::test]
async fn malformed_reference_is_rejected_synchronously() {
    let env = TestEnv::new(1_000).await;
    let service = service(&env);

    for bad in ["", "not a url", "ftp://media.example.com/a", "https://"] {
        let err = service
            .start_or_resume(StartRequest {
                resource_ref: bad.to_string(),
                ..request()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidResource(_)), "{bad}: {err}");
    }

    assert!(service.registry().is_empty());
    assert_eq!(env.factory.build_count(), 0);
    assert!(env.deps.metadata.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn engine_failure_marks_download_failed() {
    let env = TestEnv::with_factory(FakePipelineFactory::new(100_000).failing_after(30_000)).await;
    let service = service(&env);

    let mut stream = service.start_or_resume(request()).await.unwrap();
    let id = stream.id.clone();
    let mut saw_error = false;
    while let Some(chunk) = stream.body.next().await {
        if chunk.is_err() {
            saw_error = true;
        }
    }
    assert!(saw_error);

    let status = service.status(&id).await.unwrap();
    assert_eq!(status.record.status, DownloadStatus::Failed);
    assert!(status.record.error.is_some());
    assert!(env.factory.all_torn_down());
    assert!(service.registry().is_empty());
}

#[tokio::test]
async fn paused_download_resumes_after_restart() {
    let (gate, factory) = gated(60_000, 6_000);
    let env = TestEnv::with_factory(factory).await;
    let expected = env.factory.expected_output();

    let id = {
        let service = service(&env);
        let mut stream = service.start_or_resume(request()).await.unwrap();
        gate.add_permits(5);
        read_exact(&mut stream, 30_000).await;
        service.shutdown().await;
        stream.id.clone()
    };

    let record = env.deps.metadata.load(&id).await.unwrap().unwrap();
    assert_eq!(record.status, DownloadStatus::Paused);
    assert_eq!(record.current_size_bytes, 30_000);

    // A fresh process sees only what was persisted.
    let service = service(&env);
    gate.add_permits(1_000);
    let resumed = service.start_or_resume(request()).await.unwrap();
    assert_eq!(resumed.resumed_from, 30_000);
    assert_eq!(read_all(resumed).await, expected);
}

/// Records every saved `(status, current size)` pair.
struct RecordingStore {
    inner: Arc<dyn MetadataStore>,
    saves: Mutex<Vec<(DownloadStatus, u64, Option<u64>)>>,
}

#[async_trait]
impl MetadataStore for RecordingStore {
    async fn load(&self, id: &str) -> media_relay::Result<Option<DownloadRecord>> {
        self.inner.load(id).await
    }

    async fn save(&self, record: &DownloadRecord) -> media_relay::Result<()> {
        self.saves.lock().push((
            record.status,
            record.current_size_bytes,
            record.total_size_bytes,
        ));
        self.inner.save(record).await
    }

    async fn delete(&self, id: &str) -> media_relay::Result<()> {
        self.inner.delete(id).await
    }

    async fn list(&self) -> media_relay::Result<Vec<DownloadRecord>> {
        self.inner.list().await
    }
}

#[tokio::test]
async fn persisted_progress_is_monotonic_and_completes_at_total() {
    let env = TestEnv::with_factory(FakePipelineFactory::new(200_000).with_chunk_size(1_000)).await;
    let store = Arc::new(RecordingStore {
        inner: env.deps.metadata.clone(),
        saves: Mutex::new(Vec::new()),
    });
    let deps = SessionDeps {
        metadata: store.clone(),
        ..env.deps.clone()
    };
    let service = service_with(deps);

    let stream = service.start_or_resume(request()).await.unwrap();
    assert_eq!(read_all(stream).await.len(), 200_000);

    let saves = store.saves.lock().clone();
    let in_progress: Vec<u64> = saves
        .iter()
        .filter(|(status, _, _)| *status == DownloadStatus::InProgress)
        .map(|(_, current, _)| *current)
        .collect();
    assert!(in_progress.len() > 2, "expected periodic checkpoints");
    assert!(in_progress.windows(2).all(|w| w[0] <= w[1]));

    let (status, current, total) = *saves.last().unwrap();
    assert_eq!(status, DownloadStatus::Completed);
    assert_eq!(current, 200_000);
    assert_eq!(total, Some(200_000));
}
