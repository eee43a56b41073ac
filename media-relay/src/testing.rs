//! In-process fakes for tests: a media provider serving fixed payloads and a
//! pipeline factory producing deterministic output without ffmpeg.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::io::StreamReader;

use crate::download::artifact::TempArtifactStore;
use crate::download::metadata::{JsonMetadataStore, MetadataStore};
use crate::download::session::{SessionConfig, SessionDeps};
use crate::pipeline::provider::validate_http_ref;
use crate::pipeline::{
    ByteStream, FormatInfo, MediaProvider, Pipeline, PipelineFactory, PipelineRequest,
    PipelineResources, ResourceDescriptor,
};
use crate::{Error, Result};

const PROVIDER_CHUNK: usize = 16 * 1024;

/// Serves in-memory payloads keyed by format id.
pub struct StaticMediaProvider {
    descriptor: ResourceDescriptor,
    payloads: HashMap<String, Bytes>,
}

impl StaticMediaProvider {
    pub fn new(descriptor: ResourceDescriptor) -> Self {
        Self {
            descriptor,
            payloads: HashMap::new(),
        }
    }

    pub fn with_payload(mut self, format_id: &str, payload: impl Into<Bytes>) -> Self {
        self.payloads.insert(format_id.to_string(), payload.into());
        self
    }

    pub fn with_thumbnails(mut self, thumbnails: Vec<String>) -> Self {
        self.descriptor.thumbnails = thumbnails;
        self
    }

    /// A single high-quality audio format holding `payload`.
    pub fn audio_only(payload: Vec<u8>) -> Self {
        let format = FormatInfo {
            id: "251".to_string(),
            url: "memory://251".to_string(),
            container: Some("webm".to_string()),
            has_audio: true,
            bitrate: Some(160_000),
            content_length: Some(payload.len() as u64),
            high_quality_audio: true,
            ..Default::default()
        };
        Self::new(ResourceDescriptor {
            title: Some("Test Track".to_string()),
            formats: vec![format],
            ..Default::default()
        })
        .with_payload("251", payload)
    }
}

#[async_trait]
impl MediaProvider for StaticMediaProvider {
    fn validate(&self, resource_ref: &str) -> Result<()> {
        validate_http_ref(resource_ref).map(|_| ())
    }

    async fn resolve(&self, resource_ref: &str) -> Result<ResourceDescriptor> {
        self.validate(resource_ref)?;
        Ok(ResourceDescriptor {
            resource_ref: resource_ref.to_string(),
            ..self.descriptor.clone()
        })
    }

    async fn open_stream(&self, _resource_ref: &str, format: &FormatInfo) -> Result<ByteStream> {
        let payload = self
            .payloads
            .get(&format.id)
            .cloned()
            .ok_or_else(|| Error::upstream(format!("no payload for format {}", format.id)))?;
        let chunks: Vec<io::Result<Bytes>> = payload
            .chunks(PROVIDER_CHUNK)
            .map(|c| Ok(payload.slice_ref(c)))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }
}

/// Deterministic engine output of `len` bytes.
pub fn fake_output(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + 7) % 251) as u8).collect()
}

/// A [`PipelineFactory`] whose "engine" emits [`fake_output`] in fixed-size
/// chunks.
///
/// With a gate, every chunk waits for one semaphore permit, which lets tests
/// stop output at an exact offset.
pub struct FakePipelineFactory {
    len: usize,
    chunk_size: usize,
    gate: Option<Arc<Semaphore>>,
    fail_after: Option<usize>,
    fail_builds: AtomicBool,
    builds: AtomicUsize,
    title: Option<String>,
    resources: Mutex<Vec<Arc<PipelineResources>>>,
}

impl FakePipelineFactory {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            chunk_size: 4096,
            gate: None,
            fail_after: None,
            fail_builds: AtomicBool::new(false),
            builds: AtomicUsize::new(0),
            title: Some("Fake Media".to_string()),
            resources: Mutex::new(Vec::new()),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Output breaks with an I/O error after `bytes`.
    pub fn failing_after(mut self, bytes: usize) -> Self {
        self.fail_after = Some(bytes);
        self
    }

    pub fn with_title(mut self, title: Option<&str>) -> Self {
        self.title = title.map(str::to_string);
        self
    }

    /// Make subsequent builds fail like an unreachable upstream.
    pub fn set_fail_builds(&self, fail: bool) {
        self.fail_builds.store(fail, Ordering::SeqCst);
    }

    pub fn expected_output(&self) -> Vec<u8> {
        fake_output(self.len)
    }

    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Whether every pipeline built so far has been torn down.
    pub fn all_torn_down(&self) -> bool {
        self.resources.lock().iter().all(|r| r.is_torn_down())
    }
}

#[async_trait]
impl PipelineFactory for FakePipelineFactory {
    fn validate(&self, resource_ref: &str) -> Result<()> {
        validate_http_ref(resource_ref).map(|_| ())
    }

    async fn build(&self, request: &PipelineRequest) -> Result<Pipeline> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if self.fail_builds.load(Ordering::SeqCst) {
            return Err(Error::upstream("fake upstream unavailable"));
        }

        let resources = Arc::new(PipelineResources::new(
            request.download_id.clone(),
            Duration::from_millis(10),
        ));
        self.resources.lock().push(resources.clone());

        let data = Bytes::from(fake_output(self.len));
        let chunk_size = self.chunk_size;
        let gate = self.gate.clone();
        let fail_after = self.fail_after;
        let cancel = resources.cancel_token();

        let stream = futures::stream::unfold(0usize, move |offset| {
            let data = data.clone();
            let gate = gate.clone();
            let cancel = cancel.clone();
            async move {
                if offset == usize::MAX {
                    return None;
                }
                if let Some(limit) = fail_after {
                    if offset >= limit {
                        return Some((Err(io::Error::other("fake engine crashed")), usize::MAX));
                    }
                }
                if offset >= data.len() {
                    return None;
                }
                if let Some(gate) = gate {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Some((Err(io::Error::other("fake engine stopped")), usize::MAX));
                        }
                        permit = gate.acquire() => permit.ok()?.forget(),
                    }
                }
                let mut end = (offset + chunk_size).min(data.len());
                if let Some(limit) = fail_after {
                    end = end.min(limit);
                }
                Some((Ok(data.slice(offset..end)), end))
            }
        })
        .boxed();

        Ok(Pipeline {
            output: Box::new(StreamReader::new(stream)),
            resources,
            estimated_size: Some(self.len as u64),
            title: self.title.clone(),
        })
    }
}

/// A working directory with stores and a fake factory wired into
/// [`SessionDeps`].
pub struct TestEnv {
    pub dir: tempfile::TempDir,
    pub factory: Arc<FakePipelineFactory>,
    pub deps: SessionDeps,
}

impl TestEnv {
    pub async fn new(output_len: usize) -> Self {
        Self::with_factory(FakePipelineFactory::new(output_len)).await
    }

    pub async fn with_factory(factory: FakePipelineFactory) -> Self {
        Self::with_config(factory, Self::session_config()).await
    }

    pub async fn with_config(factory: FakePipelineFactory, config: SessionConfig) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            JsonMetadataStore::new(dir.path())
                .await
                .expect("metadata store"),
        );
        let artifacts = TempArtifactStore::new(dir.path())
            .await
            .expect("artifact store");
        let factory = Arc::new(factory);
        let deps = SessionDeps {
            metadata,
            artifacts,
            factory: factory.clone(),
            config,
        };
        Self { dir, factory, deps }
    }

    /// Small persist cadence so progress shows up quickly.
    pub fn session_config() -> SessionConfig {
        SessionConfig {
            persist_interval: Duration::from_millis(20),
            persist_bytes: 8 * 1024,
            client_buffer: 2,
            cover_art: false,
        }
    }
}
