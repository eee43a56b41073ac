//! Streaming pipeline: source stream(s) → ffmpeg → output bytes.
//!
//! A [`PipelineFactory`] turns a request into a [`Pipeline`] for one attempt.
//! The pipeline owns everything it opened through [`PipelineResources`], which
//! is torn down exactly once no matter who asks first.

pub mod args;
pub mod builder;
pub mod cover_art;
pub mod provider;
pub mod resources;
pub mod selector;

use std::time::Duration;

use async_trait::async_trait;
use media_types::OutputKind;
use tokio::io::AsyncRead;

use crate::Result;
use crate::download::record::QualitySelector;

pub use builder::FfmpegPipelineBuilder;
pub use provider::{ByteStream, FormatInfo, HttpMediaProvider, MediaProvider, ResourceDescriptor};
pub use resources::PipelineResources;

/// Settings for the ffmpeg engine and the plumbing around it.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to the ffmpeg binary.
    pub binary_path: String,
    /// How long a SIGTERM'd engine gets before it is killed, and how long
    /// one may keep running after closing its output.
    pub kill_grace: Duration,
    /// Upper bound for fetching cover art.
    pub cover_art_timeout: Duration,
    /// How long a feeder waits for the engine to open its input pipe.
    pub pipe_open_timeout: Duration,
    /// Connect timeout for upstream requests.
    pub connect_timeout: Duration,
    /// Constant bitrate for MP3 output.
    pub audio_bitrate_kbps: u32,
    /// Bounding box for embedded cover art.
    pub cover_art_max_px: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary_path: "ffmpeg".to_string(),
            kill_grace: Duration::from_secs(1),
            cover_art_timeout: Duration::from_secs(5),
            pipe_open_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            audio_bitrate_kbps: 192,
            cover_art_max_px: 500,
        }
    }
}

/// What to build a pipeline for.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub download_id: String,
    pub resource_ref: String,
    pub kind: OutputKind,
    pub quality: QualitySelector,
    /// Embed cover art (audio only).
    pub cover_art: bool,
}

/// One live pipeline attempt.
pub struct Pipeline {
    /// The engine's output.
    pub output: Box<dyn AsyncRead + Send + Unpin>,
    pub resources: std::sync::Arc<PipelineResources>,
    /// Source size estimate, `None` when any selected stream length is unknown.
    pub estimated_size: Option<u64>,
    /// Title reported by the provider.
    pub title: Option<String>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("estimated_size", &self.estimated_size)
            .field("title", &self.title)
            .finish_non_exhaustive()
    }
}

/// Builds pipelines. Implemented by the ffmpeg builder and by test fakes.
#[async_trait]
pub trait PipelineFactory: Send + Sync {
    /// Reject malformed resource references without opening anything.
    fn validate(&self, resource_ref: &str) -> Result<()>;

    /// Best-effort title for a reference, used before any pipeline exists.
    fn fallback_title(&self, resource_ref: &str) -> String {
        provider::title_from_ref(resource_ref)
    }

    async fn build(&self, request: &PipelineRequest) -> Result<Pipeline>;
}
