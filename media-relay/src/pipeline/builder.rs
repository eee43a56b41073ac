//! ffmpeg-backed pipeline construction.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use media_types::OutputKind;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::args::{PipeLayout, build_engine_args};
use super::cover_art::fetch_cover_art;
use super::provider::{ByteStream, MediaProvider};
use super::resources::PipelineResources;
use super::selector::select_formats;
use super::{EngineConfig, Pipeline, PipelineFactory, PipelineRequest};
use crate::{Error, Result};

/// Builds pipelines that run ffmpeg with one named pipe per source stream.
pub struct FfmpegPipelineBuilder {
    provider: Arc<dyn MediaProvider>,
    client: reqwest::Client,
    config: EngineConfig,
}

impl FfmpegPipelineBuilder {
    pub fn new(provider: Arc<dyn MediaProvider>, client: reqwest::Client, config: EngineConfig) -> Self {
        Self {
            provider,
            client,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// First line of `ffmpeg -version`, or `None` if the binary can't run.
    pub async fn engine_version(&self) -> Option<String> {
        let output = process_utils::tokio_command(&self.config.binary_path)
            .arg("-version")
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await
            .ok()?;
        String::from_utf8(output.stdout)
            .ok()
            .and_then(|s| s.lines().next().map(str::to_string))
    }

    /// Create the pipes, spawn the engine and start feeding it.
    async fn wire(
        &self,
        request: &PipelineRequest,
        sources: Vec<ByteStream>,
        cover: Option<super::cover_art::CoverArt>,
        resources: &Arc<PipelineResources>,
    ) -> Result<Box<dyn tokio::io::AsyncRead + Send + Unpin>> {
        let pipe_dir = tempfile::Builder::new()
            .prefix("media-relay-")
            .tempdir()
            .map_err(|e| Error::process(format!("creating pipe directory: {e}")))?;
        let dir = pipe_dir.path().to_path_buf();
        resources.set_pipe_dir(pipe_dir);

        let mut fifo_paths = Vec::with_capacity(sources.len());
        for index in 0..sources.len() {
            let path = dir.join(format!("input_{index}"));
            process_utils::create_fifo(&path)
                .map_err(|e| Error::process(format!("creating pipe {}: {e}", path.display())))?;
            fifo_paths.push(path);
        }

        let mut layout = PipeLayout::new(fifo_paths.clone());
        let cover_format = match cover {
            Some(cover) => {
                let path = dir.join("cover");
                tokio::fs::write(&path, &cover.data)
                    .await
                    .map_err(|e| Error::io_path("writing cover art", &path, e))?;
                layout = layout.with_cover(path);
                Some(cover.format)
            }
            None => None,
        };

        let args = build_engine_args(request.kind, cover_format, &layout, &self.config);
        info!(
            download_id = %request.download_id,
            engine = %self.config.binary_path,
            ?args,
            "Starting engine"
        );

        let mut child = process_utils::tokio_command(&self.config.binary_path)
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::process(format!("failed to spawn {}: {e}", self.config.binary_path))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::process("engine stdout not captured"))?;
        let stderr = child.stderr.take();
        resources.set_child(child).await;

        if let Some(stderr) = stderr {
            let sink = resources.stderr_sink();
            let id = request.download_id.clone();
            resources.add_task(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(download_id = %id, "ffmpeg: {line}");
                    PipelineResources::push_stderr_line(&sink, line);
                }
            }));
        }

        for (source, path) in sources.into_iter().zip(fifo_paths) {
            let feeder = feed_pipe(
                source,
                path,
                self.config.pipe_open_timeout,
                resources.cancel_token(),
            );
            resources.add_feeder(tokio::spawn(feeder)).await;
        }

        Ok(Box::new(stdout))
    }
}

/// Copy one source stream into its named pipe.
///
/// Natural end of the source closes the write side so the engine sees EOF on
/// that input. Cancellation just stops.
async fn feed_pipe(
    mut source: ByteStream,
    path: PathBuf,
    open_timeout: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let copy = async {
        let mut sender = process_utils::open_fifo_writer(&path, open_timeout)
            .await
            .map_err(|e| Error::process(format!("engine did not open {}: {e}", path.display())))?;

        let mut fed = 0u64;
        while let Some(chunk) = source.next().await {
            let chunk = chunk.map_err(|e| Error::upstream(format!("source stream failed: {e}")))?;
            sender.write_all(&chunk).await.map_err(|e| pipe_write_error(&path, e))?;
            fed += chunk.len() as u64;
        }

        sender.flush().await.map_err(|e| pipe_write_error(&path, e))?;
        drop(sender);
        debug!(pipe = %path.display(), bytes = fed, "Source finished, input closed");
        Ok::<(), Error>(())
    };

    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        result = copy => result,
    }
}

fn pipe_write_error(path: &Path, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::BrokenPipe {
        Error::process(format!("engine closed {} early", path.display()))
    } else {
        Error::io_path("writing to pipe", path, e)
    }
}

#[async_trait]
impl PipelineFactory for FfmpegPipelineBuilder {
    fn validate(&self, resource_ref: &str) -> Result<()> {
        self.provider.validate(resource_ref)
    }

    async fn build(&self, request: &PipelineRequest) -> Result<Pipeline> {
        let descriptor = self.provider.resolve(&request.resource_ref).await?;
        let selection = select_formats(&descriptor.formats, request.kind, &request.quality)?;

        let cover = if request.kind == OutputKind::Audio && request.cover_art {
            fetch_cover_art(
                &self.client,
                &descriptor.thumbnails,
                self.config.cover_art_timeout,
            )
            .await
        } else {
            None
        };

        let mut sources = Vec::new();
        for format in selection.sources() {
            sources.push(
                self.provider
                    .open_stream(&request.resource_ref, format)
                    .await?,
            );
        }

        let resources = Arc::new(PipelineResources::new(
            request.download_id.clone(),
            self.config.kill_grace,
        ));
        let output = match self.wire(request, sources, cover, &resources).await {
            Ok(output) => output,
            Err(e) => {
                warn!(download_id = %request.download_id, error = %e, "Pipeline setup failed");
                resources.teardown().await;
                return Err(e);
            }
        };

        Ok(Pipeline {
            output,
            resources,
            estimated_size: selection.estimated_size(),
            title: descriptor.title,
        })
    }
}
