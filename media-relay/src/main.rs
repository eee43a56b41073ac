use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use media_relay::api::{ApiServer, AppState};
use media_relay::config::AppConfig;
use media_relay::download::{
    DownloadRegistry, DownloadService, JsonMetadataStore, MetadataStore, Reaper, SessionDeps,
    TempArtifactStore,
};
use media_relay::logging;
use media_relay::pipeline::{FfmpegPipelineBuilder, HttpMediaProvider, PipelineFactory};
use media_relay::utils::http_client::build_streaming_client;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env_or_default();

    let (logging_config, _log_guard) =
        logging::init_logging(&config.log_dir).context("initializing logging")?;

    let shutdown = CancellationToken::new();
    logging_config.start_retention_cleanup(shutdown.child_token());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        work_dir = %config.work_dir.display(),
        "media-relay starting"
    );

    let metadata: Arc<dyn MetadataStore> = Arc::new(
        JsonMetadataStore::new(&config.work_dir)
            .await
            .context("opening metadata store")?,
    );
    let artifacts = TempArtifactStore::new(&config.work_dir)
        .await
        .context("opening artifact store")?;

    let client = build_streaming_client(config.engine.connect_timeout);
    let builder = FfmpegPipelineBuilder::new(
        Arc::new(HttpMediaProvider::new(client.clone())),
        client,
        config.engine.clone(),
    );
    match builder.engine_version().await {
        Some(version) => info!(%version, "Transcoding engine found"),
        None => warn!(
            binary = %config.engine.binary_path,
            "Transcoding engine not runnable, downloads will fail until it is installed"
        ),
    }
    let factory: Arc<dyn PipelineFactory> = Arc::new(builder);

    let registry = Arc::new(DownloadRegistry::new());
    let reaper = Reaper::new(
        config.reaper.clone(),
        metadata.clone(),
        artifacts.clone(),
        registry.clone(),
    );
    let reaper_task = reaper.start();

    let deps = SessionDeps {
        metadata,
        artifacts,
        factory,
        config: config.session.clone(),
    };
    let downloads = Arc::new(DownloadService::new(
        deps,
        registry,
        reaper.clone(),
        config.recent_limit,
    ));

    let state = AppState::new(downloads.clone()).with_logging_config(logging_config);
    let server = ApiServer::new(config.server.clone(), state, shutdown.child_token());

    let signal = shutdown.clone();
    let live = downloads.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
        }
        signal.cancel();
        // Open response bodies keep graceful shutdown waiting until paused.
        live.shutdown().await;
    });

    let result = server.run().await;

    shutdown.cancel();
    downloads.shutdown().await;
    if let Err(e) = reaper_task.await {
        warn!(error = %e, "Reaper task ended abnormally");
    }
    info!("media-relay stopped");

    result.context("running API server")
}
