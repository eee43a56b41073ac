//! HTTP server: listener, middleware stack and graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{Span, info, info_span};

use crate::api::routes;
use crate::download::DownloadService;
use crate::error::{Error, Result};
use crate::logging::LoggingConfig;

/// Where and how the HTTP server listens.
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Allow any origin, mainly for browser players on another host.
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 12555,
            enable_cors: true,
        }
    }
}

impl ApiServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let raw = format!("{}:{}", self.bind_address, self.port);
        raw.parse()
            .map_err(|e| Error::config(format!("Invalid listen address {raw}: {e}")))
    }
}

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub start_time: Instant,
    pub downloads: Arc<DownloadService>,
    /// Present when the binary owns the global subscriber.
    pub logging_config: Option<Arc<LoggingConfig>>,
}

impl AppState {
    pub fn new(downloads: Arc<DownloadService>) -> Self {
        Self {
            start_time: Instant::now(),
            downloads,
            logging_config: None,
        }
    }

    pub fn with_logging_config(mut self, config: Arc<LoggingConfig>) -> Self {
        self.logging_config = Some(config);
        self
    }
}

pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
    shutdown: CancellationToken,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState, shutdown: CancellationToken) -> Self {
        Self {
            config,
            state,
            shutdown,
        }
    }

    /// Routes wrapped in request tracing and, when enabled, permissive CORS.
    ///
    /// The download headers are exposed so cross-origin clients can read the
    /// id needed to pause or resume.
    pub fn build_router(&self) -> Router {
        let router = routes::create_router(self.state.clone());
        let router = if self.config.enable_cors {
            router.layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any)
                    .expose_headers(Any),
            )
        } else {
            router
        };

        router.layer(
            TraceLayer::new_for_http()
                .make_span_with(request_span)
                .on_response(|res: &Response<Body>, latency: Duration, span: &Span| {
                    if !span.is_disabled() {
                        info!(
                            parent: span,
                            status = res.status().as_u16(),
                            latency_ms = latency.as_millis() as u64,
                            "Response headers sent"
                        );
                    }
                }),
        )
    }

    /// Serve until the shutdown token fires and open connections drain.
    pub async fn run(&self) -> Result<()> {
        let addr = self.config.socket_addr()?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::config(format!("Failed to bind {addr}: {e}")))?;
        info!(%addr, "API server listening");

        let shutdown = self.shutdown.clone();
        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("API server draining connections");
            })
            .await
            .map_err(|e| Error::Other(format!("Server error: {e}")))
    }
}

/// Health checks are polled constantly, so they get no span.
fn request_span(req: &Request<Body>) -> Span {
    if req.uri().path().starts_with("/api/health") {
        return Span::none();
    }
    info_span!("request", method = %req.method(), uri = %req.uri())
}
