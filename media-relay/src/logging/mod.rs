//! Logging setup: reloadable filter, console + daily file output, and
//! retention of rotated log files.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
};

use crate::utils::fs;
use crate::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "media_relay=info,process_utils=info,tower_http=info";

/// Prefix of the rolling log files (`media-relay.log.YYYY-MM-DD`).
const LOG_FILE_PREFIX: &str = "media-relay.log";

/// Log retention period in days.
const LOG_RETENTION_DAYS: i64 = 7;

/// Timestamps in the server's local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

pub type FilterHandle = Handle<EnvFilter, tracing_subscriber::Registry>;

/// Handle to the live logging setup.
pub struct LoggingConfig {
    handle: Option<FilterHandle>,
    log_dir: PathBuf,
}

impl LoggingConfig {
    /// A config with no subscriber attached. Filter changes are validated but
    /// go nowhere. Used where logging is owned by someone else (tests).
    pub fn detached(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            handle: None,
            log_dir: log_dir.into(),
        }
    }

    /// Current filter directive.
    pub fn get_filter(&self) -> String {
        self.handle
            .as_ref()
            .and_then(|h| h.with_current(|filter| filter.to_string()).ok())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string())
    }

    /// Replace the filter directive (e.g. `media_relay=debug`).
    pub fn set_filter(&self, directive: &str) -> Result<()> {
        let new_filter = EnvFilter::try_new(directive)
            .map_err(|e| Error::Other(format!("Invalid filter directive: {e}")))?;

        if let Some(handle) = &self.handle {
            handle
                .reload(new_filter)
                .map_err(|e| Error::Other(format!("Failed to reload filter: {e}")))?;
        }

        info!(directive = %directive, "Log filter updated");
        Ok(())
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Spawn the daily cleanup of rotated log files.
    pub fn start_retention_cleanup(self: &Arc<Self>, cancel_token: CancellationToken) {
        let log_dir = self.log_dir.clone();

        tokio::spawn(async move {
            let cleanup_interval = Duration::from_secs(24 * 60 * 60);

            loop {
                if let Err(e) = cleanup_old_logs(&log_dir, LOG_RETENTION_DAYS).await {
                    warn!(error = %e, "Failed to cleanup old logs");
                }

                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Log retention cleanup task shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(cleanup_interval) => {}
                }
            }
        });
    }
}

/// Delete rotated log files whose date is older than `retention_days`.
async fn cleanup_old_logs(log_dir: &Path, retention_days: i64) -> std::io::Result<usize> {
    let cutoff = Utc::now().date_naive() - chrono::Duration::days(retention_days);

    let mut entries = tokio::fs::read_dir(log_dir).await?;
    let mut deleted = 0;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(date) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(LOG_FILE_PREFIX))
            .and_then(|n| n.strip_prefix('.'))
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        else {
            continue;
        };

        if date < cutoff {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    deleted += 1;
                    debug!(path = %path.display(), "Deleted old log file");
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete old log file"),
            }
        }
    }

    if deleted > 0 {
        info!(count = deleted, "Cleaned up old log files");
    }

    Ok(deleted)
}

/// Initialize the global subscriber.
///
/// Keep the returned guard alive for the lifetime of the process, dropping it
/// stops the file writer.
pub fn init_logging(log_dir: &Path) -> Result<(Arc<LoggingConfig>, WorkerGuard)> {
    fs::ensure_dir_all_sync_with_op("creating log directory", log_dir)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let initial_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (filter_layer, filter_handle) = reload::Layer::new(initial_filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_ansi(true).with_timer(LocalTimer))
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_timer(LocalTimer),
        )
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to set global default subscriber: {e}")))?;

    let config = Arc::new(LoggingConfig {
        handle: Some(filter_handle),
        log_dir: log_dir.to_path_buf(),
    });

    Ok((config, guard))
}

/// A log target that can be named in a filter directive.
#[derive(Debug, Clone, Serialize)]
pub struct LogModule {
    pub name: &'static str,
    pub description: &'static str,
}

/// Targets worth tuning, for the logging API.
pub fn available_modules() -> Vec<LogModule> {
    [
        ("media_relay", "Relay service"),
        ("media_relay::download", "Sessions, stores and reaper"),
        ("media_relay::pipeline", "Source streams and ffmpeg wiring"),
        ("process_utils", "Child process handling"),
        ("reqwest", "Upstream HTTP requests"),
        ("tower_http", "HTTP middleware"),
    ]
    .into_iter()
    .map(|(name, description)| LogModule { name, description })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter() {
        assert!(DEFAULT_LOG_FILTER.contains("media_relay=info"));
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[test]
    fn test_detached_set_filter_validates() {
        let config = LoggingConfig::detached("./logs");
        assert!(config.set_filter("media_relay=debug").is_ok());
        assert!(config.set_filter("media_relay=[").is_err());
        assert_eq!(config.get_filter(), DEFAULT_LOG_FILTER);
    }

    #[tokio::test]
    async fn test_cleanup_old_logs() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("media-relay.log.2001-01-01");
        let today = dir.path().join(format!(
            "media-relay.log.{}",
            Utc::now().date_naive().format("%Y-%m-%d")
        ));
        let other = dir.path().join("notes.txt");
        for path in [&old, &today, &other] {
            tokio::fs::write(path, b"x").await.unwrap();
        }

        let deleted = cleanup_old_logs(dir.path(), LOG_RETENTION_DAYS).await.unwrap();

        assert_eq!(deleted, 1);
        assert!(!old.exists());
        assert!(today.exists());
        assert!(other.exists());
    }

    #[test]
    fn test_available_modules() {
        assert!(available_modules().iter().any(|m| m.name == "media_relay"));
    }
}
