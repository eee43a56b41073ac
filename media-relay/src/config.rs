//! Application configuration.
//!
//! Everything is read from the environment (after `.env` is loaded by the
//! binary). Invalid values are logged and the default is kept.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::api::server::ApiServerConfig;
use crate::download::reaper::ReaperConfig;
use crate::download::session::SessionConfig;
use crate::pipeline::EngineConfig;

/// Top-level configuration for the relay.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Directory holding records and temp artifacts, both named by id.
    pub work_dir: PathBuf,
    /// Directory for rolling log files.
    pub log_dir: PathBuf,
    /// HTTP server settings.
    pub server: ApiServerConfig,
    /// Per-session settings.
    pub session: SessionConfig,
    /// Transcoding engine settings.
    pub engine: EngineConfig,
    /// Retention / eviction settings.
    pub reaper: ReaperConfig,
    /// Size of the recent-downloads view.
    pub recent_limit: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("./data/downloads"),
            log_dir: PathBuf::from("./logs"),
            server: ApiServerConfig::default(),
            session: SessionConfig::default(),
            engine: EngineConfig::default(),
            reaper: ReaperConfig::default(),
            recent_limit: 50,
        }
    }
}

impl AppConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Supported env vars:
    /// - `API_BIND_ADDRESS`, `API_PORT`, `API_ENABLE_CORS`
    /// - `RELAY_WORK_DIR`, `RELAY_LOG_DIR`
    /// - `FFMPEG_PATH`
    /// - `RELAY_RETENTION_HOURS`, `RELAY_SWEEP_INTERVAL_SECS`
    /// - `RELAY_PROGRESS_INTERVAL_MS`, `RELAY_PROGRESS_BYTES`
    /// - `RELAY_KILL_GRACE_MS`, `RELAY_COVER_ART_TIMEOUT_MS`, `RELAY_PIPE_OPEN_TIMEOUT_SECS`
    /// - `RELAY_AUDIO_BITRATE_KBPS`, `RELAY_COVER_ART_MAX_PX`
    /// - `RELAY_RECENT_LIMIT`
    pub fn from_env_or_default() -> Self {
        let mut config = Self::default();

        if let Some(address) = env_string("API_BIND_ADDRESS") {
            config.server.bind_address = address;
        }
        if let Some(port) = env_parse::<u16>("API_PORT") {
            config.server.port = port;
        }
        if let Some(cors) = env_parse::<bool>("API_ENABLE_CORS") {
            config.server.enable_cors = cors;
        }
        if let Some(dir) = env_string("RELAY_WORK_DIR") {
            config.work_dir = PathBuf::from(dir);
        }
        if let Some(dir) = env_string("RELAY_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        if let Some(path) = env_string("FFMPEG_PATH") {
            config.engine.binary_path = path;
        }

        if let Some(hours) = env_parse::<u64>("RELAY_RETENTION_HOURS") {
            config.reaper.retention = Duration::from_secs(hours * 60 * 60);
        }
        if let Some(secs) = env_parse::<u64>("RELAY_SWEEP_INTERVAL_SECS") {
            config.reaper.sweep_interval = Duration::from_secs(secs.max(1));
        }

        if let Some(ms) = env_parse::<u64>("RELAY_PROGRESS_INTERVAL_MS") {
            config.session.persist_interval = Duration::from_millis(ms);
        }
        if let Some(bytes) = env_parse::<u64>("RELAY_PROGRESS_BYTES") {
            config.session.persist_bytes = bytes;
        }
        if let Some(ms) = env_parse::<u64>("RELAY_KILL_GRACE_MS") {
            config.engine.kill_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("RELAY_COVER_ART_TIMEOUT_MS") {
            config.engine.cover_art_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = env_parse::<u64>("RELAY_PIPE_OPEN_TIMEOUT_SECS") {
            config.engine.pipe_open_timeout = Duration::from_secs(secs);
        }
        if let Some(kbps) = env_parse::<u32>("RELAY_AUDIO_BITRATE_KBPS") {
            config.engine.audio_bitrate_kbps = kbps;
        }
        if let Some(px) = env_parse::<u32>("RELAY_COVER_ART_MAX_PX") {
            config.engine.cover_art_max_px = px;
        }
        if let Some(limit) = env_parse::<usize>("RELAY_RECENT_LIMIT") {
            config.recent_limit = limit;
        }

        config
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring invalid configuration value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.reaper.retention, Duration::from_secs(24 * 60 * 60));
        assert_eq!(config.engine.kill_grace, Duration::from_secs(1));
        assert_eq!(config.engine.binary_path, "ffmpeg");
        assert_eq!(config.recent_limit, 50);
    }

    #[test]
    fn test_env_parse_rejects_garbage() {
        // SAFETY: test-only env mutation on a key no other test reads.
        unsafe { std::env::set_var("RELAY_TEST_GARBAGE_NUMBER", "twelve") };
        assert_eq!(env_parse::<u64>("RELAY_TEST_GARBAGE_NUMBER"), None);
        unsafe { std::env::set_var("RELAY_TEST_GARBAGE_NUMBER", " 12 ") };
        assert_eq!(env_parse::<u64>("RELAY_TEST_GARBAGE_NUMBER"), Some(12));
        unsafe { std::env::remove_var("RELAY_TEST_GARBAGE_NUMBER") };
    }
}
