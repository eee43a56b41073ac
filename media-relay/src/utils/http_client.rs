use std::time::Duration;

use tracing::warn;

/// Default user agent for upstream requests (helps with anti-hotlink checks).
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36";

/// Build the client used for long-lived media streams.
///
/// No overall request timeout is set, it would cut off streams that run for
/// minutes. Only connecting is bounded.
pub fn build_streaming_client(connect_timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .tcp_nodelay(true)
        .pool_max_idle_per_host(20)
        .user_agent(DEFAULT_USER_AGENT)
        .build()
        .unwrap_or_else(|error| {
            warn!(
                error = %error,
                "Failed to create streaming HTTP client; falling back to reqwest defaults"
            );
            reqwest::Client::new()
        })
}
