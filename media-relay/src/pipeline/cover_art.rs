//! Cover art fetching for audio output.
//!
//! Any failure here degrades to "no cover art"; it never fails a download.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use media_types::ImageFormat;
use tracing::{debug, warn};

/// Largest image accepted as cover art.
const MAX_COVER_BYTES: usize = 10 * 1024 * 1024;

/// A fetched and sniffed cover image.
#[derive(Debug, Clone)]
pub struct CoverArt {
    pub format: ImageFormat,
    pub data: Bytes,
}

/// Fetch the first thumbnail candidate within `timeout`.
pub async fn fetch_cover_art(
    client: &reqwest::Client,
    candidates: &[String],
    timeout: Duration,
) -> Option<CoverArt> {
    fetch_limited(client, candidates, timeout, MAX_COVER_BYTES).await
}

async fn fetch_limited(
    client: &reqwest::Client,
    candidates: &[String],
    timeout: Duration,
    max_bytes: usize,
) -> Option<CoverArt> {
    let url = candidates.first()?;

    let fetched = tokio::time::timeout(timeout, read_capped(client, url, max_bytes)).await;

    let data = match fetched {
        Ok(Ok(Some(data))) => data,
        Ok(Ok(None)) => {
            warn!(%url, max_bytes, "Cover art too large, continuing without it");
            return None;
        }
        Ok(Err(e)) => {
            warn!(%url, error = %e, "Cover art fetch failed, continuing without it");
            return None;
        }
        Err(_) => {
            warn!(%url, ?timeout, "Cover art fetch timed out, continuing without it");
            return None;
        }
    };

    match ImageFormat::sniff(&data) {
        Some(format) => {
            debug!(%url, %format, size = data.len(), "Fetched cover art");
            Some(CoverArt { format, data })
        }
        None => {
            warn!(%url, "Cover art is not a supported image, continuing without it");
            None
        }
    }
}

/// Read the body, giving up with `None` as soon as it exceeds `max_bytes`.
async fn read_capped(
    client: &reqwest::Client,
    url: &str,
    max_bytes: usize,
) -> reqwest::Result<Option<Bytes>> {
    let mut response = client.get(url).send().await?.error_for_status()?;
    if response
        .content_length()
        .is_some_and(|len| len > max_bytes as u64)
    {
        return Ok(None);
    }

    let mut data = BytesMut::new();
    while let Some(chunk) = response.chunk().await? {
        if data.len() + chunk.len() > max_bytes {
            return Ok(None);
        }
        data.extend_from_slice(&chunk);
    }
    Ok(Some(data.freeze()))
}
