//! Media-info / byte-stream providers.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::{Error, Result};

/// A source byte stream.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// One format offered by a provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatInfo {
    /// Provider-specific format identifier.
    pub id: String,
    /// Where the bytes of this format live.
    pub url: String,
    pub quality_label: Option<String>,
    /// Container name such as `mp4` or `webm`.
    pub container: Option<String>,
    pub has_video: bool,
    pub has_audio: bool,
    pub height: Option<u32>,
    /// Bits per second.
    pub bitrate: Option<u64>,
    pub content_length: Option<u64>,
    /// Provider flags this as its high-quality audio.
    pub high_quality_audio: bool,
}

impl FormatInfo {
    pub fn is_video_only(&self) -> bool {
        self.has_video && !self.has_audio
    }

    pub fn is_audio_only(&self) -> bool {
        self.has_audio && !self.has_video
    }
}

/// Everything known about a resource before streaming starts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub resource_ref: String,
    pub title: Option<String>,
    pub formats: Vec<FormatInfo>,
    /// Thumbnail URLs, best first.
    pub thumbnails: Vec<String>,
}

#[async_trait]
pub trait MediaProvider: Send + Sync {
    /// Check the reference is well-formed. Must not do I/O.
    fn validate(&self, resource_ref: &str) -> Result<()>;

    async fn resolve(&self, resource_ref: &str) -> Result<ResourceDescriptor>;

    async fn open_stream(&self, resource_ref: &str, format: &FormatInfo) -> Result<ByteStream>;
}

/// Derive a readable title from a reference: last path segment without its
/// extension, or the host.
pub fn title_from_ref(resource_ref: &str) -> String {
    let Ok(url) = Url::parse(resource_ref.trim()) else {
        return "download".to_string();
    };
    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()))
        .map(|s| match s.rsplit_once('.') {
            Some((stem, _)) if !stem.is_empty() => stem.to_string(),
            _ => s.to_string(),
        });
    segment
        .or_else(|| url.host_str().map(str::to_string))
        .unwrap_or_else(|| "download".to_string())
}

/// Provider for direct http(s) media URLs.
///
/// The URL itself is the only format. Its length and type come from a HEAD
/// request when the server answers one, otherwise from the URL. Direct URLs
/// carry no thumbnails.
#[derive(Debug, Clone)]
pub struct HttpMediaProvider {
    client: reqwest::Client,
}

impl HttpMediaProvider {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// Parse a direct media reference: an absolute http(s) URL with a host.
pub fn validate_http_ref(resource_ref: &str) -> Result<Url> {
    let url = Url::parse(resource_ref.trim())
        .map_err(|e| Error::invalid_resource(format!("{resource_ref}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::invalid_resource(format!(
            "unsupported scheme '{}'",
            url.scheme()
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(Error::invalid_resource("missing host"));
    }
    Ok(url)
}

/// Map a MIME type (or failing that, a file extension) to a container.
fn container_of(content_type: Option<&str>, url: &Url) -> Option<String> {
    let from_mime = content_type
        .and_then(|ct| ct.split(';').next())
        .and_then(|mime| mime.trim().split_once('/'))
        .map(|(_, sub)| match sub {
            "mpeg" => "mp3",
            "x-matroska" => "mkv",
            "quicktime" => "mov",
            other => other,
        })
        .filter(|c| *c != "octet-stream")
        .map(str::to_string);

    from_mime.or_else(|| {
        url.path()
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| !ext.contains('/') && ext.len() <= 4)
    })
}

fn is_audio_container(container: &str) -> bool {
    matches!(
        container,
        "mp3" | "m4a" | "aac" | "ogg" | "oga" | "opus" | "flac" | "wav"
    )
}

#[async_trait]
impl MediaProvider for HttpMediaProvider {
    fn validate(&self, resource_ref: &str) -> Result<()> {
        validate_http_ref(resource_ref).map(|_| ())
    }

    async fn resolve(&self, resource_ref: &str) -> Result<ResourceDescriptor> {
        let url = validate_http_ref(resource_ref)?;

        // HEAD only adds metadata. Servers that refuse it (presigned URLs
        // are signed for GET only) still stream fine, and a dead URL fails
        // on the GET in `open_stream`.
        let (content_type, content_length) = match self
            .client
            .head(url.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(response) => {
                let headers = response.headers();
                let content_type = headers
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let content_length = headers
                    .get(CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok());
                (content_type, content_length)
            }
            Err(e) => {
                debug!(%url, error = %e, "HEAD failed, resolving from the URL alone");
                (None, None)
            }
        };

        let container = container_of(content_type.as_deref(), &url);
        let is_audio_only = match content_type.as_deref() {
            Some(ct) => ct.starts_with("audio/"),
            None => container.as_deref().is_some_and(is_audio_container),
        };
        debug!(%url, ?content_type, ?content_length, "Resolved direct media URL");

        Ok(ResourceDescriptor {
            resource_ref: resource_ref.to_string(),
            title: Some(title_from_ref(resource_ref)),
            formats: vec![FormatInfo {
                id: "direct".to_string(),
                url: url.to_string(),
                container,
                has_video: !is_audio_only,
                has_audio: true,
                content_length,
                ..Default::default()
            }],
            thumbnails: Vec::new(),
        })
    }

    async fn open_stream(&self, _resource_ref: &str, format: &FormatInfo) -> Result<ByteStream> {
        let response = self
            .client
            .get(&format.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::upstream(format!("opening {}: {e}", format.url)))?;

        Ok(response
            .bytes_stream()
            .map_err(std::io::Error::other)
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        let provider = HttpMediaProvider::new(reqwest::Client::new());
        assert!(provider.validate("https://cdn.example.com/a.mp4").is_ok());
        assert!(matches!(
            provider.validate("not a url"),
            Err(Error::InvalidResource(_))
        ));
        assert!(matches!(
            provider.validate("ftp://example.com/a.mp4"),
            Err(Error::InvalidResource(_))
        ));
        assert!(matches!(
            provider.validate("file:///etc/passwd"),
            Err(Error::InvalidResource(_))
        ));
    }

    #[test]
    fn test_title_from_ref() {
        assert_eq!(title_from_ref("https://x.com/media/song.webm"), "song");
        assert_eq!(title_from_ref("https://x.com/media/clip/"), "clip");
        assert_eq!(title_from_ref("https://x.com/"), "x.com");
        assert_eq!(title_from_ref("::"), "download");
    }

    #[test]
    fn test_container_of() {
        let url = Url::parse("https://x.com/a.webm").unwrap();
        assert_eq!(container_of(Some("video/mp4"), &url).as_deref(), Some("mp4"));
        assert_eq!(container_of(Some("audio/mpeg"), &url).as_deref(), Some("mp3"));
        assert_eq!(
            container_of(Some("application/octet-stream"), &url).as_deref(),
            Some("webm")
        );
        assert_eq!(container_of(None, &url).as_deref(), Some("webm"));
    }

    async fn serve(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_resolve_without_head_support() {
        use axum::http::{Method, StatusCode};
        use axum::response::IntoResponse;

        let body: &'static [u8] = b"ID3 fake mp3 payload";
        let handler = move |method: Method| async move {
            if method == Method::HEAD {
                StatusCode::FORBIDDEN.into_response()
            } else {
                body.into_response()
            }
        };
        let base = serve(axum::Router::new().route("/media.mp3", axum::routing::any(handler))).await;
        let provider = HttpMediaProvider::new(reqwest::Client::new());
        let resource = format!("{base}/media.mp3");

        let descriptor = provider.resolve(&resource).await.unwrap();
        let format = &descriptor.formats[0];
        assert_eq!(format.container.as_deref(), Some("mp3"));
        assert_eq!(format.content_length, None);
        assert!(format.is_audio_only());
        assert_eq!(descriptor.title.as_deref(), Some("media"));

        let mut stream = provider.open_stream(&resource, format).await.unwrap();
        let mut received = Vec::new();
        while let Some(chunk) = stream.next().await {
            received.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(received, body);
    }

    #[tokio::test]
    async fn test_resolve_uses_head_metadata() {
        let base = serve(axum::Router::new().route(
            "/clip",
            axum::routing::get(|| async {
                (
                    [
                        (axum::http::header::CONTENT_TYPE, "video/mp4"),
                        (axum::http::header::CONTENT_LENGTH, "2048"),
                    ],
                    vec![0u8; 2048],
                )
            }),
        ))
        .await;
        let provider = HttpMediaProvider::new(reqwest::Client::new());

        let descriptor = provider.resolve(&format!("{base}/clip")).await.unwrap();
        let format = &descriptor.formats[0];
        assert_eq!(format.container.as_deref(), Some("mp4"));
        assert_eq!(format.content_length, Some(2048));
        assert!(format.has_video);
    }

    #[tokio::test]
    async fn test_missing_media_fails_on_open() {
        let base = serve(axum::Router::new()).await;
        let provider = HttpMediaProvider::new(reqwest::Client::new());
        let resource = format!("{base}/gone.mp3");

        let descriptor = provider.resolve(&resource).await.unwrap();
        let err = provider
            .open_stream(&resource, &descriptor.formats[0])
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Upstream(_)));
    }
}
