//! Shared media domain types.
//!
//! - [`OutputKind`]: what a download produces (an MP3 or a fragmented MP4)
//! - [`ImageFormat`]: still-image formats accepted as cover art, detected from
//!   magic bytes rather than from any declared label

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The kind of output a download produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// Audio only, encoded to constant-bitrate MP3.
    Audio,
    /// Video with audio, muxed into fragmented MP4.
    Video,
}

impl OutputKind {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }

    /// Container the engine writes for this kind.
    pub fn target_container(&self) -> &'static str {
        match self {
            Self::Audio => "mp3",
            Self::Video => "mp4",
        }
    }

    /// MIME type served to clients.
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Audio => "audio/mpeg",
            Self::Video => "video/mp4",
        }
    }

    /// File extension used for display filenames.
    #[inline]
    pub fn extension(&self) -> &'static str {
        self.target_container()
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown output kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseOutputKindError(String);

impl fmt::Display for ParseOutputKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown output kind '{}', expected audio or video", self.0)
    }
}

impl std::error::Error for ParseOutputKindError {}

impl FromStr for OutputKind {
    type Err = ParseOutputKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            _ => Err(ParseOutputKindError(s.to_string())),
        }
    }
}

/// Still-image formats usable as an attached picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    Webp,
}

impl ImageFormat {
    const PNG_MAGIC: &'static [u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    const JPEG_MAGIC: &'static [u8] = &[0xFF, 0xD8, 0xFF];

    /// Detect the image format from the leading bytes of the payload.
    ///
    /// Returns `None` for anything that is not one of the supported formats.
    pub fn sniff(data: &[u8]) -> Option<Self> {
        if data.starts_with(Self::PNG_MAGIC) {
            return Some(Self::Png);
        }
        if data.starts_with(Self::JPEG_MAGIC) {
            return Some(Self::Jpeg);
        }
        if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
            return Some(Self::Gif);
        }
        // RIFF <u32 size> WEBP
        if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
            return Some(Self::Webp);
        }
        None
    }

    /// Name of the ffmpeg demuxer that reads this format from a pipe.
    pub fn pipe_format(&self) -> &'static str {
        match self {
            Self::Png => "png_pipe",
            Self::Jpeg => "jpeg_pipe",
            Self::Gif => "gif_pipe",
            Self::Webp => "webp_pipe",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Gif => "image/gif",
            Self::Webp => "image/webp",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime_type())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_kind_parse() {
        assert_eq!("audio".parse::<OutputKind>(), Ok(OutputKind::Audio));
        assert_eq!("VIDEO".parse::<OutputKind>(), Ok(OutputKind::Video));
        assert!("gif".parse::<OutputKind>().is_err());
    }

    #[test]
    fn test_output_kind_serde() {
        let json = serde_json::to_string(&OutputKind::Audio).unwrap();
        assert_eq!(json, "\"audio\"");
        let kind: OutputKind = serde_json::from_str("\"video\"").unwrap();
        assert_eq!(kind, OutputKind::Video);
    }

    #[test]
    fn test_output_kind_containers() {
        assert_eq!(OutputKind::Audio.target_container(), "mp3");
        assert_eq!(OutputKind::Video.content_type(), "video/mp4");
    }

    #[test]
    fn test_sniff_png() {
        let data = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 13];
        assert_eq!(ImageFormat::sniff(&data), Some(ImageFormat::Png));
    }

    #[test]
    fn test_sniff_jpeg() {
        assert_eq!(
            ImageFormat::sniff(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00]),
            Some(ImageFormat::Jpeg)
        );
    }

    #[test]
    fn test_sniff_gif() {
        assert_eq!(ImageFormat::sniff(b"GIF89a\x01\x00"), Some(ImageFormat::Gif));
        assert_eq!(ImageFormat::sniff(b"GIF87a"), Some(ImageFormat::Gif));
    }

    #[test]
    fn test_sniff_webp() {
        assert_eq!(
            ImageFormat::sniff(b"RIFF\x24\x00\x00\x00WEBPVP8 "),
            Some(ImageFormat::Webp)
        );
        // RIFF container that is not WEBP (e.g. WAV).
        assert_eq!(ImageFormat::sniff(b"RIFF\x24\x00\x00\x00WAVEfmt "), None);
    }

    #[test]
    fn test_sniff_ignores_declared_labels() {
        // An HTML error page served with an image content type.
        assert_eq!(ImageFormat::sniff(b"<!DOCTYPE html>"), None);
        assert_eq!(ImageFormat::sniff(&[]), None);
    }

    #[test]
    fn test_pipe_format() {
        assert_eq!(ImageFormat::Png.pipe_format(), "png_pipe");
        assert_eq!(ImageFormat::Jpeg.pipe_format(), "jpeg_pipe");
        assert_eq!(ImageFormat::Gif.pipe_format(), "gif_pipe");
        assert_eq!(ImageFormat::Webp.pipe_format(), "webp_pipe");
    }
}
