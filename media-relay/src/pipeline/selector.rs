//! Format selection for a requested output kind and quality.

use media_types::OutputKind;
use tracing::debug;

use super::provider::FormatInfo;
use crate::download::record::QualitySelector;
use crate::{Error, Result};

/// Audio format ids known to be good picks when the provider does not flag
/// one (opus ~160k in webm, then AAC 128k in m4a).
const KNOWN_GOOD_AUDIO_IDS: &[&str] = &["251", "140"];

/// Container preferred for video, matching the output container.
const VIDEO_CONTAINER: &str = "mp4";

/// The format(s) feeding one pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatSelection {
    /// A single stream carrying everything needed.
    Single(FormatInfo),
    /// Separate video and audio streams, muxed by the engine.
    Split { video: FormatInfo, audio: FormatInfo },
}

impl FormatSelection {
    /// Source formats in engine input order.
    pub fn sources(&self) -> Vec<&FormatInfo> {
        match self {
            Self::Single(format) => vec![format],
            Self::Split { video, audio } => vec![video, audio],
        }
    }

    /// Sum of the selected content lengths. Unknown if any length is unknown.
    pub fn estimated_size(&self) -> Option<u64> {
        self.sources()
            .into_iter()
            .map(|f| f.content_length)
            .try_fold(0u64, |acc, len| Some(acc + len?))
    }
}

/// Pick source formats for `kind` at `quality`.
pub fn select_formats(
    formats: &[FormatInfo],
    kind: OutputKind,
    quality: &QualitySelector,
) -> Result<FormatSelection> {
    let selection = match kind {
        OutputKind::Audio => {
            let audio = select_audio(formats)
                .or_else(|| highest_by_bitrate(formats.iter().filter(|f| f.has_audio)))
                .ok_or_else(|| Error::upstream("no audio format available"))?;
            FormatSelection::Single(audio.clone())
        }
        OutputKind::Video => {
            let video = select_video(formats, quality)
                .ok_or_else(|| Error::upstream("no video format available"))?;
            if video.has_audio {
                FormatSelection::Single(video.clone())
            } else {
                let audio = select_audio(formats)
                    .ok_or_else(|| Error::upstream("no audio format to pair with video"))?;
                FormatSelection::Split {
                    video: video.clone(),
                    audio: audio.clone(),
                }
            }
        }
    };

    debug!(
        kind = %kind,
        quality = %quality,
        formats = ?selection.sources().iter().map(|f| f.id.as_str()).collect::<Vec<_>>(),
        "Selected source formats"
    );
    Ok(selection)
}

/// Video: exact quality label in the target container, else the highest video.
fn select_video<'a>(formats: &'a [FormatInfo], quality: &QualitySelector) -> Option<&'a FormatInfo> {
    let videos = || formats.iter().filter(|f| f.has_video);

    if !quality.is_highest() {
        let wanted = quality.as_str();
        let matched = videos().filter(|f| {
            f.quality_label
                .as_deref()
                .is_some_and(|label| label.to_ascii_lowercase().contains(wanted))
                && f.container.as_deref() == Some(VIDEO_CONTAINER)
        });
        if let Some(found) = best_video(matched) {
            return Some(found);
        }
        debug!(quality = wanted, "No exact quality match, falling back to highest video");
    }

    best_video(videos())
}

/// Highest resolution, then highest bitrate, then the target container.
fn best_video<'a>(candidates: impl Iterator<Item = &'a FormatInfo>) -> Option<&'a FormatInfo> {
    candidates.max_by_key(|f| {
        (
            f.height.unwrap_or(0),
            f.bitrate.unwrap_or(0),
            f.container.as_deref() == Some(VIDEO_CONTAINER),
        )
    })
}

/// Audio-only stream: flagged high quality, then a known-good id, then the
/// highest bitrate.
fn select_audio(formats: &[FormatInfo]) -> Option<&FormatInfo> {
    let audio_only = || formats.iter().filter(|f| f.is_audio_only());

    audio_only()
        .find(|f| f.high_quality_audio)
        .or_else(|| {
            KNOWN_GOOD_AUDIO_IDS
                .iter()
                .find_map(|id| audio_only().find(|f| f.id == *id))
        })
        .or_else(|| highest_by_bitrate(audio_only()))
}

fn highest_by_bitrate<'a>(candidates: impl Iterator<Item = &'a FormatInfo>) -> Option<&'a FormatInfo> {
    candidates.max_by_key(|f| f.bitrate.unwrap_or(0))
}
