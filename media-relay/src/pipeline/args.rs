//! ffmpeg argument construction.

use std::path::PathBuf;

use media_types::{ImageFormat, OutputKind};

use super::EngineConfig;

/// Where the engine reads its inputs from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeLayout {
    /// One named pipe per source stream, in selection order.
    pub sources: Vec<PathBuf>,
    /// Cover image file, if any.
    pub cover: Option<PathBuf>,
}

impl PipeLayout {
    pub fn new(sources: Vec<PathBuf>) -> Self {
        Self {
            sources,
            cover: None,
        }
    }

    pub fn with_cover(mut self, cover: PathBuf) -> Self {
        self.cover = Some(cover);
        self
    }
}

/// Build the full ffmpeg argument vector.
///
/// Video remuxes the video stream untouched and re-encodes audio to AAC in
/// fragmented MP4. Audio re-encodes to constant-bitrate MP3, optionally with
/// `cover` embedded as an attached picture. Output always goes to stdout.
pub fn build_engine_args(
    kind: OutputKind,
    cover: Option<ImageFormat>,
    layout: &PipeLayout,
    config: &EngineConfig,
) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-nostdin", "-loglevel", "error"]
        .into_iter()
        .map(String::from)
        .collect();

    for source in &layout.sources {
        args.push("-i".to_string());
        args.push(source.to_string_lossy().into_owned());
    }

    let cover = match (kind, cover, &layout.cover) {
        (OutputKind::Audio, Some(format), Some(path)) => Some((format, path)),
        _ => None,
    };
    if let Some((format, path)) = cover {
        args.extend([
            "-f".to_string(),
            format.pipe_format().to_string(),
            "-i".to_string(),
            path.to_string_lossy().into_owned(),
        ]);
    }

    let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

    match kind {
        OutputKind::Video => {
            let audio_input = if layout.sources.len() > 1 { "1:a:0" } else { "0:a:0" };
            push(&["-map", "0:v:0", "-map", audio_input]);
            push(&["-c:v", "copy", "-c:a", "aac"]);
            push(&[
                "-movflags",
                "frag_keyframe+empty_moov+default_base_moof",
                "-f",
                "mp4",
            ]);
        }
        OutputKind::Audio => {
            push(&["-map", "0:a:0"]);
            if cover.is_some() {
                let cover_input = format!("{}:v:0", layout.sources.len());
                let max = config.cover_art_max_px;
                let scale = format!(
                    "scale='min({max},iw)':'min({max},ih)':force_original_aspect_ratio=decrease"
                );
                push(&["-map", cover_input.as_str(), "-c:v", "mjpeg", "-vf", scale.as_str()]);
                push(&["-disposition:v", "attached_pic", "-id3v2_version", "3"]);
            }
            let bitrate = format!("{}k", config.audio_bitrate_kbps);
            push(&["-c:a", "libmp3lame", "-b:a", bitrate.as_str(), "-f", "mp3"]);
        }
    }

    push(&["-fflags", "+bitexact", "-flags", "+bitexact", "pipe:1"]);
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(args: &[String]) -> String {
        args.join(" ")
    }

    #[test]
    fn test_video_split_args() {
        let layout = PipeLayout::new(vec!["/tmp/p/video".into(), "/tmp/p/audio".into()]);
        let args = build_engine_args(OutputKind::Video, None, &layout, &EngineConfig::default());
        let line = joined(&args);

        assert!(line.contains("-i /tmp/p/video -i /tmp/p/audio"));
        assert!(line.contains("-map 0:v:0 -map 1:a:0"));
        assert!(line.contains("-c:v copy -c:a aac"));
        assert!(line.contains("frag_keyframe+empty_moov+default_base_moof -f mp4"));
        assert!(line.ends_with("pipe:1"));
        assert!(!line.contains("libmp3lame"));
    }

    #[test]
    fn test_video_single_input_takes_audio_from_it() {
        let layout = PipeLayout::new(vec!["/tmp/p/av".into()]);
        let args = build_engine_args(OutputKind::Video, None, &layout, &EngineConfig::default());
        assert!(joined(&args).contains("-map 0:v:0 -map 0:a:0"));
    }

    #[test]
    fn test_audio_args_without_cover() {
        let layout = PipeLayout::new(vec!["/tmp/p/audio".into()]);
        let config = EngineConfig {
            audio_bitrate_kbps: 256,
            ..Default::default()
        };
        let line = joined(&build_engine_args(OutputKind::Audio, None, &layout, &config));

        assert!(line.contains("-map 0:a:0 -c:a libmp3lame -b:a 256k -f mp3"));
        assert!(!line.contains("attached_pic"));
        assert!(line.contains("+bitexact"));
    }

    #[test]
    fn test_audio_args_with_cover() {
        let layout =
            PipeLayout::new(vec!["/tmp/p/audio".into()]).with_cover("/tmp/p/cover.webp".into());
        let line = joined(&build_engine_args(
            OutputKind::Audio,
            Some(ImageFormat::Webp),
            &layout,
            &EngineConfig::default(),
        ));

        assert!(line.contains("-f webp_pipe -i /tmp/p/cover.webp"));
        assert!(line.contains("-map 1:v:0 -c:v mjpeg"));
        assert!(line.contains("min(500,iw)"));
        assert!(line.contains("-disposition:v attached_pic -id3v2_version 3"));
    }

    #[test]
    fn test_cover_ignored_for_video_or_missing_path() {
        let layout = PipeLayout::new(vec!["/tmp/p/v".into()]).with_cover("/tmp/p/c.png".into());
        let line = joined(&build_engine_args(
            OutputKind::Video,
            Some(ImageFormat::Png),
            &layout,
            &EngineConfig::default(),
        ));
        assert!(!line.contains("png_pipe"));

        let layout = PipeLayout::new(vec!["/tmp/p/a".into()]);
        let line = joined(&build_engine_args(
            OutputKind::Audio,
            Some(ImageFormat::Png),
            &layout,
            &EngineConfig::default(),
        ));
        assert!(!line.contains("attached_pic"));
    }

    #[test]
    fn test_args_are_deterministic() {
        let layout = PipeLayout::new(vec!["/a".into()]);
        let config = EngineConfig::default();
        assert_eq!(
            build_engine_args(OutputKind::Audio, None, &layout, &config),
            build_engine_args(OutputKind::Audio, None, &layout, &config)
        );
    }
}
