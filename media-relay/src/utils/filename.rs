//! Display filename helpers.
//!
//! Titles come from remote metadata and may contain anything. The filename
//! handed to clients must be valid on Windows, Linux and macOS while keeping
//! non-ASCII text (CJK titles are common) intact.

use media_types::OutputKind;

/// Characters that are invalid in Windows filenames.
const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Windows reserved device names (case-insensitive).
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Longest stem kept, in characters. Leaves room for the extension.
const MAX_STEM_CHARS: usize = 180;

/// Replace characters that are invalid on any major platform.
///
/// Runs of invalid characters collapse into one underscore, leading/trailing
/// spaces and dots are trimmed, reserved device names get a `_` prefix and an
/// empty result becomes `"unnamed"`.
pub fn sanitize_filename(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_run = false;

    for c in input.chars() {
        if c.is_control() || INVALID_CHARS.contains(&c) {
            if !in_run {
                out.push('_');
            }
            in_run = true;
        } else {
            out.push(c);
            in_run = false;
        }
    }

    let trimmed = out.trim_matches(|c| c == ' ' || c == '.');
    if trimmed.is_empty() {
        return "unnamed".to_string();
    }

    let stem = trimmed.split('.').next().unwrap_or(trimmed);
    if RESERVED_NAMES
        .iter()
        .any(|reserved| stem.eq_ignore_ascii_case(reserved))
    {
        return format!("_{trimmed}");
    }

    trimmed.to_string()
}

/// Build the filename offered to the client for a download.
pub fn display_filename(title: &str, kind: OutputKind) -> String {
    let stem: String = sanitize_filename(title).chars().take(MAX_STEM_CHARS).collect();
    let stem = stem.trim_end_matches([' ', '.']);
    let stem = if stem.is_empty() { "unnamed" } else { stem };
    format!("{stem}.{}", kind.extension())
}

/// Build a `Content-Disposition: attachment` value.
///
/// Carries an ASCII-only `filename` for old clients and an RFC 5987
/// `filename*` with the full UTF-8 name.
pub fn content_disposition(filename: &str) -> String {
    let ascii: String = filename
        .chars()
        .map(|c| {
            if c.is_ascii() && !c.is_ascii_control() && c != '"' && c != '\\' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let mut encoded = String::with_capacity(filename.len() * 3);
    for byte in filename.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }

    format!("attachment; filename=\"{ascii}\"; filename*=UTF-8''{encoded}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_replaces_invalid_runs() {
        assert_eq!(sanitize_filename("a/b\\c"), "a_b_c");
        assert_eq!(sanitize_filename("what???"), "what_");
        assert_eq!(sanitize_filename("tab\there"), "tab_here");
    }

    #[test]
    fn test_sanitize_empty_and_trimmed() {
        assert_eq!(sanitize_filename(""), "unnamed");
        assert_eq!(sanitize_filename(" .. "), "unnamed");
        assert_eq!(sanitize_filename("...title..."), "title");
    }

    #[test]
    fn test_sanitize_reserved_names() {
        assert_eq!(sanitize_filename("con"), "_con");
        assert_eq!(sanitize_filename("LPT1.mp3"), "_LPT1.mp3");
        assert_eq!(sanitize_filename("console"), "console");
    }

    #[test]
    fn test_sanitize_keeps_unicode() {
        assert_eq!(sanitize_filename("观看一只青蛙?"), "观看一只青蛙_");
        assert_eq!(sanitize_filename("こんにちは"), "こんにちは");
    }

    #[test]
    fn test_display_filename() {
        assert_eq!(
            display_filename("My Song: Live", OutputKind::Audio),
            "My Song_ Live.mp3"
        );
        assert_eq!(display_filename("", OutputKind::Video), "unnamed.mp4");
    }

    #[test]
    fn test_display_filename_truncates_long_titles() {
        let title = "x".repeat(500);
        let name = display_filename(&title, OutputKind::Video);
        assert_eq!(name.chars().count(), MAX_STEM_CHARS + 4);
        assert!(name.ends_with(".mp4"));
    }

    #[test]
    fn test_content_disposition() {
        let value = content_disposition("café.mp3");
        assert_eq!(
            value,
            "attachment; filename=\"caf_.mp3\"; filename*=UTF-8''caf%C3%A9.mp3"
        );
    }
}
