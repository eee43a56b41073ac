//! Persisted download record and the id derivation.

use std::fmt;

use chrono::{DateTime, Utc};
use media_types::OutputKind;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Persisted status of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DownloadStatus {
    InProgress,
    Paused,
    Completed,
    Failed,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in-progress",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quality requested by the client.
///
/// `highest` picks the provider's best stream; anything else is matched
/// against format quality labels (e.g. `720p`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QualitySelector(String);

impl QualitySelector {
    pub const HIGHEST: &'static str = "highest";

    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            Self::highest()
        } else {
            Self(trimmed.to_ascii_lowercase())
        }
    }

    pub fn highest() -> Self {
        Self(Self::HIGHEST.to_string())
    }

    pub fn is_highest(&self) -> bool {
        self.0 == Self::HIGHEST
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for QualitySelector {
    fn default() -> Self {
        Self::highest()
    }
}

impl fmt::Display for QualitySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the download id for a request tuple.
///
/// Identical requests map to the same id, so a repeated request resumes the
/// existing download instead of creating a duplicate.
pub fn download_id(resource_ref: &str, kind: OutputKind, quality: &QualitySelector) -> String {
    let mut hasher = Sha256::new();
    hasher.update(resource_ref.trim().as_bytes());
    hasher.update(b"\n");
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(quality.as_str().as_bytes());
    hex::encode(hasher.finalize())
}

/// Whether `id` has the shape produced by [`download_id`].
///
/// Ids become file names, so anything else is rejected before touching disk.
pub fn is_valid_id(id: &str) -> bool {
    id.len() == 64 && id.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// The durable record of one download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRecord {
    pub id: String,
    pub resource_ref: String,
    pub output_kind: OutputKind,
    pub quality_selector: QualitySelector,
    pub display_filename: String,
    pub content_type: String,
    pub status: DownloadStatus,
    /// Final output size. Set once at completion and never changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_size_bytes: Option<u64>,
    /// Source size estimate (sum of selected stream lengths), if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_size_bytes: Option<u64>,
    /// Bytes of engine output durably written to the temp artifact.
    pub current_size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Message of the last failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DownloadRecord {
    /// Create a fresh in-progress record.
    pub fn new(
        resource_ref: impl Into<String>,
        output_kind: OutputKind,
        quality_selector: QualitySelector,
        display_filename: impl Into<String>,
    ) -> Self {
        let resource_ref = resource_ref.into();
        let now = Utc::now();
        Self {
            id: download_id(&resource_ref, output_kind, &quality_selector),
            resource_ref,
            output_kind,
            quality_selector,
            display_filename: display_filename.into(),
            content_type: output_kind.content_type().to_string(),
            status: DownloadStatus::InProgress,
            total_size_bytes: None,
            estimated_size_bytes: None,
            current_size_bytes: 0,
            created_at: now,
            last_modified_at: now,
            completed_at: None,
            error: None,
        }
    }

    /// Record newly flushed progress. Never moves the counter backwards.
    pub fn advance_to(&mut self, size: u64) {
        if size > self.current_size_bytes {
            self.current_size_bytes = size;
        }
        self.touch();
    }

    /// Move the progress counter to the size actually kept on disk.
    ///
    /// Only used while preparing a resume, before the record goes back to
    /// in-progress.
    pub fn reset_progress_to(&mut self, size: u64) {
        self.current_size_bytes = size;
        self.total_size_bytes = None;
        self.completed_at = None;
        self.touch();
    }

    /// Set the final size once. Returns false if it was already known.
    pub fn set_total_size(&mut self, size: u64) -> bool {
        if self.total_size_bytes.is_some() {
            return false;
        }
        self.total_size_bytes = Some(size);
        true
    }

    /// Record the source size estimate once.
    pub fn set_estimated_size(&mut self, estimate: Option<u64>) {
        if self.estimated_size_bytes.is_none() {
            self.estimated_size_bytes = estimate;
        }
    }

    /// Reset progress for a fresh start from byte zero.
    pub fn restart(&mut self) {
        self.status = DownloadStatus::InProgress;
        self.current_size_bytes = 0;
        self.total_size_bytes = None;
        self.completed_at = None;
        self.error = None;
        self.touch();
    }

    pub fn set_status(&mut self, status: DownloadStatus) {
        self.status = status;
        if status == DownloadStatus::Completed {
            self.completed_at = Some(Utc::now());
        }
        self.touch();
    }

    /// Progress ratio in `[0, 1]` against the estimate, if one is known.
    pub fn progress_ratio(&self) -> Option<f64> {
        if self.status == DownloadStatus::Completed {
            return Some(1.0);
        }
        self.estimated_size_bytes
            .filter(|total| *total > 0)
            .map(|total| (self.current_size_bytes as f64 / total as f64).min(1.0))
    }

    /// Age of the record relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }

    fn touch(&mut self) {
        self.last_modified_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> DownloadRecord {
        DownloadRecord::new(
            "https://media.example.com/a.webm",
            OutputKind::Audio,
            QualitySelector::highest(),
            "a.mp3",
        )
    }

    #[test]
    fn test_download_id_is_stable_and_distinct() {
        let q = QualitySelector::highest();
        let a = download_id("https://x/1", OutputKind::Audio, &q);
        let b = download_id("https://x/1", OutputKind::Audio, &q);
        let c = download_id("https://x/1", OutputKind::Video, &q);
        let d = download_id("https://x/1", OutputKind::Audio, &QualitySelector::new("720p"));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert!(is_valid_id(&a));
    }

    #[test]
    fn test_is_valid_id_rejects_paths() {
        assert!(!is_valid_id("../../etc/passwd"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id(&"A".repeat(64)));
    }

    #[test]
    fn test_quality_selector_normalizes() {
        assert!(QualitySelector::new("").is_highest());
        assert!(QualitySelector::new(" Highest ").is_highest());
        assert_eq!(QualitySelector::new("720P").as_str(), "720p");
    }

    #[test]
    fn test_advance_is_monotonic() {
        let mut r = record();
        r.advance_to(100);
        r.advance_to(50);
        assert_eq!(r.current_size_bytes, 100);
    }

    #[test]
    fn test_total_size_is_immutable() {
        let mut r = record();
        assert!(r.set_total_size(10));
        assert!(!r.set_total_size(20));
        assert_eq!(r.total_size_bytes, Some(10));
    }

    #[test]
    fn test_status_serialization() {
        let mut r = record();
        r.set_status(DownloadStatus::InProgress);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["status"], "in-progress");
        assert_eq!(json["outputKind"], "audio");
        assert_eq!(json["qualitySelector"], "highest");
        assert!(json.get("totalSizeBytes").is_none());

        let back: DownloadRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn test_completed_sets_timestamp() {
        let mut r = record();
        r.set_status(DownloadStatus::Completed);
        assert!(r.completed_at.is_some());
        assert_eq!(r.progress_ratio(), Some(1.0));
    }

    #[test]
    fn test_progress_ratio_unknown_estimate() {
        let mut r = record();
        r.advance_to(10);
        assert_eq!(r.progress_ratio(), None);
        r.set_estimated_size(Some(40));
        assert_eq!(r.progress_ratio(), Some(0.25));
    }
}
