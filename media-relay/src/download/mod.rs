//! Download domain: records, stores, sessions and the service over them.

pub mod artifact;
pub mod metadata;
pub mod progress;
pub mod reaper;
pub mod record;
pub mod registry;
pub mod service;
pub mod session;

pub use artifact::{OpenMode, TempArtifactStore};
pub use metadata::{JsonMetadataStore, MetadataStore};
pub use reaper::{Reaper, ReaperConfig};
pub use record::{DownloadRecord, DownloadStatus, QualitySelector, download_id};
pub use registry::DownloadRegistry;
pub use service::{DownloadService, StartRequest, StatusView};
pub use session::{DownloadSession, DownloadStream, SessionConfig, SessionDeps, SessionState, StartMode};
