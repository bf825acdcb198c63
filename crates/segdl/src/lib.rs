//! # segdl engine
//!
//! Resumable segmented downloads over HTTP. A download is described by a [`Manifest`] of
//! units: one unit for a plain file, one per byte-range block for a split file, or one per
//! media segment for an HLS playlist. Each unit is fetched by its own
//! [`SegmentDownloadTask`], which resumes from whatever is already on disk.
//!
//! Resume state (the manifest and the block layout) is persisted through a
//! [`ResumeStore`], keyed by the session id derived from the request tag.

pub mod config;
pub mod connection;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod manifest;
pub mod playlist;
pub mod progress;
pub mod request;
pub mod retry;
pub mod runner;
pub mod session;
pub mod store;
pub mod task;

#[cfg(test)]
mod test_support;

/// Re-export key traits and types
pub use config::{DownloaderConfig, DownloaderConfigBuilder};
pub use connection::{ConnectRequest, Connection, ConnectionFactory, HttpConnectionFactory};
pub use coordinator::ManifestCoordinator;
pub use error::DownloadError;
pub use events::{ChannelListener, DownloadEvent, DownloadListener, NoopListener, TaskId};
pub use manifest::{BlockConfig, ByteRange, Manifest, ManifestKind, Resource, Unit};
pub use progress::{Phase, ProgressAccumulator};
pub use request::DownloadRequest;
pub use retry::{BackoffRetry, RetryConfig, RetryPolicy, RetryPolicyFactory};
pub use runner::{CancelSignal, TaskHandle, TaskOutcome, TaskRunner};
pub use session::{DownloadSession, SessionReport};
pub use store::{FileResumeStore, MemoryResumeStore, ResumeStore};
pub use task::{SegmentDownloadTask, TaskState};
