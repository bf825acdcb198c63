use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::fs;
use tracing::{debug, trace};

use crate::error::DownloadError;
use crate::manifest::{BlockConfig, Manifest};
use crate::request::DownloadRequest;

pub const MANIFEST_KEY: &str = "manifest";
pub const BLOCK_KEY: &str = "block";

/// Durable key/blob storage scoped by session id.
///
/// Writes must be atomic per key: a reader never observes a half-written blob.
#[async_trait]
pub trait ResumeStore: Send + Sync {
    async fn write_blob(&self, session: &str, key: &str, bytes: &[u8])
    -> Result<(), DownloadError>;

    async fn read_blob(&self, session: &str, key: &str) -> Result<Option<Vec<u8>>, DownloadError>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, session: &str, key: &str) -> Result<(), DownloadError>;
}

pub async fn load_manifest(
    store: &dyn ResumeStore,
    session: &str,
) -> Result<Option<Manifest>, DownloadError> {
    match store.read_blob(session, MANIFEST_KEY).await? {
        Some(bytes) => Ok(Some(Manifest::from_bytes(&bytes)?)),
        None => Ok(None),
    }
}

pub async fn save_manifest(
    store: &dyn ResumeStore,
    session: &str,
    manifest: &Manifest,
) -> Result<(), DownloadError> {
    let bytes = manifest.to_bytes()?;
    store.write_blob(session, MANIFEST_KEY, &bytes).await
}

pub async fn load_block_config(
    store: &dyn ResumeStore,
    session: &str,
) -> Result<Option<BlockConfig>, DownloadError> {
    match store.read_blob(session, BLOCK_KEY).await? {
        Some(bytes) => Ok(Some(BlockConfig::from_bytes(&bytes)?)),
        None => Ok(None),
    }
}

pub async fn save_block_config(
    store: &dyn ResumeStore,
    session: &str,
    config: &BlockConfig,
) -> Result<(), DownloadError> {
    let bytes = config.to_bytes()?;
    store.write_blob(session, BLOCK_KEY, &bytes).await
}

/// Removes every blob the engine writes for `session`.
pub async fn purge_session(store: &dyn ResumeStore, session: &str) -> Result<(), DownloadError> {
    store.delete(session, MANIFEST_KEY).await?;
    store.delete(session, BLOCK_KEY).await
}

/// Removes the blobs of `request`'s session and every unit file in its temp directory.
pub async fn purge_download(
    store: &dyn ResumeStore,
    request: &DownloadRequest,
) -> Result<(), DownloadError> {
    purge_session(store, &request.session_id()).await?;
    match fs::remove_dir_all(&request.temp_dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Stores each blob as `<root>/<session>/<key>`.
///
/// A write goes to a sibling temp file first and is renamed over the target, so a crash
/// mid-write leaves the previous blob intact.
#[derive(Debug, Clone)]
pub struct FileResumeStore {
    root: PathBuf,
}

impl FileResumeStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn path(&self, session: &str, key: &str) -> PathBuf {
        self.root.join(session).join(key)
    }
}

#[async_trait]
impl ResumeStore for FileResumeStore {
    async fn write_blob(
        &self,
        session: &str,
        key: &str,
        bytes: &[u8],
    ) -> Result<(), DownloadError> {
        let dir = self.root.join(session);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| DownloadError::persistence(key, e))?;

        let target = dir.join(key);
        let tmp = dir.join(format!("{key}.tmp"));
        fs::write(&tmp, bytes)
            .await
            .map_err(|e| DownloadError::persistence(key, e))?;
        fs::rename(&tmp, &target)
            .await
            .map_err(|e| DownloadError::persistence(key, e))?;

        trace!(path = %target.display(), bytes = bytes.len(), "Blob written");
        Ok(())
    }

    async fn read_blob(&self, session: &str, key: &str) -> Result<Option<Vec<u8>>, DownloadError> {
        match fs::read(self.path(session, key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DownloadError::persistence(key, e)),
        }
    }

    async fn delete(&self, session: &str, key: &str) -> Result<(), DownloadError> {
        match fs::remove_file(self.path(session, key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(DownloadError::persistence(key, e)),
        }
        // Only succeeds once the session directory is empty.
        if fs::remove_dir(self.root.join(session)).await.is_ok() {
            debug!(session, "Removed empty session directory");
        }
        Ok(())
    }
}

/// In-process store, mostly for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryResumeStore {
    blobs: Mutex<HashMap<(String, String), Vec<u8>>>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryResumeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Makes every following write fail with a persistence error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn contains(&self, session: &str, key: &str) -> bool {
        self.blobs
            .lock()
            .contains_key(&(session.to_owned(), key.to_owned()))
    }
}

#[async_trait]
impl ResumeStore for MemoryResumeStore {
    async fn write_blob(
        &self,
        session: &str,
        key: &str,
        bytes: &[u8],
    ) -> Result<(), DownloadError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(DownloadError::persistence(key, "store is read-only"));
        }
        self.blobs
            .lock()
            .insert((session.to_owned(), key.to_owned()), bytes.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_blob(&self, session: &str, key: &str) -> Result<Option<Vec<u8>>, DownloadError> {
        Ok(self
            .blobs
            .lock()
            .get(&(session.to_owned(), key.to_owned()))
            .cloned())
    }

    async fn delete(&self, session: &str, key: &str) -> Result<(), DownloadError> {
        self.blobs
            .lock()
            .remove(&(session.to_owned(), key.to_owned()));
        Ok(())
    }
}
