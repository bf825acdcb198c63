use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use url::Url;

use crate::config::DEFAULT_BUFFER_SIZE;
use crate::connection::ConnectionFactory;
use crate::error::DownloadError;

/// Everything a session needs to know about its target. Shared read-only by every task.
#[derive(Clone)]
pub struct DownloadRequest {
    pub tag: String,
    pub url: Url,
    /// Where the finished file is assembled.
    pub save_path: PathBuf,
    /// Per-unit files live here until `finish`.
    pub temp_dir: PathBuf,
    pub buffer_size: usize,
    pub max_redirects: usize,
    pub connector: Arc<dyn ConnectionFactory>,
}

impl DownloadRequest {
    /// The tag defaults to the URL and the temp directory to `<save_path>.segdl`.
    pub fn new(
        url: &str,
        save_path: impl Into<PathBuf>,
        connector: Arc<dyn ConnectionFactory>,
    ) -> Result<Self, DownloadError> {
        let url = Url::parse(url).map_err(|e| DownloadError::invalid_url(url, e.to_string()))?;
        let save_path = save_path.into();
        let mut temp_name = save_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "download".into());
        temp_name.push(".segdl");
        let temp_dir = save_path.with_file_name(temp_name);

        Ok(Self {
            tag: url.to_string(),
            url,
            save_path,
            temp_dir,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_redirects: 10,
            connector,
        })
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn with_temp_dir(mut self, temp_dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = temp_dir.into();
        self
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    pub fn with_max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    /// Stable identifier of the resume state belonging to this tag.
    pub fn session_id(&self) -> String {
        let digest = Sha256::digest(self.tag.as_bytes());
        hex::encode(&digest[..8])
    }

    pub fn temp_path(&self, file_name: &str) -> PathBuf {
        self.temp_dir.join(file_name)
    }

    pub fn save_path(&self) -> &Path {
        &self.save_path
    }
}

impl fmt::Debug for DownloadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadRequest")
            .field("tag", &self.tag)
            .field("url", &self.url.as_str())
            .field("save_path", &self.save_path)
            .field("temp_dir", &self.temp_dir)
            .field("buffer_size", &self.buffer_size)
            .field("max_redirects", &self.max_redirects)
            .finish_non_exhaustive()
    }
}
