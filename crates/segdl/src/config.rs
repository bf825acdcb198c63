use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::DownloadError;
use crate::retry::RetryConfig;

pub const DEFAULT_USER_AGENT: &str = concat!("segdl/", env!("CARGO_PKG_VERSION"));

/// Size of the piece written to disk per streaming iteration.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Configurable options for the downloader
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Overall timeout for a single HTTP request (zero disables it)
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Read timeout (maximum time between receiving data chunks)
    pub read_timeout: Duration,

    /// User agent string
    pub user_agent: String,

    /// Custom HTTP headers sent with every request
    pub headers: HeaderMap,

    /// Redirect hops followed before giving up
    pub max_redirects: usize,

    /// Bytes written per streaming iteration
    pub buffer_size: usize,

    /// Segment tasks allowed to run at the same time
    pub max_concurrent_tasks: usize,

    /// Number of byte ranges a single file is split into (1 disables splitting)
    pub block_count: usize,

    /// Files smaller than twice this size are never split
    pub min_block_size: u64,

    /// Maximum idle connections to keep per host
    pub pool_max_idle_per_host: usize,

    /// Duration to keep idle connections alive before closing
    pub pool_idle_timeout: Duration,

    pub retry: RetryConfig,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(0),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HeaderMap::new(),
            max_redirects: 10,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_concurrent_tasks: 4,
            block_count: 3,
            min_block_size: 1024 * 1024,
            pool_max_idle_per_host: 10,
            pool_idle_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

impl DownloaderConfig {
    pub fn builder() -> DownloaderConfigBuilder {
        DownloaderConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<(), DownloadError> {
        if self.buffer_size == 0 {
            return Err(DownloadError::configuration("buffer_size must be positive"));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(DownloadError::configuration(
                "max_concurrent_tasks must be positive",
            ));
        }
        if self.block_count == 0 {
            return Err(DownloadError::configuration("block_count must be positive"));
        }
        Ok(())
    }
}

/// Chained setters over [`DownloaderConfig`].
#[derive(Debug, Clone, Default)]
pub struct DownloaderConfigBuilder {
    config: DownloaderConfig,
}

impl DownloaderConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.config.headers.insert(name, value);
        self
    }

    pub fn max_redirects(mut self, max_redirects: usize) -> Self {
        self.config.max_redirects = max_redirects;
        self
    }

    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.config.buffer_size = buffer_size;
        self
    }

    pub fn max_concurrent_tasks(mut self, tasks: usize) -> Self {
        self.config.max_concurrent_tasks = tasks;
        self
    }

    pub fn block_count(mut self, count: usize) -> Self {
        self.config.block_count = count;
        self
    }

    pub fn min_block_size(mut self, size: u64) -> Self {
        self.config.min_block_size = size;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.retry.max_retries = max_retries;
        self
    }

    pub fn build(self) -> Result<DownloaderConfig, DownloadError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
