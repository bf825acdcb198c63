use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
        body: String,
    },

    #[error("connection error: {reason}")]
    Connection { reason: String },

    #[error("too many redirects (limit {limit}) starting from {url}")]
    TooManyRedirects { url: String, limit: usize },

    #[error("server ignored the byte range requested for {url}")]
    RangeIgnored { url: String },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("failed to persist `{key}`: {reason}")]
    Persistence { key: String, reason: String },

    #[error("manifest error: {reason}")]
    Manifest { reason: String },

    #[error("playlist error: {reason}")]
    Playlist { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl DownloadError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
        body: impl Into<String>,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
            body: body.into(),
        }
    }

    pub fn connection(reason: impl Into<String>) -> Self {
        Self::Connection {
            reason: reason.into(),
        }
    }

    pub fn persistence(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::Persistence {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    pub fn manifest(reason: impl Into<String>) -> Self {
        Self::Manifest {
            reason: reason.into(),
        }
    }

    pub fn playlist(reason: impl Into<String>) -> Self {
        Self::Playlist {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether another attempt at the same fetch could succeed.
    ///
    /// Every non-success HTTP status counts as transient here; the retry policy
    /// decides how many attempts it is worth.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled => false,
            Self::InvalidUrl { .. }
            | Self::TooManyRedirects { .. }
            | Self::RangeIgnored { .. }
            | Self::Persistence { .. }
            | Self::Manifest { .. }
            | Self::Playlist { .. }
            | Self::Configuration { .. }
            | Self::Internal { .. } => false,
            Self::Network { .. }
            | Self::HttpStatus { .. }
            | Self::Connection { .. }
            | Self::Io { .. } => true,
        }
    }
}

impl From<serde_json::Error> for DownloadError {
    fn from(err: serde_json::Error) -> Self {
        DownloadError::manifest(err.to_string())
    }
}
