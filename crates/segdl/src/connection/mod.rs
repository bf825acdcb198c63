//! Building HTTP connections from a request descriptor.
//!
//! The engine never talks to `reqwest` directly; tasks go through a [`ConnectionFactory`]
//! so that redirects, ranges and encodings are handled in one place and tests can script
//! server behavior.

mod http;

pub use http::{HttpConnection, HttpConnectionFactory};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, HeaderMap, LOCATION};
use tracing::debug;
use url::Url;

use crate::error::DownloadError;
use crate::manifest::ByteRange;

/// What to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub url: Url,
    /// Absolute range inside the remote object; `None` asks for the whole object.
    pub range: Option<ByteRange>,
    /// Ask for `Accept-Encoding: identity` so `Content-Length` is authoritative.
    pub identity_encoding: bool,
}

impl ConnectRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            range: None,
            identity_encoding: false,
        }
    }

    pub fn with_range(mut self, range: Option<ByteRange>) -> Self {
        self.range = range;
        self
    }

    pub fn identity(mut self) -> Self {
        self.identity_encoding = true;
        self
    }
}

#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Issues the request and returns once response headers are available.
    async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn Connection>, DownloadError>;
}

/// An open response. Dropping it closes the underlying connection.
#[async_trait]
pub trait Connection: Send {
    fn url(&self) -> &Url;

    fn status(&self) -> StatusCode;

    fn headers(&self) -> &HeaderMap;

    /// Next body chunk, `None` at end of body.
    async fn read_chunk(&mut self) -> Result<Option<Bytes>, DownloadError>;

    /// Drains the body as text, decoded with the charset the response declares.
    async fn error_body(&mut self) -> String;

    fn content_length(&self) -> Option<u64> {
        self.headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
    }

    /// Target of a redirect response, resolved against the request URL.
    fn redirect_location(&self) -> Option<Url> {
        if !self.status().is_redirection() {
            return None;
        }
        let location = self.headers().get(LOCATION)?.to_str().ok()?;
        self.url().join(location).ok()
    }
}

/// The server returned a continuation rather than the whole object.
pub fn accepts_partial(connection: &dyn Connection) -> bool {
    connection.status() == StatusCode::PARTIAL_CONTENT
        || connection.headers().contains_key(CONTENT_RANGE)
}

/// Opens `request`, re-issuing it against each redirect target until a non-redirect
/// response arrives.
pub async fn open_following_redirects(
    factory: &dyn ConnectionFactory,
    request: &ConnectRequest,
    max_redirects: usize,
) -> Result<Box<dyn Connection>, DownloadError> {
    let mut current = request.clone();
    let mut hops = 0;
    loop {
        let connection = factory.connect(&current).await?;
        let Some(next) = connection.redirect_location() else {
            return Ok(connection);
        };
        drop(connection);

        hops += 1;
        if hops > max_redirects {
            return Err(DownloadError::TooManyRedirects {
                url: request.url.to_string(),
                limit: max_redirects,
            });
        }
        debug!(from = %current.url, to = %next, hops, "Following redirect");
        current.url = next;
    }
}
