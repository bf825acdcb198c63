use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ACCEPT_ENCODING, HeaderMap, HeaderValue, RANGE};
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, instrument};
use url::Url;

use super::{ConnectRequest, Connection, ConnectionFactory};
use crate::config::DownloaderConfig;
use crate::error::DownloadError;

/// Default connection factory backed by a shared `reqwest::Client`.
///
/// Redirects are not followed by the client; callers follow them explicitly so every hop
/// is observable.
#[derive(Debug, Clone)]
pub struct HttpConnectionFactory {
    client: Client,
}

impl HttpConnectionFactory {
    pub fn new(config: &DownloaderConfig) -> Result<Self, DownloadError> {
        Ok(Self {
            client: create_client(config)?,
        })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// Create a reqwest Client with the provided configuration
pub fn create_client(config: &DownloaderConfig) -> Result<Client, DownloadError> {
    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .pool_idle_timeout(config.pool_idle_timeout)
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .redirect(reqwest::redirect::Policy::none());

    if !config.timeout.is_zero() {
        client_builder = client_builder.timeout(config.timeout);
    }

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    if !config.read_timeout.is_zero() {
        client_builder = client_builder.read_timeout(config.read_timeout);
    }

    client_builder.build().map_err(DownloadError::from)
}

#[async_trait]
impl ConnectionFactory for HttpConnectionFactory {
    #[instrument(skip(self), fields(url = %request.url), level = "trace")]
    async fn connect(
        &self,
        request: &ConnectRequest,
    ) -> Result<Box<dyn Connection>, DownloadError> {
        let mut builder = self.client.get(request.url.clone());
        if let Some(range) = request.range {
            builder = builder.header(RANGE, range.header_value());
        }
        if request.identity_encoding {
            builder = builder.header(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        }

        let response = builder.send().await?;
        debug!(status = %response.status(), "Response headers received");
        Ok(Box::new(HttpConnection::new(request.url.clone(), response)))
    }
}

pub struct HttpConnection {
    url: Url,
    status: StatusCode,
    headers: HeaderMap,
    response: Option<Response>,
}

impl HttpConnection {
    fn new(url: Url, response: Response) -> Self {
        Self {
            url,
            status: response.status(),
            headers: response.headers().clone(),
            response: Some(response),
        }
    }
}

#[async_trait]
impl Connection for HttpConnection {
    fn url(&self) -> &Url {
        &self.url
    }

    fn status(&self) -> StatusCode {
        self.status
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    async fn read_chunk(&mut self) -> Result<Option<Bytes>, DownloadError> {
        match self.response.as_mut() {
            Some(response) => Ok(response.chunk().await?),
            None => Ok(None),
        }
    }

    async fn error_body(&mut self) -> String {
        match self.response.take() {
            Some(response) => response
                .text_with_charset("utf-8")
                .await
                .unwrap_or_default(),
            None => String::new(),
        }
    }
}
