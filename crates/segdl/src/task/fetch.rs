use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace, warn};

use super::{SegmentDownloadTask, resource_path};
use crate::connection::{ConnectRequest, Connection, accepts_partial, open_following_redirects};
use crate::error::DownloadError;
use crate::manifest::{ByteRange, Resource};
use crate::progress::Phase;

impl SegmentDownloadTask {
    /// Opens a connection, following redirects, unless the task is interrupted first.
    pub(super) async fn open(
        &self,
        request: &ConnectRequest,
    ) -> Result<Box<dyn Connection>, DownloadError> {
        tokio::select! {
            biased;
            _ = self.signal.interrupted() => Err(DownloadError::Cancelled),
            result = open_following_redirects(
                self.request.connector.as_ref(),
                request,
                self.request.max_redirects,
            ) => result,
        }
    }

    /// Reports a non-success response and turns it into an error for the retry path.
    pub(super) async fn reject(
        &self,
        connection: &mut dyn Connection,
        operation: &'static str,
    ) -> DownloadError {
        let status = connection.status();
        let url = connection.url().to_string();
        let body = connection.error_body().await;
        warn!(%status, %url, operation, "Request rejected");
        self.coordinator.on_request_error(self.id, status, &body);
        DownloadError::http_status(status, url, operation, body)
    }

    /// Streams `resource` into its file starting at byte `start`.
    ///
    /// `expected` is the full length of the resource, 0 when unknown.
    pub(super) async fn fetch(
        &self,
        phase: Phase,
        resource: &Resource,
        start: u64,
        expected: u64,
    ) -> Result<(), DownloadError> {
        self.signal.check()?;
        let counter = phase.counter();

        let range = match resource.range {
            Some(base) => Some(ByteRange::new(base.start + start, base.end)),
            None if start > 0 => Some(ByteRange::new(start, expected)),
            None => None,
        };
        let request = ConnectRequest::new(resource.url.clone())
            .with_range(range)
            .identity();

        let mut connection = self.open(&request).await?;
        self.coordinator.on_connecting(self.id, connection.headers());
        self.signal.check()?;

        if !connection.status().is_success() {
            return Err(self.reject(connection.as_mut(), phase.as_str()).await);
        }

        let honored = accepts_partial(connection.as_ref());
        if range.is_some() && !honored {
            if resource.range.is_some() {
                return Err(DownloadError::RangeIgnored {
                    url: resource.url.to_string(),
                });
            }
            debug!(%phase, start, "Server ignored range, receiving whole resource");
        }
        if !honored {
            self.progress.set(counter, 0);
        }
        let append = honored && start > 0;

        let path = resource_path(&self.request, resource);
        let mut file = if append {
            OpenOptions::new().append(true).open(&path).await?
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            File::create(&path).await?
        };

        let buffer_size = self.request.buffer_size.max(1);
        let mut written = 0u64;
        loop {
            self.signal.check()?;
            let chunk = tokio::select! {
                biased;
                _ = self.signal.interrupted() => return Err(DownloadError::Cancelled),
                chunk = connection.read_chunk() => chunk?,
            };
            let Some(chunk) = chunk else { break };
            if chunk.is_empty() {
                break;
            }

            for piece in chunk.chunks(buffer_size) {
                self.signal.check()?;
                file.write_all(piece).await?;
                file.flush().await?;

                let n = piece.len() as u64;
                written += n;
                self.progress.add(counter, n);
                self.coordinator.on_progress(self.id, n);
            }
        }

        let on_disk = if append { start + written } else { written };
        if expected > 0 && on_disk < expected {
            return Err(DownloadError::connection(format!(
                "{phase} body ended after {on_disk} of {expected} bytes"
            )));
        }
        if expected > 0 {
            self.progress.set(counter, expected);
        }

        trace!(%phase, written, on_disk, "Phase fetched");
        Ok(())
    }
}
