use tracing::trace;

use super::SegmentDownloadTask;
use crate::connection::ConnectRequest;
use crate::error::DownloadError;
use crate::manifest::Resource;

impl SegmentDownloadTask {
    /// Asks the server for the length of `resource`; 0 when it will not say.
    ///
    /// Compressed responses may omit or misstate `Content-Length`, so a missing value is
    /// asked for a second time with identity encoding.
    pub(super) async fn discover_length(&self, resource: &Resource) -> Result<u64, DownloadError> {
        let request = ConnectRequest::new(resource.url.clone());

        let mut connection = self.open(&request).await?;
        self.coordinator.on_connecting(self.id, connection.headers());
        if !connection.status().is_success() {
            return Err(self.reject(connection.as_mut(), "length discovery").await);
        }
        if let Some(length) = connection.content_length().filter(|len| *len > 0) {
            trace!(length, "Content-Length discovered");
            return Ok(length);
        }
        drop(connection);

        trace!(url = %resource.url, "No usable Content-Length, asking again without compression");
        let mut connection = self.open(&request.identity()).await?;
        self.coordinator.on_connecting(self.id, connection.headers());
        if !connection.status().is_success() {
            return Err(self.reject(connection.as_mut(), "length discovery").await);
        }
        Ok(connection.content_length().unwrap_or(0))
    }
}
