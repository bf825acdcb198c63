use m3u8_rs::{MediaPlaylist, Playlist, parse_playlist_res};
use tracing::{debug, info};
use url::Url;

use crate::connection::{ConnectRequest, ConnectionFactory, open_following_redirects};
use crate::error::DownloadError;

/// Fetches `url` and returns the media playlist it leads to, with the URL it was served
/// from (segment URIs are relative to that).
///
/// A master playlist is resolved to its highest-bandwidth variant; a master pointing to
/// another master is rejected.
pub async fn load_media_playlist(
    connector: &dyn ConnectionFactory,
    url: &Url,
    max_redirects: usize,
) -> Result<(Url, MediaPlaylist), DownloadError> {
    let (base, bytes) = fetch_text(connector, url, max_redirects).await?;
    match parse(&bytes)? {
        Playlist::MediaPlaylist(playlist) => Ok((base, playlist)),
        Playlist::MasterPlaylist(master) => {
            let variant = master
                .variants
                .iter()
                .filter(|v| !v.is_i_frame)
                .max_by_key(|v| v.bandwidth)
                .ok_or_else(|| DownloadError::playlist("master playlist has no variants"))?;
            let variant_url = base
                .join(&variant.uri)
                .map_err(|e| DownloadError::invalid_url(&variant.uri, e.to_string()))?;
            info!(
                bandwidth = variant.bandwidth,
                url = %variant_url,
                "Selected highest-bandwidth variant"
            );

            let (variant_base, bytes) = fetch_text(connector, &variant_url, max_redirects).await?;
            match parse(&bytes)? {
                Playlist::MediaPlaylist(playlist) => Ok((variant_base, playlist)),
                Playlist::MasterPlaylist(_) => Err(DownloadError::playlist(
                    "variant URL points to another master playlist",
                )),
            }
        }
    }
}

fn parse(bytes: &[u8]) -> Result<Playlist, DownloadError> {
    parse_playlist_res(bytes)
        .map_err(|e| DownloadError::playlist(format!("failed to parse playlist: {e}")))
}

async fn fetch_text(
    connector: &dyn ConnectionFactory,
    url: &Url,
    max_redirects: usize,
) -> Result<(Url, Vec<u8>), DownloadError> {
    let mut connection =
        open_following_redirects(connector, &ConnectRequest::new(url.clone()), max_redirects)
            .await?;
    let status = connection.status();
    if !status.is_success() {
        let body = connection.error_body().await;
        return Err(DownloadError::http_status(
            status,
            connection.url().as_str(),
            "playlist",
            body,
        ));
    }

    let mut bytes = Vec::new();
    while let Some(chunk) = connection.read_chunk().await? {
        bytes.extend_from_slice(&chunk);
    }
    debug!(url = %connection.url(), bytes = bytes.len(), "Playlist fetched");
    Ok((connection.url().clone(), bytes))
}
