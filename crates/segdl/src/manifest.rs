//! Persisted description of every unit of a download.
//!
//! A [`Manifest`] is built once when a session is first opened (from a single URL, a block
//! split, or a media playlist) and reloaded verbatim on resume. The only field that changes
//! afterwards is a resource's `length`, written at most once when a task discovers it.

use m3u8_rs::{KeyMethod, MediaPlaylist};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::DownloadError;

/// Half-open byte interval `[start, end)` inside a remote resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value of the `Range` request header; the header's end is inclusive.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end.saturating_sub(1))
    }
}

/// One remote object and where it lands on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub url: Url,
    /// Path relative to the session's temp directory.
    pub file_name: String,
    /// Sub-range of `url` holding this resource, for byte-range segments and blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<ByteRange>,
    /// `None` until discovered.
    #[serde(default)]
    pub length: Option<u64>,
}

impl Resource {
    pub fn new(url: Url, file_name: impl Into<String>) -> Self {
        Self {
            url,
            file_name: file_name.into(),
            range: None,
            length: None,
        }
    }

    /// A ranged resource knows its length up front.
    pub fn ranged(url: Url, file_name: impl Into<String>, range: ByteRange) -> Self {
        Self {
            url,
            file_name: file_name.into(),
            range: Some(range),
            length: Some(range.len()),
        }
    }
}

/// Which length of a unit a discovery refers to. Keys are always refetched and never
/// carry a length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LengthSlot {
    InitSegment,
    Payload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Resource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_segment: Option<Resource>,
    pub payload: Resource,
}

impl Unit {
    pub fn resource(&self, slot: LengthSlot) -> Option<&Resource> {
        match slot {
            LengthSlot::InitSegment => self.init_segment.as_ref(),
            LengthSlot::Payload => Some(&self.payload),
        }
    }

    fn resource_mut(&mut self, slot: LengthSlot) -> Option<&mut Resource> {
        match slot {
            LengthSlot::InitSegment => self.init_segment.as_mut(),
            LengthSlot::Payload => Some(&mut self.payload),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestKind {
    SingleFile,
    Blocks,
    Hls,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub source: Url,
    pub kind: ManifestKind,
    pub units: Vec<Unit>,
}

impl Manifest {
    /// One unit covering the whole resource. `length` is the value already known, if any.
    pub fn single_file(source: Url, length: Option<u64>) -> Self {
        let mut payload = Resource::new(source.clone(), "00000.part");
        payload.length = length.filter(|len| *len > 0);
        Self {
            source,
            kind: ManifestKind::SingleFile,
            units: vec![Unit {
                index: 0,
                key: None,
                init_segment: None,
                payload,
            }],
        }
    }

    /// One unit per block of `config`, all fetched from `source`.
    pub fn blocks(source: Url, config: &BlockConfig) -> Self {
        let units = config
            .ranges
            .iter()
            .enumerate()
            .map(|(index, range)| Unit {
                index,
                key: None,
                init_segment: None,
                payload: Resource::ranged(source.clone(), format!("{index:05}.block"), *range),
            })
            .collect();
        Self {
            source,
            kind: ManifestKind::Blocks,
            units,
        }
    }

    /// Builds one unit per media segment.
    ///
    /// `EXT-X-KEY` and `EXT-X-MAP` apply to every following segment until replaced, so both
    /// are carried forward. A `BYTERANGE` without an offset continues where the previous
    /// sub-range of the same URI ended.
    pub fn from_media_playlist(
        playlist_url: &Url,
        playlist: &MediaPlaylist,
    ) -> Result<Self, DownloadError> {
        let resolve = |uri: &str| {
            playlist_url
                .join(uri.trim())
                .map_err(|e| DownloadError::invalid_url(uri, e.to_string()))
        };

        let mut current_key: Option<Url> = None;
        let mut current_map = playlist_level_map(playlist);
        let mut last_range_end: Option<(String, u64)> = None;
        let mut units = Vec::with_capacity(playlist.segments.len());

        for (index, segment) in playlist.segments.iter().enumerate() {
            if let Some(key) = &segment.key {
                current_key = match (&key.method, key.uri.as_deref()) {
                    (KeyMethod::None, _) | (_, None) => None,
                    (_, Some(uri)) => Some(resolve(uri)?),
                };
            }
            if let Some(map) = &segment.map {
                current_map = Some((map.uri.clone(), map.byte_range.clone()));
            }

            if segment.uri.trim().is_empty() {
                return Err(DownloadError::playlist(format!(
                    "segment {index} has an empty URI"
                )));
            }
            let payload_url = resolve(&segment.uri)?;
            let payload_name = format!("{index:05}.ts");

            let payload = match &segment.byte_range {
                Some(range) => {
                    let offset = match range.offset {
                        Some(offset) => offset,
                        None => match &last_range_end {
                            Some((uri, end)) if *uri == segment.uri => *end,
                            _ => {
                                return Err(DownloadError::playlist(format!(
                                    "segment {index} has a BYTERANGE without offset and no \
                                     preceding sub-range of {}",
                                    segment.uri
                                )));
                            }
                        },
                    };
                    let end = offset.saturating_add(range.length);
                    last_range_end = Some((segment.uri.clone(), end));
                    Resource::ranged(payload_url, payload_name, ByteRange::new(offset, end))
                }
                None => {
                    last_range_end = None;
                    Resource::new(payload_url, payload_name)
                }
            };

            let init_segment = match &current_map {
                Some((uri, range)) => {
                    let url = resolve(uri)?;
                    let name = format!("{index:05}.init");
                    Some(match range {
                        Some(range) => {
                            let start = range.offset.unwrap_or(0);
                            Resource::ranged(
                                url,
                                name,
                                ByteRange::new(start, start.saturating_add(range.length)),
                            )
                        }
                        None => Resource::new(url, name),
                    })
                }
                None => None,
            };

            units.push(Unit {
                index,
                key: current_key
                    .clone()
                    .map(|url| Resource::new(url, format!("{index:05}.key"))),
                init_segment,
                payload,
            });
        }

        if units.is_empty() {
            return Err(DownloadError::playlist("media playlist has no segments"));
        }

        Ok(Self {
            source: playlist_url.clone(),
            kind: ManifestKind::Hls,
            units,
        })
    }

    pub fn unit(&self, index: usize) -> Option<&Unit> {
        self.units.get(index)
    }

    pub fn length(&self, index: usize, slot: LengthSlot) -> Option<u64> {
        self.unit(index)
            .and_then(|unit| unit.resource(slot))
            .and_then(|resource| resource.length)
    }

    /// Stores a discovered length and returns the previous value.
    pub(crate) fn set_length(
        &mut self,
        index: usize,
        slot: LengthSlot,
        length: Option<u64>,
    ) -> Result<Option<u64>, DownloadError> {
        let resource = self
            .units
            .get_mut(index)
            .and_then(|unit| unit.resource_mut(slot))
            .ok_or_else(|| {
                DownloadError::manifest(format!("unit {index} has no {slot:?} resource"))
            })?;
        Ok(std::mem::replace(&mut resource.length, length))
    }

    pub fn has_keys(&self) -> bool {
        self.units.iter().any(|unit| unit.key.is_some())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, DownloadError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DownloadError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// m3u8-rs only attaches `EXT-X-MAP` to a segment when it appears among segment tags; a map
/// declared before the first segment ends up in `unknown_tags`.
fn playlist_level_map(playlist: &MediaPlaylist) -> Option<(String, Option<m3u8_rs::ByteRange>)> {
    let rest = playlist
        .unknown_tags
        .iter()
        .rev()
        .find(|t| t.tag == "X-MAP")?
        .rest
        .as_deref()?;

    let mut uri = None;
    let mut byte_range = None;
    for (key, value) in split_attributes(rest) {
        if key.eq_ignore_ascii_case("URI") {
            uri = Some(value.to_owned());
        } else if key.eq_ignore_ascii_case("BYTERANGE") {
            let (length, offset) = value.split_once('@').unwrap_or((value, ""));
            if let Ok(length) = length.trim().parse::<u64>() {
                byte_range = Some(m3u8_rs::ByteRange {
                    length,
                    offset: offset.trim().parse::<u64>().ok(),
                });
            }
        }
    }
    uri.map(|uri| (uri, byte_range))
}

/// Splits `K=V,K="V,V"` attribute lists, keeping quoted commas and stripping the quotes.
fn split_attributes(rest: &str) -> Vec<(&str, &str)> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (idx, ch) in rest.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&rest[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&rest[start..]);

    parts
        .into_iter()
        .filter_map(|part| {
            let (key, value) = part.split_once('=')?;
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            Some((key.trim(), value))
        })
        .collect()
}

/// How a single-file download was split into concurrent byte ranges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockConfig {
    pub count: usize,
    pub ranges: Vec<ByteRange>,
}

impl BlockConfig {
    /// Splits `total` bytes into `count` contiguous ranges; the last one takes the remainder.
    ///
    /// A file shorter than `count` bytes gets one single-byte block per byte, so no range is
    /// ever empty.
    pub fn split(total: u64, count: usize) -> Self {
        let count = (count.max(1) as u64).min(total.max(1)) as usize;
        let size = total / count as u64;
        let ranges = (0..count)
            .map(|i| {
                let start = size * i as u64;
                let end = if i + 1 == count { total } else { start + size };
                ByteRange::new(start, end)
            })
            .collect();
        Self { count, ranges }
    }

    pub fn total(&self) -> u64 {
        self.ranges.last().map(|r| r.end).unwrap_or(0)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, DownloadError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DownloadError> {
        let config: Self = serde_json::from_slice(bytes)?;
        if config.count != config.ranges.len() || config.count == 0 {
            return Err(DownloadError::manifest(format!(
                "block config declares {} blocks but has {} ranges",
                config.count,
                config.ranges.len()
            )));
        }
        if config.total() > 0 && config.ranges.iter().any(ByteRange::is_empty) {
            return Err(DownloadError::manifest("block config has an empty range"));
        }
        Ok(config)
    }
}
