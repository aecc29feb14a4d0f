//! HLS playlist parsing into resolved segment descriptors.

use std::time::Duration;

use m3u8_rs::{MasterPlaylist, MediaPlaylist, Playlist};
use tracing::{trace, warn};
use url::Url;

use crate::config::VariantPolicy;
use crate::error::FerryError;

/// Sub-range of a media resource, with the offset always known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub length: u64,
    pub offset: u64,
}

impl ByteRange {
    /// Value for an HTTP `Range` header.
    pub fn header_value(&self) -> String {
        let last = self.offset.saturating_add(self.length.saturating_sub(1));
        format!("bytes={}-{last}", self.offset)
    }
}

/// One fetchable unit of the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentDescriptor {
    /// Absolute segment URL.
    pub uri: Url,
    pub duration: Duration,
    pub byte_range: Option<ByteRange>,
    /// Deduplication key: the URL, plus `|br=len@offset` for ranged segments.
    pub identity: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaManifest {
    pub segments: Vec<SegmentDescriptor>,
    /// The origin marked the playlist complete (`#EXT-X-ENDLIST`).
    pub complete: bool,
    pub target_duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    pub uri: Url,
    pub bandwidth: u64,
    pub audio_only: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedManifest {
    Media(MediaManifest),
    Master(Vec<Variant>),
}

/// Parse a playlist body fetched from `base`.
pub fn parse_manifest(body: &[u8], base: &Url) -> Result<ParsedManifest, FerryError> {
    match m3u8_rs::parse_playlist_res(body) {
        Ok(Playlist::MediaPlaylist(playlist)) => Ok(ParsedManifest::Media(media(&playlist, base))),
        Ok(Playlist::MasterPlaylist(playlist)) => Ok(ParsedManifest::Master(variants(&playlist, base))),
        Err(e) => Err(FerryError::protocol(
            "manifest parse",
            format!("failed to parse playlist {base}: {e}"),
        )),
    }
}

/// Pick the variant to follow from a master playlist.
pub fn select_variant(variants: &[Variant], policy: VariantPolicy) -> Option<&Variant> {
    match policy {
        VariantPolicy::HighestBandwidth => variants.iter().max_by_key(|v| v.bandwidth),
        VariantPolicy::LowestBandwidth => variants.iter().min_by_key(|v| v.bandwidth),
        VariantPolicy::AudioOnly => variants.iter().find(|v| v.audio_only),
    }
}

fn variants(playlist: &MasterPlaylist, base: &Url) -> Vec<Variant> {
    playlist
        .variants
        .iter()
        .filter(|v| !v.is_i_frame)
        .filter_map(|v| match base.join(&v.uri) {
            Ok(uri) => Some(Variant {
                uri,
                bandwidth: v.bandwidth,
                audio_only: v.resolution.is_none()
                    && v.video.is_none()
                    && v.codecs.as_deref().is_some_and(is_audio_only_codecs),
            }),
            Err(e) => {
                warn!(uri = %v.uri, error = %e, "Skipping variant with unresolvable URI");
                None
            }
        })
        .collect()
}

fn is_audio_only_codecs(codecs: &str) -> bool {
    const AUDIO: [&str; 5] = ["mp4a", "ac-3", "ec-3", "opus", "flac"];
    codecs
        .split(',')
        .map(str::trim)
        .all(|codec| AUDIO.iter().any(|prefix| codec.starts_with(prefix)))
}

fn media(playlist: &MediaPlaylist, base: &Url) -> MediaManifest {
    let mut segments = Vec::with_capacity(playlist.segments.len());
    let mut last_uri: Option<&str> = None;
    let mut last_range: Option<(&str, u64)> = None;

    for (idx, segment) in playlist.segments.iter().enumerate() {
        let msn = playlist.media_sequence + idx as u64;

        // A ranged segment may omit its URI and reuse the previous one.
        let uri = if segment.uri.trim().is_empty() {
            match (segment.byte_range.is_some(), last_uri) {
                (true, Some(previous)) => previous,
                _ => {
                    warn!(msn, "Skipping segment with empty URI");
                    continue;
                }
            }
        } else {
            segment.uri.as_str()
        };
        last_uri = Some(uri);

        let byte_range = match segment.byte_range.as_ref() {
            Some(range) => {
                let offset = range.offset.or_else(|| {
                    last_range.and_then(|(prev_uri, end)| (prev_uri == uri).then_some(end))
                });
                let Some(offset) = offset else {
                    warn!(
                        msn,
                        uri,
                        "Skipping segment with BYTERANGE missing offset and no prior range to infer from"
                    );
                    last_range = None;
                    continue;
                };
                let Some(end) = offset.checked_add(range.length) else {
                    warn!(
                        msn,
                        uri,
                        offset,
                        length = range.length,
                        "Skipping segment with BYTERANGE past the addressable end"
                    );
                    last_range = None;
                    continue;
                };
                last_range = Some((uri, end));
                Some(ByteRange {
                    length: range.length,
                    offset,
                })
            }
            None => {
                last_range = None;
                None
            }
        };

        let resolved = match base.join(uri) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(msn, uri, error = %e, "Skipping segment with unresolvable URI");
                continue;
            }
        };
        let identity = match byte_range {
            Some(range) => format!("{resolved}|br={}@{}", range.length, range.offset),
            None => resolved.to_string(),
        };
        trace!(msn, uri = %resolved, "Segment listed");

        segments.push(SegmentDescriptor {
            uri: resolved,
            duration: Duration::try_from_secs_f64(f64::from(segment.duration))
                .unwrap_or(Duration::ZERO),
            byte_range,
            identity,
        });
    }

    MediaManifest {
        segments,
        complete: playlist.end_list,
        target_duration: Duration::try_from_secs_f64(playlist.target_duration as f64)
            .unwrap_or(Duration::ZERO),
    }
}
